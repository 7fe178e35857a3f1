//! Configuration system for the scope engine
//!
//! - Config: rule table plus audit and sandbox directory settings
//! - ConfigLoader: layered loading (builtin < user < explicit)

pub mod builtin;
pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{AuditConfig, Config, RuleTable, SandboxDirsConfig};
