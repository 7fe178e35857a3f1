//! Built-in rule table embedded in the library
//!
//! The builtin configuration is the lowest-priority layer. It is parsed on
//! first access and cached in a `LazyLock`.

use super::schema::Config;
use std::sync::LazyLock;

static BUILTIN_CONFIG: LazyLock<Config> = LazyLock::new(load_builtin_config);

/// Get the builtin configuration
pub fn get_builtin() -> &'static Config {
    &BUILTIN_CONFIG
}

fn load_builtin_config() -> Config {
    const BUILTIN_TOML: &str = include_str!("../builtin-rules.toml");
    toml::from_str(BUILTIN_TOML).expect("Failed to parse builtin rule table")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_loads() {
        let config = get_builtin();
        assert!(config.rules.allowed.contains(&"workspace".to_string()));
        assert!(config.audit.log_path.is_none());
    }

    #[test]
    fn test_builtin_cached() {
        let config1 = get_builtin();
        let config2 = get_builtin();
        assert_eq!(config1 as *const _, config2 as *const _);
    }

    #[test]
    fn test_builtin_covers_known_agents() {
        let rules = &get_builtin().rules;
        for agent in [".claude", ".codex", ".gemini", ".aider*"] {
            assert!(
                rules.agent_config_dirs.iter().any(|d| d == agent),
                "{agent} missing from agent_config_dirs"
            );
        }
        assert!(rules.warning.iter().any(|p| p == "**/.git/hooks/*"));
    }
}
