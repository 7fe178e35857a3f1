//! Environment variables the runtime must set inside the sandbox

use indexmap::IndexMap;

/// Builder for environment variables in the sandbox
///
/// Insertion order is preserved so the rendered environment is stable.
#[derive(Debug, Default, Clone)]
pub struct EnvironmentBuilder {
    vars: IndexMap<String, String>,
}

impl EnvironmentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an environment variable
    pub fn set<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) -> &mut Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    /// Append a `git -c`-equivalent setting via GIT_CONFIG_COUNT/KEY_n/VALUE_n
    ///
    /// Settings passed this way count as command-line configuration, which
    /// git honours for protected keys such as `safe.directory`.
    pub fn git_config(&mut self, key: &str, value: &str) -> &mut Self {
        let index = self
            .vars
            .get("GIT_CONFIG_COUNT")
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(0);
        self.set(format!("GIT_CONFIG_KEY_{index}"), key)
            .set(format!("GIT_CONFIG_VALUE_{index}"), value)
            .set("GIT_CONFIG_COUNT", (index + 1).to_string())
    }

    pub fn vars(&self) -> &IndexMap<String, String> {
        &self.vars
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_env() {
        let mut builder = EnvironmentBuilder::new();
        builder.set("FOO", "bar");

        assert_eq!(builder.get("FOO"), Some("bar"));
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut builder = EnvironmentBuilder::new();
        builder.set("ZED", "1").set("ALPHA", "2").set("ZED", "3");

        let keys: Vec<_> = builder.vars().keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["ZED", "ALPHA"]);
        assert_eq!(builder.get("ZED"), Some("3"));
    }

    #[test]
    fn test_git_config_counts() {
        let mut builder = EnvironmentBuilder::new();
        builder
            .git_config("safe.directory", "/workspace")
            .git_config("core.hooksPath", "/dev/null");

        assert_eq!(builder.get("GIT_CONFIG_COUNT"), Some("2"));
        assert_eq!(builder.get("GIT_CONFIG_KEY_0"), Some("safe.directory"));
        assert_eq!(builder.get("GIT_CONFIG_VALUE_0"), Some("/workspace"));
        assert_eq!(builder.get("GIT_CONFIG_KEY_1"), Some("core.hooksPath"));
    }
}
