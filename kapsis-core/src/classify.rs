//! Mount-root-relative path classification
//!
//! Every path an agent may touch is mapped to [`PathClassification`] by a
//! table of segment-anchored patterns. Blocked rules are consulted first,
//! then warning rules, then allowed rules; a path matched by nothing is a
//! warning. Because patterns are anchored at the mount root, `.ssh` under a
//! home root and `.ssh` under `workspace/` are different paths entirely.

use crate::config::{builtin, RuleTable};
use std::fmt;
use std::sync::LazyLock;
use wildmatch::WildMatch;

/// Result of classifying one path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathClassification {
    Allowed,
    Blocked,
    Warning,
}

impl PathClassification {
    /// Evaluation rank: lower ranks are consulted first
    fn rank(self) -> u8 {
        match self {
            PathClassification::Blocked => 0,
            PathClassification::Warning => 1,
            PathClassification::Allowed => 2,
        }
    }
}

impl fmt::Display for PathClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathClassification::Allowed => write!(f, "allowed"),
            PathClassification::Blocked => write!(f, "blocked"),
            PathClassification::Warning => write!(f, "warning"),
        }
    }
}

#[derive(Debug, Clone)]
enum Segment {
    /// `**`: zero or more whole segments
    AnyDepth,
    Glob(WildMatch),
}

/// A segment-anchored pattern matching a subtree
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn new(pattern: &str) -> Self {
        let segments = pattern
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| {
                if s == "**" {
                    Segment::AnyDepth
                } else {
                    Segment::Glob(WildMatch::new(s))
                }
            })
            .collect();

        Self {
            source: pattern.to_string(),
            segments,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// True when `path` is the pattern's subtree root or lies beneath it
    pub fn matches(&self, path: &[&str]) -> bool {
        !self.segments.is_empty() && match_prefix(&self.segments, path)
    }
}

fn match_prefix(pattern: &[Segment], path: &[&str]) -> bool {
    match pattern.split_first() {
        None => true,
        Some((Segment::AnyDepth, rest)) => {
            (0..=path.len()).any(|skip| match_prefix(rest, &path[skip..]))
        }
        Some((Segment::Glob(glob), rest)) => match path.split_first() {
            Some((head, tail)) => glob.matches(head) && match_prefix(rest, tail),
            None => false,
        },
    }
}

/// A pattern plus the classification it yields
#[derive(Debug, Clone)]
pub struct ClassificationRule {
    pub pattern: PathPattern,
    pub classification: PathClassification,
}

impl ClassificationRule {
    pub fn new(pattern: &str, classification: PathClassification) -> Self {
        Self {
            pattern: PathPattern::new(pattern),
            classification,
        }
    }
}

/// Ordered rule set built from a [`RuleTable`]
#[derive(Debug, Clone)]
pub struct PathClassifier {
    rules: Vec<ClassificationRule>,
}

static BUILTIN_CLASSIFIER: LazyLock<PathClassifier> =
    LazyLock::new(|| PathClassifier::from_table(&builtin::get_builtin().rules));

impl PathClassifier {
    /// Expand a rule table into ordered rules
    ///
    /// Home-relative entries are joined onto every home root, so a new agent
    /// only needs its directory name added to `agent_config_dirs`.
    pub fn from_table(table: &RuleTable) -> Self {
        let mut rules = Vec::new();

        for root in &table.home_roots {
            for entry in table.home_blocked_entries() {
                rules.push(ClassificationRule::new(
                    &format!("{root}/{entry}"),
                    PathClassification::Blocked,
                ));
            }
            for cache in &table.allowed_home_caches {
                rules.push(ClassificationRule::new(
                    &format!("{root}/{cache}"),
                    PathClassification::Allowed,
                ));
            }
        }
        for pattern in &table.blocked {
            rules.push(ClassificationRule::new(pattern, PathClassification::Blocked));
        }
        for pattern in &table.warning {
            rules.push(ClassificationRule::new(pattern, PathClassification::Warning));
        }
        for pattern in &table.allowed {
            rules.push(ClassificationRule::new(pattern, PathClassification::Allowed));
        }

        Self::from_rules(rules)
    }

    /// Build from explicit rules; they are stably sorted into evaluation order
    pub fn from_rules(mut rules: Vec<ClassificationRule>) -> Self {
        rules.sort_by_key(|rule| rule.classification.rank());
        Self { rules }
    }

    /// Classifier over the builtin rule table
    pub fn builtin() -> &'static PathClassifier {
        &BUILTIN_CLASSIFIER
    }

    /// The first rule matching `path`, if any
    ///
    /// Returns `None` both for unmatched paths and for paths that escape the
    /// mount root via `..`; use [`classify`](Self::classify) for the verdict.
    pub fn matching_rule(&self, path: &str) -> Option<&ClassificationRule> {
        let segments = normalize(path)?;
        self.rules
            .iter()
            .find(|rule| rule.pattern.matches(&segments))
    }

    pub fn classify(&self, path: &str) -> PathClassification {
        let Some(segments) = normalize(path) else {
            return PathClassification::Blocked;
        };

        self.rules
            .iter()
            .find(|rule| rule.pattern.matches(&segments))
            .map(|rule| rule.classification)
            .unwrap_or(PathClassification::Warning)
    }
}

/// Split a mount-root-relative path into segments
///
/// Leading slashes, empty segments and `.` are dropped. Returns `None` if the
/// path contains `..`.
fn normalize(path: &str) -> Option<Vec<&str>> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return None,
            s => segments.push(s),
        }
    }
    Some(segments)
}

/// Classify a path against the builtin rule table
pub fn classify(path: &str) -> PathClassification {
    PathClassifier::builtin().classify(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use PathClassification::*;

    #[test]
    fn test_workspace_always_allowed() {
        for path in [
            "workspace/src/main.rs",
            "workspace/.ssh/config",
            "workspace/.claude/settings.json",
            "workspace/.aws/credentials",
            "workspace/etc/passwd",
            "workspace/.git/config",
            "/workspace/nested/deep/file",
        ] {
            assert_eq!(classify(path), Allowed, "{path}");
        }
    }

    #[test]
    fn test_tmp_status_and_caches_allowed() {
        for path in [
            "tmp/build.log",
            "kapsis-status/status.json",
            "home/developer/.m2/repository/org/foo.jar",
            "home/developer/.gradle/caches/x.bin",
            "home/developer/.npm/_cacache/index",
            "root/.cargo/registry/cache/crate.tar",
        ] {
            assert_eq!(classify(path), Allowed, "{path}");
        }
    }

    #[test]
    fn test_home_sensitive_entries_blocked() {
        let rules = &builtin::get_builtin().rules;
        for entry in rules.home_blocked_entries() {
            let name = entry.replace('*', "rc");
            let home = format!("home/developer/{name}/nested");
            let workspace = format!("workspace/{name}/nested");
            assert_eq!(classify(&home), Blocked, "{home}");
            assert_eq!(classify(&workspace), Allowed, "{workspace}");
        }
    }

    #[test]
    fn test_home_entry_itself_blocked() {
        assert_eq!(classify("home/alice/.bashrc"), Blocked);
        assert_eq!(classify("home/alice/.claude.json"), Blocked);
        assert_eq!(classify("root/.ssh/authorized_keys"), Blocked);
        assert_eq!(classify("home/alice/.config/gcloud/credentials.db"), Blocked);
    }

    #[test]
    fn test_prefix_not_substring() {
        // Names that merely contain a sensitive name are not blocked by it.
        assert_eq!(classify("home/alice/.ssh-notes"), Warning);
        assert_eq!(classify("home/alice/projects/.ssh/key"), Warning);
        assert_eq!(classify("workspace/home/alice/.ssh/key"), Allowed);
    }

    #[test]
    fn test_git_hooks_warning() {
        assert_eq!(classify("workspace/.git/hooks/pre-commit"), Warning);
        assert_eq!(classify("workspace/sub/module/.git/hooks/post-checkout"), Warning);
        assert_eq!(classify("tmp/repo/.git/hooks/pre-push"), Warning);
        assert_ne!(classify("workspace/.git/config"), Warning);
        assert_ne!(classify("workspace/.git/hooks"), Warning);
    }

    #[test]
    fn test_system_paths_blocked() {
        assert_eq!(classify("etc/passwd"), Blocked);
        assert_eq!(classify("usr/local/bin/git"), Blocked);
        assert_eq!(classify("/etc/cron.d/job"), Blocked);
    }

    #[test]
    fn test_unmatched_is_warning() {
        assert_eq!(classify("home/alice/notes.txt"), Warning);
        assert_eq!(classify("data/file"), Warning);
    }

    #[test]
    fn test_parent_traversal_blocked() {
        assert_eq!(classify("workspace/../etc/passwd"), Blocked);
        assert_eq!(classify("tmp/../../x"), Blocked);
    }

    #[test]
    fn test_blocked_beats_allowed() {
        let classifier = PathClassifier::from_rules(vec![
            ClassificationRule::new("home/*/.cache", Allowed),
            ClassificationRule::new("home/*/.cache/secrets", Blocked),
        ]);
        assert_eq!(classifier.classify("home/a/.cache/secrets/token"), Blocked);
        assert_eq!(classifier.classify("home/a/.cache/pip/wheel"), Allowed);
    }

    #[test]
    fn test_new_agent_is_data_only() {
        let mut table = builtin::get_builtin().rules.clone();
        table.agent_config_dirs.push(".newagent".to_string());
        let classifier = PathClassifier::from_table(&table);

        assert_eq!(classifier.classify("home/dev/.newagent/auth.json"), Blocked);
        assert_eq!(classifier.classify("workspace/.newagent/auth.json"), Allowed);
        assert_eq!(classify("home/dev/.newagent/auth.json"), Warning);
    }

    #[test]
    fn test_matching_rule_reports_pattern() {
        let rule = PathClassifier::builtin()
            .matching_rule("home/dev/.kube/config")
            .unwrap();
        assert_eq!(rule.pattern.as_str(), "home/*/.kube");
        assert_eq!(rule.classification, Blocked);
        assert!(PathClassifier::builtin().matching_rule("data/x").is_none());
    }

    #[test]
    fn test_any_depth_pattern() {
        let pattern = PathPattern::new("**/.git/hooks/*");
        assert!(pattern.matches(&[".git", "hooks", "x"]));
        assert!(pattern.matches(&["a", "b", ".git", "hooks", "x"]));
        assert!(!pattern.matches(&["a", ".git", "hooks"]));
    }
}
