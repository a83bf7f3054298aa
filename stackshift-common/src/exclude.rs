//! Archive exclusion patterns
//!
//! Stack data directories often carry build output, caches and VCS metadata
//! that are worthless on the target host. These are skipped when the archive
//! is created. The defaults are an immutable value; callers layer their own
//! patterns on top per migration with [`ExcludeConfig::with_extra`].

use serde::{Deserialize, Serialize};

/// A single glob-style exclusion, passed to `tar --exclude`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExcludePattern {
    /// The pattern string
    pub pattern: String,
    /// Human-readable description
    pub description: String,
    /// Whether this is a built-in default
    pub system_default: bool,
}

impl ExcludePattern {
    /// Create a caller-supplied pattern
    pub fn custom(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            description: "Custom exclusion".to_string(),
            system_default: false,
        }
    }

    fn system(pattern: &str, description: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            description: description.to_string(),
            system_default: true,
        }
    }
}

/// Ordered, deduplicated set of exclusion patterns
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExcludeConfig {
    pub patterns: Vec<ExcludePattern>,
}

impl Default for ExcludeConfig {
    fn default() -> Self {
        Self {
            patterns: Self::default_patterns(),
        }
    }
}

impl ExcludeConfig {
    fn default_patterns() -> Vec<ExcludePattern> {
        vec![
            // Version control
            ExcludePattern::system(".git", "Git metadata"),
            ExcludePattern::system(".gitignore", "Git ignore rules"),
            ExcludePattern::system(".svn", "Subversion metadata"),
            ExcludePattern::system(".hg", "Mercurial metadata"),
            // Dependency and build caches
            ExcludePattern::system("node_modules", "Node.js dependencies"),
            ExcludePattern::system("__pycache__", "Python bytecode cache"),
            ExcludePattern::system("*.pyc", "Compiled Python"),
            ExcludePattern::system("*.pyo", "Optimized Python"),
            ExcludePattern::system(".pytest_cache", "pytest cache"),
            ExcludePattern::system(".mypy_cache", "mypy cache"),
            ExcludePattern::system(".tox", "tox environments"),
            ExcludePattern::system(".venv", "Python virtualenv"),
            ExcludePattern::system(".cache", "Generic cache directory"),
            ExcludePattern::system("target", "Cargo build output"),
            ExcludePattern::system("dist", "Build output"),
            ExcludePattern::system("build", "Build output"),
            // Logs and temporary files
            ExcludePattern::system("*.log", "Log files"),
            ExcludePattern::system("*.tmp", "Temporary files"),
            ExcludePattern::system("*.temp", "Temporary files"),
            // Lockfiles and pid files
            ExcludePattern::system("*.lock", "Lock files"),
            ExcludePattern::system("*.pid", "PID files"),
            // OS artifacts
            ExcludePattern::system(".DS_Store", "macOS folder metadata"),
            ExcludePattern::system("Thumbs.db", "Windows thumbnail cache"),
            // Editor swap files
            ExcludePattern::system("*.swp", "Vim swap files"),
            ExcludePattern::system("*.swo", "Vim swap files"),
            ExcludePattern::system("*~", "Editor backup files"),
        ]
    }

    /// Defaults merged with caller patterns. Duplicates are dropped, the
    /// first occurrence wins.
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut config = Self::default();
        for pattern in extra {
            config.add_pattern(ExcludePattern::custom(pattern.as_ref()));
        }
        config
    }

    /// Add a pattern unless an identical one is already present
    pub fn add_pattern(&mut self, pattern: ExcludePattern) {
        let trimmed = pattern.pattern.trim().to_string();
        if trimmed.is_empty() || self.contains(&trimmed) {
            return;
        }
        self.patterns.push(ExcludePattern {
            pattern: trimmed,
            ..pattern
        });
    }

    pub fn contains(&self, pattern: &str) -> bool {
        self.patterns.iter().any(|p| p.pattern == pattern)
    }

    /// Pattern strings in order
    pub fn pattern_strings(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|p| p.pattern.as_str())
    }
}
