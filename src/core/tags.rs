//! Tag-based execution phases.
//!
//! Tags map to a fixed phase table. Plugins without a known tag fall into
//! the default phase, which runs last.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use serde::Serialize;

/// Execution phase derived from plugin tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Cleanup,
    Validation,
    Preparation,
    Compliance,
    Linting,
    Obfuscation,
    Default,
}

static TAG_PHASES: Lazy<HashMap<&'static str, Phase>> = Lazy::new(|| {
    let table: [(Phase, &[&str]); 6] = [
        (Phase::Cleanup, &["clean", "cleanup", "sanitize", "prune", "tidy"]),
        (Phase::Validation, &["validation", "presence", "check", "requirements", "verify"]),
        (
            Phase::Preparation,
            &[
                "prepare",
                "codegen",
                "generate",
                "fetch",
                "resources",
                "download",
                "install",
                "bootstrap",
                "configure",
                "setup",
            ],
        ),
        (
            Phase::Compliance,
            &["license", "header", "normalize", "inject", "spdx", "banner", "copyright", "metadata"],
        ),
        (
            Phase::Linting,
            &[
                "lint",
                "format",
                "typecheck",
                "mypy",
                "flake8",
                "ruff",
                "pep8",
                "black",
                "isort",
                "sort-imports",
                "style",
            ],
        ),
        (Phase::Obfuscation, &["obfuscation", "obfuscate", "transpile", "protect", "encrypt", "minify"]),
    ];

    table.iter().flat_map(|(phase, tags)| tags.iter().map(move |tag| (*tag, *phase))).collect()
});

impl Phase {
    /// Phase of a single tag.
    pub fn from_tag(tag: &str) -> Self {
        let tag = tag.trim().to_lowercase();
        TAG_PHASES.get(tag.as_str()).copied().unwrap_or(Self::Default)
    }

    /// Earliest phase among a plugin's tags.
    pub fn for_tags<S: AsRef<str>>(tags: &[S]) -> Self {
        tags.iter().map(|t| Self::from_tag(t.as_ref())).min().unwrap_or(Self::Default)
    }

    /// Numeric rank used for sorting.
    pub const fn rank(self) -> u32 {
        match self {
            Self::Cleanup => 0,
            Self::Validation => 10,
            Self::Preparation => 20,
            Self::Compliance => 30,
            Self::Linting => 40,
            Self::Obfuscation => 50,
            Self::Default => 100,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Cleanup => "Cleanup",
            Self::Validation => "Validation",
            Self::Preparation => "Preparation",
            Self::Compliance => "Compliance",
            Self::Linting => "Linting",
            Self::Obfuscation => "Obfuscation",
            Self::Default => "Default",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Phase {}: {}", self.rank(), self.name())
    }
}

/// One-line description of where a plugin lands.
///
/// ```
/// use bcasl::core::describe_priority;
///
/// assert_eq!(
///     describe_priority("ruff", &["lint"]),
///     "ruff (lint) -> Phase 40: Linting"
/// );
/// ```
pub fn describe_priority<S: AsRef<str>>(id: &str, tags: &[S]) -> String {
    let phase = Phase::for_tags(tags);
    let tags: Vec<&str> = tags.iter().map(AsRef::as_ref).collect();
    if tags.is_empty() {
        format!("{id} -> {phase}")
    } else {
        format!("{id} ({}) -> {phase}", tags.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_tag() {
        assert_eq!(Phase::from_tag("clean"), Phase::Cleanup);
        assert_eq!(Phase::from_tag("SPDX"), Phase::Compliance);
        assert_eq!(Phase::from_tag("sort-imports"), Phase::Linting);
        assert_eq!(Phase::from_tag("packaging"), Phase::Default);
    }

    #[test]
    fn test_for_tags_takes_earliest() {
        assert_eq!(Phase::for_tags(&["minify", "check"]), Phase::Validation);
        assert_eq!(Phase::for_tags::<&str>(&[]), Phase::Default);
        assert!(Phase::Cleanup < Phase::Validation);
        assert_eq!(Phase::Obfuscation.rank(), 50);
    }

    #[test]
    fn test_describe_without_tags() {
        assert_eq!(describe_priority::<&str>("x", &[]), "x -> Phase 100: Default");
    }
}
