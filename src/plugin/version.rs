//! Version compatibility between plugins and the host.
//!
//! Versions are compared as numeric `MAJOR.MINOR.PATCH` triples. A trailing
//! `+` ("or higher"), a `-prerelease` suffix and `+build` metadata are all
//! ignored. Missing minor/patch components count as zero and components
//! past the patch are ignored.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A parsed version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    /// Create a version from its components.
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    /// Parse a version string, returning `None` when it is malformed.
    ///
    /// ```
    /// use bcasl::plugin::Version;
    ///
    /// assert_eq!(Version::parse("1.2.3-rc1"), Some(Version::new(1, 2, 3)));
    /// assert_eq!(Version::parse("2+"), Some(Version::new(2, 0, 0)));
    /// assert_eq!(Version::parse("v1.0"), None);
    /// ```
    pub fn parse(input: &str) -> Option<Self> {
        let mut s = input.trim();
        if let Some(stripped) = s.strip_suffix('+') {
            s = stripped.trim_end();
        }
        let core = s.split(['+', '-']).next().unwrap_or_default();
        if core.is_empty() {
            return None;
        }

        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        let patch = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };

        Some(Self { major, minor, patch })
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Check whether `available` satisfies the minimum `required` version.
///
/// An empty requirement is always satisfied. Malformed strings on either
/// side fail closed.
pub fn is_compatible(required: &str, available: &str) -> bool {
    if required.trim().is_empty() {
        return true;
    }
    match (Version::parse(required), Version::parse(available)) {
        (Some(req), Some(avail)) => avail >= req,
        _ => false,
    }
}

/// Host components a plugin can place a minimum version on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    /// The plugin loader itself.
    Loader,
    /// The host application core.
    Core,
    /// The plugin SDK.
    Sdk,
    /// The execution-context contract.
    Context,
    /// The general-utilities contract.
    Utilities,
}

impl Component {
    /// All components, in reporting order.
    pub const ALL: [Self; 5] = [Self::Loader, Self::Core, Self::Sdk, Self::Context, Self::Utilities];

    /// Short name used in manifests and diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Loader => "loader",
            Self::Core => "core",
            Self::Sdk => "sdk",
            Self::Context => "context",
            Self::Utilities => "utilities",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Minimum versions a plugin declares for each host component.
///
/// Empty strings mean "no constraint".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VersionRequirements {
    pub loader: String,
    pub core: String,
    pub sdk: String,
    pub context: String,
    pub utilities: String,
}

impl VersionRequirements {
    /// The requirement for one component.
    pub fn get(&self, component: Component) -> &str {
        match component {
            Component::Loader => &self.loader,
            Component::Core => &self.core,
            Component::Sdk => &self.sdk,
            Component::Context => &self.context,
            Component::Utilities => &self.utilities,
        }
    }

    /// Set the requirement for one component.
    #[must_use]
    pub fn with(mut self, component: Component, version: impl Into<String>) -> Self {
        let version = version.into();
        match component {
            Component::Loader => self.loader = version,
            Component::Core => self.core = version,
            Component::Sdk => self.sdk = version,
            Component::Context => self.context = version,
            Component::Utilities => self.utilities = version,
        }
        self
    }

    /// Whether no component carries a requirement.
    pub fn is_unconstrained(&self) -> bool {
        Component::ALL.iter().all(|c| self.get(*c).trim().is_empty())
    }
}

/// Versions of the host components, as seen by plugins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostVersions {
    pub loader: String,
    pub core: String,
    pub sdk: String,
    pub context: String,
    pub utilities: String,
}

impl HostVersions {
    /// Versions of this build.
    pub fn current() -> Self {
        Self {
            loader: env!("CARGO_PKG_VERSION").to_string(),
            core: "1.0.0".to_string(),
            sdk: "1.0.0".to_string(),
            context: "1.0.0".to_string(),
            utilities: "1.0.0".to_string(),
        }
    }

    /// The available version of one component.
    pub fn get(&self, component: Component) -> &str {
        match component {
            Component::Loader => &self.loader,
            Component::Core => &self.core,
            Component::Sdk => &self.sdk,
            Component::Context => &self.context,
            Component::Utilities => &self.utilities,
        }
    }

    /// Check every requirement and return the ones that are not met.
    pub fn unmet(&self, requirements: &VersionRequirements) -> Vec<UnmetRequirement> {
        Component::ALL
            .iter()
            .filter(|c| !is_compatible(requirements.get(**c), self.get(**c)))
            .map(|c| UnmetRequirement {
                component: *c,
                required: requirements.get(*c).to_string(),
                available: self.get(*c).to_string(),
            })
            .collect()
    }
}

impl Default for HostVersions {
    fn default() -> Self {
        Self::current()
    }
}

/// A version requirement the host does not satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmetRequirement {
    pub component: Component,
    pub required: String,
    pub available: String,
}

impl fmt::Display for UnmetRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} >= {} (available: {})", self.component, self.required, self.available)
    }
}
