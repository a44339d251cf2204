//! Installer vocabulary shared by the resolver, the backends and the executor.
//!
//! Tokens describe *how* the user wants to install, independent of whether that
//! route works right now. Availability is computed separately, per target, on
//! every resolution.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use strum::{Display, EnumIter, EnumString};

/// Persisted sentinel for the system package installer.
pub const PREF_INTERNAL: &str = ":internal:";
/// Persisted sentinel for the root mount installer (legacy, read-only).
pub const PREF_ROOT: &str = ":root:";
/// Persisted sentinel for the privileged IPC broker.
pub const PREF_SHIZUKU: &str = ":shizuku:";
/// Persisted sentinel for "no installer".
pub const PREF_NONE: &str = ":none:";

/// Kind of install operation being performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum InstallTarget {
    /// Fresh install of a freshly patched package
    Patcher,
    /// Reinstalling a previously saved patched package
    SavedApp,
    /// The manager updating itself
    ManagerUpdate,
}

impl InstallTarget {
    /// Whether a root mount overlay is legal for this operation.
    #[inline]
    pub const fn supports_root(self) -> bool {
        matches!(self, Self::Patcher | Self::SavedApp)
    }
}

/// Fully qualified activity of an installer application.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId {
    pub package: String,
    pub class: String,
}

impl ComponentId {
    pub fn new(package: impl Into<String>, class: impl Into<String>) -> Self {
        let package = package.into();
        let class = class.into();
        let class = if class.starts_with('.') {
            format!("{package}{class}")
        } else {
            class
        };
        Self { package, class }
    }

    /// Short class name, used as a label of last resort.
    pub fn simple_class_name(&self) -> &str {
        self.class.rsplit('.').next().unwrap_or(&self.class)
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.class)
    }
}

/// Error returned when a `package/class` string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid component '{0}' (expected package/class)")]
pub struct ComponentParseError(pub String);

impl FromStr for ComponentId {
    type Err = ComponentParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (package, class) = trimmed
            .split_once('/')
            .ok_or_else(|| ComponentParseError(s.to_string()))?;
        let valid = |part: &str| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '$')
        };
        if !valid(package) || !valid(class) || package.starts_with('.') {
            return Err(ComponentParseError(s.to_string()));
        }
        Ok(Self::new(package, class))
    }
}

/// The user's (or system's) choice of installer backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstallToken {
    /// The OS package installer
    Internal,
    /// Root bind-mount overlay
    Root,
    /// Privileged IPC broker
    Shizuku,
    /// Explicitly no installer
    None,
    /// A third-party installer activity
    Component(ComponentId),
}

impl InstallToken {
    /// Parse a persisted preference value.
    ///
    /// Returns `None` for strings that are neither a sentinel nor a valid component.
    pub fn from_pref(value: &str) -> Option<Self> {
        match value.trim() {
            PREF_INTERNAL => Some(Self::Internal),
            PREF_ROOT => Some(Self::Root),
            PREF_SHIZUKU => Some(Self::Shizuku),
            PREF_NONE => Some(Self::None),
            other => other.parse().ok().map(Self::Component),
        }
    }

    /// Persisted form. `Root` collapses onto the internal sentinel because the
    /// mount installer is chosen at run time from the target's capability.
    pub fn to_pref(&self) -> String {
        match self {
            Self::Internal | Self::Root => PREF_INTERNAL.to_string(),
            Self::Shizuku => PREF_SHIZUKU.to_string(),
            Self::None => PREF_NONE.to_string(),
            Self::Component(component) => component.to_string(),
        }
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    pub fn component(&self) -> Option<&ComponentId> {
        match self {
            Self::Component(component) => Some(component),
            _ => None,
        }
    }
}

impl fmt::Display for InstallToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => write!(f, "System installer"),
            Self::Root => write!(f, "Root mount"),
            Self::Shizuku => write!(f, "Shizuku"),
            Self::None => write!(f, "None"),
            Self::Component(component) => write!(f, "{component}"),
        }
    }
}

/// Why a token cannot be used right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum UnavailableReason {
    #[strum(serialize = "Not supported for this operation")]
    TargetUnsupported,
    #[strum(serialize = "Root access not granted")]
    RootNotGranted,
    #[strum(serialize = "Shizuku is not installed")]
    BrokerNotInstalled,
    #[strum(serialize = "Shizuku is not running")]
    BrokerNotRunning,
    #[strum(serialize = "Shizuku permission not granted")]
    BrokerPermissionRequired,
    #[strum(serialize = "Installer cannot handle packages")]
    ComponentUnavailable,
}

/// Availability of a token for one target, computed fresh per resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    pub available: bool,
    pub reason: Option<UnavailableReason>,
}

impl Availability {
    pub const AVAILABLE: Self = Self {
        available: true,
        reason: None,
    };

    pub const fn unavailable(reason: UnavailableReason) -> Self {
        Self {
            available: false,
            reason: Some(reason),
        }
    }
}

/// Icon hint for presenting an installer entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallerIcon {
    System,
    Shizuku,
    /// Use the launcher icon of this package
    App(String),
    Blank,
}

/// Presentation record for one selectable installer. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerEntry {
    pub token: InstallToken,
    pub label: String,
    pub description: Option<String>,
    pub availability: Availability,
    pub icon: InstallerIcon,
}
