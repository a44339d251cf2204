//! Error handling for the installer core
//!
//! One error type covers every failure an install attempt can end in. Resolution-time
//! unavailability is handled by skipping to the next fallback and normally never
//! surfaces; everything from `LaunchFailed` on is terminal for the attempt.

use thiserror::Error;

/// Main error type for install, uninstall and mount operations
#[derive(Error, Debug)]
pub enum InstallError {
    /// Token not usable for this target right now
    #[error("{token} is unavailable: {reason}")]
    Unavailable { token: String, reason: String },

    /// No resolvable activity for an external installer
    #[error("Failed to launch installer {component}")]
    LaunchFailed { component: String },

    /// A shell command or IPC call returned a failure
    #[error("{step}{}", .detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    BackendOperationFailed {
        step: String,
        detail: Option<String>,
    },

    /// No terminal broadcast within the bound
    #[error("timeout")]
    Timeout,

    /// The downgrade guard tripped
    #[error("Installed version {installed} is newer than the patched version {patched}")]
    Conflict { installed: u64, patched: u64 },

    /// Remote filesystem channel never bound in time
    #[error("Root service unavailable")]
    ServiceUnavailable,

    /// Privileged IPC broker reported a non-success status
    #[error("Shizuku installer returned status {status}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Ipc {
        status: i32,
        message: Option<String>,
    },

    /// IO errors (shared copies, module payloads, config files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// State errors (attempt already running, mutex poisoning)
    #[error("State error: {0}")]
    State(String),
}

/// Result type alias for installer operations
pub type Result<T> = std::result::Result<T, InstallError>;

impl InstallError {
    pub fn unavailable(token: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            token: token.into(),
            reason: reason.into(),
        }
    }

    pub fn launch_failed(component: impl Into<String>) -> Self {
        Self::LaunchFailed {
            component: component.into(),
        }
    }

    /// A failed backend step, e.g. `"Failed to mount APK"`.
    pub fn backend(step: impl Into<String>) -> Self {
        Self::BackendOperationFailed {
            step: step.into(),
            detail: None,
        }
    }

    /// A failed backend step with the backend's own explanation attached.
    pub fn backend_with(step: impl Into<String>, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::BackendOperationFailed {
            step: step.into(),
            detail: (!detail.trim().is_empty()).then(|| detail.trim().to_string()),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Step description for backend failures, if this is one.
    pub fn step(&self) -> Option<&str> {
        match self {
            Self::BackendOperationFailed { step, .. } => Some(step),
            _ => None,
        }
    }
}
