//! OS package installer status codes and their user-facing hints.
//!
//! The numeric codes follow the platform's `PackageInstaller.STATUS_*` constants.
//! Results coming back from `pm` on the command line are mapped onto the same
//! table so that every backend fails with the same vocabulary.

pub const STATUS_PENDING_USER_ACTION: i32 = -1;
pub const STATUS_SUCCESS: i32 = 0;
pub const STATUS_FAILURE: i32 = 1;
pub const STATUS_FAILURE_BLOCKED: i32 = 2;
pub const STATUS_FAILURE_ABORTED: i32 = 3;
pub const STATUS_FAILURE_INVALID: i32 = 4;
pub const STATUS_FAILURE_CONFLICT: i32 = 5;
pub const STATUS_FAILURE_STORAGE: i32 = 6;
pub const STATUS_FAILURE_INCOMPATIBLE: i32 = 7;
pub const STATUS_FAILURE_TIMEOUT: i32 = 8;

/// Decoded installer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallerStatus {
    PendingUserAction,
    Success,
    Failure,
    Blocked,
    Aborted,
    Invalid,
    Conflict,
    Storage,
    Incompatible,
    Timeout,
    Unknown(i32),
}

impl InstallerStatus {
    pub const fn from_code(code: i32) -> Self {
        match code {
            STATUS_PENDING_USER_ACTION => Self::PendingUserAction,
            STATUS_SUCCESS => Self::Success,
            STATUS_FAILURE => Self::Failure,
            STATUS_FAILURE_BLOCKED => Self::Blocked,
            STATUS_FAILURE_ABORTED => Self::Aborted,
            STATUS_FAILURE_INVALID => Self::Invalid,
            STATUS_FAILURE_CONFLICT => Self::Conflict,
            STATUS_FAILURE_STORAGE => Self::Storage,
            STATUS_FAILURE_INCOMPATIBLE => Self::Incompatible,
            STATUS_FAILURE_TIMEOUT => Self::Timeout,
            other => Self::Unknown(other),
        }
    }

    pub const fn code(self) -> i32 {
        match self {
            Self::PendingUserAction => STATUS_PENDING_USER_ACTION,
            Self::Success => STATUS_SUCCESS,
            Self::Failure => STATUS_FAILURE,
            Self::Blocked => STATUS_FAILURE_BLOCKED,
            Self::Aborted => STATUS_FAILURE_ABORTED,
            Self::Invalid => STATUS_FAILURE_INVALID,
            Self::Conflict => STATUS_FAILURE_CONFLICT,
            Self::Storage => STATUS_FAILURE_STORAGE,
            Self::Incompatible => STATUS_FAILURE_INCOMPATIBLE,
            Self::Timeout => STATUS_FAILURE_TIMEOUT,
            Self::Unknown(code) => code,
        }
    }

    #[inline]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }

    /// Everything except pending-user-action ends the attempt.
    #[inline]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::PendingUserAction)
    }

    /// Human-readable hint, `None` for non-failures.
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::PendingUserAction | Self::Success => None,
            Self::Failure | Self::Unknown(_) => Some("The installation failed."),
            Self::Aborted => Some("The installation was cancelled."),
            Self::Blocked => Some("The installation was blocked by the system."),
            Self::Conflict => Some(
                "The app conflicts with an installed version. Uninstall the existing app and try again.",
            ),
            Self::Incompatible => Some("The app is not compatible with this device."),
            Self::Invalid => Some("The APK is invalid or corrupt."),
            Self::Storage => Some("There is not enough storage to install the app."),
            Self::Timeout => Some("The installation timed out."),
        }
    }
}

/// Combine the fixed hint for `status` with any reason supplied by the backend.
///
/// Returns `None` for success and pending-user-action.
pub fn format_failure_hint(status: i32, extra_message: Option<&str>) -> Option<String> {
    let hint = InstallerStatus::from_code(status).hint()?;
    match extra_message.map(str::trim).filter(|m| !m.is_empty()) {
        Some(extra) if extra != hint => Some(format!("{hint} ({extra})")),
        _ => Some(hint.to_string()),
    }
}

/// Map the textual result of `pm install` onto a status code and free-text reason.
///
/// `pm` prints `Success` or `Failure [INSTALL_FAILED_...: detail]`.
pub fn parse_pm_result(output: &str) -> (InstallerStatus, Option<String>) {
    if output.lines().any(|line| line.trim() == "Success") {
        return (InstallerStatus::Success, None);
    }

    let reason = output
        .find('[')
        .and_then(|start| {
            output[start + 1..]
                .find(']')
                .map(|end| output[start + 1..start + 1 + end].trim().to_string())
        })
        .or_else(|| {
            let trimmed = output.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        });

    let code = reason.as_deref().unwrap_or_default();
    let status = if code.starts_with("INSTALL_FAILED_ALREADY_EXISTS")
        || code.starts_with("INSTALL_FAILED_UPDATE_INCOMPATIBLE")
        || code.starts_with("INSTALL_FAILED_VERSION_DOWNGRADE")
        || code.starts_with("INSTALL_FAILED_DUPLICATE_PACKAGE")
        || code.starts_with("INSTALL_FAILED_CONFLICTING_PROVIDER")
        || code.starts_with("INSTALL_FAILED_SHARED_USER_INCOMPATIBLE")
    {
        InstallerStatus::Conflict
    } else if code.starts_with("INSTALL_FAILED_INSUFFICIENT_STORAGE") {
        InstallerStatus::Storage
    } else if code.starts_with("INSTALL_FAILED_INVALID_APK")
        || code.starts_with("INSTALL_PARSE_FAILED")
        || code.starts_with("INSTALL_FAILED_INVALID_URI")
    {
        InstallerStatus::Invalid
    } else if code.starts_with("INSTALL_FAILED_OLDER_SDK")
        || code.starts_with("INSTALL_FAILED_NEWER_SDK")
        || code.starts_with("INSTALL_FAILED_CPU_ABI_INCOMPATIBLE")
        || code.starts_with("INSTALL_FAILED_NO_MATCHING_ABIS")
        || code.starts_with("INSTALL_FAILED_MISSING_FEATURE")
    {
        InstallerStatus::Incompatible
    } else if code.starts_with("INSTALL_FAILED_USER_RESTRICTED")
        || code.starts_with("INSTALL_FAILED_VERIFICATION_FAILURE")
        || code.starts_with("INSTALL_FAILED_VERIFICATION_TIMEOUT")
    {
        InstallerStatus::Blocked
    } else if code.starts_with("INSTALL_FAILED_ABORTED") {
        InstallerStatus::Aborted
    } else {
        InstallerStatus::Failure
    };

    (status, reason)
}
