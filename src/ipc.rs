//! Privileged IPC installer ("Shizuku")
//!
//! A separately installed broker app runs package operations with shell
//! privileges on our behalf. The core only consumes the `PrivilegedInstaller`
//! surface; `RishInstaller` implements it over the broker's `rish` shell bridge.

use crate::error::Result;
use crate::package_manager::PackageManager;
use crate::shell::{Shell, quote};
use crate::status::{STATUS_FAILURE, STATUS_SUCCESS, parse_pm_result};
use crate::types::{Availability, InstallTarget, UnavailableReason};
use std::path::Path;
use std::sync::Arc;

/// Package id of the broker app.
pub const BROKER_PACKAGE: &str = "moe.shizuku.privileged.api";

/// Status and free-text reason of a broker operation, in installer status codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcInstallResult {
    pub status: i32,
    pub message: Option<String>,
}

impl IpcInstallResult {
    pub fn success() -> Self {
        Self {
            status: STATUS_SUCCESS,
            message: None,
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

pub trait PrivilegedInstaller: Send + Sync {
    fn is_installed(&self) -> bool;
    fn availability(&self, target: InstallTarget) -> Availability;
    fn install(&self, apk: &Path, expected_package_id: &str) -> Result<IpcInstallResult>;
    fn uninstall(&self, package_id: &str) -> Result<IpcInstallResult>;
    /// Open the broker app so the user can start it or grant permission.
    fn launch_app(&self) -> bool;
}

/// Broker access through `rish`, the shell bridge Shizuku ships.
pub struct RishInstaller {
    shell: Arc<dyn Shell>,
    pm: Arc<dyn PackageManager>,
    rish: String,
}

impl RishInstaller {
    pub fn new(shell: Arc<dyn Shell>, pm: Arc<dyn PackageManager>) -> Self {
        Self {
            shell,
            pm,
            rish: "rish".to_string(),
        }
    }

    pub fn with_bridge(mut self, rish: impl Into<String>) -> Self {
        self.rish = rish.into();
        self
    }

    fn bridge(&self, command: &str) -> String {
        format!("{} -c {}", self.rish, quote(command))
    }

    fn result_of(&self, command: &str) -> Result<IpcInstallResult> {
        let out = self.shell.run(command)?;
        let combined = format!("{}{}", out.stdout, out.stderr);
        let (status, message) = parse_pm_result(&combined);
        // A non-zero exit without a parsable failure code is still a failure.
        let status = if !out.is_success() && status.is_success() {
            STATUS_FAILURE
        } else {
            status.code()
        };
        Ok(IpcInstallResult { status, message })
    }
}

impl PrivilegedInstaller for RishInstaller {
    fn is_installed(&self) -> bool {
        self.pm.is_installed(BROKER_PACKAGE)
    }

    fn availability(&self, _target: InstallTarget) -> Availability {
        if !self.is_installed() {
            return Availability::unavailable(UnavailableReason::BrokerNotInstalled);
        }
        match self.shell.run(&self.bridge("id -u")) {
            Ok(out) if out.is_success() => Availability::AVAILABLE,
            Ok(out) if out.stderr.contains("permission") || out.stdout.contains("permission") => {
                Availability::unavailable(UnavailableReason::BrokerPermissionRequired)
            }
            _ => Availability::unavailable(UnavailableReason::BrokerNotRunning),
        }
    }

    fn install(&self, apk: &Path, expected_package_id: &str) -> Result<IpcInstallResult> {
        let size = std::fs::metadata(apk)?.len();
        log::info!(
            "Installing {} ({} bytes) through Shizuku",
            expected_package_id,
            size
        );
        let command = format!(
            "cat {} | {}",
            quote(&apk.to_string_lossy()),
            self.bridge(&format!("pm install -r -S {size}"))
        );
        self.result_of(&command)
    }

    fn uninstall(&self, package_id: &str) -> Result<IpcInstallResult> {
        self.result_of(&self.bridge(&format!("pm uninstall {}", quote(package_id))))
    }

    fn launch_app(&self) -> bool {
        self.shell
            .run(&format!(
                "monkey -p {BROKER_PACKAGE} -c android.intent.category.LAUNCHER 1"
            ))
            .map(|out| out.is_success())
            .unwrap_or(false)
    }
}
