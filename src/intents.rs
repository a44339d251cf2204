//! Third-party installer discovery and launch
//!
//! Installer apps are found by resolving an install intent (an APK MIME type on a
//! dummy URI) against the package manager. Launching one means handing it a
//! shared copy of the APK with a read grant; revoking the grant is part of plan
//! cleanup.

use crate::error::{InstallError, Result};
use crate::plan::LaunchDescriptor;
use crate::shell::{Shell, quote};
use crate::types::ComponentId;
use std::path::Path;
use std::sync::Arc;

pub const APK_MIME_TYPE: &str = "application/vnd.android.package-archive";
pub const INSTALL_PERMISSION: &str = "android.permission.REQUEST_INSTALL_PACKAGES";
pub const ACTION_VIEW: &str = "android.intent.action.VIEW";
/// Probe URI used to ask which activities would take an APK.
pub const PROBE_URI: &str = "content://patchdeploy.probe/probe.apk";

/// An activity able to handle package-install requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallHandler {
    pub component: ComponentId,
    pub label: String,
    pub declares_install_permission: bool,
}

pub trait IntentResolver: Send + Sync {
    /// Every activity currently resolving an install intent.
    fn query_install_handlers(&self) -> Vec<InstallHandler>;

    /// The handler the OS would pick on its own, if one is set.
    fn default_install_handler(&self) -> Option<ComponentId>;

    /// Live probe: can this exact component take an install intent right now?
    fn can_handle_install(&self, component: &ComponentId) -> bool;

    /// Give `grantee` read access to `path`, returning the URI to hand over.
    fn grant_read(&self, path: &Path, grantee: &str) -> Result<String>;

    /// Revoke a grant made by `grant_read`. Revoking twice is harmless.
    fn revoke_read(&self, uri: &str);

    /// Start the installer activity. Fails with `LaunchFailed` if nothing resolves.
    fn launch(&self, descriptor: &LaunchDescriptor) -> Result<()>;
}

/// `cmd package` / `am` backed resolver for a device shell.
///
/// Shared APKs live in a world-readable directory, so a "grant" is a file mode
/// change and the URI is a `file://` URI.
pub struct ShellIntentResolver {
    shell: Arc<dyn Shell>,
}

impl ShellIntentResolver {
    pub fn new(shell: Arc<dyn Shell>) -> Self {
        Self { shell }
    }

    fn intent_args(uri: &str) -> String {
        format!(
            "-a {ACTION_VIEW} -d {} -t {APK_MIME_TYPE}",
            quote(uri)
        )
    }

    fn declares_install_permission(&self, package: &str) -> bool {
        self.shell
            .run(&format!("dumpsys package {}", quote(package)))
            .map(|out| out.stdout.contains(INSTALL_PERMISSION))
            .unwrap_or(false)
    }
}

/// Extract `package/class` components from `cmd package query-activities --brief --components`.
pub fn parse_component_lines(output: &str) -> Vec<ComponentId> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| line.contains('/') && !line.contains(' '))
        .filter_map(|line| line.parse().ok())
        .collect()
}

impl IntentResolver for ShellIntentResolver {
    fn query_install_handlers(&self) -> Vec<InstallHandler> {
        let command = format!(
            "cmd package query-activities --brief --components {}",
            Self::intent_args(PROBE_URI)
        );
        let Ok(out) = self.shell.run(&command) else {
            return Vec::new();
        };
        parse_component_lines(&out.stdout)
            .into_iter()
            .map(|component| InstallHandler {
                declares_install_permission: self.declares_install_permission(&component.package),
                label: component.package.clone(),
                component,
            })
            .collect()
    }

    fn default_install_handler(&self) -> Option<ComponentId> {
        let command = format!(
            "cmd package resolve-activity --brief --components {}",
            Self::intent_args(PROBE_URI)
        );
        let out = self.shell.run(&command).ok()?;
        parse_component_lines(&out.stdout).pop()
    }

    fn can_handle_install(&self, component: &ComponentId) -> bool {
        let command = format!(
            "cmd package query-activities --brief --components {} -n {}",
            Self::intent_args(PROBE_URI),
            quote(&component.to_string())
        );
        self.shell
            .run(&command)
            .map(|out| parse_component_lines(&out.stdout).contains(component))
            .unwrap_or(false)
    }

    fn grant_read(&self, path: &Path, grantee: &str) -> Result<String> {
        let quoted = quote(&path.to_string_lossy());
        self.shell
            .run(&format!("chmod 644 {quoted}"))?
            .ensure_success("Failed to share APK")?;
        log::debug!("Granted {} read access to {}", grantee, path.display());
        Ok(format!("file://{}", path.display()))
    }

    fn revoke_read(&self, uri: &str) {
        if let Some(path) = uri.strip_prefix("file://") {
            let _ = self.shell.run(&format!("chmod 600 {} 2>/dev/null", quote(path)));
        }
    }

    fn launch(&self, descriptor: &LaunchDescriptor) -> Result<()> {
        let mut command = format!(
            "am start -a {} -d {} -t {} -n {}",
            descriptor.action,
            quote(&descriptor.data_uri),
            descriptor.mime_type,
            quote(&descriptor.component.to_string())
        );
        if descriptor.grant_read {
            command.push_str(" --grant-read-uri-permission");
        }
        let out = self.shell.run(&command)?;
        let text = format!("{}{}", out.stdout, out.stderr);
        if !out.is_success() || text.contains("Error:") || text.contains("unable to resolve") {
            log::warn!("Launching {} failed: {}", descriptor.component, text.trim());
            return Err(InstallError::launch_failed(descriptor.component.to_string()));
        }
        Ok(())
    }
}
