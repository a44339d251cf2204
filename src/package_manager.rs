//! Package manager facade
//!
//! The core never talks to the OS package manager except through this trait and
//! through the `PackageEvent` broadcasts it listens for. `ShellPackageManager`
//! implements it on a device shell with `pm` and `dumpsys`.

use crate::error::{InstallError, Result};
use crate::shell::{Shell, quote};
use crate::status::{STATUS_FAILURE, parse_pm_result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::Sender;

/// What the facade knows about an installed package or an APK file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackageInfo {
    pub package_id: String,
    pub version_name: Option<String>,
    pub version_code: u64,
    pub label: Option<String>,
}

impl PackageInfo {
    pub fn new(package_id: impl Into<String>, version_code: u64) -> Self {
        Self {
            package_id: package_id.into(),
            version_code,
            ..Self::default()
        }
    }

    pub fn with_version_name(mut self, version_name: impl Into<String>) -> Self {
        self.version_name = Some(version_name.into());
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Package broadcasts and installer session results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageEvent {
    Added { package_id: String },
    Replaced { package_id: String },
    Removed { package_id: String },
    /// Result of an installer session started by `install_app`
    InstallerStatus {
        package_id: Option<String>,
        status: i32,
        message: Option<String>,
    },
}

pub trait PackageManager: Send + Sync {
    /// Installed package, if any.
    fn package_info(&self, package_id: &str) -> Option<PackageInfo>;

    /// Metadata of an APK file on disk.
    fn archive_info(&self, apk: &Path) -> Option<PackageInfo>;

    /// Start an installer session. Completion is reported as a `PackageEvent`.
    fn install_app(&self, files: &[PathBuf]) -> Result<()>;

    /// Uninstall, blocking until the package manager answers.
    fn uninstall_package(&self, package_id: &str) -> Result<()>;

    /// Every installed package, for installer suggestions.
    fn installed_packages(&self) -> Vec<PackageInfo>;

    fn version_code(&self, info: &PackageInfo) -> u64 {
        info.version_code
    }

    fn label(&self, info: &PackageInfo) -> String {
        info.label.clone().unwrap_or_else(|| info.package_id.clone())
    }

    fn is_installed(&self, package_id: &str) -> bool {
        self.package_info(package_id).is_some()
    }
}

/// `pm`/`dumpsys`/`aapt` backed facade for a device shell.
pub struct ShellPackageManager {
    shell: Arc<dyn Shell>,
    events: Sender<PackageEvent>,
}

impl ShellPackageManager {
    pub fn new(shell: Arc<dyn Shell>, events: Sender<PackageEvent>) -> Self {
        Self { shell, events }
    }
}

/// Parse `dumpsys package <id>` output.
pub fn parse_dumpsys_package(package_id: &str, output: &str) -> Option<PackageInfo> {
    if !output.contains(&format!("Package [{package_id}]")) {
        return None;
    }
    let mut info = PackageInfo::new(package_id, 0);
    for token in output.split_whitespace() {
        if let Some(code) = token.strip_prefix("versionCode=") {
            if info.version_code == 0 {
                info.version_code = code.parse().unwrap_or(0);
            }
        } else if let Some(name) = token.strip_prefix("versionName=") {
            if info.version_name.is_none() {
                info.version_name = Some(name.to_string());
            }
        }
    }
    Some(info)
}

fn badging_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("{key}='");
    let start = line.find(&needle)? + needle.len();
    let end = line[start..].find('\'')?;
    Some(&line[start..start + end])
}

/// Parse `aapt dump badging <apk>` output.
pub fn parse_badging(output: &str) -> Option<PackageInfo> {
    let package_line = output.lines().find(|l| l.starts_with("package:"))?;
    let mut info = PackageInfo::new(
        badging_value(package_line, "name")?,
        badging_value(package_line, "versionCode")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
    );
    info.version_name = badging_value(package_line, "versionName").map(String::from);
    info.label = output
        .lines()
        .find(|l| l.starts_with("application-label:"))
        .and_then(|l| l.split_once(':'))
        .map(|(_, v)| v.trim().trim_matches('\'').to_string());
    Some(info)
}

impl PackageManager for ShellPackageManager {
    fn package_info(&self, package_id: &str) -> Option<PackageInfo> {
        let out = self
            .shell
            .run(&format!("dumpsys package {}", quote(package_id)))
            .ok()?;
        parse_dumpsys_package(package_id, &out.stdout)
    }

    fn archive_info(&self, apk: &Path) -> Option<PackageInfo> {
        let apk = quote(&apk.to_string_lossy());
        ["aapt2", "aapt"].iter().find_map(|tool| {
            let out = self
                .shell
                .run(&format!("{tool} dump badging {apk} 2>/dev/null"))
                .ok()?;
            out.is_success().then(|| parse_badging(&out.stdout)).flatten()
        })
    }

    fn install_app(&self, files: &[PathBuf]) -> Result<()> {
        let first = files
            .first()
            .ok_or_else(|| InstallError::backend("No files to install"))?;
        let package_id = self.archive_info(first).map(|info| info.package_id);
        let paths: Vec<String> = files.iter().map(|f| quote(&f.to_string_lossy())).collect();
        let command = if files.len() == 1 {
            format!("pm install -r {}", paths[0])
        } else {
            format!("pm install-multiple -r {}", paths.join(" "))
        };

        let shell = self.shell.clone();
        let events = self.events.clone();
        std::thread::Builder::new()
            .name("pm-install".into())
            .spawn(move || {
                let event = match shell.run(&command) {
                    Ok(out) => {
                        let combined = format!("{}{}", out.stdout, out.stderr);
                        let (status, reason) = parse_pm_result(&combined);
                        PackageEvent::InstallerStatus {
                            package_id,
                            status: status.code(),
                            message: reason,
                        }
                    }
                    Err(e) => PackageEvent::InstallerStatus {
                        package_id,
                        status: STATUS_FAILURE,
                        message: Some(e.to_string()),
                    },
                };
                if events.send(event).is_err() {
                    log::debug!("Install result dropped, nobody is listening");
                }
            })?;
        Ok(())
    }

    fn uninstall_package(&self, package_id: &str) -> Result<()> {
        let out = self
            .shell
            .run(&format!("pm uninstall {}", quote(package_id)))?;
        if out.is_success() && out.stdout.contains("Success") {
            let _ = self.events.send(PackageEvent::Removed {
                package_id: package_id.to_string(),
            });
            Ok(())
        } else {
            Err(InstallError::backend_with(
                "Failed to uninstall app",
                format!("{}{}", out.stdout, out.stderr),
            ))
        }
    }

    fn installed_packages(&self) -> Vec<PackageInfo> {
        let Ok(out) = self.shell.run("pm list packages --show-versioncode") else {
            return Vec::new();
        };
        out.stdout
            .lines()
            .filter_map(|line| {
                let rest = line.trim().strip_prefix("package:")?;
                let mut parts = rest.split_whitespace();
                let id = parts.next()?;
                let code = parts
                    .find_map(|p| p.strip_prefix("versionCode:"))
                    .and_then(|c| c.parse().ok())
                    .unwrap_or(0);
                Some(PackageInfo::new(id, code))
            })
            .collect()
    }
}
