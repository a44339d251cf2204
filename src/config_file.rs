//! Configuration file handling for saving and loading deploy settings.
//!
//! Installer preferences are stored the way a preference store would keep them:
//! two plain token strings and a set of `package/class` strings. Parsing and
//! validating them is this crate's job, not the store's.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::executor::ExecutorConfig;
use crate::resolver::InstallerPreferences;
use crate::root::ModuleLayout;
use crate::types::{ComponentId, InstallToken, PREF_INTERNAL, PREF_NONE};
use crate::worker::MemoryLimit;

/// Deploy configuration that can be saved/loaded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    // Installer preferences
    pub primary_installer: String,
    pub fallback_installer: String,
    pub custom_installers: BTreeSet<String>,

    // Paths
    pub modules_root: PathBuf,
    pub module_suffix: String,
    pub share_dir: PathBuf,

    // Shell & timeouts
    pub shell_command: String,
    pub shell_acquire_timeout_secs: u64,
    pub root_service_timeout_secs: u64,
    pub os_installer_timeout_secs: u64,
    pub external_installer_timeout_secs: u64,

    // Patch worker
    pub memory_limit_mb: u32,
    pub memory_limit_step_mb: u32,
    pub memory_limit_floor_mb: u32,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            primary_installer: PREF_INTERNAL.to_string(),
            fallback_installer: PREF_NONE.to_string(),
            custom_installers: BTreeSet::new(),
            modules_root: PathBuf::from("/data/adb/modules"),
            module_suffix: "patched".to_string(),
            share_dir: PathBuf::from("/data/local/tmp/patchdeploy"),
            shell_command: "su".to_string(),
            shell_acquire_timeout_secs: 10,
            root_service_timeout_secs: 20,
            os_installer_timeout_secs: 60,
            external_installer_timeout_secs: 300,
            memory_limit_mb: 700,
            memory_limit_step_mb: 128,
            memory_limit_floor_mb: 256,
        }
    }
}

impl DeployConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file. Missing fields take their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("Primary installer", &self.primary_installer),
            ("Fallback installer", &self.fallback_installer),
        ] {
            if InstallToken::from_pref(value).is_none() {
                anyhow::bail!("{name} '{value}' is not a valid installer");
            }
        }
        for value in &self.custom_installers {
            value
                .parse::<ComponentId>()
                .context("Invalid custom installer")?;
        }

        if !self.modules_root.is_absolute() {
            anyhow::bail!("Modules root must be an absolute path");
        }
        if self.module_suffix.trim().is_empty() || self.module_suffix.contains('/') {
            anyhow::bail!("Module suffix must be a non-empty name");
        }
        if self.shell_command.trim().is_empty() {
            anyhow::bail!("Shell command must be specified");
        }

        for (name, secs) in [
            ("Shell acquire timeout", self.shell_acquire_timeout_secs),
            ("Root service timeout", self.root_service_timeout_secs),
            ("OS installer timeout", self.os_installer_timeout_secs),
            ("External installer timeout", self.external_installer_timeout_secs),
        ] {
            if secs == 0 {
                anyhow::bail!("{name} must be greater than zero");
            }
        }
        if self.external_installer_timeout_secs <= self.os_installer_timeout_secs {
            anyhow::bail!(
                "External installer timeout ({}s) must be longer than the OS installer timeout ({}s)",
                self.external_installer_timeout_secs,
                self.os_installer_timeout_secs
            );
        }

        if self.memory_limit_floor_mb > self.memory_limit_mb {
            anyhow::bail!(
                "Memory limit floor ({} MB) is above the memory limit ({} MB)",
                self.memory_limit_floor_mb,
                self.memory_limit_mb
            );
        }

        Ok(())
    }

    /// Parsed installer preferences. Malformed values degrade, see `InstallerPreferences`.
    pub fn preferences(&self) -> InstallerPreferences {
        InstallerPreferences::from_persisted(
            &self.primary_installer,
            &self.fallback_installer,
            self.custom_installers.iter().map(String::as_str),
        )
    }

    pub fn set_primary(&mut self, token: &InstallToken) {
        self.primary_installer = token.to_pref();
    }

    pub fn set_fallback(&mut self, token: &InstallToken) {
        self.fallback_installer = token.to_pref();
    }

    /// Returns `false` if it was already present.
    pub fn add_custom_installer(&mut self, component: &ComponentId) -> bool {
        self.custom_installers.insert(component.to_string())
    }

    /// Remove a custom installer. A primary or fallback pointing at it is reset.
    pub fn remove_custom_installer(&mut self, component: &ComponentId) -> bool {
        let removed = self.custom_installers.remove(&component.to_string());
        let token = InstallToken::Component(component.clone());
        if InstallToken::from_pref(&self.primary_installer).as_ref() == Some(&token) {
            self.primary_installer = PREF_INTERNAL.to_string();
        }
        if InstallToken::from_pref(&self.fallback_installer).as_ref() == Some(&token) {
            self.fallback_installer = PREF_NONE.to_string();
        }
        removed
    }

    pub fn module_layout(&self) -> ModuleLayout {
        ModuleLayout::new(&self.modules_root, &self.module_suffix)
    }

    pub fn shell_acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_acquire_timeout_secs)
    }

    pub fn root_service_timeout(&self) -> Duration {
        Duration::from_secs(self.root_service_timeout_secs)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            os_installer_timeout: Duration::from_secs(self.os_installer_timeout_secs),
            external_installer_timeout: Duration::from_secs(self.external_installer_timeout_secs),
        }
    }

    pub fn memory_limit(&self) -> MemoryLimit {
        MemoryLimit::new(
            self.memory_limit_mb,
            self.memory_limit_step_mb,
            self.memory_limit_floor_mb,
        )
    }
}
