//! Root mount installer
//!
//! Installs a patched APK without going through the OS package database: the APK
//! is stored in a module directory and bind-mounted over the installed stock
//! APK. Mount state is never stored, it is probed live through the shell.

pub mod grant;
pub mod module;

pub use grant::{ROOT_GRANT_TTL, RootGrantCache};
pub use module::{ModuleInfo, ModuleLayout};

use crate::error::{InstallError, Result};
use crate::package_manager::PackageManager;
use crate::remote_fs::RemoteFsChannel;
use crate::shell::{Shell, ShellOutput, is_dry_run, quote};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Root capability as seen by the resolver.
pub trait RootAccess: Send + Sync {
    fn has_root_access(&self) -> bool;
}

/// One root-mount install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootInstallRequest {
    pub patched_apk: PathBuf,
    /// Unpatched APK to (re)install underneath the overlay.
    pub stock_apk: Option<PathBuf>,
    pub package_id: String,
    pub version: String,
    /// Version code of the patched APK; read from the archive when absent.
    pub version_code: Option<u64>,
    pub label: String,
}

pub struct RootInstaller {
    shell: Arc<dyn Shell>,
    channel: Arc<RemoteFsChannel>,
    pm: Arc<dyn PackageManager>,
    layout: ModuleLayout,
    grant: RootGrantCache,
    package_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RootInstaller {
    pub fn new(
        shell: Arc<dyn Shell>,
        channel: Arc<RemoteFsChannel>,
        pm: Arc<dyn PackageManager>,
        layout: ModuleLayout,
    ) -> Self {
        Self {
            shell,
            channel,
            pm,
            layout,
            grant: RootGrantCache::default(),
            package_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &ModuleLayout {
        &self.layout
    }

    /// Mount and unmount of one package are serialised.
    fn package_lock(&self, package_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.package_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(package_id.to_string()).or_default().clone()
    }

    /// Run a mutating command, turning a non-zero exit into a failure named `step`.
    fn execute(&self, command: &str, step: &str) -> Result<ShellOutput> {
        if is_dry_run() {
            log::info!("[dry-run] {}", command);
            return Ok(ShellOutput::success(""));
        }
        self.shell.run(command)?.ensure_success(step)
    }

    pub fn has_root_access(&self) -> bool {
        if self.shell.granted_hint() == Some(true) {
            return true;
        }
        self.grant.get_or_probe(|| {
            let granted = self
                .shell
                .run("id")
                .map(|out| out.is_success() && out.stdout.contains("uid=0"))
                .unwrap_or(false);
            log::debug!("Root access probe: {}", granted);
            granted
        })
    }

    /// Path of the installed stock APK, from `pm path`.
    pub fn stock_path(&self, package_id: &str) -> Result<Option<String>> {
        let out = self.shell.run(&format!("pm path {}", quote(package_id)))?;
        Ok(out
            .stdout
            .lines()
            .filter_map(|line| line.trim().strip_prefix("package:"))
            .find(|path| path.contains("base"))
            .map(String::from))
    }

    pub fn is_app_installed(&self, package_id: &str) -> Result<bool> {
        self.channel.acquire()?.exists(&self.layout.dir(package_id))
    }

    pub fn is_app_mounted(&self, package_id: &str) -> Result<bool> {
        let Some(stock) = self.stock_path(package_id)? else {
            return Ok(false);
        };
        let out = self.shell.run(&format!("mount | grep {}", quote(&stock)))?;
        Ok(!out.stdout.trim().is_empty())
    }

    /// Bind-mount the module APK over the stock APK. No-op if already mounted.
    pub fn mount(&self, package_id: &str) -> Result<()> {
        let lock = self.package_lock(package_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.mount_locked(package_id)
    }

    fn mount_locked(&self, package_id: &str) -> Result<()> {
        if self.is_app_mounted(package_id)? {
            log::debug!("{} is already mounted", package_id);
            return Ok(());
        }
        let stock = self
            .stock_path(package_id)?
            .ok_or_else(|| InstallError::backend_with("Failed to mount APK", "stock app is not installed"))?;
        let apk = self.layout.apk_path(package_id);

        log::info!("Mounting {} over {}", apk.display(), stock);
        self.execute(
            &format!("mount -o bind {} {}", quote(&apk.to_string_lossy()), quote(&stock)),
            "Failed to mount APK",
        )?;
        self.execute(
            &format!("am force-stop {}", quote(package_id)),
            "Failed to stop app",
        )?;
        Ok(())
    }

    /// Remove the bind mount. No-op if not mounted.
    pub fn unmount(&self, package_id: &str) -> Result<()> {
        let lock = self.package_lock(package_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.unmount_locked(package_id)
    }

    fn unmount_locked(&self, package_id: &str) -> Result<()> {
        if !self.is_app_mounted(package_id)? {
            log::debug!("{} is not mounted", package_id);
            return Ok(());
        }
        let Some(stock) = self.stock_path(package_id)? else {
            return Ok(());
        };
        log::info!("Unmounting {}", stock);
        self.execute(&format!("umount -l {}", quote(&stock)), "Failed to unmount APK")?;
        Ok(())
    }

    /// Write the module bundle for `request`. Does not mount it.
    pub fn install(&self, request: &RootInstallRequest) -> Result<()> {
        let package_id = request.package_id.as_str();
        let lock = self.package_lock(package_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        self.unmount_locked(package_id)?;

        if let Some(stock_apk) = &request.stock_apk {
            self.install_stock(request, stock_apk)?;
        }

        let fs = self.channel.acquire()?;
        let dir = self.layout.dir(package_id);
        let apk = self.layout.apk_path(package_id);
        let script = self.layout.script_path(package_id);
        let prop = self.layout.prop_path(package_id);
        let template = self
            .layout
            .template(package_id, &request.version, &request.label);

        if is_dry_run() {
            log::info!("[dry-run] would write module {}", dir.display());
            return Ok(());
        }

        log::info!("Writing module {}", dir.display());
        fs.create_dir_all(&dir)?;
        fs.write(&script, &template.activation_script())?;
        fs.write(&prop, &template.metadata())?;
        fs.copy_from(&request.patched_apk, &apk)?;

        let apk_arg = quote(&apk.to_string_lossy());
        self.execute(&format!("chmod 644 {apk_arg}"), "Failed to chmod APK")?;
        self.execute(&format!("chown system:system {apk_arg}"), "Failed to chown APK")?;
        self.execute(
            &format!("chcon u:object_r:apk_data_file:s0 {apk_arg}"),
            "Failed to chcon APK",
        )?;
        self.execute(
            &format!("chmod +x {}", quote(&script.to_string_lossy())),
            "Failed to make activation script executable",
        )?;
        Ok(())
    }

    fn install_stock(&self, request: &RootInstallRequest, stock_apk: &Path) -> Result<()> {
        let package_id = request.package_id.as_str();
        let patched_code = request.version_code.or_else(|| {
            self.pm
                .archive_info(&request.patched_apk)
                .map(|info| self.pm.version_code(&info))
        });

        if let (Some(installed), Some(patched)) = (self.pm.package_info(package_id), patched_code) {
            let installed_code = self.pm.version_code(&installed);
            if patched <= installed_code {
                log::info!(
                    "Removing installed {} ({}) before installing stock ({})",
                    package_id,
                    installed_code,
                    patched
                );
                self.execute(
                    &format!("pm uninstall -k --user 0 {}", quote(package_id)),
                    "Failed to uninstall stock app",
                )?;
            }
        }

        self.execute(
            &format!("pm install -r {}", quote(&stock_apk.to_string_lossy())),
            "Failed to install stock app",
        )?;
        Ok(())
    }

    /// Unmount and delete the module bundle.
    pub fn uninstall(&self, package_id: &str) -> Result<()> {
        let lock = self.package_lock(package_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        self.unmount_locked(package_id)?;

        let dir = self.layout.dir(package_id);
        if is_dry_run() {
            log::info!("[dry-run] would delete {}", dir.display());
            return Ok(());
        }
        if !self.channel.acquire()?.remove_dir_all(&dir)? {
            return Err(InstallError::backend_with(
                "Failed to delete module directory",
                dir.display().to_string(),
            ));
        }
        log::info!("Removed module {}", dir.display());
        Ok(())
    }

    /// Every module bundle written by this installer.
    pub fn installed_modules(&self) -> Result<Vec<ModuleInfo>> {
        let fs = self.channel.acquire()?;
        let mut modules = Vec::new();
        for name in fs.list_dir(&self.layout.root)? {
            let Some(package_id) = self.layout.package_of(&name) else {
                continue;
            };
            let dir = self.layout.dir(&package_id);
            match fs.read_to_string(&self.layout.prop_path(&package_id)) {
                Ok(contents) => modules.push(ModuleInfo::from_prop(&package_id, &dir, &contents)),
                Err(e) => log::warn!("Skipping module {}: {}", name, e),
            }
        }
        modules.sort_by(|a, b| a.package_id.cmp(&b.package_id));
        Ok(modules)
    }
}

impl RootAccess for RootInstaller {
    fn has_root_access(&self) -> bool {
        RootInstaller::has_root_access(self)
    }
}
