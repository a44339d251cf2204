//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use patchdeploy::error::{InstallError, Result};
use patchdeploy::executor::{ExecutorConfig, InstallExecutor, InstallRequest};
use patchdeploy::install_state::InstallCompletionStatus;
use patchdeploy::intents::{InstallHandler, IntentResolver};
use patchdeploy::ipc::{IpcInstallResult, PrivilegedInstaller};
use patchdeploy::package_manager::{PackageInfo, PackageManager};
use patchdeploy::plan::LaunchDescriptor;
use patchdeploy::remote_fs::{ConnectionListener, FsBinder, RemoteFileSystem, RemoteFsChannel};
use patchdeploy::resolver::{InstallerPreferences, InstallerResolver};
use patchdeploy::root::{ModuleLayout, RootAccess, RootInstaller};
use patchdeploy::shell::{Shell, ShellOutput};
use patchdeploy::types::{Availability, ComponentId, InstallTarget, UnavailableReason};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PACKAGE: &str = "com.example.app";
pub const STOCK_PATH: &str = "/data/app/~~abc/com.example.app-1/base.apk";

/// Single-quoted arguments of a command built with `shell::quote`.
fn quoted_args(command: &str) -> Vec<String> {
    command
        .split('\'')
        .skip(1)
        .step_by(2)
        .map(String::from)
        .collect()
}

// =============================================================================
// Shell
// =============================================================================

/// Simulates the root shell: `id`, `pm path`, mount probes and bind mounts.
#[derive(Default)]
pub struct FakeShell {
    pub root: AtomicBool,
    pub stock_paths: Mutex<HashMap<String, String>>,
    pub mounts: Mutex<HashSet<String>>,
    pub commands: Mutex<Vec<String>>,
    pub fail_on: Mutex<Vec<String>>,
    pub id_probes: AtomicUsize,
}

impl FakeShell {
    pub fn rooted() -> Arc<Self> {
        let shell = Self::default();
        shell.root.store(true, Ordering::SeqCst);
        shell
            .stock_paths
            .lock()
            .unwrap()
            .insert(PACKAGE.to_string(), STOCK_PATH.to_string());
        Arc::new(shell)
    }

    pub fn unrooted() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_on(&self, fragment: &str) {
        self.fail_on.lock().unwrap().push(fragment.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn is_mounted(&self, path: &str) -> bool {
        self.mounts.lock().unwrap().contains(path)
    }
}

impl Shell for FakeShell {
    fn run(&self, command: &str) -> Result<ShellOutput> {
        self.commands.lock().unwrap().push(command.to_string());

        if self
            .fail_on
            .lock()
            .unwrap()
            .iter()
            .any(|fragment| command.contains(fragment.as_str()))
        {
            return Ok(ShellOutput::failure(1, "simulated failure"));
        }

        let root = self.root.load(Ordering::SeqCst);
        if command == "id" {
            self.id_probes.fetch_add(1, Ordering::SeqCst);
            return Ok(if root {
                ShellOutput::success("uid=0(root) gid=0(root) context=u:r:su:s0\n")
            } else {
                ShellOutput::failure(1, "Permission denied")
            });
        }
        if command == "id -u" {
            return Ok(ShellOutput::success(if root { "0\n" } else { "2000\n" }));
        }
        if command.starts_with("pm path ") {
            let package = quoted_args(command).pop().unwrap_or_default();
            return Ok(match self.stock_paths.lock().unwrap().get(&package) {
                Some(path) => ShellOutput::success(format!("package:{path}\n")),
                None => ShellOutput::failure(1, ""),
            });
        }
        if command.starts_with("mount | grep ") {
            let path = quoted_args(command).pop().unwrap_or_default();
            return Ok(if self.is_mounted(&path) {
                ShellOutput::success(format!("/dev/block/dm-7 on {path} type ext4 (ro,seclabel)\n"))
            } else {
                ShellOutput {
                    code: 1,
                    ..ShellOutput::default()
                }
            });
        }
        if command.starts_with("mount -o bind ") {
            if let Some(target) = quoted_args(command).pop() {
                self.mounts.lock().unwrap().insert(target);
            }
            return Ok(ShellOutput::success(""));
        }
        if command.starts_with("umount -l ") {
            if let Some(target) = quoted_args(command).pop() {
                self.mounts.lock().unwrap().remove(&target);
            }
            return Ok(ShellOutput::success(""));
        }
        Ok(ShellOutput::success(""))
    }
}

// =============================================================================
// Remote filesystem
// =============================================================================

#[derive(Default)]
pub struct MemFs {
    pub dirs: Mutex<BTreeSet<PathBuf>>,
    pub files: Mutex<BTreeMap<PathBuf, String>>,
    pub refuse_delete: AtomicBool,
}

impl MemFs {
    pub fn file(&self, path: &Path) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn has_dir(&self, path: &Path) -> bool {
        self.dirs.lock().unwrap().contains(path)
    }
}

impl RemoteFileSystem for MemFs {
    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.has_dir(path) || self.files.lock().unwrap().contains_key(path))
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let mut dirs = self.dirs.lock().unwrap();
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() || ancestor == Path::new("/") {
                break;
            }
            dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    fn write(&self, path: &Path, contents: &str) -> Result<()> {
        let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
        if !self.has_dir(&parent) {
            return Err(InstallError::backend_with("Failed to write file", "no such directory"));
        }
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    fn copy_from(&self, local: &Path, remote: &Path) -> Result<()> {
        let bytes = std::fs::read(local)?;
        self.write(remote, &String::from_utf8_lossy(&bytes))
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        self.file(path)
            .ok_or_else(|| InstallError::backend_with("Failed to read file", path.display().to_string()))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let dirs = self.dirs.lock().unwrap();
        let files = self.files.lock().unwrap();
        let names: BTreeSet<String> = dirs
            .iter()
            .chain(files.keys())
            .filter(|p| p.parent() == Some(path))
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        Ok(names.into_iter().collect())
    }

    fn remove_dir_all(&self, path: &Path) -> Result<bool> {
        if self.refuse_delete.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.dirs.lock().unwrap().retain(|p| !p.starts_with(path));
        self.files.lock().unwrap().retain(|p, _| !p.starts_with(path));
        Ok(true)
    }
}

/// Connects synchronously to a shared `MemFs`.
pub struct InstantBinder {
    pub fs: Arc<MemFs>,
    pub binds: AtomicUsize,
}

impl FsBinder for InstantBinder {
    fn bind(&self, listener: Arc<dyn ConnectionListener>) -> Result<()> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        listener.on_connected(self.fs.clone());
        Ok(())
    }
}

/// Never connects.
pub struct NeverBinder;

impl FsBinder for NeverBinder {
    fn bind(&self, _: Arc<dyn ConnectionListener>) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Package manager
// =============================================================================

#[derive(Default)]
pub struct FakePackageManager {
    pub installed: Mutex<HashMap<String, PackageInfo>>,
    pub archives: Mutex<HashMap<PathBuf, PackageInfo>>,
    pub calls: Mutex<Vec<String>>,
}

impl FakePackageManager {
    pub fn install_existing(&self, package_id: &str, version_code: u64) {
        self.installed.lock().unwrap().insert(
            package_id.to_string(),
            PackageInfo::new(package_id, version_code),
        );
    }

    pub fn register_archive(&self, apk: &Path, package_id: &str, version_code: u64) {
        self.archives
            .lock()
            .unwrap()
            .insert(apk.to_path_buf(), PackageInfo::new(package_id, version_code));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl PackageManager for FakePackageManager {
    fn package_info(&self, package_id: &str) -> Option<PackageInfo> {
        self.installed.lock().unwrap().get(package_id).cloned()
    }

    fn archive_info(&self, apk: &Path) -> Option<PackageInfo> {
        self.archives.lock().unwrap().get(apk).cloned()
    }

    fn install_app(&self, files: &[PathBuf]) -> Result<()> {
        for file in files {
            self.calls
                .lock()
                .unwrap()
                .push(format!("install:{}", file.display()));
        }
        Ok(())
    }

    fn uninstall_package(&self, package_id: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("uninstall:{package_id}"));
        self.installed.lock().unwrap().remove(package_id);
        Ok(())
    }

    fn installed_packages(&self) -> Vec<PackageInfo> {
        self.installed.lock().unwrap().values().cloned().collect()
    }
}

// =============================================================================
// Intents
// =============================================================================

#[derive(Default)]
pub struct FakeIntents {
    pub handlers: Mutex<Vec<InstallHandler>>,
    pub default_handler: Mutex<Option<ComponentId>>,
    pub resolvable: Mutex<HashSet<ComponentId>>,
    pub grants: AtomicUsize,
    pub revokes: AtomicUsize,
    pub launches: Mutex<Vec<LaunchDescriptor>>,
    pub launch_fails: AtomicBool,
    pub grant_fails: AtomicBool,
}

impl FakeIntents {
    /// Register an installed handler that can take install intents.
    pub fn add_handler(&self, component: ComponentId, label: &str, declares_permission: bool) {
        self.resolvable.lock().unwrap().insert(component.clone());
        self.handlers.lock().unwrap().push(InstallHandler {
            component,
            label: label.to_string(),
            declares_install_permission: declares_permission,
        });
    }

    pub fn make_resolvable(&self, component: &ComponentId) {
        self.resolvable.lock().unwrap().insert(component.clone());
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }
}

impl IntentResolver for FakeIntents {
    fn query_install_handlers(&self) -> Vec<InstallHandler> {
        self.handlers.lock().unwrap().clone()
    }

    fn default_install_handler(&self) -> Option<ComponentId> {
        self.default_handler.lock().unwrap().clone()
    }

    fn can_handle_install(&self, component: &ComponentId) -> bool {
        self.resolvable.lock().unwrap().contains(component)
    }

    fn grant_read(&self, path: &Path, _grantee: &str) -> Result<String> {
        if self.grant_fails.load(Ordering::SeqCst) {
            return Err(InstallError::backend("Failed to share APK"));
        }
        self.grants.fetch_add(1, Ordering::SeqCst);
        Ok(format!("content://fake.provider{}", path.display()))
    }

    fn revoke_read(&self, _uri: &str) {
        self.revokes.fetch_add(1, Ordering::SeqCst);
    }

    fn launch(&self, descriptor: &LaunchDescriptor) -> Result<()> {
        if self.launch_fails.load(Ordering::SeqCst) {
            return Err(InstallError::launch_failed(descriptor.component.to_string()));
        }
        self.launches.lock().unwrap().push(descriptor.clone());
        Ok(())
    }
}

// =============================================================================
// Privileged IPC
// =============================================================================

pub struct FakeIpc {
    pub installed: AtomicBool,
    pub ready: AtomicBool,
    pub result: Mutex<IpcInstallResult>,
    pub installs: AtomicUsize,
}

impl Default for FakeIpc {
    fn default() -> Self {
        Self {
            installed: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            result: Mutex::new(IpcInstallResult::success()),
            installs: AtomicUsize::new(0),
        }
    }
}

impl FakeIpc {
    pub fn running() -> Arc<Self> {
        let ipc = Self::default();
        ipc.installed.store(true, Ordering::SeqCst);
        ipc.ready.store(true, Ordering::SeqCst);
        Arc::new(ipc)
    }
}

impl PrivilegedInstaller for FakeIpc {
    fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    fn availability(&self, _target: InstallTarget) -> Availability {
        if self.ready.load(Ordering::SeqCst) {
            Availability::AVAILABLE
        } else {
            Availability::unavailable(UnavailableReason::BrokerNotRunning)
        }
    }

    fn install(&self, _apk: &Path, _expected: &str) -> Result<IpcInstallResult> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.lock().unwrap().clone())
    }

    fn uninstall(&self, _package_id: &str) -> Result<IpcInstallResult> {
        Ok(IpcInstallResult::success())
    }

    fn launch_app(&self) -> bool {
        true
    }
}

/// Fixed root answer for resolver-only tests.
pub struct StaticRoot(pub bool);

impl RootAccess for StaticRoot {
    fn has_root_access(&self) -> bool {
        self.0
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Fully wired core over fakes.
pub struct Harness {
    pub shell: Arc<FakeShell>,
    pub fs: Arc<MemFs>,
    pub pm: Arc<FakePackageManager>,
    pub intents: Arc<FakeIntents>,
    pub ipc: Arc<FakeIpc>,
    pub root: Arc<RootInstaller>,
    pub resolver: Arc<InstallerResolver>,
    pub work_dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(shell: Arc<FakeShell>, ipc: Arc<FakeIpc>) -> Self {
        let work_dir = tempfile::tempdir().expect("tempdir");
        let fs = Arc::new(MemFs::default());
        let pm = Arc::new(FakePackageManager::default());
        let intents = Arc::new(FakeIntents::default());
        let channel = Arc::new(RemoteFsChannel::new(
            Arc::new(InstantBinder {
                fs: fs.clone(),
                binds: AtomicUsize::new(0),
            }),
            Duration::from_secs(1),
        ));
        let root = Arc::new(RootInstaller::new(
            shell.clone(),
            channel,
            pm.clone(),
            ModuleLayout::new("/data/adb/modules", "patched"),
        ));
        let resolver = Arc::new(InstallerResolver::new(
            pm.clone(),
            intents.clone(),
            ipc.clone(),
            root.clone(),
            work_dir.path().join("share"),
        ));
        Self {
            shell,
            fs,
            pm,
            intents,
            ipc,
            root,
            resolver,
            work_dir,
        }
    }

    pub fn rooted() -> Self {
        Self::new(FakeShell::rooted(), Arc::new(FakeIpc::default()))
    }

    pub fn unrooted() -> Self {
        Self::new(FakeShell::unrooted(), Arc::new(FakeIpc::default()))
    }

    pub fn prefer(&self, prefs: InstallerPreferences) {
        self.resolver.set_preferences(prefs);
    }

    pub fn executor(&self, config: ExecutorConfig) -> InstallExecutor {
        InstallExecutor::new(
            self.pm.clone(),
            self.root.clone(),
            self.ipc.clone(),
            self.intents.clone(),
            self.resolver.clone(),
            config,
        )
    }

    /// Write an APK file and register its metadata with the package manager.
    pub fn apk(&self, name: &str, package_id: &str, version_code: u64) -> PathBuf {
        let path = self.work_dir.path().join(name);
        std::fs::write(&path, b"PK\x03\x04patched").expect("write apk");
        self.pm.register_archive(&path, package_id, version_code);
        path
    }

    pub fn request(&self, apk: PathBuf, target: InstallTarget) -> InstallRequest {
        InstallRequest {
            target,
            patched_apk: apk,
            expected_package_id: PACKAGE.to_string(),
            version_name: "2.0.0".to_string(),
            version_code: None,
            label: "Example".to_string(),
            stock_apk: None,
        }
    }

    pub fn shared_files(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.work_dir.path().join("share"))
            .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
            .unwrap_or_default()
    }
}

pub fn short_timeouts() -> ExecutorConfig {
    ExecutorConfig {
        os_installer_timeout: Duration::from_millis(300),
        external_installer_timeout: Duration::from_millis(400),
    }
}

/// Next terminal status from the stream, skipping `InProgress`.
pub fn wait_terminal(rx: &Receiver<InstallCompletionStatus>) -> InstallCompletionStatus {
    loop {
        let status = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("executor should publish a terminal status");
        if status.is_terminal() {
            return status;
        }
    }
}

/// Wait until `rx` yields `InProgress` (the attempt has started).
pub fn wait_in_progress(rx: &Receiver<InstallCompletionStatus>) {
    let status = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("executor should publish InProgress");
    assert_eq!(status, InstallCompletionStatus::InProgress);
}
