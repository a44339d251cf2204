//! Remote filesystem channel
//!
//! File operations on paths the manager process cannot touch (`/data/adb/...`)
//! are delegated to a privileged helper. The helper is reached through a binder
//! style connection: `bind` is asynchronous and the helper reports back through
//! `ConnectionListener::on_connected` / `on_disconnected`.
//!
//! `RemoteFsChannel` turns that callback style into a blocking `acquire()`: a
//! single replaceable slot holds the current handle, a condvar wakes waiters when
//! it is filled, and a disconnect empties it so the next caller rebinds.

use crate::error::{InstallError, Result};
use crate::shell::{Shell, quote};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Default bound on waiting for the helper to connect.
pub const DEFAULT_BIND_TIMEOUT: Duration = Duration::from_secs(20);

/// File operations offered by the privileged helper.
pub trait RemoteFileSystem: Send + Sync {
    fn exists(&self, path: &Path) -> Result<bool>;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    fn write(&self, path: &Path, contents: &str) -> Result<()>;
    /// Copy a file readable by the manager into a privileged location.
    fn copy_from(&self, local: &Path, remote: &Path) -> Result<()>;
    fn read_to_string(&self, path: &Path) -> Result<String>;
    /// Names of the entries in a directory; empty if it does not exist.
    fn list_dir(&self, path: &Path) -> Result<Vec<String>>;
    /// Recursively delete; `Ok(false)` if the path still exists afterwards.
    fn remove_dir_all(&self, path: &Path) -> Result<bool>;
}

/// Connection callbacks, invoked from whatever thread the binder uses.
pub trait ConnectionListener: Send + Sync {
    fn on_connected(&self, fs: Arc<dyn RemoteFileSystem>);
    fn on_disconnected(&self);
}

/// Starts (asynchronously) a connection to the privileged helper.
pub trait FsBinder: Send + Sync {
    fn bind(&self, listener: Arc<dyn ConnectionListener>) -> Result<()>;
}

#[derive(Default)]
struct Slot {
    handle: Option<Arc<dyn RemoteFileSystem>>,
    binding: bool,
}

#[derive(Default)]
struct ChannelShared {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl ConnectionListener for ChannelShared {
    fn on_connected(&self, fs: Arc<dyn RemoteFileSystem>) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.handle = Some(fs);
        slot.binding = false;
        log::info!("Root filesystem service connected");
        self.ready.notify_all();
    }

    fn on_disconnected(&self) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        slot.handle = None;
        slot.binding = false;
        log::warn!("Root filesystem service disconnected");
    }
}

/// Lazily bound handle to the privileged filesystem helper.
pub struct RemoteFsChannel {
    binder: Arc<dyn FsBinder>,
    shared: Arc<ChannelShared>,
    bind_timeout: Duration,
}

impl RemoteFsChannel {
    pub fn new(binder: Arc<dyn FsBinder>, bind_timeout: Duration) -> Self {
        Self {
            binder,
            shared: Arc::new(ChannelShared::default()),
            bind_timeout,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .slot
            .lock()
            .map(|slot| slot.handle.is_some())
            .unwrap_or(false)
    }

    /// Listener to hand to code that observes connection changes out of band.
    pub fn listener(&self) -> Arc<dyn ConnectionListener> {
        self.shared.clone()
    }

    /// Current handle, binding first if needed.
    ///
    /// Waits at most the bind timeout, then fails with `ServiceUnavailable`.
    /// Callers must not cache the handle across calls; a disconnect invalidates it.
    pub fn acquire(&self) -> Result<Arc<dyn RemoteFileSystem>> {
        let mut slot = self.shared.slot.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = &slot.handle {
            return Ok(handle.clone());
        }

        if !slot.binding {
            slot.binding = true;
            drop(slot);
            log::debug!("Binding root filesystem service");
            if let Err(e) = self.binder.bind(self.shared.clone()) {
                let mut slot = self.shared.slot.lock().unwrap_or_else(|e| e.into_inner());
                slot.binding = false;
                log::error!("Failed to bind root filesystem service: {}", e);
                return Err(InstallError::ServiceUnavailable);
            }
            slot = self.shared.slot.lock().unwrap_or_else(|e| e.into_inner());
        }

        let deadline = Instant::now() + self.bind_timeout;
        loop {
            if let Some(handle) = &slot.handle {
                return Ok(handle.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                slot.binding = false;
                log::error!(
                    "Root filesystem service did not connect within {:?}",
                    self.bind_timeout
                );
                return Err(InstallError::ServiceUnavailable);
            }
            let (guard, _) = self
                .shared
                .ready
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            slot = guard;
        }
    }
}

/// Filesystem helper backed by a root shell session.
pub struct ShellFs {
    shell: Arc<dyn Shell>,
}

impl ShellFs {
    pub fn new(shell: Arc<dyn Shell>) -> Self {
        Self { shell }
    }

    fn path_str(path: &Path) -> String {
        quote(&path.to_string_lossy())
    }
}

const HEREDOC_DELIMITER: &str = "__PATCHDEPLOY_EOF__";

impl RemoteFileSystem for ShellFs {
    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self
            .shell
            .run(&format!("test -e {}", Self::path_str(path)))?
            .is_success())
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.shell
            .run(&format!("mkdir -p {}", Self::path_str(path)))?
            .ensure_success("Failed to create directory")?;
        Ok(())
    }

    fn write(&self, path: &Path, contents: &str) -> Result<()> {
        if contents.lines().any(|line| line == HEREDOC_DELIMITER) {
            return Err(InstallError::backend("File contents contain the transfer delimiter"));
        }
        let body = contents.strip_suffix('\n').unwrap_or(contents);
        self.shell
            .run(&format!(
                "cat > {} <<'{HEREDOC_DELIMITER}'\n{body}\n{HEREDOC_DELIMITER}",
                Self::path_str(path)
            ))?
            .ensure_success("Failed to write file")?;
        Ok(())
    }

    fn copy_from(&self, local: &Path, remote: &Path) -> Result<()> {
        self.shell
            .run(&format!(
                "cp -f {} {}",
                Self::path_str(local),
                Self::path_str(remote)
            ))?
            .ensure_success("Failed to copy file")?;
        Ok(())
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        let out = self
            .shell
            .run(&format!("cat {}", Self::path_str(path)))?
            .ensure_success("Failed to read file")?;
        Ok(out.stdout)
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let out = self.shell.run(&format!("ls -1 {}", Self::path_str(path)))?;
        if !out.is_success() {
            return Ok(Vec::new());
        }
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    fn remove_dir_all(&self, path: &Path) -> Result<bool> {
        self.shell.run(&format!("rm -rf {}", Self::path_str(path)))?;
        Ok(!self.exists(path)?)
    }
}

/// Binds a `ShellFs` once the shell proves it runs as uid 0.
///
/// The check runs on a background thread, mirroring an asynchronous service bind.
pub struct ShellFsBinder {
    shell: Arc<dyn Shell>,
}

impl ShellFsBinder {
    pub fn new(shell: Arc<dyn Shell>) -> Self {
        Self { shell }
    }
}

impl FsBinder for ShellFsBinder {
    fn bind(&self, listener: Arc<dyn ConnectionListener>) -> Result<()> {
        let shell = self.shell.clone();
        std::thread::Builder::new()
            .name("root-fs-bind".into())
            .spawn(move || match shell.run("id -u") {
                Ok(out) if out.is_success() && out.stdout.trim() == "0" => {
                    listener.on_connected(Arc::new(ShellFs::new(shell)));
                }
                Ok(out) => {
                    log::warn!("Root filesystem service refused: uid {}", out.stdout.trim());
                }
                Err(e) => log::warn!("Root filesystem service failed to start: {}", e),
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::ShellOutput;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullFs;

    impl RemoteFileSystem for NullFs {
        fn exists(&self, _: &Path) -> Result<bool> {
            Ok(false)
        }
        fn create_dir_all(&self, _: &Path) -> Result<()> {
            Ok(())
        }
        fn write(&self, _: &Path, _: &str) -> Result<()> {
            Ok(())
        }
        fn copy_from(&self, _: &Path, _: &Path) -> Result<()> {
            Ok(())
        }
        fn read_to_string(&self, _: &Path) -> Result<String> {
            Ok(String::new())
        }
        fn list_dir(&self, _: &Path) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn remove_dir_all(&self, _: &Path) -> Result<bool> {
            Ok(true)
        }
    }

    /// Connects on a background thread after `delay`, counting binds.
    struct DelayedBinder {
        delay: Duration,
        binds: AtomicUsize,
        connect: bool,
    }

    impl FsBinder for DelayedBinder {
        fn bind(&self, listener: Arc<dyn ConnectionListener>) -> Result<()> {
            self.binds.fetch_add(1, Ordering::SeqCst);
            if self.connect {
                let delay = self.delay;
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    listener.on_connected(Arc::new(NullFs));
                });
            }
            Ok(())
        }
    }

    fn binder(connect: bool) -> Arc<DelayedBinder> {
        Arc::new(DelayedBinder {
            delay: Duration::from_millis(20),
            binds: AtomicUsize::new(0),
            connect,
        })
    }

    #[test]
    fn test_acquire_waits_for_connection() {
        let binder = binder(true);
        let channel = RemoteFsChannel::new(binder.clone(), Duration::from_secs(2));
        assert!(!channel.is_connected());

        channel.acquire().expect("should connect");
        assert!(channel.is_connected());

        channel.acquire().expect("reuses handle");
        assert_eq!(binder.binds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_acquire_times_out_as_service_unavailable() {
        let channel = RemoteFsChannel::new(binder(false), Duration::from_millis(50));
        let start = Instant::now();
        let err = channel.acquire().err().expect("should time out");
        assert!(matches!(err, InstallError::ServiceUnavailable));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_disconnect_forces_rebind() {
        let binder = binder(true);
        let channel = RemoteFsChannel::new(binder.clone(), Duration::from_secs(2));
        channel.acquire().expect("connect");

        channel.listener().on_disconnected();
        assert!(!channel.is_connected());

        channel.acquire().expect("reconnect");
        assert_eq!(binder.binds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_concurrent_acquire_binds_once() {
        let binder = binder(true);
        let channel = Arc::new(RemoteFsChannel::new(binder.clone(), Duration::from_secs(2)));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let channel = channel.clone();
                std::thread::spawn(move || channel.acquire().is_ok())
            })
            .collect();
        for handle in handles {
            assert!(handle.join().expect("thread"));
        }
        assert_eq!(binder.binds.load(Ordering::SeqCst), 1);
    }

    struct RecordingShell(Mutex<Vec<String>>);

    impl Shell for RecordingShell {
        fn run(&self, command: &str) -> Result<ShellOutput> {
            self.0.lock().expect("lock").push(command.to_string());
            if command.starts_with("test -e") {
                return Ok(ShellOutput::failure(1, ""));
            }
            Ok(ShellOutput::success(""))
        }
    }

    #[test]
    fn test_shell_fs_write_uses_quoted_heredoc() {
        let shell = Arc::new(RecordingShell(Mutex::new(Vec::new())));
        let fs = ShellFs::new(shell.clone());
        fs.write(Path::new("/data/adb/modules/x/module.prop"), "id=x\n")
            .expect("write");
        let commands = shell.0.lock().expect("lock");
        assert_eq!(
            commands[0],
            "cat > '/data/adb/modules/x/module.prop' <<'__PATCHDEPLOY_EOF__'\nid=x\n__PATCHDEPLOY_EOF__"
        );
    }

    #[test]
    fn test_shell_fs_remove_reports_deletion() {
        let shell = Arc::new(RecordingShell(Mutex::new(Vec::new())));
        let fs = ShellFs::new(shell.clone());
        assert!(fs.remove_dir_all(Path::new("/data/adb/modules/x")).expect("rm"));
        let commands = shell.0.lock().expect("lock");
        assert_eq!(commands[0], "rm -rf '/data/adb/modules/x'");
    }

    #[test]
    fn test_shell_fs_round_trip_on_real_shell() {
        use crate::shell::ShellSession;

        let dir = tempfile::tempdir().expect("tempdir");
        let shell: Arc<dyn Shell> = Arc::new(ShellSession::new("sh", Duration::from_secs(5)));
        let fs = ShellFs::new(shell);

        let module = dir.path().join("mod");
        fs.create_dir_all(&module).expect("mkdir");
        fs.write(&module.join("service.sh"), "#!/system/bin/sh\necho $1\n")
            .expect("write");
        assert_eq!(
            fs.read_to_string(&module.join("service.sh")).expect("read"),
            "#!/system/bin/sh\necho $1\n"
        );
        assert_eq!(fs.list_dir(&module).expect("ls"), vec!["service.sh".to_string()]);
        assert!(fs.remove_dir_all(&module).expect("rm"));
        assert!(!fs.exists(&module).expect("exists"));
    }
}
