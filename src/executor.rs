//! Install Plan Executor
//!
//! Runs one `InstallPlan` at a time and publishes its progress as a stream of
//! `InstallCompletionStatus` values.
//!
//! # Completion
//!
//! | Plan | Completes when |
//! |------|----------------|
//! | `RootMount`, `PrivilegedIpc` | the backend call returns |
//! | `Internal` | an installer-status or package-added broadcast arrives, or the OS timeout fires |
//! | `External` | the expected package is added/replaced, or the external timeout fires |
//!
//! Backends run on a worker thread per attempt. Timeouts are one thread each,
//! cancelled by dropping their sender. Every completion is checked against the
//! id of the pending attempt, so a late broadcast or timer for an attempt that
//! already ended is ignored.

use crate::error::{InstallError, Result};
use crate::install_state::{InstallCompletionStatus, InstallState, InstallStateMachine};
use crate::intents::IntentResolver;
use crate::ipc::PrivilegedInstaller;
use crate::package_manager::{PackageEvent, PackageManager};
use crate::plan::{ExternalPlan, InstallPlan};
use crate::resolver::InstallerResolver;
use crate::root::{RootInstallRequest, RootInstaller};
use crate::status::{InstallerStatus, format_failure_hint};
use crate::types::InstallTarget;
use crate::worker::{MemoryLimit, PatchWorkerOutcome, RetryDecision};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

/// Identifies one install/uninstall attempt.
pub type AttemptId = u64;

const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub os_installer_timeout: Duration,
    /// Must be longer than the OS timeout; a human is driving a foreign app.
    pub external_installer_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            os_installer_timeout: Duration::from_secs(60),
            external_installer_timeout: Duration::from_secs(300),
        }
    }
}

/// What to install, independent of the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallRequest {
    pub target: InstallTarget,
    pub patched_apk: PathBuf,
    pub expected_package_id: String,
    pub version_name: String,
    /// Version code of the patched APK, when the caller already knows it.
    pub version_code: Option<u64>,
    pub label: String,
    pub stock_apk: Option<PathBuf>,
}

/// What the caller should do with a finished patch job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchFollowUp {
    Install(PathBuf),
    RetryPatch { memory_limit_mb: u32 },
    Failed {
        message: String,
        missing_patch: Option<String>,
    },
}

enum PendingKind {
    Internal,
    External(ExternalPlan),
    Synchronous,
}

struct PendingAttempt {
    id: AttemptId,
    package_id: String,
    kind: PendingKind,
    // Dropping the sender cancels the timeout thread.
    timeout: Option<Sender<()>>,
}

#[derive(Default)]
struct ExecutorState {
    machine: InstallStateMachine,
    pending: Option<PendingAttempt>,
}

enum Started {
    Completed(Option<String>),
    AwaitingBroadcast,
}

struct Inner {
    pm: Arc<dyn PackageManager>,
    root: Arc<RootInstaller>,
    ipc: Arc<dyn PrivilegedInstaller>,
    intents: Arc<dyn IntentResolver>,
    resolver: Arc<InstallerResolver>,
    config: ExecutorConfig,
    state: Mutex<ExecutorState>,
    subscribers: Mutex<Vec<Sender<InstallCompletionStatus>>>,
    next_attempt: AtomicU64,
    shutdown: AtomicBool,
}

pub struct InstallExecutor {
    inner: Arc<Inner>,
}

impl InstallExecutor {
    pub fn new(
        pm: Arc<dyn PackageManager>,
        root: Arc<RootInstaller>,
        ipc: Arc<dyn PrivilegedInstaller>,
        intents: Arc<dyn IntentResolver>,
        resolver: Arc<InstallerResolver>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                pm,
                root,
                ipc,
                intents,
                resolver,
                config,
                state: Mutex::new(ExecutorState::default()),
                subscribers: Mutex::new(Vec::new()),
                next_attempt: AtomicU64::new(1),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Status stream. Every subscriber sees every status published after it subscribed.
    pub fn subscribe(&self) -> Receiver<InstallCompletionStatus> {
        let (tx, rx) = mpsc::channel();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn state(&self) -> InstallState {
        self.inner.lock_state().machine.current().clone()
    }

    /// Feed package broadcasts from `events` until the executor is dropped.
    pub fn attach_events(&self, events: Receiver<PackageEvent>) -> Result<()> {
        let weak = Arc::downgrade(&self.inner);
        std::thread::Builder::new()
            .name("package-events".into())
            .spawn(move || listen(weak, events))?;
        Ok(())
    }

    /// Handle one package broadcast.
    pub fn handle_event(&self, event: PackageEvent) {
        self.inner.handle_event(event);
    }

    /// Execute `plan` for `request`.
    ///
    /// # Errors
    ///
    /// - `State` if another attempt is in progress (an external plan is cleaned up)
    pub fn install(&self, plan: InstallPlan, request: InstallRequest) -> Result<AttemptId> {
        self.start(plan, request, false)
    }

    /// Uninstall the current app first, then install without the downgrade guard.
    pub fn reinstall(&self, plan: InstallPlan, request: InstallRequest) -> Result<AttemptId> {
        self.start(plan, request, true)
    }

    fn start(&self, plan: InstallPlan, request: InstallRequest, reinstall: bool) -> Result<AttemptId> {
        let kind = match &plan {
            InstallPlan::Internal(_) => PendingKind::Internal,
            InstallPlan::External(external) => PendingKind::External(external.clone()),
            InstallPlan::RootMount(_) | InstallPlan::PrivilegedIpc(_) => PendingKind::Synchronous,
        };
        if let Some(external) = plan.as_external() {
            external.resource.mark_started();
        }
        let id = match self.inner.begin(&request.expected_package_id, kind) {
            Ok(id) => id,
            Err(e) => {
                if let Some(external) = plan.as_external() {
                    self.inner.resolver.cleanup(external);
                }
                return Err(e);
            }
        };
        log::info!(
            "Installing {} via {} (attempt {})",
            request.expected_package_id,
            plan.describe(),
            id
        );

        self.inner.spawn_attempt(id, move |inner| {
            if reinstall {
                inner.remove_existing(&plan, &request)?;
            } else {
                inner.check_downgrade(&request)?;
            }
            inner.run_install(id, &plan, &request)
        });
        Ok(id)
    }

    /// Remove `package_id`, through the root installer when it owns a module for it.
    pub fn uninstall(&self, package_id: &str) -> Result<AttemptId> {
        let id = self.inner.begin(package_id, PendingKind::Synchronous)?;
        let package_id = package_id.to_string();
        self.inner.spawn_attempt(id, move |inner| {
            let root_owned = inner.root.has_root_access()
                && inner.root.is_app_installed(&package_id).unwrap_or(false);
            if root_owned {
                inner.root.uninstall(&package_id)?;
            } else {
                inner.pm.uninstall_package(&package_id)?;
            }
            Ok(Started::Completed(Some(package_id)))
        });
        Ok(id)
    }

    /// Stop waiting for the pending OS or external installer.
    ///
    /// The installer itself keeps running; its late broadcast is ignored.
    pub fn cancel(&self) -> bool {
        let id = {
            let state = self.inner.lock_state();
            match &state.pending {
                Some(p) if !matches!(p.kind, PendingKind::Synchronous) => p.id,
                _ => return false,
            }
        };
        self.inner.finish(
            id,
            InstallCompletionStatus::Failure {
                message: "cancelled".to_string(),
            },
        )
    }

    /// Turn a patch worker result into the next step of the patch→install flow.
    ///
    /// Out-of-memory is the only failure answered with a retry, with `limit`
    /// lowered by one step.
    pub fn handle_patch_outcome(outcome: PatchWorkerOutcome, limit: &mut MemoryLimit) -> PatchFollowUp {
        match outcome {
            PatchWorkerOutcome::Success { patched_apk, .. } => PatchFollowUp::Install(patched_apk),
            PatchWorkerOutcome::Failed {
                message,
                missing_patch,
            } => PatchFollowUp::Failed {
                message,
                missing_patch,
            },
            PatchWorkerOutcome::OutOfMemory => match RetryDecision::after_out_of_memory(limit) {
                RetryDecision::RetryWithMemoryLimit(memory_limit_mb) => {
                    PatchFollowUp::RetryPatch { memory_limit_mb }
                }
                RetryDecision::GiveUp => PatchFollowUp::Failed {
                    message: format!(
                        "The patcher ran out of memory with the minimum limit of {} MB",
                        limit.current_mb
                    ),
                    missing_patch: None,
                },
            },
        }
    }
}

impl Drop for InstallExecutor {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        let pending = self.inner.lock_state().pending.take();
        if let Some(pending) = pending {
            log::debug!("Dropping pending attempt {}", pending.id);
            drop(pending.timeout);
            if let PendingKind::External(plan) = pending.kind {
                self.inner.resolver.cleanup(&plan);
            }
        }
    }
}

fn listen(weak: Weak<Inner>, events: Receiver<PackageEvent>) {
    loop {
        match events.recv_timeout(EVENT_POLL_INTERVAL) {
            Ok(event) => match weak.upgrade() {
                Some(inner) if !inner.shutdown.load(Ordering::SeqCst) => inner.handle_event(event),
                _ => break,
            },
            Err(RecvTimeoutError::Timeout) => {
                let alive = weak
                    .upgrade()
                    .is_some_and(|inner| !inner.shutdown.load(Ordering::SeqCst));
                if !alive {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    log::debug!("Package event listener stopped");
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, ExecutorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, status: InstallCompletionStatus) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(status.clone()).is_ok());
    }

    fn begin(&self, package_id: &str, kind: PendingKind) -> Result<AttemptId> {
        let id = self.next_attempt.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.lock_state();
            state.machine.begin()?;
            state.pending = Some(PendingAttempt {
                id,
                package_id: package_id.to_string(),
                kind,
                timeout: None,
            });
        }
        self.publish(InstallCompletionStatus::InProgress);
        Ok(id)
    }

    /// Run `work` on its own thread and turn whatever it ends in into a
    /// terminal state, panics included.
    fn spawn_attempt<F>(self: &Arc<Self>, id: AttemptId, work: F)
    where
        F: FnOnce(&Arc<Inner>) -> Result<Started> + Send + 'static,
    {
        let inner = self.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("install-{id}"))
            .spawn(move || {
                let outcome = catch_unwind(AssertUnwindSafe(|| work(&inner)))
                    .unwrap_or_else(|_| Err(InstallError::backend("Unexpected installer failure")));
                match outcome {
                    Ok(Started::Completed(package_id)) => {
                        inner.finish(id, InstallCompletionStatus::Success { package_id });
                    }
                    Ok(Started::AwaitingBroadcast) => {}
                    Err(e) => {
                        log::error!("Install attempt {} failed: {}", id, e);
                        inner.finish(
                            id,
                            InstallCompletionStatus::Failure {
                                message: failure_message(&e),
                            },
                        );
                    }
                }
            });
        if let Err(e) = spawned {
            self.finish(
                id,
                InstallCompletionStatus::Failure {
                    message: InstallError::backend_with("Failed to start install", e.to_string())
                        .to_string(),
                },
            );
        }
    }

    /// Move attempt `id` to a terminal state. Returns `false` for stale ids.
    fn finish(&self, id: AttemptId, status: InstallCompletionStatus) -> bool {
        let pending = {
            let mut state = self.lock_state();
            if state.pending.as_ref().map(|p| p.id) != Some(id) {
                log::debug!("Ignoring completion of stale attempt {}", id);
                return false;
            }
            let transition = match &status {
                InstallCompletionStatus::Success { package_id } => {
                    state.machine.succeed(package_id.clone())
                }
                InstallCompletionStatus::Failure { message } => state.machine.fail(message.clone()),
                InstallCompletionStatus::InProgress => return false,
            };
            if let Err(e) = transition {
                log::error!("Attempt {}: {}", id, e);
            }
            state.pending.take()
        };

        if let Some(pending) = pending {
            drop(pending.timeout);
            if let PendingKind::External(plan) = pending.kind {
                self.resolver.cleanup(&plan);
            }
        }
        log::info!("Attempt {} finished: {:?}", id, status);
        self.publish(status);
        true
    }

    fn arm_timeout(self: &Arc<Self>, id: AttemptId, bound: Duration) {
        let (tx, rx) = mpsc::channel::<()>();
        {
            let mut state = self.lock_state();
            match state.pending.as_mut() {
                Some(pending) if pending.id == id => pending.timeout = Some(tx),
                // Already finished by an early broadcast.
                _ => return,
            }
        }

        let weak = Arc::downgrade(self);
        let spawned = std::thread::Builder::new()
            .name(format!("install-timeout-{id}"))
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(bound) {
                    if let Some(inner) = weak.upgrade() {
                        log::warn!("Attempt {} timed out after {:?}", id, bound);
                        inner.finish(
                            id,
                            InstallCompletionStatus::Failure {
                                message: InstallError::Timeout.to_string(),
                            },
                        );
                    }
                }
            });
        if let Err(e) = spawned {
            log::error!("Failed to arm timeout for attempt {}: {}", id, e);
        }
    }

    fn handle_event(&self, event: PackageEvent) {
        let decision = {
            let state = self.lock_state();
            let Some(pending) = state.pending.as_ref() else {
                return;
            };
            let awaiting_broadcast = matches!(
                pending.kind,
                PendingKind::Internal | PendingKind::External(_)
            );
            match &event {
                PackageEvent::Added { package_id } | PackageEvent::Replaced { package_id }
                    if awaiting_broadcast && *package_id == pending.package_id =>
                {
                    Some((
                        pending.id,
                        InstallCompletionStatus::Success {
                            package_id: Some(package_id.clone()),
                        },
                    ))
                }
                PackageEvent::InstallerStatus {
                    package_id,
                    status,
                    message,
                } if matches!(pending.kind, PendingKind::Internal)
                    && package_id.as_ref().is_none_or(|p| *p == pending.package_id) =>
                {
                    let status_kind = InstallerStatus::from_code(*status);
                    let outcome = if status_kind.is_success() {
                        InstallCompletionStatus::Success {
                            package_id: Some(pending.package_id.clone()),
                        }
                    } else if !status_kind.is_terminal() {
                        InstallCompletionStatus::InProgress
                    } else {
                        InstallCompletionStatus::Failure {
                            message: format_failure_hint(*status, message.as_deref())
                                .unwrap_or_else(|| "The installation failed.".to_string()),
                        }
                    };
                    Some((pending.id, outcome))
                }
                _ => None,
            }
        };

        match decision {
            Some((_, InstallCompletionStatus::InProgress)) => {
                log::info!("Waiting for the user to confirm the installation");
                self.publish(InstallCompletionStatus::InProgress);
            }
            Some((id, status)) => {
                self.finish(id, status);
            }
            None => log::debug!("Ignoring package event {:?}", event),
        }
    }

    /// Abort with `Conflict` if the installed version is newer than the patched one.
    ///
    /// Fails when the patched version is unknown and the package is installed.
    fn check_downgrade(&self, request: &InstallRequest) -> Result<()> {
        let Some(installed) = self.pm.package_info(&request.expected_package_id) else {
            return Ok(());
        };
        let patched = request.version_code.or_else(|| {
            self.pm
                .archive_info(&request.patched_apk)
                .map(|info| self.pm.version_code(&info))
        });
        let Some(patched) = patched else {
            return Err(InstallError::backend(format!(
                "Cannot read the version of {}",
                request.patched_apk.display()
            )));
        };
        let installed = self.pm.version_code(&installed);
        if patched < installed {
            return Err(InstallError::Conflict { installed, patched });
        }
        Ok(())
    }

    fn remove_existing(&self, plan: &InstallPlan, request: &InstallRequest) -> Result<()> {
        let package_id = request.expected_package_id.as_str();
        if matches!(plan, InstallPlan::RootMount(_)) || !self.pm.is_installed(package_id) {
            return Ok(());
        }
        log::info!("Uninstalling {} before reinstalling", package_id);
        self.pm.uninstall_package(package_id)
    }

    /// Remove a root overlay of the same package so two install methods never coexist.
    fn unmount_overlay(&self, package_id: &str) {
        if !self.root.has_root_access() {
            return;
        }
        match self.root.is_app_mounted(package_id) {
            Ok(true) => {
                if let Err(e) = self.root.unmount(package_id) {
                    log::warn!("Failed to unmount previous overlay of {}: {}", package_id, e);
                }
            }
            Ok(false) => {}
            Err(e) => log::debug!("Mount probe for {} failed: {}", package_id, e),
        }
    }

    fn run_install(
        self: &Arc<Self>,
        id: AttemptId,
        plan: &InstallPlan,
        request: &InstallRequest,
    ) -> Result<Started> {
        let package_id = request.expected_package_id.as_str();
        if !matches!(plan, InstallPlan::RootMount(_)) {
            self.unmount_overlay(package_id);
        }

        match plan {
            InstallPlan::Internal(_) => {
                self.pm.install_app(std::slice::from_ref(&request.patched_apk))?;
                self.arm_timeout(id, self.config.os_installer_timeout);
                Ok(Started::AwaitingBroadcast)
            }
            InstallPlan::RootMount(_) => {
                self.root.install(&RootInstallRequest {
                    patched_apk: request.patched_apk.clone(),
                    stock_apk: request.stock_apk.clone(),
                    package_id: package_id.to_string(),
                    version: request.version_name.clone(),
                    version_code: request.version_code,
                    label: request.label.clone(),
                })?;
                self.root.mount(package_id)?;
                Ok(Started::Completed(Some(package_id.to_string())))
            }
            InstallPlan::PrivilegedIpc(_) => {
                let result = self.ipc.install(&request.patched_apk, package_id)?;
                if !result.is_success() {
                    return Err(InstallError::Ipc {
                        status: result.status,
                        message: result.message,
                    });
                }
                Ok(Started::Completed(Some(package_id.to_string())))
            }
            InstallPlan::External(external) => {
                self.intents.launch(&external.launch)?;
                log::info!(
                    "Waiting for {} to install {}",
                    external.installer_label,
                    external.source_label
                );
                self.arm_timeout(id, self.config.external_installer_timeout);
                Ok(Started::AwaitingBroadcast)
            }
        }
    }
}

/// User-facing message for a failed attempt.
fn failure_message(error: &InstallError) -> String {
    match error {
        InstallError::Ipc { status, message } => format_failure_hint(*status, message.as_deref())
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}
