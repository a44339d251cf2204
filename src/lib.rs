//! patchdeploy library
//!
//! Installer resolution and execution for patched Android packages: picks a
//! backend (system installer, root mount overlay, privileged broker or a
//! third-party installer app), runs it, and tracks completion with timeouts and
//! cleanup.

pub mod cli;
pub mod config_file;
pub mod error;
pub mod executor;
pub mod install_state;
pub mod intents;
pub mod ipc;
pub mod package_manager;
pub mod plan;
pub mod process_guard;
pub mod remote_fs;
pub mod resolver;
pub mod root;
pub mod shell;
pub mod status;
pub mod types;
pub mod worker;

// Re-export main types for convenience
pub use config_file::DeployConfig;
pub use error::{InstallError, Result};
pub use executor::{ExecutorConfig, InstallExecutor, InstallRequest, PatchFollowUp};
pub use install_state::{InstallCompletionStatus, InstallState, InstallTransitionError};
pub use plan::{ExternalPlan, InstallPlan, LaunchDescriptor};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use resolver::{InstallerPreferences, InstallerResolver, format_failure_hint};
pub use root::{RootAccess, RootInstallRequest, RootInstaller};
pub use shell::{Shell, ShellSession, disable_dry_run, enable_dry_run, is_dry_run};
pub use types::{Availability, ComponentId, InstallTarget, InstallToken, InstallerEntry};
