//! Executable install plans
//!
//! A plan is one concrete instantiation of a token for one install attempt. Only
//! `External` plans own resources (a shared APK copy and a read grant); those are
//! released through `InstallerResolver::cleanup`, at most once per plan.

use crate::intents::{ACTION_VIEW, APK_MIME_TYPE};
use crate::types::{ComponentId, InstallTarget, InstallToken};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Everything needed to start an external installer activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchDescriptor {
    pub component: ComponentId,
    pub action: String,
    pub data_uri: String,
    pub mime_type: String,
    pub grant_read: bool,
}

impl LaunchDescriptor {
    /// `VIEW` intent for an APK with a read grant.
    pub fn install(component: ComponentId, data_uri: String) -> Self {
        Self {
            component,
            action: ACTION_VIEW.to_string(),
            data_uri,
            mime_type: APK_MIME_TYPE.to_string(),
            grant_read: true,
        }
    }
}

/// Read grant plus shared copy handed to an external installer.
#[derive(Debug, Clone)]
pub struct SharedResource {
    pub uri: String,
    pub grantee: String,
    started: Arc<AtomicBool>,
    released: Arc<AtomicBool>,
}

impl SharedResource {
    pub fn new(uri: impl Into<String>, grantee: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            grantee: grantee.into(),
            started: Arc::new(AtomicBool::new(false)),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Claim the release; `true` only for the first caller.
    pub fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Record that an installer attempt now owns the resource.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    /// Started and not yet released: an installer may still be reading it.
    pub fn is_in_flight(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.is_released()
    }
}

#[derive(Debug, Clone)]
pub struct ExternalPlan {
    pub target: InstallTarget,
    pub launch: LaunchDescriptor,
    pub shared_file: PathBuf,
    pub resource: SharedResource,
    pub expected_package_id: String,
    pub installer_label: String,
    pub source_label: String,
}

#[derive(Debug, Clone)]
pub enum InstallPlan {
    Internal(InstallTarget),
    RootMount(InstallTarget),
    PrivilegedIpc(InstallTarget),
    External(ExternalPlan),
}

impl InstallPlan {
    pub fn target(&self) -> InstallTarget {
        match self {
            Self::Internal(target) | Self::RootMount(target) | Self::PrivilegedIpc(target) => {
                *target
            }
            Self::External(plan) => plan.target,
        }
    }

    /// The token this plan was built from.
    pub fn token(&self) -> InstallToken {
        match self {
            Self::Internal(_) => InstallToken::Internal,
            Self::RootMount(_) => InstallToken::Root,
            Self::PrivilegedIpc(_) => InstallToken::Shizuku,
            Self::External(plan) => InstallToken::Component(plan.launch.component.clone()),
        }
    }

    pub fn as_external(&self) -> Option<&ExternalPlan> {
        match self {
            Self::External(plan) => Some(plan),
            _ => None,
        }
    }

    /// Short description for logs and the CLI.
    pub fn describe(&self) -> String {
        match self {
            Self::Internal(_) => "system installer".to_string(),
            Self::RootMount(_) => "root mount".to_string(),
            Self::PrivilegedIpc(_) => "Shizuku".to_string(),
            Self::External(plan) => format!("{} ({})", plan.installer_label, plan.launch.component),
        }
    }
}
