//! Installer Resolution Engine
//!
//! Decides which backend an install request goes through and in what order the
//! alternatives are tried.
//!
//! # Fallback sequence
//!
//! | Position | Token | Included when |
//! |----------|-------|---------------|
//! | 1 | primary | not `None` and available for the target |
//! | 2 | `Internal` | not already present |
//! | 3 | fallback | not `None`, available, not a duplicate |
//!
//! `resolve_plan` builds the first plan of that sequence that can actually be
//! constructed. `Internal` is always in the sequence, so running out of
//! candidates is a resolver bug, not a user-facing failure.

mod search;

pub use crate::status::format_failure_hint;

use crate::error::{InstallError, Result};
use crate::intents::IntentResolver;
use crate::ipc::PrivilegedInstaller;
use crate::package_manager::PackageManager;
use crate::plan::{ExternalPlan, InstallPlan, LaunchDescriptor, SharedResource};
use crate::root::RootAccess;
use crate::types::{
    Availability, ComponentId, InstallTarget, InstallToken, InstallerEntry, InstallerIcon,
    UnavailableReason,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// AOSP "Package installer" under its legacy identity. It duplicates `Internal`.
pub const LEGACY_PACKAGE_INSTALLER: &str = "com.android.packageinstaller";

// ============================================================================
// Preferences
// ============================================================================

/// User-chosen tokens, already parsed from their persisted strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerPreferences {
    pub primary: InstallToken,
    pub fallback: InstallToken,
    pub custom: Vec<ComponentId>,
}

impl Default for InstallerPreferences {
    fn default() -> Self {
        Self {
            primary: InstallToken::Internal,
            fallback: InstallToken::None,
            custom: Vec::new(),
        }
    }
}

impl InstallerPreferences {
    /// Parse persisted preference strings.
    ///
    /// A malformed primary falls back to `Internal`, a malformed fallback to
    /// `None`; malformed custom tokens are dropped.
    pub fn from_persisted<'a>(
        primary: &str,
        fallback: &str,
        custom: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let primary = InstallToken::from_pref(primary).unwrap_or_else(|| {
            log::warn!("Ignoring malformed primary installer {:?}", primary);
            InstallToken::Internal
        });
        let fallback = InstallToken::from_pref(fallback).unwrap_or_else(|| {
            log::warn!("Ignoring malformed fallback installer {:?}", fallback);
            InstallToken::None
        });
        let mut seen = HashSet::new();
        let custom = custom
            .into_iter()
            .filter_map(|value| match value.parse::<ComponentId>() {
                Ok(component) => Some(component),
                Err(e) => {
                    log::warn!("Ignoring custom installer: {}", e);
                    None
                }
            })
            .filter(|component| seen.insert(component.clone()))
            .collect();
        Self {
            primary,
            fallback,
            custom,
        }
    }
}

// ============================================================================
// Resolver
// ============================================================================

pub struct InstallerResolver {
    pm: Arc<dyn PackageManager>,
    intents: Arc<dyn IntentResolver>,
    ipc: Arc<dyn PrivilegedInstaller>,
    root: Arc<dyn RootAccess>,
    share_dir: PathBuf,
    prefs: Mutex<InstallerPreferences>,
    // External plan whose shared copy has not been released yet.
    outstanding: Mutex<Option<ExternalPlan>>,
}

impl InstallerResolver {
    pub fn new(
        pm: Arc<dyn PackageManager>,
        intents: Arc<dyn IntentResolver>,
        ipc: Arc<dyn PrivilegedInstaller>,
        root: Arc<dyn RootAccess>,
        share_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pm,
            intents,
            ipc,
            root,
            share_dir: share_dir.into(),
            prefs: Mutex::new(InstallerPreferences::default()),
            outstanding: Mutex::new(None),
        }
    }

    pub fn with_preferences(self, prefs: InstallerPreferences) -> Self {
        self.set_preferences(prefs);
        self
    }

    pub fn preferences(&self) -> InstallerPreferences {
        self.prefs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_preferences(&self, prefs: InstallerPreferences) {
        *self.prefs.lock().unwrap_or_else(|e| e.into_inner()) = prefs;
    }

    /// Live probe: can `component` take an install intent right now?
    pub fn is_component_available(&self, component: &ComponentId) -> bool {
        self.intents.can_handle_install(component)
    }

    // ------------------------------------------------------------------------
    // Entries
    // ------------------------------------------------------------------------

    /// Selectable installers for `target`.
    ///
    /// Built-ins available for `target` come first, then third-party installers,
    /// then custom entries not already covered, then (optionally) `None`.
    pub fn list_entries(&self, target: InstallTarget, include_none: bool) -> Vec<InstallerEntry> {
        let mut entries = vec![self.internal_entry()];
        let shizuku = self.availability_for(&InstallToken::Shizuku, target);
        if shizuku.available {
            entries.push(InstallerEntry {
                token: InstallToken::Shizuku,
                label: InstallToken::Shizuku.to_string(),
                description: Some("Install through the Shizuku service".to_string()),
                availability: shizuku,
                icon: InstallerIcon::Shizuku,
            });
        }

        let mut covered: HashSet<String> = HashSet::new();
        let mut handlers: Vec<InstallerEntry> = self
            .third_party_handlers()
            .into_iter()
            .filter(|(component, _)| covered.insert(component.package.clone()))
            .map(|(component, label)| self.component_entry(component, label, target))
            .collect();
        sort_by_label(&mut handlers);

        let mut custom: Vec<InstallerEntry> = self
            .preferences()
            .custom
            .into_iter()
            .filter(|component| covered.insert(component.package.clone()))
            .map(|component| {
                let label = self.app_label(&component.package);
                self.component_entry(component, label, target)
            })
            .collect();
        sort_by_label(&mut custom);

        entries.extend(handlers);
        entries.extend(custom);
        if include_none {
            entries.push(InstallerEntry {
                token: InstallToken::None,
                label: InstallToken::None.to_string(),
                description: Some("Do not fall back to another installer".to_string()),
                availability: Availability::AVAILABLE,
                icon: InstallerIcon::Blank,
            });
        }
        entries
    }

    fn internal_entry(&self) -> InstallerEntry {
        InstallerEntry {
            token: InstallToken::Internal,
            label: InstallToken::Internal.to_string(),
            description: Some("Install with the system package installer".to_string()),
            availability: Availability::AVAILABLE,
            icon: InstallerIcon::System,
        }
    }

    /// Installed handlers declaring the install permission, minus the OS
    /// default and the legacy AOSP installer.
    fn third_party_handlers(&self) -> Vec<(ComponentId, String)> {
        let default_package = self
            .intents
            .default_install_handler()
            .map(|component| component.package);
        self.intents
            .query_install_handlers()
            .into_iter()
            .filter(|handler| handler.declares_install_permission)
            .filter(|handler| {
                let package = handler.component.package.as_str();
                package != LEGACY_PACKAGE_INSTALLER && Some(package) != default_package.as_deref()
            })
            .map(|handler| (handler.component, handler.label))
            .collect()
    }

    pub(crate) fn component_entry(
        &self,
        component: ComponentId,
        label: String,
        target: InstallTarget,
    ) -> InstallerEntry {
        let token = InstallToken::Component(component.clone());
        InstallerEntry {
            availability: self.availability_for(&token, target),
            description: Some(component.to_string()),
            icon: InstallerIcon::App(component.package.clone()),
            label,
            token,
        }
    }

    pub(crate) fn app_label(&self, package_id: &str) -> String {
        self.pm
            .package_info(package_id)
            .map(|info| self.pm.label(&info))
            .unwrap_or_else(|| package_id.to_string())
    }

    // ------------------------------------------------------------------------
    // Availability and sequencing
    // ------------------------------------------------------------------------

    /// Whether `token` can be used for `target` right now. Never cached.
    pub fn availability_for(&self, token: &InstallToken, target: InstallTarget) -> Availability {
        match token {
            InstallToken::Internal | InstallToken::None => Availability::AVAILABLE,
            InstallToken::Root => {
                if !target.supports_root() {
                    Availability::unavailable(UnavailableReason::TargetUnsupported)
                } else if !self.root.has_root_access() {
                    Availability::unavailable(UnavailableReason::RootNotGranted)
                } else {
                    Availability::AVAILABLE
                }
            }
            InstallToken::Shizuku => {
                if self.ipc.is_installed() {
                    self.ipc.availability(target)
                } else {
                    Availability::unavailable(UnavailableReason::BrokerNotInstalled)
                }
            }
            InstallToken::Component(component) => {
                if self.intents.can_handle_install(component) {
                    Availability::AVAILABLE
                } else {
                    Availability::unavailable(UnavailableReason::ComponentUnavailable)
                }
            }
        }
    }

    /// Ordered, deduplicated tokens to attempt for `target`.
    pub fn fallback_sequence(&self, target: InstallTarget) -> Vec<InstallToken> {
        let prefs = self.preferences();
        let mut sequence = Vec::with_capacity(3);

        if !prefs.primary.is_none() {
            let availability = self.availability_for(&prefs.primary, target);
            if availability.available {
                sequence.push(prefs.primary.clone());
            } else {
                log::debug!(
                    "Skipping primary installer {}: {:?}",
                    prefs.primary,
                    availability.reason
                );
            }
        }

        if !sequence.contains(&InstallToken::Internal) {
            sequence.push(InstallToken::Internal);
        }

        if !prefs.fallback.is_none() && !sequence.contains(&prefs.fallback) {
            let availability = self.availability_for(&prefs.fallback, target);
            if availability.available {
                sequence.push(prefs.fallback.clone());
            } else {
                log::debug!(
                    "Skipping fallback installer {}: {:?}",
                    prefs.fallback,
                    availability.reason
                );
            }
        }

        sequence
    }

    // ------------------------------------------------------------------------
    // Plans
    // ------------------------------------------------------------------------

    /// Build the plan for one install attempt.
    ///
    /// An outstanding external plan that never reached an installer is cleaned
    /// up first. While one is still being installed its shared copy is left
    /// alone and third-party installers are skipped.
    pub fn resolve_plan(
        &self,
        target: InstallTarget,
        source: &Path,
        expected_package_id: &str,
        source_label: &str,
    ) -> InstallPlan {
        let (stale, in_flight) = {
            let mut outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
            match outstanding.as_ref() {
                Some(plan) if plan.resource.is_in_flight() => (None, true),
                _ => (outstanding.take(), false),
            }
        };
        if let Some(stale) = stale {
            log::warn!(
                "Releasing shared copy of an earlier attempt: {}",
                stale.shared_file.display()
            );
            self.cleanup(&stale);
        }

        for token in self.fallback_sequence(target) {
            let plan = match &token {
                InstallToken::Internal => Some(InstallPlan::Internal(target)),
                InstallToken::Root => Some(InstallPlan::RootMount(target)),
                InstallToken::Shizuku => Some(InstallPlan::PrivilegedIpc(target)),
                InstallToken::None => None,
                InstallToken::Component(component) if in_flight => {
                    log::info!(
                        "Skipping installer {}: an external install is still in progress",
                        component
                    );
                    None
                }
                InstallToken::Component(component) => match self.build_external(
                    target,
                    component,
                    source,
                    expected_package_id,
                    source_label,
                ) {
                    Ok(plan) => {
                        *self.outstanding.lock().unwrap_or_else(|e| e.into_inner()) =
                            Some(plan.clone());
                        Some(InstallPlan::External(plan))
                    }
                    Err(e) => {
                        log::warn!("Cannot use installer {}: {}", component, e);
                        None
                    }
                },
            };
            if let Some(plan) = plan {
                log::info!("Resolved installer for {}: {}", expected_package_id, plan.describe());
                return plan;
            }
        }

        log::error!(
            "No install plan could be built for {} ({}); using the system installer",
            expected_package_id,
            target
        );
        debug_assert!(false, "fallback sequence exhausted without a plan");
        InstallPlan::Internal(target)
    }

    fn build_external(
        &self,
        target: InstallTarget,
        component: &ComponentId,
        source: &Path,
        expected_package_id: &str,
        source_label: &str,
    ) -> Result<ExternalPlan> {
        std::fs::create_dir_all(&self.share_dir)?;
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let shared_file = self
            .share_dir
            .join(format!("{expected_package_id}-{nanos}.apk"));
        std::fs::copy(source, &shared_file)?;

        let uri = match self.intents.grant_read(&shared_file, &component.package) {
            Ok(uri) => uri,
            Err(e) => {
                let _ = std::fs::remove_file(&shared_file);
                return Err(e);
            }
        };

        Ok(ExternalPlan {
            target,
            launch: LaunchDescriptor::install(component.clone(), uri.clone()),
            resource: SharedResource::new(uri, component.package.clone()),
            shared_file,
            expected_package_id: expected_package_id.to_string(),
            installer_label: self.app_label(&component.package),
            source_label: source_label.to_string(),
        })
    }

    /// Revoke the read grant and delete the shared copy. Safe to call repeatedly.
    pub fn cleanup(&self, plan: &ExternalPlan) {
        {
            let mut outstanding = self.outstanding.lock().unwrap_or_else(|e| e.into_inner());
            if outstanding
                .as_ref()
                .is_some_and(|p| p.shared_file == plan.shared_file)
            {
                outstanding.take();
            }
        }

        if !plan.resource.mark_released() {
            return;
        }
        self.intents.revoke_read(&plan.resource.uri);
        match std::fs::remove_file(&plan.shared_file) {
            Ok(()) => log::debug!("Removed shared copy {}", plan.shared_file.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "Failed to remove shared copy {}: {}",
                plan.shared_file.display(),
                e
            ),
        }
    }

    /// Check that `token` is usable for `target`, as a typed error.
    pub fn ensure_available(&self, token: &InstallToken, target: InstallTarget) -> Result<()> {
        let availability = self.availability_for(token, target);
        if availability.available {
            return Ok(());
        }
        Err(InstallError::unavailable(
            token.to_string(),
            availability
                .reason
                .map(|r| r.to_string())
                .unwrap_or_default(),
        ))
    }
}

fn sort_by_label(entries: &mut [InstallerEntry]) {
    entries.sort_by_cached_key(|entry| entry.label.to_lowercase());
}
