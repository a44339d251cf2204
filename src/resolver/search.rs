//! Read-only lookups for the "add a custom installer" flow.
//!
//! Matching is a case-insensitive substring test over package id and label.
//! Results are deduplicated and sorted by label.

use super::{InstallerResolver, sort_by_label};
use crate::package_manager::PackageInfo;
use crate::types::{InstallTarget, InstallToken, InstallerEntry};
use std::collections::HashSet;

fn matches(query: &str, package_id: &str, label: &str) -> bool {
    let query = query.trim().to_lowercase();
    query.is_empty()
        || package_id.to_lowercase().contains(&query)
        || label.to_lowercase().contains(&query)
}

impl InstallerResolver {
    /// Installed apps matching `query` that are not yet custom installers.
    pub fn suggest_installer_packages(&self, query: &str) -> Vec<PackageInfo> {
        let custom: HashSet<String> = self
            .preferences()
            .custom
            .into_iter()
            .map(|component| component.package)
            .collect();

        let mut seen = HashSet::new();
        let mut suggestions: Vec<(String, PackageInfo)> = self
            .pm
            .installed_packages()
            .into_iter()
            .filter(|info| !custom.contains(&info.package_id))
            .filter(|info| seen.insert(info.package_id.clone()))
            .map(|info| (self.pm.label(&info), info))
            .filter(|(label, info)| matches(query, &info.package_id, label))
            .collect();

        suggestions.sort_by_cached_key(|(label, info)| (label.to_lowercase(), info.package_id.clone()));
        suggestions.into_iter().map(|(_, info)| info).collect()
    }

    /// Registered entries for `target` matching `query`. Never includes `None`.
    pub fn search_installer_entries(&self, target: InstallTarget, query: &str) -> Vec<InstallerEntry> {
        let mut entries: Vec<InstallerEntry> = self
            .list_entries(target, false)
            .into_iter()
            .filter(|entry| {
                let package = match &entry.token {
                    InstallToken::Component(component) => component.package.as_str(),
                    _ => "",
                };
                matches(query, package, &entry.label)
            })
            .collect();
        sort_by_label(&mut entries);
        entries
    }

    /// Every install-capable activity of `package_id`, including custom ones.
    ///
    /// Unlike `list_entries` this does not require the install permission, so a
    /// user can pick any activity the app exports.
    pub fn find_installer_entries_for_package(
        &self,
        target: InstallTarget,
        package_id: &str,
    ) -> Vec<InstallerEntry> {
        let mut seen = HashSet::new();
        let handlers = self
            .intents
            .query_install_handlers()
            .into_iter()
            .filter(|handler| handler.component.package == package_id)
            .map(|handler| handler.component);
        let custom = self
            .preferences()
            .custom
            .into_iter()
            .filter(|component| component.package == package_id);

        let label = self.app_label(package_id);
        let mut entries: Vec<InstallerEntry> = handlers
            .chain(custom)
            .filter(|component| seen.insert(component.clone()))
            .map(|component| {
                let label = format!("{} ({})", label, component.simple_class_name());
                self.component_entry(component, label, target)
            })
            .collect();
        sort_by_label(&mut entries);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::matches;

    #[test]
    fn test_match_is_case_insensitive_substring() {
        assert!(matches("droid", "com.aurora.store", "Aurora Droid"));
        assert!(matches("AURORA", "com.aurora.store", "Store"));
        assert!(!matches("fdroid", "com.aurora.store", "Aurora"));
        assert!(matches("  ", "a", "b"));
    }
}
