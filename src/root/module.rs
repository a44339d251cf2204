//! Module directory layout and templates
//!
//! A root-mounted app lives in `<modules_root>/<package>-<suffix>/` as a regular
//! root-manager module: `service.sh` re-creates the bind mount on every boot,
//! `module.prop` describes it, and `<package>.apk` is the patched payload.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const ACTIVATION_SCRIPT: &str = "service.sh";
pub const METADATA_FILE: &str = "module.prop";

const PKG_PLACEHOLDER: &str = "__PKG_NAME__";
const VERSION_PLACEHOLDER: &str = "__VERSION__";
const LABEL_PLACEHOLDER: &str = "__LABEL__";
const SUFFIX_PLACEHOLDER: &str = "__SUFFIX__";

const SERVICE_TEMPLATE: &str = r#"#!/system/bin/sh
MODDIR=${0%/*}
PKG=__PKG_NAME__

until [ "$(getprop sys.boot_completed)" = 1 ]; do sleep 3; done
until [ -d "/sdcard/Android" ]; do sleep 1; done

stock_path=$(pm path "$PKG" | grep base | sed 's/package://g')
[ -z "$stock_path" ] && exit 0

chcon u:object_r:apk_data_file:s0 "$MODDIR/$PKG.apk"
mount -o bind "$MODDIR/$PKG.apk" "$stock_path"
am force-stop "$PKG"
"#;

const PROP_TEMPLATE: &str = "id=__PKG_NAME__-__SUFFIX__
name=__LABEL__ (patched)
version=__VERSION__
versionCode=0
author=patchdeploy
description=Mounts the patched __LABEL__ (__PKG_NAME__) over the installed app
";

/// Values substituted into the module templates.
#[derive(Debug, Clone, Copy)]
pub struct ModuleTemplate<'a> {
    pub package_id: &'a str,
    pub version: &'a str,
    pub label: &'a str,
    pub suffix: &'a str,
}

impl ModuleTemplate<'_> {
    fn fill(&self, template: &str) -> String {
        template
            .replace(PKG_PLACEHOLDER, self.package_id)
            .replace(VERSION_PLACEHOLDER, self.version)
            .replace(LABEL_PLACEHOLDER, self.label)
            .replace(SUFFIX_PLACEHOLDER, self.suffix)
    }

    pub fn activation_script(&self) -> String {
        self.fill(SERVICE_TEMPLATE)
    }

    pub fn metadata(&self) -> String {
        self.fill(PROP_TEMPLATE)
    }
}

/// Where module bundles live on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleLayout {
    pub root: PathBuf,
    pub suffix: String,
}

impl ModuleLayout {
    pub fn new(root: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            suffix: suffix.into(),
        }
    }

    pub fn dir(&self, package_id: &str) -> PathBuf {
        self.root.join(format!("{package_id}-{}", self.suffix))
    }

    pub fn apk_path(&self, package_id: &str) -> PathBuf {
        self.dir(package_id).join(format!("{package_id}.apk"))
    }

    pub fn script_path(&self, package_id: &str) -> PathBuf {
        self.dir(package_id).join(ACTIVATION_SCRIPT)
    }

    pub fn prop_path(&self, package_id: &str) -> PathBuf {
        self.dir(package_id).join(METADATA_FILE)
    }

    /// Package id encoded in a module directory name, if it is one of ours.
    pub fn package_of(&self, dir_name: &str) -> Option<String> {
        dir_name
            .strip_suffix(&self.suffix)
            .and_then(|rest| rest.strip_suffix('-'))
            .filter(|pkg| !pkg.is_empty())
            .map(String::from)
    }

    pub fn template<'a>(&'a self, package_id: &'a str, version: &'a str, label: &'a str) -> ModuleTemplate<'a> {
        ModuleTemplate {
            package_id,
            version,
            label,
            suffix: &self.suffix,
        }
    }
}

/// A module bundle found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub id: String,
    pub package_id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub path: PathBuf,
}

/// Parse `key=value` lines of a `module.prop`.
pub fn parse_module_prop(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

impl ModuleInfo {
    pub fn from_prop(package_id: &str, path: &Path, contents: &str) -> Self {
        let mut props = parse_module_prop(contents);
        let mut take = |key: &str| props.remove(key).unwrap_or_default();
        Self {
            id: take("id"),
            name: take("name"),
            version: take("version"),
            description: take("description"),
            package_id: package_id.to_string(),
            path: path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> ModuleLayout {
        ModuleLayout::new("/data/adb/modules", "patched")
    }

    #[test]
    fn test_layout_paths() {
        let layout = layout();
        assert_eq!(
            layout.dir("com.example.app"),
            PathBuf::from("/data/adb/modules/com.example.app-patched")
        );
        assert_eq!(
            layout.apk_path("com.example.app"),
            PathBuf::from("/data/adb/modules/com.example.app-patched/com.example.app.apk")
        );
        assert!(layout.script_path("a.b").ends_with(ACTIVATION_SCRIPT));
        assert!(layout.prop_path("a.b").ends_with(METADATA_FILE));
    }

    #[test]
    fn test_package_of_dir_name() {
        let layout = layout();
        assert_eq!(
            layout.package_of("com.example.app-patched").as_deref(),
            Some("com.example.app")
        );
        assert_eq!(layout.package_of("zygisk_lsposed"), None);
        assert_eq!(layout.package_of("-patched"), None);
        assert_eq!(layout.package_of("com.example.apppatched"), None);
    }

    #[test]
    fn test_templates_are_fully_substituted() {
        let layout = layout();
        let template = layout.template("com.example.app", "19.16.39", "Example");
        let script = template.activation_script();
        let prop = template.metadata();

        for text in [&script, &prop] {
            assert!(!text.contains("__"), "unsubstituted placeholder in {text}");
        }
        assert!(script.contains("PKG=com.example.app"));
        assert!(prop.contains("id=com.example.app-patched"));
        assert!(prop.contains("version=19.16.39"));
    }

    #[test]
    fn test_module_info_round_trips_template() {
        let layout = layout();
        let prop = layout.template("com.example.app", "1.0", "Example").metadata();
        let info = ModuleInfo::from_prop("com.example.app", &layout.dir("com.example.app"), &prop);
        assert_eq!(info.id, "com.example.app-patched");
        assert_eq!(info.name, "Example (patched)");
        assert_eq!(info.version, "1.0");
    }

    #[test]
    fn test_parse_module_prop_ignores_noise() {
        let props = parse_module_prop("# comment\n\nid=x\nbroken line\nname = Y \n");
        assert_eq!(props.len(), 2);
        assert_eq!(props["name"], "Y");
    }
}
