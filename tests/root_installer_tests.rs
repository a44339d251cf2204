//! Root mount installer against a simulated root shell and module filesystem.

mod common;

use common::{FakeShell, Harness, NeverBinder, PACKAGE, STOCK_PATH};
use patchdeploy::error::InstallError;
use patchdeploy::remote_fs::RemoteFsChannel;
use patchdeploy::root::{ModuleLayout, RootInstallRequest, RootInstaller};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

const MODULE_DIR: &str = "/data/adb/modules/com.example.app-patched";

fn request(h: &Harness, package_id: &str) -> RootInstallRequest {
    RootInstallRequest {
        patched_apk: h.apk(&format!("{package_id}.apk"), package_id, 20),
        stock_apk: None,
        package_id: package_id.to_string(),
        version: "19.16.39".to_string(),
        version_code: None,
        label: "Example".to_string(),
    }
}

#[test]
fn test_install_writes_module_bundle() {
    let h = Harness::rooted();
    h.root.install(&request(&h, PACKAGE)).unwrap();

    let dir = Path::new(MODULE_DIR);
    assert!(h.fs.has_dir(dir));
    let script = h.fs.file(&dir.join("service.sh")).unwrap();
    assert!(script.contains("PKG=com.example.app"));
    assert!(script.contains("mount -o bind"));
    let prop = h.fs.file(&dir.join("module.prop")).unwrap();
    assert!(prop.contains("id=com.example.app-patched"));
    assert!(prop.contains("version=19.16.39"));
    assert!(h.fs.file(&dir.join("com.example.app.apk")).unwrap().contains("patched"));

    for prefix in ["chmod 644", "chown system:system", "chcon u:object_r:apk_data_file:s0", "chmod +x"] {
        assert_eq!(h.shell.count(prefix), 1, "{prefix}");
    }
    // Writing the bundle does not mount it.
    assert!(!h.shell.is_mounted(STOCK_PATH));
}

#[test]
fn test_mount_is_idempotent() {
    let h = Harness::rooted();
    h.root.install(&request(&h, PACKAGE)).unwrap();

    h.root.mount(PACKAGE).unwrap();
    h.root.mount(PACKAGE).unwrap();

    assert!(h.root.is_app_mounted(PACKAGE).unwrap());
    assert_eq!(h.shell.count("mount -o bind"), 1);
    assert_eq!(h.shell.count("am force-stop"), 1);
}

#[test]
fn test_unmount_is_idempotent() {
    let h = Harness::rooted();
    h.root.unmount(PACKAGE).unwrap();
    assert_eq!(h.shell.count("umount"), 0);

    h.root.install(&request(&h, PACKAGE)).unwrap();
    h.root.mount(PACKAGE).unwrap();
    h.root.unmount(PACKAGE).unwrap();
    h.root.unmount(PACKAGE).unwrap();

    assert!(!h.root.is_app_mounted(PACKAGE).unwrap());
    assert_eq!(h.shell.count("umount -l"), 1);
}

#[test]
fn test_reinstall_removes_existing_mount_first() {
    let h = Harness::rooted();
    h.root.install(&request(&h, PACKAGE)).unwrap();
    h.root.mount(PACKAGE).unwrap();

    h.root.install(&request(&h, PACKAGE)).unwrap();
    assert!(!h.shell.is_mounted(STOCK_PATH));
}

#[test]
fn test_mount_requires_stock_app() {
    let h = Harness::rooted();
    h.shell.stock_paths.lock().unwrap().clear();

    let err = h.root.mount(PACKAGE).unwrap_err();
    assert_eq!(err.step(), Some("Failed to mount APK"));
}

#[test]
fn test_failing_step_is_named() {
    let h = Harness::rooted();
    h.shell.fail_on("chown");

    let err = h.root.install(&request(&h, PACKAGE)).unwrap_err();
    assert_eq!(err.step(), Some("Failed to chown APK"));
    assert!(err.to_string().contains("simulated failure"));
    assert_eq!(h.shell.count("chcon"), 0);
}

#[test]
fn test_stock_install_removes_newer_or_equal_installed_app() {
    let h = Harness::rooted();
    h.pm.install_existing(PACKAGE, 20);
    let stock = h.work_dir.path().join("stock.apk");
    std::fs::write(&stock, b"stock").unwrap();

    let mut req = request(&h, PACKAGE);
    req.stock_apk = Some(stock.clone());
    h.root.install(&req).unwrap();

    let commands = h.shell.commands();
    let uninstall = commands
        .iter()
        .position(|c| c == "pm uninstall -k --user 0 'com.example.app'")
        .expect("stock uninstall");
    let install = commands
        .iter()
        .position(|c| c.starts_with("pm install -r ") && c.contains("stock.apk"))
        .expect("stock install");
    assert!(uninstall < install);
}

#[test]
fn test_stock_install_keeps_older_installed_app() {
    let h = Harness::rooted();
    h.pm.install_existing(PACKAGE, 10);
    let stock = h.work_dir.path().join("stock.apk");
    std::fs::write(&stock, b"stock").unwrap();

    let mut req = request(&h, PACKAGE);
    req.stock_apk = Some(stock);
    h.root.install(&req).unwrap();

    assert_eq!(h.shell.count("pm uninstall"), 0);
    assert_eq!(h.shell.count("pm install -r"), 1);
}

#[test]
fn test_uninstall_unmounts_and_deletes_module() {
    let h = Harness::rooted();
    h.root.install(&request(&h, PACKAGE)).unwrap();
    h.root.mount(PACKAGE).unwrap();

    h.root.uninstall(PACKAGE).unwrap();

    assert!(!h.shell.is_mounted(STOCK_PATH));
    assert!(!h.root.is_app_installed(PACKAGE).unwrap());
}

#[test]
fn test_uninstall_reports_undeleted_directory() {
    let h = Harness::rooted();
    h.root.install(&request(&h, PACKAGE)).unwrap();
    h.fs.refuse_delete.store(true, Ordering::SeqCst);

    let err = h.root.uninstall(PACKAGE).unwrap_err();
    assert_eq!(err.step(), Some("Failed to delete module directory"));
}

#[test]
fn test_installed_modules_lists_own_bundles_only() {
    let h = Harness::rooted();
    h.root.install(&request(&h, "org.second.app")).unwrap();
    h.root.install(&request(&h, PACKAGE)).unwrap();
    h.fs
        .dirs
        .lock()
        .unwrap()
        .insert("/data/adb/modules/zygisk_lsposed".into());

    let modules = h.root.installed_modules().unwrap();
    let packages: Vec<&str> = modules.iter().map(|m| m.package_id.as_str()).collect();
    assert_eq!(packages, vec!["com.example.app", "org.second.app"]);
    assert_eq!(modules[0].name, "Example (patched)");
    assert_eq!(modules[0].path, Path::new(MODULE_DIR));
}

#[test]
fn test_unbound_root_service_is_unavailable() {
    let shell = FakeShell::rooted();
    let channel = Arc::new(RemoteFsChannel::new(
        Arc::new(NeverBinder),
        Duration::from_millis(50),
    ));
    let pm = Arc::new(common::FakePackageManager::default());
    let root = RootInstaller::new(
        shell,
        channel,
        pm,
        ModuleLayout::new("/data/adb/modules", "patched"),
    );

    assert!(matches!(
        root.is_app_installed(PACKAGE),
        Err(InstallError::ServiceUnavailable)
    ));
}
