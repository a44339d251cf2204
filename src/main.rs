//! patchdeploy - Main entry point
//!
//! Wires the installer core to device-shell backed collaborators and exposes it
//! as a small CLI.

use anyhow::{Context, Result};
use log::{debug, info};
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;

use patchdeploy::cli::{Cli, Commands, ConfigCommands};
use patchdeploy::config_file::DeployConfig;
use patchdeploy::executor::{InstallExecutor, InstallRequest};
use patchdeploy::install_state::InstallCompletionStatus;
use patchdeploy::intents::ShellIntentResolver;
use patchdeploy::ipc::RishInstaller;
use patchdeploy::package_manager::{PackageManager, ShellPackageManager};
use patchdeploy::process_guard::{self, ProcessGuard};
use patchdeploy::remote_fs::{RemoteFsChannel, ShellFsBinder};
use patchdeploy::resolver::InstallerResolver;
use patchdeploy::root::RootInstaller;
use patchdeploy::shell::{self, ShellSession};
use patchdeploy::types::{InstallTarget, InstallToken};

/// Initialize the logger with appropriate settings
fn init_logger() {
    use env_logger::Builder;
    use std::io::Write;

    Builder::from_default_env()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}:{}] {}",
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .parse_default_env() // Allows RUST_LOG env var to override
        .init();
}

/// Collaborators built from the configuration.
struct Runtime {
    pm: Arc<dyn PackageManager>,
    root: Arc<RootInstaller>,
    resolver: Arc<InstallerResolver>,
    executor: InstallExecutor,
}

impl Runtime {
    fn new(config: &DeployConfig) -> Result<Self> {
        let root_shell = Arc::new(ShellSession::new(
            &config.shell_command,
            config.shell_acquire_timeout(),
        ));
        let user_shell = Arc::new(ShellSession::new("sh", config.shell_acquire_timeout()));

        let (events_tx, events_rx) = mpsc::channel();
        let pm: Arc<dyn PackageManager> =
            Arc::new(ShellPackageManager::new(user_shell.clone(), events_tx));
        let intents = Arc::new(ShellIntentResolver::new(user_shell.clone()));
        let ipc = Arc::new(RishInstaller::new(user_shell, pm.clone()));

        let channel = Arc::new(RemoteFsChannel::new(
            Arc::new(ShellFsBinder::new(root_shell.clone())),
            config.root_service_timeout(),
        ));
        let root = Arc::new(RootInstaller::new(
            root_shell,
            channel,
            pm.clone(),
            config.module_layout(),
        ));

        let resolver = Arc::new(
            InstallerResolver::new(
                pm.clone(),
                intents.clone(),
                ipc.clone(),
                root.clone(),
                &config.share_dir,
            )
            .with_preferences(config.preferences()),
        );
        let executor = InstallExecutor::new(
            pm.clone(),
            root.clone(),
            ipc,
            intents,
            resolver.clone(),
            config.executor_config(),
        );
        executor
            .attach_events(events_rx)
            .context("Failed to start package event listener")?;

        Ok(Self {
            pm,
            root,
            resolver,
            executor,
        })
    }
}

/// Main application entry point
fn main() -> Result<()> {
    init_logger();
    debug!("patchdeploy starting up");

    if let Err(e) = process_guard::init_signal_handlers() {
        log::warn!("Failed to initialize signal handlers: {}", e);
    }
    let _guard = ProcessGuard::new();

    let cli = Cli::parse_args();
    if cli.dry_run {
        info!("Dry-run mode: mutating root commands will only be logged");
        shell::enable_dry_run();
    }

    if let Commands::Config { action } = &cli.command {
        return run_config_command(action);
    }

    let config = load_config(cli.config.as_deref())?;
    let runtime = Runtime::new(&config)?;

    match cli.command {
        Commands::Installers {
            target,
            include_none,
        } => list_installers(&runtime, target, include_none),
        Commands::Resolve {
            target,
            apk,
            package,
        } => {
            println!("Fallback sequence:");
            for token in runtime.resolver.fallback_sequence(target) {
                println!("  {token}");
            }
            let plan = runtime.resolver.resolve_plan(target, &apk, &package, &package);
            println!("Plan: {}", plan.describe());
            if let Some(external) = plan.as_external() {
                runtime.resolver.cleanup(external);
            }
            Ok(())
        }
        Commands::Install {
            target,
            apk,
            package,
            stock,
            version,
            version_code,
            label,
            mount,
            reinstall,
        } => {
            let label = label.unwrap_or_else(|| package.clone());
            if mount {
                let mut prefs = runtime.resolver.preferences();
                prefs.primary = InstallToken::Root;
                runtime.resolver.set_preferences(prefs);
            }
            let plan = runtime.resolver.resolve_plan(target, &apk, &package, &label);
            println!("Installing {} with {}", package, plan.describe());

            let status = runtime.executor.subscribe();
            let request = InstallRequest {
                target,
                patched_apk: apk,
                expected_package_id: package,
                version_name: version,
                version_code,
                label,
                stock_apk: stock,
            };
            if reinstall {
                runtime.executor.reinstall(plan, request)?;
            } else {
                runtime.executor.install(plan, request)?;
            }
            wait_for_completion(&status)
        }
        Commands::Uninstall { package } => {
            let status = runtime.executor.subscribe();
            runtime.executor.uninstall(&package)?;
            wait_for_completion(&status)
        }
        Commands::Mount { package } => {
            runtime.root.mount(&package)?;
            println!("✓ {package} mounted");
            Ok(())
        }
        Commands::Unmount { package } => {
            runtime.root.unmount(&package)?;
            println!("✓ {package} unmounted");
            Ok(())
        }
        Commands::Status { package } => show_status(&runtime, &package),
        Commands::Modules => {
            for module in runtime.root.installed_modules()? {
                println!(
                    "{}  {}  {}  ({})",
                    module.package_id,
                    module.version,
                    module.name,
                    module.path.display()
                );
            }
            Ok(())
        }
        Commands::Config { .. } => Ok(()),
    }
}

fn load_config(path: Option<&Path>) -> Result<DeployConfig> {
    let Some(path) = path else {
        debug!("No configuration file given, using defaults");
        return Ok(DeployConfig::default());
    };
    info!("Loading configuration from {:?}", path);
    let config = DeployConfig::load_from_file(path)?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration {:?}", path))?;
    Ok(config)
}

fn run_config_command(action: &ConfigCommands) -> Result<()> {
    match action {
        ConfigCommands::Gen { path } => {
            DeployConfig::default().save_to_file(path)?;
            println!("✓ Wrote default configuration to {:?}", path);
        }
        ConfigCommands::Validate { path } => {
            info!("Validating configuration file: {:?}", path);
            DeployConfig::load_from_file(path)?.validate()?;
            println!("✓ Configuration file is valid: {:?}", path);
        }
    }
    Ok(())
}

fn list_installers(runtime: &Runtime, target: InstallTarget, include_none: bool) -> Result<()> {
    for entry in runtime.resolver.list_entries(target, include_none) {
        let state = match entry.availability.reason {
            None if entry.availability.available => "available".to_string(),
            Some(reason) => reason.to_string(),
            None => "unavailable".to_string(),
        };
        println!("{:<32} {:<48} {}", entry.label, entry.token.to_pref(), state);
    }
    Ok(())
}

fn show_status(runtime: &Runtime, package: &str) -> Result<()> {
    match runtime.pm.package_info(package) {
        Some(info) => println!(
            "{}: installed, version {} ({})",
            package,
            info.version_name.as_deref().unwrap_or("?"),
            info.version_code
        ),
        None => println!("{package}: not installed"),
    }
    if runtime.root.has_root_access() {
        let module = runtime.root.is_app_installed(package)?;
        let mounted = runtime.root.is_app_mounted(package)?;
        println!("  root module: {}, mounted: {}", module, mounted);
    }
    Ok(())
}

/// Block until the executor publishes a terminal status.
fn wait_for_completion(status: &Receiver<InstallCompletionStatus>) -> Result<()> {
    loop {
        match status
            .recv()
            .context("Installer stopped without reporting a result")?
        {
            InstallCompletionStatus::InProgress => info!("In progress..."),
            InstallCompletionStatus::Success { package_id } => {
                println!("✓ Done: {}", package_id.unwrap_or_default());
                return Ok(());
            }
            InstallCompletionStatus::Failure { message } => {
                anyhow::bail!("{message}");
            }
        }
    }
}
