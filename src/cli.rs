use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::types::InstallTarget;

/// patchdeploy - install patched APKs through the best available installer
#[derive(Parser)]
#[command(name = "patchdeploy")]
#[command(about = "Resolve and run installers for patched Android apps")]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults are used when omitted)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Dry-run mode: log mutating root commands instead of running them.
    ///
    /// Probes (root check, mount state, package lookups) still run so the
    /// preview is realistic.
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List selectable installers for a target
    Installers {
        #[arg(short, long, default_value = "patcher")]
        target: InstallTarget,
        /// Also list the terminal "None" choice
        #[arg(long)]
        include_none: bool,
    },
    /// Show the installer plan that would be used, without installing
    Resolve {
        #[arg(short, long, default_value = "patcher")]
        target: InstallTarget,
        /// Patched APK
        #[arg(short, long)]
        apk: PathBuf,
        /// Expected package id
        #[arg(short, long)]
        package: String,
    },
    /// Install a patched APK
    Install {
        #[arg(short, long, default_value = "patcher")]
        target: InstallTarget,
        /// Patched APK
        #[arg(short, long)]
        apk: PathBuf,
        /// Expected package id
        #[arg(short, long)]
        package: String,
        /// Unpatched APK to install underneath a root mount
        #[arg(long)]
        stock: Option<PathBuf>,
        /// Version shown in the module metadata
        #[arg(long, default_value = "unknown")]
        version: String,
        /// Version code of the patched APK, used when it cannot be read from the archive
        #[arg(long)]
        version_code: Option<u64>,
        /// App label shown in the module metadata
        #[arg(long)]
        label: Option<String>,
        /// Prefer the root mount installer for this install
        #[arg(long)]
        mount: bool,
        /// Uninstall the current app first, skipping the downgrade check
        #[arg(long)]
        reinstall: bool,
    },
    /// Uninstall an app or remove its root module
    Uninstall {
        #[arg(short, long)]
        package: String,
    },
    /// Bind-mount an installed root module
    Mount {
        #[arg(short, long)]
        package: String,
    },
    /// Remove the bind mount of a root module
    Unmount {
        #[arg(short, long)]
        package: String,
    },
    /// Show install and mount state of a package
    Status {
        #[arg(short, long)]
        package: String,
    },
    /// List root modules written by this tool
    Modules,
    /// Configuration file helpers
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Write a configuration file with default values
    Gen {
        /// Output path
        path: PathBuf,
    },
    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        path: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
