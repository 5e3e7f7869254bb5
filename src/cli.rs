use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// OS software updater - install and remove content bundles
///
/// bundlectl composes the installed system from named bundles. Every bundle
/// is a manifest of files; bundlectl downloads manifests and content from
/// the update server, verifies everything against content hashes, and swaps
/// files into the live tree atomically.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Use PATH as the target for the install (default: /)
    #[arg(long, global = true, value_name = "PATH")]
    pub path: Option<PathBuf>,

    /// Use DIR as the writable state directory
    #[arg(long = "statedir", global = true, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,

    /// Base URL for both version and content downloads
    #[arg(long, global = true, value_name = "URL")]
    pub url: Option<String>,

    /// URL for content file downloads
    #[arg(long = "contenturl", global = true, value_name = "URL")]
    pub content_url: Option<String>,

    /// URL for version string downloads
    #[arg(long = "versionurl", global = true, value_name = "URL")]
    pub version_url: Option<String>,

    /// Manifest format to use
    #[arg(long, global = true, value_name = "N")]
    pub format: Option<u32>,

    /// Do not verify manifest signatures
    #[arg(long = "nosigcheck", global = true)]
    pub nosigcheck: bool,

    /// Maximum number of download retries
    #[arg(long, global = true, value_name = "N")]
    pub max_retries: Option<u32>,

    /// Initial delay between download retries in seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub retry_delay: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install one or more bundles
    #[command(name = "bundle-add")]
    BundleAdd {
        /// Bundles to install
        #[arg(value_name = "BUNDLE", required = true)]
        bundles: Vec<String>,

        /// Do not check free disk space before downloading
        #[arg(long)]
        skip_diskspace_check: bool,
    },

    /// Uninstall one or more bundles
    #[command(name = "bundle-remove")]
    BundleRemove {
        /// Bundles to remove
        #[arg(value_name = "BUNDLE", required = true)]
        bundles: Vec<String>,
    },

    /// List installed bundles
    #[command(name = "bundle-list")]
    BundleList {
        /// List all installable bundles instead
        #[arg(long)]
        all: bool,
    },

    /// Show bundle dependency information
    #[command(name = "bundle-info")]
    BundleInfo {
        /// Bundle to inspect
        #[arg(value_name = "BUNDLE")]
        bundle: String,

        /// Show the bundles this bundle includes
        #[arg(long, conflicts_with = "requires")]
        dependencies: bool,

        /// Show the installed bundles that require this bundle
        #[arg(long)]
        requires: bool,
    },

    /// Remove cached content from the state directory
    Clean {
        /// Remove every cached artifact, not just unreferenced ones
        #[arg(long)]
        all: bool,

        /// List what would be removed without removing anything
        #[arg(long = "dry-run")]
        dry_run: bool,
    },
}
