use crate::error::UpdaterError;
use crate::hash::Hash;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

pub const DEFAULT_CONTENT_URL: &str = "https://cdn.download.bundlectl.org/update";
pub const DEFAULT_VERSION_URL: &str = "https://cdn.download.bundlectl.org/update";
pub const DEFAULT_STATE_DIR: &str = "/var/lib/bundlectl";
pub const DEFAULT_FORMAT: u32 = 1;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: u64 = 10;

/// Relative path of the image-installed tracking seed under the target root.
pub const IMAGE_TRACKING_DIR: &str = "usr/share/clear/bundles";

/// Runtime configuration threaded through every core API.
///
/// Replaces ambient process globals: the command front-end constructs one
/// record during init (defaults, then the on-disk config file, then CLI
/// overrides) and the core only ever reads it. Two cores can run in-process
/// against distinct roots, which the tests rely on.
#[derive(Debug, Clone)]
pub struct Config {
    /// Installation root of the live tree (normally `/`).
    pub path_prefix: PathBuf,
    /// Writable state root for manifests, staged content and tracking files.
    pub state_dir: PathBuf,
    pub content_url: String,
    pub version_url: String,
    /// Manifest format the client understands.
    pub format: u32,
    pub max_retries: u32,
    /// Initial retry backoff in seconds.
    pub retry_delay: u64,
    pub skip_diskspace_check: bool,
    /// Verify detached manifest signatures.
    pub sigcheck: bool,
    /// Command run after an install touches the live tree.
    pub post_update_hook: Option<PathBuf>,
}

/// On-disk configuration overlay, loaded from
/// `<path_prefix>/etc/bundlectl/config.toml` when present.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    state_dir: Option<PathBuf>,
    content_url: Option<String>,
    version_url: Option<String>,
    format: Option<u32>,
    max_retries: Option<u32>,
    retry_delay: Option<u64>,
    sigcheck: Option<bool>,
    post_update_hook: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path_prefix: PathBuf::from("/"),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            content_url: DEFAULT_CONTENT_URL.to_string(),
            version_url: DEFAULT_VERSION_URL.to_string(),
            format: DEFAULT_FORMAT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            skip_diskspace_check: false,
            sigcheck: false,
            post_update_hook: None,
        }
    }
}

impl Config {
    /// Build a configuration for the given installation root, applying the
    /// on-disk overlay if one exists.
    pub fn load(path_prefix: Option<&Path>) -> Result<Self, UpdaterError> {
        let mut config = Config::default();
        if let Some(prefix) = path_prefix {
            config.path_prefix = prefix.to_path_buf();
        }

        let overlay_path = config.path_prefix.join("etc/bundlectl/config.toml");
        if overlay_path.exists() {
            let contents = fs::read_to_string(&overlay_path)?;
            let overlay: ConfigFile = toml::from_str(&contents).map_err(|err| {
                UpdaterError::InvalidOption(format!(
                    "failed to parse {}: {err}",
                    overlay_path.display()
                ))
            })?;
            config.apply_file(overlay);
        }

        Ok(config)
    }

    fn apply_file(&mut self, overlay: ConfigFile) {
        if let Some(state_dir) = overlay.state_dir {
            self.state_dir = state_dir;
        }
        if let Some(content_url) = overlay.content_url {
            self.content_url = content_url;
        }
        if let Some(version_url) = overlay.version_url {
            self.version_url = version_url;
        }
        if let Some(format) = overlay.format {
            self.format = format;
        }
        if let Some(max_retries) = overlay.max_retries {
            self.max_retries = max_retries;
        }
        if let Some(retry_delay) = overlay.retry_delay {
            self.retry_delay = retry_delay;
        }
        if let Some(sigcheck) = overlay.sigcheck {
            self.sigcheck = sigcheck;
        }
        if let Some(hook) = overlay.post_update_hook {
            self.post_update_hook = Some(hook);
        }
    }

    /// Validate the endpoint URLs once all overrides are applied.
    pub fn validate(&self) -> Result<(), UpdaterError> {
        for value in [&self.content_url, &self.version_url] {
            let url = Url::parse(value)
                .map_err(|err| UpdaterError::InvalidOption(format!("invalid URL {value}: {err}")))?;
            if !matches!(url.scheme(), "http" | "https" | "file") {
                return Err(UpdaterError::InvalidOption(format!(
                    "unsupported URL scheme in {value}"
                )));
            }
        }
        Ok(())
    }

    /// Join an absolute manifest filename onto the live tree root.
    pub fn target_path(&self, filename: &str) -> PathBuf {
        self.path_prefix.join(filename.trim_start_matches('/'))
    }

    pub fn staged_dir(&self) -> PathBuf {
        self.state_dir.join("staged")
    }

    pub fn staged_path(&self, hash: &Hash) -> PathBuf {
        self.staged_dir().join(hash.to_string())
    }

    /// Scratch directory for in-flight archive downloads.
    pub fn download_dir(&self) -> PathBuf {
        self.state_dir.join("download")
    }

    pub fn version_dir(&self, version: u32) -> PathBuf {
        self.state_dir.join(version.to_string())
    }

    pub fn mom_path(&self, version: u32) -> PathBuf {
        self.version_dir(version).join("Manifest.MoM")
    }

    pub fn mix_mom_path(&self, version: u32) -> PathBuf {
        self.state_dir
            .join("mix")
            .join(version.to_string())
            .join("Manifest.MoM")
    }

    pub fn manifest_path(&self, version: u32, component: &str) -> PathBuf {
        self.version_dir(version).join(format!("Manifest.{component}"))
    }

    pub fn hashed_manifest_path(&self, version: u32, component: &str, hash: &Hash) -> PathBuf {
        self.version_dir(version)
            .join(format!("Manifest.{component}.{hash}"))
    }

    pub fn tracking_dir(&self) -> PathBuf {
        self.state_dir.join("bundles")
    }

    pub fn tracking_path(&self, bundle: &str) -> PathBuf {
        self.tracking_dir().join(bundle)
    }

    /// Tracking seed shipped inside the OS image.
    pub fn image_tracking_dir(&self) -> PathBuf {
        self.path_prefix.join(IMAGE_TRACKING_DIR)
    }

    pub fn pack_indicator_path(&self, bundle: &str, from: u32, to: u32) -> PathBuf {
        self.state_dir.join(format!("pack-{bundle}-{from}-to-{to}.tar"))
    }

    pub fn version_marker_path(&self) -> PathBuf {
        self.state_dir.join("version")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("lock")
    }

    pub fn cert_path(&self) -> PathBuf {
        self.path_prefix.join("etc/bundlectl/cert.pem")
    }

    pub fn alias_dir(&self) -> PathBuf {
        self.path_prefix.join("usr/share/bundlectl/alias.d")
    }

    pub fn os_release_path(&self) -> PathBuf {
        self.path_prefix.join("usr/lib/os-release")
    }

    pub fn etc_os_release_path(&self) -> PathBuf {
        self.path_prefix.join("etc/os-release")
    }

    pub fn mom_url(&self, version: u32) -> String {
        format!("{}/{}/Manifest.MoM", self.content_url, version)
    }

    pub fn mom_sig_url(&self, version: u32) -> String {
        format!("{}/{}/Manifest.MoM.sig", self.content_url, version)
    }

    pub fn manifest_url(&self, version: u32, component: &str) -> String {
        format!("{}/{}/Manifest.{}", self.content_url, version, component)
    }

    pub fn hashed_manifest_url(&self, version: u32, component: &str, hash: &Hash) -> String {
        format!("{}/{}/Manifest.{}.{}", self.content_url, version, component, hash)
    }

    pub fn fullfile_url(&self, version: u32, hash: &Hash) -> String {
        format!("{}/{}/files/{}.tar", self.content_url, version, hash)
    }

    pub fn pack_url(&self, to: u32, bundle: &str, from: u32) -> String {
        format!("{}/{}/pack-{}-from-{}.tar", self.content_url, to, bundle, from)
    }
}
