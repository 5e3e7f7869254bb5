use crate::config::Config;
use crate::error::UpdaterError;
use crate::hash::Hash;
use crate::manifest::{FileRecord, Manifest, MOM_COMPONENT};
use crate::transport::Transport;
use chrono::Utc;
use std::fs;
use std::path::Path;
use std::process::Command;

/// Manifest timestamps this far ahead of the local clock mean the system
/// time cannot be trusted.
const CLOCK_SKEW_TOLERANCE: i64 = 24 * 60 * 60;

/// Fetch-or-cache layer for manifests.
///
/// Manifests land in the per-version directory under the state root and
/// are validated against the MoM entry hash before being handed out, so
/// the MoM stays the single root of trust for a version.
pub struct ManifestStore<'a> {
    config: &'a Config,
    transport: &'a dyn Transport,
}

impl<'a> ManifestStore<'a> {
    pub fn new(config: &'a Config, transport: &'a dyn Transport) -> Self {
        Self { config, transport }
    }

    pub fn config(&self) -> &Config {
        self.config
    }

    /// Load the Manifest-of-Manifests for a version, fetching it when no
    /// cached copy exists. A local mix overlay for the same version wins
    /// over the network copy.
    pub fn load_mom(&self, version: u32) -> Result<Manifest, UpdaterError> {
        let mix_path = self.config.mix_mom_path(version);
        if mix_path.exists() {
            tracing::debug!(version, "using mix overlay MoM");
            let mut mom = self.parse_manifest_file(MOM_COMPONENT, &mix_path)?;
            mom.is_mix = true;
            return self.finish_mom(mom, version);
        }

        let local = self.config.mom_path(version);
        if !local.exists() {
            self.transport
                .get(&self.config.mom_url(version), &local)
                .map_err(|err| {
                    tracing::warn!(version, error = %err, "MoM fetch failed");
                    UpdaterError::MomLoad(version)
                })?;

            if self.config.sigcheck {
                let sig = local.with_file_name("Manifest.MoM.sig");
                self.transport
                    .get(&self.config.mom_sig_url(version), &sig)
                    .map_err(|_| UpdaterError::BadSignature(format!("Manifest.MoM for {version}")))?;
                verify_signature(self.config, &local, &sig)?;
            }
        }

        let mom = self.parse_manifest_file(MOM_COMPONENT, &local)?;
        self.finish_mom(mom, version)
    }

    fn finish_mom(&self, mom: Manifest, version: u32) -> Result<Manifest, UpdaterError> {
        if mom.version != version {
            tracing::warn!(expected = version, found = mom.version, "MoM version mismatch");
            return Err(UpdaterError::MomLoad(version));
        }
        if mom.timestamp > Utc::now().timestamp() + CLOCK_SKEW_TOLERANCE {
            return Err(UpdaterError::TimeUnknown);
        }
        Ok(mom)
    }

    /// Load the per-bundle manifest named by a MoM entry, fetching and
    /// content-verifying it against the entry hash.
    pub fn load_bundle_manifest(&self, entry: &FileRecord) -> Result<Manifest, UpdaterError> {
        let component = entry.filename.as_str();
        let version = entry.last_change;
        let hashed = self
            .config
            .hashed_manifest_path(version, component, &entry.hash);

        if hashed.exists() {
            // a cached copy is only trusted while it still hashes correctly
            match Hash::of_file(&hashed) {
                Ok(found) if found == entry.hash => {
                    return self.parse_manifest_file(component, &hashed)
                }
                _ => {
                    tracing::warn!(component, "cached manifest corrupt, refetching");
                    fs::remove_file(&hashed).ok();
                }
            }
        }

        self.fetch_bundle_manifest(entry, &hashed)?;

        let found = Hash::of_file(&hashed)?;
        if found != entry.hash {
            fs::remove_file(&hashed).ok();
            tracing::warn!(component, expected = %entry.hash, found = %found, "manifest hash mismatch");
            return Err(UpdaterError::ManifestLoad(component.to_string()));
        }

        // keep the plain name beside the hashed one; the garbage collector
        // preserves it for the current version
        let plain = self.config.manifest_path(version, component);
        if !plain.exists() && fs::hard_link(&hashed, &plain).is_err() {
            fs::copy(&hashed, &plain).ok();
        }

        self.parse_manifest_file(component, &hashed)
    }

    fn fetch_bundle_manifest(&self, entry: &FileRecord, dest: &Path) -> Result<(), UpdaterError> {
        let component = entry.filename.as_str();
        let version = entry.last_change;

        let hashed_url = self
            .config
            .hashed_manifest_url(version, component, &entry.hash);
        match self.transport.get(&hashed_url, dest) {
            Ok(()) => return Ok(()),
            Err(err) if err.is_not_found() => {
                tracing::debug!(component, "no hashed manifest on server, trying plain name");
            }
            Err(err) => {
                tracing::warn!(component, error = %err, "manifest fetch failed");
                return Err(UpdaterError::ManifestLoad(component.to_string()));
            }
        }

        self.transport
            .get(&self.config.manifest_url(version, component), dest)
            .map_err(|err| {
                tracing::warn!(component, error = %err, "manifest fetch failed");
                UpdaterError::ManifestLoad(component.to_string())
            })
    }

    fn parse_manifest_file(&self, component: &str, path: &Path) -> Result<Manifest, UpdaterError> {
        let text = fs::read_to_string(path)?;
        Manifest::parse(component, &text)
    }
}

/// Verify a detached signature with the system OpenSSL against the pinned
/// certificate. Only called when signature enforcement is on.
fn verify_signature(config: &Config, content: &Path, signature: &Path) -> Result<(), UpdaterError> {
    let cert = config.cert_path();
    let status = Command::new("openssl")
        .arg("smime")
        .arg("-verify")
        .arg("-in")
        .arg(signature)
        .arg("-inform")
        .arg("DER")
        .arg("-content")
        .arg(content)
        .arg("-CAfile")
        .arg(&cert)
        .arg("-purpose")
        .arg("any")
        .status()
        .map_err(|err| UpdaterError::Unexpected(format!("failed to run openssl: {err}")))?;

    if !status.success() {
        return Err(UpdaterError::BadSignature(
            content.file_name().unwrap_or_default().to_string_lossy().into_owned(),
        ));
    }
    Ok(())
}
