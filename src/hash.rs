use crate::error::UpdaterError;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::sync::OnceLock;

/// Length of a content hash in hex characters.
pub const HASH_LEN: usize = 64;

/// Content hash of a file, symlink target, or manifest blob.
///
/// Rendered as 64 lowercase hex characters. The all-zero hash marks a
/// tombstone (deleted file record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn from_hex(value: &str) -> Result<Self, UpdaterError> {
        if value.len() != HASH_LEN {
            return Err(UpdaterError::ManifestParse(format!(
                "hash must be exactly {} hex characters, got {}",
                HASH_LEN,
                value.len()
            )));
        }
        if value.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(UpdaterError::ManifestParse(format!(
                "hash must be lowercase hex: {value}"
            )));
        }

        let bytes = hex::decode(value)
            .map_err(|err| UpdaterError::ManifestParse(format!("invalid hash {value}: {err}")))?;
        let mut array = [0u8; 32];
        array.copy_from_slice(&bytes);
        Ok(Hash(array))
    }

    /// Whether this is the distinguished tombstone hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Hash the contents of a regular file, streaming in fixed-size chunks.
    pub fn of_file(path: &Path) -> Result<Self, UpdaterError> {
        let mut file = File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];

        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }

        Ok(Hash(hasher.finalize().into()))
    }

    /// Hash a symlink by its target path.
    pub fn of_link(path: &Path) -> Result<Self, UpdaterError> {
        let target = std::fs::read_link(path)?;
        let mut hasher = Sha256::new();
        hasher.update(target.as_os_str().as_encoded_bytes());
        Ok(Hash(hasher.finalize().into()))
    }

    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for Hash {
    type Err = UpdaterError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Hash::from_hex(value)
    }
}

/// Whether a state-directory entry name is a staged fullfile blob.
pub fn is_fullfile_name(name: &str) -> bool {
    name.len() == HASH_LEN && name.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
}

/// Whether a state-directory entry name is a pack indicator (`pack-*.tar`).
pub fn is_pack_indicator(name: &str) -> bool {
    name.starts_with("pack-") && name.ends_with(".tar")
}

/// Whether a name is any manifest file (`Manifest.MoM`, `Manifest.<bundle>`,
/// hashed variants, signatures).
pub fn is_manifest_name(name: &str) -> bool {
    name.starts_with("Manifest.")
}

/// Whether a name is a hashed per-bundle manifest: `Manifest.<bundle>.<hex>`
/// with exactly one dot inside the bundle position.
pub fn is_hashed_manifest(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN
        .get_or_init(|| Regex::new(r"^Manifest\.[^./]+\.[0-9a-f]{64}$").expect("pattern is static"));
    pattern.is_match(name)
}

/// Whether a state-directory entry name is a delta manifest
/// (`Manifest-<bundle>-delta-from-<v1>-to-<v2>`).
pub fn is_manifest_delta(name: &str) -> bool {
    name.starts_with("Manifest-")
}
