use crate::error::UpdaterError;
use crate::hash::Hash;
use std::collections::HashSet;

/// Component name of a Manifest-of-Manifests.
pub const MOM_COMPONENT: &str = "MoM";

/// Per-record flags decoded from the 4-character manifest token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileFlags {
    pub is_file: bool,
    pub is_dir: bool,
    pub is_link: bool,
    /// The record describes a per-bundle manifest (MoM entry).
    pub is_manifest: bool,
    pub is_deleted: bool,
    pub is_ghosted: bool,
    pub is_experimental: bool,
    pub is_config: bool,
    pub is_state: bool,
    pub is_boot: bool,
    /// Set for records the installer must leave alone (runtime state).
    pub do_not_update: bool,
}

impl FileFlags {
    /// Decode a flag token: `[F/D/L/M/I/.][d/g/e/.][C/s/b/.][r/.]`.
    ///
    /// Position 0 is the record type, position 1 its status, position 2 a
    /// modifier, position 3 a legacy rename marker that is accepted and
    /// dropped.
    pub fn parse(token: &str) -> Result<Self, UpdaterError> {
        let bytes = token.as_bytes();
        if bytes.len() != 4 {
            return Err(UpdaterError::ManifestParse(format!(
                "flag token must be 4 characters: {token:?}"
            )));
        }

        let mut flags = FileFlags::default();

        match bytes[0] {
            b'F' => flags.is_file = true,
            b'D' => flags.is_dir = true,
            b'L' => flags.is_link = true,
            // 'I' marks an iterative manifest descriptor; both kinds name a
            // bundle manifest blob.
            b'M' | b'I' => flags.is_manifest = true,
            b'.' => {}
            other => {
                return Err(UpdaterError::ManifestParse(format!(
                    "unknown type flag {:?} in {token:?}",
                    other as char
                )))
            }
        }

        match bytes[1] {
            b'd' => flags.is_deleted = true,
            b'g' => {
                flags.is_deleted = true;
                flags.is_ghosted = true;
            }
            b'e' => flags.is_experimental = true,
            b'.' => {}
            other => {
                return Err(UpdaterError::ManifestParse(format!(
                    "unknown status flag {:?} in {token:?}",
                    other as char
                )))
            }
        }

        match bytes[2] {
            b'C' => flags.is_config = true,
            b's' => flags.is_state = true,
            b'b' => flags.is_boot = true,
            b'.' => {}
            other => {
                return Err(UpdaterError::ManifestParse(format!(
                    "unknown modifier flag {:?} in {token:?}",
                    other as char
                )))
            }
        }

        match bytes[3] {
            b'r' | b'.' => {}
            other => {
                return Err(UpdaterError::ManifestParse(format!(
                    "unknown rename flag {:?} in {token:?}",
                    other as char
                )))
            }
        }

        Ok(flags)
    }
}

/// One line of a manifest body: a file, directory, symlink, or (in a MoM)
/// a per-bundle manifest descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Absolute path under the target root, or the bundle name for MoM
    /// entries.
    pub filename: String,
    pub hash: Hash,
    /// Version in which this record last changed.
    pub last_change: u32,
    pub flags: FileFlags,
}

impl FileRecord {
    pub fn is_tombstone(&self) -> bool {
        self.flags.is_deleted
    }
}

/// A parsed manifest: either a per-bundle manifest or the MoM, whose file
/// list names every bundle manifest for a version.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub component: String,
    pub format: u32,
    pub version: u32,
    pub previous: u32,
    pub filecount: u64,
    /// Server-side creation time, seconds since the epoch.
    pub timestamp: i64,
    pub contentsize: u64,
    pub includes: Vec<String>,
    /// Body records in server order; the order feeds content hashing and is
    /// never resorted here.
    pub files: Vec<FileRecord>,
    /// Per-bundle manifests attached by the dependency engine.
    pub submanifests: Vec<Manifest>,
    /// Loaded from a local mix overlay rather than the content server.
    pub is_mix: bool,
}

impl Manifest {
    /// Parse the textual manifest format.
    ///
    /// The format is a `MANIFEST\t<format>` line, `key:\tvalue` header lines
    /// terminated by a blank line, then tab-separated
    /// `<flags>\t<hash>\t<version>\t<filename>` tuples.
    pub fn parse(component: &str, text: &str) -> Result<Self, UpdaterError> {
        let mut lines = text.lines();

        let first = lines
            .next()
            .ok_or_else(|| UpdaterError::ManifestParse("empty manifest".to_string()))?;
        let format = first
            .strip_prefix("MANIFEST\t")
            .and_then(|value| value.parse::<u32>().ok())
            .ok_or_else(|| {
                UpdaterError::ManifestParse(format!("bad MANIFEST header line: {first:?}"))
            })?;

        let mut manifest = Manifest {
            component: component.to_string(),
            format,
            ..Manifest::default()
        };

        // header
        for line in lines.by_ref() {
            if line.is_empty() {
                break;
            }
            let Some((key, value)) = line.split_once(":\t") else {
                return Err(UpdaterError::ManifestParse(format!(
                    "bad header line: {line:?}"
                )));
            };
            match key {
                "version" => manifest.version = parse_number(key, value)?,
                "previous" => manifest.previous = parse_number(key, value)?,
                "filecount" => manifest.filecount = parse_number(key, value)?,
                "timestamp" => manifest.timestamp = parse_number(key, value)?,
                "contentsize" => manifest.contentsize = parse_number(key, value)?,
                "includes" => manifest.includes.push(value.to_string()),
                // later formats may add header keys; skip what we don't know
                other => tracing::debug!(key = other, "ignoring unknown manifest header"),
            }
        }

        // body
        let mut seen: HashSet<&str> = HashSet::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let mut fields = line.splitn(4, '\t');
            let (Some(token), Some(hash), Some(version), Some(filename)) = (
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
            ) else {
                return Err(UpdaterError::ManifestParse(format!(
                    "bad file record line: {line:?}"
                )));
            };

            let flags = FileFlags::parse(token)?;
            let hash = Hash::from_hex(hash)?;
            let last_change: u32 = parse_number("file version", version)?;

            if filename.is_empty() {
                return Err(UpdaterError::ManifestParse("empty filename".to_string()));
            }
            if !flags.is_manifest && !filename.starts_with('/') {
                return Err(UpdaterError::ManifestParse(format!(
                    "filename is not rooted at /: {filename:?}"
                )));
            }
            if flags.is_deleted && !hash.is_zero() {
                return Err(UpdaterError::ManifestParse(format!(
                    "deleted record {filename:?} must carry the zero hash"
                )));
            }

            manifest.files.push(FileRecord {
                filename: filename.to_string(),
                hash,
                last_change,
                flags,
            });
        }
        for record in &manifest.files {
            if !seen.insert(record.filename.as_str()) {
                return Err(UpdaterError::ManifestParse(format!(
                    "duplicate filename {:?}",
                    record.filename
                )));
            }
        }

        Ok(manifest)
    }

    /// Find a record by exact filename (or bundle name, for a MoM).
    pub fn find_file(&self, filename: &str) -> Option<&FileRecord> {
        self.files.iter().find(|record| record.filename == filename)
    }

    /// MoM lookup: the descriptor of a bundle manifest, skipping tombstoned
    /// bundles.
    pub fn find_bundle(&self, name: &str) -> Option<&FileRecord> {
        self.files
            .iter()
            .find(|record| record.flags.is_manifest && !record.flags.is_deleted && record.filename == name)
    }

    /// An attached submanifest by component name.
    pub fn submanifest(&self, component: &str) -> Option<&Manifest> {
        self.submanifests
            .iter()
            .find(|manifest| manifest.component == component)
    }

    pub fn is_mom(&self) -> bool {
        self.component == MOM_COMPONENT
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, UpdaterError> {
    value
        .parse::<T>()
        .map_err(|_| UpdaterError::ManifestParse(format!("bad {key} value: {value:?}")))
}
