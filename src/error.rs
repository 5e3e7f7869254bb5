use std::path::PathBuf;
use thiserror::Error;

/// Typed error for every core operation. Each variant maps onto one of the
/// numeric exit codes reported to callers, so command front-ends can turn
/// any failure into a process status without string matching.
#[derive(Debug, Error)]
pub enum UpdaterError {
    #[error("Bundle \"{0}\" not allowed to be removed")]
    ProtectedBundle(String),

    #[error("bundle \"{0}\" is required by other installed bundles")]
    RequiredBundle(String),

    #[error("bundle \"{0}\" is invalid")]
    InvalidBundle(String),

    #[error("failed to load the manifest of manifests for version {0}")]
    MomLoad(u32),

    #[error("failed to remove {}", .0.display())]
    RemoveFile(PathBuf),

    #[error("failed to recurse the included manifests")]
    RecurseManifest,

    #[error("another instance holds the state lock at {}", .0.display())]
    LockHeld(PathBuf),

    #[error("failed to rename {}", .0.display())]
    RenameFile(PathBuf),

    #[error("bundle \"{0}\" is not tracked on this system")]
    NotTracked(String),

    #[error("failed to load manifest for \"{0}\"")]
    ManifestLoad(String),

    #[error("failed to parse manifest: {0}")]
    ManifestParse(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("unable to reach the update server: {0}")]
    ServerConnection(String),

    #[error("failed to download {0}")]
    Download(String),

    #[error("hash mismatch for {name}: expected {expected}, found {found}")]
    HashMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("failed to extract {}", .0.display())]
    Untar(PathBuf),

    #[error("failed to create directory {}", .0.display())]
    CreateDir(PathBuf),

    #[error("current OS version cannot be determined")]
    CurrentVersionUnknown,

    #[error("signature verification failed for {0}")]
    BadSignature(String),

    #[error("system time is bad: manifest timestamp is in the future")]
    TimeUnknown,

    #[error("failed to download pack for bundle \"{0}\"")]
    PackDownload(String),

    #[error("unable to load client certificate {}", .0.display())]
    BadCert(PathBuf),

    #[error("not enough disk space: {needed} bytes needed, {free} bytes free")]
    DiskSpace { needed: u64, free: u64 },

    #[error("unexpected condition: {0}")]
    Unexpected(String),

    #[error("failed to list directory {}", .0.display())]
    ListDir(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl UpdaterError {
    /// Numeric process exit code for this failure. The values form a closed
    /// set shared with the wider update tooling; `0` is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            UpdaterError::ProtectedBundle(_) | UpdaterError::RequiredBundle(_) => 2,
            UpdaterError::InvalidBundle(_) => 3,
            UpdaterError::MomLoad(_) => 4,
            UpdaterError::RemoveFile(_) => 5,
            UpdaterError::RecurseManifest => 8,
            UpdaterError::LockHeld(_) => 9,
            UpdaterError::RenameFile(_) => 10,
            UpdaterError::NotTracked(_) => 13,
            UpdaterError::ManifestLoad(_) | UpdaterError::ManifestParse(_) => 14,
            UpdaterError::InvalidOption(_) => 15,
            UpdaterError::ServerConnection(_) => 16,
            UpdaterError::Download(_) | UpdaterError::HashMismatch { .. } => 17,
            UpdaterError::Untar(_) => 18,
            UpdaterError::CreateDir(_) => 19,
            UpdaterError::CurrentVersionUnknown => 20,
            UpdaterError::BadSignature(_) => 21,
            UpdaterError::TimeUnknown => 22,
            UpdaterError::PackDownload(_) => 23,
            UpdaterError::BadCert(_) => 24,
            UpdaterError::DiskSpace { .. } => 25,
            UpdaterError::Unexpected(_) | UpdaterError::Io(_) => 27,
            UpdaterError::ListDir(_) => 29,
        }
    }
}
