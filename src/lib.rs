// Public API
pub mod cli;
pub mod commands;

// Core domain modules
mod config;
mod consolidate;
mod download;
mod error;
mod hash;
mod install;
mod manifest;
mod state;
mod store;
mod subscription;
mod transport;
mod ui;

// Re-export main types
pub use config::Config;
pub use consolidate::FileRef;
pub use error::UpdaterError;
pub use hash::{Hash, HASH_LEN};
pub use manifest::{FileFlags, FileRecord, Manifest};
pub use subscription::{AddStatus, Subscription};
pub use transport::{DownloadJob, Transport, TransportError};
