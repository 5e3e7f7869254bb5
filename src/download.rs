use crate::config::Config;
use crate::consolidate::FileRef;
use crate::error::UpdaterError;
use crate::hash::Hash;
use crate::manifest::Manifest;
use crate::subscription::Subscription;
use crate::transport::{DownloadJob, Transport, TransportError};
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::time::Duration;

const DELAY_MULTIPLIER: u64 = 2;
const MAX_DELAY: u64 = 60;

/// Work lists at or below this size skip the pack optimisation and go
/// straight to fullfiles.
pub const PACK_THRESHOLD: usize = 10;

#[derive(Debug, Default)]
pub struct DownloadStats {
    pub fetched: usize,
    pub already_staged: usize,
}

/// Whether a staged blob satisfies a file record: present, right type,
/// right content hash. Directories only need to exist.
pub fn staged_blob_ok(config: &Config, file: &FileRef) -> bool {
    let path = config.staged_path(&file.record.hash);
    let Ok(meta) = fs::symlink_metadata(&path) else {
        return false;
    };

    if file.record.flags.is_dir {
        return meta.is_dir();
    }
    let computed = if file.record.flags.is_link {
        if !meta.file_type().is_symlink() {
            return false;
        }
        Hash::of_link(&path)
    } else {
        if !meta.is_file() {
            return false;
        }
        Hash::of_file(&path)
    };
    matches!(computed, Ok(found) if found == file.record.hash)
}

/// Re-verify already staged blobs for the given work list, deleting any
/// whose content no longer matches its name. Hashes absent from the staged
/// directory are fine; the fullfile fetch will bring them in.
pub fn revalidate_staged(config: &Config, files: &[FileRef]) -> Result<usize, UpdaterError> {
    let mut dropped = 0;
    for file in dedupe_by_hash(files) {
        let path = config.staged_path(&file.record.hash);
        if fs::symlink_metadata(&path).is_err() {
            continue;
        }
        if !staged_blob_ok(config, file) {
            tracing::warn!(hash = %file.record.hash, "staged blob failed verification, discarding");
            remove_staged_entry(&path)?;
            dropped += 1;
        }
    }
    Ok(dropped)
}

/// Materialise every hash referenced by the work list under the staged
/// directory.
///
/// Demands are deduplicated so each hash is fetched at most once per run;
/// the batch is handed to the transport for concurrent transfer, unpacked,
/// verified, and failures are retried with exponential backoff until the
/// retry budget runs out.
pub fn download_fullfiles(
    config: &Config,
    transport: &dyn Transport,
    files: &[FileRef],
) -> Result<DownloadStats, UpdaterError> {
    fs::create_dir_all(config.staged_dir())?;
    fs::create_dir_all(config.download_dir())?;

    let mut stats = DownloadStats::default();
    let mut pending: Vec<&FileRef> = Vec::new();
    for file in dedupe_by_hash(files) {
        // directories are materialised by the installer, not downloaded
        if file.record.flags.is_dir {
            continue;
        }
        if staged_blob_ok(config, file) {
            stats.already_staged += 1;
        } else {
            pending.push(file);
        }
    }

    let mut attempt = 0u32;
    let mut delay = config.retry_delay;
    while !pending.is_empty() {
        let jobs: Vec<DownloadJob> = pending
            .iter()
            .map(|file| DownloadJob {
                url: config.fullfile_url(file.record.last_change, &file.record.hash),
                dest: config
                    .download_dir()
                    .join(format!("{}.tar", file.record.hash)),
            })
            .collect();

        let by_hash: HashMap<String, &FileRef> = pending
            .iter()
            .map(|file| (file.record.hash.to_string(), *file))
            .collect();

        let mut failed: Vec<&FileRef> = Vec::new();
        let mut fatal: Option<UpdaterError> = None;
        for (job, result) in transport.get_batch(jobs) {
            let hash_name = job
                .dest
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            let Some(file) = by_hash.get(&hash_name) else {
                continue;
            };

            match result {
                Ok(()) => {
                    let unpacked = unpack_archive(&job.dest, &config.staged_dir()).is_ok();
                    fs::remove_file(&job.dest).ok();
                    if unpacked && staged_blob_ok(config, file) {
                        stats.fetched += 1;
                    } else {
                        remove_staged_entry(&config.staged_path(&file.record.hash)).ok();
                        tracing::warn!(hash = %file.record.hash, "fullfile failed verification");
                        failed.push(file);
                    }
                }
                Err(TransportError::NotFound(url)) | Err(TransportError::Forbidden(url)) => {
                    fatal.get_or_insert(UpdaterError::Download(url));
                }
                Err(TransportError::LocalIo(err)) => {
                    fatal.get_or_insert(UpdaterError::Io(err));
                }
                Err(TransportError::Timeout(url)) | Err(TransportError::Network(url)) => {
                    tracing::debug!(url = %url, "fullfile transfer failed, will retry");
                    failed.push(file);
                }
                Err(_) => failed.push(file),
            }
        }

        if let Some(error) = fatal {
            return Err(error);
        }
        if failed.is_empty() {
            break;
        }

        attempt += 1;
        if attempt > config.max_retries {
            let first = config.fullfile_url(failed[0].record.last_change, &failed[0].record.hash);
            return Err(UpdaterError::ServerConnection(first));
        }
        tracing::info!(remaining = failed.len(), attempt, "retrying fullfile downloads");
        std::thread::sleep(Duration::from_secs(delay));
        delay = (delay * DELAY_MULTIPLIER).min(MAX_DELAY);
        pending = failed;
    }

    Ok(stats)
}

/// Fetch the delta pack for each subscribed bundle and unpack it into the
/// state directory, leaving the empty indicator file behind.
///
/// Packs are an optimisation: any failure is logged and the caller falls
/// back to fullfile downloads.
pub fn download_packs(
    config: &Config,
    transport: &dyn Transport,
    subs: &[Subscription],
    mom: &Manifest,
    from: u32,
) -> usize {
    let mut applied = 0;

    for sub in subs {
        let to = mom.version;
        let indicator = config.pack_indicator_path(&sub.component, from, to);
        if indicator.exists() {
            tracing::debug!(bundle = %sub.component, "pack already applied");
            continue;
        }

        let url = config.pack_url(to, &sub.component, from);
        let dest = config
            .download_dir()
            .join(format!("pack-{}-from-{}.tar", sub.component, from));
        if let Err(err) = fs::create_dir_all(config.download_dir()) {
            tracing::warn!(error = %err, "cannot create download directory");
            return applied;
        }

        match transport.get(&url, &dest) {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                tracing::debug!(bundle = %sub.component, "no pack published");
                continue;
            }
            Err(err) => {
                tracing::warn!(bundle = %sub.component, error = %err, "pack download failed");
                continue;
            }
        }

        let unpacked = unpack_archive(&dest, &config.state_dir);
        fs::remove_file(&dest).ok();
        match unpacked {
            Ok(()) => {
                if let Err(err) = fs::write(&indicator, b"") {
                    tracing::debug!(error = %err, "cannot write pack indicator");
                }
                applied += 1;
            }
            Err(err) => {
                tracing::warn!(bundle = %sub.component, error = %err, "pack unpack failed");
            }
        }
    }

    applied
}

/// Sum of the projected content sizes of a set of manifests, used for the
/// pre-download disk space check.
pub fn required_space(manifests: &[Manifest]) -> u64 {
    manifests.iter().map(|manifest| manifest.contentsize).sum()
}

/// Refuse to start a download that cannot fit. The requirement includes a
/// 10% margin over the manifest content size.
pub fn check_disk_space(config: &Config, needed: u64) -> Result<(), UpdaterError> {
    if config.skip_diskspace_check {
        return Ok(());
    }
    let probe = if config.path_prefix.exists() {
        config.path_prefix.clone()
    } else {
        std::path::PathBuf::from("/")
    };
    let free = fs2::available_space(&probe)?;
    let needed = needed + needed / 10;
    if needed > free {
        return Err(UpdaterError::DiskSpace { needed, free });
    }
    Ok(())
}

/// Unpack a tar archive, transparently handling gzip compression.
fn unpack_archive(archive: &Path, dest: &Path) -> Result<(), UpdaterError> {
    let mut magic = [0u8; 2];
    let mut probe = File::open(archive)?;
    let gzipped = probe.read(&mut magic).unwrap_or(0) == 2 && magic == [0x1f, 0x8b];
    drop(probe);

    let file = File::open(archive)?;
    let result = if gzipped {
        tar::Archive::new(GzDecoder::new(file)).unpack(dest)
    } else {
        tar::Archive::new(file).unpack(dest)
    };
    result.map_err(|err| {
        tracing::debug!(archive = %archive.display(), error = %err, "unpack failed");
        UpdaterError::Untar(archive.to_path_buf())
    })
}

fn remove_staged_entry(path: &Path) -> Result<(), UpdaterError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(_) => {}
    }
    Ok(())
}

/// First record per distinct hash, in input order. Tombstones carry the
/// zero hash and never reach the pipeline.
fn dedupe_by_hash(files: &[FileRef]) -> Vec<&FileRef> {
    let mut seen = std::collections::HashSet::new();
    files
        .iter()
        .filter(|file| !file.record.flags.is_deleted)
        .filter(|file| seen.insert(file.record.hash))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{FileFlags, FileRecord};
    use crate::store::testing::FakeServer;
    use crate::transport::FileTransport;
    use tempfile::TempDir;

    fn config_for(temp: &TempDir, server: &FakeServer) -> Config {
        let mut config = Config::default();
        config.state_dir = temp.path().join("state");
        config.path_prefix = temp.path().join("target");
        config.content_url = server.content_url();
        config.version_url = server.content_url();
        config.retry_delay = 0;
        config.max_retries = 1;
        config
    }

    fn file_ref(content: &[u8], version: u32, filename: &str) -> FileRef {
        FileRef {
            bundle: "test-bundle".to_string(),
            record: FileRecord {
                filename: filename.to_string(),
                hash: Hash::of_bytes(content),
                last_change: version,
                flags: FileFlags {
                    is_file: true,
                    ..FileFlags::default()
                },
            },
        }
    }

    #[test]
    fn fullfiles_are_fetched_unpacked_and_verified() {
        let temp = TempDir::new().unwrap();
        let server = FakeServer::new(temp.path().join("www"));
        let config = config_for(&temp, &server);

        let a = file_ref(b"alpha", 30, "/usr/bin/a");
        let b = file_ref(b"beta", 30, "/usr/bin/b");
        server.write_fullfile_tar(30, &a.record.hash, b"alpha");
        server.write_fullfile_tar(30, &b.record.hash, b"beta");

        let stats =
            download_fullfiles(&config, &FileTransport, &[a.clone(), b.clone()]).unwrap();
        assert_eq!(stats.fetched, 2);
        assert_eq!(stats.already_staged, 0);
        assert_eq!(
            fs::read(config.staged_path(&a.record.hash)).unwrap(),
            b"alpha"
        );

        // a second run is a no-op: one fetch per hash per run, and the
        // staged cache satisfies later runs
        let stats = download_fullfiles(&config, &FileTransport, &[a, b]).unwrap();
        assert_eq!(stats.fetched, 0);
        assert_eq!(stats.already_staged, 2);
    }

    #[test]
    fn duplicate_hashes_collapse_to_one_fetch() {
        let temp = TempDir::new().unwrap();
        let server = FakeServer::new(temp.path().join("www"));
        let config = config_for(&temp, &server);

        let a = file_ref(b"same", 30, "/usr/bin/a");
        let mut b = file_ref(b"same", 30, "/usr/bin/b");
        b.bundle = "other".to_string();
        server.write_fullfile_tar(30, &a.record.hash, b"same");

        let stats = download_fullfiles(&config, &FileTransport, &[a, b]).unwrap();
        assert_eq!(stats.fetched, 1);
    }

    #[test]
    fn missing_fullfile_is_fatal() {
        let temp = TempDir::new().unwrap();
        let server = FakeServer::new(temp.path().join("www"));
        let config = config_for(&temp, &server);

        let a = file_ref(b"alpha", 30, "/usr/bin/a");
        let err = download_fullfiles(&config, &FileTransport, &[a]).unwrap_err();
        assert!(matches!(err, UpdaterError::Download(_)));
    }

    #[test]
    fn corrupt_server_blob_is_discarded() {
        let temp = TempDir::new().unwrap();
        let server = FakeServer::new(temp.path().join("www"));
        let config = config_for(&temp, &server);

        let a = file_ref(b"expected", 30, "/usr/bin/a");
        // server serves different bytes under the expected hash name
        server.write_fullfile_tar(30, &a.record.hash, b"tampered");

        let err = download_fullfiles(&config, &FileTransport, &[a.clone()]).unwrap_err();
        assert!(matches!(err, UpdaterError::ServerConnection(_)));
        assert!(!config.staged_path(&a.record.hash).exists());
    }

    #[test]
    fn revalidate_drops_corrupt_staged_blobs() {
        let temp = TempDir::new().unwrap();
        let server = FakeServer::new(temp.path().join("www"));
        let config = config_for(&temp, &server);
        fs::create_dir_all(config.staged_dir()).unwrap();

        let good = file_ref(b"good", 30, "/usr/bin/good");
        let bad = file_ref(b"bad", 30, "/usr/bin/bad");
        let absent = file_ref(b"absent", 30, "/usr/bin/absent");
        fs::write(config.staged_path(&good.record.hash), b"good").unwrap();
        fs::write(config.staged_path(&bad.record.hash), b"rotten").unwrap();

        let dropped = revalidate_staged(&config, &[good.clone(), bad.clone(), absent]).unwrap();
        assert_eq!(dropped, 1);
        assert!(config.staged_path(&good.record.hash).exists());
        assert!(!config.staged_path(&bad.record.hash).exists());
    }

    #[test]
    fn packs_unpack_into_state_and_leave_indicator() {
        let temp = TempDir::new().unwrap();
        let server = FakeServer::new(temp.path().join("www"));
        let config = config_for(&temp, &server);
        fs::create_dir_all(&config.state_dir).unwrap();

        // pack carrying staged/<hash> entries
        let hash = Hash::of_bytes(b"packed");
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(6);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("staged/{hash}"), &b"packed"[..])
            .unwrap();
        let data = builder.into_inner().unwrap();
        let pack_dir = server.root.join("30");
        fs::create_dir_all(&pack_dir).unwrap();
        fs::write(pack_dir.join("pack-editors-from-0.tar"), data).unwrap();

        let mut mom = Manifest::default();
        mom.version = 30;
        let subs = vec![Subscription {
            component: "editors".to_string(),
            version: 30,
            version_deps_from: 30,
        }];

        let applied = download_packs(&config, &FileTransport, &subs, &mom, 0);
        assert_eq!(applied, 1);
        assert_eq!(fs::read(config.staged_path(&hash)).unwrap(), b"packed");
        assert!(config.pack_indicator_path("editors", 0, 30).exists());

        // indicator suppresses a refetch
        let applied = download_packs(&config, &FileTransport, &subs, &mom, 0);
        assert_eq!(applied, 0);
    }

    #[test]
    fn missing_pack_is_not_an_error() {
        let temp = TempDir::new().unwrap();
        let server = FakeServer::new(temp.path().join("www"));
        let config = config_for(&temp, &server);
        fs::create_dir_all(&config.state_dir).unwrap();

        let mut mom = Manifest::default();
        mom.version = 30;
        let subs = vec![Subscription {
            component: "editors".to_string(),
            version: 30,
            version_deps_from: 30,
        }];
        assert_eq!(download_packs(&config, &FileTransport, &subs, &mom, 0), 0);
        assert!(!config.pack_indicator_path("editors", 0, 30).exists());
    }

    #[test]
    fn disk_space_check_honours_skip_flag() {
        let temp = TempDir::new().unwrap();
        let server = FakeServer::new(temp.path().join("www"));
        let mut config = config_for(&temp, &server);
        fs::create_dir_all(&config.path_prefix).unwrap();

        let err = check_disk_space(&config, u64::MAX / 2).unwrap_err();
        assert!(matches!(err, UpdaterError::DiskSpace { .. }));
        assert_eq!(err.code(), 25);

        config.skip_diskspace_check = true;
        check_disk_space(&config, u64::MAX / 2).unwrap();
    }

    #[test]
    fn required_space_sums_contentsize() {
        let mut a = Manifest::default();
        a.contentsize = 1000;
        let mut b = Manifest::default();
        b.contentsize = 500;
        assert_eq!(required_space(&[a, b]), 1500);
    }
}
