use crate::config::Config;
use crate::error::UpdaterError;
use crate::hash;
use fs2::FileExt;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Current OS version, probed from the os-release file under the target
/// root. `/usr/lib` is authoritative; `/etc` is the override location.
pub fn read_current_version(config: &Config) -> Result<u32, UpdaterError> {
    for path in [config.etc_os_release_path(), config.os_release_path()] {
        let Ok(contents) = fs::read_to_string(&path) else {
            continue;
        };
        if let Some(version) = parse_os_release_version(&contents) {
            return Ok(version);
        }
    }
    Err(UpdaterError::CurrentVersionUnknown)
}

fn parse_os_release_version(contents: &str) -> Option<u32> {
    for line in contents.lines() {
        let Some(value) = line.strip_prefix("VERSION_ID=") else {
            continue;
        };
        let value = value.trim().trim_matches('"').trim_matches('\'');
        if let Ok(version) = value.parse::<u32>() {
            return Some(version);
        }
    }
    None
}

/// Refresh the last-known-version marker. Best effort; the marker is a
/// cache, not a source of truth.
pub fn write_version_marker(config: &Config, version: u32) {
    let path = config.version_marker_path();
    if let Err(err) = fs::create_dir_all(&config.state_dir).and_then(|_| {
        fs::write(&path, format!("{version}\n"))
    }) {
        tracing::debug!(error = %err, "could not write version marker");
    }
}

/// Exclusive lock over the state directory, held for the duration of a
/// command. Concurrent runs against the same state root are refused.
pub struct StateLock {
    file: File,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        self.file.unlock().ok();
    }
}

pub fn lock_state_dir(config: &Config) -> Result<StateLock, UpdaterError> {
    fs::create_dir_all(&config.state_dir)
        .map_err(|_| UpdaterError::CreateDir(config.state_dir.clone()))?;
    let path = config.lock_path();
    let file = File::create(&path)?;
    file.try_lock_exclusive()
        .map_err(|_| UpdaterError::LockHeld(path))?;
    Ok(StateLock { file })
}

/// Outcome of a garbage collection sweep. In dry-run mode `paths` lists
/// what would go; otherwise it lists what went.
#[derive(Debug, Default)]
pub struct CleanReport {
    pub paths: Vec<PathBuf>,
}

impl CleanReport {
    pub fn count(&self) -> usize {
        self.paths.len()
    }
}

/// Remove unreferenced cache artifacts from the state directory.
///
/// Per-subdirectory rules:
/// - `staged/`: every entry whose name length is a full hash is a fullfile
///   blob and goes.
/// - state root: pack indicators (`pack-*.tar`) and delta manifests
///   (`Manifest-*`) go; `bundles/` is never touched.
/// - `<version>/`: when the current version's MoM text mentions the
///   version, only hashed manifests go; otherwise every `Manifest.*` goes.
///   The directory itself is dropped when that leaves it empty.
///
/// `all` widens the sweep to everything except `bundles/`; `dry_run`
/// reports without deleting.
pub fn clean_state(config: &Config, all: bool, dry_run: bool) -> Result<CleanReport, UpdaterError> {
    let mut report = CleanReport::default();
    if !config.state_dir.is_dir() {
        return Ok(report);
    }

    // manifests referenced by the current version survive a default sweep
    let current_mom_text = if all {
        String::new()
    } else {
        read_current_version(config)
            .ok()
            .and_then(|version| fs::read_to_string(config.mom_path(version)).ok())
            .unwrap_or_default()
    };

    let entries = fs::read_dir(&config.state_dir)
        .map_err(|_| UpdaterError::ListDir(config.state_dir.clone()))?;

    for entry in entries {
        let entry = entry.map_err(|_| UpdaterError::ListDir(config.state_dir.clone()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();

        match name.as_str() {
            "bundles" => continue,
            // the lock is live, the marker and mix overlays are not cache
            "lock" | "version" | "mix" => continue,
            "staged" => {
                clean_staged(&path, dry_run, &mut report)?;
                continue;
            }
            "download" => {
                clean_directory_contents(&path, dry_run, &mut report)?;
                continue;
            }
            _ => {}
        }

        if hash::is_pack_indicator(&name) || hash::is_manifest_delta(&name) {
            remove_path(&path, dry_run, &mut report)?;
            continue;
        }

        if path.is_dir() && name.parse::<u32>().is_ok() {
            let keep_plain = !all && current_mom_text.contains(&name);
            clean_version_dir(&path, keep_plain, dry_run, &mut report)?;
        }
    }

    Ok(report)
}

fn clean_staged(dir: &Path, dry_run: bool, report: &mut CleanReport) -> Result<(), UpdaterError> {
    let entries = fs::read_dir(dir).map_err(|_| UpdaterError::ListDir(dir.to_path_buf()))?;
    for entry in entries {
        let entry = entry.map_err(|_| UpdaterError::ListDir(dir.to_path_buf()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.len() == hash::HASH_LEN {
            remove_path(&entry.path(), dry_run, report)?;
        }
    }
    Ok(())
}

fn clean_directory_contents(
    dir: &Path,
    dry_run: bool,
    report: &mut CleanReport,
) -> Result<(), UpdaterError> {
    let entries = fs::read_dir(dir).map_err(|_| UpdaterError::ListDir(dir.to_path_buf()))?;
    for entry in entries {
        let entry = entry.map_err(|_| UpdaterError::ListDir(dir.to_path_buf()))?;
        remove_path(&entry.path(), dry_run, report)?;
    }
    Ok(())
}

fn clean_version_dir(
    dir: &Path,
    keep_plain: bool,
    dry_run: bool,
    report: &mut CleanReport,
) -> Result<(), UpdaterError> {
    let entries = fs::read_dir(dir).map_err(|_| UpdaterError::ListDir(dir.to_path_buf()))?;
    for entry in entries {
        let entry = entry.map_err(|_| UpdaterError::ListDir(dir.to_path_buf()))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let doomed = if keep_plain {
            hash::is_hashed_manifest(&name)
        } else {
            hash::is_manifest_name(&name)
        };
        if doomed {
            remove_path(&entry.path(), dry_run, report)?;
        }
    }
    if !dry_run {
        // drop the directory if the sweep emptied it
        fs::remove_dir(dir).ok();
    }
    Ok(())
}

/// Record and (unless dry-run) delete a path. Directories count one entry
/// per contained file, so the dry-run count matches a real sweep.
fn remove_path(path: &Path, dry_run: bool, report: &mut CleanReport) -> Result<(), UpdaterError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(_) => return Ok(()),
    };

    if meta.is_dir() {
        for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_dir() {
                report.paths.push(entry.into_path());
            }
        }
        if !dry_run {
            fs::remove_dir_all(path).map_err(|_| UpdaterError::RemoveFile(path.to_path_buf()))?;
        }
    } else {
        report.paths.push(path.to_path_buf());
        if !dry_run {
            fs::remove_file(path).map_err(|_| UpdaterError::RemoveFile(path.to_path_buf()))?;
        }
    }
    Ok(())
}
