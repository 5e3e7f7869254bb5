use crate::config::Config;
use crate::consolidate::FileRef;
use crate::error::UpdaterError;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::process::Command;

/// Paths the updater must never touch in the live tree.
const IGNORED_PATHS: &[&str] = &["/etc/mtab", "/etc/machine-id"];

/// Top-level directories holding runtime state rather than image content.
const STATE_ROOTS: &[&str] = &[
    "/data",
    "/dev",
    "/home",
    "/lost+found",
    "/proc",
    "/root",
    "/run",
    "/sys",
    "/tmp",
    "/var",
];

const BOOT_PREFIXES: &[&str] = &[
    "/boot/",
    "/usr/lib/kernel/",
    "/usr/lib/modules/",
    "/usr/lib/systemd/boot/",
];

/// Derive post-action flags from a record's filename. Boot, config and
/// state classification drives the post-install scripts; state files are
/// runtime data and are additionally excluded from installation.
pub fn apply_heuristics(file: &mut FileRef) {
    let name = file.record.filename.as_str();

    if BOOT_PREFIXES.iter().any(|prefix| name.starts_with(prefix)) {
        file.record.flags.is_boot = true;
    }
    if name.starts_with("/etc/") {
        file.record.flags.is_config = true;
    }
    if STATE_ROOTS
        .iter()
        .any(|root| name == *root || name.starts_with(&format!("{root}/")))
    {
        file.record.flags.is_state = true;
        file.record.flags.do_not_update = true;
    }
}

pub fn is_ignored(filename: &str) -> bool {
    IGNORED_PATHS.contains(&filename)
}

fn skip_record(file: &FileRef) -> bool {
    file.record.flags.is_deleted
        || file.record.flags.do_not_update
        || is_ignored(&file.record.filename)
}

#[derive(Debug, Default)]
pub struct InstallReport {
    pub staged: usize,
    pub renamed: usize,
    pub boot_update: bool,
}

/// Two-phase application of a consolidated work list to the live tree.
///
/// Pass 1 stages every record next to its final path; pass 2 atomically
/// renames the staged copies into place. A crash between the passes leaves
/// the live tree untouched, with only `.update` siblings to reclaim.
pub fn install_files(config: &Config, files: &mut [FileRef]) -> Result<InstallReport, UpdaterError> {
    for file in files.iter_mut() {
        apply_heuristics(file);
    }

    let mut report = InstallReport::default();

    // pass 1: stage
    for file in files.iter() {
        if skip_record(file) {
            continue;
        }
        stage_one(config, file)?;
        report.staged += 1;
        report.boot_update |= file.record.flags.is_boot;
    }

    // pass 2: rename
    for file in files.iter() {
        if skip_record(file) || file.record.flags.is_dir {
            continue;
        }
        let target = config.target_path(&file.record.filename);
        let staged = update_sibling(&target);
        fs::rename(&staged, &target).map_err(|err| {
            tracing::error!(path = %target.display(), error = %err, "rename failed");
            UpdaterError::RenameFile(target.clone())
        })?;
        report.renamed += 1;
    }

    sync_filesystem();
    Ok(report)
}

fn stage_one(config: &Config, file: &FileRef) -> Result<(), UpdaterError> {
    let target = config.target_path(&file.record.filename);

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|_| UpdaterError::CreateDir(parent.to_path_buf()))?;
    }

    // a live entry of a different type cannot be updated in place
    if let Ok(meta) = fs::symlink_metadata(&target) {
        let live = meta.file_type();
        let differs = if file.record.flags.is_dir {
            !live.is_dir()
        } else if file.record.flags.is_link {
            !live.is_symlink()
        } else {
            !live.is_file()
        };
        if differs {
            let removed = if live.is_dir() {
                fs::remove_dir_all(&target)
            } else {
                fs::remove_file(&target)
            };
            removed.map_err(|_| UpdaterError::RemoveFile(target.clone()))?;
        }
    }

    if file.record.flags.is_dir {
        // directories go straight to their final name; rename is a no-op
        fs::create_dir_all(&target).map_err(|_| UpdaterError::CreateDir(target.clone()))?;
        return Ok(());
    }

    let staged_blob = config.staged_path(&file.record.hash);
    let update = update_sibling(&target);
    if fs::symlink_metadata(&update).is_ok() {
        fs::remove_file(&update).map_err(|_| UpdaterError::RemoveFile(update.clone()))?;
    }

    if file.record.flags.is_link {
        let link_target = fs::read_link(&staged_blob)?;
        symlink(&link_target, &update)?;
    } else {
        fs::copy(&staged_blob, &update)?;
    }
    Ok(())
}

/// The staging sibling of a live path: `<final>.update`.
fn update_sibling(target: &Path) -> std::path::PathBuf {
    let name = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{name}.update"))
}

/// Flush everything once, after the rename pass.
fn sync_filesystem() {
    // SAFETY: sync(2) takes no arguments and cannot fail
    unsafe { libc::sync() };
}

/// Best-effort unlink of a bundle's uniquely owned files from the live
/// tree. Paths are processed deepest-first so files go before their
/// directories. Missing paths count as removed; directories that will not
/// empty are left behind silently.
pub fn remove_live_files(config: &Config, files: &[FileRef]) -> (usize, Vec<std::path::PathBuf>) {
    let mut ordered: Vec<&FileRef> = files.iter().collect();
    ordered.sort_by_key(|file| std::cmp::Reverse(file.record.filename.len()));

    let mut removed = 0;
    let mut failed = Vec::new();
    for file in ordered {
        let target = config.target_path(&file.record.filename);
        let Ok(meta) = fs::symlink_metadata(&target) else {
            removed += 1;
            continue;
        };

        if meta.is_dir() {
            match fs::remove_dir(&target) {
                Ok(()) => removed += 1,
                Err(err) => {
                    tracing::debug!(path = %target.display(), error = %err, "directory not removed");
                }
            }
        } else {
            match fs::remove_file(&target) {
                Ok(()) => removed += 1,
                Err(err) => {
                    tracing::warn!(path = %target.display(), error = %err, "failed to remove file");
                    failed.push(target);
                }
            }
        }
    }
    (removed, failed)
}

/// Run the configured post-update hook after an install touched the live
/// tree. Boot-relevant updates are flagged through the environment so the
/// hook can regenerate boot entries.
pub fn run_post_update_scripts(config: &Config, boot_update: bool) {
    let Some(hook) = &config.post_update_hook else {
        tracing::debug!("no post-update hook configured");
        return;
    };

    let status = Command::new(hook)
        .arg(&config.path_prefix)
        .env("BUNDLECTL_BOOT_UPDATE", if boot_update { "1" } else { "0" })
        .status();
    match status {
        Ok(status) if status.success() => {}
        Ok(status) => tracing::warn!(%status, "post-update hook reported failure"),
        Err(err) => tracing::warn!(error = %err, "post-update hook did not run"),
    }
}
