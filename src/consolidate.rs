use crate::hash::Hash;
use crate::manifest::{FileRecord, Manifest};
use std::cmp::Reverse;
use std::collections::HashSet;

/// A file record tagged with the bundle that owns its authoritative copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub bundle: String,
    pub record: FileRecord,
}

/// Concatenate the file lists of a set of per-bundle manifests. Each entry
/// keeps the name of its owning bundle so later stages can attribute the
/// chosen copy.
pub fn files_from_bundles(manifests: &[Manifest]) -> Vec<FileRef> {
    let mut files = Vec::new();
    for manifest in manifests {
        for record in &manifest.files {
            files.push(FileRef {
                bundle: manifest.component.clone(),
                record: record.clone(),
            });
        }
    }
    files
}

/// Reduce a multi-bundle file list to one authoritative record per path.
///
/// Sort order is `(filename, is_deleted asc, last_change desc, bundle asc)`;
/// the first record per filename wins. That keeps the newest non-deleted
/// copy when one exists, otherwise the newest tombstone. Equal-version
/// conflicts between bundles resolve to the lexicographically first bundle
/// name, making the result a deterministic function of its input.
pub fn consolidate_files(mut files: Vec<FileRef>) -> Vec<FileRef> {
    files.sort_by(|a, b| {
        (
            &a.record.filename,
            a.record.flags.is_deleted,
            Reverse(a.record.last_change),
            &a.bundle,
        )
            .cmp(&(
                &b.record.filename,
                b.record.flags.is_deleted,
                Reverse(b.record.last_change),
                &b.bundle,
            ))
    });
    files.dedup_by(|next, kept| next.record.filename == kept.record.filename);
    files
}

/// Drop tombstones, leaving only records with content to install.
pub fn filter_out_deleted_files(files: Vec<FileRef>) -> Vec<FileRef> {
    files
        .into_iter()
        .filter(|file| !file.record.flags.is_deleted)
        .collect()
}

/// Keep the entries of `files` whose `(filename, hash)` pair does not
/// appear in `existing`.
pub fn filter_out_existing_files(files: Vec<FileRef>, existing: &[FileRef]) -> Vec<FileRef> {
    let present: HashSet<(&str, &Hash)> = existing
        .iter()
        .map(|file| (file.record.filename.as_str(), &file.record.hash))
        .collect();

    files
        .into_iter()
        .filter(|file| !present.contains(&(file.record.filename.as_str(), &file.record.hash)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HASH_LEN;
    use crate::manifest::FileFlags;

    fn record(filename: &str, seed: u8, last_change: u32, deleted: bool) -> FileRecord {
        let hash = if deleted {
            Hash::ZERO
        } else {
            Hash::from_hex(&format!("{seed:02x}").repeat(HASH_LEN / 2)).unwrap()
        };
        FileRecord {
            filename: filename.to_string(),
            hash,
            last_change,
            flags: FileFlags {
                is_file: !deleted,
                is_deleted: deleted,
                ..FileFlags::default()
            },
        }
    }

    fn file_ref(bundle: &str, filename: &str, seed: u8, last_change: u32, deleted: bool) -> FileRef {
        FileRef {
            bundle: bundle.to_string(),
            record: record(filename, seed, last_change, deleted),
        }
    }

    fn manifest(component: &str, files: Vec<FileRecord>) -> Manifest {
        Manifest {
            component: component.to_string(),
            files,
            ..Manifest::default()
        }
    }

    #[test]
    fn files_from_bundles_concatenates_and_attributes() {
        let manifests = vec![
            manifest("a", vec![record("/x", 1, 10, false)]),
            manifest("b", vec![record("/y", 2, 10, false), record("/z", 3, 10, false)]),
        ];
        let files = files_from_bundles(&manifests);
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].bundle, "a");
        assert_eq!(files[1].bundle, "b");
        assert_eq!(files[2].record.filename, "/z");
    }

    #[test]
    fn newest_record_wins() {
        let files = vec![
            file_ref("a", "/x", 1, 10, false),
            file_ref("b", "/x", 2, 20, false),
        ];
        let chosen = consolidate_files(files);
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].bundle, "b");
        assert_eq!(chosen[0].record.last_change, 20);
    }

    #[test]
    fn live_record_beats_newer_tombstone() {
        let files = vec![
            file_ref("a", "/x", 1, 10, false),
            file_ref("b", "/x", 0, 30, true),
        ];
        let chosen = consolidate_files(files);
        assert_eq!(chosen.len(), 1);
        assert!(!chosen[0].record.flags.is_deleted);
        assert_eq!(chosen[0].record.last_change, 10);
    }

    #[test]
    fn newest_tombstone_kept_when_all_deleted() {
        let files = vec![
            file_ref("a", "/x", 0, 10, true),
            file_ref("b", "/x", 0, 30, true),
        ];
        let chosen = consolidate_files(files);
        assert_eq!(chosen.len(), 1);
        assert!(chosen[0].record.flags.is_deleted);
        assert_eq!(chosen[0].record.last_change, 30);
    }

    #[test]
    fn equal_version_tie_breaks_on_bundle_name() {
        let files = vec![
            file_ref("zeta", "/x", 1, 10, false),
            file_ref("alpha", "/x", 2, 10, false),
        ];
        let chosen = consolidate_files(files);
        assert_eq!(chosen.len(), 1);
        assert_eq!(chosen[0].bundle, "alpha");
    }

    #[test]
    fn output_is_sorted_and_deterministic() {
        let files = vec![
            file_ref("b", "/c", 1, 10, false),
            file_ref("a", "/a", 2, 10, false),
            file_ref("a", "/b", 3, 10, false),
        ];
        let once = consolidate_files(files.clone());
        let twice = consolidate_files(files);
        assert_eq!(once, twice);
        let names: Vec<&str> = once.iter().map(|f| f.record.filename.as_str()).collect();
        assert_eq!(names, vec!["/a", "/b", "/c"]);
    }

    #[test]
    fn filter_out_deleted_drops_tombstones() {
        let files = vec![
            file_ref("a", "/x", 1, 10, false),
            file_ref("a", "/y", 0, 10, true),
        ];
        let kept = filter_out_deleted_files(files);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].record.filename, "/x");
    }

    #[test]
    fn filter_out_existing_matches_on_name_and_hash() {
        let existing = vec![
            file_ref("a", "/same", 1, 10, false),
            file_ref("a", "/changed", 2, 10, false),
        ];
        let candidate = vec![
            file_ref("b", "/same", 1, 20, false),
            file_ref("b", "/changed", 3, 20, false),
            file_ref("b", "/new", 4, 20, false),
        ];
        let kept = filter_out_existing_files(candidate, &existing);
        let names: Vec<&str> = kept.iter().map(|f| f.record.filename.as_str()).collect();
        assert_eq!(names, vec!["/changed", "/new"]);
    }
}
