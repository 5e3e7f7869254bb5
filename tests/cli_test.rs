use assert_cmd::Command;
use bundlectl::Hash;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// One record in a published test bundle.
enum Entry {
    Dir(&'static str),
    File(&'static str, &'static [u8]),
}

/// A target root, state directory and `file://` content server under one
/// temp directory.
struct Fixture {
    _temp: TempDir,
    target: PathBuf,
    state: PathBuf,
    www: PathBuf,
}

const VERSION: u32 = 30;

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("target");
        let state = temp.path().join("state");
        let www = temp.path().join("www");
        fs::create_dir_all(&target).unwrap();
        fs::create_dir_all(&www).unwrap();

        let os_release = target.join("usr/lib/os-release");
        fs::create_dir_all(os_release.parent().unwrap()).unwrap();
        fs::write(
            &os_release,
            format!("NAME=\"test-os\"\nID=test\nVERSION_ID={VERSION}\n"),
        )
        .unwrap();

        Self {
            _temp: temp,
            target,
            state,
            www,
        }
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("bundlectl").unwrap();
        cmd.arg("--path")
            .arg(&self.target)
            .arg("--statedir")
            .arg(&self.state)
            .arg("--url")
            .arg(format!("file://{}", self.www.display()))
            .arg("--retry-delay")
            .arg("0")
            .arg("--max-retries")
            .arg("1")
            .env("NO_COLOR", "1");
        cmd
    }

    fn target_path(&self, filename: &str) -> PathBuf {
        self.target.join(filename.trim_start_matches('/'))
    }

    fn tracking_path(&self, bundle: &str) -> PathBuf {
        self.state.join("bundles").join(bundle)
    }

    /// Publish a bundle manifest plus the fullfile blobs it references.
    /// Returns the manifest blob hash for the MoM entry.
    fn publish_bundle(
        &self,
        name: &str,
        includes: &[&str],
        entries: &[Entry],
        contentsize: u64,
    ) -> Hash {
        let version_dir = self.www.join(VERSION.to_string());
        let files_dir = version_dir.join("files");
        fs::create_dir_all(&files_dir).unwrap();

        let mut text = format!(
            "MANIFEST\t1\nversion:\t{VERSION}\nprevious:\t0\nfilecount:\t{}\ntimestamp:\t1700000000\ncontentsize:\t{contentsize}\n",
            entries.len()
        );
        for include in includes {
            text.push_str(&format!("includes:\t{include}\n"));
        }
        text.push('\n');

        for entry in entries {
            match entry {
                Entry::Dir(path) => {
                    let hash = Hash::of_bytes(path.as_bytes());
                    text.push_str(&format!("D...\t{hash}\t{VERSION}\t{path}\n"));
                }
                Entry::File(path, content) => {
                    let hash = Hash::of_bytes(content);
                    text.push_str(&format!("F...\t{hash}\t{VERSION}\t{path}\n"));
                    write_fullfile_tar(&files_dir, &hash, content);
                }
            }
        }

        let hash = Hash::of_bytes(text.as_bytes());
        fs::write(version_dir.join(format!("Manifest.{name}")), &text).unwrap();
        fs::write(version_dir.join(format!("Manifest.{name}.{hash}")), &text).unwrap();
        hash
    }

    fn publish_mom(&self, bundles: &[(&str, Hash)]) {
        let version_dir = self.www.join(VERSION.to_string());
        fs::create_dir_all(&version_dir).unwrap();
        let mut text = format!(
            "MANIFEST\t1\nversion:\t{VERSION}\nprevious:\t0\nfilecount:\t{}\ntimestamp:\t1700000000\ncontentsize:\t0\n\n",
            bundles.len()
        );
        for (name, hash) in bundles {
            text.push_str(&format!("M...\t{hash}\t{VERSION}\t{name}\n"));
        }
        fs::write(version_dir.join("Manifest.MoM"), text).unwrap();
    }
}

fn write_fullfile_tar(files_dir: &Path, hash: &Hash, content: &[u8]) {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, hash.to_string(), content)
        .unwrap();
    fs::write(
        files_dir.join(format!("{hash}.tar")),
        builder.into_inner().unwrap(),
    )
    .unwrap();
}

/// Snapshot of every path under the target root, for tree-unchanged checks.
fn tree_snapshot(root: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = walk(root);
    paths.sort();
    paths
}

fn walk(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            out.push(path.clone());
            if path.is_dir() {
                out.extend(walk(&path));
            }
        }
    }
    out
}

#[test]
fn fresh_add_of_directory_bundle() {
    let fx = Fixture::new();
    let hash = fx.publish_bundle(
        "test-bundle",
        &[],
        &[Entry::Dir("/usr"), Entry::Dir("/usr/bin"), Entry::Dir("/usr/bin/test")],
        64,
    );
    fx.publish_mom(&[("test-bundle", hash)]);

    fx.cmd()
        .arg("bundle-add")
        .arg("test-bundle")
        .assert()
        .success()
        .stdout(predicate::str::contains("Loading required manifests..."))
        .stdout(predicate::str::contains("No packs need to be downloaded"))
        .stdout(predicate::str::contains("Installing bundle(s) files..."))
        .stdout(predicate::str::contains("Successfully installed 1 bundle"));

    assert!(fx.target_path("/usr/bin/test").is_dir());
    assert!(fx.tracking_path("test-bundle").is_file());
}

#[test]
fn fresh_add_of_boot_file_invokes_post_update_hook() {
    let fx = Fixture::new();

    // hook configured through the on-disk config overlay
    let hook = fx.target.join("hook.sh");
    let witness = fx.target.join("hook-ran");
    fs::write(
        &hook,
        format!("#!/bin/sh\necho \"boot=$BUNDLECTL_BOOT_UPDATE\" > {}\n", witness.display()),
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&hook, fs::Permissions::from_mode(0o755)).unwrap();
    }
    let etc = fx.target.join("etc/bundlectl");
    fs::create_dir_all(&etc).unwrap();
    fs::write(
        etc.join("config.toml"),
        format!("post_update_hook = \"{}\"\n", hook.display()),
    )
    .unwrap();

    let hash = fx.publish_bundle(
        "kernel-bundle",
        &[],
        &[Entry::File("/usr/lib/kernel/test-file", b"vmlinuz")],
        1024,
    );
    fx.publish_mom(&[("kernel-bundle", hash)]);

    fx.cmd()
        .arg("bundle-add")
        .arg("kernel-bundle")
        .assert()
        .success()
        .stdout(predicate::str::contains("Calling post-update helper scripts."));

    assert!(fx.target_path("/usr/lib/kernel/test-file").is_file());
    assert_eq!(fs::read_to_string(&witness).unwrap().trim(), "boot=1");
}

#[test]
fn remove_leaf_bundle_keeps_shared_files() {
    let fx = Fixture::new();
    let core = fx.publish_bundle(
        "os-core",
        &[],
        &[Entry::File("/usr/share/common", b"shared")],
        64,
    );
    let leaf = fx.publish_bundle(
        "test-bundle",
        &[],
        &[
            Entry::File("/usr/share/common", b"shared"),
            Entry::File("/usr/share/only-test", b"unique"),
        ],
        64,
    );
    fx.publish_mom(&[("os-core", core), ("test-bundle", leaf)]);

    fx.cmd()
        .arg("bundle-add")
        .arg("os-core")
        .arg("test-bundle")
        .assert()
        .success();
    assert!(fx.target_path("/usr/share/only-test").is_file());

    fx.cmd()
        .arg("bundle-remove")
        .arg("test-bundle")
        .assert()
        .success()
        .stdout(predicate::str::contains("Successfully removed 1 bundle"));

    assert!(!fx.target_path("/usr/share/only-test").exists());
    assert_eq!(
        fs::read(fx.target_path("/usr/share/common")).unwrap(),
        b"shared"
    );
    assert!(!fx.tracking_path("test-bundle").exists());
    assert!(fx.tracking_path("os-core").is_file());
}

#[test]
fn remove_os_core_is_refused() {
    let fx = Fixture::new();
    let core = fx.publish_bundle("os-core", &[], &[Entry::File("/usr/lib/core", b"core")], 64);
    fx.publish_mom(&[("os-core", core)]);
    fx.cmd().arg("bundle-add").arg("os-core").assert().success();

    let before = tree_snapshot(&fx.target);
    fx.cmd()
        .arg("bundle-remove")
        .arg("os-core")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains(
            "Bundle \"os-core\" not allowed to be removed",
        ));
    assert_eq!(before, tree_snapshot(&fx.target));
    assert!(fx.tracking_path("os-core").is_file());
}

#[test]
fn remove_with_dependants_prints_tree_and_changes_nothing() {
    let fx = Fixture::new();
    let base = fx.publish_bundle("base-lib", &[], &[Entry::File("/usr/lib/base", b"base")], 64);
    let app = fx.publish_bundle(
        "app",
        &["base-lib"],
        &[Entry::File("/usr/bin/app", b"app")],
        64,
    );
    fx.publish_mom(&[("base-lib", base), ("app", app)]);

    fx.cmd().arg("bundle-add").arg("app").assert().success();
    assert!(fx.tracking_path("base-lib").is_file());

    let before = tree_snapshot(&fx.target);
    fx.cmd()
        .arg("bundle-remove")
        .arg("base-lib")
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::contains(
            "Bundle \"base-lib\" is required by the following bundles:",
        ))
        .stdout(predicate::str::contains("  * app"));
    assert_eq!(before, tree_snapshot(&fx.target));
    assert!(fx.tracking_path("base-lib").is_file());
}

#[test]
fn add_installs_included_bundles() {
    let fx = Fixture::new();
    let dep = fx.publish_bundle("dep", &[], &[Entry::File("/usr/lib/dep", b"dep")], 64);
    let main = fx.publish_bundle(
        "main-bundle",
        &["dep"],
        &[Entry::File("/usr/bin/main", b"main")],
        64,
    );
    fx.publish_mom(&[("dep", dep), ("main-bundle", main)]);

    fx.cmd()
        .arg("bundle-add")
        .arg("main-bundle")
        .assert()
        .success();

    assert!(fx.target_path("/usr/bin/main").is_file());
    assert!(fx.target_path("/usr/lib/dep").is_file());
    assert!(fx.tracking_path("main-bundle").is_file());
    assert!(fx.tracking_path("dep").is_file());
}

#[test]
fn alias_expansion_is_reported() {
    let fx = Fixture::new();
    let real = fx.publish_bundle("editors", &[], &[Entry::File("/usr/bin/vi", b"vi")], 64);
    fx.publish_mom(&[("editors", real)]);

    let alias_dir = fx.target.join("usr/share/bundlectl/alias.d");
    fs::create_dir_all(&alias_dir).unwrap();
    fs::write(alias_dir.join("00-default"), "devel\teditors\n").unwrap();

    fx.cmd()
        .arg("bundle-add")
        .arg("devel")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Alias \"devel\" will install bundle(s): editors",
        ));
    assert!(fx.tracking_path("editors").is_file());
}

#[test]
fn adding_twice_reports_already_installed() {
    let fx = Fixture::new();
    let hash = fx.publish_bundle(
        "test-bundle",
        &[],
        &[Entry::File("/usr/share/data", b"data")],
        64,
    );
    fx.publish_mom(&[("test-bundle", hash)]);

    fx.cmd()
        .arg("bundle-add")
        .arg("test-bundle")
        .assert()
        .success();
    let after_first = tree_snapshot(&fx.target);

    fx.cmd()
        .arg("bundle-add")
        .arg("test-bundle")
        .assert()
        .success()
        .stderr(predicate::str::contains(
            "Bundle \"test-bundle\" is already installed",
        ));
    assert_eq!(after_first, tree_snapshot(&fx.target));
}

#[test]
fn repeating_a_bundle_on_one_command_line_is_idempotent() {
    let fx = Fixture::new();
    let hash = fx.publish_bundle(
        "test-bundle",
        &[],
        &[Entry::File("/usr/share/data", b"data")],
        64,
    );
    fx.publish_mom(&[("test-bundle", hash)]);

    fx.cmd()
        .arg("bundle-add")
        .arg("test-bundle")
        .arg("test-bundle")
        .assert()
        .success()
        .stdout(predicate::str::contains("Successfully installed 1 bundle"));
    assert!(fx.target_path("/usr/share/data").is_file());
}

#[test]
fn add_then_remove_restores_the_live_tree() {
    let fx = Fixture::new();
    let core = fx.publish_bundle("os-core", &[], &[Entry::File("/usr/lib/core", b"core")], 64);
    let extra = fx.publish_bundle(
        "extra",
        &[],
        &[Entry::File("/opt/extra/data", b"extra")],
        64,
    );
    fx.publish_mom(&[("os-core", core), ("extra", extra)]);

    fx.cmd().arg("bundle-add").arg("os-core").assert().success();
    let before = tree_snapshot(&fx.target);

    fx.cmd().arg("bundle-add").arg("extra").assert().success();
    fx.cmd()
        .arg("bundle-remove")
        .arg("extra")
        .assert()
        .success();

    // everything unique to the bundle is gone; empty parent dirs may remain
    assert!(!fx.target_path("/opt/extra/data").exists());
    let after: Vec<PathBuf> = tree_snapshot(&fx.target)
        .into_iter()
        .filter(|path| !path.is_dir())
        .collect();
    let before_files: Vec<PathBuf> = before.into_iter().filter(|path| !path.is_dir()).collect();
    assert_eq!(before_files, after);
}

#[test]
fn invalid_bundle_name_fails_with_invalid_bundle_code() {
    let fx = Fixture::new();
    let core = fx.publish_bundle("os-core", &[], &[Entry::File("/usr/lib/core", b"core")], 64);
    fx.publish_mom(&[("os-core", core)]);

    fx.cmd()
        .arg("bundle-add")
        .arg("no-such-bundle")
        .assert()
        .failure()
        .code(3)
        .stderr(predicate::str::contains(
            "Bundle \"no-such-bundle\" is invalid",
        ));
}

#[test]
fn mixed_valid_and_invalid_names_install_the_valid_ones() {
    let fx = Fixture::new();
    let hash = fx.publish_bundle(
        "test-bundle",
        &[],
        &[Entry::File("/usr/share/data", b"data")],
        64,
    );
    fx.publish_mom(&[("test-bundle", hash)]);

    fx.cmd()
        .arg("bundle-add")
        .arg("test-bundle")
        .arg("no-such-bundle")
        .assert()
        .failure()
        .code(3)
        .stdout(predicate::str::contains("Successfully installed 1 bundle"))
        .stdout(predicate::str::contains("Failed to install 1 of 2 bundles"));

    assert!(fx.target_path("/usr/share/data").is_file());
    assert!(fx.tracking_path("test-bundle").is_file());
}

#[test]
fn removing_untracked_bundle_fails_with_not_tracked_code() {
    let fx = Fixture::new();
    let hash = fx.publish_bundle(
        "test-bundle",
        &[],
        &[Entry::File("/usr/share/data", b"data")],
        64,
    );
    fx.publish_mom(&[("test-bundle", hash)]);

    fx.cmd()
        .arg("bundle-remove")
        .arg("test-bundle")
        .assert()
        .failure()
        .code(13);
}

#[test]
fn diskspace_check_blocks_oversized_bundles() {
    let fx = Fixture::new();
    let hash = fx.publish_bundle(
        "huge",
        &[],
        &[Entry::File("/usr/share/huge", b"tiny really")],
        u64::MAX / 4,
    );
    fx.publish_mom(&[("huge", hash)]);

    fx.cmd()
        .arg("bundle-add")
        .arg("huge")
        .assert()
        .failure()
        .code(25);
    assert!(!fx.target_path("/usr/share/huge").exists());

    fx.cmd()
        .arg("bundle-add")
        .arg("huge")
        .arg("--skip-diskspace-check")
        .assert()
        .success();
    assert!(fx.target_path("/usr/share/huge").is_file());
}

#[test]
fn clean_preserves_current_version_manifests() {
    let fx = Fixture::new();
    let hash = fx.publish_bundle(
        "test-bundle",
        &[],
        &[Entry::File("/usr/share/data", b"data")],
        64,
    );
    fx.publish_mom(&[("test-bundle", hash)]);
    fx.cmd()
        .arg("bundle-add")
        .arg("test-bundle")
        .assert()
        .success();

    // a stale version directory and a pack indicator
    let stale = fx.state.join("20");
    fs::create_dir_all(&stale).unwrap();
    fs::write(stale.join("Manifest.MoM"), b"stale").unwrap();
    fs::write(fx.state.join("pack-test-bundle-0-to-30.tar"), b"").unwrap();

    fx.cmd()
        .arg("clean")
        .assert()
        .success()
        .stdout(predicate::str::contains("files removed"));

    let version_dir = fx.state.join(VERSION.to_string());
    assert!(version_dir.join("Manifest.MoM").exists());
    assert!(version_dir.join("Manifest.test-bundle").exists());
    assert!(!version_dir
        .join(format!("Manifest.test-bundle.{hash}"))
        .exists());
    assert!(!stale.exists());
    assert!(!fx.state.join("pack-test-bundle-0-to-30.tar").exists());
    assert!(fx.tracking_path("test-bundle").is_file());
}

#[test]
fn clean_dry_run_changes_nothing_and_counts_match() {
    let fx = Fixture::new();
    let hash = fx.publish_bundle(
        "test-bundle",
        &[],
        &[Entry::File("/usr/share/data", b"data")],
        64,
    );
    fx.publish_mom(&[("test-bundle", hash)]);
    fx.cmd()
        .arg("bundle-add")
        .arg("test-bundle")
        .assert()
        .success();

    let before = tree_snapshot(&fx.state);
    let dry = fx
        .cmd()
        .arg("clean")
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(predicate::str::contains("files would be removed"))
        .get_output()
        .stdout
        .clone();
    assert_eq!(before, tree_snapshot(&fx.state));

    let dry_count = parse_count(&dry, "files would be removed");
    let real = fx
        .cmd()
        .arg("clean")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(dry_count, parse_count(&real, "files removed"));
}

fn parse_count(output: &[u8], suffix: &str) -> usize {
    let text = String::from_utf8_lossy(output);
    text.lines()
        .find_map(|line| {
            line.strip_suffix(suffix)
                .and_then(|prefix| prefix.trim().parse::<usize>().ok())
        })
        .unwrap_or_else(|| panic!("no count line ending with {suffix:?} in {text}"))
}

#[test]
fn bundle_list_shows_tracked_and_all() {
    let fx = Fixture::new();
    let a = fx.publish_bundle("alpha", &[], &[Entry::File("/usr/share/alpha", b"a")], 64);
    let b = fx.publish_bundle("beta", &[], &[Entry::File("/usr/share/beta", b"b")], 64);
    fx.publish_mom(&[("alpha", a), ("beta", b)]);

    fx.cmd().arg("bundle-add").arg("alpha").assert().success();

    fx.cmd()
        .arg("bundle-list")
        .assert()
        .success()
        .stdout(predicate::str::contains("alpha"))
        .stdout(predicate::str::contains("beta").not());

    fx.cmd()
        .arg("bundle-list")
        .arg("--all")
        .assert()
        .success()
        .stdout(predicate::str::contains("alpha"))
        .stdout(predicate::str::contains("beta"));
}

#[test]
fn bundle_info_shows_dependencies_and_requires() {
    let fx = Fixture::new();
    let base = fx.publish_bundle("base-lib", &[], &[Entry::File("/usr/lib/base", b"base")], 64);
    let app = fx.publish_bundle(
        "app",
        &["base-lib"],
        &[Entry::File("/usr/bin/app", b"app")],
        64,
    );
    fx.publish_mom(&[("base-lib", base), ("app", app)]);
    fx.cmd().arg("bundle-add").arg("app").assert().success();

    fx.cmd()
        .arg("bundle-info")
        .arg("app")
        .arg("--dependencies")
        .assert()
        .success()
        .stdout(predicate::str::contains("base-lib"));

    fx.cmd()
        .arg("bundle-info")
        .arg("base-lib")
        .arg("--requires")
        .assert()
        .success()
        .stdout(predicate::str::contains("  * app"));
}

#[test]
fn help_lists_the_bundle_commands() {
    let mut cmd = Command::cargo_bin("bundlectl").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("bundle-add"))
        .stdout(predicate::str::contains("bundle-remove"))
        .stdout(predicate::str::contains("clean"));
}
