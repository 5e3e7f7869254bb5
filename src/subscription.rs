use crate::config::Config;
use crate::error::UpdaterError;
use crate::manifest::Manifest;
use crate::store::ManifestStore;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fs;

/// A bundle in the current working set and the version at which its
/// manifest should be fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub component: String,
    /// Last-changed version from the MoM entry.
    pub version: u32,
    /// MoM version that produced this dependency edge.
    pub version_deps_from: u32,
}

/// Outcome of a subscription pass. Replaces the historical three-bit flag
/// word: callers can tell "nothing to do" (all false/empty) from "unknown
/// bundle name" and "manifest fetch failure".
#[derive(Debug, Default)]
pub struct AddStatus {
    pub new_subscriptions_added: bool,
    pub bad_names: Vec<String>,
    pub fetch_failed: bool,
}

impl AddStatus {
    fn merge(&mut self, other: AddStatus) {
        self.new_subscriptions_added |= other.new_subscriptions_added;
        self.bad_names.extend(other.bad_names);
        self.fetch_failed |= other.fetch_failed;
    }
}

pub fn component_subscribed(subs: &[Subscription], name: &str) -> bool {
    subs.iter().any(|sub| sub.component == name)
}

/// Whether a bundle is installed on this system: its tracking file exists.
pub fn is_installed_bundle(config: &Config, name: &str) -> bool {
    config.tracking_path(name).is_file()
}

/// Subscribe the requested bundles and, transitively, everything their
/// manifests include.
///
/// Bundles absent from the MoM are reported in `bad_names`. Already
/// subscribed bundles are skipped below the top level; the top-level call
/// still descends so a re-request can seed missing parts of the tree.
/// Unless `find_all` is set, bundles already installed are inspected for
/// includes but not subscribed themselves.
pub fn add_subscriptions(
    store: &ManifestStore,
    mom: &Manifest,
    requested: &[String],
    subs: &mut Vec<Subscription>,
    find_all: bool,
    depth: usize,
) -> AddStatus {
    let mut visiting = HashSet::new();
    add_subscriptions_walk(store, mom, requested, subs, find_all, depth, &mut visiting)
}

fn add_subscriptions_walk(
    store: &ManifestStore,
    mom: &Manifest,
    requested: &[String],
    subs: &mut Vec<Subscription>,
    find_all: bool,
    depth: usize,
    visiting: &mut HashSet<String>,
) -> AddStatus {
    let mut status = AddStatus::default();
    let config = store.config();

    for name in requested {
        let Some(entry) = mom.find_bundle(name) else {
            status.bad_names.push(name.clone());
            continue;
        };

        if depth > 0 && component_subscribed(subs, name) {
            continue;
        }
        // the includes graph must be a DAG; a back-edge is a malformed
        // manifest set and its branch is dropped
        if !visiting.insert(name.clone()) {
            tracing::warn!(bundle = %name, "include cycle detected");
            continue;
        }

        let manifest = match store.load_bundle_manifest(entry) {
            Ok(manifest) => manifest,
            Err(err) => {
                tracing::warn!(bundle = %name, error = %err, "cannot load manifest");
                status.fetch_failed = true;
                visiting.remove(name);
                continue;
            }
        };

        if !manifest.includes.is_empty() {
            status.merge(add_subscriptions_walk(
                store,
                mom,
                &manifest.includes,
                subs,
                find_all,
                depth + 1,
                visiting,
            ));
        }
        visiting.remove(name);

        if !find_all && is_installed_bundle(config, name) {
            continue;
        }
        if component_subscribed(subs, name) {
            continue;
        }

        subs.push(Subscription {
            component: name.clone(),
            version: entry.last_change,
            version_deps_from: mom.version,
        });
        status.new_subscriptions_added = true;
    }

    status
}

/// Load the subscription set recorded in the tracking directory.
pub fn read_subscriptions(config: &Config) -> Result<Vec<Subscription>, UpdaterError> {
    let dir = config.tracking_dir();
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(&dir).map_err(|_| UpdaterError::ListDir(dir.clone()))?;
    let mut subs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|_| UpdaterError::ListDir(dir.clone()))?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        subs.push(Subscription {
            component: name,
            version: 0,
            version_deps_from: 0,
        });
    }
    subs.sort_by(|a, b| a.component.cmp(&b.component));
    Ok(subs)
}

/// Drop a bundle from an in-memory subscription set.
pub fn unload_tracked_bundle(subs: &mut Vec<Subscription>, name: &str) {
    subs.retain(|sub| sub.component != name);
}

/// Record a bundle as manually installed.
///
/// The first write bootstraps the tracking directory from the image-shipped
/// seed, skipping the `.MoM` marker the image build leaves behind.
pub fn track_installed(config: &Config, name: &str) -> Result<(), UpdaterError> {
    let dir = config.tracking_dir();
    let needs_seed = !dir.is_dir()
        || fs::read_dir(&dir)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true);
    fs::create_dir_all(&dir)?;

    if needs_seed {
        let image_dir = config.image_tracking_dir();
        if image_dir.is_dir() {
            for entry in fs::read_dir(&image_dir)? {
                let entry = entry?;
                let seed_name = entry.file_name();
                if seed_name.to_string_lossy() == ".MoM" {
                    continue;
                }
                fs::write(dir.join(&seed_name), b"")?;
            }
        }
    }

    fs::write(config.tracking_path(name), b"")?;
    Ok(())
}

/// Delete a tracking file. Divergence in the tracking directory is
/// tolerated, so any I/O failure is ignored.
pub fn remove_tracked(config: &Config, name: &str) {
    if let Err(err) = fs::remove_file(config.tracking_path(name)) {
        tracing::debug!(bundle = name, error = %err, "tracking file removal failed");
    }
}

/// Bundles whose manifests include `name`, rendered as an indented tree.
///
/// First-level dependants are prefixed `  * `, deeper levels
/// `<4*(depth-1) spaces>|-- `. Walks the submanifests attached to the MoM,
/// so only installed (recursed) bundles appear.
pub fn required_by(mom: &Manifest, name: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut path: HashSet<String> = HashSet::new();
    required_by_walk(mom, name, 1, &mut path, &mut out);
    out
}

fn required_by_walk(
    mom: &Manifest,
    name: &str,
    depth: usize,
    path: &mut HashSet<String>,
    out: &mut Vec<String>,
) {
    for sub in &mom.submanifests {
        if sub.component == name || !sub.includes.iter().any(|include| include == name) {
            continue;
        }
        // an include cycle would be a malformed manifest set; stop the walk
        if !path.insert(sub.component.clone()) {
            continue;
        }

        let line = if depth == 1 {
            format!("  * {}", sub.component)
        } else {
            format!("{}|-- {}", " ".repeat(4 * (depth - 1)), sub.component)
        };
        out.push(line);
        required_by_walk(mom, &sub.component, depth + 1, path, out);
        path.remove(&sub.component);
    }
}

/// Load every subscribed manifest and attach it to the MoM.
///
/// With a `filter` the attached set is pruned to the include closure of that
/// one bundle.
pub fn recurse_manifest(
    store: &ManifestStore,
    mom: &mut Manifest,
    subs: &[Subscription],
    filter: Option<&str>,
) -> Result<(), UpdaterError> {
    let mut loaded = Vec::new();
    for sub in subs {
        let Some(entry) = mom.find_bundle(&sub.component) else {
            // unknown tracking entries are tolerated but not recursed
            tracing::debug!(bundle = %sub.component, "subscription not named in MoM");
            continue;
        };
        let manifest = store.load_bundle_manifest(entry).map_err(|err| {
            tracing::warn!(bundle = %sub.component, error = %err, "recurse failed");
            UpdaterError::RecurseManifest
        })?;
        loaded.push(manifest);
    }

    if let Some(name) = filter {
        loaded = prune_to_closure(loaded, name);
    }

    mom.submanifests = loaded;
    Ok(())
}

fn prune_to_closure(manifests: Vec<Manifest>, name: &str) -> Vec<Manifest> {
    let by_name: BTreeMap<String, Manifest> = manifests
        .into_iter()
        .map(|manifest| (manifest.component.clone(), manifest))
        .collect();

    let mut wanted: Vec<String> = vec![name.to_string()];
    let mut closure: HashSet<String> = HashSet::new();
    while let Some(next) = wanted.pop() {
        if !closure.insert(next.clone()) {
            continue;
        }
        if let Some(manifest) = by_name.get(&next) {
            wanted.extend(manifest.includes.iter().cloned());
        }
    }

    by_name
        .into_values()
        .filter(|manifest| closure.contains(&manifest.component))
        .collect()
}

/// Expand bundle aliases defined under the alias directory.
///
/// Alias files hold one `alias<TAB>bundle…` line each; later files override
/// earlier definitions. Returns the expanded request list and the applied
/// expansions for reporting.
pub fn resolve_aliases(
    config: &Config,
    requested: &[String],
) -> (Vec<String>, Vec<(String, Vec<String>)>) {
    let aliases = load_aliases(config);
    let mut expanded = Vec::new();
    let mut applied = Vec::new();

    for name in requested {
        match aliases.get(name) {
            Some(targets) => {
                applied.push((name.clone(), targets.clone()));
                expanded.extend(targets.iter().cloned());
            }
            None => expanded.push(name.clone()),
        }
    }

    (expanded, applied)
}

fn load_aliases(config: &Config) -> BTreeMap<String, Vec<String>> {
    let mut aliases = BTreeMap::new();
    let dir = config.alias_dir();
    let Ok(entries) = fs::read_dir(&dir) else {
        return aliases;
    };

    let mut files: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .collect();
    files.sort();

    for path in files {
        let Ok(contents) = fs::read_to_string(&path) else {
            continue;
        };
        for line in contents.lines() {
            let mut fields = line.split('\t');
            let Some(alias) = fields.next() else { continue };
            let targets: Vec<String> = fields
                .filter(|field| !field.is_empty())
                .map(str::to_string)
                .collect();
            if !alias.is_empty() && !targets.is_empty() {
                aliases.insert(alias.to_string(), targets);
            }
        }
    }

    aliases
}
