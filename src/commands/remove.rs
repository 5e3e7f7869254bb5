use crate::config::Config;
use crate::consolidate;
use crate::error::UpdaterError;
use crate::install;
use crate::state;
use crate::store::ManifestStore;
use crate::subscription;
use crate::transport;
use crate::ui;
use std::collections::HashSet;

/// The bundle every installation is built on; it can never be removed.
const REQUIRED_BUNDLE: &str = "os-core";

/// Uninstall the requested bundles.
///
/// Each bundle is handled independently: a policy failure on one still
/// lets the others proceed, and the command reports the first failing
/// code at the end.
pub fn execute(config: &Config, requested: &[String]) -> Result<(), UpdaterError> {
    let transport = transport::create_transport(config)?;
    let store = ManifestStore::new(config, transport.as_ref());

    let version = state::read_current_version(config)?;

    let mut names: Vec<&String> = Vec::new();
    let mut seen = HashSet::new();
    for name in requested {
        if seen.insert(name.as_str()) {
            names.push(name);
        }
    }

    let total = names.len();
    let mut removed = 0usize;
    let mut failures: Vec<UpdaterError> = Vec::new();

    for name in names {
        match remove_one(config, &store, version, name) {
            Ok(()) => removed += 1,
            Err(err) => {
                ui::error(&err);
                failures.push(err);
            }
        }
    }

    if removed > 0 {
        let plural = if removed == 1 { "bundle" } else { "bundles" };
        ui::status(format!("Successfully removed {removed} {plural}"));
    }

    match failures.into_iter().next() {
        None => Ok(()),
        Some(first) => {
            let failed = total - removed;
            ui::status(format!("Failed to remove {failed} of {total} bundles"));
            Err(first)
        }
    }
}

fn remove_one(
    config: &Config,
    store: &ManifestStore,
    version: u32,
    name: &str,
) -> Result<(), UpdaterError> {
    if name == REQUIRED_BUNDLE {
        return Err(UpdaterError::ProtectedBundle(name.to_string()));
    }
    if !subscription::is_installed_bundle(config, name) {
        return Err(UpdaterError::NotTracked(name.to_string()));
    }

    let mut mom = store.load_mom(version)?;
    let entry = mom
        .find_bundle(name)
        .ok_or_else(|| UpdaterError::InvalidBundle(name.to_string()))?
        .clone();

    // every other installed bundle survives; their manifests decide what
    // this bundle uniquely owns
    let mut subs = subscription::read_subscriptions(config)?;
    subscription::unload_tracked_bundle(&mut subs, name);
    subscription::recurse_manifest(store, &mut mom, &subs, None)?;

    let dependants = subscription::required_by(&mom, name);
    if !dependants.is_empty() {
        ui::status(format!(
            "Bundle \"{name}\" is required by the following bundles:"
        ));
        for line in &dependants {
            ui::status(line);
        }
        return Err(UpdaterError::RequiredBundle(name.to_string()));
    }

    let target_manifest = store.load_bundle_manifest(&entry)?;

    let survivors = consolidate::consolidate_files(consolidate::files_from_bundles(
        &mom.submanifests,
    ));
    let survivor_paths: HashSet<&str> = survivors
        .iter()
        .map(|file| file.record.filename.as_str())
        .collect();

    let target_files = consolidate::filter_out_deleted_files(consolidate::consolidate_files(
        consolidate::files_from_bundles(std::slice::from_ref(&target_manifest)),
    ));
    let unique: Vec<_> = target_files
        .into_iter()
        .filter(|file| !survivor_paths.contains(file.record.filename.as_str()))
        .collect();

    let (unlinked, failed) = install::remove_live_files(config, &unique);
    tracing::info!(bundle = name, unlinked, "bundle files removed");

    subscription::remove_tracked(config, name);

    match failed.into_iter().next() {
        None => Ok(()),
        Some(path) => Err(UpdaterError::RemoveFile(path)),
    }
}
