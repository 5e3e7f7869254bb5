use crate::config::Config;
use crate::consolidate;
use crate::download::{self, PACK_THRESHOLD};
use crate::error::UpdaterError;
use crate::install;
use crate::state;
use crate::store::ManifestStore;
use crate::subscription::{self, Subscription};
use crate::transport;
use crate::ui;
use std::collections::HashSet;

/// Install the requested bundles and everything they include.
///
/// Per-bundle request failures (unknown names, unloadable manifests) are
/// recorded and the remaining bundles still install; pipeline failures
/// after that point abort the command before any live-tree mutation.
pub fn execute(config: &Config, requested: &[String]) -> Result<(), UpdaterError> {
    let transport = transport::create_transport(config)?;
    let store = ManifestStore::new(config, transport.as_ref());

    let version = state::read_current_version(config)?;
    let mut mom = store.load_mom(version)?;

    let (expanded, applied_aliases) = subscription::resolve_aliases(config, requested);
    for (alias, targets) in &applied_aliases {
        ui::status(format!(
            "Alias \"{alias}\" will install bundle(s): {}",
            targets.join(" ")
        ));
    }

    let mut names: Vec<String> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for name in &expanded {
        if seen.insert(name) {
            names.push(name.clone());
        } else {
            ui::warn(format!("Bundle \"{name}\" is listed twice, ignoring duplicate"));
        }
    }

    let total = names.len();
    let mut failures: Vec<UpdaterError> = Vec::new();

    let mut to_request: Vec<String> = Vec::new();
    for name in names {
        if subscription::is_installed_bundle(config, &name) {
            ui::warn(format!("Bundle \"{name}\" is already installed"));
        } else {
            to_request.push(name);
        }
    }

    let mut subs: Vec<Subscription> = Vec::new();
    let status = subscription::add_subscriptions(&store, &mom, &to_request, &mut subs, false, 0);
    for bad in &status.bad_names {
        ui::warn(format!("Bundle \"{bad}\" is invalid, skipping"));
        failures.push(UpdaterError::InvalidBundle(bad.clone()));
    }
    if status.fetch_failed {
        failures.push(UpdaterError::ManifestLoad("requested bundles".to_string()));
    }

    let attempted = to_request.len();
    if subs.is_empty() {
        return finish(attempted.saturating_sub(failures.len()), total, failures);
    }

    ui::status("Loading required manifests...");
    subscription::recurse_manifest(&store, &mut mom, &subs, None)?;

    download::check_disk_space(config, download::required_space(&mom.submanifests))?;

    let files = consolidate::filter_out_deleted_files(consolidate::consolidate_files(
        consolidate::files_from_bundles(&mom.submanifests),
    ));

    if files.len() > PACK_THRESHOLD {
        ui::status("Downloading packs...");
        download::download_packs(config, transport.as_ref(), &subs, &mom, 0);
    } else {
        ui::status("No packs need to be downloaded");
    }

    ui::status("Validating local files");
    download::revalidate_staged(config, &files)?;

    ui::status("Starting download of remaining update content. This may take a while...");
    let stats = download::download_fullfiles(config, transport.as_ref(), &files)?;
    tracing::debug!(
        fetched = stats.fetched,
        cached = stats.already_staged,
        "download complete"
    );

    ui::status("Installing bundle(s) files...");
    let mut files = files;
    let report = install::install_files(config, &mut files)?;
    tracing::debug!(staged = report.staged, renamed = report.renamed, "install complete");

    for sub in &subs {
        subscription::track_installed(config, &sub.component)?;
    }
    state::write_version_marker(config, version);

    ui::status("Calling post-update helper scripts.");
    install::run_post_update_scripts(config, report.boot_update);

    let installed = attempted.saturating_sub(failures.len());
    finish(installed, total, failures)
}

fn finish(installed: usize, total: usize, failures: Vec<UpdaterError>) -> Result<(), UpdaterError> {
    if installed > 0 {
        let plural = if installed == 1 { "bundle" } else { "bundles" };
        ui::status(format!("Successfully installed {installed} {plural}"));
    }

    match failures.into_iter().next() {
        None => {
            if installed == 0 {
                ui::status("No bundles were added");
            }
            Ok(())
        }
        Some(first) => {
            let failed = total - installed;
            ui::status(format!("Failed to install {failed} of {total} bundles"));
            Err(first)
        }
    }
}
