use crate::config::Config;
use crate::error::UpdaterError;
use crate::state;
use crate::store::ManifestStore;
use crate::subscription;
use crate::transport;
use crate::ui;
use std::collections::HashSet;

/// List installed bundles, or with `all` every bundle the MoM offers.
/// Experimental bundles are marked either way.
pub fn execute(config: &Config, all: bool) -> Result<(), UpdaterError> {
    if all {
        return list_installable(config);
    }

    let subs = subscription::read_subscriptions(config)?;
    let experimental = experimental_bundles(config);
    for sub in subs {
        if experimental.contains(&sub.component) {
            ui::status(format!("{} (experimental)", sub.component));
        } else {
            ui::status(&sub.component);
        }
    }
    Ok(())
}

fn list_installable(config: &Config) -> Result<(), UpdaterError> {
    let transport = transport::create_transport(config)?;
    let store = ManifestStore::new(config, transport.as_ref());
    let version = state::read_current_version(config)?;
    let mom = store.load_mom(version)?;

    let mut bundles: Vec<_> = mom
        .files
        .iter()
        .filter(|record| record.flags.is_manifest && !record.flags.is_deleted)
        .collect();
    bundles.sort_by(|a, b| a.filename.cmp(&b.filename));

    for record in bundles {
        if record.flags.is_experimental {
            ui::status(format!("{} (experimental)", record.filename));
        } else {
            ui::status(&record.filename);
        }
    }
    Ok(())
}

/// Experimental markings come from the MoM; listing the tracked set still
/// works offline, so a failed MoM load just drops the markers.
fn experimental_bundles(config: &Config) -> HashSet<String> {
    let Ok(transport) = transport::create_transport(config) else {
        return HashSet::new();
    };
    let store = ManifestStore::new(config, transport.as_ref());
    let Ok(version) = state::read_current_version(config) else {
        return HashSet::new();
    };
    let Ok(mom) = store.load_mom(version) else {
        return HashSet::new();
    };

    mom.files
        .iter()
        .filter(|record| record.flags.is_manifest && record.flags.is_experimental)
        .map(|record| record.filename.clone())
        .collect()
}
