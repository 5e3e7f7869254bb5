use crate::config::Config;
use crate::error::UpdaterError;
use crate::state;
use crate::store::ManifestStore;
use crate::subscription;
use crate::transport;
use crate::ui;

/// Show a bundle's include closure or the installed bundles that require
/// it. Without a mode flag the include closure is shown.
pub fn execute(
    config: &Config,
    bundle: &str,
    _dependencies: bool,
    requires: bool,
) -> Result<(), UpdaterError> {
    let transport = transport::create_transport(config)?;
    let store = ManifestStore::new(config, transport.as_ref());
    let version = state::read_current_version(config)?;
    let mut mom = store.load_mom(version)?;

    if mom.find_bundle(bundle).is_none() {
        return Err(UpdaterError::InvalidBundle(bundle.to_string()));
    }

    if requires {
        let subs = subscription::read_subscriptions(config)?;
        subscription::recurse_manifest(&store, &mut mom, &subs, None)?;

        let dependants = subscription::required_by(&mom, bundle);
        if dependants.is_empty() {
            ui::status(format!("No installed bundles require \"{bundle}\""));
        } else {
            ui::status(format!(
                "Bundle \"{bundle}\" is required by the following bundles:"
            ));
            for line in dependants {
                ui::status(line);
            }
        }
        return Ok(());
    }

    // include closure of the single bundle, loaded without requiring it to
    // be installed locally
    let mut subs = Vec::new();
    let status =
        subscription::add_subscriptions(&store, &mom, &[bundle.to_string()], &mut subs, true, 0);
    if !status.bad_names.is_empty() || status.fetch_failed {
        return Err(UpdaterError::ManifestLoad(bundle.to_string()));
    }
    subscription::recurse_manifest(&store, &mut mom, &subs, Some(bundle))?;

    let mut includes: Vec<&str> = mom
        .submanifests
        .iter()
        .map(|manifest| manifest.component.as_str())
        .filter(|component| *component != bundle)
        .collect();
    includes.sort_unstable();

    if includes.is_empty() {
        ui::status(format!("Bundle \"{bundle}\" has no included bundles"));
    } else {
        ui::status(format!("Bundle \"{bundle}\" includes the following bundles:"));
        for name in includes {
            ui::status(format!("  - {name}"));
        }
    }
    Ok(())
}
