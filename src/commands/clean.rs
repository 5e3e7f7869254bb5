use crate::config::Config;
use crate::error::UpdaterError;
use crate::state;
use crate::ui;

pub fn execute(config: &Config, all: bool, dry_run: bool) -> Result<(), UpdaterError> {
    let report = state::clean_state(config, all, dry_run)?;

    if dry_run {
        for path in &report.paths {
            ui::status(path.display());
        }
        ui::status(format!("{} files would be removed", report.count()));
    } else {
        ui::status(format!("{} files removed", report.count()));
    }
    Ok(())
}
