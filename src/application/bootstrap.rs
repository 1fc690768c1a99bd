use crate::infrastructure::config::{ConfigBundle, ensure_default_configs, load_configs};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::initialize_database;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct BootstrapResult {
    pub workspace_root: PathBuf,
    pub logs_dir: PathBuf,
    pub database_path: PathBuf,
    pub config: ConfigBundle,
}

/// Lays out `config/`, `state/` and `logs/` under `workspace_root`, writes
/// default config files on first start and applies the schema.
pub fn bootstrap_workspace(workspace_root: &Path) -> Result<BootstrapResult, InfraError> {
    let config_dir = workspace_root.join("config");
    let state_dir = workspace_root.join("state");
    let logs_dir = workspace_root.join("logs");
    let database_path = state_dir.join("taskmate.sqlite");

    fs::create_dir_all(&config_dir)?;
    fs::create_dir_all(&state_dir)?;
    fs::create_dir_all(&logs_dir)?;

    ensure_default_configs(&config_dir)?;
    let config = load_configs(&config_dir)?;
    initialize_database(&database_path)?;

    Ok(BootstrapResult {
        workspace_root: workspace_root.to_path_buf(),
        logs_dir,
        database_path,
        config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bootstrap_creates_layout_and_is_repeatable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = bootstrap_workspace(temp.path()).expect("first bootstrap");
        assert!(first.database_path.exists());
        assert!(temp.path().join("config").join("app.json").exists());
        assert!(temp.path().join("config").join("calendar.json").exists());
        assert!(first.logs_dir.is_dir());
        assert!(!first.config.calendar.enabled);

        let second = bootstrap_workspace(temp.path()).expect("second bootstrap");
        assert_eq!(second.config, first.config);
    }

    #[test]
    fn bootstrap_rejects_invalid_timezone() {
        let temp = tempfile::tempdir().expect("tempdir");
        bootstrap_workspace(temp.path()).expect("first bootstrap");
        let app_json = temp.path().join("config").join("app.json");
        let raw = fs::read_to_string(&app_json).expect("read app.json");
        fs::write(&app_json, raw.replace("\"UTC\"", "\"Mars/Olympus\"")).expect("write app.json");

        assert!(matches!(
            bootstrap_workspace(temp.path()),
            Err(InfraError::InvalidConfig(_))
        ));
    }
}
