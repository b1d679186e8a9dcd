use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::store::StoreError;
use crate::Result;

use super::Config;

/// Names the config variant to load: `depi_config_$DEPI_CONFIG.json`.
pub const DEPI_CONFIG_ENV_VAR: &str = "DEPI_CONFIG";

pub fn load(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .map_err(|e| config_error(format!("failed to read {}: {e}", path.display())))?;
    serde_json::from_str(&contents)
        .map_err(|e| config_error(format!("failed to parse {}: {e}", path.display())))
}

/// Resolve the config file from `$DEPI_CONFIG` under `<root>/configs/`,
/// falling back to the `mem` variant.
pub fn load_from_env(root_dir: &Path) -> Result<Config> {
    let variant = std::env::var(DEPI_CONFIG_ENV_VAR).unwrap_or_default();
    let path: PathBuf = if variant.is_empty() {
        tracing::info!(
            "using default config file, set {DEPI_CONFIG_ENV_VAR} to load an alternative"
        );
        root_dir.join("configs").join("depi_config_mem.json")
    } else {
        root_dir
            .join("configs")
            .join(format!("depi_config_{variant}.json"))
    };
    tracing::info!(config = %path.display(), "loading config");
    if path.exists() {
        load(&path)
    } else {
        Ok(Config::default())
    }
}

/// Read config JSON from a stream (the supervisor pipes it over stdin).
pub fn load_from_reader(reader: &mut dyn Read) -> Result<Config> {
    let mut contents = String::new();
    reader
        .read_to_string(&mut contents)
        .map_err(|e| config_error(format!("failed to read config stream: {e}")))?;
    serde_json::from_str(&contents)
        .map_err(|e| config_error(format!("failed to parse config stream: {e}")))
}

fn config_error(reason: String) -> crate::Error {
    StoreError::Backend(reason).into()
}
