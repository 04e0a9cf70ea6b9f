//! Load the `[env]` table from `~/.config/<app>/config.toml`.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::LoadError;

#[derive(serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    env: HashMap<String, String>,
}

fn config_path(app_name: &str) -> Result<Option<PathBuf>, LoadError> {
    let base = dirs::config_dir()
        .ok_or_else(|| LoadError::ConfigDir("no config directory for this platform".into()))?;
    let path = base.join(app_name).join("config.toml");
    Ok(path.is_file().then_some(path))
}

/// Returns the `[env]` key-value pairs. Missing file or section yields an empty map.
pub fn load_env_map(app_name: &str) -> Result<HashMap<String, String>, LoadError> {
    let Some(path) = config_path(app_name)? else {
        return Ok(HashMap::new());
    };
    let content = std::fs::read_to_string(&path).map_err(LoadError::TomlRead)?;
    let parsed: ConfigFile = toml::from_str(&content)?;
    Ok(parsed.env)
}
