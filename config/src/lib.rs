//! Load configuration from XDG `config.toml` and project `.env`, then apply to the
//! process environment with priority: **existing env > .env > XDG**.
//!
//! The core reads its typed config from the environment after this overlay has
//! run, so deployments can keep everything in `~/.config/atelier/config.toml`
//! while local runs override single keys in `.env` or the shell.

mod env_file;
mod toml_file;

#[cfg(feature = "tracing-init")]
pub mod logging;

use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("config dir: {0}")]
    ConfigDir(String),
    #[error("read config.toml: {0}")]
    TomlRead(std::io::Error),
    #[error("parse config.toml: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("read .env: {0}")]
    EnvRead(std::io::Error),
}

/// Loads config from `~/.config/<app_name>/config.toml` (`[env]` table) and an
/// optional project `.env`, then sets environment variables only for keys that
/// are **not** already set, so existing env always wins.
///
/// Precedence for a key absent from the process environment:
/// 1. project `.env` (current directory, or `override_dir` if given)
/// 2. `[env]` table of the XDG `config.toml`
///
/// Missing files are not errors; the overlay is a no-op for them.
pub fn load_and_apply(app_name: &str, override_dir: Option<&Path>) -> Result<(), LoadError> {
    let toml_map = toml_file::load_env_map(app_name)?;
    let env_map = env_file::load_env_map(override_dir).map_err(LoadError::EnvRead)?;

    for (key, value) in toml_map {
        if std::env::var(&key).is_err() && !env_map.contains_key(&key) {
            std::env::set_var(&key, value);
        }
    }
    for (key, value) in env_map {
        if std::env::var(&key).is_err() {
            std::env::set_var(&key, value);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn restore_var(key: &str, prev: Option<String>) {
        match prev {
            Some(v) => env::set_var(key, v),
            None => env::remove_var(key),
        }
    }

    #[test]
    fn existing_env_wins() {
        env::set_var("ATELIER_CONFIG_TEST_EXISTING", "from_env");
        let _ = load_and_apply("atelier", None);
        assert_eq!(
            env::var("ATELIER_CONFIG_TEST_EXISTING").as_deref(),
            Ok("from_env")
        );
        env::remove_var("ATELIER_CONFIG_TEST_EXISTING");
    }

    #[test]
    fn missing_everything_is_ok() {
        let r = load_and_apply("atelier-config-test-nonexistent-app", None::<&Path>);
        assert!(r.is_ok());
    }

    #[test]
    fn env_file_overrides_toml() {
        let xdg_dir = tempfile::tempdir().unwrap();
        let app_dir = xdg_dir.path().join("atelier");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(
            app_dir.join("config.toml"),
            "[env]\nATELIER_CONFIG_TEST_PRIORITY = \"from_toml\"\n",
        )
        .unwrap();

        let env_dir = tempfile::tempdir().unwrap();
        std::fs::write(
            env_dir.path().join(".env"),
            "ATELIER_CONFIG_TEST_PRIORITY=from_env_file\n",
        )
        .unwrap();

        let prev_xdg = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", xdg_dir.path());
        env::remove_var("ATELIER_CONFIG_TEST_PRIORITY");

        let _ = load_and_apply("atelier", Some(env_dir.path()));
        let val = env::var("ATELIER_CONFIG_TEST_PRIORITY").unwrap();
        env::remove_var("ATELIER_CONFIG_TEST_PRIORITY");
        restore_var("XDG_CONFIG_HOME", prev_xdg);

        assert_eq!(val, "from_env_file");
    }

    #[test]
    fn toml_applied_when_no_env_file() {
        let xdg_dir = tempfile::tempdir().unwrap();
        let app_dir = xdg_dir.path().join("atelier");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(
            app_dir.join("config.toml"),
            "[env]\nATELIER_CONFIG_TEST_TOML_ONLY = \"from_toml\"\n",
        )
        .unwrap();

        let empty_dir = tempfile::tempdir().unwrap();

        let prev_xdg = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", xdg_dir.path());
        env::remove_var("ATELIER_CONFIG_TEST_TOML_ONLY");

        let _ = load_and_apply("atelier", Some(empty_dir.path()));
        let val = env::var("ATELIER_CONFIG_TEST_TOML_ONLY").unwrap();
        env::remove_var("ATELIER_CONFIG_TEST_TOML_ONLY");
        restore_var("XDG_CONFIG_HOME", prev_xdg);

        assert_eq!(val, "from_toml");
    }

    #[test]
    fn invalid_toml_fails_with_parse_error() {
        let xdg_dir = tempfile::tempdir().unwrap();
        let app_dir = xdg_dir.path().join("atelier");
        std::fs::create_dir_all(&app_dir).unwrap();
        std::fs::write(app_dir.join("config.toml"), "broken [[[\n").unwrap();

        let prev_xdg = env::var("XDG_CONFIG_HOME").ok();
        env::set_var("XDG_CONFIG_HOME", xdg_dir.path());

        let result = load_and_apply("atelier", None::<&Path>);
        restore_var("XDG_CONFIG_HOME", prev_xdg);

        assert!(matches!(result, Err(LoadError::TomlParse(_))));
    }
}
