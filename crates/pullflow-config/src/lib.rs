pub mod error;
pub mod settings;

pub use error::*;
pub use settings::*;

use std::path::{Path, PathBuf};

const CANDIDATES: [&str; 3] = ["pullflow.local.yaml", "pullflow.yaml", ".pullflow.yaml"];

/// グローバル設定ディレクトリ（`~/.config/pullflow`）。なければ作成
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("pullflow");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// 設定ファイルを探す
///
/// 検索順:
/// 1. `PULLFLOW_CONFIG_PATH`
/// 2. カレントディレクトリ: pullflow.local.yaml, pullflow.yaml, .pullflow.yaml
/// 3. `./.pullflow/`（同じ順）
/// 4. `~/.config/pullflow/config.yaml`
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var("PULLFLOW_CONFIG_PATH") {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
        tracing::warn!(
            "PULLFLOW_CONFIG_PATH points at a missing file: {}",
            path.display()
        );
    }

    let current_dir = std::env::current_dir()?;

    for filename in &CANDIDATES {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    let project_dir = current_dir.join(".pullflow");
    if project_dir.is_dir() {
        for filename in &CANDIDATES {
            let path = project_dir.join(filename);
            if path.exists() {
                return Ok(path);
            }
        }
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("pullflow").join("config.yaml");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::SettingsFileNotFound)
}

/// 設定ファイルをパース
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    let content = std::fs::read_to_string(path)?;
    let settings: Settings =
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// 設定ファイルを探してパース
///
/// `allow_missing` なら、ファイルがないとき [`Settings::default`] を返す。
pub fn load_settings(allow_missing: bool) -> Result<Settings> {
    match find_config_file() {
        Ok(path) => load_settings_from(&path),
        Err(ConfigError::SettingsFileNotFound) if allow_missing => {
            tracing::debug!("No settings file found, using defaults");
            Ok(Settings::default())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pullflow_core::BuildEngine;
    use serial_test::serial;
    use std::fs;

    fn in_dir<T>(dir: &Path, f: impl FnOnce() -> T) -> T {
        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir).unwrap();
        let result = temp_env::with_var_unset("PULLFLOW_CONFIG_PATH", f);
        std::env::set_current_dir(original_dir).unwrap();
        result
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("pullflow.yaml"), "{}").unwrap();

        let found = in_dir(temp_dir.path(), find_config_file).unwrap();
        assert!(found.ends_with("pullflow.yaml"));
    }

    #[test]
    #[serial]
    fn test_local_file_has_priority() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("pullflow.yaml"), "{}").unwrap();
        fs::write(temp_dir.path().join("pullflow.local.yaml"), "{}").unwrap();

        let found = in_dir(temp_dir.path(), find_config_file).unwrap();
        assert!(found.ends_with("pullflow.local.yaml"));
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_project_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let project_dir = temp_dir.path().join(".pullflow");
        fs::create_dir(&project_dir).unwrap();
        fs::write(project_dir.join("pullflow.yaml"), "{}").unwrap();

        let found = in_dir(temp_dir.path(), find_config_file).unwrap();
        assert!(found.ends_with(".pullflow/pullflow.yaml"));
    }

    #[test]
    #[serial]
    fn test_env_var_wins() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("custom.yaml");
        fs::write(&config_path, "{}").unwrap();

        let found = temp_env::with_var("PULLFLOW_CONFIG_PATH", Some(&config_path), || {
            find_config_file().unwrap()
        });
        assert_eq!(found, config_path);
    }

    #[test]
    #[serial]
    fn test_missing_file_falls_back_only_when_allowed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let home = tempfile::tempdir().unwrap();

        temp_env::with_vars(
            [
                ("HOME", Some(home.path().as_os_str())),
                ("XDG_CONFIG_HOME", Some(home.path().as_os_str())),
            ],
            || {
                let strict = in_dir(temp_dir.path(), || load_settings(false));
                assert!(matches!(strict, Err(ConfigError::SettingsFileNotFound)));

                let lenient = in_dir(temp_dir.path(), || load_settings(true)).unwrap();
                assert_eq!(lenient, Settings::default());
            },
        );
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("pullflow.yaml");
        fs::write(
            &path,
            "build:\n  registry: registry.example.com/preview\n  engine: buildkit\npolling:\n  job_poll_interval_secs: 1\n",
        )
        .unwrap();

        let settings = load_settings_from(&path).unwrap();
        assert_eq!(settings.build.engine, BuildEngine::Buildkit);
        assert_eq!(settings.registry().unwrap(), "registry.example.com/preview");
        assert_eq!(settings.polling.job_poll_interval_secs, 1);
        assert_eq!(settings.polling.namespace_timeout_secs, 120);
        assert_eq!(settings.defaults.default_uuid, "dev-0");
    }

    #[test]
    fn test_parse_error_is_reported() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("pullflow.yaml");
        fs::write(&path, "build: [unclosed").unwrap();

        let err = load_settings_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_registry_is_invalid() {
        let settings = Settings::default();
        assert!(matches!(settings.registry(), Err(ConfigError::Invalid(_))));
    }
}
