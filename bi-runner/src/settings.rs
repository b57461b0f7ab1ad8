use python_sandbox::identifier::{to_python_identifier, validate_python_identifier};
use python_sandbox::{default_libraries, CapabilityProfile, ExecutionTier, LibraryHandle};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::dataset_loader::LocalDataset;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to create config directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Execution tier; accepts `permissive`/`local` and `restricted`/`restricted_local`
    #[serde(default)]
    pub python_executor: ExecutionTier,
    /// Libraries bound into every snippet namespace
    #[serde(default = "default_libraries")]
    pub libraries: Vec<LibraryHandle>,
    #[serde(default)]
    pub datasets: Vec<LocalDataset>,
    /// Per-snippet deadline enforced by the executor actor; `None` waits forever
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout_secs: Option<u64>,
}

fn default_execution_timeout() -> Option<u64> {
    Some(30)
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            python_executor: ExecutionTier::default(),
            libraries: default_libraries(),
            datasets: Vec::new(),
            execution_timeout_secs: default_execution_timeout(),
        }
    }
}

impl AppSettings {
    /// Capability profile for the configured tier
    pub fn capability_profile(&self) -> CapabilityProfile {
        CapabilityProfile::for_tier(self.python_executor, self.libraries.clone())
    }
}

/// Make every dataset name a bindable identifier
pub fn enforce_dataset_names(settings: &mut AppSettings) {
    for dataset in &mut settings.datasets {
        if let Err(reason) = validate_python_identifier(&dataset.name) {
            let sanitized = to_python_identifier(&dataset.name);
            tracing::warn!(dataset = %dataset.name, %sanitized, %reason, "renaming dataset to a valid identifier");
            dataset.name = sanitized;
        }
    }
}

/// Get the path to the config file
pub fn default_config_path() -> PathBuf {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".bi-runner").join("config.json")
}

/// Load settings from `path` (the default location when `None`).
/// A missing or unreadable file falls back to defaults.
pub async fn load_settings(path: Option<&Path>) -> AppSettings {
    let config_path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);

    let mut settings = match fs::read_to_string(&config_path).await {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(settings) => {
                tracing::info!(path = %config_path.display(), "settings loaded");
                settings
            }
            Err(e) => {
                tracing::warn!(path = %config_path.display(), error = %e, "failed to parse settings, using defaults");
                AppSettings::default()
            }
        },
        Err(e) => {
            tracing::info!(path = %config_path.display(), error = %e, "no config file, using defaults");
            AppSettings::default()
        }
    };

    enforce_dataset_names(&mut settings);
    settings
}

/// Save settings to `path` (the default location when `None`)
pub async fn save_settings(settings: &AppSettings, path: Option<&Path>) -> Result<(), SettingsError> {
    let config_path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);

    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent).await.map_err(|source| SettingsError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let contents = serde_json::to_string_pretty(settings)?;
    fs::write(&config_path, contents)
        .await
        .map_err(|source| SettingsError::Write {
            path: config_path.clone(),
            source,
        })?;

    tracing::info!(path = %config_path.display(), "settings saved");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use python_sandbox::BuiltinSet;

    #[test]
    fn test_default_settings() {
        let settings = AppSettings::default();
        assert_eq!(settings.python_executor, ExecutionTier::Restricted);
        assert_eq!(settings.execution_timeout_secs, Some(30));
        assert!(settings.libraries.iter().any(|lib| lib.name == "statistics"));

        let profile = settings.capability_profile();
        assert_eq!(profile.builtin_set, BuiltinSet::SafeSubset);
        assert!(profile.guarded_attribute_access);
    }

    #[test]
    fn test_executor_aliases_from_config() {
        let settings: AppSettings = serde_json::from_str(r#"{"python_executor": "local"}"#).unwrap();
        assert_eq!(settings.python_executor, ExecutionTier::Permissive);
        assert!(!settings.capability_profile().guarded_attribute_access);

        let settings: AppSettings = serde_json::from_str(r#"{"python_executor": "restricted_local"}"#).unwrap();
        assert_eq!(settings.python_executor, ExecutionTier::Restricted);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let settings: AppSettings = serde_json::from_str(
            r#"{"libraries": [{"name": "math"}], "datasets": [{"name": "sales", "path": "sales.csv"}], "execution_timeout_secs": null}"#,
        )
        .unwrap();
        assert_eq!(settings.libraries, vec![LibraryHandle::new("math")]);
        assert_eq!(settings.datasets[0].name, "sales");
        assert_eq!(settings.execution_timeout_secs, None);
    }

    #[test]
    fn test_enforce_dataset_names() {
        let mut settings = AppSettings::default();
        settings.datasets = vec![
            LocalDataset::new("Q3 Sales", "q3.csv"),
            LocalDataset::new("regions", "regions.json"),
        ];
        enforce_dataset_names(&mut settings);
        assert_eq!(settings.datasets[0].name, "q3_sales");
        assert_eq!(settings.datasets[1].name, "regions");
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut settings = AppSettings::default();
        settings.python_executor = ExecutionTier::Permissive;
        settings.datasets.push(LocalDataset::new("sales", "sales.csv"));
        save_settings(&settings, Some(&path)).await.unwrap();

        let loaded = load_settings(Some(&path)).await;
        assert_eq!(loaded.python_executor, ExecutionTier::Permissive);
        assert_eq!(loaded.datasets, settings.datasets);
    }

    #[tokio::test]
    async fn test_invalid_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();

        let loaded = load_settings(Some(&path)).await;
        assert_eq!(loaded.python_executor, ExecutionTier::Restricted);
        assert!(loaded.datasets.is_empty());
    }
}
