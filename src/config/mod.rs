pub mod types;

pub use types::*;

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Working directories
    pub paths: PathsConfig,
    /// Named renditions available to submissions
    pub resolutions: BTreeMap<String, ResolutionPreset>,
    /// Encoder settings
    pub ffmpeg: FfmpegConfig,
    /// Subtitle embedding settings
    pub subtitle: SubtitleConfig,
    /// Fetcher settings
    pub download: DownloadConfig,
    /// Pipeline settings
    pub processing: ProcessingConfig,
    /// HTTP front end
    pub server: ServerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            resolutions: default_resolutions(),
            ffmpeg: FfmpegConfig::default(),
            subtitle: SubtitleConfig::default(),
            download: DownloadConfig::default(),
            processing: ProcessingConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from TOML file, or create default if not found
    pub fn load(path: Option<&Path>) -> Self {
        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::config_path);

        let mut config = if config_path.exists() {
            match Self::load_from_file(&config_path) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    warn!("Failed to load config: {}. Using defaults.", e);
                    Self::default()
                }
            }
        } else {
            let config = Self::default();
            // Save default config for future editing
            if let Err(e) = config.save(&config_path) {
                warn!("Failed to save default config: {}", e);
            }
            config
        };

        config.apply_env_overrides();
        config
    }

    /// Save configuration to TOML file
    pub fn save(&self, path: &Path) -> Result<(), AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AppError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)
            .map_err(|e| AppError::Config(format!("Failed to write config file: {}", e)))?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Load configuration from a specific file
    fn load_from_file(path: &Path) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config file: {}", e)))?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("subforge")
            .join("config.toml")
    }

    /// `HOST` and `PORT` take precedence over the file
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!("Ignoring invalid PORT value: {}", port),
            }
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), AppError> {
        if self.resolutions.is_empty() {
            return Err(AppError::Config(
                "At least one resolution must be configured".to_string(),
            ));
        }
        if let Some((name, _)) = self.resolutions.iter().find(|(_, p)| p.height == 0) {
            return Err(AppError::Config(format!(
                "Resolution {} has a zero height",
                name
            )));
        }
        if self.ffmpeg.crf > 51 {
            return Err(AppError::Config("CRF must be between 0 and 51".to_string()));
        }
        if self.processing.encode_workers == 0 {
            return Err(AppError::Config(
                "processing.encode_workers must be at least 1".to_string(),
            ));
        }
        if self.download.max_retries == 0 {
            return Err(AppError::Config(
                "download.max_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Create every working directory
    pub fn ensure_directories(&self) -> Result<(), AppError> {
        for dir in self.paths.all() {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Resolutions used when a submission does not name any
    pub fn default_resolutions(&self) -> Vec<String> {
        let mut names: Vec<_> = self.resolutions.iter().collect();
        names.sort_by_key(|(_, preset)| preset.height);
        names.into_iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn encode_profile(&self) -> EncodeProfile {
        EncodeProfile::resolve(&self.ffmpeg)
    }

    /// Configuration rooted in a scratch directory
    #[cfg(test)]
    pub fn for_tests(root: &Path) -> Self {
        Self {
            paths: PathsConfig {
                downloads: root.join("downloads"),
                processing: root.join("processing"),
                outputs: root.join("outputs"),
                logs: root.join("logs"),
                state_file: None,
            },
            ..Self::default()
        }
    }
}
