//! Settings storage
//!
//! Manages persistence of the engine configuration: context and thread sizing,
//! sampling defaults and the stop-marker set.

use crate::inference::assembler::{StopMarkers, CHATML_RESIDUAL_PREFIXES, CHATML_STOP_MARKERS};
use crate::inference::runtime::LoadParams;
use crate::inference::session::{GenerationRequest, DEFAULT_MAX_TOKENS, DEFAULT_SEED};
use crate::storage::{get_data_dir, StorageError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Context window size (0 = default of 2048)
    pub context_size: i32,
    /// Decode threads (0 = hardware concurrency - 1)
    pub threads: i32,
    /// Offload layers to the GPU when available
    pub use_gpu: bool,
    /// Maximum number of tokens to generate
    pub max_tokens: i32,
    /// Temperature for text generation (0.0 - 2.0)
    pub temperature: f32,
    /// Top-p (nucleus sampling) parameter (0.0 - 1.0]
    pub top_p: f32,
    /// Sampling seed
    pub seed: u32,
    /// Text patterns that end generation
    pub stop_markers: Vec<String>,
    /// Fragments stripped from the end result
    pub residual_prefixes: Vec<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            context_size: 2048,
            threads: 0,
            use_gpu: false,
            max_tokens: DEFAULT_MAX_TOKENS as i32,
            temperature: 0.7,
            top_p: 0.9,
            seed: DEFAULT_SEED,
            stop_markers: CHATML_STOP_MARKERS.iter().map(|m| m.to_string()).collect(),
            residual_prefixes: CHATML_RESIDUAL_PREFIXES
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

impl EngineSettings {
    /// Validate settings values
    ///
    /// Ensures all parameters are within acceptable ranges
    pub fn validate(&mut self) {
        self.context_size = self.context_size.max(0);
        self.threads = self.threads.max(0);

        if self.max_tokens <= 0 {
            self.max_tokens = DEFAULT_MAX_TOKENS as i32;
        }

        if self.temperature.is_nan() {
            self.temperature = 0.7;
        }
        self.temperature = self.temperature.clamp(0.0, 2.0);

        if self.top_p.is_nan() || self.top_p <= 0.0 {
            self.top_p = 1.0;
        }
        self.top_p = self.top_p.min(1.0);

        self.stop_markers.retain(|m| !m.is_empty());
        self.residual_prefixes.retain(|p| !p.is_empty());
    }

    pub fn load_params(&self) -> LoadParams {
        LoadParams {
            context_size: self.context_size,
            threads: self.threads,
            use_gpu: self.use_gpu,
        }
    }

    /// Builds a request for `prompt` with these sampling defaults.
    pub fn request(&self, prompt: impl Into<String>) -> GenerationRequest {
        GenerationRequest::new(prompt)
            .with_max_tokens(self.max_tokens)
            .with_temperature(self.temperature)
            .with_top_p(self.top_p)
            .with_seed(self.seed)
    }

    pub fn stop_markers(&self) -> StopMarkers {
        StopMarkers::new(
            self.stop_markers.iter().cloned(),
            self.residual_prefixes.iter().cloned(),
        )
    }
}

/// Get the settings file path
fn get_settings_path() -> Result<PathBuf, StorageError> {
    Ok(get_data_dir()?.join("settings.json"))
}

/// Load settings from disk
///
/// Returns default settings if the file doesn't exist or is corrupted
pub fn load_settings() -> EngineSettings {
    match get_settings_path().and_then(|path| load_settings_from(&path)) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to load settings, using defaults: {}", e);
            EngineSettings::default()
        }
    }
}

/// Load settings from a specific file, with error propagation
pub fn load_settings_from(path: &Path) -> Result<EngineSettings, StorageError> {
    if !path.exists() {
        tracing::info!("Settings file not found, using defaults");
        return Ok(EngineSettings::default());
    }

    let json = fs::read_to_string(path)?;
    let mut settings: EngineSettings = serde_json::from_str(&json)?;
    settings.validate();

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Save settings to the data directory
pub fn save_settings(settings: &EngineSettings) -> Result<(), StorageError> {
    save_settings_to(&get_settings_path()?, settings)
}

/// Save settings to a specific file
pub fn save_settings_to(path: &Path, settings: &EngineSettings) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json)?;

    tracing::debug!("Saved settings to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = EngineSettings::default();
        assert_eq!(settings.context_size, 2048);
        assert_eq!(settings.max_tokens, 512);
        assert_eq!(settings.temperature, 0.7);
        assert_eq!(settings.seed, DEFAULT_SEED);
        assert_eq!(settings.stop_markers(), StopMarkers::chatml());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = EngineSettings::default();

        settings.temperature = 5.0;
        settings.validate();
        assert_eq!(settings.temperature, 2.0);

        settings.temperature = -1.0;
        settings.validate();
        assert_eq!(settings.temperature, 0.0);

        settings.top_p = 2.0;
        settings.validate();
        assert_eq!(settings.top_p, 1.0);

        settings.top_p = 0.0;
        settings.validate();
        assert_eq!(settings.top_p, 1.0);

        settings.max_tokens = -3;
        settings.context_size = -1;
        settings.stop_markers.push(String::new());
        settings.validate();
        assert_eq!(settings.max_tokens, 512);
        assert_eq!(settings.context_size, 0);
        assert_eq!(settings.stop_markers.len(), 3);
    }

    #[test]
    fn test_request_uses_sampling_defaults() {
        let settings = EngineSettings {
            max_tokens: 64,
            temperature: 0.2,
            top_p: 0.5,
            seed: 7,
            ..EngineSettings::default()
        };
        let request = settings.request("hello");
        assert_eq!(request.prompt, "hello");
        assert_eq!(request.max_tokens, 64);
        assert_eq!(request.temperature, 0.2);
        assert_eq!(request.top_p, 0.5);
        assert_eq!(request.seed, 7);
    }

    #[test]
    fn test_settings_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = EngineSettings {
            context_size: 4096,
            threads: 2,
            stop_markers: vec!["</s>".to_string()],
            ..EngineSettings::default()
        };
        save_settings_to(&path, &settings).unwrap();

        let loaded = load_settings_from(&path).unwrap();
        assert_eq!(loaded, settings);
        assert_eq!(loaded.load_params(), LoadParams::new(4096, 2));
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "temperature": 9.0 }"#).unwrap();

        let loaded = load_settings_from(&path).unwrap();
        assert_eq!(loaded.temperature, 2.0);
        assert_eq!(loaded.context_size, 2048);
        assert_eq!(loaded.stop_markers.len(), 3);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_settings_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(loaded, EngineSettings::default());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            load_settings_from(&path),
            Err(StorageError::JsonError(_))
        ));
    }
}
