//! Persistent storage
//!
//! Engine settings live in a JSON file in the platform data directory. Model
//! files and chat history belong to the host application.

use std::path::PathBuf;
use thiserror::Error;

pub mod settings;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to access data directory: {0}")]
    DataDirError(String),
    #[error("Failed to read file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to serialize/deserialize JSON: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Get the application data directory
///
/// Returns the platform-specific application data directory:
/// - Windows: `C:\Users\{user}\AppData\Roaming\PocketLLM\PocketLLM`
/// - macOS: `/Users/{user}/Library/Application Support/com.PocketLLM.PocketLLM`
/// - Linux: `/home/{user}/.local/share/pocketllm`
pub fn get_data_dir() -> Result<PathBuf, StorageError> {
    directories::ProjectDirs::from("com", "PocketLLM", "PocketLLM")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .ok_or_else(|| StorageError::DataDirError("Could not determine data directory".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_dir_retrieval() {
        // Containers without a home directory have no data dir
        if let Ok(path) = get_data_dir() {
            assert!(path.to_string_lossy().to_lowercase().contains("pocketllm"));
        }
    }
}
