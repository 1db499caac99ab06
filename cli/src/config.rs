use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use recall_core::SessionConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub session: SessionConfig,
}

/// Per-user data directory, falling back to `./data` when the platform has none.
pub fn data_dir() -> PathBuf {
    ProjectDirs::from("com", "recall", "Recall")
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Read `path`, writing a default file first if it does not exist.
pub fn load_config(path: &Path) -> io::Result<ConfigFile> {
    if path.exists() {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(io::Error::other)
    } else {
        let cfg = ConfigFile::default();
        let content = toml::to_string_pretty(&cfg).map_err(io::Error::other)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        info!(path = %path.display(), "wrote default config");
        Ok(cfg)
    }
}
