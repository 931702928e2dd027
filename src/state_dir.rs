//! Platform-specific state directory resolution, mirroring
//! `gate-tlsforward`'s `TlsForwardStateDir`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;
use tracing::{debug, info, warn};

pub struct StateDir {
    project_dirs: Option<ProjectDirs>,
    override_dir: Option<PathBuf>,
}

impl StateDir {
    pub fn new() -> Self {
        let project_dirs = ProjectDirs::from("ai.hellas", "Gate", "snigate");
        if project_dirs.is_none() {
            warn!("could not determine platform state directory, falling back to ./data");
        }
        Self {
            project_dirs,
            override_dir: None,
        }
    }

    pub fn with_override(path: impl Into<PathBuf>) -> Self {
        Self {
            project_dirs: None,
            override_dir: Some(path.into()),
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.override_dir {
            return dir.join("data");
        }
        self.project_dirs
            .as_ref()
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    pub fn blob_store_path(&self) -> PathBuf {
        self.data_dir().join("sni_map.blob")
    }

    pub async fn create_directories(&self) -> Result<()> {
        let dir = self.data_dir();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create state directory {}", dir.display()))?;
        debug!("state directory ready at {}", dir.display());
        info!("data directory: {}", dir.display());
        Ok(())
    }
}

impl Default for StateDir {
    fn default() -> Self {
        Self::new()
    }
}
