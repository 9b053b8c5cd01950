use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::link_source::Item;

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("Failed to serialize progress state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Failed to write progress file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

/// Which items are done, which failed, and the cached link table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    #[serde(default)]
    pub completed: BTreeSet<u32>,
    #[serde(default)]
    pub failed: BTreeSet<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub links: BTreeMap<u32, Item>,
}

impl ProgressState {
    /// Restore `completed ∩ failed = ∅` on hand-edited files; completed wins.
    fn normalize(&mut self) {
        let overlap: Vec<u32> = self.failed.intersection(&self.completed).copied().collect();
        for no in overlap {
            warn!("Item {} listed as both completed and failed; keeping completed.", no);
            self.failed.remove(&no);
        }
    }
}

/// Owns the progress file. Every mutation is written through immediately.
#[derive(Debug)]
pub struct ProgressStore {
    path: PathBuf,
    state: ProgressState,
}

impl ProgressStore {
    /// Load state from `path`. Never fails: a missing or unreadable file
    /// starts a fresh state.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<ProgressState>(&content) {
                    Ok(mut state) => {
                        state.normalize();
                        info!(
                            "Resumed previous session: {} completed, {} failed, {} cached links.",
                            state.completed.len(),
                            state.failed.len(),
                            state.links.len()
                        );
                        state
                    }
                    Err(e) => {
                        error!("Failed to parse progress file {:?}: {}. Starting fresh.", path, e);
                        ProgressState::default()
                    }
                },
                Err(e) => {
                    error!("Failed to read progress file {:?}: {}. Starting fresh.", path, e);
                    ProgressState::default()
                }
            }
        } else {
            info!("No progress file found. Starting fresh.");
            ProgressState::default()
        };

        ProgressStore { path, state }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn is_completed(&self, no: u32) -> bool {
        self.state.completed.contains(&no)
    }

    pub fn is_failed(&self, no: u32) -> bool {
        self.state.failed.contains(&no)
    }

    pub fn completed_count(&self) -> usize {
        self.state.completed.len()
    }

    pub fn failed_count(&self) -> usize {
        self.state.failed.len()
    }

    pub fn failed_items(&self) -> Vec<u32> {
        self.state.failed.iter().copied().collect()
    }

    pub fn mark_completed(&mut self, no: u32) -> Result<(), ProgressError> {
        self.state.failed.remove(&no);
        self.state.completed.insert(no);
        self.save()
    }

    pub fn mark_failed(&mut self, no: u32) -> Result<(), ProgressError> {
        if self.state.completed.contains(&no) {
            warn!("Item {} is already completed; not marking it failed.", no);
            return Ok(());
        }
        self.state.failed.insert(no);
        self.save()
    }

    /// Cached link table, ascending by item number.
    pub fn cached_items(&self) -> Vec<Item> {
        self.state.links.values().cloned().collect()
    }

    pub fn store_links(&mut self, items: &[Item]) -> Result<(), ProgressError> {
        self.state.links = items.iter().map(|item| (item.no, item.clone())).collect();
        self.save()
    }

    /// Write the state to a sibling temp file and rename it into place, so an
    /// interrupted write never leaves a truncated progress file behind.
    pub fn save(&self) -> Result<(), ProgressError> {
        let json = serde_json::to_string_pretty(&self.state)?;
        let io_err = |source: std::io::Error| ProgressError::Io {
            path: self.path.display().to_string(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let temp_path = self.temp_path();
        let mut file = File::create(&temp_path).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        fs::rename(&temp_path, &self.path).map_err(io_err)
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "progress.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
