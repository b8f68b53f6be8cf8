//! Per-channel cursor of the last forwarded message id
//!
//! The file backend keeps a single JSON object `{"channel": last_id}` and
//! rewrites it wholesale on every update. A missing or unreadable file is
//! treated as empty state.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::StateBackend;
use crate::error::Result;

pub type CursorState = HashMap<String, i32>;

/// Load cursor state from a JSON file. Missing or corrupt files yield empty state.
pub fn load_state<P: AsRef<Path>>(path: P) -> CursorState {
    let path = path.as_ref();
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "Cursor file unreadable, starting empty"
                );
            }
            return CursorState::new();
        }
    };

    match serde_json::from_str(&content) {
        Ok(state) => state,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Cursor file corrupt, starting empty");
            CursorState::new()
        }
    }
}

/// Save cursor state, replacing the whole file.
pub async fn save_state<P: AsRef<Path>>(path: P, state: &CursorState) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, serde_json::to_vec(state)?).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[derive(Debug, Clone)]
enum Backend {
    File(PathBuf),
    Memory,
}

/// Cursor store consulted by the live controller.
#[derive(Debug)]
pub struct CursorStore {
    backend: Backend,
    state: CursorState,
}

impl CursorStore {
    /// Open the store for the configured backend, loading persisted state once.
    pub fn open(backend: StateBackend, path: &Path) -> Self {
        match backend {
            StateBackend::File => Self::file(path),
            StateBackend::Memory => Self::memory(),
        }
    }

    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        let path = path.into();
        let state = load_state(&path);
        debug!(path = %path.display(), channels = state.len(), "Loaded cursors");
        Self {
            backend: Backend::File(path),
            state,
        }
    }

    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory,
            state: CursorState::new(),
        }
    }

    /// Last forwarded id for `channel`.
    pub fn get(&self, channel: &str) -> Option<i32> {
        self.state.get(channel).copied()
    }

    /// True when `message_id` is strictly newer than the stored cursor.
    pub fn is_new(&self, channel: &str, message_id: i32) -> bool {
        self.get(channel).map_or(true, |last| message_id > last)
    }

    /// Move the cursor forward and persist it. Older ids never move it back.
    ///
    /// Returns `false` when the id was not newer than the stored cursor.
    pub async fn advance(&mut self, channel: &str, message_id: i32) -> Result<bool> {
        if !self.is_new(channel, message_id) {
            return Ok(false);
        }
        self.state.insert(channel.to_string(), message_id);
        if let Backend::File(path) = &self.backend {
            save_state(path, &self.state).await?;
        }
        Ok(true)
    }

    pub fn snapshot(&self) -> CursorState {
        self.state.clone()
    }
}
