//! Saving and loading captures.
//!
//! Files hold one [`Capture`] in the record layout described in
//! [`crate::window`]. In save-all mode every window is written to
//! `<folder>/<local time>_<NN>.txt`, `NN` being the first free index.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Local;
use log::{debug, warn};

use crate::errors::StoreError;
use crate::window::Capture;

/// How long a save/load message stays visible before reverting.
const STATUS_TTL: Duration = Duration::from_secs(5);
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H%M%S";
const CAPTURE_EXTENSION: &str = "txt";

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Writes captures to disk and keeps a short-lived status line about it.
#[derive(Debug, Default)]
pub struct CaptureStore {
    folder: Option<PathBuf>,
    status: Option<(Instant, String)>,
}

impl CaptureStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_status(&mut self, message: impl Into<String>) {
        self.status = Some((Instant::now(), message.into()));
    }

    fn saving_all_message(folder: &Path) -> String {
        format!("Saving all to {}.", display_name(folder))
    }

    /// Current status. Messages expire after five seconds, falling back to
    /// the save-all notice (or nothing).
    pub fn status(&mut self) -> String {
        self.status_at(Instant::now())
    }

    fn status_at(&mut self, now: Instant) -> String {
        let Some((since, _)) = &self.status else {
            return String::new();
        };
        if now.saturating_duration_since(*since) > STATUS_TTL {
            self.status = self
                .folder
                .as_deref()
                .map(|folder| (now, Self::saving_all_message(folder)));
        }
        self.status
            .as_ref()
            .map(|(_, message)| message.clone())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------------
    // Single files
    // ------------------------------------------------------------------------

    pub fn save_one(&mut self, path: &Path, capture: &Capture) -> Result<(), StoreError> {
        let result = write_capture(path, capture);
        match &result {
            Ok(()) => {
                debug!("capture written: {}", path.display());
                self.set_status("Save complete.");
            }
            Err(e) => {
                warn!("failed to write {}: {}", path.display(), e);
                self.set_status(format!("Error writing to {}.", display_name(path)));
            }
        }
        result
    }

    pub fn load_one(path: &Path) -> Result<Capture, StoreError> {
        let mut text = String::new();
        BufReader::new(File::open(path)?).read_to_string(&mut text)?;
        Capture::from_json(&text)
    }

    // ------------------------------------------------------------------------
    // Save-all mode
    // ------------------------------------------------------------------------

    /// Enables save-all into `folder`, creating it if needed.
    pub fn set_save_all(&mut self, folder: impl Into<PathBuf>) -> Result<(), StoreError> {
        let folder = folder.into();
        if let Err(e) = fs::create_dir_all(&folder) {
            warn!("cannot create {}: {}", folder.display(), e);
            self.set_status("Error creating folders.");
            return Err(e.into());
        }
        self.set_status(Self::saving_all_message(&folder));
        self.folder = Some(folder);
        Ok(())
    }

    pub fn clear_save_all(&mut self) {
        self.folder = None;
    }

    pub fn save_all_folder(&self) -> Option<&Path> {
        self.folder.as_deref()
    }

    /// Writes `capture` into the save-all folder. `Ok(None)` when save-all is off.
    pub fn save_continuous(&mut self, capture: &Capture) -> Result<Option<PathBuf>, StoreError> {
        let Some(folder) = self.folder.clone() else {
            return Ok(None);
        };
        let stamp = Local::now().format(TIMESTAMP_FORMAT).to_string();
        let path = next_free_path(&folder, &stamp);
        self.save_one(&path, capture)?;
        self.set_status(Self::saving_all_message(&folder));
        Ok(Some(path))
    }
}

fn write_capture(path: &Path, capture: &Capture) -> Result<(), StoreError> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(&mut writer, capture)?;
    writer.flush()?;
    Ok(())
}

/// `<folder>/<stamp>_<NN>.txt` with the lowest unused `NN`.
fn next_free_path(folder: &Path, stamp: &str) -> PathBuf {
    (0u32..)
        .map(|i| folder.join(format!("{stamp}_{i:02}.{CAPTURE_EXTENSION}")))
        .find(|p| !p.exists())
        .unwrap_or_else(|| folder.join(format!("{stamp}.{CAPTURE_EXTENSION}")))
}
