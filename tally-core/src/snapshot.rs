/*!
Snapshot file codec.

A snapshot is the complete state of a storage engine written as a JSON
array of metric records. Every save rewrites the whole file: the data goes
to a temporary file in the target directory which is then renamed over the
previous snapshot, so readers only ever see a complete file.
*/

use crate::metric::{Metric, MetricRecord};
use crate::{Result, TallyError};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Location of a snapshot on the local filesystem
///
/// # Example
/// ```rust
/// use tally_core::{Metric, SnapshotFile};
///
/// let dir = tempfile::tempdir()?;
/// let file = SnapshotFile::new(dir.path().join("metrics.json"));
/// file.save(&[Metric::counter("PollCount", 3)])?;
/// assert_eq!(file.load()?, Some(vec![Metric::counter("PollCount", 3)]));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ensure the parent directory exists, creating it if necessary
    fn ensure_parent_dir(&self) -> Result<&Path> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                TallyError::storage(format!(
                    "Failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        Ok(parent)
    }

    /// Serialize `metrics` and atomically replace the snapshot file
    pub fn save(&self, metrics: &[Metric]) -> Result<()> {
        let records: Vec<MetricRecord> = metrics.iter().map(MetricRecord::from).collect();
        let data = serde_json::to_vec(&records)?;

        let parent = self.ensure_parent_dir()?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| {
            TallyError::storage(format!(
                "Failed to write snapshot to {}: {}",
                self.path.display(),
                e.error
            ))
        })?;
        Ok(())
    }

    /// Read the snapshot back
    ///
    /// # Returns
    /// `Ok(None)` when no snapshot has been written yet.
    ///
    /// # Errors
    /// * `TallyError::Json` - the file is not a JSON array of records
    /// * `TallyError::Validation` - a record has an unknown kind or missing value
    pub fn load(&self) -> Result<Option<Vec<Metric>>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let records: Vec<MetricRecord> = serde_json::from_slice(&data)?;
        let metrics = records
            .into_iter()
            .map(Metric::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(metrics))
    }
}
