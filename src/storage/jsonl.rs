//! JSON Lines sink: one serialized [`Point`] per line.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::{Point, Storage};
use crate::error::Result;

/// Sink appending points to a JSON Lines file
pub struct JsonlStorage {
    path: PathBuf,
    writer: BufWriter<File>,
    points_written: u64,
}

impl JsonlStorage {
    /// Open `path` for appending. A restarted worker keeps adding to the
    /// same file.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            writer: BufWriter::new(file),
            points_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the number of points written
    pub fn points_written(&self) -> u64 {
        self.points_written
    }
}

impl Storage for JsonlStorage {
    fn write(&mut self, point: Point) -> Result<()> {
        let json = serde_json::to_string(&point)?;
        writeln!(self.writer, "{}", json)?;
        self.points_written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for JsonlStorage {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}
