//! In-memory sink. Points stay inspectable through a shared handle after
//! the sink has been moved into a worker.

use std::sync::{Arc, Mutex};

use super::{Point, Storage};
use crate::error::Result;

pub type SharedPoints = Arc<Mutex<Vec<Point>>>;

#[derive(Default)]
pub struct MemoryStorage {
    points: SharedPoints,
    flushes: Arc<Mutex<u64>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared view of everything written so far.
    pub fn handle(&self) -> SharedPoints {
        Arc::clone(&self.points)
    }

    /// Shared count of `flush` calls.
    pub fn flush_counter(&self) -> Arc<Mutex<u64>> {
        Arc::clone(&self.flushes)
    }
}

impl Storage for MemoryStorage {
    fn write(&mut self, point: Point) -> Result<()> {
        if let Ok(mut points) = self.points.lock() {
            points.push(point);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Ok(mut flushes) = self.flushes.lock() {
            *flushes += 1;
        }
        Ok(())
    }
}
