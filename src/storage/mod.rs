//! Storage collaborator: where computed rates and histograms end up.
//!
//! Each worker opens its own sink. Every point carries the epoch the
//! supervisor broadcast for the cycle, so points from different hosts in
//! the same cycle share a timestamp.

pub mod jsonl;
pub mod memory;
pub mod text;

use std::fs;
use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{StorageConfig, StorageFormat};
use crate::error::{Error, Result};
use crate::hardware::{bucket_name, Counters, DeviceId, Metric, EXPECTED_SIZE_LABELS};

pub use jsonl::JsonlStorage;
pub use memory::MemoryStorage;
pub use text::TextStorage;

/// Pool state stored when the controller did not report one.
pub const POOL_STATE_UNKNOWN: u8 = 255;

/// Which histogram a set of buckets belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistogramKind {
    RequestSize,
    Latency,
}

impl HistogramKind {
    /// Measurement name, e.g. `read_request_sizes`.
    pub fn measurement(self, is_read: bool) -> &'static str {
        match (self, is_read) {
            (HistogramKind::RequestSize, true) => "read_request_sizes",
            (HistogramKind::RequestSize, false) => "write_request_sizes",
            (HistogramKind::Latency, true) => "read_request_latencies",
            (HistogramKind::Latency, false) => "write_request_latencies",
        }
    }
}

/// One histogram bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub label: String,
    pub count: u64,
}

/// A stored data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Point {
    Rate {
        time: DateTime<Utc>,
        host: String,
        device: DeviceId,
        metric: Metric,
        value: f64,
    },
    Histogram {
        time: DateTime<Utc>,
        host: String,
        device: DeviceId,
        kind: HistogramKind,
        is_read: bool,
        buckets: Vec<Bucket>,
    },
    Counters {
        time: DateTime<Utc>,
        host: String,
        device: DeviceId,
        counters: Counters,
        pool_state: u8,
    },
}

impl Point {
    pub fn host(&self) -> &str {
        match self {
            Point::Rate { host, .. } | Point::Histogram { host, .. } | Point::Counters { host, .. } => host,
        }
    }

    pub fn time(&self) -> DateTime<Utc> {
        match self {
            Point::Rate { time, .. } | Point::Histogram { time, .. } | Point::Counters { time, .. } => *time,
        }
    }
}

/// Storage collaborator contract.
///
/// Sinks implement [`Storage::write`] and [`Storage::flush`]; the push
/// methods build points. The core never retries a failed push.
pub trait Storage: Send {
    fn write(&mut self, point: Point) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    fn push_rate(
        &mut self,
        host: &str,
        device: DeviceId,
        epoch: u64,
        metric: Metric,
        value: f64,
    ) -> Result<()> {
        self.write(Point::Rate {
            time: epoch_time(epoch),
            host: host.to_string(),
            device,
            metric,
            value,
        })
    }

    fn push_histogram(
        &mut self,
        host: &str,
        device: DeviceId,
        epoch: u64,
        kind: HistogramKind,
        is_read: bool,
        counts: &[u64],
    ) -> Result<()> {
        let labels: &[&str] = match kind {
            HistogramKind::RequestSize => &EXPECTED_SIZE_LABELS,
            HistogramKind::Latency => device.kind.expected_latency_labels(),
        };
        if counts.len() != labels.len() {
            return Err(Error::Storage(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "{} for {device}: expected {} buckets, got {}",
                    kind.measurement(is_read),
                    labels.len(),
                    counts.len()
                ),
            )));
        }

        let buckets = labels
            .iter()
            .zip(counts)
            .map(|(label, &count)| Bucket {
                label: bucket_name(label).to_string(),
                count,
            })
            .collect();

        self.write(Point::Histogram {
            time: epoch_time(epoch),
            host: host.to_string(),
            device,
            kind,
            is_read,
            buckets,
        })
    }

    fn push_counters(
        &mut self,
        host: &str,
        device: DeviceId,
        epoch: u64,
        counters: &Counters,
        pool_state: u8,
    ) -> Result<()> {
        self.write(Point::Counters {
            time: epoch_time(epoch),
            host: host.to_string(),
            device,
            counters: *counters,
            pool_state,
        })
    }
}

/// Convert a broadcast epoch (Unix seconds) to a UTC timestamp.
pub fn epoch_time(epoch: u64) -> DateTime<Utc> {
    i64::try_from(epoch)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_default()
}

/// Open the configured sink for `host`, creating the data directory.
pub fn open(host: &str, config: &StorageConfig) -> Result<Box<dyn Storage>> {
    fs::create_dir_all(&config.directory)?;
    let sink: Box<dyn Storage> = match config.format {
        StorageFormat::Jsonl => {
            Box::new(JsonlStorage::new(config.directory.join(format!("{host}.jsonl")))?)
        }
        StorageFormat::Text => {
            Box::new(TextStorage::new(config.directory.join(format!("{host}.log")))?)
        }
    };
    tracing::debug!(host, format = ?config.format, "storage sink opened");
    Ok(sink)
}
