//! Human-readable sink: one aligned line per point.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::Utc;
use num_format::{Locale, ToFormattedString};

use super::{Point, Storage};
use crate::error::Result;

/// Sink writing aligned text lines, for eyeballing a controller by hand
pub struct TextStorage {
    writer: BufWriter<File>,
    points_written: u64,
}

impl TextStorage {
    /// Open `path` for appending. The column header is written only when
    /// the file is new or empty.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        let is_empty = file.metadata()?.len() == 0;

        let mut storage = Self {
            writer: BufWriter::new(file),
            points_written: 0,
        };

        if is_empty {
            writeln!(storage.writer, "# ddnpoll storage log")?;
            writeln!(storage.writer, "# Started: {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"))?;
            writeln!(storage.writer, "#")?;
            writeln!(storage.writer, "#   rate     - average over the configured span (per second)")?;
            writeln!(storage.writer, "#   counters - raw cumulative counters and pool state")?;
            writeln!(storage.writer, "#   hist     - histogram buckets as label=count")?;
            writeln!(storage.writer, "#")?;
            writeln!(
                storage.writer,
                "{:<19} {:<10} {:<10} {:<8} {}",
                "Time", "Host", "Device", "Type", "Values"
            )?;
            writeln!(storage.writer, "{}", "-".repeat(80))?;
        }

        Ok(storage)
    }

    /// Get the number of points written
    pub fn points_written(&self) -> u64 {
        self.points_written
    }
}

impl Storage for TextStorage {
    fn write(&mut self, point: Point) -> Result<()> {
        let time = point.time().format("%Y-%m-%d %H:%M:%S");
        match &point {
            Point::Rate {
                host,
                device,
                metric,
                value,
                ..
            } => {
                let value = if metric.is_bytes() {
                    format_throughput(*value)
                } else {
                    format!("{:.1}/s", value)
                };
                writeln!(
                    self.writer,
                    "{:<19} {:<10} {:<10} {:<8} {} {}",
                    time,
                    host,
                    device.to_string(),
                    "rate",
                    metric,
                    value
                )?;
            }
            Point::Counters {
                host,
                device,
                counters,
                pool_state,
                ..
            } => {
                let pool = match *pool_state {
                    super::POOL_STATE_UNKNOWN => "?".to_string(),
                    state => state.to_string(),
                };
                writeln!(
                    self.writer,
                    "{:<19} {:<10} {:<10} {:<8} ios r={} w={} fwd={} data r={} w={} fwd={} pool={}",
                    time,
                    host,
                    device.to_string(),
                    "counters",
                    counters.read_ios.to_formatted_string(&Locale::en),
                    counters.write_ios.to_formatted_string(&Locale::en),
                    counters.forwarded_ios.to_formatted_string(&Locale::en),
                    format_bytes(counters.kbytes_read.saturating_mul(1024)),
                    format_bytes(counters.kbytes_written.saturating_mul(1024)),
                    format_bytes(counters.kbytes_forwarded.saturating_mul(1024)),
                    pool,
                )?;
            }
            Point::Histogram {
                host,
                device,
                kind,
                is_read,
                buckets,
                ..
            } => {
                let buckets: Vec<String> = buckets
                    .iter()
                    .map(|b| format!("{}={}", b.label, b.count))
                    .collect();
                writeln!(
                    self.writer,
                    "{:<19} {:<10} {:<10} {:<8} {} {}",
                    time,
                    host,
                    device.to_string(),
                    "hist",
                    kind.measurement(*is_read),
                    buckets.join(" ")
                )?;
            }
        }
        self.points_written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Drop for TextStorage {
    fn drop(&mut self) {
        let _ = self.writer.flush();
    }
}

/// IEC units, matching the KiB granularity controllers count in.
const BINARY_UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];

/// Largest binary unit that keeps `value` at or above 1, and `value` in it.
fn scale_binary(value: f64) -> (f64, &'static str) {
    let mut scaled = value;
    let mut unit = 0;
    while scaled >= 1024.0 && unit + 1 < BINARY_UNITS.len() {
        scaled /= 1024.0;
        unit += 1;
    }
    (scaled, BINARY_UNITS[unit])
}

/// Byte count in binary units, e.g. `1.50 KiB`. Plain bytes have no fraction.
pub fn format_bytes(bytes: u64) -> String {
    match scale_binary(bytes as f64) {
        (value, "B") => format!("{value:.0} B"),
        (value, unit) => format!("{value:.2} {unit}"),
    }
}

pub fn format_throughput(bytes_per_sec: f64) -> String {
    match scale_binary(bytes_per_sec) {
        (value, "B") => format!("{value:.0} B/s"),
        (value, unit) => format!("{value:.2} {unit}/s"),
    }
}
