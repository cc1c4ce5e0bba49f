//! Deterministic simulated controller couplet.
//!
//! Counters grow linearly with wall time since the session was opened, at
//! a rate derived from the device index, so averages over any window are
//! predictable. Used by tests and for dry runs without hardware.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::{
    Controller, Counters, DeviceKind, DeviceStats, Histograms, Presentation, StoragePool,
    VirtualDisk, EXPECTED_SIZE_LABELS,
};
use crate::config::SimulatedConfig;
use crate::error::{Error, Result};

/// LUN numbers are offset from virtual disk indexes so the mapping is
/// visible in stored data.
const LUN_OFFSET: u32 = 100;

/// Simulated controller session.
pub struct SimulatedController {
    host: String,
    opened: Instant,
    luns: u32,
    drives: u32,
    firmware: String,
    size_labels: Vec<String>,
    polls: Arc<AtomicU64>,
}

impl SimulatedController {
    /// Open a session. Hosts listed as unreachable fail like a real
    /// connection attempt would.
    pub fn connect(host: &str, config: &SimulatedConfig) -> Result<Self> {
        if config.unreachable.iter().any(|h| h == host) {
            return Err(Error::Connection {
                host: host.to_string(),
                reason: "no route to host (simulated)".to_string(),
            });
        }

        Ok(Self {
            host: host.to_string(),
            opened: Instant::now(),
            luns: config.luns,
            drives: config.drives,
            firmware: config.firmware.clone(),
            size_labels: EXPECTED_SIZE_LABELS.iter().map(|s| s.to_string()).collect(),
            polls: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Replace the request size labels reported for every device.
    pub fn with_size_labels(mut self, labels: Vec<String>) -> Self {
        self.size_labels = labels;
        self
    }

    /// Shared counter of statistics queries, readable after the controller
    /// has been moved into a worker.
    pub fn poll_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.polls)
    }

    fn device(&self, kind: DeviceKind, index: u32, elapsed: f64) -> DeviceStats {
        let scale = f64::from(index + 1);
        let reads = (100.0 * scale * elapsed) as u64;
        let writes = (50.0 * scale * elapsed) as u64;
        let forwarded = match kind {
            DeviceKind::VirtualDisk => (5.0 * scale * elapsed) as u64,
            DeviceKind::DiskDrive => 0,
        };

        // 64 KiB reads, 128 KiB writes
        let kbytes_read = reads * 64;
        let kbytes_written = writes * 128;

        let counters = Counters {
            read_ios: reads,
            write_ios: writes,
            total_ios: reads + writes,
            forwarded_ios: forwarded,
            kbytes_read,
            kbytes_written,
            kbytes_transferred: kbytes_read + kbytes_written,
            kbytes_forwarded: forwarded * 64,
        };

        let latency_labels = kind
            .expected_latency_labels()
            .iter()
            .map(|s| s.to_string())
            .collect();

        DeviceStats {
            index,
            counters,
            histograms: Some(Histograms {
                size_labels: self.size_labels.clone(),
                latency_labels,
                read_sizes: spread(reads, 4),
                write_sizes: spread(writes, 5),
                read_latencies: spread(reads, 0),
                write_latencies: spread(writes, 1),
            }),
        }
    }
}

/// Distribute `total` over 12 buckets, most of it in bucket `peak`.
fn spread(total: u64, peak: usize) -> Vec<u64> {
    let mut buckets = vec![total / 100; 12];
    let assigned: u64 = buckets.iter().sum();
    buckets[peak] += total - assigned;
    buckets
}

impl Controller for SimulatedController {
    fn firmware_release(&mut self) -> Result<String> {
        Ok(self.firmware.clone())
    }

    fn presentations(&mut self) -> Result<Vec<Presentation>> {
        Ok((0..self.luns)
            .map(|vd| Presentation {
                virtual_disk: vd,
                lun: vd + LUN_OFFSET,
            })
            .collect())
    }

    fn storage_pools(&mut self) -> Result<Vec<StoragePool>> {
        Ok((0..self.luns)
            .map(|index| StoragePool { index, state: 0 })
            .collect())
    }

    fn virtual_disks(&mut self) -> Result<Vec<VirtualDisk>> {
        Ok((0..self.luns)
            .map(|index| VirtualDisk { index, pool: index })
            .collect())
    }

    fn list_devices(&mut self, kind: DeviceKind) -> Result<Vec<DeviceStats>> {
        self.polls.fetch_add(1, Ordering::Relaxed);
        let elapsed = self.opened.elapsed().as_secs_f64();
        let count = match kind {
            DeviceKind::VirtualDisk => self.luns,
            DeviceKind::DiskDrive => self.drives,
        };
        tracing::trace!(host = %self.host, ?kind, count, "simulated statistics query");
        Ok((0..count).map(|i| self.device(kind, i, elapsed)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{check_labels, DeviceId};

    fn config() -> SimulatedConfig {
        SimulatedConfig {
            luns: 3,
            drives: 2,
            ..Default::default()
        }
    }

    #[test]
    fn unreachable_host_fails_to_connect() {
        let config = SimulatedConfig {
            unreachable: vec!["dead".to_string()],
            ..config()
        };
        assert!(matches!(
            SimulatedController::connect("dead", &config),
            Err(Error::Connection { .. })
        ));
        assert!(SimulatedController::connect("alive", &config).is_ok());
    }

    #[test]
    fn reports_expected_labels() {
        let mut ctl = SimulatedController::connect("h", &config()).unwrap();
        for stats in ctl.list_devices(DeviceKind::VirtualDisk).unwrap() {
            check_labels("h", DeviceId::lun(stats.index), &stats).unwrap();
        }
        for stats in ctl.list_devices(DeviceKind::DiskDrive).unwrap() {
            check_labels("h", DeviceId::drive(stats.index), &stats).unwrap();
        }
        assert_eq!(ctl.poll_counter().load(Ordering::Relaxed), 2);
    }

    #[test]
    fn presentations_cover_every_virtual_disk() {
        let mut ctl = SimulatedController::connect("h", &config()).unwrap();
        let map = ctl.presentations().unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(map[2], Presentation { virtual_disk: 2, lun: 102 });
    }

    #[test]
    fn histogram_buckets_sum_to_total() {
        let buckets = spread(1234, 3);
        assert_eq!(buckets.len(), 12);
        assert_eq!(buckets.iter().sum::<u64>(), 1234);
    }
}
