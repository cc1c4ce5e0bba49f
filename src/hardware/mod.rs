//! Storage controller access.
//!
//! The worker only talks to hardware through [`Controller`]. Two backends
//! ship with the crate: a deterministic simulated controller couplet and a
//! reader for Linux `/proc/diskstats`.

pub mod diskstats;
pub mod sim;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::{Backend, HardwareConfig};
use crate::error::{Error, Result};

pub use diskstats::DiskstatsController;
pub use sim::SimulatedController;

/// Request size buckets every device must report, in order.
pub const EXPECTED_SIZE_LABELS: [&str; 12] = [
    "IO Size <=4KiB",
    "IO Size <=8KiB",
    "IO Size <=16KiB",
    "IO Size <=32KiB",
    "IO Size <=64KiB",
    "IO Size <=128KiB",
    "IO Size <=256KiB",
    "IO Size <=512KiB",
    "IO Size <=1MiB",
    "IO Size <=2MiB",
    "IO Size <=4MiB",
    "IO Size >4MiB",
];

/// Latency buckets reported for virtual disks.
pub const EXPECTED_LUN_LATENCY_LABELS: [&str; 12] = [
    "Latency Counts <=16ms",
    "Latency Counts <=32ms",
    "Latency Counts <=64ms",
    "Latency Counts <=128ms",
    "Latency Counts <=256ms",
    "Latency Counts <=512ms",
    "Latency Counts <=1s",
    "Latency Counts <=2s",
    "Latency Counts <=4s",
    "Latency Counts <=8s",
    "Latency Counts <=16s",
    "Latency Counts >16s",
];

/// Latency buckets reported for physical drives (finer at the low end).
pub const EXPECTED_DRIVE_LATENCY_LABELS: [&str; 12] = [
    "Latency Counts <=4ms",
    "Latency Counts <=8ms",
    "Latency Counts <=16ms",
    "Latency Counts <=32ms",
    "Latency Counts <=64ms",
    "Latency Counts <=128ms",
    "Latency Counts <=256ms",
    "Latency Counts <=512ms",
    "Latency Counts <=1s",
    "Latency Counts <=2s",
    "Latency Counts <=4s",
    "Latency Counts >4s",
];

/// Kind of monitored sub-unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Logical disk, reported to storage by its LUN number.
    #[serde(rename = "lun")]
    VirtualDisk,
    #[serde(rename = "drive")]
    DiskDrive,
}

impl DeviceKind {
    /// Latency labels the controller must report for this kind.
    pub fn expected_latency_labels(self) -> &'static [&'static str; 12] {
        match self {
            DeviceKind::VirtualDisk => &EXPECTED_LUN_LATENCY_LABELS,
            DeviceKind::DiskDrive => &EXPECTED_DRIVE_LATENCY_LABELS,
        }
    }
}

/// Identity of a device as seen by storage: LUN number for virtual disks,
/// drive index for drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    pub kind: DeviceKind,
    pub number: u32,
}

impl DeviceId {
    pub fn lun(number: u32) -> Self {
        Self {
            kind: DeviceKind::VirtualDisk,
            number,
        }
    }

    pub fn drive(number: u32) -> Self {
        Self {
            kind: DeviceKind::DiskDrive,
            number,
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::VirtualDisk => write!(f, "lun {}", self.number),
            DeviceKind::DiskDrive => write!(f, "drive {}", self.number),
        }
    }
}

/// Cumulative counters for one device, summed over both controllers of
/// the couplet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub read_ios: u64,
    pub write_ios: u64,
    pub total_ios: u64,
    pub forwarded_ios: u64,
    pub kbytes_read: u64,
    pub kbytes_written: u64,
    pub kbytes_transferred: u64,
    pub kbytes_forwarded: u64,
}

/// Request size and latency histograms with the labels the controller
/// attached to them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Histograms {
    pub size_labels: Vec<String>,
    pub latency_labels: Vec<String>,
    pub read_sizes: Vec<u64>,
    pub write_sizes: Vec<u64>,
    pub read_latencies: Vec<u64>,
    pub write_latencies: Vec<u64>,
}

/// One statistics record as returned by [`Controller::list_devices`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStats {
    /// Controller-side index (virtual disk index or drive index).
    pub index: u32,
    pub counters: Counters,
    /// Absent for backends without per-request histograms.
    pub histograms: Option<Histograms>,
}

/// Maps a virtual disk to the LUN it is presented as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presentation {
    pub virtual_disk: u32,
    pub lun: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoragePool {
    pub index: u32,
    pub state: u8,
}

/// Virtual disk to storage pool membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualDisk {
    pub index: u32,
    pub pool: u32,
}

/// Rate metrics tracked for every device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    ReadIops,
    WriteIops,
    TransferBytes,
    ReadBytes,
    WriteBytes,
    ForwardedBytes,
    ForwardedIops,
}

impl Metric {
    pub const ALL: [Metric; 7] = [
        Metric::ReadIops,
        Metric::WriteIops,
        Metric::TransferBytes,
        Metric::ReadBytes,
        Metric::WriteBytes,
        Metric::ForwardedBytes,
        Metric::ForwardedIops,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Metric::ReadIops => "read_iops",
            Metric::WriteIops => "write_iops",
            Metric::TransferBytes => "transfer_bytes",
            Metric::ReadBytes => "read_bytes",
            Metric::WriteBytes => "write_bytes",
            Metric::ForwardedBytes => "forwarded_bytes",
            Metric::ForwardedIops => "forwarded_iops",
        }
    }

    /// Position in [`Metric::ALL`].
    pub fn slot(self) -> usize {
        self as usize
    }

    /// True for byte counters (rates are bytes per second).
    pub fn is_bytes(self) -> bool {
        matches!(
            self,
            Metric::TransferBytes | Metric::ReadBytes | Metric::WriteBytes | Metric::ForwardedBytes
        )
    }

    /// Cumulative value of this metric. KiB counters are converted to bytes.
    pub fn value(self, c: &Counters) -> u64 {
        match self {
            Metric::ReadIops => c.read_ios,
            Metric::WriteIops => c.write_ios,
            Metric::TransferBytes => c.kbytes_transferred * 1024,
            Metric::ReadBytes => c.kbytes_read * 1024,
            Metric::WriteBytes => c.kbytes_written * 1024,
            Metric::ForwardedBytes => c.kbytes_forwarded * 1024,
            Metric::ForwardedIops => c.forwarded_ios,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Hardware collaborator contract.
///
/// Implementations hold an open session to one controller couplet. All
/// calls may block on network I/O.
pub trait Controller: Send {
    /// Firmware release string, e.g. `"3.1.0.0"`.
    fn firmware_release(&mut self) -> Result<String>;

    fn presentations(&mut self) -> Result<Vec<Presentation>>;

    fn storage_pools(&mut self) -> Result<Vec<StoragePool>>;

    /// False for backends with no notion of storage pools. Their LUNs are
    /// stored with an unknown pool state and nothing is logged for it.
    fn has_storage_pools(&self) -> bool {
        true
    }

    fn virtual_disks(&mut self) -> Result<Vec<VirtualDisk>>;

    /// Current statistics for every device of `kind`.
    fn list_devices(&mut self, kind: DeviceKind) -> Result<Vec<DeviceStats>>;
}

/// Open a session to `host` using the configured backend.
pub fn connect(host: &str, config: &HardwareConfig) -> Result<Box<dyn Controller>> {
    tracing::debug!(host, backend = ?config.backend, "connecting to controller");
    let controller: Box<dyn Controller> = match config.backend {
        Backend::Simulated => Box::new(SimulatedController::connect(host, &config.simulated)?),
        Backend::Diskstats => Box::new(DiskstatsController::open(host, &config.diskstats_path)?),
    };
    tracing::debug!(host, "connection established");
    Ok(controller)
}

/// Check the bucket labels of one device against the hard-coded sets.
pub fn check_labels(host: &str, device: DeviceId, stats: &DeviceStats) -> Result<()> {
    let Some(histograms) = &stats.histograms else {
        return Ok(());
    };

    if !labels_match(&histograms.size_labels, &EXPECTED_SIZE_LABELS) {
        return Err(Error::UnexpectedMetadata {
            host: host.to_string(),
            device,
            what: "request size",
            found: histograms.size_labels.clone(),
        });
    }
    if !labels_match(&histograms.latency_labels, device.kind.expected_latency_labels()) {
        return Err(Error::UnexpectedMetadata {
            host: host.to_string(),
            device,
            what: "latency",
            found: histograms.latency_labels.clone(),
        });
    }
    Ok(())
}

fn labels_match(found: &[String], expected: &[&str]) -> bool {
    found.len() == expected.len() && found.iter().zip(expected).all(|(f, e)| f == e)
}

/// Storage-side name of a bucket: the label without its
/// `IO Size `/`Latency Counts ` prefix.
pub fn bucket_name(label: &str) -> &str {
    label.rsplit_once(' ').map_or(label, |(_, name)| name)
}

/// Fail unless `found` is at least `minimum`.
///
/// Versions are dot-separated; each component is compared by its leading
/// digits, left to right, and only as many components as both strings
/// have are compared.
pub fn verify_firmware(host: &str, found: &str, minimum: &str) -> Result<()> {
    let too_old = || Error::FirmwareTooOld {
        host: host.to_string(),
        found: found.to_string(),
        minimum: minimum.to_string(),
    };

    for (f, m) in found.split('.').zip(minimum.split('.')) {
        let f = leading_number(f)
            .ok_or_else(|| Error::hardware(host, format!("unparseable firmware release '{found}'")))?;
        let m = leading_number(m)
            .ok_or_else(|| Error::Config(format!("unparseable minimum firmware '{minimum}'")))?;
        if f > m {
            return Ok(());
        }
        if f < m {
            return Err(too_old());
        }
    }
    Ok(())
}

fn leading_number(component: &str) -> Option<u64> {
    let digits: String = component
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
