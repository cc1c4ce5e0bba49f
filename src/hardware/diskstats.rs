//! Controller backend reading Linux `/proc/diskstats`.
//!
//! Every whole disk becomes one virtual disk presented as a LUN with the
//! same number. The kernel does not keep request size or latency
//! histograms, so devices from this backend carry none.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::{Controller, Counters, DeviceKind, DeviceStats, Presentation, StoragePool, VirtualDisk};
use crate::error::{Error, Result};

/// The kernel always counts in 512-byte sectors regardless of the device.
const SECTOR_SIZE: u64 = 512;

/// Raw counters from one diskstats line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct RawDiskStats {
    reads_completed: u64,
    sectors_read: u64,
    writes_completed: u64,
    sectors_written: u64,
}

/// Diskstats session for one host.
pub struct DiskstatsController {
    host: String,
    path: PathBuf,
    /// Stable index per device name, in order of first appearance
    indexes: HashMap<String, u32>,
}

impl DiskstatsController {
    /// Open the statistics file for `host`. A `{host}` placeholder in the
    /// configured path is replaced by the host name.
    pub fn open(host: &str, path_template: &str) -> Result<Self> {
        let path = PathBuf::from(path_template.replace("{host}", host));
        let mut controller = Self {
            host: host.to_string(),
            path,
            indexes: HashMap::new(),
        };

        // Fail like a refused connection if the file is not there
        let content = fs::read_to_string(&controller.path).map_err(|e| Error::Connection {
            host: host.to_string(),
            reason: format!("cannot read {}: {}", controller.path.display(), e),
        })?;
        for (device, _) in parse_diskstats(&content) {
            controller.index_of(&device);
        }

        Ok(controller)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn index_of(&mut self, device: &str) -> u32 {
        let next = self.indexes.len() as u32;
        *self.indexes.entry(device.to_string()).or_insert(next)
    }

    fn read(&self) -> Result<String> {
        fs::read_to_string(&self.path).map_err(|e| {
            Error::hardware(&self.host, format!("failed to read {}: {}", self.path.display(), e))
        })
    }
}

impl Controller for DiskstatsController {
    fn firmware_release(&mut self) -> Result<String> {
        // Kernel release stands in for controller firmware
        Ok(fs::read_to_string("/proc/sys/kernel/osrelease")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "0".to_string()))
    }

    fn presentations(&mut self) -> Result<Vec<Presentation>> {
        let mut map: Vec<Presentation> = self
            .indexes
            .values()
            .map(|&index| Presentation {
                virtual_disk: index,
                lun: index,
            })
            .collect();
        map.sort_by_key(|p| p.virtual_disk);
        Ok(map)
    }

    fn storage_pools(&mut self) -> Result<Vec<StoragePool>> {
        Ok(Vec::new())
    }

    fn has_storage_pools(&self) -> bool {
        false
    }

    fn virtual_disks(&mut self) -> Result<Vec<VirtualDisk>> {
        Ok(Vec::new())
    }

    fn list_devices(&mut self, kind: DeviceKind) -> Result<Vec<DeviceStats>> {
        if kind == DeviceKind::DiskDrive {
            return Ok(Vec::new());
        }

        let content = self.read()?;
        let mut devices = Vec::new();
        for (device, stats) in parse_diskstats(&content) {
            let index = self.index_of(&device);
            let kbytes_read = stats.sectors_read * SECTOR_SIZE / 1024;
            let kbytes_written = stats.sectors_written * SECTOR_SIZE / 1024;
            devices.push(DeviceStats {
                index,
                counters: Counters {
                    read_ios: stats.reads_completed,
                    write_ios: stats.writes_completed,
                    total_ios: stats.reads_completed + stats.writes_completed,
                    forwarded_ios: 0,
                    kbytes_read,
                    kbytes_written,
                    kbytes_transferred: kbytes_read + kbytes_written,
                    kbytes_forwarded: 0,
                },
                histograms: None,
            });
        }
        Ok(devices)
    }
}

/// Parse whole-disk lines, skipping partitions and virtual block devices.
fn parse_diskstats(content: &str) -> Vec<(String, RawDiskStats)> {
    let mut out = Vec::new();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 14 {
            continue;
        }

        let device = parts[2];

        // Skip loop devices, ram disks and device-mapper targets
        if device.starts_with("loop") || device.starts_with("ram") || device.starts_with("dm-") {
            continue;
        }

        // Partitions end in a digit (sda1), or carry a 'p' before the digit on nvme (nvme0n1p1)
        let ends_in_digit = device
            .chars()
            .last()
            .map(|c| c.is_ascii_digit())
            .unwrap_or(false);
        let is_partition = if device.starts_with("nvme") {
            device.contains('p') && ends_in_digit
        } else {
            ends_in_digit
        };
        if is_partition {
            continue;
        }

        out.push((
            device.to_string(),
            RawDiskStats {
                reads_completed: parts[3].parse().unwrap_or(0),
                sectors_read: parts[5].parse().unwrap_or(0),
                writes_completed: parts[7].parse().unwrap_or(0),
                sectors_written: parts[9].parse().unwrap_or(0),
            },
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "\
   8       0 sda 1000 10 8000 500 2000 20 16000 900 0 1200 1400 0 0 0 0
   8       1 sda1 900 10 7000 400 1900 20 15000 800 0 1100 1200 0 0 0 0
   7       0 loop0 5 0 10 0 0 0 0 0 0 0 0 0 0 0 0
 259       0 nvme0n1 300 0 2048 10 100 0 1024 5 0 20 15 0 0 0 0
 259       1 nvme0n1p1 200 0 1000 10 50 0 500 5 0 20 15 0 0 0 0
 253       0 dm-0 1 0 1 0 1 0 1 0 0 0 0 0 0 0 0
";

    #[test]
    fn parses_whole_disks_only() {
        let parsed = parse_diskstats(SAMPLE);
        let names: Vec<&str> = parsed.iter().map(|(d, _)| d.as_str()).collect();
        assert_eq!(names, vec!["sda", "nvme0n1"]);
        assert_eq!(parsed[0].1.sectors_written, 16000);
    }

    #[test]
    fn reads_counters_from_host_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctl1.diskstats");
        fs::File::create(&path)
            .unwrap()
            .write_all(SAMPLE.as_bytes())
            .unwrap();

        let template = format!("{}/{{host}}.diskstats", dir.path().display());
        let mut ctl = DiskstatsController::open("ctl1", &template).unwrap();
        assert_eq!(ctl.path(), path.as_path());

        let devices = ctl.list_devices(DeviceKind::VirtualDisk).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].index, 0);
        assert_eq!(devices[0].counters.read_ios, 1000);
        // 8000 sectors * 512 = 4000 KiB
        assert_eq!(devices[0].counters.kbytes_read, 4000);
        assert!(devices[0].histograms.is_none());

        assert_eq!(ctl.presentations().unwrap().len(), 2);
        assert!(ctl.list_devices(DeviceKind::DiskDrive).unwrap().is_empty());
    }

    #[test]
    fn missing_file_is_a_connection_error() {
        assert!(matches!(
            DiskstatsController::open("nowhere", "/nonexistent/{host}/diskstats"),
            Err(Error::Connection { .. })
        ));
    }
}
