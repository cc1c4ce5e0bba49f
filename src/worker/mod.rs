//! One host's polling lifecycle.
//!
//! A worker owns the controller session, one [`RateSeries`] per metric and
//! device, and the storage sink for its host. It does nothing on its own
//! clock: every cycle starts when the supervisor sends a wake carrying the
//! shared epoch, and ends with an acknowledgement of that epoch.

pub mod link;

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use crate::config::{Config, HardwareConfig, PollingConfig};
use crate::error::Result;
use crate::hardware::{
    self, check_labels, verify_firmware, Controller, DeviceId, DeviceKind, DeviceStats, Metric,
};
use crate::scheduler::PollScheduler;
use crate::series::RateSeries;
use crate::storage::{self, HistogramKind, Storage, POOL_STATE_UNKNOWN};

pub use link::{ChannelLink, PipeLink, Signal, WakeLink, SHUTDOWN_EPOCH};

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Initializing,
    Ready,
    WaitingForWake,
    Polling,
    ShuttingDown,
    Exited,
}

/// Series and latest statistics for one device.
pub struct DeviceState {
    id: DeviceId,
    /// Indexed by [`Metric::slot`]
    series: Vec<RateSeries>,
    /// Record from the most recent fast poll; `None` if the device was
    /// missing from it.
    stats: Option<DeviceStats>,
}

impl DeviceState {
    fn new(id: DeviceId, capacity: Option<usize>) -> Self {
        Self {
            id,
            series: Metric::ALL.iter().map(|_| RateSeries::new(capacity)).collect(),
            stats: None,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn series(&self, metric: Metric) -> &RateSeries {
        &self.series[metric.slot()]
    }

    pub fn stats(&self) -> Option<&DeviceStats> {
        self.stats.as_ref()
    }

    /// Average of every metric that has one over `span`. Metrics that
    /// cannot be averaged yet are logged and left out.
    fn rates(&self, host: &str, span: Duration) -> Vec<(Metric, f64)> {
        let mut rates = Vec::with_capacity(Metric::ALL.len());
        for metric in Metric::ALL {
            match self.series(metric).average(span) {
                Ok(average) => {
                    if average.counter_reset {
                        tracing::warn!(host, device = %self.id, %metric, "counter went backwards inside the averaging window");
                    }
                    rates.push((metric, average.rate));
                }
                Err(e) => {
                    tracing::info!(host, device = %self.id, %metric, error = %e, "skipping rate this cycle");
                }
            }
        }
        rates
    }

    /// Append every metric of `stats` at `now` and cache the record.
    fn record(&mut self, host: &str, stats: DeviceStats, now: Instant) {
        for metric in Metric::ALL {
            let value = metric.value(&stats.counters);
            if let Err(e) = self.series[metric.slot()].append_at(value, now) {
                tracing::warn!(host, device = %self.id, %metric, error = %e, "sample dropped");
            }
        }
        self.stats = Some(stats);
    }
}

/// Polling worker for one controller couplet.
pub struct Worker {
    host: String,
    polling: PollingConfig,
    track_disk_drives: bool,
    controller: Box<dyn Controller>,
    storage: Box<dyn Storage>,
    scheduler: PollScheduler,
    state: WorkerState,
    /// Virtual disk index -> LUN number
    lun_map: BTreeMap<u32, u32>,
    /// LUN number -> state of the pool the LUN is built from
    pool_states: HashMap<u32, u8>,
    /// The backend reports storage pools; a LUN missing from
    /// `pool_states` is then worth an error.
    has_pools: bool,
    devices: BTreeMap<DeviceId, DeviceState>,
}

impl Worker {
    /// Open the storage sink and controller session for `host`, then
    /// initialize.
    pub fn connect(host: &str, config: &Config) -> Result<Self> {
        let storage = storage::open(host, &config.storage)?;
        let controller = hardware::connect(host, &config.hardware)?;
        Self::new(host, &config.polling, &config.hardware, controller, storage)
    }

    /// Initialize a worker over already-open collaborators.
    ///
    /// Fails if the firmware is too old or any device reports bucket
    /// labels that do not match the known sets.
    pub fn new(
        host: &str,
        polling: &PollingConfig,
        hardware: &HardwareConfig,
        controller: Box<dyn Controller>,
        storage: Box<dyn Storage>,
    ) -> Result<Self> {
        let has_pools = controller.has_storage_pools();
        let mut worker = Self {
            host: host.to_string(),
            polling: polling.clone(),
            track_disk_drives: hardware.track_disk_drives,
            controller,
            storage,
            scheduler: PollScheduler::new(polling.medium_poll_multiple, polling.slow_poll_multiple),
            state: WorkerState::Initializing,
            lun_map: BTreeMap::new(),
            pool_states: HashMap::new(),
            has_pools,
            devices: BTreeMap::new(),
        };

        let firmware = worker.controller.firmware_release()?;
        verify_firmware(host, &firmware, &hardware.minimum_firmware)?;
        tracing::debug!(host, firmware = %firmware, "controller firmware accepted");

        worker.update_lun_map()?;

        let mut kinds = vec![DeviceKind::VirtualDisk];
        if worker.track_disk_drives {
            kinds.push(DeviceKind::DiskDrive);
        }
        for kind in kinds {
            for stats in worker.controller.list_devices(kind)? {
                if let Some(id) = worker.device_id(kind, stats.index) {
                    worker.add_device(id, &stats)?;
                }
            }
        }

        tracing::info!(
            host,
            devices = worker.devices.len(),
            luns = worker.lun_map.len(),
            "worker initialized"
        );
        Ok(worker)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Series for one metric of one device.
    pub fn series(&self, device: DeviceId, metric: Metric) -> Option<&RateSeries> {
        self.devices.get(&device).map(|d| d.series(metric))
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceState> + '_ {
        self.devices.values()
    }

    /// LUN number presented for virtual disk `index`.
    pub fn lun_for(&self, virtual_disk: u32) -> Option<u32> {
        self.lun_map.get(&virtual_disk).copied()
    }

    /// State of the pool backing `lun`, as of the last medium poll.
    pub fn pool_state(&self, lun: u32) -> Option<u8> {
        self.pool_states.get(&lun).copied()
    }

    /// Cycles started so far, -1 before the first wake.
    pub fn iteration(&self) -> i64 {
        self.scheduler.iteration()
    }

    /// Run until the link delivers the shutdown sentinel or closes.
    ///
    /// One fast poll runs right away so every series holds a sample before
    /// the first wake. Any hardware error ends the run; the supervisor
    /// restarts the worker.
    pub fn run(&mut self, link: &mut dyn WakeLink) -> Result<()> {
        let result = self.run_cycles(link);
        if let Err(e) = &result {
            tracing::error!(host = %self.host, error = %e, "worker cycle failed");
        }

        self.state = WorkerState::ShuttingDown;
        if let Err(e) = self.storage.flush() {
            tracing::warn!(host = %self.host, error = %e, "final storage flush failed");
        }
        self.state = WorkerState::Exited;
        tracing::info!(host = %self.host, iteration = self.iteration(), "worker exited");
        result
    }

    fn run_cycles(&mut self, link: &mut dyn WakeLink) -> Result<()> {
        self.state = WorkerState::Ready;
        self.fast_poll()?;

        loop {
            self.state = WorkerState::WaitingForWake;
            let epoch = link.wait_for_wake()?;
            if epoch == SHUTDOWN_EPOCH {
                tracing::debug!(host = %self.host, "shutdown requested");
                return Ok(());
            }

            self.state = WorkerState::Polling;
            self.cycle(epoch)?;
            link.acknowledge(epoch)?;
        }
    }

    /// One wake: all polls, then all pushes, then flush.
    fn cycle(&mut self, epoch: u64) -> Result<()> {
        let started = Instant::now();
        let tiers = self.scheduler.on_cycle();
        tracing::debug!(
            host = %self.host,
            epoch,
            iteration = self.scheduler.iteration(),
            medium = tiers.medium,
            slow = tiers.slow,
            "cycle started"
        );

        if tiers.fast {
            self.fast_poll()?;
        }
        if tiers.medium {
            self.medium_poll()?;
        }
        if tiers.slow {
            self.slow_poll();
        }

        if tiers.fast {
            self.fast_push(epoch);
        }
        if tiers.medium {
            self.medium_push(epoch);
        }
        if tiers.slow {
            self.slow_push(epoch);
        }

        if let Err(e) = self.storage.flush() {
            tracing::warn!(host = %self.host, epoch, error = %e, "storage flush failed");
        }
        tracing::debug!(host = %self.host, epoch, elapsed = ?started.elapsed(), "cycle finished");
        Ok(())
    }

    /// Read counters for every device and append them to the series.
    fn fast_poll(&mut self) -> Result<()> {
        for device in self.devices.values_mut() {
            device.stats = None;
        }

        let mut kinds = vec![DeviceKind::VirtualDisk];
        if self.track_disk_drives {
            kinds.push(DeviceKind::DiskDrive);
        }
        for kind in kinds {
            let devices = self.controller.list_devices(kind)?;
            let now = Instant::now();
            for stats in devices {
                let Some(id) = self.device_id(kind, stats.index) else {
                    continue;
                };
                if !self.devices.contains_key(&id) {
                    self.add_device(id, &stats)?;
                }
                if let Some(device) = self.devices.get_mut(&id) {
                    device.record(&self.host, stats, now);
                }
            }
        }
        Ok(())
    }

    /// Refresh the LUN map and the pool state behind every LUN.
    fn medium_poll(&mut self) -> Result<()> {
        self.update_lun_map()?;
        if !self.has_pools {
            return Ok(());
        }

        let pools: HashMap<u32, u8> = self
            .controller
            .storage_pools()?
            .into_iter()
            .map(|p| (p.index, p.state))
            .collect();

        self.pool_states.clear();
        for vd in self.controller.virtual_disks()? {
            let Some(&lun) = self.lun_map.get(&vd.index) else {
                continue;
            };
            match pools.get(&vd.pool) {
                Some(&state) => {
                    self.pool_states.insert(lun, state);
                }
                None => tracing::warn!(
                    host = %self.host,
                    lun,
                    pool = vd.pool,
                    "virtual disk refers to an unknown storage pool"
                ),
            }
        }
        Ok(())
    }

    fn slow_poll(&mut self) {}

    /// Push averaged rates and raw counters for every device seen this
    /// cycle.
    fn fast_push(&mut self, epoch: u64) {
        let span = self.polling.average_span();
        for device in self.devices.values() {
            let Some(stats) = &device.stats else {
                continue;
            };

            for (metric, rate) in device.rates(&self.host, span) {
                if let Err(e) = self.storage.push_rate(&self.host, device.id, epoch, metric, rate) {
                    tracing::warn!(host = %self.host, device = %device.id, %metric, error = %e, "rate push failed");
                }
            }

            let pool_state = match device.id.kind {
                DeviceKind::VirtualDisk => match self.pool_states.get(&device.id.number) {
                    Some(&state) => state,
                    None if !self.has_pools => POOL_STATE_UNKNOWN,
                    None => {
                        tracing::error!(
                            host = %self.host,
                            device = %device.id,
                            "no storage pool state mapped to LUN, storing as unknown"
                        );
                        POOL_STATE_UNKNOWN
                    }
                },
                DeviceKind::DiskDrive => POOL_STATE_UNKNOWN,
            };
            if let Err(e) =
                self.storage
                    .push_counters(&self.host, device.id, epoch, &stats.counters, pool_state)
            {
                tracing::warn!(host = %self.host, device = %device.id, error = %e, "counter push failed");
            }
        }
    }

    /// Push request size and latency histograms.
    fn medium_push(&mut self, epoch: u64) {
        for device in self.devices.values() {
            let Some(histograms) = device.stats.as_ref().and_then(|s| s.histograms.as_ref()) else {
                continue;
            };

            let sets = [
                (HistogramKind::RequestSize, true, &histograms.read_sizes),
                (HistogramKind::RequestSize, false, &histograms.write_sizes),
                (HistogramKind::Latency, true, &histograms.read_latencies),
                (HistogramKind::Latency, false, &histograms.write_latencies),
            ];
            for (kind, is_read, counts) in sets {
                if let Err(e) =
                    self.storage
                        .push_histogram(&self.host, device.id, epoch, kind, is_read, counts)
                {
                    tracing::warn!(
                        host = %self.host,
                        device = %device.id,
                        measurement = kind.measurement(is_read),
                        error = %e,
                        "histogram push failed"
                    );
                }
            }
        }
    }

    fn slow_push(&mut self, _epoch: u64) {}

    fn update_lun_map(&mut self) -> Result<()> {
        for p in self.controller.presentations()? {
            self.lun_map.insert(p.virtual_disk, p.lun);
        }
        tracing::debug!(host = %self.host, mapped = self.lun_map.len(), "virtual disks mapped to LUNs");
        Ok(())
    }

    /// Storage identity of a controller device. Virtual disks without a
    /// presentation have none and are not tracked.
    fn device_id(&self, kind: DeviceKind, index: u32) -> Option<DeviceId> {
        match kind {
            DeviceKind::VirtualDisk => {
                let lun = self.lun_map.get(&index).copied();
                if lun.is_none() {
                    tracing::debug!(host = %self.host, virtual_disk = index, "virtual disk not presented");
                }
                lun.map(DeviceId::lun)
            }
            DeviceKind::DiskDrive => Some(DeviceId::drive(index)),
        }
    }

    fn add_device(&mut self, id: DeviceId, stats: &DeviceStats) -> Result<()> {
        check_labels(&self.host, id, stats)?;
        if self.state != WorkerState::Initializing {
            tracing::info!(host = %self.host, device = %id, "new device discovered");
        }
        self.devices
            .insert(id, DeviceState::new(id, self.polling.series_capacity()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::hardware::{DiskstatsController, Presentation, SimulatedController, StoragePool, VirtualDisk};
    use crate::storage::{MemoryStorage, Point};
    use std::sync::atomic::Ordering;
    use std::sync::{mpsc, Arc, Mutex};

    fn config(extra: &str) -> Config {
        let text = format!(
            "[polling]\nmedium_poll_multiple = 2\nslow_poll_multiple = 4\n\n\
             [hardware]\nhosts = \"sfa1\"\n{extra}\n\n\
             [hardware.simulated]\nluns = 2\ndrives = 3\n"
        );
        Config::parse(&text).unwrap()
    }

    /// Queue `epochs` up front; the worker runs to completion on this thread.
    fn drive(worker: &mut Worker, epochs: &[u64]) -> (Result<()>, Vec<u64>) {
        let (wake_tx, wake_rx) = mpsc::channel();
        let (ack_tx, ack_rx) = mpsc::channel();
        for &epoch in epochs {
            wake_tx.send(epoch).unwrap();
        }
        // Once the queue drains the link reads as closed
        drop(wake_tx);
        let mut link = ChannelLink::new(wake_rx, ack_tx);
        let result = worker.run(&mut link);
        (result, ack_rx.try_iter().collect())
    }

    fn simulated(config: &Config) -> SimulatedController {
        SimulatedController::connect("sfa1", &config.hardware.simulated).unwrap()
    }

    #[test]
    fn three_cycles_hold_four_samples() {
        let config = config("");
        let mut worker = Worker::new(
            "sfa1",
            &config.polling,
            &config.hardware,
            Box::new(simulated(&config)),
            Box::new(MemoryStorage::new()),
        )
        .unwrap();

        let (result, acks) = drive(&mut worker, &[1000, 1002, 1004, SHUTDOWN_EPOCH]);
        result.unwrap();
        assert_eq!(acks, vec![1000, 1002, 1004]);
        assert_eq!(worker.state(), WorkerState::Exited);

        let series = worker.series(DeviceId::lun(100), Metric::ReadIops).unwrap();
        assert_eq!(series.len(), 4);
        assert!(series.average(Duration::from_secs(4)).is_ok());
    }

    #[test]
    fn shutdown_sentinel_exits_without_polling() {
        let config = config("");
        let controller = simulated(&config);
        let polls = controller.poll_counter();
        let mut worker = Worker::new(
            "sfa1",
            &config.polling,
            &config.hardware,
            Box::new(controller),
            Box::new(MemoryStorage::new()),
        )
        .unwrap();
        let after_init = polls.load(Ordering::Relaxed);

        let (result, acks) = drive(&mut worker, &[SHUTDOWN_EPOCH]);
        result.unwrap();
        assert!(acks.is_empty());
        assert_eq!(worker.state(), WorkerState::Exited);
        assert_eq!(worker.iteration(), -1);
        // Only the immediate post-init poll ran
        assert_eq!(polls.load(Ordering::Relaxed), after_init + 1);
    }

    #[test]
    fn closed_link_is_a_shutdown() {
        let config = config("");
        let mut worker = Worker::new(
            "sfa1",
            &config.polling,
            &config.hardware,
            Box::new(simulated(&config)),
            Box::new(MemoryStorage::new()),
        )
        .unwrap();

        let (result, acks) = drive(&mut worker, &[7]);
        result.unwrap();
        assert_eq!(acks, vec![7]);
        assert_eq!(worker.state(), WorkerState::Exited);
    }

    #[test]
    fn pushes_follow_tiers_and_carry_the_epoch() {
        let config = config("");
        let sink = MemoryStorage::new();
        let points = sink.handle();
        let flushes = sink.flush_counter();
        let mut worker = Worker::new(
            "sfa1",
            &config.polling,
            &config.hardware,
            Box::new(simulated(&config)),
            Box::new(sink),
        )
        .unwrap();

        let (result, _) = drive(&mut worker, &[1_700_000_000, 1_700_000_002, SHUTDOWN_EPOCH]);
        result.unwrap();

        let points = points.lock().unwrap();
        let count = |epoch: i64, f: fn(&Point) -> bool| {
            points
                .iter()
                .filter(|p| p.time().timestamp() == epoch && f(p))
                .count()
        };
        let is_rate: fn(&Point) -> bool = |p| matches!(p, Point::Rate { .. });
        let is_counters: fn(&Point) -> bool = |p| matches!(p, Point::Counters { .. });
        let is_histogram: fn(&Point) -> bool = |p| matches!(p, Point::Histogram { .. });

        // Iteration 0 runs every tier: 2 LUNs x (7 rates + counters + 4 histograms)
        assert_eq!(count(1_700_000_000, is_rate), 14);
        assert_eq!(count(1_700_000_000, is_counters), 2);
        assert_eq!(count(1_700_000_000, is_histogram), 8);
        // Iteration 1 is fast only
        assert_eq!(count(1_700_000_002, is_rate), 14);
        assert_eq!(count(1_700_000_002, is_counters), 2);
        assert_eq!(count(1_700_000_002, is_histogram), 0);

        assert!(points.iter().all(|p| p.host() == "sfa1"));
        // One flush per cycle plus the final one
        assert_eq!(*flushes.lock().unwrap(), 3);
    }

    #[test]
    fn luns_and_pool_states_come_from_the_controller() {
        let config = config("");
        let sink = MemoryStorage::new();
        let points = sink.handle();
        let mut worker = Worker::new(
            "sfa1",
            &config.polling,
            &config.hardware,
            Box::new(simulated(&config)),
            Box::new(sink),
        )
        .unwrap();
        assert_eq!(worker.lun_for(1), Some(101));

        let (result, _) = drive(&mut worker, &[10, SHUTDOWN_EPOCH]);
        result.unwrap();
        assert_eq!(worker.pool_state(100), Some(0));

        let ids: Vec<DeviceId> = worker.devices().map(|d| d.id()).collect();
        assert_eq!(ids, vec![DeviceId::lun(100), DeviceId::lun(101)]);

        let points = points.lock().unwrap();
        for point in points.iter() {
            if let Point::Counters { pool_state, .. } = point {
                assert_eq!(*pool_state, 0);
            }
        }
    }

    #[test]
    fn tracks_drives_when_enabled() {
        let config = config("track_disk_drives = true");
        let sink = MemoryStorage::new();
        let points = sink.handle();
        let mut worker = Worker::new(
            "sfa1",
            &config.polling,
            &config.hardware,
            Box::new(simulated(&config)),
            Box::new(sink),
        )
        .unwrap();

        let (result, _) = drive(&mut worker, &[10, SHUTDOWN_EPOCH]);
        result.unwrap();
        assert_eq!(worker.devices().count(), 5);
        assert_eq!(worker.series(DeviceId::drive(2), Metric::WriteIops).unwrap().len(), 2);

        let points = points.lock().unwrap();
        let drive_counters = points.iter().find(|p| {
            matches!(p, Point::Counters { device, .. } if device.kind == DeviceKind::DiskDrive)
        });
        assert!(matches!(
            drive_counters,
            Some(Point::Counters { pool_state: POOL_STATE_UNKNOWN, .. })
        ));
    }

    #[test]
    fn rejects_unexpected_labels() {
        let config = config("");
        let mut labels: Vec<String> = hardware::EXPECTED_SIZE_LABELS.iter().map(|s| s.to_string()).collect();
        labels.swap(0, 1);
        let controller = simulated(&config).with_size_labels(labels);

        let result = Worker::new(
            "sfa1",
            &config.polling,
            &config.hardware,
            Box::new(controller),
            Box::new(MemoryStorage::new()),
        );
        assert!(matches!(result, Err(Error::UnexpectedMetadata { what: "request size", .. })));
    }

    #[test]
    fn rejects_old_firmware() {
        let config = config("minimum_firmware = \"9.0\"");
        let result = Worker::new(
            "sfa1",
            &config.polling,
            &config.hardware,
            Box::new(simulated(&config)),
            Box::new(MemoryStorage::new()),
        );
        assert!(matches!(result, Err(Error::FirmwareTooOld { .. })));
    }

    #[test]
    fn rates_skip_only_the_metrics_without_history() {
        let mut device = DeviceState::new(DeviceId::lun(3), None);
        let t0 = Instant::now();
        for metric in [Metric::ReadIops, Metric::WriteBytes] {
            let series = &mut device.series[metric.slot()];
            series.append_at(100, t0).unwrap();
            series.append_at(300, t0 + Duration::from_secs(2)).unwrap();
        }
        device.series[Metric::WriteIops.slot()].append_at(5, t0).unwrap();

        let rates = device.rates("sfa1", Duration::from_secs(60));
        assert_eq!(rates, vec![(Metric::ReadIops, 100.0), (Metric::WriteBytes, 100.0)]);
    }

    /// Captures formatted log output for assertions.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn poolless_backend_stores_unknown_state_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.diskstats");
        std::fs::write(
            &path,
            "   8       0 sda 1000 10 8000 500 2000 20 16000 900 0 1200 1400 0 0 0 0\n\
             259       0 nvme0n1 300 0 2048 10 100 0 1024 5 0 20 15 0 0 0 0\n",
        )
        .unwrap();
        let config = config("minimum_firmware = \"0\"");
        let sink = MemoryStorage::new();
        let points = sink.handle();

        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let acks = tracing::subscriber::with_default(subscriber, || {
            let controller = DiskstatsController::open("local", path.to_str().unwrap()).unwrap();
            let mut worker = Worker::new(
                "local",
                &config.polling,
                &config.hardware,
                Box::new(controller),
                Box::new(sink),
            )
            .unwrap();
            let (result, acks) = drive(&mut worker, &[10, 12, 14, SHUTDOWN_EPOCH]);
            result.unwrap();
            acks
        });
        assert_eq!(acks, vec![10, 12, 14]);

        let points = points.lock().unwrap();
        let pool_states: Vec<u8> = points
            .iter()
            .filter_map(|p| match p {
                Point::Counters { pool_state, .. } => Some(*pool_state),
                _ => None,
            })
            .collect();
        assert_eq!(pool_states, vec![POOL_STATE_UNKNOWN; 6]);

        let logs = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("worker exited"), "{logs}");
        assert!(!logs.contains("ERROR"), "{logs}");
    }

    /// Controller whose statistics queries start failing after a few calls.
    struct FlakyController {
        remaining: u32,
    }

    impl Controller for FlakyController {
        fn firmware_release(&mut self) -> Result<String> {
            Ok("3.0.0".to_string())
        }

        fn presentations(&mut self) -> Result<Vec<Presentation>> {
            Ok(vec![Presentation { virtual_disk: 0, lun: 0 }])
        }

        fn storage_pools(&mut self) -> Result<Vec<StoragePool>> {
            Ok(vec![StoragePool { index: 0, state: 2 }])
        }

        fn virtual_disks(&mut self) -> Result<Vec<VirtualDisk>> {
            Ok(vec![VirtualDisk { index: 0, pool: 0 }])
        }

        fn list_devices(&mut self, _kind: DeviceKind) -> Result<Vec<DeviceStats>> {
            if self.remaining == 0 {
                return Err(Error::Hardware {
                    host: "flaky".to_string(),
                    reason: "session expired".to_string(),
                });
            }
            self.remaining -= 1;
            Ok(vec![DeviceStats {
                index: 0,
                counters: Default::default(),
                histograms: None,
            }])
        }
    }

    #[test]
    fn hardware_error_mid_run_ends_the_worker() {
        let config = config("");
        // init + immediate poll + one cycle succeed
        let mut worker = Worker::new(
            "flaky",
            &config.polling,
            &config.hardware,
            Box::new(FlakyController { remaining: 3 }),
            Box::new(MemoryStorage::new()),
        )
        .unwrap();

        let (result, acks) = drive(&mut worker, &[10, 12, 14]);
        assert!(matches!(result, Err(Error::Hardware { .. })));
        assert_eq!(acks, vec![10]);
        assert_eq!(worker.state(), WorkerState::Exited);
        assert_eq!(worker.pool_state(0), Some(2));
    }
}
