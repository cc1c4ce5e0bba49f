//! Worker pool: synchronized wake-ups, completion barrier, crash restart.
//!
//! Every host gets its own worker process. Once per wake interval the
//! supervisor stamps the cycle with the current Unix time, sends that epoch
//! to every worker and waits until each one has acknowledged it or died.
//! Dead workers are replaced at the start of the next cycle. Stopping sends
//! epoch 0 to every worker and waits for them to exit.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::worker::{Signal, SHUTDOWN_EPOCH};

/// How the supervisor runs its pool.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    hosts: Vec<String>,
    wake_interval: Duration,
    worker_program: PathBuf,
    worker_args: Vec<OsString>,
    barrier_poll: Duration,
    stall_timeout: Option<Duration>,
    kill_stalled: bool,
    shutdown_timeout: Duration,
}

impl SupervisorConfig {
    /// Pool of one worker per host, woken every `wake_interval`. Workers
    /// are started from the current executable.
    pub fn new(hosts: Vec<String>, wake_interval: Duration) -> Self {
        Self {
            hosts,
            wake_interval,
            worker_program: std::env::current_exe().unwrap_or_else(|_| PathBuf::from("ddnpoll")),
            worker_args: Vec::new(),
            barrier_poll: Duration::from_millis(10),
            stall_timeout: Some(Duration::from_secs(30)),
            kill_stalled: true,
            shutdown_timeout: Duration::from_secs(10),
        }
    }

    /// Settings from a loaded configuration file. Workers are pointed at
    /// the same file.
    pub fn from_config(config: &Config, config_path: &Path) -> Result<Self> {
        let settings = &config.supervisor;
        Ok(Self::new(config.hosts()?, config.polling.fast_interval())
            .worker_args(["--config".into(), config_path.as_os_str().to_os_string()])
            .stall_timeout(settings.stall_timeout())
            .kill_stalled(settings.kill_stalled)
            .shutdown_timeout(settings.shutdown_timeout()))
    }

    pub fn worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = program.into();
        self
    }

    /// Arguments placed before `worker --host <host>` on the worker
    /// command line.
    pub fn worker_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.worker_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// How often the barrier re-checks acknowledgements. Default: 10ms.
    pub fn barrier_poll(mut self, interval: Duration) -> Self {
        self.barrier_poll = interval;
        self
    }

    /// How long a cycle may wait on a live worker before it is reported
    /// stalled. `None` waits forever. Default: 30s.
    pub fn stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Kill stalled workers so the next cycle restarts them. Default: true.
    pub fn kill_stalled(mut self, kill: bool) -> Self {
        self.kill_stalled = kill;
        self
    }

    /// How long shutdown waits for workers to exit. Default: 10s.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }
}

/// Snapshot of one worker, published after every cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub host: String,
    /// Process id of the current worker process, if one is running.
    pub pid: Option<u32>,
    pub alive: bool,
    pub restarts: u32,
    /// Newest epoch this worker acknowledged.
    pub last_ack: Option<u64>,
    /// Missed the stall timeout in the latest cycle.
    pub stalled: bool,
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStatus {
    /// Completed wake cycles.
    pub cycles: u64,
    /// Epoch of the latest cycle, 0 before the first one.
    pub last_epoch: u64,
    pub workers: Vec<WorkerStatus>,
    /// Set once every worker has been told to exit and reaped.
    pub stopped: bool,
}

/// Running worker process and its side of the link.
struct WorkerProcess {
    child: Child,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    acks: mpsc::UnboundedReceiver<u64>,
    reader: JoinHandle<()>,
}

impl WorkerProcess {
    /// `Some(status)` once the process has exited.
    fn exit_status(&mut self, host: &str) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(host, error = %e, "cannot query worker status");
                None
            }
        }
    }

    async fn send(&mut self, signal: Signal) -> Result<()> {
        let line = signal.encode()?;
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Link("worker stdin already closed".to_string()))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Link(format!("write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::Link(format!("flush failed: {e}")))
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        // A replaced worker's acknowledgements must never reach its successor
        self.reader.abort();
    }
}

/// Supervisor-side state for one host.
struct WorkerRecord {
    host: String,
    process: Option<WorkerProcess>,
    /// Epoch sent and not yet acknowledged. This is the completion signal:
    /// raised on wake, cleared by the worker's acknowledgement.
    pending: Option<u64>,
    restarts: u32,
    last_ack: Option<u64>,
    stalled: bool,
}

impl WorkerRecord {
    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            host: self.host.clone(),
            pid: self.process.as_ref().and_then(|p| p.pid),
            alive: self.process.is_some(),
            restarts: self.restarts,
            last_ack: self.last_ack,
            stalled: self.stalled,
        }
    }

    /// Consume queued acknowledgements; clears the signal on a match.
    fn drain_acks(&mut self) {
        let Some(process) = self.process.as_mut() else {
            return;
        };
        while let Ok(epoch) = process.acks.try_recv() {
            if self.pending == Some(epoch) {
                self.pending = None;
            } else {
                tracing::debug!(host = %self.host, epoch, pending = ?self.pending, "stale acknowledgement");
            }
            self.last_ack = Some(epoch);
        }
    }

    /// True if the process is gone. An exited process is reaped here so
    /// the next liveness check sees no process at all.
    fn reap_if_dead(&mut self) -> Option<ExitStatus> {
        let status = self.process.as_mut()?.exit_status(&self.host)?;
        self.process = None;
        Some(status)
    }
}

/// Start a worker process for `host`.
fn spawn(host: &str, config: &SupervisorConfig) -> Result<WorkerProcess> {
    let mut command = Command::new(&config.worker_program);
    command
        .args(&config.worker_args)
        .arg("worker")
        .arg("--host")
        .arg(host)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    // Own process group: a terminal Ctrl-C goes to the supervisor only,
    // which then shuts workers down in order
    #[cfg(unix)]
    command.process_group(0);

    let spawn_error = |source| Error::Spawn {
        host: host.to_string(),
        source,
    };
    let mut child = command.spawn().map_err(spawn_error)?;

    let missing = |what: &str| {
        spawn_error(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            format!("worker {what} not captured"),
        ))
    };
    let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
    let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;

    let (tx, acks) = mpsc::unbounded_channel();
    let reader_host = host.to_string();
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match Signal::decode(&line) {
                    Ok(Signal::Done { epoch }) => {
                        if tx.send(epoch).is_err() {
                            break;
                        }
                    }
                    Ok(other) => {
                        tracing::warn!(host = %reader_host, signal = ?other, "unexpected message from worker");
                    }
                    Err(e) => {
                        tracing::warn!(host = %reader_host, error = %e, "unreadable message from worker");
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(host = %reader_host, error = %e, "worker output closed");
                    break;
                }
            }
        }
    });

    let pid = child.id();
    tracing::info!(host, pid = ?pid, "worker started");
    Ok(WorkerProcess {
        child,
        pid,
        stdin: Some(stdin),
        acks,
        reader,
    })
}

/// Handle to a running worker pool.
pub struct Supervisor {
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<PoolStatus>,
    task: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Spawn every worker and the wake loop. Must be called from within a
    /// tokio runtime.
    pub fn start(config: SupervisorConfig) -> Result<Self> {
        if config.hosts.is_empty() {
            return Err(Error::Config("no hosts to supervise".to_string()));
        }
        if config.wake_interval.is_zero() {
            return Err(Error::Config("wake interval must be positive".to_string()));
        }

        let mut workers = Vec::with_capacity(config.hosts.len());
        for host in &config.hosts {
            workers.push(WorkerRecord {
                host: host.clone(),
                process: Some(spawn(host, &config)?),
                pending: None,
                restarts: 0,
                last_ack: None,
                stalled: false,
            });
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let initial = PoolStatus {
            workers: workers.iter().map(WorkerRecord::status).collect(),
            ..Default::default()
        };
        let (status_tx, status) = watch::channel(initial);

        tracing::info!(
            workers = workers.len(),
            interval = ?config.wake_interval,
            "supervisor started"
        );

        let pool = Pool {
            config,
            workers,
            status: status_tx,
            shutdown: shutdown_rx,
            cycles: 0,
            last_epoch: 0,
        };
        let task = tokio::spawn(pool.run());

        Ok(Self {
            shutdown,
            status,
            task: Some(task),
        })
    }

    /// Live view of the pool, updated after every cycle.
    pub fn status(&self) -> watch::Receiver<PoolStatus> {
        self.status.clone()
    }

    /// Finish the current cycle, tell every worker to exit and wait for
    /// them.
    pub async fn stop(mut self) -> Result<()> {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            task.await?;
        }
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Without stop(), the loop still winds the workers down on its own
        let _ = self.shutdown.send(true);
    }
}

/// State owned by the wake loop task.
struct Pool {
    config: SupervisorConfig,
    workers: Vec<WorkerRecord>,
    status: watch::Sender<PoolStatus>,
    shutdown: watch::Receiver<bool>,
    cycles: u64,
    last_epoch: u64,
}

impl Pool {
    async fn run(mut self) {
        let mut ticker = time::interval(self.config.wake_interval);
        // Stay on the original grid after a slow cycle instead of bursting
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait_for(|stop| *stop) => break,
                _ = ticker.tick() => {}
            }

            self.check_liveness();
            let epoch = unix_now();
            self.broadcast(epoch).await;
            self.barrier(epoch).await;

            self.cycles += 1;
            self.last_epoch = epoch;
            self.publish(false);
        }

        self.shutdown_workers().await;
        self.publish(true);
        tracing::info!(cycles = self.cycles, "supervisor stopped");
    }

    /// Replace every worker whose process has exited.
    fn check_liveness(&mut self) {
        for record in &mut self.workers {
            let status = match record.reap_if_dead() {
                Some(status) => status.to_string(),
                None if record.process.is_none() => "not running".to_string(),
                None => continue,
            };

            record.restarts += 1;
            record.pending = None;
            tracing::error!(
                host = %record.host,
                status = %status,
                restarts = record.restarts,
                "worker died, restarting"
            );

            match spawn(&record.host, &self.config) {
                Ok(process) => record.process = Some(process),
                Err(e) => {
                    tracing::error!(host = %record.host, error = %e, "restart failed, retrying next cycle");
                }
            }
        }
    }

    /// Raise every live worker's signal for `epoch`.
    async fn broadcast(&mut self, epoch: u64) {
        tracing::debug!(epoch, "waking workers");
        for record in &mut self.workers {
            record.stalled = false;
            let Some(process) = record.process.as_mut() else {
                continue;
            };
            match process.send(Signal::Wake { epoch }).await {
                Ok(()) => record.pending = Some(epoch),
                Err(e) => {
                    // Usually the worker just died; make sure the next
                    // liveness check replaces it
                    tracing::warn!(host = %record.host, epoch, error = %e, "cannot wake worker");
                    let _ = process.child.start_kill();
                    record.pending = None;
                }
            }
        }
    }

    /// Wait until every live worker has acknowledged `epoch`.
    async fn barrier(&mut self, epoch: u64) {
        let started = Instant::now();
        let mut next_report = self.config.stall_timeout.map(|t| started + t);
        let mut stall_reported = false;

        loop {
            let mut waiting = 0;
            for record in &mut self.workers {
                record.drain_acks();
                if record.pending.is_none() {
                    continue;
                }
                if let Some(process) = record.process.as_mut() {
                    if process.exit_status(&record.host).is_some() {
                        // Dead workers do not hold up the cycle; the next
                        // liveness check restarts them
                        record.pending = None;
                        continue;
                    }
                }
                waiting += 1;
            }
            if waiting == 0 {
                tracing::debug!(epoch, elapsed = ?started.elapsed(), "all workers done");
                return;
            }

            if let Some(deadline) = next_report {
                if Instant::now() >= deadline {
                    self.report_stalled(epoch, started.elapsed());
                    stall_reported = true;
                    next_report = self.config.stall_timeout.map(|t| deadline + t);
                    continue;
                }
            }
            if stall_reported && *self.shutdown.borrow() {
                tracing::warn!(epoch, "abandoning stalled cycle for shutdown");
                return;
            }

            time::sleep(self.config.barrier_poll).await;
        }
    }

    fn report_stalled(&mut self, epoch: u64, waited: Duration) {
        for record in &mut self.workers {
            if record.pending.is_none() {
                continue;
            }
            record.stalled = true;
            tracing::error!(
                host = %record.host,
                pid = ?record.process.as_ref().and_then(|p| p.pid),
                epoch,
                waited = ?waited,
                "worker stalled"
            );
            if self.config.kill_stalled {
                if let Some(process) = record.process.as_mut() {
                    if let Err(e) = process.child.start_kill() {
                        tracing::warn!(host = %record.host, error = %e, "cannot kill stalled worker");
                    }
                }
                record.pending = None;
            }
        }
    }

    /// Send the shutdown sentinel and reap every worker.
    async fn shutdown_workers(&mut self) {
        tracing::info!(workers = self.workers.len(), "stopping workers");
        for record in &mut self.workers {
            if let Some(process) = record.process.as_mut() {
                if let Err(e) = process.send(Signal::Wake { epoch: SHUTDOWN_EPOCH }).await {
                    tracing::debug!(host = %record.host, error = %e, "cannot send shutdown");
                }
                // EOF on stdin is a second shutdown request
                process.stdin = None;
            }
        }

        let deadline = Instant::now() + self.config.shutdown_timeout;
        for record in &mut self.workers {
            let Some(mut process) = record.process.take() else {
                continue;
            };
            match time::timeout_at(deadline, process.child.wait()).await {
                Ok(Ok(status)) if status.success() => {
                    tracing::debug!(host = %record.host, "worker exited");
                }
                Ok(Ok(status)) => {
                    tracing::warn!(host = %record.host, status = %status, "worker exited uncleanly");
                }
                Ok(Err(e)) => {
                    tracing::warn!(host = %record.host, error = %e, "cannot wait for worker");
                }
                Err(_) => {
                    tracing::warn!(host = %record.host, "worker did not exit in time, killing");
                    if let Err(e) = process.child.kill().await {
                        tracing::warn!(host = %record.host, error = %e, "cannot kill worker");
                    }
                }
            }
            record.pending = None;
        }
    }

    fn publish(&self, stopped: bool) {
        self.status.send_replace(PoolStatus {
            cycles: self.cycles,
            last_epoch: self.last_epoch,
            workers: self.workers.iter().map(WorkerRecord::status).collect(),
            stopped,
        });
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(1)
        .max(1)
}
