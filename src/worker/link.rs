//! Wake/acknowledge channel between the supervisor and one worker.
//!
//! Messages are single-line JSON objects:
//!
//! ```text
//! supervisor -> worker   {"type":"wake","epoch":1700000000}
//! worker -> supervisor   {"type":"done","epoch":1700000000}
//! ```
//!
//! A wake with epoch 0 is the shutdown sentinel. A closed channel is
//! treated the same way, so a worker whose supervisor died exits on its
//! own instead of lingering.

use std::io::{self, BufRead, Write};
use std::sync::mpsc::{Receiver, Sender};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Epoch carried by the shutdown sentinel.
pub const SHUTDOWN_EPOCH: u64 = 0;

/// One message on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    /// Start a cycle stamped with `epoch` (Unix seconds), or shut down if 0.
    Wake { epoch: u64 },
    /// The cycle for `epoch` has been pushed and flushed.
    Done { epoch: u64 },
}

impl Signal {
    pub fn encode(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn decode(line: &str) -> Result<Self> {
        serde_json::from_str(line.trim())
            .map_err(|e| Error::Link(format!("malformed message {:?}: {}", line.trim(), e)))
    }
}

/// Worker side of the link.
pub trait WakeLink {
    /// Block until the supervisor raises the wake signal. Returns the
    /// epoch, or [`SHUTDOWN_EPOCH`] when the supervisor is gone.
    fn wait_for_wake(&mut self) -> Result<u64>;

    /// Report the cycle for `epoch` as complete.
    fn acknowledge(&mut self, epoch: u64) -> Result<()>;
}

/// Link over a pair of byte streams, normally the worker's stdin/stdout.
pub struct PipeLink<R, W> {
    reader: R,
    writer: W,
    line: String,
}

impl PipeLink<io::StdinLock<'static>, io::Stdout> {
    /// Link over this process's stdin and stdout.
    pub fn stdio() -> Self {
        Self::new(io::stdin().lock(), io::stdout())
    }
}

impl<R: BufRead, W: Write> PipeLink<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            line: String::new(),
        }
    }
}

impl<R: BufRead, W: Write> WakeLink for PipeLink<R, W> {
    fn wait_for_wake(&mut self) -> Result<u64> {
        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .map_err(|e| Error::Link(format!("read failed: {e}")))?;
            if n == 0 {
                tracing::debug!("wake link closed");
                return Ok(SHUTDOWN_EPOCH);
            }
            if self.line.trim().is_empty() {
                continue;
            }
            match Signal::decode(&self.line)? {
                Signal::Wake { epoch } => return Ok(epoch),
                Signal::Done { epoch } => {
                    tracing::warn!(epoch, "ignoring acknowledgement sent to a worker");
                }
            }
        }
    }

    fn acknowledge(&mut self, epoch: u64) -> Result<()> {
        let line = Signal::Done { epoch }.encode()?;
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.flush())
            .map_err(|e| Error::Link(format!("write failed: {e}")))
    }
}

/// In-process link over std channels. Lets a worker run on a thread
/// under test with the test playing supervisor.
pub struct ChannelLink {
    wakes: Receiver<u64>,
    acks: Sender<u64>,
}

impl ChannelLink {
    pub fn new(wakes: Receiver<u64>, acks: Sender<u64>) -> Self {
        Self { wakes, acks }
    }
}

impl WakeLink for ChannelLink {
    fn wait_for_wake(&mut self) -> Result<u64> {
        Ok(self.wakes.recv().unwrap_or(SHUTDOWN_EPOCH))
    }

    fn acknowledge(&mut self, epoch: u64) -> Result<()> {
        self.acks
            .send(epoch)
            .map_err(|_| Error::Link("supervisor side dropped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn wire_format() {
        assert_eq!(
            Signal::Wake { epoch: 42 }.encode().unwrap(),
            "{\"type\":\"wake\",\"epoch\":42}\n"
        );
        assert_eq!(
            Signal::decode("{\"type\":\"done\",\"epoch\":7}\n").unwrap(),
            Signal::Done { epoch: 7 }
        );
        assert!(matches!(Signal::decode("wake 7"), Err(Error::Link(_))));
    }

    #[test]
    fn pipe_link_reads_wakes_and_writes_acks() {
        let input = "{\"type\":\"wake\",\"epoch\":10}\n\n{\"type\":\"wake\",\"epoch\":0}\n";
        let mut output = Vec::new();
        {
            let mut link = PipeLink::new(Cursor::new(input), &mut output);
            assert_eq!(link.wait_for_wake().unwrap(), 10);
            link.acknowledge(10).unwrap();
            assert_eq!(link.wait_for_wake().unwrap(), SHUTDOWN_EPOCH);
        }
        assert_eq!(String::from_utf8(output).unwrap(), "{\"type\":\"done\",\"epoch\":10}\n");
    }

    #[test]
    fn closed_pipe_means_shutdown() {
        let mut link = PipeLink::new(Cursor::new(""), Vec::new());
        assert_eq!(link.wait_for_wake().unwrap(), SHUTDOWN_EPOCH);
    }

    #[test]
    fn dropped_channel_means_shutdown() {
        let (wake_tx, wake_rx) = std::sync::mpsc::channel();
        let (ack_tx, _ack_rx) = std::sync::mpsc::channel();
        let mut link = ChannelLink::new(wake_rx, ack_tx);
        wake_tx.send(5).unwrap();
        drop(wake_tx);
        assert_eq!(link.wait_for_wake().unwrap(), 5);
        assert_eq!(link.wait_for_wake().unwrap(), SHUTDOWN_EPOCH);
    }
}
