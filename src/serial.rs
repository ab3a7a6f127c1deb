// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Serial console transport and the rolling pattern-match buffer.
// Author: Lukas Bower

//! Serial console session primitives.
//!
//! The transport gives no framing guarantees: bytes arrive partial,
//! interleaved and repeated. Every higher-level wait is therefore expressed
//! as "poll, accumulate into a rolling buffer, test literal substrings"
//! rather than a line-oriented blocking read. One [`SerialSession`] is
//! exclusively owned by one provisioning run.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::trace;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::error::Result;

/// Byte-level console transport. Only open/write/poll-read/reset semantics;
/// no read-until-delimiter anywhere.
pub trait ConsolePort: Send {
    /// Fire-and-forget write of raw bytes.
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Return whatever bytes have accumulated since the last call, without
    /// blocking beyond the driver's own short timeout. Empty means nothing
    /// arrived yet.
    fn recv_available(&mut self) -> Result<Vec<u8>>;

    /// Drop bytes buffered by the driver that nobody has read.
    fn discard_input(&mut self) -> Result<()>;
}

/// Hardware tty backed by the `serialport` crate: 8N1, no flow control.
pub struct TtyPort {
    port: Box<dyn SerialPort>,
}

impl TtyPort {
    /// Open the device at the given baud rate.
    pub fn open(device: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(device, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(20))
            .open()?;
        Ok(Self { port })
    }
}

impl ConsolePort for TtyPort {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn recv_available(&mut self) -> Result<Vec<u8>> {
        let waiting = self.port.bytes_to_read()? as usize;
        if waiting == 0 {
            return Ok(Vec::new());
        }
        let mut chunk = vec![0u8; waiting];
        let read = self.port.read(&mut chunk)?;
        chunk.truncate(read);
        Ok(chunk)
    }

    fn discard_input(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// Deterministic console used by tests and dry runs.
///
/// Chunks queued with [`ScriptedPort::emit`] are delivered one per poll, in
/// order, reproducing the partial reads a real tty produces. A reply queued
/// with [`ScriptedPort::on`] is emitted after the exact bytes of one write
/// call match its trigger.
#[derive(Default)]
pub struct ScriptedPort {
    pending: VecDeque<Vec<u8>>,
    replies: Vec<(Vec<u8>, Vec<u8>)>,
    sent: Arc<Mutex<Vec<u8>>>,
}

impl ScriptedPort {
    /// Create an empty scripted port.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a chunk the target "prints" unprompted.
    #[must_use]
    pub fn emit(mut self, chunk: &str) -> Self {
        self.pending.push_back(chunk.as_bytes().to_vec());
        self
    }

    /// Queue a reply delivered once `trigger` is written verbatim.
    #[must_use]
    pub fn on(mut self, trigger: &str, reply: &str) -> Self {
        self.replies
            .push((trigger.as_bytes().to_vec(), reply.as_bytes().to_vec()));
        self
    }

    /// Handle onto everything written to this port, usable after the port
    /// has been moved into a session.
    #[must_use]
    pub fn sent_log(&self) -> SentLog {
        SentLog(Arc::clone(&self.sent))
    }
}

/// Shared view of a [`ScriptedPort`]'s outbound bytes.
#[derive(Clone)]
pub struct SentLog(Arc<Mutex<Vec<u8>>>);

impl SentLog {
    /// Everything written so far, lossily decoded.
    #[must_use]
    pub fn text(&self) -> String {
        let sent = self.0.lock().expect("sent log lock poisoned");
        String::from_utf8_lossy(&sent).into_owned()
    }
}

impl ConsolePort for ScriptedPort {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.sent
            .lock()
            .expect("sent log lock poisoned")
            .extend_from_slice(bytes);
        if let Some(pos) = self.replies.iter().position(|(trigger, _)| trigger == bytes) {
            let (_, reply) = self.replies.remove(pos);
            self.pending.push_back(reply);
        }
        Ok(())
    }

    fn recv_available(&mut self) -> Result<Vec<u8>> {
        Ok(self.pending.pop_front().unwrap_or_default())
    }

    fn discard_input(&mut self) -> Result<()> {
        // Scripted chunks model future output, so nothing to drop here.
        Ok(())
    }
}

/// One serial console session: owns the port and the rolling input buffer.
pub struct SerialSession {
    port: Box<dyn ConsolePort>,
    buffer: String,
    poll_interval: Duration,
}

impl SerialSession {
    /// Wrap an already-open port.
    #[must_use]
    pub fn new(port: Box<dyn ConsolePort>, poll_interval: Duration) -> Self {
        Self {
            port,
            buffer: String::new(),
            poll_interval,
        }
    }

    /// Open the hardware tty and wrap it in a session.
    pub fn open(device: &str, baud: u32, poll_interval: Duration) -> Result<Self> {
        let port = TtyPort::open(device, baud)?;
        Ok(Self::new(Box::new(port), poll_interval))
    }

    /// Send a line, normalising the terminator to CR+LF.
    pub fn send_line(&mut self, line: &str) -> Result<()> {
        trace!("console tx: {line:?}");
        let mut framed = String::with_capacity(line.len() + 2);
        framed.push_str(line);
        framed.push_str("\r\n");
        self.port.send(framed.as_bytes())
    }

    /// Send raw bytes without any terminator, e.g. an interrupt keystroke.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.port.send(bytes)
    }

    /// Poll once and append whatever arrived to the rolling buffer.
    pub fn poll(&mut self) -> Result<()> {
        let chunk = self.port.recv_available()?;
        if !chunk.is_empty() {
            let text = String::from_utf8_lossy(&chunk);
            trace!("console rx: {text:?}");
            self.buffer.push_str(&text);
        }
        Ok(())
    }

    /// Accumulate input for the given window and return the buffer.
    pub fn pump(&mut self, window: Duration) -> Result<&str> {
        let deadline = Instant::now() + window;
        loop {
            self.poll()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(self.buffer.as_str());
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    /// Poll until any pattern appears in the rolling buffer or the timeout
    /// expires. Returns the index of the matched pattern, or `None` on
    /// timeout; callers map `None` to their own typed timeout error.
    pub fn wait_for(&mut self, patterns: &[&str], timeout: Duration) -> Result<Option<usize>> {
        let deadline = Instant::now() + timeout;
        loop {
            self.poll()?;
            for (index, pattern) in patterns.iter().enumerate() {
                if self.buffer.contains(pattern) {
                    return Ok(Some(index));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    /// Everything accumulated since the last reset.
    #[must_use]
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Discard the rolling buffer and any stale driver input.
    pub fn reset(&mut self) -> Result<()> {
        self.buffer.clear();
        self.port.discard_input()
    }

    /// Configured poll cadence.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(port: ScriptedPort) -> SerialSession {
        SerialSession::new(Box::new(port), Duration::from_millis(1))
    }

    #[test]
    fn accumulates_partial_chunks() {
        let port = ScriptedPort::new().emit("log").emit("in: ");
        let mut session = session(port);
        let matched = session
            .wait_for(&["login: "], Duration::from_millis(50))
            .unwrap();
        assert_eq!(matched, Some(0));
    }

    #[test]
    fn wait_for_times_out_without_marker() {
        let port = ScriptedPort::new().emit("nothing useful");
        let mut session = session(port);
        let matched = session
            .wait_for(&["=> "], Duration::from_millis(20))
            .unwrap();
        assert_eq!(matched, None);
    }

    #[test]
    fn reset_discards_rolling_buffer() {
        let port = ScriptedPort::new().emit("stale bytes");
        let mut session = session(port);
        session.pump(Duration::from_millis(5)).unwrap();
        assert!(!session.buffer().is_empty());
        session.reset().unwrap();
        assert!(session.buffer().is_empty());
    }

    #[test]
    fn scripted_reply_fires_on_exact_write() {
        let port = ScriptedPort::new().on("root\r\n", "Password: ");
        let mut session = session(port);
        session.send_line("root").unwrap();
        let matched = session
            .wait_for(&["Password: "], Duration::from_millis(50))
            .unwrap();
        assert_eq!(matched, Some(0));
    }
}
