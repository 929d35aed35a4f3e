// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Serial link to the sensor network
//!
//! [`SerialLink`] turns a byte port into a stream of frames. It is shared by
//! [`DirectTransport`] and the relay bridge, which are the only two owners a
//! physical port ever has.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serialport::SerialPort;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ExchangeGuard, Transport, TransportKind, TransportMetrics};
use crate::error::{FrameError, TransportError};
use crate::protocol::{encode, Frame, FrameAccumulator, MessageType, NodeId};

/// Default interval between polls of the port
pub const DEFAULT_POLL_TICK: Duration = Duration::from_millis(10);

/// Read timeout handed to the OS; reads only happen when bytes are waiting
const PORT_TIMEOUT: Duration = Duration::from_millis(100);

/// Minimal byte-port interface
pub trait SerialIo: Send {
    /// Bytes that can be read without blocking
    fn bytes_to_read(&mut self) -> io::Result<usize>;

    /// Read available bytes
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write a whole buffer and flush it
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl SerialIo for Box<dyn SerialPort> {
    fn bytes_to_read(&mut self) -> io::Result<usize> {
        Ok(SerialPort::bytes_to_read(self.as_ref())? as usize)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(self, buf)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        Write::write_all(self, bytes)?;
        Write::flush(self)
    }
}

/// Open a serial port at 8N1
pub fn open_port(port: &str, baud_rate: u32) -> Result<Box<dyn SerialPort>, TransportError> {
    let opened = serialport::new(port, baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .stop_bits(serialport::StopBits::One)
        .parity(serialport::Parity::None)
        .timeout(PORT_TIMEOUT)
        .open()
        .map_err(|e| TransportError::Open {
            port: port.to_string(),
            reason: e.to_string(),
        })?;
    info!(port, baud_rate, "Serial port opened");
    Ok(opened)
}

/// Frame-level access to a byte port
pub struct SerialLink<P: SerialIo> {
    port: P,
    accumulator: FrameAccumulator,
    poll_tick: Duration,
}

impl<P: SerialIo> SerialLink<P> {
    pub fn new(port: P) -> Self {
        Self {
            port,
            accumulator: FrameAccumulator::new(),
            poll_tick: DEFAULT_POLL_TICK,
        }
    }

    /// Change the polling interval
    pub fn with_poll_tick(mut self, tick: Duration) -> Self {
        self.poll_tick = tick;
        self
    }

    /// Write a wire string to the port
    pub fn write(&mut self, wire: &str) -> Result<(), TransportError> {
        debug!(wire, "Serial write");
        self.port.write_all(wire.as_bytes())?;
        Ok(())
    }

    /// Drop anything already waiting on the port or in the buffer
    pub fn discard_pending(&mut self) -> Result<usize, TransportError> {
        let drained = self.drain_port()?;
        let dropped = drained + self.accumulator.pending();
        self.accumulator.clear();
        if dropped > 0 {
            debug!(bytes = dropped, "Discarded stale serial input");
        }
        Ok(dropped)
    }

    /// Wait up to `timeout` for the next delimited candidate.
    ///
    /// Returns `None` when the timeout elapses with no complete candidate.
    pub async fn poll_frame(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Result<Frame, FrameError>>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(candidate) = self.accumulator.next_frame() {
                return Ok(Some(candidate));
            }
            if self.drain_port()? > 0 {
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_tick.min(deadline - now)).await;
        }
    }

    fn drain_port(&mut self) -> Result<usize, TransportError> {
        let mut total = 0;
        let mut buf = [0u8; 256];
        while self.port.bytes_to_read()? > 0 {
            let n = self.port.read(&mut buf)?;
            if n == 0 {
                break;
            }
            self.accumulator.push(&buf[..n]);
            total += n;
        }
        Ok(total)
    }
}

/// Transport that owns the serial port
pub struct DirectTransport<P: SerialIo = Box<dyn SerialPort>> {
    link: SerialLink<P>,
    guard: ExchangeGuard,
    metrics: TransportMetrics,
}

impl DirectTransport {
    /// Open the port and wrap it
    pub fn open(port: &str, baud_rate: u32) -> Result<Self, TransportError> {
        Ok(Self::new(open_port(port, baud_rate)?))
    }
}

impl<P: SerialIo> DirectTransport<P> {
    pub fn new(port: P) -> Self {
        Self::from_link(SerialLink::new(port))
    }

    pub fn from_link(link: SerialLink<P>) -> Self {
        Self {
            link,
            guard: ExchangeGuard::new(),
            metrics: TransportMetrics::default(),
        }
    }
}

#[async_trait]
impl<P: SerialIo> Transport for DirectTransport<P> {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    async fn send(
        &mut self,
        dest: &NodeId,
        msg_type: MessageType,
        data: &str,
        reply_window: Duration,
    ) -> Result<(), TransportError> {
        self.guard.begin(dest, reply_window)?;
        self.link.discard_pending()?;
        let wire = encode(&NodeId::control(), dest, &msg_type, data);
        self.link.write(&wire)?;
        self.metrics.frames_sent += 1;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Frame>, TransportError> {
        let polled = self.link.poll_frame(timeout).await;
        self.guard.resolve();
        match polled? {
            Some(Ok(frame)) => {
                debug!(frame = %frame, "Serial frame received");
                self.metrics.frames_received += 1;
                Ok(Some(frame))
            }
            Some(Err(e)) => {
                warn!(error = %e, "Invalid frame on serial link");
                self.metrics.invalid_frames += 1;
                Ok(None)
            }
            None => {
                self.metrics.timeouts += 1;
                Ok(None)
            }
        }
    }

    fn metrics(&self) -> TransportMetrics {
        self.metrics.clone()
    }
}

type SerialResponder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

#[derive(Default)]
struct MemorySerialState {
    incoming: VecDeque<u8>,
    written: Vec<String>,
    responder: Option<SerialResponder>,
}

/// In-memory serial port.
///
/// Clones share the same state, so a test can keep a handle to inject bytes
/// and inspect writes after handing the port to a link.
#[derive(Clone, Default)]
pub struct MemorySerial {
    state: Arc<Mutex<MemorySerialState>>,
}

impl MemorySerial {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every write with the wire strings returned by `responder`
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        self.lock().responder = Some(Box::new(responder));
        self
    }

    /// Make bytes available for reading
    pub fn inject(&self, bytes: &[u8]) {
        self.lock().incoming.extend(bytes.iter().copied());
    }

    /// Everything written so far, one entry per write
    pub fn written(&self) -> Vec<String> {
        self.lock().written.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemorySerialState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SerialIo for MemorySerial {
    fn bytes_to_read(&mut self) -> io::Result<usize> {
        Ok(self.lock().incoming.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        let n = buf.len().min(state.incoming.len());
        for (slot, byte) in buf.iter_mut().zip(state.incoming.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(bytes).into_owned();
        let mut state = self.lock();
        let replies = match state.responder.as_mut() {
            Some(responder) => responder(&text),
            None => Vec::new(),
        };
        for reply in replies {
            state.incoming.extend(reply.bytes());
        }
        state.written.push(text);
        Ok(())
    }
}
