// CLEN Gateway - Sensor network control node
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Relay between a pub/sub broker and the serial link
//!
//! # Envelope Format
//!
//! ```text
//! PURPOSE;REPLY_CHANNEL;WAIT_BUDGET_MS;PAYLOAD
//! ```
//!
//! Only the first three `;` split fields, so the payload may contain `;`.
//! A budget of `-1` or `0` means no reply is expected.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{EnvelopeError, TransportError};
use crate::pubsub::PubSub;
use crate::transport::{SerialIo, SerialLink};

/// Longest single wait on the serial link before checking for shutdown
const CANCEL_CHECK: Duration = Duration::from_millis(250);

/// Consecutive serial failures after which the bridge gives up
const MAX_SERIAL_FAILURES: u32 = 5;

/// What an envelope carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Command,
    Response,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "COMMAND",
            Self::Response => "RESPONSE",
        }
    }
}

/// A message exchanged with the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub purpose: Purpose,
    pub reply_channel: String,
    pub wait_budget_ms: i64,
    pub payload: String,
}

impl Envelope {
    /// A command expecting replies on `reply_channel` for `wait_budget`
    pub fn command(reply_channel: impl Into<String>, wait_budget: Duration, payload: impl Into<String>) -> Self {
        let wait_budget_ms = if wait_budget.is_zero() {
            -1
        } else {
            i64::try_from(wait_budget.as_millis()).unwrap_or(i64::MAX)
        };
        Self {
            purpose: Purpose::Command,
            reply_channel: reply_channel.into(),
            wait_budget_ms,
            payload: payload.into(),
        }
    }

    /// A response carrying one frame
    pub fn response(payload: impl Into<String>) -> Self {
        Self {
            purpose: Purpose::Response,
            reply_channel: String::new(),
            wait_budget_ms: 0,
            payload: payload.into(),
        }
    }

    /// How long replies are expected for, `None` when none are
    pub fn wait_budget(&self) -> Option<Duration> {
        (self.wait_budget_ms > 0).then(|| Duration::from_millis(self.wait_budget_ms as u64))
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{};{};{}",
            self.purpose.as_str(),
            self.reply_channel,
            self.wait_budget_ms,
            self.payload
        )
    }
}

impl FromStr for Envelope {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.splitn(4, ';').collect();
        if fields.len() != 4 {
            return Err(EnvelopeError::FieldCount(fields.len()));
        }
        let purpose = match fields[0] {
            "COMMAND" => Purpose::Command,
            "RESPONSE" => Purpose::Response,
            other => return Err(EnvelopeError::UnknownPurpose(other.to_string())),
        };
        let wait_budget_ms = fields[2]
            .trim()
            .parse()
            .map_err(|_| EnvelopeError::InvalidBudget(fields[2].to_string()))?;
        Ok(Self {
            purpose,
            reply_channel: fields[1].to_string(),
            wait_budget_ms,
            payload: fields[3].to_string(),
        })
    }
}

/// Serves relayed commands on a co-located serial link.
///
/// Each command payload is written to the port verbatim; every frame read
/// within the wait budget is published right away on the reply channel.
pub struct RelayBridge<P: SerialIo> {
    broker: Arc<dyn PubSub>,
    link: SerialLink<P>,
    command_topic: String,
    served: u64,
    failures: u32,
}

impl<P: SerialIo> RelayBridge<P> {
    pub fn new(broker: Arc<dyn PubSub>, link: SerialLink<P>, command_topic: impl Into<String>) -> Self {
        Self {
            broker,
            link,
            command_topic: command_topic.into(),
            served: 0,
            failures: 0,
        }
    }

    /// Commands served so far
    pub fn served(&self) -> u64 {
        self.served
    }

    /// Serve commands until `cancel` fires or the subscription ends
    pub async fn run(self, cancel: CancellationToken) -> Result<(), TransportError> {
        let commands = self.listen().await?;
        self.serve_commands(commands, cancel).await
    }

    /// Subscribe to the command topic, then serve commands on a new task.
    ///
    /// Commands published once this returns are queued for the bridge.
    pub async fn start(
        self,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<Result<(), TransportError>>, TransportError>
    where
        P: 'static,
    {
        let commands = self.listen().await?;
        Ok(tokio::spawn(self.serve_commands(commands, cancel)))
    }

    async fn listen(&self) -> Result<mpsc::UnboundedReceiver<String>, TransportError> {
        let commands = self.broker.subscribe(&self.command_topic).await?;
        info!(topic = %self.command_topic, "Relay bridge listening");
        Ok(commands)
    }

    async fn serve_commands(
        mut self,
        mut commands: mpsc::UnboundedReceiver<String>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = commands.recv() => message,
            };
            let Some(text) = message else {
                warn!("Relay command subscription closed");
                break;
            };
            match self.serve(&text, &cancel).await {
                Ok(()) => self.failures = 0,
                Err(e) => {
                    self.failures += 1;
                    if self.failures >= MAX_SERIAL_FAILURES {
                        error!(error = %e, failures = self.failures, "Serial link keeps failing, relay stopping");
                        return Err(e);
                    }
                    warn!(error = %e, failures = self.failures, "Serial link error, relay command dropped");
                }
            }
        }
        info!(served = self.served, "Relay bridge stopped");
        Ok(())
    }

    async fn serve(&mut self, text: &str, cancel: &CancellationToken) -> Result<(), TransportError> {
        let envelope = match text.parse::<Envelope>() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, message = text, "Malformed relay message ignored");
                return Ok(());
            }
        };
        if envelope.purpose != Purpose::Command {
            warn!(purpose = envelope.purpose.as_str(), "Relay message is not a command, ignored");
            return Ok(());
        }

        self.link.discard_pending()?;
        self.link.write(&envelope.payload)?;
        self.served += 1;

        let Some(budget) = envelope.wait_budget() else {
            debug!("No reply expected");
            return Ok(());
        };

        let deadline = Instant::now() + budget;
        let mut forwarded = 0usize;
        while !cancel.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.link.poll_frame((deadline - now).min(CANCEL_CHECK)).await? {
                Some(Ok(frame)) => {
                    let reply = Envelope::response(frame.to_wire()).to_string();
                    if let Err(e) = self.broker.publish(&envelope.reply_channel, reply).await {
                        warn!(error = %e, channel = %envelope.reply_channel, "Cannot publish relay reply");
                    }
                    forwarded += 1;
                }
                Some(Err(e)) => warn!(error = %e, "Invalid frame on serial link"),
                None => {}
            }
        }
        debug!(forwarded, budget_ms = envelope.wait_budget_ms, "Relay window closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::MemoryBroker;
    use crate::transport::serial::MemorySerial;
    use std::io;

    /// Port whose first `failing` writes error out
    struct FlakySerial {
        inner: MemorySerial,
        failing: usize,
    }

    impl SerialIo for FlakySerial {
        fn bytes_to_read(&mut self) -> io::Result<usize> {
            self.inner.bytes_to_read()
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.inner.read(buf)
        }

        fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
            if self.failing > 0 {
                self.failing -= 1;
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "port unplugged"));
            }
            self.inner.write_all(bytes)
        }
    }

    #[test]
    fn test_envelope_parse() {
        let env: Envelope = "COMMAND;clen/reply/a;600;#00100AQRYMSR#".parse().unwrap();
        assert_eq!(env.purpose, Purpose::Command);
        assert_eq!(env.reply_channel, "clen/reply/a");
        assert_eq!(env.wait_budget(), Some(Duration::from_millis(600)));
        assert_eq!(env.payload, "#00100AQRYMSR#");
    }

    #[test]
    fn test_envelope_payload_keeps_semicolons() {
        let env: Envelope = "RESPONSE;;0;a;b;c".parse().unwrap();
        assert_eq!(env.payload, "a;b;c");
        assert_eq!(env.wait_budget(), None);
    }

    #[test]
    fn test_envelope_errors() {
        assert_eq!("COMMAND;x;1".parse::<Envelope>(), Err(EnvelopeError::FieldCount(3)));
        assert!(matches!(
            "PING;x;1;y".parse::<Envelope>(),
            Err(EnvelopeError::UnknownPurpose(_))
        ));
        assert!(matches!(
            "COMMAND;x;soon;y".parse::<Envelope>(),
            Err(EnvelopeError::InvalidBudget(_))
        ));
    }

    #[test]
    fn test_command_without_reply() {
        let env = Envelope::command("r", Duration::ZERO, "#001000CONFIGTG1#");
        assert_eq!(env.to_string(), "COMMAND;r;-1;#001000CONFIGTG1#");
        assert_eq!(env.wait_budget(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_forwards_each_frame() {
        let broker = Arc::new(MemoryBroker::new());
        let port = MemorySerial::new().with_responder(|_| {
            vec!["#00A001IDNRES#".to_string(), "#00B001IDNRES#".to_string()]
        });
        let bridge = RelayBridge::new(broker.clone(), SerialLink::new(port.clone()), "clen/serial");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(bridge.run(cancel.clone()));
        while broker.subscribers("clen/serial") == 0 {
            tokio::task::yield_now().await;
        }

        let mut replies = broker.subscribe("clen/reply/t").await.unwrap();
        let command = Envelope::command("clen/reply/t", Duration::from_secs(2), "#001000IDNREQ#");
        broker.publish("clen/serial", command.to_string()).await.unwrap();

        assert_eq!(replies.recv().await.unwrap(), "RESPONSE;;0;#00A001IDNRES#");
        assert_eq!(replies.recv().await.unwrap(), "RESPONSE;;0;#00B001IDNRES#");
        assert_eq!(port.written(), vec!["#001000IDNREQ#".to_string()]);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_ignores_responses() {
        let broker = Arc::new(MemoryBroker::new());
        let port = MemorySerial::new();
        let bridge = RelayBridge::new(broker.clone(), SerialLink::new(port.clone()), "clen/serial");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(bridge.run(cancel.clone()));
        while broker.subscribers("clen/serial") == 0 {
            tokio::task::yield_now().await;
        }

        broker
            .publish("clen/serial", "RESPONSE;;0;#00A001IDNRES#".into())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(port.written().is_empty());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_subscribes_before_returning() {
        let broker = Arc::new(MemoryBroker::new());
        let port = MemorySerial::new();
        let bridge = RelayBridge::new(broker.clone(), SerialLink::new(port.clone()), "clen/serial");

        let cancel = CancellationToken::new();
        let task = bridge.start(cancel.clone()).await.unwrap();
        assert_eq!(broker.subscribers("clen/serial"), 1);

        let command = Envelope::command("r", Duration::ZERO, "#001000IDNREQ#");
        broker.publish("clen/serial", command.to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(port.written(), vec!["#001000IDNREQ#".to_string()]);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_survives_write_error() {
        let broker = Arc::new(MemoryBroker::new());
        let inner = MemorySerial::new();
        let port = FlakySerial {
            inner: inner.clone(),
            failing: 1,
        };
        let bridge = RelayBridge::new(broker.clone(), SerialLink::new(port), "clen/serial");

        let cancel = CancellationToken::new();
        let task = bridge.start(cancel.clone()).await.unwrap();

        let first = Envelope::command("r", Duration::ZERO, "#001000IDNREQ#");
        broker.publish("clen/serial", first.to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(inner.written().is_empty());
        assert!(!task.is_finished());

        let second = Envelope::command("r", Duration::ZERO, "#001000CONFIGTG1#");
        broker.publish("clen/serial", second.to_string()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(inner.written(), vec!["#001000CONFIGTG1#".to_string()]);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_bridge_stops_after_repeated_errors() {
        let broker = Arc::new(MemoryBroker::new());
        let port = FlakySerial {
            inner: MemorySerial::new(),
            failing: usize::MAX,
        };
        let bridge = RelayBridge::new(broker.clone(), SerialLink::new(port), "clen/serial");

        let cancel = CancellationToken::new();
        let task = bridge.start(cancel.clone()).await.unwrap();
        for _ in 0..MAX_SERIAL_FAILURES {
            let command = Envelope::command("r", Duration::ZERO, "#001000IDNREQ#");
            broker.publish("clen/serial", command.to_string()).await.unwrap();
        }

        let result = tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(TransportError::Io(_))));
    }
}
