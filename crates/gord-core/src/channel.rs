//! Control channel to the real-time engine.
//!
//! Messages are JSON objects tagged by `cmd`, one per datagram. Delivery is
//! best-effort: nothing is acknowledged, so callers rely on repeated,
//! idempotent pushes rather than handshakes.
//!
//! - [`ControlMessage`] - Wire messages
//! - [`ControlChannel`] - The send seam
//! - [`DatagramChannel`] - Unix datagram or UDP transport, or a no-op sink
//! - [`RecordingChannel`] - In-memory channel for tests and dry runs

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
#[cfg(unix)]
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::selection::REST;
use crate::slots::ChainSlot;

/// Default engine socket.
pub const DEFAULT_SOCKET: &str = "/tmp/gord_rt.sock";

/// Errors at the channel boundary.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Message could not be serialized
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Nobody is listening (socket missing, connection refused)
    #[error("engine unavailable: {0}")]
    Unavailable(io::Error),

    /// Socket buffer full
    #[error("send would block")]
    WouldBlock,

    /// Any other socket error
    #[error("io error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::WouldBlock => ChannelError::WouldBlock,
            io::ErrorKind::NotFound
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable => ChannelError::Unavailable(e),
            _ => ChannelError::Io(e),
        }
    }
}

/// A message for the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Transport parameters.
    Set {
        tempo: f64,
        subdivision: u32,
        /// Gate in percent (1..=99).
        gate: f64,
        channel: u8,
        transpose: i32,
        slave_mode: bool,
        /// Apply now rather than at the next step.
        immediate: bool,
    },
    /// Single-sequence lane. `-1` is a rest.
    Seq { notes: Vec<i32> },
    /// Multi-slot playlist starting at `index`.
    Chain { slots: Vec<ChainSlot>, index: usize },
    Start,
    Stop,
    Panic,
}

impl ControlMessage {
    /// The all-rest sequence.
    pub fn silence() -> Self {
        ControlMessage::Seq { notes: vec![REST] }
    }

    /// Sequence message with out-of-range values replaced by rests.
    pub fn seq(notes: impl IntoIterator<Item = i32>) -> Self {
        ControlMessage::Seq {
            notes: notes.into_iter().map(normalize_note).collect(),
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Set { .. } => "set",
            ControlMessage::Seq { .. } => "seq",
            ControlMessage::Chain { .. } => "chain",
            ControlMessage::Start => "start",
            ControlMessage::Stop => "stop",
            ControlMessage::Panic => "panic",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ChannelError> {
        Ok(serde_json::to_vec(self)?)
    }
}

fn normalize_note(n: i32) -> i32 {
    if (0..=127).contains(&n) {
        n
    } else {
        REST
    }
}

/// Fire-and-forget sink for [`ControlMessage`]s.
///
/// Implementations must not block.
pub trait ControlChannel: Send + Sync {
    fn send(&self, msg: &ControlMessage) -> Result<(), ChannelError>;

    /// Human-readable target for logs.
    fn describe(&self) -> String {
        "channel".to_string()
    }
}

/// Sent/failed counters.
#[derive(Debug, Default)]
pub struct ChannelStats {
    sent: AtomicU64,
    failed: AtomicU64,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: &Result<(), ChannelError>) {
        match result {
            Ok(()) => self.sent.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

enum Endpoint {
    #[cfg(unix)]
    Unix { sock: UnixDatagram, path: PathBuf },
    Udp { sock: UdpSocket, addr: SocketAddr },
    Noop,
}

/// Non-blocking datagram transport.
pub struct DatagramChannel {
    endpoint: Endpoint,
}

impl DatagramChannel {
    /// Open a channel for a target string: `udp://host:port` selects UDP,
    /// `noop` a discarding sink, anything else is a Unix socket path.
    pub fn open(target: &str) -> Result<Self, ChannelError> {
        let target = target.trim();
        if target == "noop" {
            return Ok(Self::noop());
        }
        match target.strip_prefix("udp://") {
            Some(addr) => Self::udp(addr),
            None => Self::unix(target),
        }
    }

    /// Unix datagram socket addressed at `path`.
    #[cfg(unix)]
    pub fn unix(path: impl Into<PathBuf>) -> Result<Self, ChannelError> {
        let sock = UnixDatagram::unbound().map_err(ChannelError::Io)?;
        sock.set_nonblocking(true).map_err(ChannelError::Io)?;
        Ok(Self {
            endpoint: Endpoint::Unix {
                sock,
                path: path.into(),
            },
        })
    }

    #[cfg(not(unix))]
    pub fn unix(path: impl Into<PathBuf>) -> Result<Self, ChannelError> {
        let path = path.into();
        Err(ChannelError::Unavailable(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unix sockets are not available here: {}", path.display()),
        )))
    }

    /// UDP socket bound to an ephemeral port, sending to `addr`.
    ///
    /// Host names are resolved here, once; sends never hit the resolver.
    pub fn udp(addr: &str) -> Result<Self, ChannelError> {
        let target = addr
            .to_socket_addrs()
            .map_err(ChannelError::Unavailable)?
            .next()
            .ok_or_else(|| {
                ChannelError::Unavailable(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address for {}", addr),
                ))
            })?;
        let sock = UdpSocket::bind("0.0.0.0:0").map_err(ChannelError::Io)?;
        sock.set_nonblocking(true).map_err(ChannelError::Io)?;
        log::debug!("[CHANNEL] udp://{} resolved to {}", addr, target);
        Ok(Self {
            endpoint: Endpoint::Udp { sock, addr: target },
        })
    }

    /// A channel that accepts and discards everything.
    pub fn noop() -> Self {
        Self {
            endpoint: Endpoint::Noop,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self.endpoint, Endpoint::Noop)
    }
}

impl ControlChannel for DatagramChannel {
    fn send(&self, msg: &ControlMessage) -> Result<(), ChannelError> {
        let buf = msg.encode()?;
        match &self.endpoint {
            #[cfg(unix)]
            Endpoint::Unix { sock, path } => {
                sock.send_to(&buf, path)?;
            }
            Endpoint::Udp { sock, addr } => {
                sock.send_to(&buf, *addr)?;
            }
            Endpoint::Noop => {}
        }
        Ok(())
    }

    fn describe(&self) -> String {
        match &self.endpoint {
            #[cfg(unix)]
            Endpoint::Unix { path, .. } => path.display().to_string(),
            Endpoint::Udp { addr, .. } => format!("udp://{}", addr),
            Endpoint::Noop => "noop".to_string(),
        }
    }
}

impl std::fmt::Debug for DatagramChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramChannel")
            .field("target", &self.describe())
            .finish_non_exhaustive()
    }
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct RecordingChannel {
    messages: Mutex<Vec<ControlMessage>>,
    failing: AtomicBool,
    echo: bool,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also log every message at info level.
    pub fn with_echo() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    /// Make subsequent sends fail with [`ChannelError::Unavailable`].
    /// Failed messages are not recorded.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn messages(&self) -> Vec<ControlMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain the recorded messages.
    pub fn take(&self) -> Vec<ControlMessage> {
        std::mem::take(&mut *self.messages.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn count(&self, kind: &str) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|m| m.kind() == kind)
            .count()
    }

    /// The most recent `seq` payload.
    pub fn last_seq(&self) -> Option<Vec<i32>> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find_map(|m| match m {
                ControlMessage::Seq { notes } => Some(notes.clone()),
                _ => None,
            })
    }
}

impl ControlChannel for RecordingChannel {
    fn send(&self, msg: &ControlMessage) -> Result<(), ChannelError> {
        if self.failing.load(Ordering::Relaxed) {
            return Err(ChannelError::Unavailable(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "recording channel set to fail",
            )));
        }
        if self.echo {
            let json = String::from_utf8_lossy(&msg.encode()?).into_owned();
            log::info!("[CHANNEL] {}", json);
        }
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(msg.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "recording".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format() {
        let set = ControlMessage::Set {
            tempo: 120.0,
            subdivision: 16,
            gate: 80.0,
            channel: 1,
            transpose: 0,
            slave_mode: false,
            immediate: true,
        };
        assert_eq!(
            serde_json::to_value(&set).unwrap(),
            json!({"cmd": "set", "tempo": 120.0, "subdivision": 16, "gate": 80.0,
                   "channel": 1, "transpose": 0, "slave_mode": false, "immediate": true})
        );
        assert_eq!(
            serde_json::to_value(ControlMessage::Start).unwrap(),
            json!({"cmd": "start"})
        );
        let chain = ControlMessage::Chain {
            slots: vec![ChainSlot {
                notes: vec![60, -1],
                loops: -1,
            }],
            index: 0,
        };
        assert_eq!(
            serde_json::to_value(&chain).unwrap(),
            json!({"cmd": "chain", "slots": [{"notes": [60, -1], "loops": -1}], "index": 0})
        );
    }

    #[test]
    fn test_seq_normalizes_out_of_range() {
        assert_eq!(
            ControlMessage::seq([60, 128, -5, 0]),
            ControlMessage::Seq {
                notes: vec![60, -1, -1, 0]
            }
        );
        assert_eq!(ControlMessage::silence(), ControlMessage::seq([-1]));
    }

    #[test]
    fn test_io_error_classification() {
        let e: ChannelError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert!(matches!(e, ChannelError::WouldBlock));
        let e: ChannelError = io::Error::from(io::ErrorKind::NotFound).into();
        assert!(matches!(e, ChannelError::Unavailable(_)));
        let e: ChannelError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert!(matches!(e, ChannelError::Io(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_send_without_listener_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let ch = DatagramChannel::open(dir.path().join("missing.sock").to_str().unwrap()).unwrap();
        let err = ch.send(&ControlMessage::Start).unwrap_err();
        assert!(matches!(err, ChannelError::Unavailable(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_unix_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.sock");
        let listener = UnixDatagram::bind(&path).unwrap();
        let ch = DatagramChannel::unix(&path).unwrap();
        ch.send(&ControlMessage::seq([60, 64])).unwrap();
        let mut buf = [0u8; 1024];
        let n = listener.recv(&mut buf).unwrap();
        let msg: ControlMessage = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(msg, ControlMessage::seq([60, 64]));
    }

    #[test]
    fn test_noop_and_udp() {
        let ch = DatagramChannel::open("noop").unwrap();
        assert!(ch.is_noop());
        assert!(ch.send(&ControlMessage::Panic).is_ok());

        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let ch = DatagramChannel::open(&format!("udp://{}", addr)).unwrap();
        assert_eq!(ch.describe(), format!("udp://{}", addr));
        ch.send(&ControlMessage::Stop).unwrap();
        let mut buf = [0u8; 256];
        let n = listener.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], br#"{"cmd":"stop"}"#);
    }

    #[test]
    fn test_udp_host_name_is_resolved_up_front() {
        let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let ch = DatagramChannel::udp(&format!("localhost:{}", port)).unwrap();
        // The stored target is a socket address, not the host name.
        assert!(!ch.describe().contains("localhost"));
        assert!(ch.describe().ends_with(&format!(":{}", port)));

        let err = DatagramChannel::udp("not a host").unwrap_err();
        assert!(matches!(err, ChannelError::Unavailable(_)));
    }

    #[test]
    fn test_recording_channel() {
        let ch = RecordingChannel::new();
        let stats = ChannelStats::new();
        stats.record(&ch.send(&ControlMessage::Start));
        ch.set_failing(true);
        stats.record(&ch.send(&ControlMessage::Stop));
        assert_eq!(stats.sent(), 1);
        assert_eq!(stats.failed(), 1);
        assert_eq!(ch.count("start"), 1);
        assert_eq!(ch.count("stop"), 0);
        assert_eq!(ch.take().len(), 1);
        assert!(ch.messages().is_empty());
    }
}
