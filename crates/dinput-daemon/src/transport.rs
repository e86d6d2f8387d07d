//! Messages exchanged with peers and the transport that carries them.

use async_trait::async_trait;
use dinput_types::{InputDevice, InputTypes, RawEvent, SinkScreenInfo};
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

use crate::error::DaemonError;

/// One message between two daemons.
#[derive(Debug, Clone)]
pub enum PeerMessage {
    /// Session opening. Answered with a `Hello` of our own.
    Hello,
    /// Session closing.
    Bye,
    /// A device the sender can share.
    DeviceAnnounced(InputDevice),
    DeviceWithdrawn { dh_id: String },
    /// Ask the receiver to forward the listed devices.
    StartSharing {
        session_id: String,
        dh_ids: Vec<String>,
    },
    StopSharing {
        session_id: String,
        dh_ids: Vec<String>,
    },
    /// Ask the receiver to forward every device of the given types.
    ShareInputTypes {
        session_id: String,
        enabled: bool,
        types: InputTypes,
    },
    /// Raw events of shared devices.
    Events(Vec<RawEvent>),
    /// Releases for input a device stopped forwarding mid-press.
    Compensate { dh_id: String, events: Vec<RawEvent> },
    /// The sender's projection window, used to remap touch input.
    ScreenInfo(SinkScreenInfo),
}

/// Carries [`PeerMessage`]s between daemons.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `message` to the peer named `to`.
    async fn send(&self, to: &str, message: PeerMessage) -> Result<(), DaemonError>;

    /// Next message from any peer, with the sender's network id.
    ///
    /// Returns `None` once no peer can reach us any more.
    async fn recv(&self) -> Option<(String, PeerMessage)>;
}

/// In-process transport over tokio channels.
pub struct ChannelTransport {
    local_id: String,
    outgoing: mpsc::Sender<(String, PeerMessage)>,
    incoming: Mutex<mpsc::Receiver<(String, PeerMessage)>>,
}

impl ChannelTransport {
    /// Two connected endpoints for the daemons `a` and `b`.
    pub fn pair(a: &str, b: &str, capacity: usize) -> (Self, Self) {
        let (to_b, from_a) = mpsc::channel(capacity);
        let (to_a, from_b) = mpsc::channel(capacity);
        (
            Self {
                local_id: a.to_string(),
                outgoing: to_b,
                incoming: Mutex::new(from_b),
            },
            Self {
                local_id: b.to_string(),
                outgoing: to_a,
                incoming: Mutex::new(from_a),
            },
        )
    }

    /// An endpoint whose messages come back to itself.
    pub fn loopback(local_id: &str, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            local_id: local_id.to_string(),
            outgoing: tx,
            incoming: Mutex::new(rx),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, to: &str, message: PeerMessage) -> Result<(), DaemonError> {
        trace!(from = %self.local_id, to, ?message, "sending");
        self.outgoing
            .send((self.local_id.clone(), message))
            .await
            .map_err(|_| DaemonError::Transport(format!("peer {to} is unreachable")))
    }

    async fn recv(&self) -> Option<(String, PeerMessage)> {
        self.incoming.lock().await.recv().await
    }
}
