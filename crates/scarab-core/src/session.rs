//! Live beacon sessions and the session registry.
//!
//! A session is created when a beacon completes key exchange and destroyed
//! when its connection closes. The registry is shared by every listener
//! worker and by the push-task worker, so all operations take `&self` and
//! are safe under concurrent mutation; lookups see a per-entry consistent
//! snapshot, not a whole-map one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::codec::Transport;
use crate::crypto::SESSION_KEY_LEN;

/// Outbound send failure on a beacon connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The TCP writer for this connection is gone.
    #[error("connection to {peer} is closed")]
    Closed {
        /// Remote address of the dead connection.
        peer: SocketAddr,
    },

    /// The datagram could not be sent.
    #[error("datagram send to {peer} failed: {source}")]
    Io {
        /// Intended destination.
        peer: SocketAddr,
        /// Underlying socket error.
        source: std::io::Error,
    },
}

/// Handle to a live beacon connection, polymorphic over the two send paths:
/// stream writes go through the connection's serialized writer task,
/// datagrams go straight out of the listener's socket.
#[derive(Debug, Clone)]
pub enum ConnHandle {
    /// Established TCP connection.
    Tcp {
        /// Remote address.
        peer: SocketAddr,
        /// Sender feeding the connection's writer task.
        writer: mpsc::UnboundedSender<Bytes>,
    },
    /// UDP peer reached through a shared listener socket.
    Udp {
        /// Remote address.
        peer: SocketAddr,
        /// The listener's bound socket.
        socket: Arc<UdpSocket>,
    },
}

impl ConnHandle {
    /// Handle for a TCP connection whose writes drain through `writer`.
    #[must_use]
    pub const fn tcp(peer: SocketAddr, writer: mpsc::UnboundedSender<Bytes>) -> Self {
        Self::Tcp { peer, writer }
    }

    /// Handle for a UDP peer behind the listener's shared socket.
    #[must_use]
    pub const fn udp(peer: SocketAddr, socket: Arc<UdpSocket>) -> Self {
        Self::Udp { peer, socket }
    }

    /// Transport this connection uses.
    #[must_use]
    pub const fn transport(&self) -> Transport {
        match self {
            Self::Tcp { .. } => Transport::Tcp,
            Self::Udp { .. } => Transport::Udp,
        }
    }

    /// Remote address of the beacon.
    #[must_use]
    pub const fn peer_addr(&self) -> SocketAddr {
        match self {
            Self::Tcp { peer, .. } | Self::Udp { peer, .. } => *peer,
        }
    }

    /// Sends one packed frame to the beacon.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when the writer is gone (TCP) or the
    /// datagram send fails (UDP).
    pub async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        match self {
            Self::Tcp { peer, writer } => writer
                .send(frame)
                .map_err(|_| TransportError::Closed { peer: *peer }),
            Self::Udp { peer, socket } => {
                socket
                    .send_to(&frame, *peer)
                    .await
                    .map_err(|source| TransportError::Io {
                        peer: *peer,
                        source,
                    })?;
                Ok(())
            }
        }
    }
}

/// One established beacon session.
#[derive(Debug, Clone)]
pub struct BeaconSession {
    /// Fleet-unique identifier chosen by the beacon.
    pub beacon_id: String,
    /// 56-byte XChaCha20 session key (32-byte key, 24-byte nonce).
    pub session_key: Bytes,
    /// The live connection.
    pub conn: ConnHandle,
}

impl BeaconSession {
    /// Builds a session record. The key length is the caller's contract;
    /// the handler rejects non-[`SESSION_KEY_LEN`] keys before this point.
    #[must_use]
    pub fn new(beacon_id: impl Into<String>, session_key: Bytes, conn: ConnHandle) -> Self {
        debug_assert_eq!(session_key.len(), SESSION_KEY_LEN);
        Self {
            beacon_id: beacon_id.into(),
            session_key,
            conn,
        }
    }

    /// Transport of the underlying connection.
    #[must_use]
    pub const fn transport(&self) -> Transport {
        self.conn.transport()
    }
}

/// Registry of established sessions keyed by the server-minted session id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<u64, BeaconSession>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `session` under `session_id`, returning a displaced entry.
    pub fn store(&self, session_id: u64, session: BeaconSession) -> Option<BeaconSession> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.insert(session_id, session)
    }

    /// Looks up the session for `session_id`.
    #[must_use]
    pub fn load(&self, session_id: u64) -> Option<BeaconSession> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(&session_id).cloned()
    }

    /// Removes and returns the session for `session_id`.
    pub fn remove(&self, session_id: u64) -> Option<BeaconSession> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        sessions.remove(&session_id)
    }

    /// Scans entries until `predicate` matches, returning the first hit.
    ///
    /// Iteration order is unspecified; each surviving entry is visited at
    /// most once.
    pub fn find<P>(&self, mut predicate: P) -> Option<(u64, BeaconSession)>
    where
        P: FnMut(&BeaconSession) -> bool,
    {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions
            .iter()
            .find(|(_, session)| predicate(session))
            .map(|(id, session)| (*id, session.clone()))
    }

    /// First session whose beacon id equals `beacon_id`.
    #[must_use]
    pub fn find_by_beacon(&self, beacon_id: &str) -> Option<(u64, BeaconSession)> {
        self.find(|session| session.beacon_id == beacon_id)
    }

    /// Number of established sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.len()
    }

    /// `true` when no session is established.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-connection context holding the session id minted at key exchange.
///
/// Set once on the happy path and read on close; a repeated key-exchange
/// request on the same connection replaces it (the handler garbage-collects
/// the orphaned registry entry).
#[derive(Debug, Default)]
pub struct ConnContext {
    session_id: Mutex<Option<u64>>,
}

impl ConnContext {
    /// Creates an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `session_id`, returning the previous value if any.
    pub fn set_session_id(&self, session_id: u64) -> Option<u64> {
        let mut slot = self.session_id.lock().unwrap_or_else(|e| e.into_inner());
        slot.replace(session_id)
    }

    /// Session id minted for this connection, if key exchange happened.
    #[must_use]
    pub fn session_id(&self) -> Option<u64> {
        *self.session_id.lock().unwrap_or_else(|e| e.into_inner())
    }
}
