//! Operator control plane.
//!
//! Operators connect over TCP and exchange length-prefixed binary frames:
//!
//! ```text
//! +----------------------------+-----------+------------------+
//! | Length (4 bytes, BE)       | Tag (1)   | Protobuf payload |
//! +----------------------------+-----------+------------------+
//! ```
//!
//! The tag routes the payload before decoding (see
//! [`ControlMessageType`]). A connection must log in with the shared
//! operator secret before commands are accepted; command requests are
//! persisted as tasks and published on the command topic, and every
//! beacon response on the response topic is forwarded to the connection
//! (marking the task DONE on the way through).

use std::collections::HashMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use prost::Message;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, info, warn};

use scarab_core::bus::{MessageBus, TOPIC_BEACON_RSP, TOPIC_COMMAND_REQ};
use scarab_core::messages::{
    CmdId, CommandReq, CommandRsp, DeleteBeacon, ErrorMsg, LoginUserReq, LoginUserRsp, MsgId,
    ServerCmdReq, ServerCmdRsp, ServerInfo, ServerItem,
};

use crate::handler::BeaconHandler;
use crate::listener::ListenerManager;
use crate::store::Store;
use crate::BusEvent;

/// Maximum control frame size (16 MiB).
pub const MAX_CONTROL_FRAME: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Errors on the operator plane. Any of them ends the connection.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Socket-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame exceeded [`MAX_CONTROL_FRAME`].
    #[error("control frame length {size} exceeds limit {max}")]
    FrameTooLarge {
        /// Declared frame length.
        size: usize,
        /// The enforced limit.
        max: usize,
    },

    /// A frame with no tag byte.
    #[error("empty control frame")]
    EmptyFrame,

    /// The tag byte does not name a message type.
    #[error("unknown control message tag {tag}")]
    UnknownTag {
        /// The unrecognized byte.
        tag: u8,
    },

    /// A message type that clients must not send.
    #[error("unexpected control message tag {tag}")]
    UnexpectedMessage {
        /// The misused tag.
        tag: u8,
    },

    /// Payload failed to decode for its tag.
    #[error("malformed control payload: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The request's token matches no logged-in operator.
    #[error("invalid operator token")]
    InvalidToken,

    /// Server shutdown interrupted the connection.
    #[error("cancelled by shutdown")]
    Cancelled,
}

/// Length-prefixed frame codec for the control plane.
#[derive(Debug, Clone, Default)]
pub struct ControlFrameCodec;

impl Decoder for ControlFrameCodec {
    type Item = Bytes;
    type Error = ControlError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ControlError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        // Validate before reserving or allocating.
        if length > MAX_CONTROL_FRAME {
            return Err(ControlError::FrameTooLarge {
                size: length,
                max: MAX_CONTROL_FRAME,
            });
        }

        let total = HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for ControlFrameCodec {
    type Error = ControlError;

    #[allow(clippy::cast_possible_truncation)] // length validated first
    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), ControlError> {
        if item.len() > MAX_CONTROL_FRAME {
            return Err(ControlError::FrameTooLarge {
                size: item.len(),
                max: MAX_CONTROL_FRAME,
            });
        }
        dst.reserve(HEADER_LEN + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Message type tags for control-plane routing.
///
/// The tag identifies the payload before decoding, so the dispatcher can
/// route to the right handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlMessageType {
    /// Operator login ([`LoginUserReq`] / [`LoginUserRsp`]).
    Login = 1,
    /// Command toward a beacon ([`CommandReq`]).
    Command = 2,
    /// Server management ([`ServerCmdReq`] / [`ServerCmdRsp`]).
    ServerCmd = 3,
    /// Beacon response pushed to operators ([`CommandRsp`]); server-sent.
    CommandRsp = 4,
}

impl ControlMessageType {
    /// Attempts to parse a message type from a tag byte.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Login),
            2 => Some(Self::Command),
            3 => Some(Self::ServerCmd),
            4 => Some(Self::CommandRsp),
            _ => None,
        }
    }

    /// Returns the tag byte for this message type.
    #[must_use]
    pub const fn tag(self) -> u8 {
        self as u8
    }
}

/// Encodes a control message as `[tag][protobuf]`.
#[must_use]
pub fn encode_control<M: Message>(tag: ControlMessageType, msg: &M) -> Bytes {
    let mut buf = vec![tag.tag()];
    msg.encode(&mut buf).expect("encode cannot fail");
    Bytes::from(buf)
}

/// One logged-in operator.
#[derive(Debug, Clone)]
pub struct TeamClient {
    /// Operator-supplied username.
    pub username: String,
    /// Remote address of the login connection.
    pub addr: SocketAddr,
}

/// The control-plane server.
pub struct OperatorServer {
    secret: String,
    bus: MessageBus<BusEvent>,
    store: Arc<dyn Store>,
    listeners: Arc<ListenerManager>,
    beacon_handler: Arc<BeaconHandler>,
    clients: RwLock<HashMap<String, TeamClient>>,
}

impl OperatorServer {
    /// Wires the server to its collaborators.
    pub fn new(
        secret: String,
        bus: MessageBus<BusEvent>,
        store: Arc<dyn Store>,
        listeners: Arc<ListenerManager>,
        beacon_handler: Arc<BeaconHandler>,
    ) -> Self {
        Self {
            secret,
            bus,
            store,
            listeners,
            beacon_handler,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Accept loop; runs until `shutdown` fires.
    pub async fn run(self: Arc<Self>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "operator connected");
                        let server = Arc::clone(&self);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            server.handle_client(stream, peer, shutdown).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "operator accept failed"),
                },
            }
        }
        info!("operator plane stopped");
    }

    async fn handle_client(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut framed = Framed::new(stream, ControlFrameCodec);
        let mut responses = self.bus.subscribe(TOPIC_BEACON_RSP);
        let mut authed = false;

        let result: Result<(), ControlError> = loop {
            tokio::select! {
                _ = shutdown.changed() => break Err(ControlError::Cancelled),

                frame = framed.next() => match frame {
                    None => break Ok(()),
                    Some(Err(e)) => break Err(e),
                    Some(Ok(frame)) => {
                        match self.dispatch(&frame, peer, &mut authed).await {
                            Ok(Some(reply)) => {
                                if let Err(e) = framed.send(reply).await {
                                    break Err(e);
                                }
                            }
                            Ok(None) => {}
                            Err(e) => break Err(e),
                        }
                    }
                },

                event = responses.pull() => match event {
                    Some(BusEvent::CommandRsp(rsp)) => {
                        if !authed {
                            continue;
                        }
                        if let Err(e) = self.store.update_task(rsp.task_id, &rsp.byte_value) {
                            warn!(task_id = rsp.task_id, error = %e, "task completion failed");
                        }
                        let frame = encode_control(ControlMessageType::CommandRsp, &rsp);
                        if let Err(e) = framed.send(frame).await {
                            break Err(e);
                        }
                    }
                    Some(BusEvent::CommandReq(_)) => {}
                    None => break Ok(()),
                },
            }
        };

        self.bus.unsubscribe(&responses);
        match result {
            Ok(()) => info!(%peer, "operator disconnected"),
            Err(ControlError::Cancelled) => debug!(%peer, "operator connection cancelled"),
            Err(e) => warn!(%peer, error = %e, "operator connection failed"),
        }
    }

    /// Routes one inbound control frame.
    async fn dispatch(
        &self,
        frame: &[u8],
        peer: SocketAddr,
        authed: &mut bool,
    ) -> Result<Option<Bytes>, ControlError> {
        let (&tag, payload) = frame.split_first().ok_or(ControlError::EmptyFrame)?;
        let message_type =
            ControlMessageType::from_tag(tag).ok_or(ControlError::UnknownTag { tag })?;

        match message_type {
            ControlMessageType::Login => {
                let req = LoginUserReq::decode(payload)?;
                Ok(Some(self.login(&req, peer, authed)))
            }
            ControlMessageType::Command => {
                let req = CommandReq::decode(payload)?;
                self.command(req)?;
                Ok(None)
            }
            ControlMessageType::ServerCmd => {
                let req = ServerCmdReq::decode(payload)?;
                let rsp = self.server_cmd(req).await?;
                Ok(Some(encode_control(ControlMessageType::ServerCmd, &rsp)))
            }
            ControlMessageType::CommandRsp => {
                Err(ControlError::UnexpectedMessage { tag })
            }
        }
    }

    fn login(&self, req: &LoginUserReq, peer: SocketAddr, authed: &mut bool) -> Bytes {
        let failure = |error: &str| {
            encode_control(
                ControlMessageType::Login,
                &LoginUserRsp {
                    token: String::new(),
                    error: error.to_string(),
                },
            )
        };

        if req.username.is_empty() || req.passwd_hash.is_empty() {
            return failure("invalid username or password");
        }
        if req.passwd_hash != self.secret {
            warn!(%peer, username = %req.username, "operator login rejected");
            return failure("error password");
        }

        let token = uuid::Uuid::new_v4().to_string();
        {
            let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
            clients.insert(
                token.clone(),
                TeamClient {
                    username: req.username.clone(),
                    addr: peer,
                },
            );
        }
        *authed = true;
        info!(%peer, username = %req.username, "operator logged in");

        encode_control(
            ControlMessageType::Login,
            &LoginUserRsp {
                token,
                error: String::new(),
            },
        )
    }

    /// Persists the command as a task, then hands it to the push worker.
    fn command(&self, req: CommandReq) -> Result<(), ControlError> {
        self.check_token(&req.token)?;

        // Store before publish: the push worker pulls from the store, so
        // the row must exist by the time the request reaches the bus.
        if let Err(e) = self
            .store
            .add_task(req.msg_id, &req.beacon_id, &req.byte_value)
        {
            warn!(beacon_id = %req.beacon_id, error = %e, "task insert failed");
            return Ok(());
        }

        debug!(beacon_id = %req.beacon_id, msg_id = req.msg_id, "command accepted");
        self.bus.publish(TOPIC_COMMAND_REQ, BusEvent::CommandReq(req));
        Ok(())
    }

    async fn server_cmd(&self, req: ServerCmdReq) -> Result<ServerCmdRsp, ControlError> {
        self.check_token(&req.token)?;

        let rsp = match CmdId::try_from(req.cmd_id) {
            Ok(CmdId::GetBeacons) => match self.store.list_beacons() {
                Ok(beacons) => ServerCmdRsp {
                    cmd_id: CmdId::GetBeacons as i32,
                    byte_value: beacons.encode_to_vec(),
                },
                Err(e) => error_rsp(req.cmd_id, &e),
            },

            Ok(CmdId::StartBeaconServer) => match ServerItem::decode(req.byte_value.as_slice()) {
                Ok(item) => match self
                    .listeners
                    .start(&item.name, &item.addr, Arc::clone(&self.beacon_handler))
                    .await
                {
                    Ok(()) => self.server_list_rsp(),
                    Err(e) => error_rsp(req.cmd_id, &e),
                },
                Err(e) => error_rsp(req.cmd_id, &e),
            },

            Ok(CmdId::StopBeaconServer) => match ServerItem::decode(req.byte_value.as_slice()) {
                Ok(item) => match self.listeners.stop(&item.name).await {
                    Ok(()) => self.server_list_rsp(),
                    Err(e) => error_rsp(req.cmd_id, &e),
                },
                Err(e) => error_rsp(req.cmd_id, &e),
            },

            Ok(CmdId::GetBeaconServers) => self.server_list_rsp(),

            Ok(CmdId::DeleteBeacon) => match DeleteBeacon::decode(req.byte_value.as_slice()) {
                Ok(target) => match self.store.delete_beacon(&target.beacon_id) {
                    Ok(()) => ServerCmdRsp {
                        cmd_id: CmdId::DeleteBeacon as i32,
                        byte_value: Vec::new(),
                    },
                    Err(e) => error_rsp(req.cmd_id, &e),
                },
                Err(e) => error_rsp(req.cmd_id, &e),
            },

            Ok(CmdId::SyncDownloadFiles) => match self.sync_download_files() {
                Ok(()) => ServerCmdRsp {
                    cmd_id: CmdId::SyncDownloadFiles as i32,
                    byte_value: Vec::new(),
                },
                Err(e) => error_rsp(req.cmd_id, &e),
            },

            Ok(CmdId::Unknown | CmdId::ErrorMsg) | Err(_) => {
                error_rsp(req.cmd_id, &"unknown command")
            }
        };
        Ok(rsp)
    }

    /// Replays completed download-file tasks onto the response topic.
    fn sync_download_files(&self) -> Result<(), crate::store::StoreError> {
        for record in self.store.get_task_responses(MsgId::DownloadFile as i32)? {
            self.bus.publish(
                TOPIC_BEACON_RSP,
                BusEvent::CommandRsp(CommandRsp {
                    task_id: record.task_id,
                    beacon_id: record.beacon_id,
                    msg_id: record.msg_id,
                    byte_value: record.rsp_param,
                }),
            );
        }
        Ok(())
    }

    fn server_list_rsp(&self) -> ServerCmdRsp {
        let info = ServerInfo {
            server: self.listeners.list(),
        };
        ServerCmdRsp {
            cmd_id: CmdId::GetBeaconServers as i32,
            byte_value: info.encode_to_vec(),
        }
    }

    fn check_token(&self, token: &str) -> Result<(), ControlError> {
        let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
        if clients.contains_key(token) {
            Ok(())
        } else {
            Err(ControlError::InvalidToken)
        }
    }
}

fn error_rsp(cmd_id: i32, error: &impl Display) -> ServerCmdRsp {
    let envelope = ErrorMsg {
        cmd_id,
        error: error.to_string(),
    };
    ServerCmdRsp {
        cmd_id: CmdId::ErrorMsg as i32,
        byte_value: envelope.encode_to_vec(),
    }
}
