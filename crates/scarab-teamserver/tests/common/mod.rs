//! Shared harness for session-plane integration tests.
//!
//! [`TestStack`] wires a full in-process teamserver (in-memory store, bus,
//! handler, listener manager) and starts one beacon listener on an
//! ephemeral port. [`TcpBeacon`] and [`UdpBeacon`] act as real beacons:
//! they learn the server's RSA key from the key-exchange response, pick
//! their own session key, and speak the framed wire protocol over real
//! sockets.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use prost::Message;
use rsa::Pkcs1v15Encrypt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use scarab_core::bus::MessageBus;
use scarab_core::codec::{self, Frame, Transport};
use scarab_core::crypto::{xchacha20, RsaKeyPair, SESSION_KEY_LEN};
use scarab_core::messages::{AuthRsaKey, MsgId, TaskData};
use scarab_core::session::SessionRegistry;
use scarab_teamserver::handler::BeaconHandler;
use scarab_teamserver::listener::ListenerManager;
use scarab_teamserver::store::{SqliteStore, Store};
use scarab_teamserver::BusEvent;

/// A fully wired teamserver with one running beacon listener.
pub struct TestStack {
    pub keys: Arc<RsaKeyPair>,
    pub store: Arc<SqliteStore>,
    pub bus: MessageBus<BusEvent>,
    pub handler: Arc<BeaconHandler>,
    pub listeners: Arc<ListenerManager>,
    /// Address of the started beacon listener.
    pub beacon_addr: SocketAddr,
}

impl TestStack {
    pub async fn start() -> Self {
        let keys = Arc::new(RsaKeyPair::generate(1024).unwrap());
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let bus: MessageBus<BusEvent> = MessageBus::new();
        let handler = Arc::new(BeaconHandler::new(
            Arc::clone(&keys),
            Arc::new(SessionRegistry::new()),
            store.clone() as Arc<dyn Store>,
            bus.clone(),
        ));
        let listeners = Arc::new(ListenerManager::new());
        listeners
            .start("test", "127.0.0.1:0", Arc::clone(&handler))
            .await
            .unwrap();
        let beacon_addr = listeners.list()[0].addr.parse().unwrap();

        Self {
            keys,
            store,
            bus,
            handler,
            listeners,
            beacon_addr,
        }
    }
}

fn biguint_from_hex(hex: &str) -> rsa::BigUint {
    rsa::BigUint::parse_bytes(hex.trim_start_matches("0x").as_bytes(), 16).unwrap()
}

/// Picks a session key and encrypts it against the advertised public key,
/// exactly as a beacon would after key exchange.
fn wrap_session_key(rsa_key: &AuthRsaKey, session_key: &[u8]) -> Vec<u8> {
    let public = rsa::RsaPublicKey::new(
        biguint_from_hex(&rsa_key.pn),
        biguint_from_hex(&rsa_key.pe),
    )
    .unwrap();
    public
        .encrypt(&mut rand::thread_rng(), Pkcs1v15Encrypt, session_key)
        .unwrap()
}

fn fresh_session_key() -> Vec<u8> {
    (0..SESSION_KEY_LEN).map(|_| rand::random()).collect()
}

/// A beacon speaking the stream transport.
pub struct TcpBeacon {
    stream: TcpStream,
    pub beacon_id: String,
    pub session_id: u64,
    pub session_key: Vec<u8>,
}

impl TcpBeacon {
    /// Runs the full key exchange against `addr`.
    pub async fn establish(addr: SocketAddr, beacon_id: &str) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let pubkey_req = TaskData {
            msg_id: MsgId::PubkeyReq as i32,
            beacon_id: beacon_id.to_string(),
            ..TaskData::default()
        };
        let frame = Frame::new(false, 0, pubkey_req.encode_to_vec().into());
        let reply = transact(&mut stream, &codec::pack(&frame, Transport::Tcp).unwrap()).await;
        let reply = codec::unpack(&reply, Transport::Tcp).unwrap();
        assert!(!reply.encrypted);
        let session_id = reply.session_id;

        let inner = TaskData::decode(reply.data.as_ref()).unwrap();
        assert_eq!(inner.msg_id, MsgId::PubkeyRsp as i32);
        let rsa_key = AuthRsaKey::decode(inner.byte_value.as_slice()).unwrap();

        let session_key = fresh_session_key();
        let auth_req = TaskData {
            msg_id: MsgId::AuthReq as i32,
            beacon_id: beacon_id.to_string(),
            task_id: 0,
            byte_value: wrap_session_key(&rsa_key, &session_key),
        };
        let frame = Frame::new(false, session_id, auth_req.encode_to_vec().into());
        let reply = transact(&mut stream, &codec::pack(&frame, Transport::Tcp).unwrap()).await;
        let reply = codec::unpack(&reply, Transport::Tcp).unwrap();
        let inner = TaskData::decode(reply.data.as_ref()).unwrap();
        assert_eq!(inner.msg_id, MsgId::AuthRsp as i32);

        Self {
            stream,
            beacon_id: beacon_id.to_string(),
            session_id,
            session_key,
        }
    }

    /// Sends an encrypted task envelope and returns the decrypted reply.
    pub async fn exchange(&mut self, task: &TaskData) -> TaskData {
        let ciphertext = xchacha20(&self.session_key, &task.encode_to_vec()).unwrap();
        let frame = Frame::new(true, self.session_id, ciphertext.into());
        let wire = codec::pack(&frame, Transport::Tcp).unwrap();
        let reply = transact(&mut self.stream, &wire).await;
        self.decode_encrypted(&reply)
    }

    /// Sends one heartbeat with `detail` as the host-info payload.
    pub async fn heartbeat(&mut self, detail: &[u8]) -> TaskData {
        let heartbeat = TaskData {
            msg_id: MsgId::HeartbeatReq as i32,
            beacon_id: self.beacon_id.clone(),
            task_id: 0,
            byte_value: detail.to_vec(),
        };
        self.exchange(&heartbeat).await
    }

    /// Waits for a frame pushed by the server outside any request.
    pub async fn recv_pushed(&mut self) -> TaskData {
        let reply = read_one(&mut self.stream).await;
        self.decode_encrypted(&reply)
    }

    fn decode_encrypted(&self, wire: &[u8]) -> TaskData {
        let frame = codec::unpack(wire, Transport::Tcp).unwrap();
        assert!(frame.encrypted);
        assert_eq!(frame.session_id, self.session_id);
        let plain = xchacha20(&self.session_key, &frame.data).unwrap();
        TaskData::decode(plain.as_slice()).unwrap()
    }
}

/// A beacon speaking the datagram transport.
pub struct UdpBeacon {
    socket: UdpSocket,
    server: SocketAddr,
    pub beacon_id: String,
    pub session_id: u64,
    pub session_key: Vec<u8>,
}

impl UdpBeacon {
    pub async fn establish(server: SocketAddr, beacon_id: &str) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let pubkey_req = TaskData {
            msg_id: MsgId::PubkeyReq as i32,
            beacon_id: beacon_id.to_string(),
            ..TaskData::default()
        };
        let frame = Frame::new(false, 0, pubkey_req.encode_to_vec().into());
        let reply = datagram_transact(
            &socket,
            server,
            &codec::pack(&frame, Transport::Udp).unwrap(),
        )
        .await;
        let reply = codec::unpack(&reply, Transport::Udp).unwrap();
        let session_id = reply.session_id;
        let inner = TaskData::decode(reply.data.as_ref()).unwrap();
        let rsa_key = AuthRsaKey::decode(inner.byte_value.as_slice()).unwrap();

        let session_key = fresh_session_key();
        let auth_req = TaskData {
            msg_id: MsgId::AuthReq as i32,
            beacon_id: beacon_id.to_string(),
            task_id: 0,
            byte_value: wrap_session_key(&rsa_key, &session_key),
        };
        let frame = Frame::new(false, session_id, auth_req.encode_to_vec().into());
        let reply = datagram_transact(
            &socket,
            server,
            &codec::pack(&frame, Transport::Udp).unwrap(),
        )
        .await;
        let reply = codec::unpack(&reply, Transport::Udp).unwrap();
        let inner = TaskData::decode(reply.data.as_ref()).unwrap();
        assert_eq!(inner.msg_id, MsgId::AuthRsp as i32);

        Self {
            socket,
            server,
            beacon_id: beacon_id.to_string(),
            session_id,
            session_key,
        }
    }

    pub async fn heartbeat(&mut self, detail: &[u8]) -> TaskData {
        let heartbeat = TaskData {
            msg_id: MsgId::HeartbeatReq as i32,
            beacon_id: self.beacon_id.clone(),
            task_id: 0,
            byte_value: detail.to_vec(),
        };
        let ciphertext = xchacha20(&self.session_key, &heartbeat.encode_to_vec()).unwrap();
        let frame = Frame::new(true, self.session_id, ciphertext.into());
        let wire = codec::pack(&frame, Transport::Udp).unwrap();
        let reply = datagram_transact(&self.socket, self.server, &wire).await;
        let frame = codec::unpack(&reply, Transport::Udp).unwrap();
        assert!(frame.encrypted);
        let plain = xchacha20(&self.session_key, &frame.data).unwrap();
        TaskData::decode(plain.as_slice()).unwrap()
    }

    /// Waits for a frame pushed by the server outside any request.
    pub async fn recv_pushed(&mut self) -> TaskData {
        let mut buf = vec![0u8; 65_535];
        let (len, _) = self.socket.recv_from(&mut buf).await.unwrap();
        let frame = codec::unpack(&buf[..len], Transport::Udp).unwrap();
        assert!(frame.encrypted);
        let plain = xchacha20(&self.session_key, &frame.data).unwrap();
        TaskData::decode(plain.as_slice()).unwrap()
    }
}

async fn transact(stream: &mut TcpStream, wire: &[u8]) -> Bytes {
    stream.write_all(wire).await.unwrap();
    read_one(stream).await
}

async fn read_one(stream: &mut TcpStream) -> Bytes {
    let mut buf = vec![0u8; 65_536];
    let n = stream.read(&mut buf).await.unwrap();
    assert!(n > 0, "connection closed by server");
    Bytes::copy_from_slice(&buf[..n])
}

async fn datagram_transact(socket: &UdpSocket, server: SocketAddr, wire: &[u8]) -> Bytes {
    socket.send_to(wire, server).await.unwrap();
    let mut buf = vec![0u8; 65_535];
    let (len, _) = socket.recv_from(&mut buf).await.unwrap();
    Bytes::copy_from_slice(&buf[..len])
}
