//! Protobuf envelopes shared by the beacon and operator planes.
//!
//! Messages are hand-written prost structs with explicit field tags; both
//! ends of each plane link against this module, so the numeric `MsgId` /
//! `CmdId` values are the protocol contract and must never be reordered.
//!
//! [`TaskData`] is the inner payload of every beacon frame: requests and
//! responses both travel as `{msg_id, beacon_id, task_id, byte_value}` and
//! the receiver branches on `msg_id`.

use std::collections::HashMap;

use prost::Message;

/// Message ids carried in [`TaskData::msg_id`] on the beacon plane.
///
/// Any id not listed here that arrives on an encrypted frame is treated as
/// a generic command response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum MsgId {
    /// Placeholder; never sent.
    Unknown = 0,
    /// Beacon asks for the server's RSA public key.
    PubkeyReq = 1,
    /// Server answers with [`AuthRsaKey`].
    PubkeyRsp = 2,
    /// Beacon delivers the RSA-encrypted session key.
    AuthReq = 3,
    /// Server acknowledges session establishment.
    AuthRsp = 4,
    /// Beacon heartbeat; pulls the next pending task.
    HeartbeatReq = 5,
    /// Host information response from the beacon.
    HostInfoRsp = 6,
    /// File download response payload.
    DownloadFile = 7,
}

/// Command ids on the operator control plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum CmdId {
    /// Placeholder; never sent.
    Unknown = 0,
    /// Enumerate known beacons.
    GetBeacons = 1,
    /// Start a named beacon listener.
    StartBeaconServer = 2,
    /// Stop a named beacon listener.
    StopBeaconServer = 3,
    /// Enumerate running beacon listeners.
    GetBeaconServers = 4,
    /// Soft-delete a beacon record.
    DeleteBeacon = 5,
    /// Replay completed download-file tasks onto the response stream.
    SyncDownloadFiles = 6,
    /// Error envelope; response-only.
    ErrorMsg = 7,
}

/// Inner payload of every beacon frame.
#[derive(Clone, PartialEq, Message)]
pub struct TaskData {
    /// Command code; see [`MsgId`].
    #[prost(int32, tag = "1")]
    pub msg_id: i32,
    /// Beacon identifier, chosen by the beacon from its MAC and transport.
    #[prost(string, tag = "2")]
    pub beacon_id: String,
    /// Task this payload belongs to; 0 outside the tasking flow.
    #[prost(uint64, tag = "3")]
    pub task_id: u64,
    /// Request or response bytes, meaning depends on `msg_id`.
    #[prost(bytes = "vec", tag = "4")]
    pub byte_value: Vec<u8>,
}

/// RSA public key export sent inside the key-exchange response.
#[derive(Clone, PartialEq, Message)]
pub struct AuthRsaKey {
    /// Public exponent as a `0x`-prefixed lowercase hex string.
    #[prost(string, tag = "1")]
    pub pe: String,
    /// Public modulus as a `0x`-prefixed lowercase hex string.
    #[prost(string, tag = "2")]
    pub pn: String,
}

/// Operator command request published on the command topic.
#[derive(Clone, PartialEq, Message)]
pub struct CommandReq {
    /// Operator session token.
    #[prost(string, tag = "1")]
    pub token: String,
    /// Command code for the beacon; see [`MsgId`].
    #[prost(int32, tag = "2")]
    pub msg_id: i32,
    /// Target beacon.
    #[prost(string, tag = "3")]
    pub beacon_id: String,
    /// Command argument bytes.
    #[prost(bytes = "vec", tag = "4")]
    pub byte_value: Vec<u8>,
}

/// Beacon response published on the response topic.
#[derive(Clone, PartialEq, Message)]
pub struct CommandRsp {
    /// Task the response completes.
    #[prost(uint64, tag = "1")]
    pub task_id: u64,
    /// Responding beacon.
    #[prost(string, tag = "2")]
    pub beacon_id: String,
    /// Command code the response answers.
    #[prost(int32, tag = "3")]
    pub msg_id: i32,
    /// Response bytes.
    #[prost(bytes = "vec", tag = "4")]
    pub byte_value: Vec<u8>,
}

/// One named listener endpoint.
#[derive(Clone, PartialEq, Message)]
pub struct ServerItem {
    /// Listener name, unique among running listeners.
    #[prost(string, tag = "1")]
    pub name: String,
    /// Bound address, `host:port`.
    #[prost(string, tag = "2")]
    pub addr: String,
}

/// Running-listener enumeration.
#[derive(Clone, PartialEq, Message)]
pub struct ServerInfo {
    /// The running listeners.
    #[prost(message, repeated, tag = "1")]
    pub server: Vec<ServerItem>,
}

/// One beacon row as presented to operators.
#[derive(Clone, PartialEq, Message)]
pub struct BeaconInfo {
    /// Beacon identifier.
    #[prost(string, tag = "1")]
    pub beacon_id: String,
    /// Last observed remote address.
    #[prost(string, tag = "2")]
    pub ip_addr: String,
    /// Rendered host detail, `key:value, ` concatenated.
    #[prost(string, tag = "3")]
    pub detail_info: String,
    /// Creation time, `YYYY-MM-DD HH:MM:SS`.
    #[prost(string, tag = "4")]
    pub create_tm: String,
    /// Last update time, `YYYY-MM-DD HH:MM:SS`.
    #[prost(string, tag = "5")]
    pub update_tm: String,
}

/// Beacon enumeration response.
#[derive(Clone, PartialEq, Message)]
pub struct BeaconsRsp {
    /// Live beacon rows.
    #[prost(message, repeated, tag = "1")]
    pub beacon: Vec<BeaconInfo>,
}

/// String map payload, used for beacon host details.
#[derive(Clone, PartialEq, Message)]
pub struct MapValueData {
    /// The key/value entries.
    #[prost(map = "string, string", tag = "1")]
    pub dict_value: HashMap<String, String>,
}

/// Soft-delete request for one beacon.
#[derive(Clone, PartialEq, Message)]
pub struct DeleteBeacon {
    /// Beacon to delete.
    #[prost(string, tag = "1")]
    pub beacon_id: String,
}

/// Operator login request.
#[derive(Clone, PartialEq, Message)]
pub struct LoginUserReq {
    /// Operator username; informational.
    #[prost(string, tag = "1")]
    pub username: String,
    /// Hash of the shared operator secret.
    #[prost(string, tag = "2")]
    pub passwd_hash: String,
}

/// Operator login response.
#[derive(Clone, PartialEq, Message)]
pub struct LoginUserRsp {
    /// Session token; empty on failure.
    #[prost(string, tag = "1")]
    pub token: String,
    /// Failure reason; empty on success.
    #[prost(string, tag = "2")]
    pub error: String,
}

/// Operator management command.
#[derive(Clone, PartialEq, Message)]
pub struct ServerCmdReq {
    /// Operator session token.
    #[prost(string, tag = "1")]
    pub token: String,
    /// Command code; see [`CmdId`].
    #[prost(int32, tag = "2")]
    pub cmd_id: i32,
    /// Command-specific payload.
    #[prost(bytes = "vec", tag = "3")]
    pub byte_value: Vec<u8>,
}

/// Operator management response.
#[derive(Clone, PartialEq, Message)]
pub struct ServerCmdRsp {
    /// Command code of the payload; [`CmdId::ErrorMsg`] carries [`ErrorMsg`].
    #[prost(int32, tag = "1")]
    pub cmd_id: i32,
    /// Response payload.
    #[prost(bytes = "vec", tag = "2")]
    pub byte_value: Vec<u8>,
}

/// Error envelope on the operator plane.
#[derive(Clone, PartialEq, Message)]
pub struct ErrorMsg {
    /// Command the error belongs to.
    #[prost(int32, tag = "1")]
    pub cmd_id: i32,
    /// Human-readable failure reason.
    #[prost(string, tag = "2")]
    pub error: String,
}
