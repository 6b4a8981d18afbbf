//! scarab-teamserver - beacon session plane daemon library.
//!
//! The daemon couples four moving parts around the shared message bus:
//!
//! - [`listener`]: named dual TCP/UDP endpoints accepting beacon frames
//! - [`handler`]: the handshake and encrypted-dispatch state machine, plus
//!   the push-task worker
//! - [`store`]: persistent beacon and task records with the
//!   CREATED → DISPATCHED → DONE lifecycle
//! - [`operator`]: the framed control-plane socket operators connect to

pub mod config;
pub mod handler;
pub mod listener;
pub mod operator;
pub mod store;

use scarab_core::messages::{CommandReq, CommandRsp};

/// Payload carried on the in-process bus.
///
/// The bus is typed opaquely; consumers match on the variant they expect
/// and ignore the rest.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Operator command request, published on the command topic.
    CommandReq(CommandReq),
    /// Beacon response, published on the response topic.
    CommandRsp(CommandRsp),
}
