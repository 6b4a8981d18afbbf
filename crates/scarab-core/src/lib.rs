//! # scarab-core
//!
//! Core library for the scarab teamserver: the beacon session plane's
//! building blocks, independent of any particular listener or store.
//!
//! ## Modules
//!
//! - [`codec`]: the fixed-header beacon wire frame and its TCP/UDP packing
//! - [`crypto`]: RSA key-exchange holder and the XChaCha20 session transform
//! - [`bus`]: in-process topic broker linking the operator plane to the
//!   beacon plane
//! - [`session`]: live beacon session records and the session registry
//! - [`messages`]: protobuf envelopes shared by both planes

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod bus;
pub mod codec;
pub mod crypto;
pub mod messages;
pub mod session;

pub use bus::{MessageBus, Subscription};
pub use codec::{Frame, Transport};
pub use crypto::RsaKeyPair;
pub use session::{BeaconSession, ConnContext, ConnHandle, SessionRegistry};
