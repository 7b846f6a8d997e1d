//! # Relay Protocol
//!
//! Wire format shared by the relay server and anything that talks to it.
//!
//! Messages are plain UTF-8 text of the form `<verb> <payload>`, each one
//! terminated by the five-character [`DELIMITER`]. The verb is a single
//! character; the payload is opaque except for the few verbs the relay
//! interprets itself:
//!
//! | Verb | Meaning                                                    |
//! |------|------------------------------------------------------------|
//! | `C`  | `C <username> <dbHost> <dbName>[ <version>]` - join a group |
//! | `D`  | `D <username>` - leave                                     |
//! | `R`  | `R <newUsername>` - the relay renamed you                  |
//! | `V`  | `V Server: ServerValidated` - versions match               |
//!
//! Any other verb is relayed to the sender's group with the sender's name
//! prefixed to the payload.
//!
//! ## Module Organization
//!
//! - `message` - [`Verb`], [`Message`] and the parsed [`ConnectRequest`]
//! - `codec` - [`FrameCodec`], a `tokio_util` codec that splits a byte stream
//!   into frames and writes messages back out
//! - `error` - [`ProtocolError`]

pub mod codec;
pub mod error;
pub mod message;

pub use codec::FrameCodec;
pub use error::ProtocolError;
pub use message::{ConnectRequest, Message, Verb};

/// Terminates every message on the wire
pub const DELIMITER: &str = " ||| ";

/// Protocol version spoken by this relay
pub const PROTOCOL_VERSION: u32 = 2;

/// Version assumed when a Connect message carries none
pub const LEGACY_PROTOCOL_VERSION: u32 = 1;

pub const DEFAULT_PORT: u16 = 17595;

/// Upper bound on a single frame before the stream is considered corrupt
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Name the relay signs its own notices with
pub const SERVER_SENDER: &str = "Server";

/// Reserved payload that lists every connected session
pub const SHOW_USERS_COMMAND: &str = "SHOW USERS";
