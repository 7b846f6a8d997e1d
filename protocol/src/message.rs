//! Message envelope and the Connect payload
//!
//! Every frame on the wire is `<verb> <payload>`: a single-character verb, one
//! space, then a payload whose layout only matters for the verbs the relay
//! itself interprets. Everything else is forwarded untouched apart from the
//! sender stamp.

use crate::error::{ProtocolError, Result};
use crate::{DELIMITER, LEGACY_PROTOCOL_VERSION, SERVER_SENDER, SHOW_USERS_COMMAND};
use std::fmt;

/// Message verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// `C` - a client announcing itself, or the relay announcing a peer
    Connect,
    /// `D` - a client leaving its group
    Disconnect,
    /// `R` - the relay renamed a client to resolve a collision
    Rename,
    /// `V` - the relay accepted the client's protocol version
    Validate,
    /// Any other application verb, most commonly `M`
    Other(char),
}

impl Verb {
    /// Plain chat-style message, the verb the relay signs its own notices with
    pub const MESSAGE: Verb = Verb::Other('M');

    /// Maps a wire character to a verb; unknown characters become `Other`
    pub fn from_char(c: char) -> Self {
        match c {
            'C' => Verb::Connect,
            'D' => Verb::Disconnect,
            'R' => Verb::Rename,
            'V' => Verb::Validate,
            other => Verb::Other(other),
        }
    }

    /// The character written on the wire
    pub fn as_char(self) -> char {
        match self {
            Verb::Connect => 'C',
            Verb::Disconnect => 'D',
            Verb::Rename => 'R',
            Verb::Validate => 'V',
            Verb::Other(c) => c,
        }
    }

    /// Identity-management verbs are relayed without a sender stamp
    pub fn is_identity(self) -> bool {
        matches!(self, Verb::Connect | Verb::Disconnect | Verb::Rename)
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// A single relay message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub verb: Verb,
    pub payload: String,
}

impl Message {
    /// Builds a message from a verb and its raw payload
    pub fn new(verb: Verb, payload: impl Into<String>) -> Self {
        Self {
            verb,
            payload: payload.into(),
        }
    }

    /// Parses one unframed message
    ///
    /// The verb is the text before the first space and must be exactly one
    /// character. Everything after that space is the payload, kept verbatim.
    pub fn parse(frame: &str) -> Result<Self> {
        if frame.is_empty() {
            return Err(ProtocolError::EmptyFrame);
        }

        let (verb_token, payload) = frame.split_once(' ').unwrap_or((frame, ""));

        let mut chars = verb_token.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(Self::new(Verb::from_char(c), payload)),
            _ => Err(ProtocolError::InvalidVerb(verb_token.to_string())),
        }
    }

    /// Wire text without the trailing delimiter
    pub fn encode(&self) -> String {
        if self.payload.is_empty() {
            self.verb.to_string()
        } else {
            format!("{} {}", self.verb, self.payload)
        }
    }

    /// Wire text including the trailing delimiter
    pub fn encode_frame(&self) -> String {
        let mut frame = self.encode();
        frame.push_str(DELIMITER);
        frame
    }

    /// `C <name> <dbHost> <dbName>`, used to introduce a session to its group
    pub fn connect_notice(name: &str, db_host: &str, db_name: &str) -> Self {
        Self::new(Verb::Connect, format!("{} {} {}", name, db_host, db_name))
    }

    /// `D <name>`, sent by a client leaving and relayed to its group with
    /// the canonical name
    pub fn disconnect(name: &str) -> Self {
        Self::new(Verb::Disconnect, name)
    }

    /// `R <name>`, telling a client the name it was actually admitted under
    pub fn rename(name: &str) -> Self {
        Self::new(Verb::Rename, name)
    }

    /// `V Server: ServerValidated`, the reply to a Connect whose protocol
    /// version matches the relay's
    pub fn validated() -> Self {
        Self::new(Verb::Validate, format!("{}: ServerValidated", SERVER_SENDER))
    }

    /// A line of text signed by the relay itself
    pub fn notice(text: impl AsRef<str>) -> Self {
        Self::new(
            Verb::MESSAGE,
            format!("{}: {}", SERVER_SENDER, text.as_ref()),
        )
    }

    /// Prefixes the payload with the sender's name, except for identity verbs
    pub fn stamped(&self, sender: &str) -> Self {
        if self.verb.is_identity() {
            self.clone()
        } else {
            Self::new(self.verb, format!("{}: {}", sender, self.payload))
        }
    }

    /// Whether this is exactly `M SHOW USERS`
    pub fn is_show_users(&self) -> bool {
        self.verb == Verb::MESSAGE && self.payload == SHOW_USERS_COMMAND
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Parsed payload of a `C` message: `<username> <dbHost> <dbName>[ <version>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub username: String,
    /// Lowercased
    pub db_host: String,
    /// Lowercased
    pub db_name: String,
    pub version: u32,
}

impl ConnectRequest {
    /// Builds a request, lowercasing the database host and name so that
    /// grouping is case-insensitive
    pub fn new(username: &str, db_host: &str, db_name: &str, version: u32) -> Self {
        Self {
            username: username.to_string(),
            db_host: db_host.to_lowercase(),
            db_name: db_name.to_lowercase(),
            version,
        }
    }

    /// Parses the payload of a `C` message
    ///
    /// Fields are separated by whitespace. The first three are required; a
    /// missing fourth means the client predates version negotiation and is
    /// treated as [`LEGACY_PROTOCOL_VERSION`]. More than four fields, or a
    /// version that is not a number, is an error.
    pub fn parse(payload: &str) -> Result<Self> {
        let fields: Vec<&str> = payload.split_whitespace().collect();
        if fields.len() > 4 {
            return Err(ProtocolError::TooManyFields(fields.len()));
        }

        let field = |index: usize, name: &'static str| {
            fields
                .get(index)
                .copied()
                .ok_or(ProtocolError::MissingField(name))
        };

        let username = field(0, "username")?;
        let db_host = field(1, "dbHost")?;
        let db_name = field(2, "dbName")?;
        let version = match fields.get(3) {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| ProtocolError::InvalidVersion(raw.to_string()))?,
            None => LEGACY_PROTOCOL_VERSION,
        };

        Ok(Self::new(username, db_host, db_name, version))
    }

    /// The `C` message a client sends to join, always carrying its version
    pub fn to_message(&self) -> Message {
        Message::new(
            Verb::Connect,
            format!(
                "{} {} {} {}",
                self.username, self.db_host, self.db_name, self.version
            ),
        )
    }
}
