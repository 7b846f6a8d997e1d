//! Live session table shared by every connection
//!
//! The registry is the single source of truth for who is connected and which
//! database group they belong to. One mutex guards the whole table, so group
//! membership seen by a broadcast is always a membership that existed at one
//! instant, and no insert or removal can interleave with it.
//!
//! Delivering a message never touches a socket here: each session owns a
//! bounded outbound queue drained by its own connection task, and the
//! registry only enqueues. A peer whose queue is full has fallen too far
//! behind to keep a consistent view of its group, so it is evicted: its
//! connection is cancelled and departs like any other dropped socket. Every
//! other peer is unaffected.

use crate::dedupe::resolve_display_name;
use crate::error::{RelayError, Result};
use log::{debug, info, warn};
use relay_protocol::{ConnectRequest, Message};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Identifies one accepted socket for as long as it is open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wraps a raw id handed out by the dispatcher
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw numeric id
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Server-side record of one connected client
#[derive(Debug)]
pub struct ClientSession {
    pub id: ConnectionId,
    /// Canonical name; may differ from the requested one after de-duplication
    pub display_name: String,
    pub db_host: String,
    pub db_name: String,
    pub protocol_version: u32,
    outbound: mpsc::Sender<Message>,
    /// Cancels the owning connection when its queue overflows
    evict: CancellationToken,
}

impl ClientSession {
    /// Builds the record for a client that has sent a valid Connect
    ///
    /// `outbound` is the connection's own queue and `evict` the token its
    /// worker watches. The display name starts as the requested username
    /// and is only finalised by [`ConnectionRegistry::admit`].
    pub fn new(
        id: ConnectionId,
        request: &ConnectRequest,
        outbound: mpsc::Sender<Message>,
        evict: CancellationToken,
    ) -> Self {
        Self {
            id,
            display_name: request.username.clone(),
            db_host: request.db_host.clone(),
            db_name: request.db_name.clone(),
            protocol_version: request.version,
            outbound,
            evict,
        }
    }

    /// Whether both sessions sit on the same database host and name
    pub fn shares_group(&self, other: &ClientSession) -> bool {
        self.db_host == other.db_host && self.db_name == other.db_name
    }

    /// Snapshot of the session without its queue
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            display_name: self.display_name.clone(),
            db_host: self.db_host.clone(),
            db_name: self.db_name.clone(),
            protocol_version: self.protocol_version,
        }
    }

    /// Enqueues without waiting; returns whether the message was accepted
    ///
    /// A full queue evicts the session rather than letting it miss part of
    /// its group's traffic.
    fn deliver(&self, message: Message) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(message)) => {
                if !self.evict.is_cancelled() {
                    warn!(
                        "Outbound queue for {} ({}) is full at '{}', evicting",
                        self.id, self.display_name, message
                    );
                    self.evict.cancel();
                }
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Outbound queue for {} is closed", self.id);
                false
            }
        }
    }
}

/// Read-only snapshot of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: ConnectionId,
    pub display_name: String,
    pub db_host: String,
    pub db_name: String,
    pub protocol_version: u32,
}

/// Outcome of admitting a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Final canonical name
    pub display_name: String,
    pub renamed: bool,
    /// Sessions already present in the newcomer's group
    pub peers: usize,
}

/// Table of every admitted session, keyed by connection id
///
/// Shared between all connection workers behind an `Arc`. Every operation
/// takes the one table lock, so compound operations such as [`admit`] and
/// [`depart`] are atomic with respect to each other and to broadcasts.
///
/// [`admit`]: ConnectionRegistry::admit
/// [`depart`]: ConnectionRegistry::depart
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<ConnectionId, ClientSession>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a session as-is, without de-duplication or announcements
    ///
    /// Fails with [`RelayError::DuplicateConnection`] if the id is already
    /// registered.
    pub async fn add(&self, session: ClientSession) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&session.id) {
            return Err(RelayError::DuplicateConnection(session.id));
        }
        sessions.insert(session.id, session);
        Ok(())
    }

    /// Removes a session silently; its group is not told
    ///
    /// Use [`depart`](ConnectionRegistry::depart) for a client that is leaving.
    pub async fn remove(&self, id: ConnectionId) -> Option<ClientSession> {
        self.sessions.lock().await.remove(&id)
    }

    /// Looks up one session by id
    pub async fn get(&self, id: ConnectionId) -> Option<SessionInfo> {
        self.sessions.lock().await.get(&id).map(ClientSession::info)
    }

    /// Snapshot of every live session, ordered by connection id
    pub async fn enumerate(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut snapshot: Vec<SessionInfo> = sessions.values().map(ClientSession::info).collect();
        snapshot.sort_by_key(|info| info.id);
        snapshot
    }

    /// Number of live sessions across every group
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Registers a newly authenticated session and introduces it to its group
    ///
    /// Under one lock hold this resolves the display name against every other
    /// session, queues `R <name>` to the newcomer if it was renamed, queues one
    /// `C` announcement per existing group member to the newcomer, and queues
    /// the newcomer's own `C` announcement to each of those members.
    pub async fn admit(&self, mut session: ClientSession) -> Result<Admission> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&session.id) {
            return Err(RelayError::DuplicateConnection(session.id));
        }

        let requested = std::mem::take(&mut session.display_name);
        let display_name = resolve_display_name(
            &requested,
            sessions.values().map(|other| other.display_name.as_str()),
        );
        let renamed = display_name != requested;
        session.display_name = display_name.clone();

        if renamed {
            info!(
                "{} renamed from '{}' to '{}' to avoid a collision",
                session.id, requested, display_name
            );
            session.deliver(Message::rename(&display_name));
        }

        let mut group: Vec<&ClientSession> = sessions
            .values()
            .filter(|peer| peer.shares_group(&session))
            .collect();
        group.sort_by_key(|peer| peer.id);

        let announcement =
            Message::connect_notice(&display_name, &session.db_host, &session.db_name);
        for peer in &group {
            session.deliver(Message::connect_notice(
                &peer.display_name,
                &peer.db_host,
                &peer.db_name,
            ));
            peer.deliver(announcement.clone());
        }

        let peers = group.len();
        info!(
            "{} joined as '{}' on {}/{} ({} peer(s), {} session(s) total)",
            session.id,
            display_name,
            session.db_host,
            session.db_name,
            peers,
            sessions.len() + 1
        );
        sessions.insert(session.id, session);

        Ok(Admission {
            display_name,
            renamed,
            peers,
        })
    }

    /// Queues `message` for every other session in the sender's group
    ///
    /// Returns the number of peers the message was queued for. An unknown
    /// sender reaches nobody.
    pub async fn broadcast(&self, from: ConnectionId, message: &Message) -> usize {
        let sessions = self.sessions.lock().await;
        let Some(sender) = sessions.get(&from) else {
            return 0;
        };

        sessions
            .values()
            .filter(|peer| peer.id != from && peer.shares_group(sender))
            .filter(|peer| peer.deliver(message.clone()))
            .count()
    }

    /// Removes a session and tells its group, using the canonical name
    ///
    /// Returns `None` if the session was already gone, in which case nothing
    /// is broadcast.
    pub async fn depart(&self, id: ConnectionId) -> Option<SessionInfo> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.remove(&id)?;

        let notice = Message::disconnect(&session.display_name);
        for peer in sessions.values().filter(|peer| peer.shares_group(&session)) {
            peer.deliver(notice.clone());
        }

        info!(
            "{} '{}' left {}/{} ({} session(s) remaining)",
            id,
            session.display_name,
            session.db_host,
            session.db_name,
            sessions.len()
        );
        Some(session.info())
    }
}
