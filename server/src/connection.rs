//! Per-connection worker
//!
//! Each accepted socket is driven through
//! `Connecting -> Authenticated -> Active -> Terminated`:
//!
//! - **Connecting**: waits for `C <username> <dbHost> <dbName>[ <version>]`,
//!   answers the version handshake and moves on regardless of the outcome.
//! - **Authenticated**: the session is admitted to the registry, which
//!   resolves name collisions and introduces it to its group.
//! - **Active**: `D` ends the session; `M SHOW USERS` from a privileged name
//!   lists every session; everything else is stamped with the sender's
//!   canonical name and relayed to the group.
//! - **Terminated**: the session is gone from the registry and its group has
//!   been told, exactly once.
//!
//! Reading and writing are split: the worker task owns the read half and a
//! companion writer task owns the write half, draining the connection's
//! outbound queue. Other connections only ever enqueue onto that queue.

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::registry::{ClientSession, ConnectionId, ConnectionRegistry};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use relay_protocol::{ConnectRequest, FrameCodec, Message, ProtocolError, Verb, PROTOCOL_VERSION};
use std::cmp::Ordering;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// How long the writer may keep flushing after the reader has finished
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifecycle of one connection; only ever moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Active,
    Terminated,
}

/// Why the read loop stopped receiving frames
#[derive(Debug)]
enum ReadEvent {
    Frame(String),
    Closed,
    Failed(ProtocolError),
    IdleTimeout,
    Evicted,
    Shutdown,
}

/// Messages the relay sends in reply to a Connect carrying `client_version`
pub fn handshake_messages(client_version: u32) -> Vec<Message> {
    match client_version.cmp(&PROTOCOL_VERSION) {
        Ordering::Equal => vec![Message::validated()],
        Ordering::Less => vec![
            Message::notice(format!(
                "Your client is out of date (client protocol {}, relay protocol {}).",
                client_version, PROTOCOL_VERSION
            )),
            Message::notice("Please install the latest version of the application."),
            Message::notice(
                "Do not proceed: changes made with this client may not synchronize correctly.",
            ),
        ],
        Ordering::Greater => vec![
            Message::notice(format!(
                "The relay is out of date (client protocol {}, relay protocol {}).",
                client_version, PROTOCOL_VERSION
            )),
            Message::notice("Please ask your administrator to update the relay service."),
            Message::notice(
                "Do not proceed: changes made with this client may not synchronize correctly.",
            ),
        ],
    }
}

/// State and logic for one client connection
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    config: Arc<RelayConfig>,
    outbound: mpsc::Sender<Message>,
    evict: CancellationToken,
    state: ConnectionState,
    display_name: Option<String>,
    unexpected_errors: u32,
}

impl Connection {
    /// Creates a worker whose replies go to `outbound`
    ///
    /// `evict` is handed to the registry along with the session; the registry
    /// cancels it when `outbound` overflows.
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        registry: Arc<ConnectionRegistry>,
        config: Arc<RelayConfig>,
        outbound: mpsc::Sender<Message>,
        evict: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            registry,
            config,
            outbound,
            evict,
            state: ConnectionState::Connecting,
            display_name: None,
            unexpected_errors: 0,
        }
    }

    /// Id assigned by the dispatcher at accept time
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Canonical name, once the session has been admitted
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    /// Transient errors seen so far; the connection aborts once this passes
    /// the configured ceiling
    pub fn unexpected_errors(&self) -> u32 {
        self.unexpected_errors
    }

    /// Runs the connection to completion over `stream`
    ///
    /// Returns once the client disconnects or the socket fails. The idle
    /// timeout, the error ceiling, an overflowing outbound queue and `cancel`
    /// also end it. In every case the session has been removed and its group
    /// notified.
    pub async fn serve<S>(
        stream: S,
        id: ConnectionId,
        peer: SocketAddr,
        registry: Arc<ConnectionRegistry>,
        config: Arc<RelayConfig>,
        cancel: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut frames = FramedRead::new(read_half, FrameCodec::with_max_frame_len(config.max_frame_len));
        let sink = FramedWrite::new(write_half, FrameCodec::with_max_frame_len(config.max_frame_len));

        let (outbound_tx, outbound_rx) = mpsc::channel(config.queue_capacity.max(1));
        let evict = cancel.child_token();
        let writer = spawn_writer(id, sink, outbound_rx, evict.clone());
        let idle_timeout = config.idle_timeout;

        let mut connection = Connection::new(id, peer, registry, config, outbound_tx, evict.clone());
        debug!("{} serving {}", id, peer);

        while connection.state != ConnectionState::Terminated {
            let event = tokio::select! {
                _ = evict.cancelled() => {
                    if cancel.is_cancelled() {
                        ReadEvent::Shutdown
                    } else {
                        ReadEvent::Evicted
                    }
                }
                event = next_frame(&mut frames, idle_timeout) => event,
            };

            match event {
                ReadEvent::Frame(frame) => connection.handle_frame(&frame).await,
                ReadEvent::Closed => connection.abandon("connection closed by peer").await,
                ReadEvent::Failed(e) => connection.abandon(&format!("read failed: {}", e)).await,
                ReadEvent::IdleTimeout => connection.abandon("idle timeout").await,
                ReadEvent::Evicted => connection.abandon("outbound queue overflowed").await,
                ReadEvent::Shutdown => connection.abandon("relay shutting down").await,
            }
        }

        // The writer ends once every sender for this queue is gone
        drop(connection);
        finish_writer(id, writer).await;
        debug!("{} closed", id);
    }

    /// Handles one unframed message from the client
    pub async fn handle_frame(&mut self, frame: &str) {
        match Message::parse(frame) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => self.record_error(e.into()).await,
        }
    }

    /// Advances the state machine by one parsed message
    ///
    /// Before Connect only `C` and `D` are meaningful; anything else counts
    /// toward the error ceiling. Once active, `D` ends the session and every
    /// other verb is relayed.
    pub async fn handle_message(&mut self, message: Message) {
        match self.state {
            ConnectionState::Connecting => match message.verb {
                Verb::Connect => match ConnectRequest::parse(&message.payload) {
                    Ok(request) => self.authenticate(request).await,
                    Err(e) => self.record_error(e.into()).await,
                },
                Verb::Disconnect => {
                    info!("{} from {} left before connecting", self.id, self.peer);
                    self.state = ConnectionState::Terminated;
                }
                verb => {
                    self.record_error(RelayError::NotConnected(verb.as_char()))
                        .await
                }
            },
            ConnectionState::Active => {
                if message.verb == Verb::Disconnect {
                    self.disconnect().await;
                } else {
                    self.relay(message).await;
                }
            }
            ConnectionState::Authenticated | ConnectionState::Terminated => {}
        }
    }

    async fn authenticate(&mut self, request: ConnectRequest) {
        if request.version != PROTOCOL_VERSION {
            warn!(
                "{} '{}' uses protocol {} (relay speaks {})",
                self.id, request.username, request.version, PROTOCOL_VERSION
            );
        }
        for message in handshake_messages(request.version) {
            self.reply(message).await;
        }
        self.state = ConnectionState::Authenticated;

        let session = ClientSession::new(
            self.id,
            &request,
            self.outbound.clone(),
            self.evict.clone(),
        );
        match self.registry.admit(session).await {
            Ok(admission) => {
                self.display_name = Some(admission.display_name);
                self.state = ConnectionState::Active;
            }
            Err(e) => {
                error!("{} could not be registered: {}", self.id, e);
                self.state = ConnectionState::Terminated;
            }
        }
    }

    async fn relay(&mut self, message: Message) {
        let Some(name) = self.display_name.clone() else {
            return;
        };

        if message.is_show_users() && self.config.is_privileged(&name) {
            self.show_users().await;
            return;
        }

        let outgoing = message.stamped(&name);
        let reached = self.registry.broadcast(self.id, &outgoing).await;
        debug!("{} relayed '{}' to {} peer(s)", self.id, outgoing, reached);
    }

    async fn show_users(&mut self) {
        let roster = self.registry.enumerate().await;
        info!(
            "{} listed {} connected session(s)",
            self.id,
            roster.len()
        );

        self.reply(Message::notice(format!(
            "{} connected user(s):",
            roster.len()
        )))
        .await;
        for session in roster {
            self.reply(Message::notice(format!(
                "{} | {} | {}",
                session.display_name, session.db_host, session.db_name
            )))
            .await;
        }
    }

    /// Explicit `D`: whatever name the client sent, the group hears the
    /// canonical one
    async fn disconnect(&mut self) {
        if self.registry.depart(self.id).await.is_some() {
            info!("{} disconnected", self.id);
        }
        self.state = ConnectionState::Terminated;
    }

    /// Ends the connection on the client's behalf
    async fn abandon(&mut self, reason: &str) {
        match self.state {
            ConnectionState::Terminated => return,
            ConnectionState::Connecting => {
                info!("{} from {} dropped before connecting: {}", self.id, self.peer, reason);
            }
            ConnectionState::Authenticated | ConnectionState::Active => {
                warn!(
                    "{} '{}' dropped: {}",
                    self.id,
                    self.display_name.as_deref().unwrap_or("?"),
                    reason
                );
            }
        }
        self.disconnect().await;
    }

    async fn record_error(&mut self, err: RelayError) {
        self.unexpected_errors += 1;
        warn!(
            "{} unexpected error {}/{}: {}",
            self.id, self.unexpected_errors, self.config.max_errors, err
        );

        if self.unexpected_errors > self.config.max_errors {
            error!("{} exceeded the error limit, aborting", self.id);
            self.disconnect().await;
        }
    }

    async fn reply(&self, message: Message) {
        if self.outbound.send(message).await.is_err() {
            debug!("{} writer is gone, reply dropped", self.id);
        }
    }
}

async fn next_frame<R>(
    frames: &mut FramedRead<R, FrameCodec>,
    idle_timeout: Option<Duration>,
) -> ReadEvent
where
    R: AsyncRead + Unpin,
{
    let next = match idle_timeout {
        Some(limit) => match timeout(limit, frames.next()).await {
            Ok(next) => next,
            Err(_) => return ReadEvent::IdleTimeout,
        },
        None => frames.next().await,
    };

    match next {
        Some(Ok(frame)) => ReadEvent::Frame(frame),
        Some(Err(e)) => ReadEvent::Failed(e),
        None => ReadEvent::Closed,
    }
}

fn spawn_writer<W>(
    id: ConnectionId,
    mut sink: FramedWrite<W, FrameCodec>,
    mut outbound: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                biased;
                message = outbound.recv() => message,
                _ = cancel.cancelled() => None,
            };
            let Some(message) = message else {
                break;
            };

            if let Err(e) = sink.send(message).await {
                debug!("{} write failed: {}", id, e);
                break;
            }
        }

        if let Err(e) = sink.close().await {
            debug!("{} failed to close socket: {}", id, e);
        }
    })
}

async fn finish_writer(id: ConnectionId, mut writer: JoinHandle<()>) {
    if timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        warn!("{} writer did not finish in time, aborting it", id);
        writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn config() -> Arc<RelayConfig> {
        Arc::new(RelayConfig {
            privileged_users: vec!["Admin".to_string()],
            ..RelayConfig::default()
        })
    }

    fn connection(
        id: u64,
        registry: &Arc<ConnectionRegistry>,
    ) -> (Connection, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(64);
        let connection = Connection::new(
            ConnectionId::new(id),
            peer(),
            Arc::clone(registry),
            config(),
            tx,
            CancellationToken::new(),
        );
        (connection, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<String> {
        let mut received = Vec::new();
        while let Ok(message) = rx.try_recv() {
            received.push(message.encode());
        }
        received
    }

    #[test]
    fn test_handshake_matching_version() {
        let messages = handshake_messages(PROTOCOL_VERSION);
        assert_eq!(messages, vec![Message::validated()]);
    }

    #[test]
    fn test_handshake_old_client() {
        let messages = handshake_messages(PROTOCOL_VERSION - 1);
        assert_eq!(messages.len(), 3);
        assert!(messages[0].payload.contains("Your client is out of date"));
        assert!(messages.iter().all(|m| m.verb == Verb::MESSAGE));
        assert!(messages[2].payload.contains("Do not proceed"));
    }

    #[test]
    fn test_handshake_new_client() {
        let messages = handshake_messages(PROTOCOL_VERSION + 1);
        assert_eq!(messages.len(), 3);
        assert!(messages[0].payload.contains("The relay is out of date"));
        assert!(messages.iter().all(|m| m.verb == Verb::MESSAGE));
    }

    #[tokio::test]
    async fn test_connect_activates_session() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (mut conn, mut rx) = connection(1, &registry);

        conn.handle_frame("C Alice H DB 2").await;

        assert_eq!(conn.state(), ConnectionState::Active);
        assert_eq!(conn.display_name(), Some("Alice"));
        assert_eq!(drain(&mut rx), vec!["V Server: ServerValidated"]);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_version_mismatch_still_activates() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (mut old, mut old_rx) = connection(1, &registry);
        let (mut new, mut new_rx) = connection(2, &registry);

        old.handle_frame("C Old H DB").await;
        new.handle_frame("C New H DB 99").await;

        assert_eq!(old.state(), ConnectionState::Active);
        assert_eq!(new.state(), ConnectionState::Active);
        assert!(drain(&mut old_rx)[0].contains("Your client is out of date"));
        assert!(drain(&mut new_rx)[0].contains("The relay is out of date"));
    }

    #[tokio::test]
    async fn test_collision_rename_and_stamp() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (mut a, mut a_rx) = connection(1, &registry);
        let (mut b, mut b_rx) = connection(2, &registry);

        a.handle_frame("C Alice H DB 2").await;
        b.handle_frame("C Alice H DB 2").await;
        drain(&mut a_rx);

        assert_eq!(b.display_name(), Some("Alice(2)"));
        assert_eq!(
            drain(&mut b_rx),
            vec!["V Server: ServerValidated", "R Alice(2)", "C Alice h db"]
        );

        b.handle_frame("M hello").await;
        assert_eq!(drain(&mut a_rx), vec!["M Alice(2): hello"]);
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn test_identity_verbs_are_relayed_untouched() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (mut a, mut a_rx) = connection(1, &registry);
        let (mut b, _b_rx) = connection(2, &registry);

        a.handle_frame("C A h d 2").await;
        b.handle_frame("C B h d 2").await;
        drain(&mut a_rx);

        b.handle_frame("R something").await;
        b.handle_frame("C B h d 2").await;
        assert_eq!(drain(&mut a_rx), vec!["R something", "C B h d 2"]);
    }

    #[tokio::test]
    async fn test_disconnect_uses_canonical_name() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (mut a, mut a_rx) = connection(1, &registry);
        let (mut b, _b_rx) = connection(2, &registry);

        a.handle_frame("C Alice H DB 2").await;
        b.handle_frame("C Alice H DB 2").await;
        drain(&mut a_rx);

        b.handle_frame("D Mallory").await;

        assert_eq!(b.state(), ConnectionState::Terminated);
        assert_eq!(drain(&mut a_rx), vec!["D Alice(2)"]);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_disconnect_before_connect() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (mut conn, mut rx) = connection(1, &registry);

        conn.handle_frame("D nobody").await;

        assert_eq!(conn.state(), ConnectionState::Terminated);
        assert!(drain(&mut rx).is_empty());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_abandon_after_disconnect_is_noop() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (mut a, mut a_rx) = connection(1, &registry);
        let (mut b, _b_rx) = connection(2, &registry);

        a.handle_frame("C A h d 2").await;
        b.handle_frame("C B h d 2").await;
        drain(&mut a_rx);

        b.handle_frame("D B").await;
        b.abandon("connection closed by peer").await;

        assert_eq!(drain(&mut a_rx), vec!["D B"]);
    }

    #[tokio::test]
    async fn test_show_users_for_privileged_name() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (mut admin, mut admin_rx) = connection(1, &registry);
        let (mut bob, mut bob_rx) = connection(2, &registry);

        admin.handle_frame("C Admin h1 d1 2").await;
        bob.handle_frame("C Bob h1 d1 2").await;
        drain(&mut admin_rx);
        drain(&mut bob_rx);

        admin.handle_frame("M SHOW USERS").await;

        assert_eq!(
            drain(&mut admin_rx),
            vec![
                "M Server: 2 connected user(s):",
                "M Server: Admin | h1 | d1",
                "M Server: Bob | h1 | d1",
            ]
        );
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_show_users_from_unprivileged_name_is_relayed() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (mut admin, mut admin_rx) = connection(1, &registry);
        let (mut bob, mut bob_rx) = connection(2, &registry);

        admin.handle_frame("C Admin h1 d1 2").await;
        bob.handle_frame("C Bob h1 d1 2").await;
        drain(&mut admin_rx);
        drain(&mut bob_rx);

        bob.handle_frame("M SHOW USERS").await;

        assert_eq!(drain(&mut admin_rx), vec!["M Bob: SHOW USERS"]);
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_renamed_admin_is_not_privileged() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (mut admin, mut admin_rx) = connection(1, &registry);
        let (mut impostor, _rx) = connection(2, &registry);

        admin.handle_frame("C Admin h d 2").await;
        impostor.handle_frame("C Admin h d 2").await;
        drain(&mut admin_rx);

        impostor.handle_frame("M SHOW USERS").await;
        assert_eq!(drain(&mut admin_rx), vec!["M Admin(2): SHOW USERS"]);
    }

    #[tokio::test]
    async fn test_traffic_before_connect_is_counted() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (mut conn, _rx) = connection(1, &registry);

        conn.handle_frame("M hello").await;
        conn.handle_frame("not a message").await;
        conn.handle_frame("C missing-fields").await;

        assert_eq!(conn.unexpected_errors(), 3);
        assert_eq!(conn.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_error_ceiling_aborts_connection() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (mut a, mut a_rx) = connection(1, &registry);
        let (mut b, _b_rx) = connection(2, &registry);

        a.handle_frame("C A h d 2").await;
        b.handle_frame("C B h d 2").await;
        drain(&mut a_rx);

        for _ in 0..50 {
            b.handle_frame("garbage in").await;
        }
        assert_eq!(b.state(), ConnectionState::Active);

        b.handle_frame("garbage in").await;
        assert_eq!(b.state(), ConnectionState::Terminated);
        assert_eq!(drain(&mut a_rx), vec!["D B"]);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_overflowing_queue_evicts_and_departs() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let evict = CancellationToken::new();
        let mut slow = Connection::new(
            ConnectionId::new(1),
            peer(),
            Arc::clone(&registry),
            config(),
            slow_tx,
            evict.clone(),
        );
        let (mut fast, mut fast_rx) = connection(2, &registry);

        // The handshake reply fills the single slot and is never read
        slow.handle_frame("C Slow h d 2").await;
        assert!(!evict.is_cancelled());

        fast.handle_frame("C Fast h d 2").await;
        assert!(evict.is_cancelled());

        slow.abandon("outbound queue overflowed").await;
        assert_eq!(slow.state(), ConnectionState::Terminated);
        assert_eq!(
            drain(&mut fast_rx),
            vec!["V Server: ServerValidated", "C Slow h d", "D Slow"]
        );
        assert_eq!(drain(&mut slow_rx), vec!["V Server: ServerValidated"]);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_serve_over_duplex_stream() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (client, server) = tokio::io::duplex(4096);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let task = tokio::spawn(Connection::serve(
            server,
            ConnectionId::new(1),
            peer(),
            Arc::clone(&registry),
            config(),
            CancellationToken::new(),
        ));

        client_write
            .write_all(b"C Solo h d 2 ||| D Solo ||| ")
            .await
            .unwrap();

        let mut received = String::new();
        client_read.read_to_string(&mut received).await.unwrap();
        task.await.unwrap();

        assert_eq!(received, "V Server: ServerValidated ||| ");
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_serve_departs_when_evicted() {
        let registry = Arc::new(ConnectionRegistry::new());
        // A tiny pipe the client never reads keeps the writer stuck
        let (client, server) = tokio::io::duplex(8);
        let (_client_read, mut client_write) = tokio::io::split(client);
        let config = Arc::new(RelayConfig {
            queue_capacity: 1,
            ..RelayConfig::default()
        });

        let task = tokio::spawn(Connection::serve(
            server,
            ConnectionId::new(1),
            peer(),
            Arc::clone(&registry),
            config,
            CancellationToken::new(),
        ));

        client_write.write_all(b"C Slow h d 2 ||| ").await.unwrap();
        for _ in 0..100 {
            if registry.len().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.len().await, 1);

        let (tx, mut rx) = mpsc::channel(16);
        let request = ConnectRequest::new("Chatty", "h", "d", PROTOCOL_VERSION);
        let chatty = ClientSession::new(ConnectionId::new(2), &request, tx, CancellationToken::new());
        registry.admit(chatty).await.unwrap();
        for n in 0..4 {
            let message = Message::new(Verb::MESSAGE, format!("Chatty: {}", n));
            registry.broadcast(ConnectionId::new(2), &message).await;
        }

        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(registry.len().await, 1);
        assert_eq!(drain(&mut rx), vec!["C Slow h d", "D Slow"]);
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (client, server) = tokio::io::duplex(4096);
        let (_client_read, mut client_write) = tokio::io::split(client);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(Connection::serve(
            server,
            ConnectionId::new(1),
            peer(),
            Arc::clone(&registry),
            config(),
            cancel.clone(),
        ));

        client_write.write_all(b"C Idle h d 2 ||| ").await.unwrap();
        for _ in 0..100 {
            if registry.len().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(registry.len().await, 1);

        cancel.cancel();
        timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(registry.is_empty().await);
    }
}
