//! # Database Sync Relay
//!
//! A TCP relay that keeps concurrently running instances of a multi-user
//! application in step. Each client announces the database host and database
//! name it works against; the relay forwards its messages to exactly the
//! other clients sharing that pair and to nobody else.
//!
//! ## Core Responsibilities
//!
//! ### Session Management
//! Every connection moves through a small state machine: it announces
//! itself with a Connect message, receives a version handshake, is admitted
//! under a unique display name, relays messages while active, and is removed
//! exactly once when it disconnects or its socket fails.
//!
//! ### Grouped Broadcast
//! A message from one session reaches every other live session with the same
//! `(dbHost, dbName)` and never leaves that group. Generic messages are
//! stamped with the sender's canonical name so clients cannot impersonate
//! each other.
//!
//! ### Name De-duplication
//! Two live sessions never share a display name; a newcomer whose name is
//! taken becomes `Name(2)`, `Name(3)`, ... and is told so with a Rename notice.
//!
//! ## Architecture Design
//!
//! ### Task Per Connection
//! The [`dispatcher`] accepts sockets and spawns one worker per connection.
//! Each worker reads framed messages and owns a writer task that is the only
//! thing ever writing to its socket.
//!
//! ### Queue-Based Fan-Out
//! Broadcasting enqueues onto each peer's bounded outbound queue while the
//! registry lock is held; no socket I/O happens under the lock. A slow peer
//! loses deliveries instead of stalling its group.
//!
//! ### Cancellable Shutdown
//! All workers share a cancellation token with the dispatcher, so a stop
//! request unblocks every pending read immediately.
//!
//! ## Module Organization
//!
//! - `config` - [`RelayConfig`] and its defaults
//! - `registry` - the lock-protected session table and group fan-out
//! - `dedupe` - display-name collision resolution
//! - `connection` - the per-connection state machine
//! - `dispatcher` - listener, accept loop and shutdown
//! - `error` - [`RelayError`]
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use relay_server::{Dispatcher, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatcher = Dispatcher::bind(RelayConfig::default()).await?;
//!     let shutdown = dispatcher.shutdown_handle();
//!
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.shutdown();
//!     });
//!
//!     dispatcher.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod dedupe;
pub mod dispatcher;
pub mod error;
pub mod registry;

pub use config::RelayConfig;
pub use connection::{Connection, ConnectionState};
pub use dispatcher::{Dispatcher, ShutdownHandle};
pub use error::{RelayError, Result};
pub use registry::{ConnectionId, ConnectionRegistry, SessionInfo};
