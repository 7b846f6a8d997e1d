use clap::Parser;
use log::{error, info};
use relay_protocol::{DEFAULT_MAX_FRAME_LEN, DEFAULT_PORT};
use relay_server::config::{
    DEFAULT_HOST, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_MAX_ERRORS, DEFAULT_QUEUE_CAPACITY,
};
use relay_server::{Dispatcher, RelayConfig};
use std::process::ExitCode;

// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Relays sync messages between clients sharing a database")]
struct Args {
    /// Address to bind to
    #[arg(short = 'H', long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Display name allowed to run SHOW USERS (repeatable)
    #[arg(long = "privileged-user", env = "RELAY_PRIVILEGED_USERS", value_delimiter = ',')]
    privileged_users: Vec<String>,

    /// Drop connections silent for this many seconds (0 disables)
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS)]
    idle_timeout_secs: u64,

    /// Unexpected errors tolerated per connection
    #[arg(long, default_value_t = DEFAULT_MAX_ERRORS)]
    max_errors: u32,

    /// Outbound messages buffered per connection
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Largest accepted frame in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    max_frame_len: usize,
}

impl Args {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            host: self.host,
            port: self.port,
            privileged_users: self.privileged_users,
            idle_timeout: RelayConfig::idle_timeout_from_secs(self.idle_timeout_secs),
            max_errors: self.max_errors,
            queue_capacity: self.queue_capacity,
            max_frame_len: self.max_frame_len,
        }
    }
}

/// Stands in for the service host: runs the relay until asked to stop.
#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    if !config.privileged_users.is_empty() {
        info!("Privileged users: {}", config.privileged_users.join(", "));
    }

    let dispatcher = match Dispatcher::bind(config).await {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!("Relay failed to start: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let shutdown = dispatcher.shutdown_handle();
    let mut server = tokio::spawn(dispatcher.run());

    let result = tokio::select! {
        result = &mut server => result,
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping relay...");
            shutdown.shutdown();
            server.await
        }
    };

    match result {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            error!("Relay stopped with an error: {}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Relay task panicked: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
