//! Connects to a relay, joins a group, sends a few messages and prints
//! everything that comes back.

use clap::Parser;
use futures::{SinkExt, StreamExt};
use log::{info, warn};
use relay_protocol::{ConnectRequest, FrameCodec, Message, Verb, PROTOCOL_VERSION};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::codec::Framed;

#[derive(Parser, Debug)]
#[command(author, version, about = "Smoke-test client for the sync relay")]
struct Args {
    /// Relay address
    #[arg(short = 's', long, default_value = "127.0.0.1:17595")]
    server: String,

    #[arg(short = 'u', long, default_value = "probe")]
    username: String,

    #[arg(long, default_value = "localhost")]
    db_host: String,

    #[arg(long, default_value = "probe")]
    db_name: String,

    /// Protocol version to announce
    #[arg(long, default_value_t = PROTOCOL_VERSION)]
    version: u32,

    /// Raw message to send after joining, e.g. "M hello" (repeatable)
    #[arg(short = 'm', long = "message")]
    messages: Vec<String>,

    /// Seconds to keep listening before disconnecting
    #[arg(short = 'w', long, default_value = "2")]
    wait_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let stream = TcpStream::connect(&args.server).await?;
    info!("Connected to {}", args.server);
    let mut framed = Framed::new(stream, FrameCodec::new());

    let request = ConnectRequest::new(&args.username, &args.db_host, &args.db_name, args.version);
    framed.send(request.to_message()).await?;

    // Give the relay a moment to admit us before relaying anything
    sleep(Duration::from_millis(100)).await;

    for raw in &args.messages {
        match Message::parse(raw) {
            Ok(message) => {
                info!("-> {}", message);
                framed.send(message).await?;
            }
            Err(e) => warn!("Skipping '{}': {}", raw, e),
        }
    }

    let mut display_name = args.username.clone();
    let deadline = Instant::now() + Duration::from_secs(args.wait_secs);
    loop {
        match timeout_at(deadline, framed.next()).await {
            Ok(Some(Ok(frame))) => {
                println!("<- {}", frame);
                if let Ok(message) = Message::parse(&frame) {
                    if message.verb == Verb::Rename {
                        display_name = message.payload;
                    }
                }
            }
            Ok(Some(Err(e))) => {
                warn!("Read failed: {}", e);
                break;
            }
            Ok(None) => {
                info!("Relay closed the connection");
                return Ok(());
            }
            Err(_) => break,
        }
    }

    framed.send(Message::disconnect(&display_name)).await?;
    info!("Disconnected as '{}'", display_name);
    Ok(())
}
