//! Minimal interactive peer for the secure transport: one side listens, the
//! other connects, and both exchange newline-delimited strings until either
//! quits. Not a multi-peer chat node — the transport itself is point to
//! point; it does not multiplex multiple logical streams over one channel.

use anyhow::{bail, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use secure_channel::{ChannelConfig, Listener, ListenerConfig, SendOutcome, StreamSecureChannel};

#[derive(Parser)]
#[command(name = "chatter", about = "Talk to one peer over a secure channel")]
struct Args {
    /// Bind and wait for a single incoming connection.
    #[arg(long, conflicts_with = "connect")]
    listen: Option<String>,

    /// Connect to a peer already listening.
    #[arg(long, conflicts_with = "listen")]
    connect: Option<String>,

    /// Pre-shared key authenticating the handshake. Must match on both ends.
    #[arg(long)]
    psk: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut config = ChannelConfig::default();
    if let Some(psk) = &args.psk {
        config.psk = Some(psk.as_bytes().to_vec());
    }

    let channel: Arc<StreamSecureChannel<tokio::net::TcpStream>> = if let Some(addr) = args.connect {
        println!("connecting to {addr}...");
        Arc::new(StreamSecureChannel::connect(addr, config).await?)
    } else if let Some(addr) = args.listen {
        let listener_config = ListenerConfig {
            channel: config,
            ..ListenerConfig::default()
        };
        let listener = Listener::bind(addr.clone(), listener_config).await?;
        println!("listening on {addr}, waiting for a peer...");
        Arc::new(listener.accept().await?)
    } else {
        bail!("specify either --listen <addr> or --connect <addr>");
    };

    println!("connected, role = {:?}", channel.local_role());

    let reader_channel = channel.clone();
    let reader_task = tokio::spawn(async move {
        loop {
            match reader_channel.receive_str().await {
                Ok(Some(msg)) => println!("\n<< {msg}"),
                Ok(None) => {
                    println!("\n<< peer sent end-of-stream");
                    break;
                }
                Err(e) => {
                    println!("\n<< receive error: {e}");
                    break;
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line == "/quit" {
            let _ = channel.send_str(None).await;
            break;
        }
        match channel.send_str(Some(&line)).await {
            Ok(SendOutcome::Sent) => {}
            Ok(SendOutcome::Broken) => {
                println!("connection broken");
                break;
            }
            Err(e) => {
                println!("send error: {e}");
                break;
            }
        }
    }

    reader_task.abort();
    channel.close().await?;
    Ok(())
}
