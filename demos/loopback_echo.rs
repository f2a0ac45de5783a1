//! Echo over two UDP endpoints in one process.
//!
//! The server endpoint accepts conversations created by the first datagram
//! carrying an unknown conversation id and echoes every message back.
//!
//! ```text
//! RUST_LOG=ukcp=debug cargo run --example loopback_echo -- [count]
//! ```

use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use ukcp::metrics::{format_metrics, global_metrics};
use ukcp::{KcpConfig, KcpEndpoint, KcpSession};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let count: usize = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => 100,
    };

    let config = KcpConfig::realtime();
    let mut server = KcpEndpoint::bind("127.0.0.1:0".parse()?, config.clone()).await?;
    let server_addr = *server.local_addr();
    info!("Server listening on {}", server_addr);

    tokio::spawn(async move {
        loop {
            match server.accept().await {
                Ok(session) => {
                    info!("New conversation {} from {}", session.conv(), session.peer_addr());
                    tokio::spawn(echo(session));
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    break;
                }
            }
        }
    });

    let client = KcpEndpoint::bind("127.0.0.1:0".parse()?, config).await?;
    let mut session = client.open(0x2024_1015, server_addr)?;
    info!("Client {} talking to {}", client.local_addr(), server_addr);

    let started = Instant::now();
    for i in 0..count {
        let message = format!("echo #{i}");
        session.send(message.clone().into_bytes()).await?;
        let reply = session.recv_timeout(Duration::from_secs(5)).await?;
        if reply != message.as_bytes() {
            error!("Mismatched echo for message {}", i);
            return Err("echo mismatch".into());
        }
    }
    let elapsed = started.elapsed();

    let stats = session.stats().await?;
    info!(
        "{} round trips in {:?}, rtt {} ms, {} retransmissions",
        count, elapsed, stats.rtt, stats.retransmissions
    );

    session.close();
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("{}", format_metrics(&global_metrics().snapshot()));
    Ok(())
}

async fn echo(mut session: KcpSession) {
    loop {
        match session.recv().await {
            Ok(message) => {
                if let Err(e) = session.send(message).await {
                    error!("Echo to {} failed: {}", session.peer_addr(), e);
                    break;
                }
            }
            Err(_) => {
                info!("Conversation {} closed", session.conv());
                break;
            }
        }
    }
}
