//! Minimal echo server: every message is sent back to its sender.
//!
//! Run with:
//!   cargo run --example echo-server --features peer
//!
//! In another terminal:
//!   cargo run --features cli -- send echo-demo --data hello --wait

use std::time::Duration;

use simplepipe::peer::{HandlerSet, Server, ServerConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let handler = HandlerSet::new()
        .on_open(|conn| eprintln!("client {} connected", conn.id()))
        .on_message(|conn, message| {
            eprintln!("received {} bytes from {}", message.len(), conn.id());
            if let Err(err) = conn.send(message) {
                eprintln!("echo failed: {err}");
            }
        })
        .on_close(|conn| eprintln!("client {} disconnected", conn.id()));

    let server = Server::new(ServerConfig::new("echo-demo"), handler)?;
    server.start()?;
    eprintln!("serving {:?} for 60 seconds", server.channel().address());

    std::thread::sleep(Duration::from_secs(60));
    server.stop();
    Ok(())
}
