//! Server and three clients in one process; one broadcast reaches all of them.
//!
//! Run with:
//!   cargo run --example broadcast --features peer

use std::time::{Duration, Instant};

use simplepipe::peer::{Client, ClientConfig, HandlerSet, Server, ServerConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::new(
        ServerConfig::new("broadcast-demo"),
        HandlerSet::new().on_message(|_, _| {}),
    )?;
    server.start()?;

    let clients = (0..3)
        .map(|i| {
            let client = Client::new(
                ClientConfig::new("broadcast-demo"),
                HandlerSet::new().on_message(move |_, message| {
                    println!("client {i} got {:?}", String::from_utf8_lossy(message));
                }),
            )?;
            client.start()?;
            Ok(client)
        })
        .collect::<Result<Vec<_>, simplepipe::peer::PeerError>>()?;

    let deadline = Instant::now() + Duration::from_secs(2);
    while server.connection_count() < clients.len() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    println!("broadcast queued: {}", server.send_all("ping"));
    std::thread::sleep(Duration::from_millis(200));

    drop(clients);
    server.stop();
    Ok(())
}
