use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use simplepipe_peer::{Broadcaster, Connection, HandlerSet, Server};

use crate::cmd::{install_ctrlc_handler, wait_while, EchoArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};

pub fn run(args: EchoArgs) -> CliResult<i32> {
    let broadcaster: Arc<OnceLock<Broadcaster>> = Arc::new(OnceLock::new());
    let handler = echo_handler(args.broadcast, Arc::clone(&broadcaster));

    let server = Server::new(args.channel.server_config(), handler)
        .map_err(|err| peer_error("invalid channel", err))?;
    if args.broadcast {
        let _ = broadcaster.set(server.broadcaster());
    }

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    server
        .start()
        .map_err(|err| peer_error("start failed", err))?;
    tracing::info!(
        channel = server.name(),
        broadcast = args.broadcast,
        "echo server running"
    );

    wait_while(|| running.load(Ordering::SeqCst));
    server.stop();
    Ok(SUCCESS)
}

fn echo_handler(broadcast: bool, broadcaster: Arc<OnceLock<Broadcaster>>) -> HandlerSet {
    HandlerSet::new()
        .on_open(|conn: &Connection| {
            tracing::info!(connection = %conn.id(), "client connected");
        })
        .on_message(move |conn, message| {
            tracing::info!(connection = %conn.id(), size = message.len(), "echoing message");
            if broadcast {
                let relayed = broadcaster
                    .get()
                    .is_some_and(|b| b.send_all(message.to_vec()));
                if !relayed {
                    tracing::warn!(connection = %conn.id(), "broadcast not queued");
                }
            } else if let Err(err) = conn.send(message) {
                tracing::warn!(connection = %conn.id(), error = %err, "echo send failed");
            }
        })
        .on_error(|conn, err| {
            tracing::warn!(connection = %conn.id(), error = %err, "connection failed");
        })
        .on_close(|conn| {
            tracing::info!(connection = %conn.id(), "client disconnected");
        })
}
