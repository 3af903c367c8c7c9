use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use simplepipe_peer::{HandlerSet, Server};

use crate::cmd::{install_ctrlc_handler, wait_while, ListenArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::{print_message, OutputFormat};

pub fn run(args: ListenArgs, format: OutputFormat) -> CliResult<i32> {
    let running = Arc::new(AtomicBool::new(true));
    let printed = Arc::new(AtomicUsize::new(0));

    let channel = args.channel.name.clone();
    let limit = args.count;
    let handler = {
        let running = Arc::clone(&running);
        let printed = Arc::clone(&printed);
        HandlerSet::new().on_message(move |conn, message| {
            if !running.load(Ordering::SeqCst) {
                return;
            }
            let seq = printed.fetch_add(1, Ordering::SeqCst).saturating_add(1);
            if limit.is_some_and(|count| seq > count) {
                return;
            }
            print_message(&channel, conn.id().get(), message, format);
            if limit == Some(seq) {
                running.store(false, Ordering::SeqCst);
            }
        })
    };

    let server = Server::new(args.channel.server_config(), handler)
        .map_err(|err| peer_error("invalid channel", err))?;
    install_ctrlc_handler(running.clone())?;
    server
        .start()
        .map_err(|err| peer_error("start failed", err))?;
    tracing::info!(channel = server.name(), "listening");

    wait_while(|| running.load(Ordering::SeqCst));
    server.stop();
    tracing::debug!(messages = printed.load(Ordering::SeqCst), "listener stopped");
    Ok(SUCCESS)
}
