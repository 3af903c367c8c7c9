use std::fs;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Mutex;
use std::time::Duration;

use simplepipe_peer::{Client, HandlerSet};

use crate::cmd::{parse_duration, SendArgs};
use crate::exit::{peer_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_message, OutputFormat};

/// What the client's read loop reports back to the command.
enum Reply {
    Message(u64, Vec<u8>),
    Closed,
}

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let connect_timeout = parse_duration(&args.connect_timeout)?;
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let payload = resolve_payload(&args)?;

    let (tx, rx) = mpsc::channel();
    let close_tx = Mutex::new(tx.clone());
    let message_tx = Mutex::new(tx);
    let handler = HandlerSet::new()
        .on_message(move |conn, message| {
            if let Ok(tx) = message_tx.lock() {
                let _ = tx.send(Reply::Message(conn.id().get(), message.to_vec()));
            }
        })
        .on_close(move |_| {
            if let Ok(tx) = close_tx.lock() {
                let _ = tx.send(Reply::Closed);
            }
        });

    let config = args
        .channel
        .client_config()
        .with_connect_timeout(connect_timeout);
    let client = Client::new(config, handler).map_err(|err| peer_error("invalid channel", err))?;
    client
        .start()
        .map_err(|err| peer_error("connect failed", err))?;
    client
        .send(&payload)
        .map_err(|err| peer_error("send failed", err))?;

    if args.wait {
        let (connection, reply) = wait_for_reply(&rx, wait_timeout)?;
        print_message(&args.channel.name, connection, &reply, format);
    }

    client.stop();
    Ok(SUCCESS)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    let payload = if let Some(data) = &args.data {
        data.as_bytes().to_vec()
    } else if let Some(path) = &args.file {
        fs::read(path).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        })?
    } else {
        Vec::new()
    };
    if payload.is_empty() {
        return Err(CliError::new(USAGE, "payload must not be empty"));
    }
    Ok(payload)
}

fn wait_for_reply(rx: &mpsc::Receiver<Reply>, timeout: Duration) -> CliResult<(u64, Vec<u8>)> {
    match rx.recv_timeout(timeout) {
        Ok(Reply::Message(connection, message)) => Ok((connection, message)),
        Ok(Reply::Closed) | Err(RecvTimeoutError::Disconnected) => Err(CliError::new(
            FAILURE,
            "server closed the connection before replying",
        )),
        Err(RecvTimeoutError::Timeout) => Err(CliError::new(
            TIMEOUT,
            format!("no reply within {timeout:?}"),
        )),
    }
}
