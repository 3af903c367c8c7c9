#![cfg(target_os = "linux")]

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use simplepipe_peer::{
    Client, ClientConfig, Connection, Handler, HandlerSet, PeerError, Server, ServerConfig,
};

const WAIT: Duration = Duration::from_secs(3);

fn test_dir(tag: &str) -> PathBuf {
    let dir = PathBuf::from(format!(
        "/tmp/spi-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Open(u64),
    Message(u64, Vec<u8>),
    Close(u64),
    Error(u64, String),
}

/// Forwards every handler call to a channel, optionally replying first.
struct Recorder {
    events: Mutex<Sender<Event>>,
    reply: Option<Box<dyn Fn(&Connection, &[u8]) + Send + Sync>>,
}

impl Recorder {
    fn new() -> (Self, Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                events: Mutex::new(tx),
                reply: None,
            },
            rx,
        )
    }

    fn replying(mut self, reply: impl Fn(&Connection, &[u8]) + Send + Sync + 'static) -> Self {
        self.reply = Some(Box::new(reply));
        self
    }

    fn emit(&self, event: Event) {
        let _ = self.events.lock().unwrap().send(event);
    }
}

impl Handler for Recorder {
    fn on_open(&self, conn: &Connection) {
        self.emit(Event::Open(conn.id().get()));
    }

    fn on_message(&self, conn: &Connection, message: &[u8]) {
        self.emit(Event::Message(conn.id().get(), message.to_vec()));
        if let Some(reply) = &self.reply {
            reply(conn, message);
        }
    }

    fn on_close(&self, conn: &Connection) {
        self.emit(Event::Close(conn.id().get()));
    }

    fn on_error(&self, conn: &Connection, error: &PeerError) {
        self.emit(Event::Error(conn.id().get(), error.to_string()));
    }
}

fn next(rx: &Receiver<Event>) -> Event {
    rx.recv_timeout(WAIT).expect("event should arrive")
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition should become true");
        thread::sleep(Duration::from_millis(5));
    }
}

fn client(dir: &PathBuf, name: &str, handler: impl Handler) -> Client {
    let client = Client::new(ClientConfig::new(name).with_directory(dir), handler)
        .expect("client should build");
    client.start().expect("client should connect");
    client
}

#[test]
fn greeting_exchange_then_server_close() {
    let dir = test_dir("pipea");
    let (server_handler, server_rx) = Recorder::new();
    let server_handler = server_handler.replying(|conn, msg| {
        if msg == b"Hello!" {
            conn.send(b"Hello to you too!")
                .expect("server reply should send");
        } else if msg == b"Yes!" {
            conn.close();
        }
    });
    let server = Server::new(ServerConfig::new("pipeA").with_directory(&dir), server_handler)
        .expect("server should build");
    server.start().expect("server should start");

    let (client_handler, client_rx) = Recorder::new();
    let client_handler = client_handler.replying(|conn, msg| {
        if msg == b"Hello to you too!" {
            conn.send(b"Yes!").expect("client reply should send");
        }
    });
    let client = client(&dir, "pipeA", client_handler);

    assert_eq!(next(&client_rx), Event::Open(1));
    client.send(b"Hello!").expect("greeting should send");

    assert_eq!(next(&server_rx), Event::Open(1));
    assert_eq!(next(&server_rx), Event::Message(1, b"Hello!".to_vec()));
    assert_eq!(
        next(&client_rx),
        Event::Message(1, b"Hello to you too!".to_vec())
    );
    assert_eq!(next(&server_rx), Event::Message(1, b"Yes!".to_vec()));
    assert_eq!(next(&server_rx), Event::Close(1));
    assert_eq!(next(&client_rx), Event::Close(1));
    wait_until(|| !client.is_open());

    server.stop();
    assert!(server_rx.try_recv().is_err(), "no handler should fire after close");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn broadcast_without_connections_is_rejected() {
    let dir = test_dir("empty");
    let (handler, rx) = Recorder::new();
    let server = Server::new(ServerConfig::new("empty").with_directory(&dir), handler)
        .expect("server should build");

    assert!(!server.send_all("x"), "stopped server should not accept");
    server.start().expect("server should start");
    assert!(!server.send_all("x"));
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    server.stop();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn broadcast_reaches_each_client_once() {
    let dir = test_dir("ping");
    let server = Server::new(
        ServerConfig::new("ping").with_directory(&dir),
        HandlerSet::new().on_message(|_, _| {}),
    )
    .expect("server should build");
    server.start().expect("server should start");

    let mut clients = Vec::new();
    let mut receivers = Vec::new();
    for _ in 0..3 {
        let (handler, rx) = Recorder::new();
        clients.push(client(&dir, "ping", handler));
        receivers.push(rx);
    }
    wait_until(|| server.connection_count() == 3);

    assert!(server.send_all("ping"));
    for rx in &receivers {
        assert!(matches!(next(rx), Event::Open(_)));
        match next(rx) {
            Event::Message(_, msg) => assert_eq!(msg, b"ping"),
            other => panic!("expected ping, got {other:?}"),
        }
        assert!(
            rx.recv_timeout(Duration::from_millis(50)).is_err(),
            "each client should get exactly one ping"
        );
    }

    drop(clients);
    server.stop();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn every_attachment_opens_and_closes_once() {
    let dir = test_dir("many");
    let (handler, rx) = Recorder::new();
    let server = Server::new(ServerConfig::new("many").with_directory(&dir), handler)
        .expect("server should build");
    server.start().expect("server should start");

    let clients: Vec<Client> = (0..8)
        .map(|_| client(&dir, "many", HandlerSet::new().on_message(|_, _| {})))
        .collect();
    wait_until(|| server.connection_count() == 8);
    drop(clients);
    wait_until(|| server.connection_count() == 0);

    let mut opened = Vec::new();
    let mut closed = Vec::new();
    while opened.len() < 8 || closed.len() < 8 {
        match next(&rx) {
            Event::Open(id) => opened.push(id),
            Event::Close(id) => closed.push(id),
            other => panic!("unexpected event {other:?}"),
        }
    }
    opened.sort_unstable();
    closed.sort_unstable();
    assert_eq!(opened, (1..=8).collect::<Vec<u64>>());
    assert_eq!(opened, closed);

    server.stop();
    assert!(rx.try_recv().is_err());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn messages_arrive_in_send_order() {
    let dir = test_dir("order");
    let (handler, rx) = Recorder::new();
    let server = Server::new(ServerConfig::new("order").with_directory(&dir), handler)
        .expect("server should build");
    server.start().expect("server should start");

    let client = client(&dir, "order", HandlerSet::new().on_message(|_, _| {}));
    for i in 0..50u32 {
        client
            .send(format!("msg-{i}").as_bytes())
            .expect("send should succeed");
    }

    assert!(matches!(next(&rx), Event::Open(_)));
    for i in 0..50u32 {
        match next(&rx) {
            Event::Message(_, msg) => assert_eq!(msg, format!("msg-{i}").into_bytes()),
            other => panic!("expected message {i}, got {other:?}"),
        }
    }

    drop(client);
    server.stop();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn stop_closes_connected_clients() {
    let dir = test_dir("stop");
    let server = Server::new(
        ServerConfig::new("stop").with_directory(&dir),
        HandlerSet::new().on_message(|_, _| {}),
    )
    .expect("server should build");
    server.start().expect("server should start");

    let (handler, rx) = Recorder::new();
    let client = client(&dir, "stop", handler);
    wait_until(|| server.connection_count() == 1);

    let started = Instant::now();
    server.stop();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!server.is_running());
    assert_eq!(server.connection_count(), 0);

    assert!(matches!(next(&rx), Event::Open(_)));
    assert!(matches!(next(&rx), Event::Close(_)));
    wait_until(|| !client.is_open());
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn closed_connection_leaves_the_count() {
    let dir = test_dir("count");
    let (handler, rx) = Recorder::new();
    let server = Arc::new(
        Server::new(ServerConfig::new("count").with_directory(&dir), handler)
            .expect("server should build"),
    );
    server.start().expect("server should start");

    let first = client(&dir, "count", HandlerSet::new().on_message(|_, _| {}));
    let _second = client(&dir, "count", HandlerSet::new().on_message(|_, _| {}));
    wait_until(|| server.connection_count() == 2);

    first.stop();
    loop {
        if let Event::Close(_) = next(&rx) {
            break;
        }
    }
    assert_eq!(server.connection_count(), 1);

    server.stop();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn oversized_inbound_message_is_reported_then_closed() {
    let dir = test_dir("trunc");
    let (handler, rx) = Recorder::new();
    let server = Server::new(
        ServerConfig::new("trunc")
            .with_directory(&dir)
            .with_buffer_size(16),
        handler,
    )
    .expect("server should build");
    server.start().expect("server should start");

    let client = Client::new(
        ClientConfig::new("trunc")
            .with_directory(&dir)
            .with_buffer_size(64),
        HandlerSet::new().on_message(|_, _| {}),
    )
    .expect("client should build");
    client.start().expect("client should connect");
    client.send(&[b'x'; 32]).expect("client allows 32 bytes");

    assert!(matches!(next(&rx), Event::Open(_)));
    match next(&rx) {
        Event::Error(_, text) => assert!(text.contains("truncated"), "got {text}"),
        other => panic!("expected truncation error, got {other:?}"),
    }
    assert!(matches!(next(&rx), Event::Close(_)));
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    drop(client);
    server.stop();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn send_to_targets_one_connection() {
    let dir = test_dir("sendto");
    let server = Server::new(
        ServerConfig::new("sendto").with_directory(&dir),
        HandlerSet::new().on_message(|_, _| {}),
    )
    .expect("server should build");
    server.start().expect("server should start");

    let (handler_a, rx_a) = Recorder::new();
    let (handler_b, rx_b) = Recorder::new();
    let _a = client(&dir, "sendto", handler_a);
    wait_until(|| server.connection_count() == 1);
    let _b = client(&dir, "sendto", handler_b);
    wait_until(|| server.connection_count() == 2);

    let target = server.connections()[0].id();
    server
        .send_to(target, b"only you")
        .expect("send_to should succeed");

    assert!(matches!(next(&rx_a), Event::Open(_)));
    assert_eq!(next(&rx_a), Event::Message(1, b"only you".to_vec()));
    assert!(matches!(next(&rx_b), Event::Open(_)));
    assert!(rx_b.recv_timeout(Duration::from_millis(50)).is_err());

    assert!(server.close_connection(target));
    wait_until(|| server.connection_count() == 1);

    server.stop();
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn stop_from_inside_a_handler_returns() {
    let dir = test_dir("inner");
    let slot: Arc<Mutex<Option<Arc<Server>>>> = Arc::new(Mutex::new(None));
    let in_handler = Arc::clone(&slot);
    let (done_tx, done_rx) = mpsc::channel();
    let done_tx = Mutex::new(done_tx);
    let handler = HandlerSet::new().on_message(move |_, msg| {
        if msg == b"shutdown" {
            let server = in_handler.lock().unwrap().clone();
            if let Some(server) = server {
                server.stop();
                let _ = done_tx.lock().unwrap().send(());
            }
        }
    });
    let server = Arc::new(
        Server::new(ServerConfig::new("inner").with_directory(&dir), handler)
            .expect("server should build"),
    );
    *slot.lock().unwrap() = Some(Arc::clone(&server));
    server.start().expect("server should start");

    let client = client(&dir, "inner", HandlerSet::new().on_message(|_, _| {}));
    client.send(b"shutdown").expect("send should succeed");
    done_rx
        .recv_timeout(WAIT)
        .expect("stop inside handler should return");
    assert!(!server.is_running());

    slot.lock().unwrap().take();
    drop(client);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn panicking_handler_removes_the_connection() {
    let dir = test_dir("panic");
    let handler = HandlerSet::new().on_message(|_, msg| {
        if msg == b"x" {
            panic!("handler failure");
        }
    });
    let server = Server::new(ServerConfig::new("panic").with_directory(&dir), handler)
        .expect("server should build");
    server.start().expect("server should start");

    let (client_handler, client_rx) = Recorder::new();
    let client = client(&dir, "panic", client_handler);
    assert_eq!(next(&client_rx), Event::Open(1));
    wait_until(|| server.connection_count() == 1);

    client.send(b"x").expect("send should succeed");
    assert_eq!(next(&client_rx), Event::Close(1));
    wait_until(|| server.connection_count() == 0);
    assert!(!server.send_all("y"), "no open connection should remain");

    drop(client);
    server.stop();
    let _ = std::fs::remove_dir_all(&dir);
}
