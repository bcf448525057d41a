//! Shared test utilities: a scripted mock RESP server.
//!
//! Import via `mod common;` in integration test files. The mock accepts any
//! number of connections, records every command it receives in arrival
//! order, and answers according to a script closure (default: `+PONG` to
//! `PING`, `+OK` to everything else). Scripts can inject error replies or
//! drop the connection to exercise the reconnect supervisor.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use rdbshift::resp::{decode_reply, Reply};

/// What the mock does with one received command.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum Behavior {
    /// `+PONG` for `PING`, `+OK` otherwise.
    Default,
    /// An error reply.
    Error(&'static str),
    /// An integer reply.
    Integer(i64),
    /// Close the connection without replying.
    DropConnection,
}

type Script = Arc<dyn Fn(&[Bytes]) -> Behavior + Send + Sync>;

/// One received command with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct ReceivedCommand {
    pub conn: usize,
    pub argv: Vec<Bytes>,
}

#[allow(dead_code)]
impl ReceivedCommand {
    pub fn name(&self) -> String {
        String::from_utf8_lossy(&self.argv[0]).to_ascii_uppercase()
    }

    pub fn arg(&self, i: usize) -> &[u8] {
        &self.argv[i]
    }
}

/// A scripted in-process RESP server.
pub struct MockServer {
    addr: SocketAddr,
    commands: Arc<Mutex<Vec<ReceivedCommand>>>,
    connections: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl MockServer {
    /// Start with default behavior for every command.
    pub async fn start() -> Self {
        Self::start_scripted(|_| Behavior::Default).await
    }

    /// Start with a script deciding the reply per command.
    pub async fn start_scripted<F>(script: F) -> Self
    where
        F: Fn(&[Bytes]) -> Behavior + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock server");
        let addr = listener.local_addr().expect("mock server addr");
        let commands: Arc<Mutex<Vec<ReceivedCommand>>> = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let script: Script = Arc::new(script);

        {
            let commands = commands.clone();
            let connections = connections.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    let conn = connections.fetch_add(1, Ordering::SeqCst);
                    let commands = commands.clone();
                    let script = script.clone();
                    tokio::spawn(serve_connection(stream, conn, commands, script));
                }
            });
        }

        Self {
            addr,
            commands,
            connections,
        }
    }

    /// `host:port` of the listener.
    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// `redis://` URL of the listener.
    pub fn url(&self) -> String {
        format!("redis://{}", self.addr())
    }

    /// Connections accepted so far.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Every command received so far, in arrival order.
    pub fn commands(&self) -> Vec<ReceivedCommand> {
        self.commands.lock().expect("commands lock").clone()
    }

    /// Command names in arrival order, handshake (`PING`) included.
    pub fn command_names(&self) -> Vec<String> {
        self.commands().iter().map(ReceivedCommand::name).collect()
    }

    /// Commands with a given name.
    pub fn commands_named(&self, name: &str) -> Vec<ReceivedCommand> {
        self.commands()
            .into_iter()
            .filter(|c| c.name() == name)
            .collect()
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    conn: usize,
    commands: Arc<Mutex<Vec<ReceivedCommand>>>,
    script: Script,
) {
    let mut buf = BytesMut::with_capacity(16 * 1024);
    loop {
        // Drain every complete command frame in the buffer.
        loop {
            let frame = match decode_reply(&mut buf) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => return,
            };
            let Some(argv) = frame_argv(frame) else {
                return;
            };
            commands
                .lock()
                .expect("commands lock")
                .push(ReceivedCommand {
                    conn,
                    argv: argv.clone(),
                });

            let reply = match script(&argv) {
                Behavior::Default => default_reply(&argv),
                Behavior::Error(msg) => format!("-{}\r\n", msg).into_bytes(),
                Behavior::Integer(n) => format!(":{}\r\n", n).into_bytes(),
                Behavior::DropConnection => return,
            };
            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }

        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

/// A client command frame is a RESP array of bulk strings.
fn frame_argv(frame: Reply) -> Option<Vec<Bytes>> {
    let Reply::Array(Some(items)) = frame else {
        return None;
    };
    items
        .into_iter()
        .map(|item| match item {
            Reply::Bulk(Some(b)) => Some(b),
            _ => None,
        })
        .collect()
}

fn default_reply(argv: &[Bytes]) -> Vec<u8> {
    if argv[0].eq_ignore_ascii_case(b"PING") {
        b"+PONG\r\n".to_vec()
    } else {
        b"+OK\r\n".to_vec()
    }
}
