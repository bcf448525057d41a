//! The pipelined endpoint: one full-duplex connection to a Redis server.
//!
//! An endpoint buffers outbound commands, tracks how many replies are
//! inflight, and drains them in strict FIFO order. Batch boundaries are
//! explicit: `sync` returns reply bodies, `flush` classifies and discards
//! them. A pipe budget of `-1` disables auto-drain — the caller owns the
//! batch boundary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::metrics::{
    record_endpoint_failure, record_endpoint_reconnect, record_endpoint_send,
    record_endpoint_success, sanitize_addr, EngineStats,
};
use crate::resp::{self, Arg, Reply};

/// Read/write buffer size, and the spill threshold for unforced batches.
const BUFFER_SIZE: usize = 64 * 1024;

/// TLS settings for `rediss://` targets.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Extra PEM root CA bundle trusted in addition to the webpki roots.
    pub ca_file: Option<PathBuf>,
}

/// Everything needed to (re)build an endpoint.
#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Pipeline budget: auto-drain when this many commands are inflight.
    /// `-1` disables auto-drain.
    pub pipe_budget: i64,
    /// Force a socket write on every `batch` call.
    pub flush_per_command: bool,
    /// ACL user for `AUTH`.
    pub auth_user: Option<String>,
    /// Password for `AUTH`; when unset the handshake uses `PING`.
    pub auth_password: Option<String>,
    /// Deadline for the initial TCP/TLS connect.
    pub connect_timeout: Duration,
    /// Emit per-endpoint counters.
    pub statistics: bool,
    /// TLS settings; `None` means plaintext.
    pub tls: Option<TlsOptions>,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            pipe_budget: -1,
            flush_per_command: true,
            auth_user: None,
            auth_password: None,
            connect_timeout: Duration::from_millis(60_000),
            statistics: true,
            tls: None,
        }
    }
}

/// Plain TCP or TLS transport.
enum Transport {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Transport {
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            Transport::Tcp(s) => {
                s.write_all(buf).await?;
                s.flush().await
            }
            #[cfg(feature = "tls")]
            Transport::Tls(s) => {
                s.write_all(buf).await?;
                s.flush().await
            }
        }
    }

    async fn read_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read_buf(buf).await,
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.read_buf(buf).await,
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Tcp(s) => s.shutdown().await,
            #[cfg(feature = "tls")]
            Transport::Tls(s) => s.shutdown().await,
        }
    }
}

/// One live pipelined connection to a Redis-compatible server.
pub struct Endpoint {
    host: String,
    port: u16,
    /// Sanitized `host_port` metric label.
    address: String,
    /// Database selected by the last accepted or batched `SELECT`.
    db: i64,
    /// Commands emitted since the last drain.
    inflight: usize,
    transport: Transport,
    read_buf: BytesMut,
    write_buf: BytesMut,
    /// Cluster slots this endpoint owns; carried across reopen.
    slots: Vec<u16>,
    stats: Arc<EngineStats>,
    opts: EndpointOptions,
}

impl Endpoint {
    /// Connect, authenticate, and select a database.
    ///
    /// The handshake is `AUTH [user] password` when credentials are
    /// configured, `PING` otherwise, then `SELECT db` when `db >= 0`. An
    /// error reply to any handshake command is [`Error::Auth`].
    pub async fn open(
        host: &str,
        port: u16,
        db: i64,
        opts: EndpointOptions,
        stats: Arc<EngineStats>,
    ) -> Result<Self> {
        let tcp = tokio::time::timeout(opts.connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| {
                Error::Connect(format!(
                    "{}:{}: timed out after {:?}",
                    host, port, opts.connect_timeout
                ))
            })?
            .map_err(|e| Error::Connect(format!("{}:{}: {}", host, port, e)))?;
        tcp.set_nodelay(true)
            .map_err(|e| Error::Connect(format!("{}:{}: {}", host, port, e)))?;

        let transport = match &opts.tls {
            None => Transport::Tcp(tcp),
            Some(tls) => Self::wrap_tls(host, tcp, tls).await?,
        };

        let mut endpoint = Self {
            host: host.to_string(),
            port,
            address: sanitize_addr(host, port),
            db: -1,
            inflight: 0,
            transport,
            read_buf: BytesMut::with_capacity(BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(BUFFER_SIZE),
            slots: Vec::new(),
            stats,
            opts,
        };

        endpoint.handshake(db).await?;
        debug!(host, port, db, "endpoint connected");
        Ok(endpoint)
    }

    #[cfg(feature = "tls")]
    async fn wrap_tls(host: &str, tcp: TcpStream, tls: &TlsOptions) -> Result<Transport> {
        use tokio_rustls::TlsConnector;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(ca_file) = &tls.ca_file {
            let pem = std::fs::read(ca_file)
                .map_err(|e| Error::Config(format!("ca file {}: {}", ca_file.display(), e)))?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                let cert = cert
                    .map_err(|e| Error::Config(format!("ca file {}: {}", ca_file.display(), e)))?;
                root_store
                    .add(cert)
                    .map_err(|e| Error::Config(format!("ca file {}: {}", ca_file.display(), e)))?;
            }
        }

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
            .map_err(|e| Error::Config(format!("invalid TLS server name '{}': {}", host, e)))?;
        let stream = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| Error::Connect(format!("tls handshake with {}: {}", host, e)))?;
        Ok(Transport::Tls(Box::new(stream)))
    }

    #[cfg(not(feature = "tls"))]
    async fn wrap_tls(host: &str, _tcp: TcpStream, _tls: &TlsOptions) -> Result<Transport> {
        Err(Error::Config(format!(
            "rediss://{} requires the `tls` feature",
            host
        )))
    }

    async fn handshake(&mut self, db: i64) -> Result<()> {
        if let Some(password) = self.opts.auth_password.clone() {
            let mut cmd = vec![Bytes::from_static(b"AUTH")];
            if let Some(user) = &self.opts.auth_user {
                cmd.push(Bytes::from(user.clone()));
            }
            cmd.push(Bytes::from(password));
            let reply = self.send(&cmd).await?;
            if let Some(text) = reply.error_text() {
                return Err(Error::Auth(format!("{}: AUTH: {}", self.endpoint(), text)));
            }
        } else {
            let reply = self.send(&[Bytes::from_static(b"PING")]).await?;
            if let Some(text) = reply.error_text() {
                return Err(Error::Auth(format!("{}: PING: {}", self.endpoint(), text)));
            }
        }
        if db >= 0 {
            let cmd = [Bytes::from_static(b"SELECT"), Bytes::from(db.to_string())];
            let reply = self.send(&cmd).await?;
            if let Some(text) = reply.error_text() {
                return Err(Error::Auth(format!(
                    "{}: SELECT {}: {}",
                    self.endpoint(),
                    db,
                    text
                )));
            }
            self.db = db;
        }
        Ok(())
    }

    /// `host:port` display form.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Sanitized metric label (`host_port`).
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The server-side database after the last accepted/batched `SELECT`.
    pub fn db(&self) -> i64 {
        self.db
    }

    /// Commands emitted since the last drain.
    pub fn inflight(&self) -> usize {
        self.inflight
    }

    /// Host this endpoint connects to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port this endpoint connects to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Cluster slots owned by this endpoint.
    pub fn slots(&self) -> &[u16] {
        &self.slots
    }

    /// Assign the owned slot set (cluster masters).
    pub fn set_slots(&mut self, slots: Vec<u16>) {
        self.slots = slots;
    }

    /// Single-shot request: drains any pending batch first so the reply
    /// cannot interleave with pipelined traffic.
    pub async fn send(&mut self, args: &[Bytes]) -> Result<Reply> {
        self.flush().await?;
        resp::encode_command(args, &mut self.write_buf);
        self.write_socket().await?;
        self.read_reply().await
    }

    /// [`Self::send`] with chunk-chain argument support.
    pub async fn send_argv(&mut self, argv: &[Arg]) -> Result<Reply> {
        self.flush().await?;
        resp::encode_argv(argv, &mut self.write_buf);
        self.write_socket().await?;
        self.read_reply().await
    }

    /// Append a command to the outbound batch.
    ///
    /// With `force`, the writer is flushed immediately and the send is
    /// counted with its emit-to-flush latency. Without it, the write buffer
    /// spills to the socket at 64 KiB. When the inflight count reaches the
    /// pipe budget the endpoint drains itself.
    pub async fn batch(&mut self, force: bool, argv: &[Arg]) -> Result<()> {
        let mark = Instant::now();
        resp::encode_argv(argv, &mut self.write_buf);
        if force {
            self.write_socket().await?;
            self.stats.sends.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            if self.opts.statistics {
                record_endpoint_send(&self.address, mark.elapsed());
            }
        } else if self.write_buf.len() >= BUFFER_SIZE {
            self.write_socket().await?;
        }
        self.inflight += 1;
        if self.opts.pipe_budget >= 0 && self.inflight as i64 >= self.opts.pipe_budget {
            self.flush().await?;
        }
        Ok(())
    }

    /// Batch a `SELECT`, optimistically caching the new database.
    pub async fn select_batched(&mut self, force: bool, db: i64) -> Result<()> {
        let argv = [
            Arg::from("SELECT"),
            Arg::Plain(Bytes::from(db.to_string())),
        ];
        self.batch(force, &argv).await?;
        self.db = db;
        Ok(())
    }

    /// Flush and read exactly the inflight number of replies, in submission
    /// order. Use when reply bodies matter.
    pub async fn sync(&mut self) -> Result<Vec<Reply>> {
        if self.inflight == 0 {
            return Ok(Vec::new());
        }
        self.write_socket().await?;
        let pending = self.inflight;
        let mut replies = Vec::with_capacity(pending);
        for _ in 0..pending {
            replies.push(self.read_reply().await?);
        }
        self.inflight = 0;
        Ok(replies)
    }

    /// Flush and drain all inflight replies, classifying each as
    /// success/failure and discarding the bodies. The migration hot path.
    pub async fn flush(&mut self) -> Result<()> {
        if self.inflight == 0 {
            return Ok(());
        }
        self.write_socket().await?;
        let pending = self.inflight;
        for _ in 0..pending {
            let reply = self.read_reply().await?;
            self.classify(&reply);
        }
        self.inflight = 0;
        Ok(())
    }

    /// Account one reply as success or `respond` failure.
    pub(crate) fn classify(&self, reply: &Reply) {
        if let Reply::Error(msg) = reply {
            warn!(
                endpoint = %self.endpoint(),
                "command rejected: {}",
                String::from_utf8_lossy(msg)
            );
            self.stats.failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            if self.opts.statistics {
                record_endpoint_failure(&self.address, "respond");
            }
        } else {
            self.stats.successes.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            if self.opts.statistics {
                record_endpoint_success(&self.address);
            }
        }
    }

    /// Best-effort teardown; I/O errors are swallowed at debug level.
    pub async fn close(&mut self) {
        if let Err(e) = self.transport.shutdown().await {
            debug!(endpoint = %self.endpoint(), "close: {}", e);
        }
    }

    /// Rebuild a failed endpoint: close the old one quietly and construct a
    /// fresh connection with the same options, carrying the slot set across.
    /// Inflight commands on the old connection are lost.
    pub async fn reopen(mut old: Endpoint, db: i64) -> Result<Endpoint> {
        old.stats
            .reconnects
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        if old.opts.statistics {
            record_endpoint_reconnect(&old.address);
        }
        old.close().await;

        let mut fresh = Endpoint::open(
            &old.host,
            old.port,
            db,
            old.opts.clone(),
            old.stats.clone(),
        )
        .await?;
        fresh.set_slots(std::mem::take(&mut old.slots));
        Ok(fresh)
    }

    async fn write_socket(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        self.transport.write_all(&self.write_buf).await?;
        self.write_buf.clear();
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        loop {
            if let Some(reply) = resp::decode_reply(&mut self.read_buf)? {
                return Ok(reply);
            }
            let n = self.transport.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("endpoint", &self.endpoint())
            .field("db", &self.db)
            .field("inflight", &self.inflight)
            .field("slots", &self.slots.len())
            .finish()
    }
}
