//! Metric gateway selection and exposition.
//!
//! The `metric_gateway` config key selects `none` or `influxdb`. Counter
//! *collection* always happens through the `metrics` facade; the gateway
//! only controls exposition. For `influxdb` we install the Prometheus
//! recorder and serve a plain-text exposition endpoint — the InfluxDB
//! ingestion side (a telegraf-style scraper) runs out of process.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{Error, Result};

/// Where endpoint counters are exported to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricGateway {
    /// No exposition; counters remain facade-only.
    #[default]
    None,
    /// Expose counters for an InfluxDB-bound scraper.
    Influxdb,
}

/// HTTP body type for responses.
type Body = Full<bytes::Bytes>;

/// Minimal metrics exposition server: `GET /metrics` and `GET /health`.
pub struct MetricsServer {
    handle: PrometheusHandle,
    addr: SocketAddr,
}

impl MetricsServer {
    /// Install the recorder and prepare a server on `addr`.
    ///
    /// Fails if a global recorder is already installed.
    pub fn new(addr: SocketAddr) -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| Error::Config(format!("metrics recorder: {}", e)))?;
        Ok(Self { handle, addr })
    }

    /// Serve until the task is dropped.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("metrics gateway listening on {}", self.addr);

        let handle = Arc::new(self.handle);
        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let handle = handle.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handle = handle.clone();
                    async move { handle_request(req, handle) }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    error!("metrics connection error: {}", e);
                }
            });
        }
    }

    /// The recorder handle, for rendering in tests.
    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

fn handle_request(
    req: Request<Incoming>,
    handle: Arc<PrometheusHandle>,
) -> std::result::Result<Response<Body>, hyper::Error> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => Response::builder()
            .header("content-type", "text/plain; version=0.0.4")
            .body(Full::new(bytes::Bytes::from(handle.render())))
            .expect("static response"),
        (&Method::GET, "/health") => Response::new(Full::new(bytes::Bytes::from_static(b"OK"))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(bytes::Bytes::from_static(b"not found")))
            .expect("static response"),
    };
    Ok(response)
}
