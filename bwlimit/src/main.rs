use std::{io, net::SocketAddr, sync::Arc, time};

use ahash::RandomState;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch},
};
use clap::Parser;
use dashmap::DashMap;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use tokio::{
    io::copy_bidirectional_with_sizes,
    net::{TcpListener, TcpStream},
    signal,
    time::timeout,
};
use tokio_bwlimit::{
    BandwidthConnection, ConnectionLimiter, Direction, LimitBandwidthExt, LimitError,
    LimitsHandle, Quota,
};
use tokio_util::sync::CancellationToken;

use tracing::{Instrument, error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Config {
    /// Address to listen on, e.g. 0.0.0.0:8080
    #[arg(short = 'l', long)]
    listen: SocketAddr,

    /// Address to connect upstream to, e.g. 127.0.0.1:8181
    #[arg(short = 'c', long)]
    upstream: SocketAddr,

    /// Address to listen for API, e.g. 127.0.0.1:8888
    #[arg(short = 'a', long)]
    api: SocketAddr,

    /// Shared rate for data sent to all clients, bytes per second (0 = unlimited)
    #[arg(long, value_name = "bytes/s", default_value_t = 0.0)]
    global_write_rate_bytes: f64,

    /// Burst for the shared client-bound rate (0 = same as rate)
    #[arg(long, value_name = "bytes", default_value_t = 0)]
    global_write_burst_bytes: usize,

    /// Shared rate for data received from all clients, bytes per second (0 = unlimited)
    #[arg(long, value_name = "bytes/s", default_value_t = 0.0)]
    global_read_rate_bytes: f64,

    /// Burst for the shared client-sent rate (0 = same as rate)
    #[arg(long, value_name = "bytes", default_value_t = 0)]
    global_read_burst_bytes: usize,

    /// Rate for data sent to each client, bytes per second (0 = unlimited)
    #[arg(long, value_name = "bytes/s", default_value_t = 0.0)]
    conn_write_rate_bytes: f64,

    /// Burst for the per-client client-bound rate (0 = same as rate)
    #[arg(long, value_name = "bytes", default_value_t = 0)]
    conn_write_burst_bytes: usize,

    /// Rate for data received from each client, bytes per second (0 = unlimited)
    #[arg(long, value_name = "bytes/s", default_value_t = 0.0)]
    conn_read_rate_bytes: f64,

    /// Burst for the per-client client-sent rate (0 = same as rate)
    #[arg(long, value_name = "bytes", default_value_t = 0)]
    conn_read_burst_bytes: usize,

    /// Size of a single proxied read or write; every limited burst must fit it
    #[arg(long, value_name = "bytes", default_value_t = 8 * 1024)]
    copy_chunk_bytes: usize,

    /// Timeout for a proxy connection
    #[arg(long, value_name = "ms", default_value_t = 0)]
    connection_duration_ms: u64,
}

type ConnId = String;

impl Config {
    fn global_limits(&self) -> (Quota, Quota) {
        (
            quota(self.global_write_rate_bytes, self.global_write_burst_bytes),
            quota(self.global_read_rate_bytes, self.global_read_burst_bytes),
        )
    }

    fn conn_limits(&self) -> (Quota, Quota) {
        (
            quota(self.conn_write_rate_bytes, self.conn_write_burst_bytes),
            quota(self.conn_read_rate_bytes, self.conn_read_burst_bytes),
        )
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.copy_chunk_bytes == 0 {
            anyhow::bail!("--copy-chunk-bytes must be greater than 0");
        }

        let (global_write, global_read) = self.global_limits();
        let (conn_write, conn_read) = self.conn_limits();
        for (name, quota) in [
            ("global write", global_write),
            ("global read", global_read),
            ("connection write", conn_write),
            ("connection read", conn_read),
        ] {
            if !fits_chunk(quota, self.copy_chunk_bytes) {
                anyhow::bail!(
                    "{name} burst of {} bytes is smaller than --copy-chunk-bytes {}",
                    quota.burst(),
                    self.copy_chunk_bytes
                );
            }
        }

        Ok(())
    }
}

fn quota(rate_bytes: f64, burst_bytes: usize) -> Quota {
    Quota::new(rate_bytes, Some(burst_bytes))
}

// a proxied chunk larger than the burst could never be admitted
fn fits_chunk(quota: Quota, chunk: usize) -> bool {
    quota.is_unlimited() || quota.burst() >= chunk
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
struct QuotaStatus {
    /// `None` when unlimited.
    rate_bytes: Option<f64>,
    burst_bytes: usize,
}

impl From<Quota> for QuotaStatus {
    fn from(quota: Quota) -> Self {
        Self {
            rate_bytes: (!quota.is_unlimited()).then(|| quota.rate()),
            burst_bytes: quota.burst(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
struct LimitsStatus {
    write: QuotaStatus,
    read: QuotaStatus,
}

impl From<(Quota, Quota)> for LimitsStatus {
    fn from((write, read): (Quota, Quota)) -> Self {
        Self {
            write: write.into(),
            read: read.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct AllLimitsStatus {
    global: LimitsStatus,
    connection: LimitsStatus,
}

#[derive(Debug, Clone, Serialize)]
struct ConnectionInfo {
    id: ConnId,
    downstream: SocketAddr,
    upstream: SocketAddr,
}

#[derive(Debug, Clone, Serialize)]
struct ConnectionStatus {
    conn_info: ConnectionInfo,
    /// Quotas the connection currently enforces; they trail the configured ones until
    /// the connection's next read or write.
    limits: LimitsStatus,
}

#[derive(Debug)]
struct ConnectionState {
    conn_info: ConnectionInfo,
    limiter: Arc<ConnectionLimiter>,
}

#[derive(Clone)]
struct ApiState {
    connections: Arc<DashMap<ConnId, ConnectionState, RandomState>>,
    limits: LimitsHandle,
    copy_chunk_bytes: usize,
}

impl ApiState {
    fn all(&self) -> Vec<ConnectionStatus> {
        self.connections
            .iter()
            .map(|c| ConnectionStatus {
                conn_info: c.conn_info.clone(),
                limits: LimitsStatus {
                    write: c.limiter.quota(Direction::Write).into(),
                    read: c.limiter.quota(Direction::Read).into(),
                },
            })
            .collect()
    }

    fn limits(&self) -> AllLimitsStatus {
        AllLimitsStatus {
            global: self.limits.global_limits().into(),
            connection: self.limits.conn_limits().into(),
        }
    }

    fn apply(
        &self,
        req: LimitsReq,
        (write, read): (Quota, Quota),
    ) -> Result<(Quota, Quota), ApiError> {
        let write = req.write.map_or(write, QuotaReq::quota);
        let read = req.read.map_or(read, QuotaReq::quota);

        for quota in [write, read] {
            if !fits_chunk(quota, self.copy_chunk_bytes) {
                return Err(ApiError::BurstTooSmall {
                    burst: quota.burst(),
                    chunk: self.copy_chunk_bytes,
                });
            }
        }

        Ok((write, read))
    }

    fn set_global_limits(&self, req: LimitsReq) -> Result<LimitsStatus, ApiError> {
        let (write, read) = self.apply(req, self.limits.global_limits())?;
        self.limits.set_global_limits(write, read);
        Ok((write, read).into())
    }

    fn set_conn_limits(&self, req: LimitsReq) -> Result<LimitsStatus, ApiError> {
        let (write, read) = self.apply(req, self.limits.conn_limits())?;
        self.limits.set_conn_limits(write, read);
        Ok((write, read).into())
    }
}

#[derive(Debug, ThisError)]
pub enum ApiError {
    #[error("burst of {burst} bytes is smaller than the proxy copy chunk of {chunk} bytes")]
    BurstTooSmall { burst: usize, chunk: usize },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            ApiError::BurstTooSmall { .. } => StatusCode::BAD_REQUEST,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

async fn list_connections(State(state): State<ApiState>) -> Json<Vec<ConnectionStatus>> {
    Json(state.all())
}

async fn get_limits(State(state): State<ApiState>) -> Json<AllLimitsStatus> {
    Json(state.limits())
}

async fn set_global_limits(
    State(state): State<ApiState>,
    Json(req): Json<LimitsReq>,
) -> Result<(StatusCode, Json<LimitsStatus>), ApiError> {
    let limits = state.set_global_limits(req)?;
    Ok((StatusCode::ACCEPTED, Json(limits)))
}

async fn set_conn_limits(
    State(state): State<ApiState>,
    Json(req): Json<LimitsReq>,
) -> Result<(StatusCode, Json<LimitsStatus>), ApiError> {
    let limits = state.set_conn_limits(req)?;
    Ok((StatusCode::ACCEPTED, Json(limits)))
}

/// A quota update; a `null` or missing rate means unlimited.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaReq {
    #[serde(default)]
    pub rate_bytes: Option<f64>,
    #[serde(default)]
    pub burst_bytes: Option<usize>,
}

impl QuotaReq {
    fn quota(self) -> Quota {
        match self.rate_bytes {
            Some(rate) => Quota::new(rate, self.burst_bytes),
            None => Quota::unlimited(),
        }
    }
}

/// Directions left out keep their current quota.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LimitsReq {
    #[serde(default)]
    pub write: Option<QuotaReq>,
    #[serde(default)]
    pub read: Option<QuotaReq>,
}

#[derive(Debug, ThisError)]
#[error("connection duration elapsed")]
pub struct TimeoutError;

async fn handle_connection(
    mut downstream: BandwidthConnection<TcpStream>,
    addr: SocketAddr,
    config: Arc<Config>,
    connections: Arc<DashMap<ConnId, ConnectionState, RandomState>>,
) {
    let mut upstream = match TcpStream::connect(config.upstream).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to connect upstream {}", config.upstream);
            return;
        }
    };

    // best effort
    _ = downstream.set_nodelay(true);
    _ = upstream.set_nodelay(true);

    info!("connected {addr} → {}", config.upstream);

    let id = nanoid!();

    connections.insert(
        id.clone(),
        ConnectionState {
            conn_info: ConnectionInfo {
                id: id.clone(),
                downstream: addr,
                upstream: config.upstream,
            },
            limiter: downstream.limiter().clone(),
        },
    );

    let span = tracing::info_span!("conn", %id, client=%addr, upstream=%config.upstream);
    async move {
        let chunk = config.copy_chunk_bytes;
        let fut = copy_bidirectional_with_sizes(&mut downstream, &mut upstream, chunk, chunk);

        let timeout_duration = if config.connection_duration_ms > 0 {
            Some(time::Duration::from_millis(config.connection_duration_ms))
        } else {
            None
        };

        let res: io::Result<(u64, u64)> = match timeout_duration {
            Some(timeout_duration) => match timeout(timeout_duration, fut).await {
                Ok(res) => res,
                Err(_) => Err(io::Error::other(TimeoutError)),
            },
            None => fut.await,
        };

        // clean up
        connections.remove(&id);

        match res {
            Ok((from_client, to_client)) => {
                info!(from_client, to_client, "proxy finished");
            }
            Err(err) if LimitError::from_io(&err).is_some_and(LimitError::is_cancelled) => {
                info!("proxy cancelled");
            }
            Err(err) => {
                error!(error = %err, "proxy error {} -> {}", addr, config.upstream);
            }
        }
    }
    .instrument(span)
    .await
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cfg = Config::parse();
    cfg.validate()?;

    let config = Arc::new(cfg);
    let shutdown = CancellationToken::new();

    // Proxy
    let listener = TcpListener::bind(config.listen)
        .await?
        .limit_bandwidth(shutdown.clone());
    let (write, read) = config.global_limits();
    listener.set_global_limits(write, read);
    let (write, read) = config.conn_limits();
    listener.set_conn_limits(write, read);

    let connections = Arc::new(DashMap::with_hasher(RandomState::new()));

    let api_state = ApiState {
        connections: connections.clone(),
        limits: listener.handle(),
        copy_chunk_bytes: config.copy_chunk_bytes,
    };

    let api_addr = config.api;
    let api_listener = TcpListener::bind(api_addr).await?;

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let app = Router::new()
                .route("/health", get(|| async { "ok" }))
                .route("/limits", get(get_limits))
                .route("/limits/global", patch(set_global_limits))
                .route("/limits/connection", patch(set_conn_limits))
                .route("/connections", get(list_connections))
                .with_state(api_state);

            if let Err(err) = axum::serve(api_listener, app)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
            {
                error!(%err, "api server error");
            }
        }
    });

    info!(
        listen = %config.listen,
        connect = %config.upstream,
        api = %api_addr,
        global = ?listener.global_limits(),
        connection = ?listener.conn_limits(),
        "Listening"
    );

    loop {
        tokio::select! {
            res = listener.accept() => match res {
                Ok((stream, addr)) => {
                    tokio::spawn(handle_connection(
                        stream,
                        addr,
                        config.clone(),
                        connections.clone(),
                    ));
                }
                Err(e) => {
                    error!(%e, "accept failed");
                }
            },
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                break;
            }
        }
    }

    shutdown.cancel();
    if !connections.is_empty() {
        warn!(active = connections.len(), "aborting bandwidth waits of active connections");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(args: &[&str]) -> Config {
        let base = ["bwlimit", "-l", "127.0.0.1:0", "-c", "127.0.0.1:1", "-a", "127.0.0.1:2"];
        Config::parse_from(base.into_iter().chain(args.iter().copied()))
    }

    fn api_state(chunk: usize) -> ApiState {
        let listener = tokio_bwlimit::BandwidthListener::new(CancellationToken::new(), ());
        ApiState {
            connections: Arc::default(),
            limits: listener.handle(),
            copy_chunk_bytes: chunk,
        }
    }

    #[test]
    fn defaults_are_unlimited() {
        let cfg = config(&[]);
        cfg.validate().unwrap();

        let unlimited = Quota::unlimited();
        assert_eq!(cfg.global_limits(), (unlimited, unlimited));
        assert_eq!(cfg.conn_limits(), (unlimited, unlimited));
    }

    #[test]
    fn burst_defaults_to_rate() {
        let cfg = config(&["--conn-read-rate-bytes", "16384"]);
        cfg.validate().unwrap();

        assert_eq!(cfg.conn_limits().1, Quota::new(16384.0, Some(16384)));
    }

    #[test]
    fn burst_smaller_than_copy_chunk_is_rejected() {
        let cfg = config(&[
            "--global-write-rate-bytes",
            "1024",
            "--copy-chunk-bytes",
            "4096",
        ]);
        let err = cfg.validate().unwrap_err();

        assert!(err.to_string().contains("global write burst"));
    }

    #[test]
    fn zero_copy_chunk_is_rejected() {
        assert!(config(&["--copy-chunk-bytes", "0"]).validate().is_err());
    }

    #[test]
    fn patch_keeps_missing_directions() {
        let state = api_state(10);
        state.limits.set_conn_limits(Quota::new(10.0, None), Quota::new(20.0, None));

        let req: LimitsReq =
            serde_json::from_str(r#"{ "read": { "rate_bytes": 40.0, "burst_bytes": 10 } }"#)
                .unwrap();
        let status = state.set_conn_limits(req).unwrap();

        assert_eq!(
            state.limits.conn_limits(),
            (Quota::new(10.0, None), Quota::new(40.0, Some(10)))
        );
        assert_eq!(status.read.rate_bytes, Some(40.0));
        assert_eq!(status.read.burst_bytes, 10);
    }

    #[test]
    fn patch_with_null_rate_removes_limit() {
        let state = api_state(10);
        state.limits.set_global_limits(Quota::new(10.0, None), Quota::unlimited());

        let req: LimitsReq =
            serde_json::from_str(r#"{ "write": { "rate_bytes": null } }"#).unwrap();
        let status = state.set_global_limits(req).unwrap();

        assert_eq!(state.limits.global_limits().0, Quota::unlimited());
        assert_eq!(status.write.rate_bytes, None);
    }

    #[test]
    fn patch_rejects_burst_below_copy_chunk() {
        let state = api_state(100);

        let req: LimitsReq =
            serde_json::from_str(r#"{ "write": { "rate_bytes": 50.0 } }"#).unwrap();
        let err = state.set_conn_limits(req).unwrap_err();

        assert!(matches!(err, ApiError::BurstTooSmall { burst: 50, chunk: 100 }));
        assert_eq!(state.limits.conn_limits().0, Quota::unlimited());
    }

    #[test]
    fn patch_rejects_unknown_fields() {
        assert!(serde_json::from_str::<LimitsReq>(r#"{ "both": {} }"#).is_err());
    }

    #[test]
    fn limits_serialize_unlimited_as_null() {
        let state = api_state(10);
        let json = serde_json::to_value(state.limits()).unwrap();

        assert_eq!(json["global"]["write"]["rate_bytes"], serde_json::Value::Null);
        assert_eq!(json["connection"]["read"]["burst_bytes"], 0);
    }

    #[tokio::test]
    async fn list_connections_reports_enforced_limits() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .limit_bandwidth(CancellationToken::new());
        listener.set_conn_limits(Quota::new(100.0, None), Quota::unlimited());
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (conn, peer) = listener.accept().await.unwrap();

        let state = ApiState {
            connections: Arc::default(),
            limits: listener.handle(),
            copy_chunk_bytes: 10,
        };
        let Json(empty) = list_connections(State(state.clone())).await;
        assert!(empty.is_empty());

        state.connections.insert(
            "a".into(),
            ConnectionState {
                conn_info: ConnectionInfo {
                    id: "a".into(),
                    downstream: peer,
                    upstream: addr,
                },
                limiter: conn.limiter().clone(),
            },
        );
        let Json(all) = list_connections(State(state)).await;

        assert_eq!(all.len(), 1);
        assert_eq!(all[0].conn_info.downstream, peer);
        assert_eq!(all[0].limits.write.rate_bytes, Some(100.0));
        assert_eq!(all[0].limits.read.rate_bytes, None);
    }
}
