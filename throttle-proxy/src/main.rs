use std::{error::Error, fmt, io, net::SocketAddr, sync::Arc, time};

use ahash::RandomState;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
};
use clap::Parser;
use dashmap::DashMap;
use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use tokio::{
    io::copy_bidirectional,
    net::{TcpListener, TcpStream},
    signal,
    sync::oneshot,
    time::timeout,
};
use tokio_throttle::{
    hierarchy::{DEFAULT_FAN_OUT, Hierarchy},
    io::ResetLinger,
    listener::{Shaper, ThrottledListener},
    stream::ThrottledStream,
    utils::meter::{Meter, MeteredStream},
};

use tracing::{Instrument, error, info};

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

    /// Aggregate bandwidth limit for all connections in bytes per second (0 = unlimited)
    #[arg(long, value_name = "bytes/s", default_value_t = 0)]
    rate_bytes: u64,

    /// Bandwidth limit for each connection in bytes per second (0 = unlimited)
    #[arg(long, value_name = "bytes/s", default_value_t = 0)]
    conn_rate_bytes: u64,

    /// Number of connections expected to share the aggregate limit; caps a single request
    #[arg(long, value_name = "n", default_value_t = DEFAULT_FAN_OUT)]
    fan_out: u64,

    /// Timeout for a proxy connection
    #[arg(long, value_name = "ms", default_value_t = 0)]
    connection_duration_ms: u64,
}

type ConnId = String;

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if self.fan_out == 0 {
            anyhow::bail!("--fan-out must be at least 1");
        }

        Ok(())
    }
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
    rate_bytes: u64,
    transferred_bytes: u64,
    measured_rate_bps: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
struct ListenerStatus {
    rate_bytes: u64,
    conn_rate_bytes: u64,
    fan_out: u64,
    connections: usize,
}

#[derive(Debug)]
struct ConnectionState {
    conn_info: ConnectionInfo,

    hierarchy: Arc<Hierarchy>,
    meter: Arc<Meter>,
    tx: oneshot::Sender<Box<dyn Error + Send + Sync>>,
}

#[derive(Clone, Default)]
struct ApiState {
    connections: Arc<DashMap<ConnId, ConnectionState, RandomState>>,
    shaper: Arc<Shaper>,
}

impl ApiState {
    fn all(&self) -> Vec<ConnectionStatus> {
        self.connections
            .iter()
            .map(|c| ConnectionStatus {
                conn_info: c.conn_info.clone(),
                rate_bytes: c.hierarchy.leaf().capacity(),
                transferred_bytes: c.meter.total(),
                measured_rate_bps: c.meter.rate_bps(),
            })
            .collect()
    }

    fn listener(&self) -> ListenerStatus {
        ListenerStatus {
            rate_bytes: self.shaper.capacity(),
            conn_rate_bytes: self.shaper.conn_capacity(),
            fan_out: self.shaper.fan_out(),
            connections: self.connections.len(),
        }
    }

    fn remove_connection(&self, id: &str) -> Result<ConnectionState, ApiError> {
        self.connections
            .remove(id)
            .ok_or(ApiError::NotFound)
            .map(|c| c.1)
    }

    fn remove_all(&self) -> Vec<ConnectionState> {
        let ids: Vec<ConnId> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        ids.into_iter()
            .filter_map(|id| self.connections.remove(&id).map(|(_, state)| state))
            .collect()
    }

    fn set_throttle_rate(&self, id: &str, rate: u64) -> Result<(), ApiError> {
        let conn = self.connections.get(id).ok_or(ApiError::NotFound)?;
        conn.hierarchy.set_capacity(rate);
        Ok(())
    }

    fn set_listener_rate(&self, rate: u64) {
        self.shaper.set_capacity(rate);
    }

    fn set_conn_rate(&self, rate: u64) {
        self.shaper.set_conn_capacity(rate);
    }
}

#[derive(Debug, ThisError)]
pub enum ApiError {
    #[error("connection not found")]
    NotFound,
    #[error("internal error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

async fn list_connections(
    State(state): State<ApiState>,
) -> Result<Json<Vec<ConnectionStatus>>, ApiError> {
    Ok(Json(state.all()))
}

async fn get_listener(State(state): State<ApiState>) -> Json<ListenerStatus> {
    Json(state.listener())
}

async fn set_listener_throttle(
    State(state): State<ApiState>,
    Json(req): Json<ThrottleReq>,
) -> StatusCode {
    state.set_listener_rate(req.rate_bytes);
    StatusCode::ACCEPTED
}

async fn set_conn_throttle(
    State(state): State<ApiState>,
    Json(req): Json<ThrottleReq>,
) -> StatusCode {
    state.set_conn_rate(req.rate_bytes);
    StatusCode::ACCEPTED
}

async fn set_throttle(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<ThrottleReq>,
) -> Result<StatusCode, ApiError> {
    state.set_throttle_rate(&id, req.rate_bytes)?;
    Ok(StatusCode::ACCEPTED)
}

async fn shutdown_connection(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<ShutdownReq>,
) -> Result<StatusCode, ApiError> {
    let conn = state.remove_connection(&id)?;
    conn.tx
        .send(Box::new(io::Error::other(req.reason)))
        .map_err(|_| ApiError::Internal)?;

    Ok(StatusCode::ACCEPTED)
}

async fn shutdown_all_connections(
    State(state): State<ApiState>,
    Json(req): Json<ShutdownReq>,
) -> Result<StatusCode, ApiError> {
    let connections = state.remove_all();
    let mut send_failed = false;

    for conn in connections {
        if conn
            .tx
            .send(Box::new(io::Error::other(req.reason.clone())))
            .is_err()
        {
            send_failed = true;
        }
    }

    if send_failed {
        Err(ApiError::Internal)
    } else {
        Ok(StatusCode::ACCEPTED)
    }
}

fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/listener", get(get_listener))
        .route("/listener/throttle", patch(set_listener_throttle))
        .route("/listener/conn-throttle", patch(set_conn_throttle))
        .route("/connections", get(list_connections))
        .route("/connections/{id}/shutdown", post(shutdown_connection))
        .route("/connections/{id}/throttle", patch(set_throttle))
        .route("/connections/_all/shutdown", post(shutdown_all_connections))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShutdownReq {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThrottleReq {
    pub rate_bytes: u64,
}

async fn handle_connection(
    downstream: ThrottledStream<TcpStream>,
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
    _ = downstream.get_ref().set_nodelay(true);
    _ = upstream.set_nodelay(true);

    info!("connected {addr} → {}", config.upstream);

    let (tx, mut rx) = oneshot::channel::<Box<dyn Error + Send + Sync>>();
    let hierarchy = downstream.hierarchy().clone();
    let meter = Arc::new(Meter::new());

    // Both directions pass through the downstream side, so they share one budget.
    let mut downstream = MeteredStream::new(downstream, meter.clone());

    let id = nanoid!();

    connections.insert(
        id.clone(),
        ConnectionState {
            conn_info: ConnectionInfo {
                id: id.clone(),
                downstream: addr,
                upstream: config.upstream,
            },
            hierarchy,
            meter: meter.clone(),
            tx,
        },
    );

    let span = tracing::info_span!("conn", %id, client=%addr, upstream=%config.upstream);
    async move {
        let fut = async {
            tokio::select! {
                res = copy_bidirectional(&mut downstream, &mut upstream) => res,
                reason = &mut rx => match reason {
                    Ok(reason) => Err(io::Error::other(reason)),
                    Err(_) => Err(io::Error::other("connection removed")),
                },
            }
        };

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
            Ok((to_upstream, to_downstream)) => info!(
                to_upstream,
                to_downstream,
                rate_bps = meter.rate_bps().unwrap_or_default(),
                "closed"
            ),
            Err(err) => {
                error!(error = %err, "proxy error {} -> {}", addr, config.upstream);

                if let Some(e) = err.get_ref()
                    && e.downcast_ref::<TimeoutError>().is_some()
                {
                    // best effort
                    _ = downstream.set_reset_linger();
                    _ = upstream.set_reset_linger();
                }
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

    let shaper = Arc::new(Shaper::with_fan_out(
        config.rate_bytes,
        config.conn_rate_bytes,
        config.fan_out,
    ));
    let connections = Arc::new(DashMap::with_hasher(RandomState::new()));

    let api_state = ApiState {
        connections: connections.clone(),
        shaper: shaper.clone(),
    };

    let api_addr = config.api;
    let api_listener = TcpListener::bind(api_addr).await?;

    tokio::spawn(async move {
        if let Err(err) = axum::serve(api_listener, router(api_state)).await {
            error!(%err, "api server error");
        }
    });

    // Proxy
    let mut listener = ThrottledListener::with_shaper(TcpListener::bind(config.listen).await?, shaper);
    info!(
        listen = %config.listen,
        connect = %config.upstream,
        api = %api_addr,
        rate_bytes = config.rate_bytes,
        conn_rate_bytes = config.conn_rate_bytes,
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

    Ok(())
}

#[derive(Debug)]
pub struct TimeoutError;

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimeoutError")
    }
}

impl Error for TimeoutError {}
