use anyhow::{anyhow, Context, Result};
use axum::{
    extract::{Path, Query, State as AxumState},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::spawn_blocking,
    time::{interval, Duration},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wavetx::{
    clock::{CausalMessage, LamportClock},
    config::{parse_peers, NodeConfig},
    coordinator::{CommitCoordinator, PeerTransport},
    manager::ReplicaCallback,
    protocol::{
        decision_path, AckResponse, DecisionRequest, PrepareRequest, ReplicaApplyRequest,
        StartOutcome, StartRequest, VoteResponse,
    },
    types::{Decision, Key, TxId, Value, WriteSet},
    Node, TxError,
};

#[derive(Parser, Debug)]
#[command(name = "txnode")]
#[command(about = "Distributed transaction node using WaveTX", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a transaction node
    Run {
        /// Node ID (n1, n2, ...)
        #[arg(short, long, env = "NODE_ID")]
        id: String,

        /// HTTP listen address (e.g., 127.0.0.1:8001)
        #[arg(short, long)]
        addr: String,

        /// Peer base URLs (e.g., "http://127.0.0.1:8002,http://127.0.0.1:8003")
        #[arg(short, long, env = "PEERS", default_value = "")]
        peers: String,

        /// Event log file (default ./wal_<id>.log)
        #[arg(long)]
        wal: Option<PathBuf>,

        /// Disable the event log
        #[arg(long)]
        no_wal: bool,

        /// Per-peer timeout for prepare and decision calls
        #[arg(long, default_value_t = 3000)]
        prepare_timeout_ms: u64,

        /// How long a staged key waits for a decision before it is aborted
        #[arg(long, default_value_t = 30000)]
        staging_lease_ms: u64,

        /// TCP address accepting "<lamport_ts>|<payload>" lines
        #[arg(long)]
        tcp_addr: Option<String>,

        /// Push local commits to peers' /replica/apply
        #[arg(long)]
        replicate: bool,
    },
    /// Send a causally tagged message to TCP peers
    Send {
        /// Message payload
        #[arg(short, long)]
        message: String,

        /// Peer TCP addresses (e.g., "127.0.0.1:7897,127.0.0.1:7898")
        #[arg(short, long)]
        peers: String,
    },
}

struct AppState {
    node: Arc<Node>,
    coordinator: CommitCoordinator<HttpNetwork>,
}

struct HttpNetwork {
    client: reqwest::Client,
}

impl HttpNetwork {
    fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl PeerTransport for HttpNetwork {
    async fn prepare(&self, peer: &str, req: PrepareRequest) -> Result<VoteResponse> {
        let url = format!("{peer}/prepare");
        let resp = self
            .client
            .post(&url)
            .json(&req)
            .send()
            .await
            .context("Failed to send prepare request")?
            .error_for_status()?;
        resp.json::<VoteResponse>()
            .await
            .context("Failed to parse vote response")
    }

    async fn decide(
        &self,
        peer: &str,
        decision: Decision,
        req: DecisionRequest,
    ) -> Result<AckResponse> {
        let url = format!("{peer}{}", decision_path(decision));
        let resp = self
            .client
            .post(&url)
            .json(&req)
            .send()
            .await
            .with_context(|| format!("Failed to send {decision} request"))?
            .error_for_status()?;
        resp.json::<AckResponse>()
            .await
            .context("Failed to parse ack response")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            id,
            addr,
            peers,
            wal,
            no_wal,
            prepare_timeout_ms,
            staging_lease_ms,
            tcp_addr,
            replicate,
        } => {
            let mut config = NodeConfig::new(id.clone()).with_peers(parse_peers(&peers));
            config.prepare_timeout_ms = prepare_timeout_ms;
            config.staging_lease_ms = staging_lease_ms;
            if !no_wal {
                config = config.with_wal_path(wal.unwrap_or_else(|| NodeConfig::default_wal_path(&id)));
            }
            run_node(config, addr, tcp_addr, replicate).await?;
        }
        Commands::Send { message, peers } => {
            send_causal(&message, &peers).await?;
        }
    }

    Ok(())
}

async fn run_node(
    config: NodeConfig,
    addr: String,
    tcp_addr: Option<String>,
    replicate: bool,
) -> Result<()> {
    info!(
        "Starting node {} with peers {:?}",
        config.node_id, config.peers
    );

    let replica_callback = if replicate {
        Some(start_replica_fanout(config.peers.clone()))
    } else {
        None
    };
    let lease = config.staging_lease();
    let node = Arc::new(Node::new_with_replica(config, replica_callback)?);
    let coordinator = node.coordinator(Arc::new(HttpNetwork::new()));

    let state = Arc::new(AppState {
        node: node.clone(),
        coordinator,
    });

    let app = Router::new()
        .route("/tx/begin", post(handle_begin))
        .route("/tx/write", post(handle_write))
        .route("/tx/read", get(handle_read))
        .route("/tx/commit", post(handle_commit_tx))
        .route("/tx/abort", post(handle_abort_tx))
        .route("/debug/store", get(handle_debug_store))
        .route("/status", get(handle_status))
        .route("/state", get(handle_state))
        .route("/kv/{key}", get(handle_kv))
        .route("/start", post(handle_start))
        .route("/prepare", post(handle_prepare))
        .route("/commit", post(handle_commit))
        .route("/abort", post(handle_abort))
        .route("/replica/apply", post(handle_replica_apply))
        .with_state(state);

    // Sweep staged keys whose coordinator never came back
    let node_for_leases = node.clone();
    tokio::spawn(async move {
        let mut ticker = interval((lease / 2).max(Duration::from_millis(100)));
        loop {
            ticker.tick().await;
            let expired = node_for_leases.participant().expire_stale();
            if !expired.is_empty() {
                warn!("Expired staged transactions: {expired:?}");
            }
        }
    });

    if let Some(tcp_addr) = tcp_addr {
        let listener = TcpListener::bind(&tcp_addr)
            .await
            .with_context(|| format!("Failed to bind causal listener on {tcp_addr}"))?;
        info!("Causal message listener on {}", tcp_addr);
        tokio::spawn(serve_causal(listener, node.clone()));
    }

    let socket_addr: SocketAddr = addr.parse()?;
    info!("HTTP server listening on {}", socket_addr);
    axum::serve(TcpListener::bind(socket_addr).await?, app).await?;

    Ok(())
}

/// Replica callback feeding an async task that pushes commits to every peer.
fn start_replica_fanout(peers: Vec<String>) -> ReplicaCallback {
    let (tx, mut rx) = mpsc::unbounded_channel::<ReplicaApplyRequest>();
    tokio::spawn(async move {
        let client = reqwest::Client::new();
        while let Some(req) = rx.recv().await {
            for peer in &peers {
                let url = format!("{peer}/replica/apply");
                let result = client
                    .post(&url)
                    .json(&req)
                    .send()
                    .await
                    .and_then(|resp| resp.error_for_status());
                if let Err(e) = result {
                    warn!("Failed to replicate {} to {peer}: {e}", req.tx_id);
                }
            }
        }
    });

    Box::new(move |tx_id: &TxId, writes: &WriteSet, commit_ts: u64| {
        tx.send(ReplicaApplyRequest {
            tx_id: tx_id.clone(),
            writes: writes.clone(),
            commit_ts,
        })
        .map_err(|_| anyhow!("replica fan-out stopped"))
    })
}

async fn serve_causal(listener: TcpListener, node: Arc<Node>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("Causal listener accept failed: {e}");
                continue;
            }
        };
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_causal_conn(stream, &node).await {
                warn!("Causal connection from {peer} failed: {e:#}");
            }
        });
    }
}

async fn handle_causal_conn(stream: TcpStream, node: &Node) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let reply = match node.receive_causal(&line) {
            Ok(_) => "Message Delivered.\n",
            Err(e) => {
                warn!("{e}");
                "Malformed message.\n"
            }
        };
        writer.write_all(reply.as_bytes()).await?;
    }
    Ok(())
}

async fn send_causal(message: &str, peers: &str) -> Result<()> {
    let clock = LamportClock::new();
    for peer in parse_peers(peers) {
        let msg = CausalMessage::stamp(&clock, message);
        let mut stream = TcpStream::connect(&peer)
            .await
            .with_context(|| format!("Failed to connect to {peer}"))?;
        stream.write_all(format!("{msg}\n").as_bytes()).await?;

        let mut reply = String::new();
        BufReader::new(&mut stream).read_line(&mut reply).await?;
        info!("Sent {msg} to {peer}: {}", reply.trim_end());
    }
    Ok(())
}

/// Error body returned by the gateway routes
struct ApiError(StatusCode, String);

impl From<TxError> for ApiError {
    fn from(e: TxError) -> Self {
        let status = match &e {
            TxError::NoSuchTransaction(_) => StatusCode::NOT_FOUND,
            TxError::InvalidTransactionState { .. }
            | TxError::WaitDieAbort { .. }
            | TxError::UnsupportedLockUpgrade { .. }
            | TxError::StagingConflict { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({"status": "error", "error": self.1}))).into_response()
    }
}

/// Run a possibly blocking transaction manager call off the async workers.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, TxError> + Send + 'static,
{
    match spawn_blocking(f).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(join_err) => {
            error!("Transaction task panicked: {join_err}");
            Err(ApiError(
                StatusCode::INTERNAL_SERVER_ERROR,
                join_err.to_string(),
            ))
        }
    }
}

#[derive(Deserialize)]
struct TxRequest {
    tx_id: TxId,
}

#[derive(Deserialize)]
struct WriteRequest {
    tx_id: TxId,
    key: Key,
    value: Value,
}

#[derive(Deserialize)]
struct ReadQuery {
    tx_id: TxId,
    key: Key,
}

#[derive(Serialize)]
struct KeyValue {
    key: Key,
    value: Option<Value>,
}

async fn handle_begin(AxumState(state): AxumState<Arc<AppState>>) -> impl IntoResponse {
    let tx_id = state.node.manager().begin();
    Json(json!({ "tx_id": tx_id }))
}

async fn handle_write(
    AxumState(state): AxumState<Arc<AppState>>,
    Json(req): Json<WriteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let manager = state.node.manager().clone();
    blocking(move || manager.write(&req.tx_id, &req.key, req.value)).await?;
    Ok(Json(json!({"status": "ok"})))
}

async fn handle_read(
    AxumState(state): AxumState<Arc<AppState>>,
    Query(query): Query<ReadQuery>,
) -> Result<Json<KeyValue>, ApiError> {
    let manager = state.node.manager().clone();
    let key = query.key.clone();
    let value = blocking(move || manager.read(&query.tx_id, &query.key)).await?;
    Ok(Json(KeyValue { key, value }))
}

async fn handle_commit_tx(
    AxumState(state): AxumState<Arc<AppState>>,
    Json(req): Json<TxRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let manager = state.node.manager().clone();
    let commit_ts = blocking(move || manager.commit(&req.tx_id))
        .await
        .map_err(|ApiError(_, msg)| ApiError(StatusCode::CONFLICT, msg))?;
    Ok(Json(json!({"status": "committed", "commit_ts": commit_ts})))
}

async fn handle_abort_tx(
    AxumState(state): AxumState<Arc<AppState>>,
    Json(req): Json<TxRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let manager = state.node.manager().clone();
    blocking(move || manager.abort(&req.tx_id)).await?;
    Ok(Json(json!({"status": "aborted"})))
}

async fn handle_debug_store(
    AxumState(state): AxumState<Arc<AppState>>,
) -> Json<BTreeMap<Key, Value>> {
    Json(state.node.manager().dump_store())
}

async fn handle_status(AxumState(state): AxumState<Arc<AppState>>) -> impl IntoResponse {
    Json(state.node.status())
}

async fn handle_state(AxumState(state): AxumState<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.node.participant().snapshot();
    Json(json!({
        "node": snapshot.node,
        "lamport": snapshot.lamport,
        "store": snapshot.store,
        "locks": snapshot.locks,
        "staged": snapshot.staged,
        "tx": snapshot.tx,
        "peers": state.node.config().peers,
    }))
}

async fn handle_kv(
    AxumState(state): AxumState<Arc<AppState>>,
    Path(key): Path<Key>,
) -> Json<KeyValue> {
    let value = state.node.manager().get(&key);
    Json(KeyValue { key, value })
}

async fn handle_start(
    AxumState(state): AxumState<Arc<AppState>>,
    Json(req): Json<StartRequest>,
) -> Json<StartOutcome> {
    let tx_id = req
        .tx_id
        .unwrap_or_else(|| state.coordinator.mint_tx_id());
    info!("Starting 2PC round {tx_id} for {}", req.key);
    Json(state.coordinator.start(&tx_id, &req.key, &req.value).await)
}

async fn handle_prepare(
    AxumState(state): AxumState<Arc<AppState>>,
    Json(req): Json<PrepareRequest>,
) -> Json<VoteResponse> {
    Json(state.node.participant().handle_prepare(req))
}

async fn handle_commit(
    AxumState(state): AxumState<Arc<AppState>>,
    Json(req): Json<DecisionRequest>,
) -> Json<AckResponse> {
    Json(state.node.participant().handle_commit(req))
}

async fn handle_abort(
    AxumState(state): AxumState<Arc<AppState>>,
    Json(req): Json<DecisionRequest>,
) -> Json<AckResponse> {
    Json(state.node.participant().handle_abort(req))
}

async fn handle_replica_apply(
    AxumState(state): AxumState<Arc<AppState>>,
    Json(req): Json<ReplicaApplyRequest>,
) -> Json<AckResponse> {
    let lamport_ts = state
        .node
        .manager()
        .apply_replica_commit(&req.tx_id, &req.writes, req.commit_ts);
    Json(AckResponse {
        ok: true,
        node: state.node.id().to_string(),
        lamport_ts,
    })
}
