//! Distributed storage in Redis.
//!
//! Each gate uses three keys sharing the `{name}` hash tag, so a Redis Cluster
//! routes them to one slot and a single script can act on all of them:
//!
//! - `{name}:frames`: list of frame values, index 0 is the current bucket
//! - `{name}:sum`: running window sum
//! - `{name}:head`: start of the current bucket (Unix ms)
//!
//! Every read-modify-write runs as one server-side Lua script; get-then-set
//! from the client would lose updates under concurrent callers.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{FromRedisValue, RedisError, RedisResult, Script, ScriptInvocation};
use tracing::{debug, info};

use super::{BackendKind, StorageBackend};
use crate::config::RemoteConfig;
use crate::error::{GateError, Result};
use crate::window::{
    Admission, Breach, BreachKind, Update, Verdict, WindowLayout, WindowState, MAX_MAGNITUDE,
};

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// A pre-built Redis client handle.
#[derive(Clone)]
pub enum RemoteClient {
    /// A single node.
    Single(redis::Client),
    /// A Redis Cluster.
    Cluster(ClusterClient),
}

impl fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteClient::Single(client) => f.debug_tuple("Single").field(client).finish(),
            RemoteClient::Cluster(_) => f.write_str("Cluster(..)"),
        }
    }
}

/// How to reach the store.
///
/// Exactly one of `client`, `url` or `cluster_nodes` must be set.
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    /// A pre-built client. Mutually exclusive with `url` and `cluster_nodes`.
    pub client: Option<RemoteClient>,
    /// Single-node connection URL, e.g. `redis://127.0.0.1:6379/0`.
    pub url: Option<String>,
    /// Seed node URLs of a cluster.
    pub cluster_nodes: Vec<String>,
    /// Upper bound on every call after construction.
    pub operation_timeout: Duration,
    /// Upper bound on connecting and the construction-time health check.
    pub connect_timeout: Duration,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            client: None,
            url: None,
            cluster_nodes: Vec::new(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl RemoteOptions {
    /// Use a pre-built client handle.
    pub fn with_client(client: RemoteClient) -> Self {
        Self {
            client: Some(client),
            ..Self::default()
        }
    }

    /// Connect to a single node.
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// Connect to a cluster through its seed nodes.
    pub fn cluster<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cluster_nodes: nodes.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Options described by a configuration file.
    pub fn from_config(config: &RemoteConfig) -> Self {
        Self {
            client: None,
            url: config.url.clone(),
            cluster_nodes: config.cluster_nodes.clone(),
            operation_timeout: Duration::from_millis(config.operation_timeout_ms),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
        }
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn into_client(self) -> Result<RemoteClient> {
        if self.operation_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err(GateError::Config(
                "redis timeouts must be positive".to_string(),
            ));
        }

        let has_raw = self.url.is_some() || !self.cluster_nodes.is_empty();
        match (self.client, self.url) {
            (Some(_), _) if has_raw => Err(GateError::Config(
                "a pre-built redis client can not be combined with connection parameters"
                    .to_string(),
            )),
            (Some(client), _) => Ok(client),
            (None, Some(_)) if !self.cluster_nodes.is_empty() => Err(GateError::Config(
                "redis url and cluster nodes are mutually exclusive".to_string(),
            )),
            (None, Some(url)) => redis::Client::open(url.as_str())
                .map(RemoteClient::Single)
                .map_err(|e| GateError::Config(format!("invalid redis url {:?}: {}", url, e))),
            (None, None) if !self.cluster_nodes.is_empty() => {
                ClusterClient::new(self.cluster_nodes.clone())
                    .map(RemoteClient::Cluster)
                    .map_err(|e| GateError::Config(format!("invalid redis cluster nodes: {}", e)))
            }
            (None, None) => Err(GateError::Config(
                "remote storage needs a client, a url or cluster nodes".to_string(),
            )),
        }
    }
}

/// Redis keys of one gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteKeys {
    pub frames: String,
    pub sum: String,
    pub head: String,
}

impl RemoteKeys {
    /// Keys for gate `name`, all carrying the `{name}` hash tag.
    pub fn new(name: &str) -> Result<Self> {
        if name.is_empty() || name.contains(['{', '}']) {
            return Err(GateError::Config(format!(
                "gate name {:?} can not be used as a redis hash tag",
                name
            )));
        }
        let tag = format!("{{{}}}", name);
        Ok(Self {
            frames: format!("{}:frames", tag),
            sum: format!("{}:sum", tag),
            head: format!("{}:head", tag),
        })
    }
}

#[derive(Clone)]
enum Connection {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

impl Connection {
    async fn open(client: RemoteClient) -> RedisResult<Self> {
        match client {
            RemoteClient::Single(client) => {
                Ok(Connection::Single(ConnectionManager::new(client).await?))
            }
            RemoteClient::Cluster(client) => {
                Ok(Connection::Cluster(client.get_async_connection().await?))
            }
        }
    }

    async fn invoke<T: FromRedisValue>(&mut self, invocation: &ScriptInvocation<'_>) -> RedisResult<T> {
        match self {
            Connection::Single(conn) => invocation.invoke_async(conn).await,
            Connection::Cluster(conn) => invocation.invoke_async(conn).await,
        }
    }

    async fn query<T: FromRedisValue>(&mut self, cmd: &redis::Cmd) -> RedisResult<T> {
        match self {
            Connection::Single(conn) => cmd.query_async(conn).await,
            Connection::Cluster(conn) => cmd.query_async(conn).await,
        }
    }

    fn is_cluster(&self) -> bool {
        matches!(self, Connection::Cluster(_))
    }
}

/// Window state in Redis, shared by processes on any host.
pub struct RemoteBackend {
    name: String,
    layout: WindowLayout,
    keys: RemoteKeys,
    connection: Connection,
    timeout: Duration,
    apply_script: Script,
    read_script: Script,
    restore_script: Script,
}

impl fmt::Debug for RemoteBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteBackend")
            .field("name", &self.name)
            .field("layout", &self.layout)
            .field("keys", &self.keys)
            .field("cluster", &self.connection.is_cluster())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RemoteBackend {
    /// Connect and check liveness with a `PING`.
    ///
    /// Every failure here is a configuration error: an unreachable store is
    /// reported at construction and never retried implicitly.
    pub async fn connect(name: &str, layout: WindowLayout, options: RemoteOptions) -> Result<Self> {
        let keys = RemoteKeys::new(name)?;
        let timeout = options.operation_timeout;
        let connect_timeout = options.connect_timeout;
        let client = options.into_client()?;

        let mut connection = tokio::time::timeout(connect_timeout, Connection::open(client))
            .await
            .map_err(|_| {
                GateError::Config(format!(
                    "timed out connecting to redis after {:?}",
                    connect_timeout
                ))
            })?
            .map_err(|e| GateError::Config(format!("failed to connect to redis: {}", e)))?;

        let pong: String = tokio::time::timeout(connect_timeout, connection.query(&redis::cmd("PING")))
            .await
            .map_err(|_| GateError::Config("redis health check timed out".to_string()))?
            .map_err(|e| GateError::Config(format!("redis health check failed: {}", e)))?;
        if pong != "PONG" {
            return Err(GateError::Config(format!(
                "unexpected redis health check reply: {}",
                pong
            )));
        }

        info!(
            gate = %name,
            cluster = connection.is_cluster(),
            operation_timeout = ?timeout,
            "Connected to redis"
        );

        Ok(Self {
            name: name.to_string(),
            layout,
            keys,
            connection,
            timeout,
            apply_script: Script::new(include_str!("lua/apply.lua")),
            read_script: Script::new(include_str!("lua/read.lua")),
            restore_script: Script::new(include_str!("lua/restore.lua")),
        })
    }

    /// The keys this gate lives under.
    pub fn keys(&self) -> &RemoteKeys {
        &self.keys
    }

    async fn bounded<T>(&self, op: &str, call: impl Future<Output = RedisResult<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(classify(op, e)),
            Err(_) => {
                debug!(gate = %self.name, op = op, "Redis call timed out");
                Err(GateError::Transient(format!(
                    "{} timed out after {:?}",
                    op, self.timeout
                )))
            }
        }
    }
}

#[async_trait]
impl StorageBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn layout(&self) -> &WindowLayout {
        &self.layout
    }

    async fn read(&self) -> Result<WindowState> {
        let mut invocation = self.read_script.prepare_invoke();
        invocation
            .key(&self.keys.frames)
            .key(&self.keys.sum)
            .key(&self.keys.head);

        let mut connection = self.connection.clone();
        let reply: Vec<i64> = self.bounded("read", connection.invoke(&invocation)).await?;
        parse_state(&reply, self.layout.frame_count())
    }

    async fn atomic_update(&self, update: &Update) -> Result<Verdict> {
        let mut invocation = self.apply_script.prepare_invoke();
        invocation
            .key(&self.keys.frames)
            .key(&self.keys.sum)
            .key(&self.keys.head)
            .arg(update.now_ms)
            .arg(update.amount)
            .arg(update.limits.frame)
            .arg(update.limits.window)
            .arg(update.floor.as_str())
            .arg(if update.commit { 1 } else { 0 })
            .arg(self.layout.frame_step_ms())
            .arg(self.layout.frame_count())
            .arg(self.layout.offset_ms())
            .arg(MAX_MAGNITUDE);

        let mut connection = self.connection.clone();
        let reply: Vec<i64> = self
            .bounded("atomic_update", connection.invoke(&invocation))
            .await?;
        parse_verdict(&reply)
    }

    async fn clear(&self) -> Result<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(&self.keys.frames)
            .arg(&self.keys.sum)
            .arg(&self.keys.head);

        let mut connection = self.connection.clone();
        let _: i64 = self.bounded("clear", connection.query(&cmd)).await?;
        Ok(())
    }

    async fn restore(&self, state: &WindowState) -> Result<()> {
        if state.values().len() != self.layout.frame_count() {
            return Err(GateError::Snapshot(format!(
                "expected {} frames, got {}",
                self.layout.frame_count(),
                state.values().len()
            )));
        }

        let head = state
            .head_millis()
            .map(|head| head.to_string())
            .unwrap_or_default();
        let mut invocation = self.restore_script.prepare_invoke();
        invocation
            .key(&self.keys.frames)
            .key(&self.keys.sum)
            .key(&self.keys.head)
            .arg(head)
            .arg(state.sum())
            .arg(state.values());

        let mut connection = self.connection.clone();
        let _: i64 = self.bounded("restore", connection.invoke(&invocation)).await?;
        Ok(())
    }
}

/// Network faults are transient; anything else the server says is not.
fn classify(op: &str, e: RedisError) -> GateError {
    if e.is_timeout()
        || e.is_io_error()
        || e.is_connection_dropped()
        || e.is_connection_refusal()
        || e.is_cluster_error()
    {
        GateError::Transient(format!("{} failed: {}", op, e))
    } else {
        GateError::Backend(format!("{} failed: {}", op, e))
    }
}

fn parse_verdict(reply: &[i64]) -> Result<Verdict> {
    let [admitted, frame_value, window_sum, rest @ ..] = reply else {
        return Err(GateError::Backend(format!(
            "malformed update reply: {:?}",
            reply
        )));
    };

    if *admitted == 1 {
        return Ok(Verdict::Admitted(Admission {
            frame_value: *frame_value,
            window_sum: *window_sum,
        }));
    }

    let breaches: Option<Vec<Breach>> = rest
        .chunks(4)
        .map(|chunk| match chunk {
            [kind, limit, current, amount] => BreachKind::from_code(*kind)
                .map(|kind| Breach::new(kind, *limit, *current, *amount)),
            _ => None,
        })
        .collect();

    match breaches {
        Some(breaches) if !breaches.is_empty() => Ok(Verdict::Rejected(breaches)),
        _ => Err(GateError::Backend(format!(
            "malformed rejection reply: {:?}",
            reply
        ))),
    }
}

fn parse_state(reply: &[i64], frame_count: usize) -> Result<WindowState> {
    let [has_head, head, sum, values @ ..] = reply else {
        return Err(GateError::Backend(format!(
            "malformed state reply: {:?}",
            reply
        )));
    };
    let head = (*has_head == 1).then_some(*head);
    Ok(WindowState::from_parts(head, values.to_vec(), *sum, frame_count))
}
