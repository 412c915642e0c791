use std::fmt;

use deadpool::managed::{BuildError, PoolError};
use deadpool_redis::cluster::{
    Config as ClusterConfig, Connection as ClusterConnection, Pool as ClusterPool,
};
use deadpool_redis::redis::aio::ConnectionLike;
use deadpool_redis::redis::{Cmd, Pipeline, RedisFuture, Value};
use deadpool_redis::{
    Config as NodeConfig, ConfigError, Connection as NodeConnection, Pool as NodePool,
};
use thiserror::Error;

use crate::config::{RedisConfig, RedisConfigOptions};

pub use deadpool_redis::redis;

/// Failures of the pooled Redis client.
#[derive(Debug, Error)]
pub enum RedisError {
    /// A command failed or the server could not be reached.
    #[error("redis command failed: {0}")]
    Redis(#[source] redis::RedisError),

    /// No connection could be taken from the pool.
    #[error("could not get a redis connection: {0}")]
    Pool(#[source] PoolError<redis::RedisError>),

    /// The pool could not be built.
    #[error("could not build the redis pool: {0}")]
    CreatePool(#[from] BuildError),

    /// The connection url is invalid.
    #[error("invalid redis connection settings: {0}")]
    ConfigError(#[from] ConfigError),
}

/// Pool of connections to a single Redis node or to a cluster.
///
/// Clones share the same connections.
#[derive(Clone)]
pub enum AsyncRedisPool {
    /// Connections to a cluster, routed by key slot.
    Cluster(ClusterPool),
    /// Connections to a single node.
    Single(NodePool),
}

impl AsyncRedisPool {
    /// Builds the pool described by `config`.
    ///
    /// Connections are opened lazily, so this does not contact the server.
    pub fn from_config(config: &RedisConfig) -> Result<Self, RedisError> {
        match config {
            RedisConfig::Cluster {
                cluster_nodes,
                options,
            } => Self::cluster(cluster_nodes, options),
            RedisConfig::Single(server) => Self::single(server, &RedisConfigOptions::default()),
            RedisConfig::SingleWithOpts { server, options } => Self::single(server, options),
        }
    }

    fn cluster(nodes: &[String], options: &RedisConfigOptions) -> Result<Self, RedisError> {
        let pool = ClusterConfig::from_urls(nodes.to_vec())
            .builder()?
            .max_size(options.max_connections as usize)
            .build()?;
        Ok(Self::Cluster(pool))
    }

    fn single(server: &str, options: &RedisConfigOptions) -> Result<Self, RedisError> {
        let pool = NodeConfig::from_url(server)
            .builder()?
            .max_size(options.max_connections as usize)
            .build()?;
        Ok(Self::Single(pool))
    }

    /// Takes a connection from the pool, waiting for one to become available.
    ///
    /// The connection goes back to the pool when dropped.
    pub async fn get_connection(&self) -> Result<AsyncRedisConnection, RedisError> {
        let connection = match self {
            Self::Cluster(pool) => pool.get().await.map(AsyncRedisConnection::Cluster),
            Self::Single(pool) => pool.get().await.map(AsyncRedisConnection::Single),
        };
        connection.map_err(RedisError::Pool)
    }
}

impl fmt::Debug for AsyncRedisPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cluster(_) => f.write_str("AsyncRedisPool::Cluster"),
            Self::Single(_) => f.write_str("AsyncRedisPool::Single"),
        }
    }
}

/// A pooled connection, usable with any async `redis` command.
pub enum AsyncRedisConnection {
    /// A cluster connection.
    Cluster(ClusterConnection),
    /// A connection to a single node.
    Single(NodeConnection),
}

impl fmt::Debug for AsyncRedisConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cluster(_) => f.write_str("AsyncRedisConnection::Cluster"),
            Self::Single(_) => f.write_str("AsyncRedisConnection::Single"),
        }
    }
}

macro_rules! with_connection {
    ($self:ident, $conn:ident => $body:expr) => {
        match $self {
            Self::Cluster($conn) => $body,
            Self::Single($conn) => $body,
        }
    };
}

impl ConnectionLike for AsyncRedisConnection {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        with_connection!(self, conn => conn.req_packed_command(cmd))
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        pipeline: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        with_connection!(self, conn => conn.req_packed_commands(pipeline, offset, count))
    }

    fn get_db(&self) -> i64 {
        with_connection!(self, conn => conn.get_db())
    }
}
