//! Reference `Election` backend, implemented against Redis.
//!
//! Grounded on `examples/original_source/pkg/plugins/election/redis.go`
//! (`SET key identity NX EX ttl` / `EXPIRE key ttl` / `DEL key`), with one
//! correctness fix noted in `DESIGN.md`: `release` is a compare-and-delete
//! keyed on `identity`, so a replica whose lock already expired and was
//! re-acquired by another identity can never delete the new holder's lock
//! (the spec's second Open Question).

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use redis::{aio::ConnectionManager, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, Script};
use tokio::time::timeout;

use super::{Election, ElectionError, Settings};

/// `if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('del', KEYS[1]) else return 0 end`
const RELEASE_SCRIPT: &str = r"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
";

pub struct RedisElection {
    settings: Settings,
    manager: ConnectionManager,
    release_script: Script,
    is_leader: AtomicBool,
}

impl RedisElection {
    pub async fn connect(
        settings: Settings,
        addr: &str,
        password: Option<String>,
    ) -> Result<Self, ElectionError> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| ElectionError::BackendUnavailable(format!("invalid redis addr {addr}")))?;
        let port: u16 = port
            .parse()
            .map_err(|_| ElectionError::BackendUnavailable(format!("invalid redis port in {addr}")))?;
        let info = ConnectionInfo {
            addr: ConnectionAddr::Tcp(host.to_string(), port),
            redis: RedisConnectionInfo {
                password,
                ..Default::default()
            },
        };
        let client = redis::Client::open(info)
            .map_err(|e| ElectionError::BackendUnavailable(e.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| ElectionError::BackendUnavailable(e.to_string()))?;
        Ok(Self {
            settings,
            manager,
            release_script: Script::new(RELEASE_SCRIPT),
            is_leader: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Election for RedisElection {
    #[tracing::instrument(skip(self))]
    async fn start_leading(&self, deadline: Duration) -> Result<(), ElectionError> {
        let ttl_secs = self.settings.ttl.as_secs().max(1);
        let mut conn = self.manager.clone();
        let result: Option<String> = timeout(
            deadline,
            redis::cmd("SET")
                .arg(&self.settings.key)
                .arg(&self.settings.identity)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs)
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| ElectionError::BackendUnavailable("redis SET timed out".into()))?
        .map_err(|e| ElectionError::BackendUnavailable(e.to_string()))?;

        if result.is_some() {
            self.is_leader.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(ElectionError::NotLeader)
        }
    }

    #[tracing::instrument(skip(self))]
    async fn release(&self, deadline: Duration) -> Result<(), ElectionError> {
        if !self.is_leader.load(Ordering::SeqCst) {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let result = timeout(
            deadline,
            self.release_script
                .key(&self.settings.key)
                .arg(&self.settings.identity)
                .invoke_async::<_, i64>(&mut conn),
        )
        .await;
        // the local flag is cleared regardless of RPC outcome, per spec §4.1.
        self.is_leader.store(false, Ordering::SeqCst);
        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ElectionError::BackendUnavailable(e.to_string())),
            Err(_) => Err(ElectionError::BackendUnavailable("redis release timed out".into())),
        }
    }

    fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    #[tracing::instrument(skip(self))]
    async fn keep_alive(&self, deadline: Duration) -> Result<(), ElectionError> {
        let ttl_secs = self.settings.ttl.as_secs().max(1);
        let mut conn = self.manager.clone();
        let renewed: bool = timeout(
            deadline,
            redis::cmd("EXPIRE")
                .arg(&self.settings.key)
                .arg(ttl_secs)
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| ElectionError::BackendUnavailable("redis EXPIRE timed out".into()))?
        .map_err(|e| ElectionError::BackendUnavailable(e.to_string()))?;

        if !renewed {
            // key vanished (TTL elapsed before we renewed it) — we lost the lock.
            self.is_leader.store(false, Ordering::SeqCst);
            return Err(ElectionError::NotLeader);
        }
        Ok(())
    }

    fn heartbeat(&self) -> Duration {
        self.settings.heartbeat
    }

    fn retry_period(&self) -> Duration {
        self.settings.retry_period
    }
}

#[derive(Debug, Clone, clap::Args)]
pub struct RedisConfig {
    #[arg(long = "redis-addr", env = "REDIS_ADDR", default_value = "127.0.0.1:6379")]
    pub addr: String,

    #[arg(long = "redis-passwd", env = "REDIS_PASSWD", default_value = "")]
    pub password: String,

    #[arg(long = "redis-key", env = "REDIS_KEY", default_value = "p8s-df-adapter-lock")]
    pub key: String,

    #[arg(long = "redis-heartbeat", env = "REDIS_HEARTBEAT", default_value = "15s", value_parser = crate::config::parse_duration)]
    pub heartbeat: Duration,

    #[arg(long = "redis-retry-period", env = "REDIS_RETRY_PERIOD", default_value = "10s", value_parser = crate::config::parse_duration)]
    pub retry_period: Duration,
}
