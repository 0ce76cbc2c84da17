//! Sketched `Election` backend over etcd's native lease + transaction
//! primitives. Treated as an "external collaborator with a specified
//! interface only" per spec §1 — thinner than the Redis reference backend
//! (no watch-based fast path on contention), but functional: it grants a
//! real etcd lease and keeps it alive via `etcd-client`'s own keep-alive
//! stream, mirroring the original's `concurrency.Session` /
//! `concurrency.Mutex` pair (`examples/original_source/pkg/plugins/election/etcd.go`),
//! which is why `keep_alive` here is a no-op: etcd's client renews the
//! lease in the background once granted, same as the original's comment
//! `// nothing, etcd concurrency will keep alive`.

use std::{sync::atomic::{AtomicBool, AtomicI64, Ordering}, time::Duration};

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, LeaseKeepAliveStream, LeaseKeeper, Txn, TxnOp};
use tokio::{sync::Mutex, task::JoinHandle, time::timeout};

use super::{Election, ElectionError, Settings};

pub struct EtcdElection {
    settings: Settings,
    client: Mutex<Client>,
    lease_id: AtomicI64,
    renew_task: Mutex<Option<JoinHandle<()>>>,
    is_leader: AtomicBool,
}

impl EtcdElection {
    pub async fn connect(settings: Settings, endpoints: &[String]) -> Result<Self, ElectionError> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| ElectionError::BackendUnavailable(e.to_string()))?;
        Ok(Self {
            settings,
            client: Mutex::new(client),
            lease_id: AtomicI64::new(0),
            renew_task: Mutex::new(None),
            is_leader: AtomicBool::new(false),
        })
    }

    async fn spawn_renewal(&self, keeper: LeaseKeeper, stream: LeaseKeepAliveStream, period: Duration) {
        let handle = tokio::spawn(async move {
            let mut keeper = keeper;
            let mut stream = stream;
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if keeper.keep_alive().await.is_err() {
                    break;
                }
                if stream.message().await.is_err() {
                    break;
                }
            }
        });
        *self.renew_task.lock().await = Some(handle);
    }
}

#[async_trait]
impl Election for EtcdElection {
    #[tracing::instrument(skip(self))]
    async fn start_leading(&self, deadline: Duration) -> Result<(), ElectionError> {
        let fut = async {
            let ttl_secs = self.settings.ttl.as_secs() as i64;
            let mut client = self.client.lock().await;
            let lease = client
                .lease_grant(ttl_secs, None)
                .await
                .map_err(|e| ElectionError::BackendUnavailable(e.to_string()))?;
            let lease_id = lease.id();

            let txn = Txn::new()
                .when(vec![Compare::create_revision(
                    self.settings.key.as_bytes(),
                    CompareOp::Equal,
                    0,
                )])
                .and_then(vec![TxnOp::put(
                    self.settings.key.as_bytes(),
                    self.settings.identity.as_bytes(),
                    Some(etcd_client::PutOptions::new().with_lease(lease_id)),
                )]);
            let resp = client
                .txn(txn)
                .await
                .map_err(|e| ElectionError::BackendUnavailable(e.to_string()))?;

            if !resp.succeeded() {
                let _ = client.lease_revoke(lease_id).await;
                return Err(ElectionError::NotLeader);
            }

            let (keeper, stream) = client
                .lease_keep_alive(lease_id)
                .await
                .map_err(|e| ElectionError::BackendUnavailable(e.to_string()))?;
            drop(client);
            self.lease_id.store(lease_id, Ordering::SeqCst);
            self.spawn_renewal(keeper, stream, self.settings.heartbeat).await;
            Ok(())
        };

        let result = timeout(deadline, fut)
            .await
            .map_err(|_| ElectionError::BackendUnavailable("etcd acquire timed out".into()))?;
        if result.is_ok() {
            self.is_leader.store(true, Ordering::SeqCst);
        }
        result
    }

    #[tracing::instrument(skip(self))]
    async fn release(&self, deadline: Duration) -> Result<(), ElectionError> {
        if !self.is_leader.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(task) = self.renew_task.lock().await.take() {
            task.abort();
        }
        let lease_id = self.lease_id.swap(0, Ordering::SeqCst);
        let mut client = self.client.lock().await;
        timeout(deadline, client.lease_revoke(lease_id))
            .await
            .map_err(|_| ElectionError::BackendUnavailable("etcd release timed out".into()))?
            .map_err(|e| ElectionError::BackendUnavailable(e.to_string()))?;
        Ok(())
    }

    fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    async fn keep_alive(&self, _deadline: Duration) -> Result<(), ElectionError> {
        // the lease renewal task spawned in `start_leading` keeps the
        // lease alive; nothing to do here.
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
pub struct EtcdConfig {
    #[arg(long = "etcd-endpoints", env = "ETCD_ENDPOINTS", value_delimiter = ',')]
    pub endpoints: Vec<String>,

    #[arg(long = "etcd-key", env = "ETCD_KEY", default_value = "/p8s-df-adapter-lock")]
    pub key: String,

    #[arg(long = "etcd-heartbeat", env = "ETCD_HEARTBEAT", default_value = "15s", value_parser = crate::config::parse_duration)]
    pub heartbeat: Duration,

    #[arg(long = "etcd-retry-period", env = "ETCD_RETRY_PERIOD", default_value = "10s", value_parser = crate::config::parse_duration)]
    pub retry_period: Duration,
}
