//! Authoritative counter store routed by key ownership.
//!
//! Every counter key has exactly one owner among the live nodes. Commands for
//! keys this node owns run against the local [`MemoryCounterStore`]; all
//! others are forwarded to the owner's internal counter endpoint.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use super::{Admission, CounterKey, MemoryCounterStore, WindowCounterStore};
use crate::error::StoreError;
use crate::mesh::{Cluster, Owner};

/// Path of the internal counter endpoint on every node.
pub const INTERNAL_COUNTERS_PATH: &str = "/v1/internal/counters";

/// Header carrying the cluster secret on forwarded commands.
pub const CLUSTER_SECRET_HEADER: &str = "x-hivelimit-cluster-secret";

/// Operation carried by a forwarded counter command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CounterOp {
    Increment,
    Admit,
    Get,
}

/// A counter command sent to the owning node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterCommand {
    pub op: CounterOp,
    pub key: CounterKey,
    #[serde(default)]
    pub reset_at: u64,
    #[serde(default)]
    pub cost: u64,
    #[serde(default)]
    pub limit: u64,
}

/// Reply to a [`CounterCommand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterReply {
    pub current: u64,
    pub admitted: bool,
}

impl CounterOp {
    /// Whether the operation changes counter state on the owner.
    pub fn mutates(&self) -> bool {
        !matches!(self, CounterOp::Get)
    }
}

impl CounterCommand {
    /// Run the command against a node-local store.
    pub fn apply(&self, store: &MemoryCounterStore) -> CounterReply {
        match self.op {
            CounterOp::Increment => CounterReply {
                current: store.increment_sync(&self.key, self.reset_at, self.cost),
                admitted: true,
            },
            CounterOp::Admit => {
                let admission = store.admit_sync(&self.key, self.reset_at, self.cost, self.limit);
                CounterReply {
                    current: admission.current,
                    admitted: admission.admitted,
                }
            }
            CounterOp::Get => CounterReply {
                current: store.get_sync(&self.key),
                admitted: true,
            },
        }
    }
}

/// Counter store that sends each key to its owning node.
#[derive(Debug)]
pub struct RoutedCounterStore {
    cluster: Arc<Cluster>,
    local: Arc<MemoryCounterStore>,
    client: reqwest::Client,
    secret: Option<String>,
}

impl RoutedCounterStore {
    pub fn new(
        cluster: Arc<Cluster>,
        local: Arc<MemoryCounterStore>,
        forward_timeout: Duration,
        secret: Option<String>,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(forward_timeout)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            cluster,
            local,
            client,
            secret,
        })
    }

    async fn execute(&self, command: CounterCommand) -> Result<CounterReply, StoreError> {
        match self.cluster.owner_of(&command.key.to_store_key()).await {
            Owner::Local => Ok(command.apply(&self.local)),
            Owner::Remote { node_id, http_addr } => {
                self.forward(&node_id, http_addr, &command).await
            }
        }
    }

    async fn forward(
        &self,
        node_id: &str,
        http_addr: SocketAddr,
        command: &CounterCommand,
    ) -> Result<CounterReply, StoreError> {
        trace!(key = %command.key, owner = %node_id, "Forwarding counter command");

        let url = format!("http://{}{}", http_addr, INTERNAL_COUNTERS_PATH);
        let mut request = self.client.post(&url).json(command);
        if let Some(secret) = &self.secret {
            request = request.header(CLUSTER_SECRET_HEADER, secret);
        }

        let response = request.send().await.map_err(|e| {
            warn!(owner = %node_id, error = %e, "Forwarding counter command failed");
            send_error(command.op, node_id, &e)
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Unavailable(format!(
                "owner {} answered {}",
                node_id, status
            )));
        }

        response.json::<CounterReply>().await.map_err(|e| {
            let message = format!("invalid reply from {}: {}", node_id, e);
            if command.op.mutates() {
                StoreError::Indeterminate(message)
            } else {
                StoreError::Unavailable(message)
            }
        })
    }
}

/// Classify a failed send. Only a refused connection proves the owner never
/// saw the command; any later failure may follow a committed mutation.
fn send_error(op: CounterOp, node_id: &str, err: &reqwest::Error) -> StoreError {
    if err.is_connect() || !op.mutates() {
        StoreError::Unavailable(format!("owner {} unreachable: {}", node_id, err))
    } else {
        StoreError::Indeterminate(format!("no reply from owner {}: {}", node_id, err))
    }
}

#[async_trait]
impl WindowCounterStore for RoutedCounterStore {
    async fn increment(
        &self,
        key: &CounterKey,
        reset_at: u64,
        cost: u64,
    ) -> Result<u64, StoreError> {
        let reply = self
            .execute(CounterCommand {
                op: CounterOp::Increment,
                key: key.clone(),
                reset_at,
                cost,
                limit: 0,
            })
            .await?;
        Ok(reply.current)
    }

    async fn admit(
        &self,
        key: &CounterKey,
        reset_at: u64,
        cost: u64,
        limit: u64,
    ) -> Result<Admission, StoreError> {
        let reply = self
            .execute(CounterCommand {
                op: CounterOp::Admit,
                key: key.clone(),
                reset_at,
                cost,
                limit,
            })
            .await?;
        Ok(Admission {
            current: reply.current,
            admitted: reply.admitted,
        })
    }

    async fn get(&self, key: &CounterKey) -> Result<u64, StoreError> {
        let reply = self
            .execute(CounterCommand {
                op: CounterOp::Get,
                key: key.clone(),
                reset_at: 0,
                cost: 0,
                limit: 0,
            })
            .await?;
        Ok(reply.current)
    }

    async fn purge_expired(&self) -> usize {
        self.local.purge_expired_sync()
    }
}
