//! Client side: build and sign requests, find the primary, submit.
//!
//! Replicas are probed with `CheckLeader` in a fixed order `0..n`. The first
//! replica answering positively receives the request on the same connection,
//! and nobody else does. The index of the last replica that accepted a request
//! is cached and probed first next time; a negative probe, a rejection or any
//! failure drops the cache and the next attempt falls back to the full scan.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use pbft_rpc::{Connection, Rejected, Request, RequestInner, TYPE_REQUEST};
use tokio::time::sleep;

use crate::{
    crypto::{digest, Signer, SigningError},
    ClusterConfig,
};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport failure with replica {replica}: {error:#}")]
    Transport { replica: usize, error: crate::Error },
    #[error("replica {replica} rejected the request: {reason}")]
    Rejected { replica: usize, reason: String },
    #[error("no replica claims to be primary")]
    NoPrimary,
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error("giving up after {attempts} attempt(s): {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<ClientError>,
    },
}

impl ClientError {
    /// Whether probing again from the start may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Rejected { .. } | Self::NoPrimary
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per request including the first one. `1` fails fast.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Pause after the `attempt`-th failure, doubling each time.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[async_trait::async_trait]
pub trait Connect
where
    Self: Send + Sync,
{
    type Connection: ReplicaConnection;

    async fn connect(&self, replica: usize) -> crate::Result<Self::Connection>;
}

#[async_trait::async_trait]
pub trait ReplicaConnection
where
    Self: Send + Sized,
{
    async fn check_leader(&mut self) -> crate::Result<bool>;

    async fn new_txn_request(&mut self, request: Request)
        -> crate::Result<Result<Vec<u8>, Rejected>>;

    async fn close(self) -> crate::Result<()>;
}

/// Dials replicas' RPC ports as listed in the cluster config.
#[derive(Debug, Clone)]
pub struct TcpConnector(pub Arc<ClusterConfig>);

#[async_trait::async_trait]
impl Connect for TcpConnector {
    type Connection = Connection;

    async fn connect(&self, replica: usize) -> crate::Result<Connection> {
        Connection::connect(self.0.rpc_addr(replica)).await
    }
}

#[async_trait::async_trait]
impl ReplicaConnection for Connection {
    async fn check_leader(&mut self) -> crate::Result<bool> {
        Connection::check_leader(self).await
    }

    async fn new_txn_request(
        &mut self,
        request: Request,
    ) -> crate::Result<Result<Vec<u8>, Rejected>> {
        Ok(Connection::new_txn_request(self, request)
            .await?
            .map(|reply| reply.msg))
    }

    async fn close(self) -> crate::Result<()> {
        Connection::close(self).await
    }
}

/// One accepted request.
#[derive(Debug, Clone)]
pub struct Submission {
    pub request_num: u32,
    pub request: Request,
    pub replica: usize,
    pub reply: Vec<u8>,
}

#[derive(Debug)]
pub struct Client<C> {
    id: i32,
    num_replica: usize,
    connector: C,
    signer: Option<Signer>,
    allow_unsigned: bool,
    retry: RetryPolicy,
    leader: Option<usize>,
    request_num: u32,
    last_timestamp: i64,
}

impl<C> Client<C> {
    pub fn new(config: &ClusterConfig, connector: C, signer: Option<Signer>) -> Self {
        Self {
            id: config.client_index() as _,
            num_replica: config.num_replica(),
            connector,
            signer,
            allow_unsigned: false,
            retry: Default::default(),
            leader: None,
            request_num: 0,
            last_timestamp: 0,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Submit unsigned instead of failing when a request cannot be signed.
    pub fn allow_unsigned(mut self, allow: bool) -> Self {
        self.allow_unsigned = allow;
        self
    }

    pub fn leader(&self) -> Option<usize> {
        self.leader
    }

    /// Number the next request and seal it with digest and signature.
    pub fn build_request(&mut self, op: Vec<u8>) -> Result<(u32, Request), ClientError> {
        self.request_num += 1;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        self.last_timestamp = self.last_timestamp.max(now);
        let inner = RequestInner {
            id: self.id,
            seq: 0,
            view: 0,
            kind: TYPE_REQUEST,
            msg: op,
            timestamp: self.last_timestamp,
        };

        let digest = match digest(&inner) {
            Ok(digest) => digest.to_vec(),
            Err(err) if self.allow_unsigned => {
                tracing::warn!("request {} goes out without digest: {err}", self.request_num);
                Vec::new()
            }
            Err(err) => return Err(err.into()),
        };
        let signature = match &self.signer {
            Some(signer) if !digest.is_empty() => match signer.sign(&digest) {
                Ok(signature) => Some(signature),
                Err(err) if self.allow_unsigned => {
                    tracing::warn!("request {} goes out unsigned: {err}", self.request_num);
                    None
                }
                Err(err) => return Err(err.into()),
            },
            _ => None,
        };
        Ok((
            self.request_num,
            Request {
                inner,
                digest,
                signature,
            },
        ))
    }
}

impl<C> Client<C>
where
    C: Connect,
{
    pub async fn submit(&mut self, op: Vec<u8>) -> Result<Submission, ClientError> {
        let (request_num, request) = self.build_request(op)?;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.discover_and_submit(&request).await {
                Ok((replica, reply)) => {
                    return Ok(Submission {
                        request_num,
                        request,
                        replica,
                        reply,
                    })
                }
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let backoff = self.retry.backoff(attempt);
                    tracing::warn!(
                        "request {request_num} attempt {attempt} failed, retry in {backoff:?}: {err}"
                    );
                    sleep(backoff).await
                }
                Err(err) if err.is_transient() => {
                    return Err(ClientError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    })
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn discover_and_submit(
        &mut self,
        request: &Request,
    ) -> Result<(usize, Vec<u8>), ClientError> {
        let cached = self.leader;
        let order = cached
            .into_iter()
            .chain((0..self.num_replica).filter(move |&replica| Some(replica) != cached));
        for replica in order {
            match self.try_replica(replica, request).await {
                Ok(Some(reply)) => {
                    self.leader = Some(replica);
                    return Ok((replica, reply));
                }
                Ok(None) => {
                    if self.leader == Some(replica) {
                        self.leader = None
                    }
                }
                Err(err) => {
                    self.leader = None;
                    return Err(err);
                }
            }
        }
        Err(ClientError::NoPrimary)
    }

    /// `None` if the replica says it is not the primary.
    async fn try_replica(
        &self,
        replica: usize,
        request: &Request,
    ) -> Result<Option<Vec<u8>>, ClientError> {
        let transport = |error: crate::Error| ClientError::Transport { replica, error };
        let mut connection = self.connector.connect(replica).await.map_err(transport)?;
        let is_primary = connection.check_leader().await.map_err(transport)?;
        tracing::debug!(replica, is_primary, "probed");
        if !is_primary {
            Self::close(connection, replica).await;
            return Ok(None);
        }
        let reply = connection
            .new_txn_request(request.clone())
            .await
            .map_err(transport)?;
        Self::close(connection, replica).await;
        match reply {
            Ok(reply) => Ok(Some(reply)),
            Err(Rejected(reason)) => Err(ClientError::Rejected { replica, reason }),
        }
    }

    async fn close(connection: C::Connection, replica: usize) {
        if let Err(err) = connection.close().await {
            tracing::debug!(replica, "closing connection: {err}")
        }
    }
}
