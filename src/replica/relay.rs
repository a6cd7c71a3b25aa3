//! A stand-in replica that serves the client RPC contract without running an
//! agreement protocol.
//!
//! The replica at `view % n` claims to be primary. It verifies each request,
//! numbers it, commits it locally and relays the commit to every peer over the
//! consensus port. Peers commit whatever the primary relays. Useful to drive
//! the harness end to end on a single machine.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use pbft_rpc::{frame, Listener, Rejected, Request, Service, TxnReply};
use serde::{Deserialize, Serialize};
use tokio::{
    io::BufStream,
    net::{TcpListener, TcpStream},
};

use crate::{
    crypto::{verify_request, Verifier},
    keys,
    model::{event_channel, EventSender, EventSource},
    replica::{ProgressEvent, Replica, ReplicaContext},
    task::BackgroundSpawner,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayReplica {
    pub view: u32,
    pub accept_unsigned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Commit {
    seq: u32,
    digest: Vec<u8>,
}

#[async_trait::async_trait]
impl Replica for RelayReplica {
    async fn run(self, context: ReplicaContext) -> crate::Result<()> {
        let ReplicaContext {
            index,
            config,
            barrier,
            progress,
            spawner,
        } = context;
        let verifier = keys::load_key(&config.key_dir, config.client_index())?.verifier();
        let primary = config.primary(self.view) == index;

        let rpc = Listener::bind(config.rpc_addr(index)).await?;
        let peer_listener = TcpListener::bind(config.consensus_addr(index)).await?;
        spawner.spawn(accept_loop(
            peer_listener,
            index,
            progress.clone(),
            spawner.clone(),
        ));
        let peers = barrier.listening().await?;

        let mut links = Vec::new();
        if primary {
            for peer in (0..config.num_replica()).filter(|&peer| peer != index) {
                let stream = TcpStream::connect(config.consensus_addr(peer)).await?;
                stream.set_nodelay(true)?;
                let (sender, source) = event_channel();
                spawner.spawn(send_loop(stream, source));
                links.push(sender)
            }
        }
        peers.connected()?;
        tracing::debug!(index, primary, "relay replica serving");

        let relay = Relay {
            index,
            view: self.view,
            primary,
            verifier,
            accept_unsigned: self.accept_unsigned,
            links,
            progress,
            log: Default::default(),
        };
        rpc.serve(Arc::new(relay)).await
    }
}

struct Relay {
    index: usize,
    view: u32,
    primary: bool,
    verifier: Verifier,
    accept_unsigned: bool,
    links: Vec<EventSender<Commit>>,
    progress: EventSender<ProgressEvent>,
    log: Mutex<CommitLog>,
}

#[derive(Debug, Default)]
struct CommitLog {
    committed: u32,
    seqs: HashMap<Vec<u8>, u32>,
}

impl Relay {
    /// Number and relay a request, or return the number it already got if the
    /// same digest was committed before.
    fn commit(&self, digest: Vec<u8>) -> crate::Result<u32> {
        // numbering and relaying happen under one lock so peers see commits in
        // sequence order
        let mut log = self
            .log
            .lock()
            .map_err(|_| crate::err!("commit log poisoned"))?;
        if let Some(&seq) = log.seqs.get(&digest) {
            tracing::debug!(index = self.index, seq, "resent request, not committing again");
            return Ok(seq);
        }
        log.committed += 1;
        let seq = log.committed;
        log.seqs.insert(digest.clone(), seq);
        self.progress.send(ProgressEvent {
            replica: self.index,
            committed: seq,
        })?;
        for link in &self.links {
            link.send(Commit {
                seq,
                digest: digest.clone(),
            })?
        }
        Ok(seq)
    }
}

#[async_trait::async_trait]
impl Service for Relay {
    async fn check_leader(&self) -> bool {
        self.primary
    }

    async fn new_txn_request(&self, request: Request) -> Result<TxnReply, Rejected> {
        if !self.primary {
            return Err(Rejected(format!(
                "replica {} is not primary in view {}",
                self.index, self.view
            )));
        }
        let verifier = if request.signature.is_none() && self.accept_unsigned {
            None
        } else {
            Some(&self.verifier)
        };
        if let Err(err) = verify_request(&request, verifier) {
            tracing::warn!(index = self.index, "dropping request from {}: {err}", request.inner.id);
            return Err(Rejected(err.to_string()));
        }
        match self.commit(request.digest) {
            Ok(seq) => Ok(TxnReply {
                msg: format!("replica {} committed request {seq}", self.index).into_bytes(),
            }),
            Err(err) => Err(Rejected(err.to_string())),
        }
    }
}

async fn send_loop(stream: TcpStream, mut source: EventSource<Commit>) -> crate::Result<()> {
    let mut stream = BufStream::new(stream);
    while let Some(commit) = source.option_next().await {
        frame::send(&mut stream, &commit).await?
    }
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    index: usize,
    progress: EventSender<ProgressEvent>,
    spawner: BackgroundSpawner,
) -> crate::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        stream.set_nodelay(true)?;
        spawner.spawn(recv_loop(stream, index, progress.clone()))
    }
}

async fn recv_loop(
    stream: TcpStream,
    index: usize,
    progress: EventSender<ProgressEvent>,
) -> crate::Result<()> {
    let mut stream = BufStream::new(stream);
    while let Some(commit) = frame::recv::<Commit>(&mut stream).await? {
        tracing::trace!(index, seq = commit.seq, digest = %hex::encode(&commit.digest), "relayed commit");
        progress.send(ProgressEvent {
            replica: index,
            committed: commit.seq,
        })?
    }
    Ok(())
}
