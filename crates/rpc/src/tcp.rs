use std::{net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncWriteExt, BufStream},
    net::{TcpListener, TcpStream},
};

use crate::{frame, Call, CheckLeaderReply, Rejected, Reply, Request, TxnReply};

/// One client-side RPC connection. Opened per call sequence and closed after
/// use, there is no pooling.
#[derive(Debug)]
pub struct Connection {
    stream: BufStream<TcpStream>,
    remote_addr: SocketAddr,
}

impl Connection {
    pub async fn connect(remote_addr: SocketAddr) -> crate::Result<Self> {
        let stream = TcpStream::connect(remote_addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream: BufStream::new(stream),
            remote_addr,
        })
    }

    async fn call(&mut self, call: Call) -> crate::Result<Reply> {
        frame::send(&mut self.stream, &call).await?;
        frame::recv(&mut self.stream)
            .await?
            .ok_or_else(|| crate::err!("{} closed before replying", self.remote_addr))
    }

    pub async fn check_leader(&mut self) -> crate::Result<bool> {
        match self.call(Call::CheckLeader).await? {
            Reply::CheckLeader(reply) => Ok(reply.is_primary),
            reply => crate::bail!("unexpected reply to CheckLeader: {reply:?}"),
        }
    }

    /// The outer error is a transport failure, the inner one a refusal by the
    /// replica.
    pub async fn new_txn_request(
        &mut self,
        request: Request,
    ) -> crate::Result<Result<TxnReply, Rejected>> {
        match self.call(Call::NewTxnRequest(request)).await? {
            Reply::NewTxnRequest(reply) => Ok(Ok(reply)),
            Reply::Rejected(rejected) => Ok(Err(rejected)),
            reply => crate::bail!("unexpected reply to NewTxnRequest: {reply:?}"),
        }
    }

    pub async fn close(mut self) -> crate::Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
pub trait Service
where
    Self: Send + Sync + 'static,
{
    async fn check_leader(&self) -> bool;

    async fn new_txn_request(&self, request: Request) -> Result<TxnReply, Rejected>;
}

#[derive(Debug)]
pub struct Listener(TcpListener);

impl Listener {
    pub async fn bind(addr: SocketAddr) -> crate::Result<Self> {
        Ok(Self(TcpListener::bind(addr).await?))
    }

    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.0.local_addr()?)
    }

    /// Accept connections forever, each one served on its own task. Returns
    /// only if accepting fails.
    pub async fn serve<S>(self, service: Arc<S>) -> crate::Result<()>
    where
        S: Service,
    {
        loop {
            let (stream, remote) = self.0.accept().await?;
            stream.set_nodelay(true)?;
            let service = service.clone();
            tokio::spawn(async move {
                if let Err(err) = serve_connection(stream, &*service).await {
                    tracing::debug!("connection from {remote} dropped: {err}")
                }
            });
        }
    }
}

async fn serve_connection(stream: TcpStream, service: &impl Service) -> crate::Result<()> {
    let mut stream = BufStream::new(stream);
    while let Some(call) = frame::recv::<Call>(&mut stream).await? {
        let reply = match call {
            Call::CheckLeader => Reply::from(CheckLeaderReply {
                is_primary: service.check_leader().await,
            }),
            Call::NewTxnRequest(request) => match service.new_txn_request(request).await {
                Ok(reply) => reply.into(),
                Err(rejected) => rejected.into(),
            },
        };
        frame::send(&mut stream, &reply).await?
    }
    Ok(())
}
