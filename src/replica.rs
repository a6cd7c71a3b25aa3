//! Launching replicas and holding them at a two-phase start-up barrier.
//!
//! Phase one waits until every replica has bound its listening sockets. Only
//! then is any replica allowed to dial its peers, so no replica can dial a peer
//! whose listener does not exist yet. Phase two waits until every replica has
//! finished dialing. Both phases are explicit acknowledgements bounded by a
//! timeout.

use std::{sync::Arc, time::Duration};

use anyhow::Context as _;
use tokio::time::{sleep, timeout_at, Instant};

use crate::{
    model::{event_channel, promise_channel, EventSender, EventSource, PromiseSender, PromiseSource},
    task::BackgroundSpawner,
    ClusterConfig,
};

pub mod relay;

/// A replica has locally committed request number `committed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgressEvent {
    pub replica: usize,
    pub committed: u32,
}

#[async_trait::async_trait]
pub trait Replica
where
    Self: Send + 'static,
{
    async fn run(self, context: ReplicaContext) -> crate::Result<()>;
}

/// What a launched replica receives from the supervisor.
#[derive(Debug)]
pub struct ReplicaContext {
    pub index: usize,
    pub config: Arc<ClusterConfig>,
    pub barrier: ReplicaBarrier,
    pub progress: EventSender<ProgressEvent>,
    pub spawner: BackgroundSpawner,
}

/// Replica side of the barrier, consumed in protocol order.
#[derive(Debug)]
pub struct ReplicaBarrier {
    listen_ready: PromiseSender<Instant>,
    setup_ready: PromiseSource<()>,
    peers_ready: PromiseSender<()>,
}

#[derive(Debug)]
pub struct PeersReady(PromiseSender<()>);

impl ReplicaBarrier {
    /// Report that listeners are bound, then wait for permission to dial peers.
    pub async fn listening(self) -> crate::Result<PeersReady> {
        self.listen_ready.resolve(Instant::now())?;
        self.setup_ready
            .await
            .map_err(|_| crate::err!("supervisor gone before setup-ready"))?;
        Ok(PeersReady(self.peers_ready))
    }
}

impl PeersReady {
    pub fn connected(self) -> crate::Result<()> {
        self.0.resolve(())
    }
}

/// Supervisor side of one launched replica.
#[derive(Debug)]
pub struct ReplicaHandle {
    pub index: usize,
    listen_ready: PromiseSource<Instant>,
    setup_ready: Option<PromiseSender<()>>,
    peers_ready: PromiseSource<()>,
    pub progress: EventSource<ProgressEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierSettings {
    /// Bound on each phase.
    pub timeout: Duration,
    /// Extra pause after each phase, zero to rely on acknowledgements alone.
    pub settle_delay: Duration,
}

impl Default for BarrierSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            settle_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BarrierReport {
    /// When each replica reported its listeners bound, by replica index.
    pub listen_ready: Vec<Instant>,
    /// When setup-ready was first handed out.
    pub advanced: Instant,
    /// When the last replica finished dialing.
    pub completed: Instant,
}

#[derive(Debug)]
pub struct Supervisor {
    config: Arc<ClusterConfig>,
    settings: BarrierSettings,
}

impl Supervisor {
    pub fn new(config: Arc<ClusterConfig>, settings: BarrierSettings) -> Self {
        Self { config, settings }
    }

    /// Start one replica per non-client participant.
    pub fn launch<R>(
        &self,
        mut replicas: impl FnMut(usize) -> R,
        spawner: &BackgroundSpawner,
    ) -> Vec<ReplicaHandle>
    where
        R: Replica,
    {
        (0..self.config.num_replica())
            .map(|index| {
                let listen_ready = promise_channel();
                let setup_ready = promise_channel();
                let peers_ready = promise_channel();
                let progress = event_channel();
                let context = ReplicaContext {
                    index,
                    config: self.config.clone(),
                    barrier: ReplicaBarrier {
                        listen_ready: listen_ready.0,
                        setup_ready: setup_ready.1,
                        peers_ready: peers_ready.0,
                    },
                    progress: progress.0,
                    spawner: spawner.clone(),
                };
                let replica = replicas(index);
                spawner.spawn(async move {
                    replica
                        .run(context)
                        .await
                        .with_context(|| format!("replica {index}"))
                });
                ReplicaHandle {
                    index,
                    listen_ready: listen_ready.1,
                    setup_ready: Some(setup_ready.0),
                    peers_ready: peers_ready.1,
                    progress: progress.1,
                }
            })
            .collect()
    }

    pub async fn synchronize(&self, handles: &mut [ReplicaHandle]) -> crate::Result<BarrierReport> {
        let deadline = Instant::now() + self.settings.timeout;
        let mut listen_ready = Vec::new();
        for handle in handles.iter_mut() {
            let ready_at = self
                .acknowledge(&mut handle.listen_ready, deadline, handle.index, "listen-ready")
                .await?;
            listen_ready.push(ready_at)
        }
        tracing::info!("all {} replicas listening", handles.len());
        self.settle().await;

        let advanced = Instant::now();
        for handle in handles.iter_mut() {
            let Some(setup_ready) = handle.setup_ready.take() else {
                crate::bail!("replica {} already synchronized", handle.index)
            };
            setup_ready
                .resolve(())
                .with_context(|| format!("replica {} gone before setup-ready", handle.index))?
        }

        let deadline = Instant::now() + self.settings.timeout;
        for handle in handles.iter_mut() {
            self.acknowledge(&mut handle.peers_ready, deadline, handle.index, "peers-ready")
                .await?
        }
        let completed = Instant::now();
        tracing::info!("all {} replicas connected to peers", handles.len());
        self.settle().await;

        Ok(BarrierReport {
            listen_ready,
            advanced,
            completed,
        })
    }

    async fn acknowledge<T>(
        &self,
        source: &mut PromiseSource<T>,
        deadline: Instant,
        index: usize,
        phase: &str,
    ) -> crate::Result<T> {
        match timeout_at(deadline, source).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => crate::bail!("replica {index} exited before {phase}"),
            Err(_) => crate::bail!(
                "replica {index} not {phase} within {:?}",
                self.settings.timeout
            ),
        }
    }

    async fn settle(&self) {
        if !self.settings.settle_delay.is_zero() {
            sleep(self.settings.settle_delay).await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::IpAddr,
        sync::{Arc, Mutex},
    };

    use super::*;
    use crate::task::BackgroundMonitor;

    fn config(num_replica: usize) -> Arc<ClusterConfig> {
        let hosts = vec![IpAddr::from([127, 0, 0, 1]); num_replica + 1];
        ClusterConfig::new(hosts, 40540, 10000, 1, "keys").unwrap().into()
    }

    /// Becomes ready after a staggered delay and records when it was allowed
    /// to dial.
    struct Staggered {
        delay: Duration,
        setup_at: Arc<Mutex<Vec<(usize, Instant)>>>,
    }

    #[async_trait::async_trait]
    impl Replica for Staggered {
        async fn run(self, context: ReplicaContext) -> crate::Result<()> {
            sleep(self.delay).await;
            let peers = context.barrier.listening().await?;
            self.setup_at
                .lock()
                .unwrap()
                .push((context.index, Instant::now()));
            sleep(self.delay).await;
            peers.connected()
        }
    }

    struct Silent;

    #[async_trait::async_trait]
    impl Replica for Silent {
        async fn run(self, context: ReplicaContext) -> crate::Result<()> {
            let _barrier = context.barrier;
            std::future::pending().await
        }
    }

    /// Replica `quits` returns early, before or after listening. The others go
    /// through the barrier and stay up.
    struct Quitter {
        quits: usize,
        after_listening: bool,
    }

    #[async_trait::async_trait]
    impl Replica for Quitter {
        async fn run(self, context: ReplicaContext) -> crate::Result<()> {
            if context.index == self.quits && !self.after_listening {
                return Ok(());
            }
            let peers = context.barrier.listening().await?;
            if context.index == self.quits {
                return Ok(());
            }
            peers.connected()?;
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn setup_waits_for_every_listener() {
        const M: usize = 5;
        let monitor = BackgroundMonitor::default();
        let setup_at = Arc::new(Mutex::new(Vec::new()));
        let supervisor = Supervisor::new(config(M), Default::default());
        let mut handles = supervisor.launch(
            |index| Staggered {
                // reverse order, the last handle is the first to be ready
                delay: Duration::from_millis(100 * (M - index) as u64),
                setup_at: setup_at.clone(),
            },
            &monitor.spawner(),
        );
        let report = supervisor.synchronize(&mut handles).await.unwrap();

        let last_ready = *report.listen_ready.iter().max().unwrap();
        assert_eq!(report.listen_ready.len(), M);
        assert!(report.advanced >= last_ready);
        assert!(report.completed >= report.advanced);
        let setup_at = setup_at.lock().unwrap();
        assert_eq!(setup_at.len(), M);
        for (index, at) in setup_at.iter() {
            assert!(*at >= last_ready, "replica {index} allowed to dial early");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn settle_delay_is_honored() {
        let monitor = BackgroundMonitor::default();
        let supervisor = Supervisor::new(
            config(2),
            BarrierSettings {
                settle_delay: Duration::from_secs(1),
                ..Default::default()
            },
        );
        let setup_at = Arc::new(Mutex::new(Vec::new()));
        let mut handles = supervisor.launch(
            |_| Staggered {
                delay: Duration::ZERO,
                setup_at: setup_at.clone(),
            },
            &monitor.spawner(),
        );
        let start = Instant::now();
        let report = supervisor.synchronize(&mut handles).await.unwrap();
        assert!(report.advanced >= start + Duration::from_secs(1));
        assert!(Instant::now() >= report.completed + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_replica_times_out() {
        let monitor = BackgroundMonitor::default();
        let supervisor = Supervisor::new(config(3), Default::default());
        let mut handles = supervisor.launch(|_| Silent, &monitor.spawner());
        let err = supervisor.synchronize(&mut handles).await.unwrap_err();
        assert!(err.to_string().contains("replica 0 not listen-ready"), "{err}");
    }

    #[tokio::test]
    async fn replica_exiting_before_listening_is_named() {
        let monitor = BackgroundMonitor::default();
        let supervisor = Supervisor::new(config(3), Default::default());
        let mut handles = supervisor.launch(
            |_| Quitter {
                quits: 1,
                after_listening: false,
            },
            &monitor.spawner(),
        );
        let err = supervisor.synchronize(&mut handles).await.unwrap_err();
        assert_eq!(err.to_string(), "replica 1 exited before listen-ready");
    }

    #[tokio::test]
    async fn replica_exiting_before_connecting_is_named() {
        let monitor = BackgroundMonitor::default();
        let supervisor = Supervisor::new(config(3), Default::default());
        let mut handles = supervisor.launch(
            |_| Quitter {
                quits: 2,
                after_listening: true,
            },
            &monitor.spawner(),
        );
        let err = supervisor.synchronize(&mut handles).await.unwrap_err();
        assert_eq!(err.to_string(), "replica 2 exited before peers-ready");
    }
}
