//! One benchmark run: load config, provision keys, launch and synchronize the
//! replicas, submit the requests one after another, then wait for completion.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::Instant;

use crate::{
    client::{Client, TcpConnector},
    keys,
    monitor::{wait_for_completion, CompletionReport},
    replica::{relay::RelayReplica, BarrierReport, ReplicaHandle},
    task::BackgroundMonitor,
    ClusterConfig, Settings, Supervisor,
};

#[derive(Debug, Clone)]
pub struct BenchReport {
    pub submitted: u32,
    /// Time spent submitting, not including the wait for completion.
    pub elapsed: Duration,
    pub barrier: BarrierReport,
    pub completion: CompletionReport,
}

impl BenchReport {
    pub fn throughput(&self) -> f64 {
        self.submitted as f64 / self.elapsed.as_secs_f64()
    }
}

pub async fn run(settings: &Settings) -> crate::Result<BenchReport> {
    let config = Arc::new(ClusterConfig::load(settings)?);
    tracing::info!(
        "{} replicas, client at index {}, {} requests",
        config.num_replica(),
        config.client_index(),
        config.num_requests
    );
    run_with_config(config, settings).await
}

pub async fn run_with_config(
    config: Arc<ClusterConfig>,
    settings: &Settings,
) -> crate::Result<BenchReport> {
    if settings.generate_keys {
        keys::generate_keys(&config.key_dir, config.num_keys())?
    }
    // every key must be in place before anything launches
    for index in 0..config.num_keys() {
        keys::load_key(&config.key_dir, index)?;
    }
    let signer = keys::load_key(&config.key_dir, config.client_index())?;

    let mut monitor = BackgroundMonitor::default();
    let supervisor = Supervisor::new(config.clone(), settings.barrier);
    let relay = RelayReplica {
        view: 0,
        accept_unsigned: settings.allow_unsigned,
    };
    let handles = supervisor.launch(|_| relay, &monitor.spawner());

    let client = Client::new(&config, TcpConnector(config.clone()), Some(signer))
        .with_retry(settings.retry)
        .allow_unsigned(settings.allow_unsigned);
    let result = drive(&config, settings, &supervisor, handles, client, &mut monitor).await;
    monitor.cancel();
    result
}

async fn drive(
    config: &ClusterConfig,
    settings: &Settings,
    supervisor: &Supervisor,
    mut handles: Vec<ReplicaHandle>,
    mut client: Client<TcpConnector>,
    monitor: &mut BackgroundMonitor,
) -> crate::Result<BenchReport> {
    let barrier = watched(monitor, supervisor.synchronize(&mut handles)).await?;

    let completion = tokio::spawn(wait_for_completion(
        handles.into_iter().map(|handle| handle.progress).collect(),
        config.num_requests,
        settings.completion,
    ));

    let start = Instant::now();
    watched(monitor, async {
        for k in 0..config.num_requests {
            let submission = client.submit(format!("Request {k}").into_bytes()).await?;
            tracing::debug!(
                request_num = submission.request_num,
                replica = submission.replica,
                "{}",
                String::from_utf8_lossy(&submission.reply)
            );
        }
        Ok::<_, crate::Error>(())
    })
    .await?;
    let elapsed = start.elapsed();
    tracing::info!("finished sending {} requests in {elapsed:?}", config.num_requests);

    let completion = watched(monitor, async { completion.await? }).await?;
    Ok(BenchReport {
        submitted: config.num_requests,
        elapsed,
        barrier,
        completion,
    })
}

/// Run `task` unless some replica task fails first.
async fn watched<T>(
    monitor: &mut BackgroundMonitor,
    task: impl Future<Output = crate::Result<T>>,
) -> crate::Result<T> {
    tokio::select! {
        result = task => result,
        result = monitor.wait() => match result {
            Err(err) => Err(err),
            Ok(()) => crate::bail!("replicas exited unexpectedly"),
        },
    }
}
