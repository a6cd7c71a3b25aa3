use std::{net::IpAddr, path::Path, sync::Arc};

use pbft_bench::{bench, keys::KeyError, ClusterConfig, Completion, Settings};

const LOCALHOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

fn config(num_replica: usize, base_port: u16, key_dir: &Path) -> Arc<ClusterConfig> {
    ClusterConfig::new(
        vec![LOCALHOST; num_replica + 1],
        base_port,
        base_port + 100,
        20,
        key_dir,
    )
    .unwrap()
    .into()
}

#[tokio::test(flavor = "multi_thread")]
async fn four_replicas_first_completion() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(4, 47200, dir.path());
    let report = bench::run_with_config(config, &Settings::default())
        .await
        .unwrap();
    assert_eq!(report.submitted, 20);
    assert_eq!(report.barrier.listen_ready.len(), 4);
    assert_eq!(report.completion.finished.len(), 1);
    assert!(report.completion.finished[0].0 < 4);
    assert!(report.throughput() > 0.);
}

#[tokio::test(flavor = "multi_thread")]
async fn every_replica_catches_up() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(3, 47400, dir.path());
    let settings = Settings {
        completion: Completion::All,
        ..Default::default()
    };
    let report = bench::run_with_config(config, &settings).await.unwrap();
    let mut finished = report
        .completion
        .finished
        .iter()
        .map(|(replica, _)| *replica)
        .collect::<Vec<_>>();
    finished.sort();
    assert_eq!(finished, vec![0, 1, 2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_keys_fail_before_launch() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(4, 47600, dir.path());
    let settings = Settings {
        generate_keys: false,
        ..Default::default()
    };
    let err = bench::run_with_config(config, &settings).await.unwrap_err();
    assert!(
        matches!(err.downcast_ref::<KeyError>(), Some(KeyError::NotFound(_))),
        "{err}"
    );
    // nothing was bound, so the ports are still free
    std::net::TcpListener::bind((LOCALHOST, 47600)).unwrap();
}
