//! Deciding when the cluster has processed every submitted request.
//!
//! One listener task drains each replica's progress stream and reports the
//! moment its replica commits the expected request count. With
//! `Completion::First` the run ends on the first such report, even if other
//! replicas still lag behind.

use tokio::{task::JoinSet, time::Instant};

use crate::{
    model::{event_channel, EventSource},
    replica::ProgressEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Completion {
    /// Any single replica reaching the target ends the run.
    #[default]
    First,
    /// Every launched replica has to reach the target.
    All,
}

#[derive(Debug, Clone, Default)]
pub struct CompletionReport {
    /// Replicas that reached the target and when, in that order.
    pub finished: Vec<(usize, Instant)>,
}

pub async fn wait_for_completion(
    sources: Vec<EventSource<ProgressEvent>>,
    expected: u32,
    completion: Completion,
) -> crate::Result<CompletionReport> {
    if expected == 0 {
        return Ok(Default::default());
    }
    let required = match completion {
        Completion::First => 1,
        Completion::All => sources.len(),
    };
    let (done, mut done_source) = event_channel();
    // dropping the set aborts listeners that are still draining
    let mut listeners = JoinSet::new();
    for mut source in sources {
        let done = done.clone();
        listeners.spawn(async move {
            while let Some(event) = source.option_next().await {
                if event.committed == expected
                    && done.send((event.replica, Instant::now())).is_err()
                {
                    break;
                }
            }
        });
    }
    drop(done);

    let mut report = CompletionReport::default();
    while report.finished.len() < required {
        let Some((replica, at)) = done_source.option_next().await else {
            crate::bail!(
                "progress streams closed with {} of {required} replica(s) finished",
                report.finished.len()
            )
        };
        tracing::info!(replica, "replica processed all {expected} requests");
        report.finished.push((replica, at))
    }
    Ok(report)
}
