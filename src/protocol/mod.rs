// A run is a fixed batch of points. Rank 0 hands each point to a worker by
// static round-robin, gathers the answers in whatever order they come back,
// tells every worker to stop and waits until each one says it has. Workers
// answer every point they were sent before honouring the stop.

use futures::future::join_all;
use tracing::warn;

mod assign;
mod coordinator;
mod state;
mod worker;

pub use assign::{assign, workload};
pub use coordinator::run_coordinator;
pub use state::{CoordinatorState, WorkerState};
pub use worker::{run_worker, WorkerSummary};

use crate::{
    error::{Error, Result},
    evaluator::Evaluator,
    mesh::{local_world, Communicator},
    report::Report,
};

/// What a rank produced once its part of the run is over.
#[derive(Debug)]
pub enum Outcome {
    Coordinator(Report),
    Worker(WorkerSummary),
}

impl Outcome {
    pub fn report(&self) -> Option<&Report> {
        match self {
            Outcome::Coordinator(report) => Some(report),
            Outcome::Worker(_) => None,
        }
    }
}

/// Runs whichever role `channel`'s rank plays. `points` are only read on
/// the coordinator.
pub async fn run_rank<E>(
    channel: &Communicator,
    points: &[f64],
    evaluator: &E,
) -> Result<Outcome>
where
    E: Evaluator + ?Sized,
{
    if channel.is_coordinator() {
        Ok(Outcome::Coordinator(run_coordinator(channel, points).await?))
    } else {
        Ok(Outcome::Worker(run_worker(channel, evaluator).await?))
    }
}

/// Runs a full world of `workers + 1` ranks inside the current runtime.
pub async fn simulate<E>(
    workers: usize,
    points: &[f64],
    evaluator: E,
) -> Result<Report>
where
    E: Evaluator + Clone + 'static,
{
    if workers == 0 {
        Err(Error::Config("simulation needs at least one worker".into()))?
    }
    let mut world = local_world(workers + 1).into_iter();
    let coordinator = world
        .next()
        .ok_or_else(|| Error::Config("empty world".into()))?;
    let handles: Vec<_> = world
        .map(|channel| {
            let evaluator = evaluator.clone();
            tokio::spawn(async move {
                let summary = run_worker(&channel, &evaluator).await;
                channel.shutdown().await?;
                summary
            })
        })
        .collect();

    let report = run_coordinator(&coordinator, points).await;
    coordinator.shutdown().await?;

    let mut worker_error = None;
    for joined in join_all(handles).await {
        let result = joined.map_err(|e| {
            Error::Protocol(format!("worker task did not finish: {}", e))
        });
        if let Err(e) = result.and_then(|summary| summary) {
            warn!("worker failed: {}", e);
            worker_error.get_or_insert(e);
        }
    }
    let report = report?;
    match worker_error {
        Some(e) => Err(e),
        None => Ok(report),
    }
}
