use tracing::{debug, info, Instrument};

use super::state::WorkerState;
use crate::{
    error::{Error, Result},
    evaluator::{evaluate_guarded, Evaluator},
    mesh::{
        wire::{Message, Tag, SENTINEL},
        Communicator, Rank, COORDINATOR,
    },
};

/// Everything a worker waits on.
const INTERESTS: [(Rank, Tag); 2] = [
    (COORDINATOR, Tag::PointToEvaluate),
    (COORDINATOR, Tag::EvaluationDone),
];

/// What a worker did over its lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerSummary {
    pub rank: Rank,
    pub evaluated: usize,
}

/// Serves evaluation requests from the coordinator until told to stop.
///
/// Pending points are always served before the stop request is taken, so a
/// worker never leaves a request unanswered. Evaluation runs on the calling
/// task.
pub async fn run_worker<E>(
    channel: &Communicator,
    evaluator: &E,
) -> Result<WorkerSummary>
where
    E: Evaluator + ?Sized,
{
    let rank = channel.rank();
    if channel.is_coordinator() {
        Err(Error::Config("rank 0 cannot run a worker".into()))?
    }
    let span = tracing::info_span!("worker", rank);
    async move {
        let mut state = WorkerState::AwaitingWork;
        let mut evaluated = 0;
        loop {
            if channel.poll(COORDINATOR, Tag::PointToEvaluate)? {
                let x = match channel
                    .receive(COORDINATOR, Tag::PointToEvaluate)
                    .await?
                {
                    Message::PointToEvaluate(req) => req.x,
                    other => Err(unexpected(&other))?,
                };
                state = state.on(Tag::PointToEvaluate)?;
                let outcome = evaluate_guarded(evaluator, x);
                debug!(x, f = outcome.f, ok = outcome.ok, "evaluated point");
                channel.try_send(
                    COORDINATOR,
                    Message::evaluated(x, outcome.f, outcome.ok),
                )?;
                state = state.on(Tag::EvaluatedPoint)?;
                evaluated += 1;
                continue;
            }
            if channel.poll(COORDINATOR, Tag::EvaluationDone)? {
                channel.receive(COORDINATOR, Tag::EvaluationDone).await?;
                state = state.on(Tag::EvaluationDone)?;
                break;
            }
            channel.wait(&INTERESTS).await?;
        }
        channel.try_send(COORDINATOR, Message::WorkerDone(SENTINEL))?;
        state.on(Tag::WorkerDone)?;
        info!(evaluated, "worker done");
        Ok::<_, Error>(WorkerSummary { rank, evaluated })
    }
    .instrument(span)
    .await
}

fn unexpected(msg: &Message) -> Error {
    Error::Protocol(format!("unexpected {:?} message", msg.tag()))
}
