use chrono::Utc;
use hashbrown::HashSet;
use tracing::{debug, info, Instrument};

use super::{assign::assign, state::CoordinatorState};
use crate::{
    error::{Error, Result},
    mesh::{
        wire::{Message, Tag, SENTINEL},
        Communicator, Rank,
    },
    report::{EvaluationResult, Report},
};

/// Rank 0's side of a run: hands out `points`, gathers every result, then
/// stops the workers and waits for each to acknowledge.
pub async fn run_coordinator(
    channel: &Communicator,
    points: &[f64],
) -> Result<Report> {
    if !channel.is_coordinator() {
        Err(Error::Config(format!(
            "rank {} cannot coordinate",
            channel.rank()
        )))?
    }
    let workers = channel.worker_count();
    if workers == 0 {
        Err(Error::Config("no workers to evaluate on".into()))?
    }
    let span = tracing::info_span!("coordinator", workers);
    Coordinator::new(channel, workers)
        .run(points)
        .instrument(span)
        .await
}

struct Coordinator<'a> {
    channel: &'a Communicator,
    workers: usize,
    state: CoordinatorState,
    /// Requests sent but not yet answered, indexed by rank.
    outstanding: Vec<usize>,
    results: Vec<EvaluationResult>,
}

impl<'a> Coordinator<'a> {
    fn new(channel: &'a Communicator, workers: usize) -> Self {
        Self {
            channel,
            workers,
            state: CoordinatorState::Distributing,
            outstanding: vec![0; workers + 1],
            results: Vec::new(),
        }
    }

    fn advance(&mut self) -> Result<()> {
        self.state = self.state.next()?;
        info!(state = %self.state, "coordinator phase");
        Ok(())
    }

    /// Sends `msg` to `worker` if the current phase sends that tag.
    fn send(&self, worker: Rank, msg: Message) -> Result<()> {
        if self.state.sends() != Some(msg.tag()) {
            Err(Error::Protocol(format!(
                "coordinator cannot send {:?} while {}",
                msg.tag(),
                self.state
            )))?
        }
        self.channel.try_send(worker, msg)
    }

    /// The tag the current phase collects.
    fn expected(&self) -> Result<Tag> {
        self.state.expects().ok_or_else(|| {
            Error::Protocol(format!(
                "coordinator receives nothing while {}",
                self.state
            ))
        })
    }

    async fn run(mut self, points: &[f64]) -> Result<Report> {
        let started_at = Utc::now();
        info!(points = points.len(), "distributing points");
        self.distribute(points)?;
        self.advance()?;
        self.collect(points.len()).await?;
        self.advance()?;
        self.stop()?;
        self.advance()?;
        self.await_acks().await?;
        self.advance()?;
        Ok(Report {
            results: self.results,
            workers: self.workers,
            started_at,
            finished_at: Utc::now(),
        })
    }

    fn distribute(&mut self, points: &[f64]) -> Result<()> {
        for (index, &x) in points.iter().enumerate() {
            let worker = assign(index, self.workers)?;
            self.send(worker, Message::point(x))?;
            self.outstanding[worker] += 1;
            debug!(x, worker, "sent point");
        }
        Ok(())
    }

    /// Sweeps every worker for results, suspending only when a full sweep
    /// found nothing.
    async fn collect(&mut self, expected: usize) -> Result<()> {
        let tag = self.expected()?;
        while self.results.len() < expected {
            let mut progressed = false;
            for worker in 1..=self.workers {
                while self.channel.poll(worker, tag)? {
                    self.record(worker, tag).await?;
                    progressed = true;
                }
            }
            if progressed {
                continue;
            }
            let interests: Vec<(Rank, Tag)> = (1..=self.workers)
                .filter(|&worker| self.outstanding[worker] > 0)
                .map(|worker| (worker, tag))
                .collect();
            self.channel.wait(&interests).await?;
        }
        Ok(())
    }

    async fn record(&mut self, worker: Rank, tag: Tag) -> Result<()> {
        let point = match self.channel.receive(worker, tag).await? {
            Message::EvaluatedPoint(point) => point,
            other => Err(Error::Protocol(format!(
                "expected a result from rank {}, got {:?}",
                worker,
                other.tag()
            )))?,
        };
        if self.outstanding[worker] == 0 {
            Err(Error::Protocol(format!(
                "rank {} answered a point it was never sent (x = {})",
                worker, point.x
            )))?
        }
        self.outstanding[worker] -= 1;
        debug!(x = point.x, f = point.f, ok = point.ok, worker, "got result");
        self.results.push(EvaluationResult {
            x: point.x,
            f: point.f,
            ok: point.ok,
            worker,
        });
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        for worker in 1..=self.workers {
            self.send(worker, Message::EvaluationDone(SENTINEL))?;
        }
        Ok(())
    }

    async fn await_acks(&mut self) -> Result<()> {
        let tag = self.expected()?;
        let mut pending: HashSet<Rank> = (1..=self.workers).collect();
        while !pending.is_empty() {
            let mut acked = Vec::new();
            for &worker in &pending {
                if self.channel.poll(worker, Tag::EvaluatedPoint)? {
                    Err(Error::Protocol(format!(
                        "rank {} sent a result after every point was answered",
                        worker
                    )))?
                }
                if self.channel.poll(worker, tag)? {
                    acked.push(worker);
                }
            }
            for worker in &acked {
                self.channel.receive(*worker, tag).await?;
                pending.remove(worker);
                debug!(worker, "worker acknowledged stop");
            }
            if !acked.is_empty() {
                continue;
            }
            let interests: Vec<(Rank, Tag)> = pending
                .iter()
                .flat_map(|&worker| {
                    [(worker, tag), (worker, Tag::EvaluatedPoint)]
                })
                .collect();
            self.channel.wait(&interests).await?;
        }
        info!(results = self.results.len(), "all workers stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::local_world;

    #[tokio::test]
    async fn zero_points_still_stops_every_worker() {
        let mut world = local_world(3);
        let two = world.pop().unwrap();
        let one = world.pop().unwrap();
        let zero = world.pop().unwrap();
        one.try_send(0, Message::WorkerDone(SENTINEL)).unwrap();
        two.try_send(0, Message::WorkerDone(SENTINEL)).unwrap();

        let report = run_coordinator(&zero, &[]).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(
            report.to_string(),
            "Summary of 0 evalpoints:\nX\tF\tProcess\n"
        );
        for worker in [&one, &two] {
            assert!(matches!(
                worker.receive(0, Tag::EvaluationDone).await.unwrap(),
                Message::EvaluationDone(SENTINEL)
            ));
        }
    }

    #[tokio::test]
    async fn unrequested_result_is_rejected() {
        let mut world = local_world(2);
        let one = world.pop().unwrap();
        let zero = world.pop().unwrap();
        one.try_send(0, Message::evaluated(3.0, 3.0, true)).unwrap();
        one.try_send(0, Message::evaluated(3.0, 3.0, true)).unwrap();
        one.try_send(0, Message::WorkerDone(SENTINEL)).unwrap();

        let err = run_coordinator(&zero, &[3.0]).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn phases_gate_what_the_coordinator_sends_and_receives() {
        let world = local_world(2);
        let mut coordinator = Coordinator::new(&world[0], 1);

        coordinator.state = CoordinatorState::Collecting;
        assert!(matches!(
            coordinator.distribute(&[1.0]),
            Err(Error::Protocol(_))
        ));
        assert!(matches!(coordinator.stop(), Err(Error::Protocol(_))));
        assert!(!world[1].poll(0, Tag::PointToEvaluate).unwrap());

        coordinator.state = CoordinatorState::Stopping;
        assert!(matches!(
            coordinator.collect(1).await,
            Err(Error::Protocol(_))
        ));
        assert!(matches!(
            coordinator.await_acks().await,
            Err(Error::Protocol(_))
        ));
        coordinator.stop().unwrap();
    }

    #[tokio::test]
    async fn workers_cannot_coordinate() {
        let world = local_world(2);
        assert!(matches!(
            run_coordinator(&world[1], &[1.0]).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn lone_coordinator_is_rejected() {
        let world = local_world(1);
        assert!(matches!(
            run_coordinator(&world[0], &[1.0]).await,
            Err(Error::Config(_))
        ));
    }
}
