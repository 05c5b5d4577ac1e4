use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use hashbrown::HashMap;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, trace, warn};

use super::{
    endpoint::close_quietly,
    mailbox::Mailbox,
    wire::{Message, Tag},
    Rank, COORDINATOR, LINGER,
};
use crate::error::{Error, Result};

/// One rank's view of the message channel.
///
/// `try_send` and `poll` never block. `receive` and `wait` suspend the
/// calling task, bounded by the configured wait timeout if there is one.
pub struct Communicator {
    rank: Rank,
    world_size: usize,
    inbox: Arc<Mailbox>,
    outboxes: HashMap<Rank, mpsc::UnboundedSender<Message>>,
    writers: Vec<(Rank, JoinHandle<()>)>,
    readers: Vec<JoinHandle<()>>,
    connections: Vec<quinn::Connection>,
    endpoint: Option<quinn::Endpoint>,
    wait_timeout: Option<Duration>,
}

impl Communicator {
    pub(super) fn new(
        rank: Rank,
        world_size: usize,
        wait_timeout: Option<Duration>,
    ) -> Self {
        Self {
            rank,
            world_size,
            inbox: Arc::new(Mailbox::new()),
            outboxes: HashMap::new(),
            writers: Vec::new(),
            readers: Vec::new(),
            connections: Vec::new(),
            endpoint: None,
            wait_timeout,
        }
    }

    pub(super) fn inbox(&self) -> Arc<Mailbox> {
        self.inbox.clone()
    }

    pub(super) fn attach(
        &mut self,
        peer: Rank,
        outbox: mpsc::UnboundedSender<Message>,
        writer: JoinHandle<()>,
        reader: Option<JoinHandle<()>>,
    ) {
        self.outboxes.insert(peer, outbox);
        self.writers.push((peer, writer));
        self.readers.extend(reader);
    }

    pub(super) fn attach_connection(&mut self, conn: quinn::Connection) {
        self.connections.push(conn);
    }

    pub(super) fn attach_endpoint(&mut self, ep: quinn::Endpoint) {
        self.endpoint = Some(ep);
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Ranks `1..world_size` are workers.
    pub fn worker_count(&self) -> usize {
        self.world_size.saturating_sub(1)
    }

    pub fn is_coordinator(&self) -> bool {
        self.rank == COORDINATOR
    }

    /// Queues `msg` for `target` and returns immediately.
    pub fn try_send(&self, target: Rank, msg: Message) -> Result<()> {
        if target >= self.world_size {
            Err(Error::UnknownRank(target))?
        }
        if target == self.rank {
            self.inbox.deliver(self.rank, msg);
            return Ok(());
        }
        let outbox = self
            .outboxes
            .get(&target)
            .ok_or(Error::PeerUnreachable(target))?;
        trace!(target, tag = ?msg.tag(), "enqueued message");
        outbox
            .send(msg)
            .map_err(|_| Error::PeerUnreachable(target))
    }

    /// Whether a message from `source` with `tag` can be received now.
    pub fn poll(&self, source: Rank, tag: Tag) -> Result<bool> {
        if source >= self.world_size {
            Err(Error::UnknownRank(source))?
        }
        self.inbox.peek(source, tag)
    }

    /// Takes the next message from `source` with `tag`, waiting for it if
    /// none is queued yet.
    pub async fn receive(&self, source: Rank, tag: Tag) -> Result<Message> {
        loop {
            if let Some(msg) = self.inbox.take(source, tag) {
                return Ok(msg);
            }
            self.wait(&[(source, tag)]).await?;
        }
    }

    /// Suspends until any `(source, tag)` in `interests` has a message.
    pub async fn wait(&self, interests: &[(Rank, Tag)]) -> Result<()> {
        if let Some(&(source, _)) =
            interests.iter().find(|(source, _)| *source >= self.world_size)
        {
            Err(Error::UnknownRank(source))?
        }
        match self.wait_timeout {
            None => self.inbox.ready(interests).await,
            Some(limit) => {
                tokio::time::timeout(limit, self.inbox.ready(interests))
                    .await
                    .map_err(|_| Error::Timeout(limit))?
            }
        }
    }

    /// Flushes and closes every link.
    ///
    /// Outgoing streams are finished first so queued messages still reach
    /// their peers; then each peer gets a bounded time to finish its own
    /// side before the connections are closed.
    ///
    /// Connections are closed even when a step fails; the first failure is
    /// returned.
    pub async fn shutdown(self) -> Result<()> {
        let Communicator {
            rank,
            outboxes,
            writers,
            readers,
            connections,
            endpoint,
            ..
        } = self;
        drop(outboxes);
        let mut failure = None;
        let (peers, handles): (Vec<Rank>, Vec<_>) =
            writers.into_iter().unzip();
        for (peer, result) in peers.into_iter().zip(join_all(handles).await) {
            if let Err(e) = result {
                warn!(rank, peer, "writer task ended abnormally: {}", e);
                failure.get_or_insert(Error::LinkFailed {
                    rank: peer,
                    reason: e.to_string(),
                });
            }
        }
        if !readers.is_empty()
            && tokio::time::timeout(LINGER, join_all(readers)).await.is_err()
        {
            warn!(rank, "peers did not finish their streams in {:?}", LINGER);
            failure.get_or_insert(Error::Timeout(LINGER));
        }
        close_quietly(connections, endpoint).await;
        debug!(rank, "channel shut down");
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Builds `world_size` communicators wired together in memory.
///
/// Each ordered pair of ranks gets a forwarding task, so delivery is FIFO per
/// pair just like a network link. Must be called inside a tokio runtime.
pub fn local_world(world_size: usize) -> Vec<Communicator> {
    local_world_with_timeout(world_size, None)
}

/// [`local_world`] with a bound on every `receive` and `wait`.
pub fn local_world_with_timeout(
    world_size: usize,
    wait_timeout: Option<Duration>,
) -> Vec<Communicator> {
    let mut world: Vec<Communicator> = (0..world_size)
        .map(|rank| Communicator::new(rank, world_size, wait_timeout))
        .collect();
    let inboxes: Vec<Arc<Mailbox>> =
        world.iter().map(Communicator::inbox).collect();
    for (from, communicator) in world.iter_mut().enumerate() {
        for (to, inbox) in inboxes.iter().enumerate() {
            if from == to {
                continue;
            }
            let (outbox, mut rx) = mpsc::unbounded_channel();
            let inbox = inbox.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    inbox.deliver(from, msg);
                }
                inbox.close(from);
            });
            communicator.attach(to, outbox, forwarder, None);
        }
    }
    world
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_poll_receive() {
        let mut world = local_world(3);
        let two = world.pop().unwrap();
        let one = world.pop().unwrap();
        let zero = world.pop().unwrap();

        zero.try_send(2, Message::point(7.5)).unwrap();
        zero.try_send(1, Message::point(1.25)).unwrap();

        assert_eq!(
            two.receive(0, Tag::PointToEvaluate).await.unwrap(),
            Message::point(7.5)
        );
        assert!(!two.poll(0, Tag::PointToEvaluate).unwrap());
        one.wait(&[(0, Tag::PointToEvaluate)]).await.unwrap();
        assert!(one.poll(0, Tag::PointToEvaluate).unwrap());
        assert!(!one.poll(0, Tag::EvaluationDone).unwrap());
    }

    #[tokio::test]
    async fn same_tag_keeps_send_order() {
        let mut world = local_world(2);
        let one = world.pop().unwrap();
        let zero = world.pop().unwrap();
        for i in 0..50 {
            zero.try_send(1, Message::point(i as f64)).unwrap();
        }
        for i in 0..50 {
            assert_eq!(
                one.receive(0, Tag::PointToEvaluate).await.unwrap(),
                Message::point(i as f64)
            );
        }
    }

    #[tokio::test]
    async fn unknown_ranks_are_rejected() {
        let world = local_world(2);
        assert!(matches!(
            world[0].try_send(5, Message::WorkerDone(1)),
            Err(Error::UnknownRank(5))
        ));
        assert!(matches!(
            world[0].poll(2, Tag::WorkerDone),
            Err(Error::UnknownRank(2))
        ));
    }

    #[tokio::test]
    async fn self_send_lands_in_own_inbox() {
        let world = local_world(2);
        world[1].try_send(1, Message::WorkerDone(1)).unwrap();
        assert!(world[1].poll(1, Tag::WorkerDone).unwrap());
    }

    #[tokio::test]
    async fn bounded_wait_times_out() {
        let world =
            local_world_with_timeout(2, Some(Duration::from_millis(30)));
        let err = world[0]
            .receive(1, Tag::EvaluatedPoint)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn dead_writer_makes_peer_unreachable() {
        let mut world = local_world(2);
        let _one = world.pop().unwrap();
        let mut zero = world.pop().unwrap();
        let (peer, forwarder) = zero.writers.pop().unwrap();
        assert_eq!(peer, 1);
        forwarder.abort();
        assert!(forwarder.await.unwrap_err().is_cancelled());

        assert!(matches!(
            zero.try_send(1, Message::point(1.0)),
            Err(Error::PeerUnreachable(1))
        ));
    }

    #[tokio::test]
    async fn shutdown_reports_a_broken_writer() {
        let mut world = local_world(3);
        let zero = world.remove(0);
        for (peer, forwarder) in &zero.writers {
            if *peer == 2 {
                forwarder.abort();
            }
        }
        let err = zero.shutdown().await.unwrap_err();
        assert!(matches!(err, Error::LinkFailed { rank: 2, .. }));
    }

    #[tokio::test]
    async fn shutdown_closes_peer_links() {
        let mut world = local_world(2);
        let one = world.pop().unwrap();
        let zero = world.pop().unwrap();
        zero.try_send(1, Message::EvaluationDone(1)).unwrap();
        zero.shutdown().await.unwrap();

        // queued traffic survives the sender's shutdown
        assert!(matches!(
            one.receive(0, Tag::EvaluationDone).await.unwrap(),
            Message::EvaluationDone(_)
        ));
        let err = one.receive(0, Tag::PointToEvaluate).await.unwrap_err();
        assert!(matches!(err, Error::PeerClosed(0)));
    }
}
