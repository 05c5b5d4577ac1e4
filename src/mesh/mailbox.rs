use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use hashbrown::HashMap;
use tokio::sync::Notify;
use tracing::trace;

use super::{
    wire::{Message, Tag},
    Rank,
};
use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
enum LinkState {
    Open,
    /// The peer finished its stream; whatever it sent is already queued.
    Closed,
    Failed(String),
}

#[derive(Default)]
struct Inbox {
    queues: HashMap<(Rank, Tag), VecDeque<Message>>,
    links: HashMap<Rank, LinkState>,
}

impl Inbox {
    fn has(&self, source: Rank, tag: Tag) -> bool {
        self.queues
            .get(&(source, tag))
            .map_or(false, |queue| !queue.is_empty())
    }

    fn link(&self, source: Rank) -> &LinkState {
        self.links.get(&source).unwrap_or(&LinkState::Open)
    }

    /// Error for a source that will never deliver again, if it is one.
    fn dead_end(&self, source: Rank) -> Option<Error> {
        match self.link(source) {
            LinkState::Open => None,
            LinkState::Closed => Some(Error::PeerClosed(source)),
            LinkState::Failed(reason) => Some(Error::LinkFailed {
                rank: source,
                reason: reason.clone(),
            }),
        }
    }
}

/// Incoming messages for one rank, queued per `(source, tag)`.
///
/// Transport tasks push with [`Mailbox::deliver`]; the rank's own thread of
/// control pops with [`Mailbox::take`]. A single [`Notify`] permit wakes a
/// waiting rank on every delivery or link state change, so a wakeup that
/// lands between a failed check and the suspension is never lost.
pub struct Mailbox {
    inbox: Mutex<Inbox>,
    notify: Notify,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            inbox: Mutex::new(Inbox::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inbox> {
        // no invariant spans more than one field update, so a poisoned
        // inbox is still consistent
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn deliver(&self, source: Rank, msg: Message) {
        trace!(source, tag = ?msg.tag(), "queued message");
        self.lock()
            .queues
            .entry((source, msg.tag()))
            .or_default()
            .push_back(msg);
        self.notify.notify_one();
    }

    /// Marks the link from `source` as finished after a clean end of stream.
    pub fn close(&self, source: Rank) {
        self.lock().links.insert(source, LinkState::Closed);
        self.notify.notify_one();
    }

    /// Marks the link from `source` as broken.
    pub fn fail(&self, source: Rank, reason: impl Into<String>) {
        self.lock()
            .links
            .insert(source, LinkState::Failed(reason.into()));
        self.notify.notify_one();
    }

    /// Non-consuming check. A closed link with nothing queued reads as empty;
    /// a failed one is an error.
    pub fn peek(&self, source: Rank, tag: Tag) -> Result<bool> {
        let inbox = self.lock();
        if inbox.has(source, tag) {
            return Ok(true);
        }
        match inbox.link(source) {
            LinkState::Failed(reason) => Err(Error::LinkFailed {
                rank: source,
                reason: reason.clone(),
            }),
            _ => Ok(false),
        }
    }

    pub fn take(&self, source: Rank, tag: Tag) -> Option<Message> {
        self.lock().queues.get_mut(&(source, tag))?.pop_front()
    }

    /// Number of messages queued for `(source, tag)`.
    #[cfg(test)]
    pub fn pending(&self, source: Rank, tag: Tag) -> usize {
        self.lock()
            .queues
            .get(&(source, tag))
            .map_or(0, VecDeque::len)
    }

    /// Returns once any of `interests` has a queued message.
    ///
    /// Fails when none of them can ever be satisfied: every interested
    /// source has closed or failed with nothing left in its queue.
    pub async fn ready(&self, interests: &[(Rank, Tag)]) -> Result<()> {
        loop {
            {
                let inbox = self.lock();
                if interests.iter().any(|&(src, tag)| inbox.has(src, tag)) {
                    return Ok(());
                }
                let mut dead = interests
                    .iter()
                    .map(|&(source, _)| inbox.dead_end(source));
                if let Some(Some(first)) = dead.next() {
                    if dead.all(|e| e.is_some()) {
                        return Err(first);
                    }
                }
            }
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;

    #[test]
    fn queues_are_fifo_per_tag() {
        let mailbox = Mailbox::new();
        mailbox.deliver(1, Message::point(1.0));
        mailbox.deliver(1, Message::EvaluationDone(1));
        mailbox.deliver(1, Message::point(2.0));

        assert!(mailbox.peek(1, Tag::PointToEvaluate).unwrap());
        assert_eq!(mailbox.pending(1, Tag::PointToEvaluate), 2);
        assert_eq!(
            mailbox.take(1, Tag::PointToEvaluate),
            Some(Message::point(1.0))
        );
        assert_eq!(
            mailbox.take(1, Tag::PointToEvaluate),
            Some(Message::point(2.0))
        );
        assert_eq!(mailbox.take(1, Tag::PointToEvaluate), None);
        assert!(mailbox.peek(1, Tag::EvaluationDone).unwrap());
    }

    #[test]
    fn tags_and_sources_do_not_mix() {
        let mailbox = Mailbox::new();
        mailbox.deliver(2, Message::WorkerDone(1));
        assert!(!mailbox.peek(2, Tag::EvaluatedPoint).unwrap());
        assert!(!mailbox.peek(1, Tag::WorkerDone).unwrap());
        assert!(mailbox.peek(2, Tag::WorkerDone).unwrap());
    }

    #[test]
    fn failed_link_errors_once_drained() {
        let mailbox = Mailbox::new();
        mailbox.deliver(1, Message::evaluated(1.0, 1.0, true));
        mailbox.fail(1, "reset by peer");
        assert!(mailbox.peek(1, Tag::EvaluatedPoint).unwrap());
        mailbox.take(1, Tag::EvaluatedPoint);
        assert!(matches!(
            mailbox.peek(1, Tag::EvaluatedPoint),
            Err(Error::LinkFailed { rank: 1, .. })
        ));
    }

    #[test]
    fn closed_link_reads_empty() {
        let mailbox = Mailbox::new();
        mailbox.close(3);
        assert!(!mailbox.peek(3, Tag::WorkerDone).unwrap());
    }

    #[tokio::test]
    async fn ready_wakes_on_delivery() {
        let mailbox = Arc::new(Mailbox::new());
        let waiter = {
            let mailbox = mailbox.clone();
            tokio::spawn(async move {
                mailbox.ready(&[(1, Tag::EvaluatedPoint)]).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        // unrelated traffic must not satisfy the wait
        mailbox.deliver(2, Message::evaluated(0.0, 0.0, true));
        mailbox.deliver(1, Message::evaluated(1.0, 1.0, true));
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ready_gives_up_when_every_source_is_gone() {
        let mailbox = Mailbox::new();
        mailbox.close(1);
        mailbox.fail(2, "timed out");
        let err = mailbox
            .ready(&[(1, Tag::WorkerDone), (2, Tag::WorkerDone)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerClosed(1)));
    }
}
