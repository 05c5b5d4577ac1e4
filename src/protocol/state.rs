use std::fmt;

use crate::{
    error::{Error, Result},
    mesh::wire::Tag,
};

/// Where a worker agent is in its life. Each step is driven by a tag the
/// agent received or sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    AwaitingWork,
    Evaluating,
    ShuttingDown,
    Terminated,
}

impl WorkerState {
    pub fn on(self, tag: Tag) -> Result<Self> {
        use WorkerState::*;
        match (self, tag) {
            (AwaitingWork, Tag::PointToEvaluate) => Ok(Evaluating),
            (Evaluating, Tag::EvaluatedPoint) => Ok(AwaitingWork),
            (AwaitingWork, Tag::EvaluationDone) => Ok(ShuttingDown),
            (ShuttingDown, Tag::WorkerDone) => Ok(Terminated),
            (state, tag) => Err(Error::Protocol(format!(
                "worker in {} cannot handle {:?}",
                state, tag
            ))),
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Phases of the coordinator. They only ever move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CoordinatorState {
    Distributing,
    Collecting,
    Stopping,
    AwaitingAcks,
    Done,
}

impl CoordinatorState {
    /// The phase that follows this one.
    pub fn next(self) -> Result<Self> {
        use CoordinatorState::*;
        match self {
            Distributing => Ok(Collecting),
            Collecting => Ok(Stopping),
            Stopping => Ok(AwaitingAcks),
            AwaitingAcks => Ok(Done),
            Done => Err(Error::Protocol("coordinator is already done".into())),
        }
    }

    /// The tag the coordinator receives in this phase, if any.
    pub fn expects(self) -> Option<Tag> {
        match self {
            CoordinatorState::Collecting => Some(Tag::EvaluatedPoint),
            CoordinatorState::AwaitingAcks => Some(Tag::WorkerDone),
            _ => None,
        }
    }

    /// The tag the coordinator sends in this phase, if any.
    pub fn sends(self) -> Option<Tag> {
        match self {
            CoordinatorState::Distributing => Some(Tag::PointToEvaluate),
            CoordinatorState::Stopping => Some(Tag::EvaluationDone),
            _ => None,
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
