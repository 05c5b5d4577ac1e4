use std::{io, net::SocketAddr, time::Duration};

use quinn::{ConnectError, ConnectionError, ReadExactError, WriteError};
use thiserror::Error;

use crate::mesh::{wire::Tag, Rank};

/// Everything that can stop a rank. Channel and configuration faults are
/// fatal for the run; a failed evaluation is data, not an `Error`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("could not start connecting: {0}")]
    Connect(#[from] ConnectError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("stream write failed: {0}")]
    Write(#[from] WriteError),

    #[error("stream read failed: {0}")]
    Read(#[from] ReadExactError),

    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::RcgenError),

    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    #[error("{tag:?} payload must be {expected} bytes, got {actual}")]
    PayloadLength {
        tag: Tag,
        expected: usize,
        actual: usize,
    },

    #[error("bad handshake from {0}")]
    BadHandshake(SocketAddr),

    #[error("rank {peer} runs with world size {theirs}, expected {ours}")]
    WorldSizeMismatch {
        peer: Rank,
        theirs: usize,
        ours: usize,
    },

    #[error("rank {0} is not part of the topology")]
    UnknownRank(Rank),

    #[error("rank {0} is unreachable")]
    PeerUnreachable(Rank),

    #[error("rank {0} closed its link")]
    PeerClosed(Rank),

    #[error("link to rank {rank} failed: {reason}")]
    LinkFailed { rank: Rank, reason: String },

    #[error("no message arrived within {0:?}")]
    Timeout(Duration),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_length_names_the_tag() {
        let err = Error::PayloadLength {
            tag: Tag::EvaluatedPoint,
            expected: 24,
            actual: 8,
        };
        let msg = err.to_string();
        assert!(msg.contains("EvaluatedPoint"));
        assert!(msg.contains("24"));
        assert!(msg.contains('8'));
    }

    #[test]
    fn io_errors_convert() {
        let err: Error =
            io::Error::new(io::ErrorKind::AddrInUse, "port taken").into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("port taken"));
    }

    #[test]
    fn timeout_reports_duration() {
        let err = Error::Timeout(Duration::from_millis(250));
        assert!(err.to_string().contains("250ms"));
    }
}
