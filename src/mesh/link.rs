use std::{net::SocketAddr, ops::Range, sync::Arc};

use quinn::{
    Connecting, ConnectionError, ReadError, ReadExactError, RecvStream,
    SendStream, WriteError,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, debug_span, warn, Instrument};

use super::{
    mailbox::Mailbox,
    wire::{Hello, Message, Tag},
    Rank,
};
use crate::error::{Error, Result};

/// A QUIC connection to one peer rank, carrying a single bidirectional
/// stream for all tags.
pub struct Link {
    peer: Rank,
    conn: quinn::Connection,
    send: SendStream,
    recv: RecvStream,
}

/// A link after its stream halves have been handed to background tasks.
pub struct RunningLink {
    pub peer: Rank,
    pub conn: quinn::Connection,
    pub outbox: mpsc::UnboundedSender<Message>,
    pub writer: JoinHandle<()>,
    pub reader: JoinHandle<()>,
}

impl Link {
    /// Completes an outgoing connection to `expected` and exchanges hellos.
    /// The dialing side opens the stream and speaks first.
    pub async fn dial(
        in_progress: Connecting,
        me: Hello,
        expected: Rank,
    ) -> Result<Self> {
        let remote_addr = in_progress.remote_address();
        let span = debug_span!("link", peer = expected, remote = %remote_addr);
        async move {
            let conn = in_progress.await?;
            debug!("connected via QUIC");
            let (mut send, mut recv) = conn.open_bi().await?;
            send.write_all(&me.encode()?).await?;
            debug!("sent hello");

            let theirs = read_hello(&mut recv, remote_addr).await?;
            if theirs.rank != expected {
                Err(Error::BadHandshake(remote_addr))?
            }
            check_world_size(&theirs, &me)?;
            debug!("handshake complete");

            Ok::<_, Error>(Link {
                peer: expected,
                conn,
                send,
                recv,
            })
        }
        .instrument(span)
        .await
    }

    /// Completes an incoming connection. The peer must claim a rank inside
    /// `allowed`; the caller rejects duplicates.
    pub async fn accept(
        in_progress: Connecting,
        me: Hello,
        allowed: Range<Rank>,
    ) -> Result<Self> {
        let remote_addr = in_progress.remote_address();
        let span = debug_span!("link", remote = %remote_addr);
        async move {
            let conn = in_progress.await?;
            debug!("accepted QUIC connection, waiting for peer's stream");
            let (mut send, mut recv) = conn.accept_bi().await?;

            let theirs = read_hello(&mut recv, remote_addr).await?;
            if !allowed.contains(&theirs.rank) {
                Err(Error::BadHandshake(remote_addr))?
            }
            check_world_size(&theirs, &me)?;
            send.write_all(&me.encode()?).await?;
            debug!(peer = theirs.rank, "handshake complete");

            Ok::<_, Error>(Link {
                peer: theirs.rank,
                conn,
                send,
                recv,
            })
        }
        .instrument(span)
        .await
    }

    pub fn peer(&self) -> Rank {
        self.peer
    }

    /// Spawns the writer and reader tasks for this link. Frames read from
    /// the peer land in `inbox`; messages pushed to the returned outbox are
    /// written in order.
    pub fn start(self, inbox: Arc<Mailbox>) -> RunningLink {
        let Link {
            peer,
            conn,
            send,
            recv,
        } = self;
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let span = debug_span!("link", peer);
        let writer = tokio::spawn(
            write_loop(peer, send, outbox_rx).instrument(span.clone()),
        );
        let reader =
            tokio::spawn(read_loop(peer, recv, inbox).instrument(span));
        RunningLink {
            peer,
            conn,
            outbox,
            writer,
            reader,
        }
    }
}

async fn read_hello(
    recv: &mut RecvStream,
    remote_addr: SocketAddr,
) -> Result<Hello> {
    let mut buf = [0u8; Hello::LEN];
    recv.read_exact(&mut buf).await?;
    Hello::decode(&buf).ok_or(Error::BadHandshake(remote_addr))
}

fn check_world_size(theirs: &Hello, ours: &Hello) -> Result<()> {
    if theirs.world_size != ours.world_size {
        Err(Error::WorldSizeMismatch {
            peer: theirs.rank,
            theirs: theirs.world_size,
            ours: ours.world_size,
        })?
    }
    Ok(())
}

/// A peer closing the connection on purpose ends the link, it does not
/// break it.
fn closed_on_purpose(error: &ConnectionError) -> bool {
    matches!(
        error,
        ConnectionError::ApplicationClosed(_) | ConnectionError::LocallyClosed
    )
}

async fn write_loop(
    peer: Rank,
    mut send: SendStream,
    mut outbox: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = outbox.recv().await {
        if let Err(e) = send.write_all(&msg.encode()).await {
            // dropping the receiver makes further sends to this peer fail
            warn!(peer, "write failed: {}", e);
            return;
        }
        debug!(peer, tag = ?msg.tag(), "sent message");
    }
    // the outbox closes only on shutdown; finishing waits for the peer to
    // acknowledge everything written
    match send.finish().await {
        Ok(()) => debug!(peer, "stream finished"),
        Err(WriteError::ConnectionLost(e)) if closed_on_purpose(&e) => {
            debug!(peer, "peer closed before acknowledging finish");
        }
        Err(e) => warn!(peer, "could not finish stream: {}", e),
    }
}

async fn read_loop(peer: Rank, mut recv: RecvStream, inbox: Arc<Mailbox>) {
    loop {
        match read_frame(&mut recv).await {
            Ok(Some(msg)) => inbox.deliver(peer, msg),
            Ok(None) => {
                debug!(peer, "peer finished its stream");
                inbox.close(peer);
                return;
            }
            Err(Error::Read(ReadExactError::ReadError(
                ReadError::ConnectionLost(e),
            ))) if closed_on_purpose(&e) => {
                debug!(peer, "connection closed");
                inbox.close(peer);
                return;
            }
            Err(e) => {
                warn!(peer, "link failed: {}", e);
                inbox.fail(peer, e.to_string());
                return;
            }
        }
    }
}

/// Reads one `tag | payload` frame. `None` means the peer finished the
/// stream on a frame boundary.
async fn read_frame(recv: &mut RecvStream) -> Result<Option<Message>> {
    let mut tag = [0u8; 1];
    match recv.read_exact(&mut tag).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly) => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let tag = Tag::try_from(tag[0])?;
    let mut payload = vec![0u8; tag.payload_len()];
    recv.read_exact(&mut payload).await?;
    Message::decode(tag, &payload).map(Some)
}
