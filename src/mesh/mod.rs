// The mesh is the only way ranks talk to each other. Every rank owns a
// mailbox that background tasks fill as frames arrive, and one outbound queue
// per peer that a writer task drains onto the wire. The protocol layer never
// touches a socket: it enqueues with `try_send`, checks with `poll`, and
// suspends with `wait` until something it cares about shows up.
//
// Links are QUIC connections carrying a single bidirectional stream each.
// All four tags share that stream, which gives FIFO per (sender, receiver)
// pair and therefore per (sender, receiver, tag) triple. The same mailbox and
// queues also back an in-process world, used when every rank lives inside one
// tokio runtime.

use std::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};

mod communicator;
pub mod endpoint;
mod link;
mod mailbox;
pub mod wire;

pub use communicator::{local_world, local_world_with_timeout, Communicator};
pub use endpoint::{connect, generate_cluster_cert, MeshEndpoint};
pub use mailbox::Mailbox;

/// Fixed identity of a process for the lifetime of a run.
pub type Rank = usize;

/// Rank 0 is always the coordinator.
pub const COORDINATOR: Rank = 0;

/// First port used when every rank runs on one host.
pub const DEFAULT_BASE_PORT: u16 = 47100;

/// Keeps links alive while a rank sits idle waiting for the others.
const KEEP_ALIVE: Duration = Duration::from_secs(1);

/// How long shutdown waits for peers to finish their side of each link.
const LINGER: Duration = Duration::from_secs(5);

/// Converts an IP address and port to a socket address.
pub(crate) fn ip_addr_to_socket_addr(ip: IpAddr, port: u16) -> SocketAddr {
    match ip {
        IpAddr::V4(ip) => SocketAddr::from((ip, port)),
        IpAddr::V6(ip) => SocketAddr::from((ip, port)),
    }
}
