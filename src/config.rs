use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs},
    path::PathBuf,
    time::Duration,
};

use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    mesh::{ip_addr_to_socket_addr, Rank},
};

/// Certificate shared by every rank. Without files, each rank generates its
/// own and peers go unverified.
#[derive(Debug, Clone, TypedBuilder)]
pub struct TlsConfig {
    #[builder(default, setter(strip_option))]
    pub cert_path: Option<PathBuf>,
    #[builder(default, setter(strip_option))]
    pub key_path: Option<PathBuf>,
    /// Name the certificate is issued for and clients expect.
    #[builder(default = String::from("localhost"), setter(into))]
    pub server_name: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// The static process topology and how to reach it.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ClusterConfig {
    /// Total number of ranks, coordinator included.
    pub world_size: usize,
    /// `hosts[r]` is where rank r listens.
    pub hosts: Vec<SocketAddr>,
    #[builder(default)]
    pub tls: TlsConfig,
    #[builder(default = Duration::from_secs(30))]
    pub connect_timeout: Duration,
    /// Bound on any single wait for a message. `None` waits forever.
    #[builder(default, setter(strip_option))]
    pub wait_timeout: Option<Duration>,
}

impl ClusterConfig {
    /// Every rank on the loopback interface, rank r on `base_port + r`.
    pub fn localhost(world_size: usize, base_port: u16) -> Result<Self> {
        let hosts = (0..world_size)
            .map(|rank| {
                u16::try_from(rank)
                    .ok()
                    .and_then(|rank| base_port.checked_add(rank))
                    .map(|port| {
                        ip_addr_to_socket_addr(
                            IpAddr::V4(Ipv4Addr::LOCALHOST),
                            port,
                        )
                    })
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "{} ranks do not fit above port {}",
                            world_size, base_port
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::builder().world_size(world_size).hosts(hosts).build())
    }

    /// Rejects topologies the protocol cannot run on.
    pub fn validate(&self) -> Result<()> {
        if self.world_size < 2 {
            Err(Error::Config(format!(
                "need at least one worker, world size is {}",
                self.world_size
            )))?
        }
        if self.hosts.len() < self.world_size {
            Err(Error::Config(format!(
                "{} ranks but only {} host addresses",
                self.world_size,
                self.hosts.len()
            )))?
        }
        Ok(())
    }

    pub fn addr(&self, rank: Rank) -> Result<SocketAddr> {
        if rank >= self.world_size {
            Err(Error::UnknownRank(rank))?
        }
        self.hosts
            .get(rank)
            .copied()
            .ok_or(Error::UnknownRank(rank))
    }
}

/// Parses a hostfile: one `host:port` per line, line i is rank i. Blank
/// lines and `#` comments are skipped.
pub fn parse_hostfile(text: &str) -> Result<Vec<SocketAddr>> {
    text.lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.to_socket_addrs()
                .map_err(|e| {
                    Error::Config(format!("bad host entry {:?}: {}", line, e))
                })?
                .next()
                .ok_or_else(|| {
                    Error::Config(format!("{:?} resolves to nothing", line))
                })
        })
        .collect()
}
