use std::{
    fs::File,
    io::BufReader,
    net::SocketAddr,
    path::Path,
    sync::Arc,
    time::{Duration, Instant, SystemTime},
};

use futures::future::try_join_all;
use hashbrown::HashSet;
use quinn::{ConnectionError, VarInt};
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate as RustlsCert, PrivateKey, RootCertStore, ServerName,
};
use tracing::{debug, info, info_span, warn, Instrument};

use super::{
    communicator::Communicator,
    link::{Link, RunningLink},
    wire::Hello,
    Rank, KEEP_ALIVE,
};
use crate::{
    config::{ClusterConfig, TlsConfig},
    error::{Error, Result},
};

/// Pause between attempts to reach a rank that is not listening yet.
const REDIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Handshake and idle timeout for every link, in milliseconds.
const MAX_IDLE_MS: u32 = 10_000;

/// A bound QUIC endpoint for one rank that has not joined the mesh yet.
///
/// Binding and joining are separate so a rank can bind an ephemeral port and
/// publish the address before anybody dials it.
pub struct MeshEndpoint {
    ep: quinn::Endpoint,
    rank: Rank,
    world_size: usize,
    server_name: String,
}

impl MeshEndpoint {
    /// Binds the rank's UDP socket with client and server TLS ready.
    pub fn bind(
        rank: Rank,
        world_size: usize,
        addr: SocketAddr,
        tls: &TlsConfig,
    ) -> Result<Self> {
        if rank >= world_size {
            Err(Error::UnknownRank(rank))?
        }
        Hello::new(rank, world_size)?;
        let (client_config, server_config) = Self::quic_config(tls)?;
        let mut ep = quinn::Endpoint::server(server_config, addr)?;
        ep.set_default_client_config(client_config);
        debug!(rank, addr = %ep.local_addr()?, "bound mesh endpoint");
        Ok(Self {
            ep,
            rank,
            world_size,
            server_name: tls.server_name.clone(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.ep.local_addr()?)
    }

    /// Connects to every other rank: dials the lower ranks and accepts the
    /// higher ones at the same time. `hosts[r]` is rank r's address.
    pub async fn join(
        self,
        hosts: &[SocketAddr],
        connect_timeout: Duration,
        wait_timeout: Option<Duration>,
    ) -> Result<Communicator> {
        if hosts.len() < self.world_size {
            Err(Error::Config(format!(
                "{} ranks but only {} host addresses",
                self.world_size,
                hosts.len()
            )))?
        }
        let span = info_span!("mesh", rank = self.rank);
        async move {
            let me = Hello::new(self.rank, self.world_size)?;
            let deadline = Instant::now() + connect_timeout;
            let dials = (0..self.rank).map(|peer| {
                self.dial(peer, hosts[peer], me, deadline, connect_timeout)
            });
            let accepting = async {
                let accepted = tokio::time::timeout(
                    connect_timeout,
                    self.accept_higher(me),
                );
                match accepted.await {
                    Ok(links) => links,
                    Err(_) => Err(Error::Timeout(connect_timeout)),
                }
            };
            let (dialed, accepted) =
                tokio::try_join!(try_join_all(dials), accepting)?;
            info!(peers = self.world_size - 1, "joined mesh");

            let communicator = Communicator::from_links(
                self.rank,
                self.world_size,
                dialed.into_iter().chain(accepted),
                Some(self.ep),
                wait_timeout,
            );
            Ok::<_, Error>(communicator)
        }
        .instrument(span)
        .await
    }

    /// Dials `peer` until it answers or the deadline passes. Ranks start in
    /// any order, so an unanswered handshake is retried.
    async fn dial(
        &self,
        peer: Rank,
        addr: SocketAddr,
        me: Hello,
        deadline: Instant,
        connect_timeout: Duration,
    ) -> Result<Link> {
        loop {
            let connecting = self.ep.connect(addr, &self.server_name)?;
            match Link::dial(connecting, me, peer).await {
                Ok(link) => return Ok(link),
                Err(Error::Connection(ConnectionError::TimedOut))
                    if Instant::now() < deadline =>
                {
                    debug!(peer, %addr, "peer not answering yet, redialing");
                    tokio::time::sleep(REDIAL_BACKOFF).await;
                }
                Err(Error::Connection(ConnectionError::TimedOut)) => {
                    Err(Error::Timeout(connect_timeout))?
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Accepts one link from each rank above ours.
    async fn accept_higher(&self, me: Hello) -> Result<Vec<Link>> {
        let expected = self.world_size - 1 - self.rank;
        let allowed = self.rank + 1..self.world_size;
        let mut seen = HashSet::new();
        let mut links = Vec::with_capacity(expected);
        while links.len() < expected {
            let in_progress = self.ep.accept().await.ok_or_else(|| {
                Error::Config("endpoint closed while accepting".into())
            })?;
            let remote = in_progress.remote_address();
            let link = Link::accept(in_progress, me, allowed.clone()).await?;
            if !seen.insert(link.peer()) {
                warn!(peer = link.peer(), %remote, "duplicate rank");
                Err(Error::BadHandshake(remote))?
            }
            links.push(link);
        }
        Ok(links)
    }

    /// Returns quinn client and server configurations for the cluster's
    /// certificate. Clients pin that certificate when it comes from disk and
    /// skip verification when it was generated for this process alone.
    fn quic_config(
        tls: &TlsConfig,
    ) -> Result<(quinn::ClientConfig, quinn::ServerConfig)> {
        let (cert_chain, key, pinned) = match (&tls.cert_path, &tls.key_path) {
            (Some(cert), Some(key)) => {
                let chain = load_certs(cert)?;
                let key = load_key(key)?;
                (chain.clone(), key, Some(chain))
            }
            (None, None) => {
                warn!(
                    "no cluster certificate configured, generating a \
                     throwaway one; peers will not be verified"
                );
                let cert =
                    rcgen::generate_simple_self_signed(vec![tls
                        .server_name
                        .clone()])?;
                let der = cert.serialize_der()?;
                let key = cert.serialize_private_key_der();
                (vec![RustlsCert(der)], PrivateKey(key), None)
            }
            _ => Err(Error::Config(
                "a cluster certificate needs both a cert and a key".into(),
            ))?,
        };

        let client_tls = match pinned {
            Some(chain) => {
                let mut roots = RootCertStore::empty();
                let ders: Vec<Vec<u8>> =
                    chain.into_iter().map(|cert| cert.0).collect();
                let (added, _) = roots.add_parsable_certificates(&ders);
                if added == 0 {
                    Err(Error::Config(
                        "cluster certificate could not be parsed".into(),
                    ))?
                }
                rustls::ClientConfig::builder()
                    .with_safe_defaults()
                    .with_root_certificates(roots)
                    .with_no_client_auth()
            }
            None => rustls::ClientConfig::builder()
                .with_safe_defaults()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServer))
                .with_no_client_auth(),
        };

        // shared transport configuration for the server and client sides
        // this is the default config with the BBR congestion controller
        // enabled
        let mut transport_config = quinn::TransportConfig::default();
        let bbr_config = quinn::congestion::BbrConfig::default();
        transport_config.congestion_controller_factory(Arc::new(bbr_config));
        transport_config.keep_alive_interval(Some(KEEP_ALIVE));
        transport_config
            .max_idle_timeout(Some(VarInt::from_u32(MAX_IDLE_MS).into()));
        let transport_config = Arc::new(transport_config);

        let mut server_config =
            quinn::ServerConfig::with_single_cert(cert_chain, key)?;
        server_config.transport_config(transport_config.clone());

        let mut client_config = quinn::ClientConfig::new(Arc::new(client_tls));
        client_config.transport_config(transport_config);

        Ok((client_config, server_config))
    }
}

impl Communicator {
    fn from_links(
        rank: Rank,
        world_size: usize,
        links: impl IntoIterator<Item = Link>,
        ep: Option<quinn::Endpoint>,
        wait_timeout: Option<Duration>,
    ) -> Self {
        let mut communicator = Communicator::new(rank, world_size, wait_timeout);
        for link in links {
            let RunningLink {
                peer,
                conn,
                outbox,
                writer,
                reader,
            } = link.start(communicator.inbox());
            communicator.attach(peer, outbox, writer, Some(reader));
            communicator.attach_connection(conn);
        }
        if let Some(ep) = ep {
            communicator.attach_endpoint(ep);
        }
        communicator
    }
}

/// Binds and joins the mesh for `rank` as described by `config`.
pub async fn connect(config: &ClusterConfig, rank: Rank) -> Result<Communicator> {
    config.validate()?;
    let addr = config.addr(rank)?;
    let endpoint = MeshEndpoint::bind(rank, config.world_size, addr, &config.tls)?;
    endpoint
        .join(&config.hosts, config.connect_timeout, config.wait_timeout)
        .await
}

/// Closes every connection once both directions have finished.
pub(crate) async fn close_quietly(
    connections: Vec<quinn::Connection>,
    ep: Option<quinn::Endpoint>,
) {
    for conn in connections {
        conn.close(VarInt::from_u32(0), b"done");
    }
    if let Some(ep) = ep {
        ep.wait_idle().await;
    }
}

/// Generates a cluster certificate and key as PEM, for `gen-cert`.
pub fn generate_cluster_cert(server_name: &str) -> Result<(String, String)> {
    let cert = rcgen::generate_simple_self_signed(vec![server_name.into()])?;
    Ok((cert.serialize_pem()?, cert.serialize_private_key_pem()))
}

fn load_certs(path: &Path) -> Result<Vec<RustlsCert>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)?;
    if certs.is_empty() {
        Err(Error::Config(format!(
            "no certificates found in {}",
            path.display()
        )))?
    }
    Ok(certs.into_iter().map(RustlsCert).collect())
}

fn load_key(path: &Path) -> Result<PrivateKey> {
    let mut keys =
        rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(File::open(path)?))?;
    if keys.len() != 1 {
        Err(Error::Config(format!(
            "expected exactly one private key in {}, found {}",
            path.display(),
            keys.len()
        )))?
    }
    Ok(PrivateKey(keys.remove(0)))
}

/// Used only with a certificate generated for this process, which no peer
/// could pin anyway.
struct AcceptAnyServer;

impl ServerCertVerifier for AcceptAnyServer {
    fn verify_server_cert(
        &self,
        _end_entity: &RustlsCert,
        _intermediates: &[RustlsCert],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn generated_cert_loads_back() {
        let (cert, key) = generate_cluster_cert("localhost").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        File::create(&cert_path)
            .unwrap()
            .write_all(cert.as_bytes())
            .unwrap();
        File::create(&key_path)
            .unwrap()
            .write_all(key.as_bytes())
            .unwrap();

        assert_eq!(load_certs(&cert_path).unwrap().len(), 1);
        assert!(!load_key(&key_path).unwrap().0.is_empty());
    }

    #[test]
    fn key_file_without_keys_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        File::create(&path).unwrap();
        assert!(matches!(load_key(&path), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn half_configured_tls_is_rejected() {
        let tls = TlsConfig {
            cert_path: Some("cert.pem".into()),
            key_path: None,
            server_name: "localhost".into(),
        };
        let addr = "127.0.0.1:0".parse().unwrap();
        assert!(matches!(
            MeshEndpoint::bind(0, 2, addr, &tls),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    #[cfg(target_pointer_width = "64")]
    async fn world_too_wide_for_the_wire_is_rejected() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let world_size = u32::MAX as usize + 1;
        assert!(matches!(
            MeshEndpoint::bind(0, world_size, addr, &TlsConfig::default()),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn rank_outside_world_is_rejected() {
        let addr = "127.0.0.1:0".parse().unwrap();
        assert!(matches!(
            MeshEndpoint::bind(2, 2, addr, &TlsConfig::default()),
            Err(Error::UnknownRank(2))
        ));
    }
}
