//! Argument parsing for the `evalmesh` binary.

use std::{ffi::OsString, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use evalmesh::{
    config::parse_hostfile, mesh::DEFAULT_BASE_PORT, points::DEFAULT_POINT_COUNT,
    ClusterConfig, Rank, TlsConfig,
};

/// Evaluates a batch of points across a coordinator and its workers.
#[derive(Parser, Debug)]
#[command(name = "evalmesh")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Verbose logging (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one rank of a cluster.
    Run(RunArgs),

    /// Start every rank of a cluster on this host.
    Launch(LaunchArgs),

    /// Run a whole cluster inside this process.
    Simulate(SimulateArgs),

    /// Write a cluster certificate and key shared by every rank.
    GenCert(GenCertArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// This process's rank; rank 0 coordinates.
    #[arg(long, env = "EVALMESH_RANK")]
    pub rank: Rank,

    /// Number of ranks, coordinator included.
    #[arg(long, env = "EVALMESH_WORLD_SIZE")]
    pub world_size: usize,

    #[command(flatten)]
    pub cluster: ClusterArgs,
}

#[derive(Args, Debug)]
pub struct LaunchArgs {
    /// Number of processes to start.
    #[arg(short = 'n', long = "np")]
    pub procs: usize,

    #[command(flatten)]
    pub cluster: ClusterArgs,
}

/// Options every rank of a cluster must agree on.
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Points the coordinator evaluates.
    #[arg(long, env = "EVALMESH_POINTS", default_value_t = DEFAULT_POINT_COUNT)]
    pub points: usize,

    /// Seed for point generation.
    #[arg(long, env = "EVALMESH_SEED")]
    pub seed: Option<u64>,

    /// File listing `host:port` per rank, one per line.
    #[arg(long, env = "EVALMESH_HOSTFILE", conflicts_with = "base_port")]
    pub hostfile: Option<PathBuf>,

    /// Without a hostfile, rank r listens on 127.0.0.1 at this port plus r.
    #[arg(long, env = "EVALMESH_BASE_PORT", default_value_t = DEFAULT_BASE_PORT)]
    pub base_port: u16,

    /// PEM cluster certificate.
    #[arg(long, env = "EVALMESH_CERT", requires = "key")]
    pub cert: Option<PathBuf>,

    /// PEM private key for the cluster certificate.
    #[arg(long, env = "EVALMESH_KEY", requires = "cert")]
    pub key: Option<PathBuf>,

    /// Name the cluster certificate is issued for.
    #[arg(long, env = "EVALMESH_SERVER_NAME", default_value = "localhost")]
    pub server_name: String,

    /// Seconds to wait for the whole mesh to come up.
    #[arg(long, env = "EVALMESH_CONNECT_TIMEOUT", default_value_t = 30)]
    pub connect_timeout_secs: u64,

    /// Seconds any single wait for a message may take.
    #[arg(long, env = "EVALMESH_WAIT_TIMEOUT")]
    pub wait_timeout_secs: Option<u64>,
}

impl ClusterArgs {
    pub fn cluster_config(&self, world_size: usize) -> Result<ClusterConfig> {
        let mut config = match &self.hostfile {
            Some(path) => {
                let text = std::fs::read_to_string(path).with_context(|| {
                    format!("reading hostfile {}", path.display())
                })?;
                ClusterConfig::builder()
                    .world_size(world_size)
                    .hosts(parse_hostfile(&text)?)
                    .build()
            }
            None => ClusterConfig::localhost(world_size, self.base_port)?,
        };
        config.tls = TlsConfig {
            cert_path: self.cert.clone(),
            key_path: self.key.clone(),
            server_name: self.server_name.clone(),
        };
        config.connect_timeout = Duration::from_secs(self.connect_timeout_secs);
        config.wait_timeout = self.wait_timeout_secs.map(Duration::from_secs);
        config.validate()?;
        Ok(config)
    }

    /// Flags that reproduce these options on a child `run` command.
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--points".into(),
            self.points.to_string().into(),
            "--server-name".into(),
            self.server_name.clone().into(),
            "--connect-timeout-secs".into(),
            self.connect_timeout_secs.to_string().into(),
        ];
        match &self.hostfile {
            Some(path) => {
                args.push("--hostfile".into());
                args.push(path.into());
            }
            None => {
                args.push("--base-port".into());
                args.push(self.base_port.to_string().into());
            }
        }
        if let Some(seed) = self.seed {
            args.push("--seed".into());
            args.push(seed.to_string().into());
        }
        if let (Some(cert), Some(key)) = (&self.cert, &self.key) {
            args.push("--cert".into());
            args.push(cert.into());
            args.push("--key".into());
            args.push(key.into());
        }
        if let Some(secs) = self.wait_timeout_secs {
            args.push("--wait-timeout-secs".into());
            args.push(secs.to_string().into());
        }
        args
    }
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Number of worker ranks.
    #[arg(short, long, env = "EVALMESH_WORKERS")]
    pub workers: usize,

    /// Points to evaluate.
    #[arg(long, env = "EVALMESH_POINTS", default_value_t = DEFAULT_POINT_COUNT)]
    pub points: usize,

    /// Seed for point generation.
    #[arg(long, env = "EVALMESH_SEED")]
    pub seed: Option<u64>,
}

#[derive(Args, Debug)]
pub struct GenCertArgs {
    /// Directory receiving `cert.pem` and `key.pem`.
    #[arg(long, default_value = ".")]
    pub out: PathBuf,

    /// Name the certificate is issued for.
    #[arg(long, default_value = "localhost")]
    pub server_name: String,
}
