use std::process::{ExitCode, Stdio};

use anyhow::{bail, Context, Result};
use clap::Parser;
use evalmesh::{
    mesh::{connect, generate_cluster_cert},
    points, run_rank, simulate, Truncate,
};
use futures::future::join_all;
use tokio::process::Command;
use tracing::{error, info, warn, Level};

mod cli;

use cli::{Cli, Commands, GenCertArgs, LaunchArgs, RunArgs, SimulateArgs};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Launch(args) => launch(args).await,
        Commands::Simulate(args) => simulate_locally(args).await,
        Commands::GenCert(args) => gen_cert(args),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = args.cluster.cluster_config(args.world_size)?;
    let channel = connect(&config, args.rank).await.with_context(|| {
        format!("rank {} could not join the mesh", args.rank)
    })?;
    let points = if channel.is_coordinator() {
        points::generate(args.cluster.points, args.cluster.seed)
    } else {
        Vec::new()
    };

    let outcome = run_rank(&channel, &points, &Truncate).await;
    if let Err(e) = channel.shutdown().await {
        warn!("shutdown was not clean: {}", e);
    }
    if let Some(report) = outcome?.report() {
        print!("{}", report);
        info!(
            failures = report.failures(),
            elapsed_ms = (report.finished_at - report.started_at)
                .num_milliseconds(),
            "run complete"
        );
    }
    Ok(())
}

/// Starts `procs` copies of this binary as ranks `0..procs` and waits for
/// all of them.
async fn launch(args: LaunchArgs) -> Result<()> {
    if args.procs <= 1 {
        bail!("launch needs at least 2 processes, got {}", args.procs);
    }
    // fail here rather than in every child
    args.cluster.cluster_config(args.procs)?;
    let exe = std::env::current_exe().context("locating own executable")?;

    let mut children = Vec::with_capacity(args.procs);
    for rank in 0..args.procs {
        let child = Command::new(&exe)
            .arg("run")
            .arg("--rank")
            .arg(rank.to_string())
            .arg("--world-size")
            .arg(args.procs.to_string())
            .args(args.cluster.to_args())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("starting rank {}", rank))?;
        children.push(child);
    }
    info!(procs = args.procs, "launched ranks");

    let statuses =
        join_all(children.iter_mut().map(|child| child.wait())).await;
    let mut failed = Vec::new();
    for (rank, status) in statuses.into_iter().enumerate() {
        let status =
            status.with_context(|| format!("waiting for rank {}", rank))?;
        if !status.success() {
            failed.push(rank);
        }
    }
    if !failed.is_empty() {
        bail!("ranks {:?} failed", failed);
    }
    Ok(())
}

async fn simulate_locally(args: SimulateArgs) -> Result<()> {
    let points = points::generate(args.points, args.seed);
    let report = simulate(args.workers, &points, Truncate).await?;
    print!("{}", report);
    Ok(())
}

fn gen_cert(args: GenCertArgs) -> Result<()> {
    let (cert, key) = generate_cluster_cert(&args.server_name)?;
    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("creating {}", args.out.display()))?;
    let cert_path = args.out.join("cert.pem");
    let key_path = args.out.join("key.pem");
    std::fs::write(&cert_path, cert)
        .with_context(|| format!("writing {}", cert_path.display()))?;
    std::fs::write(&key_path, key)
        .with_context(|| format!("writing {}", key_path.display()))?;
    info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        "wrote cluster certificate"
    );
    Ok(())
}
