// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

use std::env;
use std::process;

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use mercury::config::{self, SERIAL_PATH};
use mercury::engine::{RecoveryEngine, RecoverySettings, RecoveryState};
use mercury::graph::ProcessGraph;

fn usage(program: &str) -> ! {
    eprintln!("Usage: {} -s <system.yaml> [-v]", program);
    eprintln!("  -s, --system   System description (YAML) to run");
    eprintln!("  -v, --verbose  Be verbose");
    process::exit(1);
}

fn parse_arguments() -> (String, bool) {
    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("mercury");

    let mut system = None;
    let mut verbose = false;
    let mut iter = args.iter().skip(1);
    while let Some(argument) = iter.next() {
        match argument.as_str() {
            "-s" | "--system" => match iter.next() {
                Some(value) => system = Some(value.clone()),
                None => usage(program),
            },
            "-v" | "--verbose" => verbose = true,
            _ => usage(program),
        }
    }

    match system {
        Some(system) => (system, verbose),
        None => usage(program),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_process_graph(path: &str, serial: &str) -> anyhow::Result<ProcessGraph> {
    let substituted_path = config::substitute_serial(path, serial);
    info!(from = path, to = %substituted_path, "loading system description");
    let mut description = match config::load_description(&substituted_path) {
        Ok(description) => description,
        Err(error) => bail!("failed to load system description: {error}"),
    };
    config::substitute_in_description(&mut description, serial);

    info!("populating process graph nodes");
    let mut graph = ProcessGraph::new();
    for process in &description.processes {
        graph.add_node(process)?;
    }

    info!("building edge lists");
    graph.build()?;
    Ok(graph)
}

fn install_signal_handlers(shutdown: CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
        }
        info!("shutdown requested");
        shutdown.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (system_path, verbose) = parse_arguments();
    init_tracing(verbose);

    let serial =
        config::probe_serial(SERIAL_PATH).context("failed to probe system serial number")?;
    info!(%serial, "loading process graph");
    let mut graph = load_process_graph(&system_path, &serial)?;

    if graph.has_cycle() {
        bail!("process graph contains a cycle");
    }

    info!("installing signal handlers");
    let shutdown = CancellationToken::new();
    install_signal_handlers(shutdown.clone())?;

    info!("instantiating recovery engine");
    let engine = RecoveryEngine::new(graph, RecoverySettings::default(), shutdown);

    info!("running event loop");
    engine.run().await?;

    if engine.current_state().await == RecoveryState::CatastrophicFailure {
        bail!("terminated after catastrophic failure");
    }
    Ok(())
}
