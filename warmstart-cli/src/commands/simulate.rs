// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `warmstart simulate` command - Exercise the lifecycle against the
//! in-process control plane.
//!
//! Each round starts an instance of the image, registers it under a fresh
//! container ID and stops it again. With snapshots enabled every round after
//! the first is served from the idle pool.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use warmstart_core::coordinator::ShutdownReport;
use warmstart_core::metrics::OperationMetric;
use warmstart_core::sim::{Operation, SimulatedControlPlane};
use warmstart_core::{
    AddressPool, Config, ConfigLoader, ContainerId, Coordinator, ImageName, Orchestrator,
    StartPath, VmId,
};

pub struct SimulateArgs<'a> {
    pub config: &'a str,
    pub image: &'a str,
    pub rounds: u32,
    pub snapshots: bool,
    pub boot_latency_ms: u64,
    pub snapshot_dir: Option<PathBuf>,
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct RoundReport {
    round: u32,
    container_id: ContainerId,
    vm_id: VmId,
    path: StartPath,
    guest_address: Ipv4Addr,
    start_us: u64,
    metric: OperationMetric,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    image: ImageName,
    snapshots_enabled: bool,
    rounds: Vec<RoundReport>,
    image_pulls: usize,
    cold_boots: usize,
    restores: usize,
    shutdown: ShutdownReport,
}

pub async fn execute(args: SimulateArgs<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let image = ImageName::new(args.image)?;
    let config = load_config(args.config)?;

    let snapshot_dir = args
        .snapshot_dir
        .unwrap_or_else(|| std::env::temp_dir().join(format!("warmstart-sim-{}", std::process::id())));
    let orch_config = config
        .orchestrator
        .with_snapshots(args.snapshots)
        .with_snapshot_dir(snapshot_dir)
        .without_cluster_dns();

    let sim = Arc::new(SimulatedControlPlane::new());
    if args.boot_latency_ms > 0 {
        let latency = Duration::from_millis(args.boot_latency_ms);
        sim.set_latency(Operation::CreateVm, latency);
        sim.set_latency(Operation::RestoreVm, latency / 4);
    }
    let pool = Arc::new(AddressPool::new(orch_config.network));
    let orchestrator = Orchestrator::new(sim.clone(), pool, orch_config)?;
    let coordinator = Coordinator::new(Arc::new(orchestrator));

    tracing::info!(image = %image, rounds = args.rounds, snapshots = args.snapshots, "Starting simulation");

    let mut rounds = Vec::with_capacity(args.rounds as usize);
    for round in 1..=args.rounds {
        let container_id = ContainerId::new(format!("sim-{}", round))?;

        let started_at = std::time::Instant::now();
        let outcome = coordinator.start(&image, &[]).await?;
        let start_us = started_at.elapsed().as_micros() as u64;

        let vm_id = outcome.instance.vm_id();
        coordinator.register_active(container_id.clone(), outcome.instance)?;
        coordinator.stop(&container_id).await?;

        rounds.push(RoundReport {
            round,
            container_id,
            vm_id,
            path: outcome.path,
            guest_address: outcome.guest_address,
            start_us,
            metric: outcome.metric,
        });
    }

    let shutdown = coordinator.shutdown().await?;

    let report = SimulationReport {
        image,
        snapshots_enabled: args.snapshots,
        image_pulls: sim.count(Operation::PullImage),
        cold_boots: sim.count(Operation::CreateVm),
        restores: sim.count(Operation::RestoreVm),
        rounds,
        shutdown,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn load_config(path: &str) -> Result<Config, Box<dyn std::error::Error>> {
    if Path::new(path).exists() {
        tracing::info!(file = %path, "Loading configuration");
        Ok(ConfigLoader::load_file(path)?)
    } else {
        tracing::debug!(file = %path, "No configuration file, using defaults");
        Ok(Config::default())
    }
}

fn print_report(report: &SimulationReport) {
    println!(
        "Simulation of {} ({} rounds, snapshots {})",
        report.image,
        report.rounds.len(),
        if report.snapshots_enabled { "on" } else { "off" }
    );
    println!();
    println!("{:<6} {:<12} {:<6} {:<10} {:<15} {:>10}", "ROUND", "CONTAINER", "VM", "PATH", "ADDRESS", "START(us)");
    for r in &report.rounds {
        let path = match r.path {
            StartPath::ColdBoot => "cold",
            StartPath::Restored => "restored",
        };
        println!(
            "{:<6} {:<12} {:<6} {:<10} {:<15} {:>10}",
            r.round,
            r.container_id.as_str(),
            r.vm_id.to_string(),
            path,
            r.guest_address.to_string(),
            r.start_us
        );
    }
    println!();
    println!(
        "Image pulls: {}  Cold boots: {}  Restores: {}",
        report.image_pulls, report.cold_boots, report.restores
    );
    println!(
        "Shutdown: {} stopped, {} released, {} failed",
        report.shutdown.stopped,
        report.shutdown.released,
        report.shutdown.failed.len()
    );
}
