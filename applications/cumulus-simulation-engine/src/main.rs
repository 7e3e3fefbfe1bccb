//! Cumulus Simulation Engine CLI
//!
//! Runs a request-admission simulation against a modeled cluster and
//! prints the outcome. The whole run is deterministic for a given seed.

use std::fs;

use anyhow::{Context, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cumulus_simulation_engine::{
    capacity::Capacity,
    engine::Engine,
    model::{Cloud, DeploymentId, PmId},
    policy::{FirstFitPlacement, PolicySet, WorstFitPlacement},
    workload::{GeneratorConfig, RequestGenerator},
};

#[derive(Parser, Debug)]
#[command(name = "cumulus-sim")]
#[command(about = "Simulate cloud resource management policies", long_about = None)]
struct Args {
    /// Number of physical hosts in the cluster
    #[arg(long, default_value_t = 4)]
    hosts: u64,

    /// CPU cores per host
    #[arg(long, default_value_t = 8)]
    host_cpu: u64,

    /// Memory units per host
    #[arg(long, default_value_t = 16384)]
    host_memory: u64,

    /// Number of requests to generate
    #[arg(short, long, default_value_t = 50)]
    requests: usize,

    /// RNG seed for the request stream
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Largest inter-arrival gap, in ticks
    #[arg(long, default_value_t = 10)]
    max_gap: u64,

    /// Largest per-request CPU demand
    #[arg(long, default_value_t = 4)]
    max_cores: u64,

    /// Placement policy (first-fit or worst-fit)
    #[arg(short, long, default_value = "first-fit")]
    placement: String,

    /// Also run a replicated deployment alongside the request stream
    #[arg(long, default_value_t = 0)]
    replicas: u32,

    /// CPU cores per deployment replica
    #[arg(long, default_value_t = 1)]
    replica_cores: u64,

    /// Stop the clock at this tick instead of draining the schedule
    #[arg(short, long)]
    duration: Option<u64>,

    /// Output JSON file path (optional)
    #[arg(short, long)]
    output: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut policies = PolicySet::default();
    policies.placement = match args.placement.as_str() {
        "first-fit" => Box::new(FirstFitPlacement),
        "worst-fit" => Box::new(WorstFitPlacement),
        other => bail!("unknown placement policy: {other}"),
    };
    let placement_name = policies.placement.name().to_string();

    let mut cloud = Cloud::with_policies(policies);
    let host_capacity = Capacity::new(args.host_cpu, args.host_memory, 0, 0);
    for i in 0..args.hosts {
        cloud.add_pm(PmId(i), host_capacity)?;
    }

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║  Cumulus Simulation Engine                               ║");
    println!("╚══════════════════════════════════════════════════════════╝\n");

    println!("Configuration:");
    println!("  Hosts: {} x [{}]", args.hosts, host_capacity);
    println!("  Requests: {} (seed {})", args.requests, args.seed);
    println!("  Placement: {placement_name}");
    if args.replicas > 0 {
        println!("  Deployment: {} replica(s) x {} core(s)", args.replicas, args.replica_cores);
    }
    println!();

    let mut engine = Engine::new("cumulus", cloud);

    if args.replicas > 0 {
        engine.create_deployment(
            DeploymentId(1),
            args.replicas,
            Capacity::cores(args.replica_cores),
        )?;
    }

    let mut generator = RequestGenerator::new(GeneratorConfig {
        seed: args.seed,
        max_gap: args.max_gap,
        max_cores: args.max_cores,
        memory_per_core: args.host_memory / args.host_cpu.max(1),
    });
    for plan in generator.arrivals(args.requests) {
        engine.submit_request(plan.request, plan.at, plan.demand)?;
    }

    print!("Running... ");
    let steps = match args.duration {
        Some(tick) => engine.run_until(tick)?,
        None => engine.run_until_idle()?,
    };
    println!("done ({steps} events dispatched)\n");

    let report = engine.report();

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║  Simulation Results                                      ║");
    println!("╚══════════════════════════════════════════════════════════╝\n");

    println!(
        "{:<20} {:>10} {:>10} {:>10} {:>12} {:>12}",
        "Run", "Requests", "Accepted", "Rejected", "Accept %", "Final tick"
    );
    println!("{}", "-".repeat(78));
    println!(
        "{:<20} {:>10} {:>10} {:>10} {:>11.1}% {:>12}",
        report.name,
        report.requests,
        report.accepted,
        report.rejected,
        report.accept_rate * 100.0,
        report.finished_at,
    );

    println!("\nCluster state:");
    for pm in engine.cloud().pms() {
        println!("  {:<8} free [{}] of [{}]", pm.id.to_string(), pm.free(), pm.total());
    }
    if args.replicas > 0 {
        let dep = engine.cloud().deployment(DeploymentId(1))?;
        println!(
            "  {:<8} {} ({}/{} replica(s))",
            dep.id.to_string(),
            dep.state().as_str(),
            dep.actual(),
            dep.desired(),
        );
    }

    if let Some(output_path) = args.output {
        println!("\nWriting results to {output_path}...");
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(&output_path, json)
            .with_context(|| format!("failed to write {output_path}"))?;
        println!("  Results saved");
    }

    Ok(())
}
