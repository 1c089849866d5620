//! CLI entrypoint: wires the simulated target into the harness, runs one
//! load generation pass and emits the report.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use eyre::{bail, Result, WrapErr};
use surge_harness::{FundingAuthority, JsonReportSink, Orchestrator, ReportSink, RunReport};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::filter::EnvFilter;

use crate::cli::Cli;
use crate::sim::{SimConfig, SimConfirmations, SimFunder, SimTarget};

mod cli;
mod sim;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = cli.run_config();
    config.validate().wrap_err("invalid configuration")?;

    let sim_config = SimConfig {
        latency: Duration::from_millis(cli.sim_latency_ms),
        jitter: Duration::from_millis(cli.sim_jitter_ms),
        failure_rate: cli.sim_failure_rate,
    };
    let funders: Vec<Arc<dyn FundingAuthority>> = (0..cli.funders.max(1))
        .map(|slot| {
            Arc::new(SimFunder::new(slot, cli.sim_funding_failure_rate))
                as Arc<dyn FundingAuthority>
        })
        .collect();

    let orchestrator = Orchestrator::new(
        config,
        Arc::new(SimTarget::new(sim_config)),
        funders,
    )
    .with_observer(Arc::new(SimConfirmations::default()));

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, draining");
            signal_token.cancel();
        }
    });

    let report = orchestrator.run(cancel).await.wrap_err("run failed")?;

    print_summary(&report);
    if let Some(path) = &cli.report_path {
        JsonReportSink::new(path).emit(&report)?;
        info!(path = %path.display(), "report written");
    }

    if !report.passed {
        bail!(
            "success rate {:.2}% below pass threshold {:.2}%",
            report.metrics.success_rate * 100.0,
            report.config.pass_threshold * 100.0
        );
    }
    Ok(())
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("surge={0},surge_harness={0}", cli.log_level)));
    if cli.log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn print_summary(report: &RunReport) {
    let metrics = &report.metrics;
    println!("\nRun summary");
    println!("  policy:       {}", report.release_policy);
    println!(
        "  completed:    {} ({} ok / {} failed)",
        metrics.completed, metrics.successful, metrics.failed
    );
    println!("  success rate: {:.2}%", metrics.success_rate * 100.0);
    println!("  throughput:   {:.2} flows/s over {:.1}s", metrics.throughput_per_sec, metrics.elapsed_secs);
    println!(
        "  latency:      p50 {}ms / p95 {}ms / p99 {}ms (max {}ms)",
        metrics.latency.p50_ms, metrics.latency.p95_ms, metrics.latency.p99_ms, metrics.latency.max_ms
    );
    println!("  peak in-flight: {}", report.peak_in_flight);

    for (phase, counts) in &metrics.per_phase {
        println!(
            "  phase {phase}: {} completed, {} failed",
            counts.completed, counts.failed
        );
    }

    if !metrics.errors.is_empty() {
        println!("  failures by class:");
        for (class, bucket) in &metrics.errors {
            println!("    {class:?}: {}", bucket.count);
            for sample in &bucket.samples {
                println!("      - {sample}");
            }
        }
    }

    let pool = &report.pool;
    println!(
        "  pool: {} total / {} dispensed / {} unfunded / {} left",
        pool.total, pool.dispensed, pool.unfunded, pool.funded
    );

    if let Some(sequences) = &report.sequences {
        println!(
            "  sequences: {} issued, {} confirmed, {} failed, {} pending",
            sequences.next, sequences.confirmed, sequences.failed, sequences.pending
        );
        if !sequences.gaps.is_empty() {
            println!("  sequence gaps: {:?}", sequences.gaps);
        }
    }

    if let Some(batching) = &report.batching {
        println!(
            "  batching: {} sampled across {} batches, mean utilization {:.1}%",
            batching.sampled,
            batching.distinct_batches,
            batching.mean_utilization * 100.0
        );
    }

    if report.forced_timeouts > 0 {
        println!("  forced timeouts at drain: {}", report.forced_timeouts);
    }
    println!("  breaker: {:?} (opened {} times)", report.breaker.state, report.breaker.times_opened);
    println!("  result: {}", if report.passed { "PASS" } else { "FAIL" });
}
