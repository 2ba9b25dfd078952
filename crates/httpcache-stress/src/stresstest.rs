use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use httpcache_service::config::Config;
use httpcache_service::coordinator::Coordinator;
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;

use crate::workloads::{Simulation, Workload, WorkloadsConfig};

/// How long the coordinator may sit idle while transactions still wait for it.
const STALL_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // run the workloads concurrently, each against its own coordinator
    let mut tasks = Vec::with_capacity(workloads.workloads.len());
    for workload in workloads.workloads {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let coordinator = Coordinator::from_config(&config.cache);

        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
        let task = tokio::spawn(run_workload(coordinator, workload, deadline).bind_hub(hub));
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, task) in finished_tasks.into_iter().enumerate() {
        let (concurrency, races, task_durations) = task.context("workload panicked")??;

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
        println!("  cache races: {races}");

        if ops == 0 {
            continue;
        }
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let quantile = |q| {
            let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    Ok(())
}

async fn run_workload(
    coordinator: Coordinator,
    workload: Workload,
    deadline: tokio::time::Instant,
) -> Result<(usize, usize, DDSketch)> {
    let concurrency = workload.concurrency;
    let mut simulation = Simulation::new(coordinator, workload);

    loop {
        let running = deadline.elapsed() == Duration::ZERO;
        let started = if running { simulation.fill() } else { 0 };

        let ran = simulation.coordinator.run_until_idle();
        let delivered = simulation.deliver();
        if started > 0 || ran > 0 || delivered {
            tokio::task::yield_now().await;
            continue;
        }
        if simulation.active() == 0 && (!running || concurrency == 0) {
            break;
        }

        // everything left waits for backend operations running elsewhere
        let next = tokio::time::timeout(STALL_TIMEOUT, simulation.coordinator.run_next());
        if next.await.is_err() {
            bail!(
                "simulation stalled with {} transactions, the oldest waiting for {:?}",
                simulation.active(),
                simulation.oldest()
            );
        }
    }

    Ok((concurrency, simulation.races, simulation.durations))
}
