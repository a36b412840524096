use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;

mod cli;
mod config;
mod docker;
mod monitor;
mod report;
mod signals;

use config::MonitorConfig;
use docker::DockerDaemon;
use monitor::{Reconciler, StatsSampler};
use report::sink::{JsonFileSink, LogSink, VerdictSink};
use report::{ReporterService, VerdictQueue};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match MonitorConfig::try_init() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Unable to read config: {e}");
            return ExitCode::FAILURE;
        }
    };

    let sink: Arc<dyn VerdictSink> = match &config.output_dir {
        Some(output_dir) => match JsonFileSink::new(output_dir) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                log::error!("Unable to set up the verdict sink at {output_dir:?}: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => Arc::new(LogSink),
    };

    let client = match DockerDaemon::connect() {
        Ok(client) => client,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    signals::handle_shutdown(shutdown_tx);

    let queue = Arc::new(VerdictQueue::new(config.queue_capacity));
    let reporter = ReporterService::new(
        Arc::clone(&queue),
        Arc::clone(&sink),
        config.sink_retry_max,
        config.shutdown_flush_timeout(),
        shutdown_rx.clone(),
    );
    let reporter_task = tokio::spawn(reporter.run());

    let sampler = StatsSampler::new(client.clone(), &config, sink, shutdown_rx.clone());
    let sampler_task = tokio::spawn(sampler.run());

    let reconciler = Reconciler::new(client, &config, Arc::clone(&queue), shutdown_rx);
    let code = match reconciler.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Monitor failed: {e}");
            ExitCode::FAILURE
        }
    };

    // Samples are periodic readings, nothing to flush. The abort also
    // covers a fatal reconciler exit where no shutdown signal ever fires.
    sampler_task.abort();

    // Let the reporter drain and flush before exiting.
    queue.close();
    if let Err(e) = reporter_task.await {
        log::error!("Reporter task failed: {e}");
    }
    code
}
