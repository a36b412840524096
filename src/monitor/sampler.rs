//! Periodic resource sampler.
//!
//! On a fixed interval, reads CPU, memory, and network usage for every
//! running container and hands each sample straight to the sink. Samples
//! are point-in-time readings with no retry path: a failed one is logged
//! and the next tick supersedes it.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::model::ContainerState;
use crate::config::MonitorConfig;
use crate::docker::DaemonClient;
use crate::report::sink::VerdictSink;

pub struct StatsSampler<C: DaemonClient> {
    client: C,
    sink: Arc<dyn VerdictSink>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl<C: DaemonClient> StatsSampler<C> {
    pub fn new(
        client: C,
        config: &MonitorConfig,
        sink: Arc<dyn VerdictSink>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            sink,
            interval: config.stats_interval(),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.interval);
        // Consume the first immediate tick.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => self.sample_pass().await,
                _ = self.shutdown.changed() => break,
            }
        }
        log::info!("Stats sampler stopped");
    }

    async fn sample_pass(&mut self) {
        let snapshot = match self.client.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Skipping stats pass, cannot list containers: {e}");
                return;
            }
        };

        let mut sampled = 0usize;
        for (container, state) in snapshot {
            if state != ContainerState::Running {
                continue;
            }
            match self.client.sample(&container).await {
                Ok(Some(sample)) => {
                    if let Err(e) = self.sink.emit_sample(&sample).await {
                        log::warn!("Failed to export sample for {}: {e}", container.name);
                    } else {
                        sampled += 1;
                    }
                }
                // The container went away between the listing and the read.
                Ok(None) => {}
                Err(e) => log::warn!("Failed to sample {}: {e}", container.name),
            }
        }
        log::debug!("Exported resource samples for {sampled} containers");
    }
}
