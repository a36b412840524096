//! Daemon client adapter over bollard.
//!
//! Wraps the two calls the monitor needs: a point-in-time container listing
//! and the lifecycle event stream. The adapter owns sequence numbering:
//! every decoded event gets a per-container, per-subscription sequence
//! number so the store can spot duplicates and gaps.

use async_trait::async_trait;
use bollard::Docker;
use bollard::models::{ContainerStatsResponse, EventMessage, EventMessageTypeEnum};
use bollard::query_parameters::{
    EventsOptions, EventsOptionsBuilder, ListContainersOptions, ListContainersOptionsBuilder,
    StatsOptions, StatsOptionsBuilder,
};
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;

use crate::monitor::model::{
    Container, ContainerEvent, ContainerState, EventKind, ResourceSample,
};

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("cannot reach the Docker daemon: {0}")]
    Connection(#[source] bollard::errors::Error),
    #[error("event stream failed: {0}")]
    Stream(#[source] bollard::errors::Error),
    #[error("undecodable event: {0}")]
    Decode(String),
}

/// Lazy, non-restartable event sequence. Cancelled by dropping it.
#[async_trait]
pub trait EventSource: Send {
    /// Pull the next decoded event. `None` means the daemon closed the
    /// stream; a `Stream` error means the same subscription is unusable and
    /// the caller must re-snapshot before subscribing again.
    async fn next_event(&mut self) -> Option<Result<ContainerEvent, DaemonError>>;
}

#[async_trait]
pub trait DaemonClient: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<(Container, ContainerState)>, DaemonError>;
    async fn subscribe(&self) -> Result<Box<dyn EventSource>, DaemonError>;
    /// One resource usage reading for a container. `None` when the daemon
    /// had nothing to report, e.g. the container stopped mid-call.
    async fn sample(&self, container: &Container) -> Result<Option<ResourceSample>, DaemonError>;
}

/// The real adapter. Cheap to clone; each clone shares the underlying
/// daemon connection.
#[derive(Clone)]
pub struct DockerDaemon {
    docker: Docker,
}

impl DockerDaemon {
    pub fn connect() -> Result<Self, DaemonError> {
        let docker = Docker::connect_with_local_defaults().map_err(DaemonError::Connection)?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl DaemonClient for DockerDaemon {
    async fn snapshot(&self) -> Result<Vec<(Container, ContainerState)>, DaemonError> {
        let options: ListContainersOptions = ListContainersOptionsBuilder::new().all(true).build();

        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(DaemonError::Connection)?;

        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let Some(id) = summary.id else {
                log::warn!("Skipping listed container without an id");
                continue;
            };
            let name = summary
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|name| name.trim_start_matches('/').to_string())
                .unwrap_or_else(|| id.clone());
            let created_at = summary
                .created
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .unwrap_or_else(Utc::now);
            let state = summary
                .state
                .map(ContainerState::from)
                .unwrap_or(ContainerState::Unknown);
            containers.push((
                Container {
                    id,
                    name,
                    image: summary.image.unwrap_or_default(),
                    created_at,
                },
                state,
            ));
        }
        Ok(containers)
    }

    async fn subscribe(&self) -> Result<Box<dyn EventSource>, DaemonError> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        let options: EventsOptions = EventsOptionsBuilder::new().filters(&filters).build();

        let stream = self.docker.events(Some(options));
        Ok(Box::new(DockerEventSource {
            stream: Box::pin(stream),
            seqs: HashMap::new(),
        }))
    }

    async fn sample(&self, container: &Container) -> Result<Option<ResourceSample>, DaemonError> {
        // stream=false makes the daemon collect two cycles so the precpu
        // baseline is populated; one_shot would leave it empty.
        let options: StatsOptions = StatsOptionsBuilder::new().stream(false).build();
        let mut stats = self.docker.stats(&container.id, Some(options));
        match stats.next().await {
            Some(Ok(response)) => Ok(Some(decode_stats(container, response))),
            Some(Err(e)) => Err(DaemonError::Connection(e)),
            None => Ok(None),
        }
    }
}

struct DockerEventSource {
    stream: Pin<Box<dyn Stream<Item = Result<EventMessage, bollard::errors::Error>> + Send>>,
    seqs: HashMap<String, u64>,
}

#[async_trait]
impl EventSource for DockerEventSource {
    async fn next_event(&mut self) -> Option<Result<ContainerEvent, DaemonError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(DaemonError::Stream(e))),
            };
            match decode_event(message, &mut self.seqs) {
                Decoded::Event(event) => return Some(Ok(event)),
                Decoded::Skip => continue,
                Decoded::Fault(reason) => return Some(Err(DaemonError::Decode(reason))),
            }
        }
    }
}

enum Decoded {
    Event(ContainerEvent),
    /// An event outside the monitored taxonomy; no sequence slot consumed.
    Skip,
    /// A malformed event. If the container id was readable the sequence slot
    /// is consumed, so the resulting gap is visible to the store.
    Fault(String),
}

fn decode_event(message: EventMessage, seqs: &mut HashMap<String, u64>) -> Decoded {
    if !matches!(message.typ, Some(EventMessageTypeEnum::CONTAINER)) {
        return Decoded::Skip;
    }

    let Some(actor) = message.actor else {
        return Decoded::Fault("container event without an actor".to_string());
    };
    let Some(id) = actor.id else {
        return Decoded::Fault("container event without a container id".to_string());
    };

    let action = match message.action {
        Some(action) => action,
        None => {
            // Id is known, so burn a sequence slot; the gap heuristic will
            // notice if this hid a real transition.
            bump_seq(seqs, &id);
            return Decoded::Fault(format!("event for {id} carries no action"));
        }
    };

    let Some(kind) = EventKind::parse(&action) else {
        return Decoded::Skip;
    };
    let seq = bump_seq(seqs, &id);

    let attributes = actor.attributes.unwrap_or_default();
    let exit_code = attributes
        .get("exitCode")
        .and_then(|code| code.parse::<i64>().ok());
    let health = action
        .split_once(": ")
        .map(|(_, status)| status.to_string());
    let at = message
        .time_nano
        .map(DateTime::from_timestamp_nanos)
        .unwrap_or_else(Utc::now);

    Decoded::Event(ContainerEvent {
        container_id: id.clone(),
        name: attributes.get("name").cloned().unwrap_or(id),
        image: attributes.get("image").cloned().unwrap_or_default(),
        kind,
        at,
        seq,
        exit_code,
        health,
    })
}

fn bump_seq(seqs: &mut HashMap<String, u64>, id: &str) -> u64 {
    let seq = seqs.entry(id.to_string()).or_insert(0);
    *seq += 1;
    *seq
}

/// Reduce a raw stats reading to the sample the sink exports. CPU usage is
/// the container's share of the system delta between the two collection
/// cycles; network counters are summed over all interfaces.
fn decode_stats(container: &Container, response: ContainerStatsResponse) -> ResourceSample {
    let cpu = response.cpu_stats.unwrap_or_default();
    let precpu = response.precpu_stats.unwrap_or_default();
    let total = |stats: &bollard::models::ContainerCpuStats| {
        stats
            .cpu_usage
            .as_ref()
            .and_then(|usage| usage.total_usage)
            .unwrap_or(0)
    };
    let cpu_delta = total(&cpu).saturating_sub(total(&precpu));
    let system_delta = cpu
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(precpu.system_cpu_usage.unwrap_or(0));
    let cpu_percent = if system_delta > 0 {
        cpu_delta as f64 / system_delta as f64 * 100.0
    } else {
        0.0
    };

    let memory = response.memory_stats.unwrap_or_default();
    let memory_usage_bytes = memory.usage.unwrap_or(0);
    let memory_limit_bytes = memory.limit.unwrap_or(0);
    let memory_percent = if memory_limit_bytes > 0 {
        memory_usage_bytes as f64 / memory_limit_bytes as f64 * 100.0
    } else {
        0.0
    };

    let (network_rx_bytes, network_tx_bytes) = response
        .networks
        .unwrap_or_default()
        .values()
        .fold((0, 0), |(rx, tx), interface| {
            (
                rx + interface.rx_bytes.unwrap_or(0),
                tx + interface.tx_bytes.unwrap_or(0),
            )
        });

    ResourceSample {
        container_id: container.id.clone(),
        name: container.name.clone(),
        cpu_percent,
        memory_usage_bytes,
        memory_limit_bytes,
        memory_percent,
        network_rx_bytes,
        network_tx_bytes,
        timestamp: Utc::now(),
    }
}
