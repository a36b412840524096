use bollard::models::ContainerSummaryStateEnum;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Immutable identity of an observed container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub id: String,
    pub name: String,
    pub image: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Removed,
    Unknown,
}

impl AsRef<str> for ContainerState {
    fn as_ref(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Exited => "exited",
            Self::Removed => "removed",
            Self::Unknown => "unknown",
        }
    }
}

impl From<ContainerSummaryStateEnum> for ContainerState {
    fn from(state: ContainerSummaryStateEnum) -> Self {
        match state {
            ContainerSummaryStateEnum::CREATED => Self::Created,
            ContainerSummaryStateEnum::RUNNING => Self::Running,
            ContainerSummaryStateEnum::PAUSED => Self::Paused,
            ContainerSummaryStateEnum::RESTARTING => Self::Restarting,
            // A dead container is an exited one the daemon failed to clean up.
            ContainerSummaryStateEnum::EXITED | ContainerSummaryStateEnum::DEAD => Self::Exited,
            ContainerSummaryStateEnum::REMOVING => Self::Removed,
            ContainerSummaryStateEnum::EMPTY => Self::Unknown,
        }
    }
}

/// Lifecycle event kinds the monitor reacts to. Anything else coming off the
/// daemon stream (create, kill, exec_*, ...) is skipped at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    Die,
    Stop,
    Restart,
    Destroy,
    Oom,
    HealthStatus,
}

impl EventKind {
    /// Parse a daemon action string. Health events arrive as
    /// `health_status: <status>` so they are matched by prefix.
    pub fn parse(action: &str) -> Option<Self> {
        if action.starts_with("health_status") {
            return Some(Self::HealthStatus);
        }
        match action {
            "start" => Some(Self::Start),
            "die" => Some(Self::Die),
            "stop" => Some(Self::Stop),
            "restart" => Some(Self::Restart),
            "destroy" => Some(Self::Destroy),
            "oom" => Some(Self::Oom),
            _ => None,
        }
    }

    /// The container state this event moves a record into, if any.
    /// Oom and health events report on a container without changing its
    /// state. Stop carries no exit code and always trails the die that
    /// already moved the record to exited, so it has no target either.
    pub fn target_state(&self) -> Option<ContainerState> {
        match self {
            Self::Start => Some(ContainerState::Running),
            Self::Die => Some(ContainerState::Exited),
            Self::Restart => Some(ContainerState::Restarting),
            Self::Destroy => Some(ContainerState::Removed),
            Self::Stop | Self::Oom | Self::HealthStatus => None,
        }
    }
}

impl AsRef<str> for EventKind {
    fn as_ref(&self) -> &str {
        match self {
            Self::Start => "start",
            Self::Die => "die",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Destroy => "destroy",
            Self::Oom => "oom",
            Self::HealthStatus => "health_status",
        }
    }
}

/// One decoded daemon event. Produced by the adapter, which assigns `seq`
/// per container, monotonically increasing within a subscription. Not
/// retained beyond processing.
#[derive(Debug, Clone)]
pub struct ContainerEvent {
    pub container_id: String,
    pub name: String,
    pub image: String,
    pub kind: EventKind,
    pub at: DateTime<Utc>,
    pub seq: u64,
    pub exit_code: Option<i64>,
    pub health: Option<String>,
}

/// Last-known state of one container. Owned by the snapshot store;
/// everything handed out of the store is a clone.
#[derive(Debug, Clone)]
pub struct StateRecord {
    pub container: Container,
    pub state: ContainerState,
    pub exit_code: Option<i64>,
    pub last_transition: DateTime<Utc>,
    pub seq: u64,
    pub restart_times: VecDeque<DateTime<Utc>>,
    pub removed_at: Option<DateTime<Utc>>,
}

impl StateRecord {
    pub fn seeded(container: Container, state: ContainerState, now: DateTime<Utc>) -> Self {
        Self {
            container,
            state,
            exit_code: None,
            last_transition: now,
            seq: 0,
            restart_times: VecDeque::new(),
            removed_at: None,
        }
    }
}

/// One resource usage reading for a running container. Produced by the
/// stats sampler and serialized straight to the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSample {
    pub container_id: String,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

/// An accepted state change, derived by the store and handed to the
/// evaluator as a read-only value.
#[derive(Debug, Clone)]
pub struct Transition {
    pub container_id: String,
    pub name: String,
    pub from: ContainerState,
    pub to: ContainerState,
    pub kind: EventKind,
    pub exit_code: Option<i64>,
    pub health: Option<String>,
    pub at: DateTime<Utc>,
    pub restarts_in_window: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl AsRef<str> for Severity {
    fn as_ref(&self) -> &str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    UnexpectedExit,
    CleanExit,
    RestartLoop,
    OutOfMemory,
    ContainerRemoved,
    HealthCheckFailing,
    SinkUnavailable,
}

/// The evaluator's alerting decision for one transition. Serializes to the
/// wire record consumed by the sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub event_id: Uuid,
    pub container_id: String,
    pub severity: Severity,
    #[serde(rename = "reason_code")]
    pub reason: ReasonCode,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Verdict {
    pub fn new(
        container_id: impl Into<String>,
        severity: Severity,
        reason: ReasonCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            container_id: container_id.into(),
            severity,
            reason,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Meta-alert raised once when a verdict had to be dropped because the
    /// sink stayed unavailable through every retry.
    pub fn sink_unavailable(dropped: &Verdict) -> Self {
        Self::new(
            dropped.container_id.clone(),
            Severity::Warning,
            ReasonCode::SinkUnavailable,
            format!(
                "sink unavailable; dropped a {} verdict",
                dropped.severity.as_ref()
            ),
        )
    }
}
