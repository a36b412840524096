//! Health policy applied to accepted transitions.
//!
//! Pure function of one transition; at most one verdict per transition.
//! Transitions matching no rule stay silent.

use super::model::{ContainerState, EventKind, ReasonCode, Severity, Transition, Verdict};

pub fn evaluate(transition: &Transition, restart_threshold: usize) -> Option<Verdict> {
    match transition.kind {
        EventKind::Oom if transition.from == ContainerState::Running => Some(Verdict::new(
            transition.container_id.clone(),
            Severity::Critical,
            ReasonCode::OutOfMemory,
            format!("out of memory: container {}", transition.name),
        )),
        EventKind::HealthStatus => match transition.health.as_deref() {
            Some("unhealthy") => Some(Verdict::new(
                transition.container_id.clone(),
                Severity::Warning,
                ReasonCode::HealthCheckFailing,
                format!("health check failing: container {}", transition.name),
            )),
            _ => None,
        },
        _ => match (transition.from, transition.to) {
            (ContainerState::Running, ContainerState::Exited) => {
                match transition.exit_code {
                    Some(0) => Some(Verdict::new(
                        transition.container_id.clone(),
                        Severity::Info,
                        ReasonCode::CleanExit,
                        format!("clean exit: container {}", transition.name),
                    )),
                    Some(code) => Some(Verdict::new(
                        transition.container_id.clone(),
                        Severity::Critical,
                        ReasonCode::UnexpectedExit,
                        format!(
                            "unexpected exit: container {} exited with code {code}",
                            transition.name
                        ),
                    )),
                    // The store rejects exit transitions without a code
                    // before they ever get here.
                    None => None,
                }
            }
            (_, ContainerState::Restarting) => {
                // Fires on the crossing occurrence only, so a loop alerts
                // exactly once per window.
                if transition.restarts_in_window == restart_threshold {
                    Some(Verdict::new(
                        transition.container_id.clone(),
                        Severity::Warning,
                        ReasonCode::RestartLoop,
                        format!(
                            "restart loop: container {} restarted {} times within the window",
                            transition.name, transition.restarts_in_window
                        ),
                    ))
                } else {
                    None
                }
            }
            (_, ContainerState::Removed) => Some(Verdict::new(
                transition.container_id.clone(),
                Severity::Info,
                ReasonCode::ContainerRemoved,
                format!("container removed: {}", transition.name),
            )),
            _ => None,
        },
    }
}
