//! Forwarded events and their orchestrator-side demotion rules.

use std::collections::BTreeMap;

use derive_more::Display;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::worker::WorkerStatus;

/// Severity of a forwarded event, as the worker reported it.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Display, Serialize, Deserialize,
)]
pub enum EventLevel {
    Error,
    Warning,
    Verbose,
}

/// What kind of condition the event describes.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum ForwardedEventKind {
    /// Ordinary build output.
    General,

    /// The worker's own machinery failed (disk, sandbox, service); the
    /// build survives by reassigning work.
    WorkerInfrastructure,

    /// A process pip failed, with the full typed payload.
    ProcessExecution(ProcessExecutionError),
}

/// The typed payload of a process-execution failure.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ProcessExecutionError {
    /// The pip's provenance hash, stable across builds.
    pub semi_stable_hash: u64,
    pub description: String,
    pub spec_path: String,
    pub working_directory: String,
    pub exe: String,

    /// Captured stdout/stderr prefix, truncated per policy.
    pub output: String,
    pub paths: Vec<String>,
    pub exit_code: i32,
    pub execution_time_ms: u64,
}

/// One event forwarded from a worker to the orchestrator.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct WorkerForwardedEvent {
    pub level: EventLevel,
    pub message: String,
    pub kind: ForwardedEventKind,

    /// Structured fields the worker attached.
    pub fields: BTreeMap<String, String>,
}

/// The level the orchestrator reports a forwarded event at.
///
/// Errors from a stopped worker reflect work that has already been
/// retried elsewhere, so they drop to verbose. Worker infrastructure
/// errors demote to warnings so that losing a worker never fails the
/// build by itself.
pub fn effective_level(event: &WorkerForwardedEvent, worker_status: WorkerStatus) -> EventLevel {
    match (event.level, worker_status, &event.kind) {
        (EventLevel::Error, WorkerStatus::Stopped, _) => EventLevel::Verbose,
        (EventLevel::Error, _, ForwardedEventKind::WorkerInfrastructure) => EventLevel::Warning,
        (level, _, _) => level,
    }
}

/// Report a forwarded event through tracing at its effective level.
pub fn report(event: &WorkerForwardedEvent, worker_status: WorkerStatus) -> EventLevel {
    let level = effective_level(event, worker_status);
    match level {
        EventLevel::Error => error!(?event.fields, "{}", event.message),
        EventLevel::Warning => warn!(?event.fields, "{}", event.message),
        EventLevel::Verbose => info!(?event.fields, "{}", event.message),
    }
    level
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;

    use super::*;

    fn event(level: EventLevel, kind: ForwardedEventKind) -> WorkerForwardedEvent {
        WorkerForwardedEvent {
            level,
            message: "remote pip failed".to_owned(),
            kind,
            fields: BTreeMap::new(),
        }
    }

    #[test_case(WorkerStatus::Attached, EventLevel::Error; "attached stays error")]
    #[test_case(WorkerStatus::Stopped, EventLevel::Verbose; "stopped demotes to verbose")]
    #[test]
    fn general_error_demotion(status: WorkerStatus, expected: EventLevel) {
        let event = event(EventLevel::Error, ForwardedEventKind::General);
        self::assert_eq!(effective_level(&event, status), expected);
    }

    #[test]
    fn infrastructure_errors_demote_to_warning() {
        let event = event(EventLevel::Error, ForwardedEventKind::WorkerInfrastructure);
        assert_eq!(
            effective_level(&event, WorkerStatus::Attached),
            EventLevel::Warning,
        );
        // Stopped still wins.
        assert_eq!(
            effective_level(&event, WorkerStatus::Stopped),
            EventLevel::Verbose,
        );
    }

    #[test]
    fn non_errors_pass_through() {
        let event = event(EventLevel::Warning, ForwardedEventKind::General);
        assert_eq!(
            effective_level(&event, WorkerStatus::Stopped),
            EventLevel::Warning,
        );
    }

    #[test]
    fn process_error_payload_round_trips() {
        let payload = ProcessExecutionError {
            semi_stable_hash: 0xDEAD_BEEF,
            description: "link app".to_owned(),
            spec_path: "/repo/app/build.spec".to_owned(),
            working_directory: "/repo/app".to_owned(),
            exe: "/usr/bin/ld".to_owned(),
            output: "undefined symbol: main".to_owned(),
            paths: vec!["/repo/out/app.bin".to_owned()],
            exit_code: 1,
            execution_time_ms: 1250,
        };
        let event = event(
            EventLevel::Error,
            ForwardedEventKind::ProcessExecution(payload.clone()),
        );

        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: WorkerForwardedEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, event);
        match decoded.kind {
            ForwardedEventKind::ProcessExecution(decoded) => assert_eq!(decoded, payload),
            other => panic!("wrong kind: {other:?}"),
        }
    }
}
