use k8s_openapi::api::core::v1::{
    ContainerState as K8sContainerState, ContainerStateRunning, ContainerStateTerminated,
    ContainerStateWaiting, ContainerStatus, Pod, PodCondition, PodStatus,
};
use chrono::{DateTime, SubsecRound, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use super::backend::{ContainerState, Provisioned};

pub const PHASE_RUNNING: &str = "Running";
pub const PHASE_PENDING: &str = "Pending";
pub const PHASE_FAILED: &str = "Failed";
pub const PHASE_SUCCEEDED: &str = "Succeeded";

/// API timestamps carry whole seconds on the wire.
fn wire_time(at: DateTime<Utc>) -> Time {
    Time(at.trunc_subsecs(0))
}

/// Build the pod status the control plane sees from what the backend reported.
///
/// Timestamps are truncated to whole seconds so the status compares equal
/// to the copy read back from the API server.
pub fn synthesize(pod: &Pod, provisioned: &Provisioned) -> PodStatus {
    let started = wire_time(provisioned.started_at);
    let containers = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();

    let container_statuses: Vec<ContainerStatus> = containers
        .iter()
        .zip(provisioned.containers.iter())
        .map(|(spec, runtime)| ContainerStatus {
            name: spec.name.clone(),
            image: spec.image.clone().unwrap_or_default(),
            image_id: String::new(),
            ready: runtime.state.is_running(),
            restart_count: 0,
            started: Some(runtime.state.is_running()),
            state: Some(container_state(&runtime.state)),
            container_id: Some(runtime.container_id.clone()),
            ..Default::default()
        })
        .collect();

    let all_running = provisioned.containers.iter().all(|c| c.state.is_running());
    let any_failed = provisioned
        .containers
        .iter()
        .any(|c| matches!(c.state, ContainerState::Terminated { exit_code, .. } if exit_code != 0));
    let phase = if any_failed {
        PHASE_FAILED
    } else if all_running {
        PHASE_RUNNING
    } else {
        PHASE_PENDING
    };

    let ready = if all_running { "True" } else { "False" };
    let conditions = vec![
        condition("Initialized", "True", &started),
        condition("Ready", ready, &started),
        condition("PodScheduled", "True", &started),
    ];

    PodStatus {
        phase: Some(phase.to_string()),
        host_ip: Some(provisioned.host_ip.clone()),
        pod_ip: Some(provisioned.pod_ip.clone()),
        start_time: Some(started),
        conditions: Some(conditions),
        container_statuses: Some(container_statuses),
        ..Default::default()
    }
}

fn condition(type_: &str, status: &str, at: &Time) -> PodCondition {
    PodCondition {
        type_: type_.to_string(),
        status: status.to_string(),
        last_transition_time: Some(at.clone()),
        ..Default::default()
    }
}

fn container_state(state: &ContainerState) -> K8sContainerState {
    match state {
        ContainerState::NotStarted => K8sContainerState {
            waiting: Some(ContainerStateWaiting {
                reason: Some("ContainerCreating".to_string()),
                message: None,
            }),
            ..Default::default()
        },
        ContainerState::Running { since } => K8sContainerState {
            running: Some(ContainerStateRunning {
                started_at: Some(wire_time(*since)),
            }),
            ..Default::default()
        },
        ContainerState::Terminated { exit_code, at } => K8sContainerState {
            terminated: Some(ContainerStateTerminated {
                exit_code: *exit_code,
                finished_at: Some(wire_time(*at)),
                ..Default::default()
            }),
            ..Default::default()
        },
    }
}
