//! Per-kind lifecycle plans.
//!
//! A plan states which recorded statuses a task may start from, which
//! statuses make it a no-op, and which status it records on entry, on
//! success and on failure. The store enforces the transition table itself;
//! plans decide what a task attempts.

use hostplane_core::{InstanceStatus, TaskKind};

use InstanceStatus::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecyclePlan {
    /// Statuses the task may run from. Empty means any status.
    pub requires: &'static [InstanceStatus],
    /// Statuses in which the task's effect already holds.
    pub noop_when: &'static [InstanceStatus],
    pub entering: Option<InstanceStatus>,
    pub on_success: Option<InstanceStatus>,
    pub on_failure: Option<InstanceStatus>,
}

/// Decision taken before a task body runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Proceed,
    Skip,
    Reject,
}

impl LifecyclePlan {
    pub fn gate(&self, status: InstanceStatus) -> Gate {
        if self.noop_when.contains(&status) {
            Gate::Skip
        } else if self.requires.is_empty() || self.requires.contains(&status) {
            Gate::Proceed
        } else {
            Gate::Reject
        }
    }
}

const NO_STATUS: &[InstanceStatus] = &[];

pub fn plan_for(kind: &TaskKind) -> LifecyclePlan {
    match kind {
        TaskKind::Provision { .. } => LifecyclePlan {
            requires: &[Pending, Error, Provisioning],
            noop_when: &[Running],
            entering: Some(Provisioning),
            on_success: Some(Running),
            on_failure: Some(Error),
        },
        TaskKind::Start { .. } => LifecyclePlan {
            requires: &[Stopped],
            noop_when: &[Running],
            entering: None,
            on_success: Some(Running),
            on_failure: Some(Error),
        },
        TaskKind::Stop { .. } => LifecyclePlan {
            requires: &[Running],
            noop_when: &[Stopped],
            entering: None,
            on_success: Some(Stopped),
            on_failure: Some(Error),
        },
        TaskKind::Restart { .. } | TaskKind::Migrate { .. } => LifecyclePlan {
            requires: &[Running],
            noop_when: NO_STATUS,
            entering: None,
            on_success: Some(Running),
            on_failure: Some(Error),
        },
        TaskKind::Restore { .. } => LifecyclePlan {
            requires: &[Running, Stopped],
            noop_when: NO_STATUS,
            entering: None,
            on_success: Some(Running),
            on_failure: Some(Error),
        },
        TaskKind::Terminate { .. } => LifecyclePlan {
            requires: NO_STATUS,
            noop_when: &[Terminated],
            entering: Some(Terminating),
            on_success: Some(Terminated),
            on_failure: Some(Error),
        },
        TaskKind::Backup { .. } => LifecyclePlan {
            requires: &[Running, Stopped],
            noop_when: NO_STATUS,
            entering: None,
            on_success: None,
            on_failure: None,
        },
        // Health is only meaningful for a running workload; anything else
        // is a quiet no-op rather than an error.
        TaskKind::HealthCheck { .. } => LifecyclePlan {
            requires: &[Running],
            noop_when: &[Pending, Provisioning, Stopped, Error, Terminating, Terminated],
            entering: None,
            on_success: Some(Running),
            on_failure: None,
        },
        // Destruction of a stopped or tearing-down workload is expected; a
        // second event for the same container finds the instance already in
        // error. The body decides whether the instance failed.
        TaskKind::ContainerDestroyed { .. } => LifecyclePlan {
            requires: &[Provisioning, Running],
            noop_when: &[Pending, Stopped, Error, Terminating, Terminated],
            entering: None,
            on_success: None,
            on_failure: None,
        },
        TaskKind::PurgeTaskRecords { .. } => LifecyclePlan {
            requires: NO_STATUS,
            noop_when: NO_STATUS,
            entering: None,
            on_success: None,
            on_failure: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn every_kind() -> Vec<TaskKind> {
        let id = "i".to_string();
        vec![
            TaskKind::Provision { instance_id: id.clone() },
            TaskKind::Start { instance_id: id.clone() },
            TaskKind::Stop { instance_id: id.clone() },
            TaskKind::Restart { instance_id: id.clone() },
            TaskKind::Terminate { instance_id: id.clone(), retain_volume: false },
            TaskKind::Migrate { instance_id: id.clone(), version: "2".into() },
            TaskKind::Backup { instance_id: id.clone() },
            TaskKind::Restore { instance_id: id.clone(), backup_name: "b".into() },
            TaskKind::HealthCheck { instance_id: id.clone() },
            TaskKind::ContainerDestroyed { instance_id: id, container_id: "c".into() },
        ]
    }

    /// Every edge a plan can attempt from a status it proceeds from must
    /// be permitted for that kind.
    #[test]
    fn test_plans_agree_with_transition_rules() {
        let all = [Pending, Provisioning, Running, Stopped, Error, Terminating, Terminated];
        for kind in every_kind() {
            let plan = plan_for(&kind);
            for from in all {
                if plan.gate(from) != Gate::Proceed {
                    continue;
                }
                let current = match plan.entering {
                    Some(entering) => {
                        if entering != from {
                            assert!(kind.permits(from, entering), "{} {} -> {}", kind.name(), from, entering);
                        }
                        entering
                    }
                    None => from,
                };
                if let Some(to) = plan.on_success {
                    assert!(kind.permits(current, to), "{} {} -> {}", kind.name(), current, to);
                }
                if let Some(to) = plan.on_failure {
                    assert!(kind.permits(current, to), "{} {} -> {}", kind.name(), current, to);
                }
            }
        }
    }

    #[test]
    fn test_gates() {
        let start = plan_for(&TaskKind::Start { instance_id: "i".into() });
        assert_eq!(start.gate(Stopped), Gate::Proceed);
        assert_eq!(start.gate(Running), Gate::Skip);
        assert_eq!(start.gate(Pending), Gate::Reject);

        let terminate = plan_for(&TaskKind::Terminate { instance_id: "i".into(), retain_volume: true });
        assert_eq!(terminate.gate(Error), Gate::Proceed);
        assert_eq!(terminate.gate(Terminating), Gate::Proceed);
        assert_eq!(terminate.gate(Terminated), Gate::Skip);

        let destroyed = plan_for(&TaskKind::ContainerDestroyed {
            instance_id: "i".into(),
            container_id: "c".into(),
        });
        assert_eq!(destroyed.gate(Running), Gate::Proceed);
        assert_eq!(destroyed.gate(Stopped), Gate::Skip);
        assert_eq!(destroyed.gate(Terminating), Gate::Skip);
        assert!(destroyed.on_success.is_none());
    }
}
