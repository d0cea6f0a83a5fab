//! Up-front refusal of waits that can never be satisfied.
//!
//! Before a thread blocks on a job (join, future get, family wait) the scheduler
//! compares the rule held by the job running on that thread with the rule the
//! target still has to acquire. If the target is waiting for a rule the waiter
//! holds, the target cannot start until the waiter finishes, and the waiter
//! will not finish until the target does.
//!
//! This is a necessary-condition check, not a wait-for graph: longer cycles
//! through several jobs are not detected.

use serde::Serialize;
use tracing::warn;

use forgegen_core::JobId;

use crate::error::{JobError, JobResult};
use crate::job::{JobHandle, JobState};
use crate::rule::{Rule, rules_conflict};

/// Rule ownership at the moment a wait was requested.
#[derive(Debug, Clone, Serialize)]
pub struct DeadlockSnapshot {
    pub waiting_job: JobId,
    pub waiting_name: String,
    pub held_rule: Option<Rule>,
    pub target_job: JobId,
    pub target_name: String,
    pub required_rule: Option<Rule>,
    pub target_state: JobState,
    pub conflicts: bool,
}

impl DeadlockSnapshot {
    pub fn capture(waiting: &JobHandle, target: &JobHandle) -> Self {
        Self {
            waiting_job: waiting.id(),
            waiting_name: waiting.name().to_string(),
            held_rule: waiting.rule().cloned(),
            target_job: target.id(),
            target_name: target.name().to_string(),
            required_rule: target.rule().cloned(),
            target_state: target.state(),
            conflicts: rules_conflict(waiting.rule(), target.rule()),
        }
    }

    pub fn is_self_wait(&self) -> bool {
        self.waiting_job == self.target_job
    }

    /// Would blocking on the target never return?
    pub fn is_deadlock(&self) -> bool {
        if self.target_state.is_terminal() {
            return false;
        }
        if self.is_self_wait() {
            return true;
        }
        self.target_state == JobState::Waiting && self.conflicts
    }

    fn reason(&self) -> String {
        if self.is_self_wait() {
            return "a job cannot wait for itself".to_string();
        }
        match (&self.held_rule, &self.required_rule) {
            (Some(held), Some(required)) => {
                format!("it holds {held} and the target is waiting for {required}")
            }
            _ => "conflicting rules".to_string(),
        }
    }

    fn into_error(self) -> JobError {
        let reason = self.reason();
        warn!(
            waiting_job = %self.waiting_job,
            waiting = %self.waiting_name,
            target_job = %self.target_job,
            target = %self.target_name,
            reason = %reason,
            "refusing wait that would deadlock"
        );
        JobError::deadlock(self.waiting_name, self.target_name, reason)
    }
}

/// Checks run by the scheduler before every blocking wait.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadlockDetector;

impl DeadlockDetector {
    /// `waiting` is the job running on the calling thread, if any.
    pub fn check_join(waiting: Option<&JobHandle>, target: &JobHandle) -> JobResult<()> {
        let Some(waiting) = waiting else {
            return Ok(());
        };
        let snapshot = DeadlockSnapshot::capture(waiting, target);
        if snapshot.is_deadlock() {
            return Err(snapshot.into_error());
        }
        Ok(())
    }

    /// Family members are expected to exclude the waiting job itself.
    pub fn check_family(waiting: Option<&JobHandle>, members: &[JobHandle]) -> JobResult<()> {
        let Some(waiting) = waiting else {
            return Ok(());
        };
        if waiting.rule().is_none() {
            return Ok(());
        }
        for member in members {
            let snapshot = DeadlockSnapshot::capture(waiting, member);
            if snapshot.is_deadlock() {
                return Err(snapshot.into_error());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::job::{Job, JobShared};
    use forgegen_core::JobTreeId;
    use std::sync::{Arc, Weak};

    fn handle(name: &str, rule: Option<Rule>, running: bool) -> JobHandle {
        let mut job = Job::new(name, |_| Ok(()));
        if let Some(rule) = rule {
            job = job.with_rule(rule);
        }
        let (spec, _) = job.into_parts();
        let shared = Arc::new(JobShared::new(
            spec,
            JobTreeId::new(),
            None,
            CancellationToken::new(),
            Weak::new(),
        ));
        if running {
            shared.mark_running();
        }
        JobHandle::from_shared(shared)
    }

    #[test]
    fn waiting_on_a_job_blocked_by_our_rule_is_refused() {
        let holder = handle("holder", Some(Rule::resource("/demo")), true);
        let target = handle("target", Some(Rule::resource("/demo/src")), false);
        let err = DeadlockDetector::check_join(Some(&holder), &target).unwrap_err();
        assert!(err.is_deadlock());
        assert!(err.to_string().contains("resource:/demo"));
    }

    #[test]
    fn waits_outside_jobs_or_without_conflict_are_allowed() {
        let holder = handle("holder", Some(Rule::key("a")), true);
        let other = handle("other", Some(Rule::key("b")), false);
        let free = handle("free", None, false);
        assert!(DeadlockDetector::check_join(None, &other).is_ok());
        assert!(DeadlockDetector::check_join(Some(&holder), &other).is_ok());
        assert!(DeadlockDetector::check_join(Some(&holder), &free).is_ok());
    }

    #[test]
    fn running_targets_are_not_deadlocks() {
        let holder = handle("holder", None, true);
        let target = handle("target", Some(Rule::key("a")), true);
        assert!(DeadlockDetector::check_join(Some(&holder), &target).is_ok());
    }

    #[test]
    fn waiting_for_yourself_is_refused() {
        let job = handle("self", None, true);
        let snapshot = DeadlockSnapshot::capture(&job, &job);
        assert!(snapshot.is_self_wait());
        assert!(DeadlockDetector::check_join(Some(&job), &job).unwrap_err().is_deadlock());
    }

    #[test]
    fn family_check_finds_any_blocked_member() {
        let holder = handle("holder", Some(Rule::key("index")), true);
        let members = vec![
            handle("a", Some(Rule::key("other")), false),
            handle("b", Some(Rule::key("index")), false),
        ];
        assert!(DeadlockDetector::check_family(Some(&holder), &members).is_err());
        assert!(DeadlockDetector::check_family(Some(&holder), &members[..1]).is_ok());
    }
}
