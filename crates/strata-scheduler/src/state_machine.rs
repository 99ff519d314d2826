//! Step and job status transitions.
//!
//! Every mutation of a job's step records goes through [`StepStateMachine`].
//! Operations are synchronous and return a [`Transition`] listing what
//! changed, so the caller can persist and emit events, and what the job
//! should do next.

use chrono::Utc;
use strata_core::CmdId;
use strata_core::Error;
use strata_core::cmd::StepResult;
use strata_core::job::{Job, JobStatus, StepStatus};
use strata_core::node::{NodePath, NodeTree};

/// What the job driver should do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing changed: duplicate, stale or unknown input.
    Ignored,
    /// The in-flight step acknowledged it is executing.
    Started,
    /// Execute this step next.
    Next(NodePath),
    /// No step is left to run; the job ended with this status.
    Finished(JobStatus),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepChange {
    pub cmd_id: CmdId,
    pub path: NodePath,
    pub from: StepStatus,
    pub to: StepStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobChange {
    pub from: JobStatus,
    pub to: JobStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub outcome: Outcome,
    pub steps: Vec<StepChange>,
    pub job: Option<JobChange>,
}

impl Transition {
    fn new(outcome: Outcome) -> Self {
        Self {
            outcome,
            steps: Vec::new(),
            job: None,
        }
    }

    fn ignored() -> Self {
        Self::new(Outcome::Ignored)
    }

    pub fn is_ignored(&self) -> bool {
        self.outcome == Outcome::Ignored && self.steps.is_empty() && self.job.is_none()
    }

    fn set_job_status(&mut self, job: &mut Job, status: JobStatus) {
        let from = job.status;
        if job.set_status(status) {
            // Keep the first `from` when several changes fold into one.
            let from = self.job.map_or(from, |c| c.from);
            self.job = Some(JobChange { from, to: status });
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StepStateMachine;

impl StepStateMachine {
    pub fn new() -> Self {
        Self
    }

    /// Mark the job Queued while it waits for an agent.
    pub fn enqueue(&self, job: &mut Job) -> Transition {
        let mut t = Transition::ignored();
        t.set_job_status(job, JobStatus::Queued);
        t
    }

    /// Mark the job Running and pick its first step.
    pub fn start(&self, job: &mut Job) -> Transition {
        let mut t = Transition::ignored();
        t.set_job_status(job, JobStatus::Running);
        self.advance(job, &mut t);
        t
    }

    /// Record that the step's command was accepted by the broker after
    /// `attempts` publishes.
    pub fn mark_sent(&self, job: &mut Job, path: &NodePath, attempts: u32) -> Transition {
        let mut t = Transition::ignored();
        if let Some(step) = job.step_mut(path) {
            step.attempts = attempts;
        }
        self.transition(job, path, StepStatus::Sent, None, &mut t);
        t
    }

    /// Record an agent's acknowledgment that execution started.
    pub fn mark_running(&self, job: &mut Job, result: &StepResult) -> Transition {
        let mut t = Transition::ignored();
        let Some(step) = job.steps.iter_mut().find(|s| s.id == result.cmd_id) else {
            return t;
        };

        let from = step.status;
        if !step.transition(StepStatus::Running) {
            return t;
        }
        if let Some(start_at) = result.start_at {
            step.start_at = Some(start_at);
        }
        step.process_id = result.process_id.or(step.process_id);

        t.steps.push(StepChange {
            cmd_id: step.id.clone(),
            path: step.path.clone(),
            from,
            to: StepStatus::Running,
            error: None,
        });
        t.outcome = Outcome::Started;
        t
    }

    /// Apply a result reported by an agent.
    ///
    /// Results for unknown steps and for steps already in a terminal state
    /// are ignored, so redelivered results have no effect.
    pub fn apply_result(&self, job: &mut Job, tree: &NodeTree, result: &StepResult) -> Transition {
        let Some(step) = job.steps.iter_mut().find(|s| s.id == result.cmd_id) else {
            return Transition::ignored();
        };
        if step.status.is_terminal() {
            return Transition::ignored();
        }

        match result.status {
            StepStatus::Running => return self.mark_running(job, result),
            StepStatus::Pending | StepStatus::Sent => return Transition::ignored(),
            _ => {}
        }

        let from = step.status;
        if !step.transition(result.status) {
            return Transition::ignored();
        }
        step.code = result.code;
        step.process_id = result.process_id.or(step.process_id);
        step.output = result.output.clone();
        step.error = result.error.clone();
        if step.start_at.is_none() {
            step.start_at = result.start_at;
        }
        if let Some(finish_at) = result.finish_at {
            step.finish_at = Some(finish_at);
        }

        let mut t = Transition::ignored();
        t.steps.push(StepChange {
            cmd_id: step.id.clone(),
            path: step.path.clone(),
            from,
            to: result.status,
            error: result.error.clone(),
        });

        let path = step.path.clone();
        job.context.merge(&result.output);
        job.updated_at = Utc::now();

        self.settle(job, tree, &path, &mut t);
        t
    }

    /// Record a node with nothing to execute as succeeded.
    pub fn mark_passthrough(&self, job: &mut Job, tree: &NodeTree, path: &NodePath) -> Transition {
        let mut t = Transition::ignored();
        if self.transition(job, path, StepStatus::Success, None, &mut t) {
            self.settle(job, tree, path, &mut t);
        }
        t
    }

    /// Record a failure that happened on the scheduler side, such as a
    /// missing plugin input or an unreachable queue.
    pub fn fail_step(
        &self,
        job: &mut Job,
        tree: &NodeTree,
        path: &NodePath,
        error: impl Into<String>,
    ) -> Transition {
        let mut t = Transition::ignored();
        if self.transition(job, path, StepStatus::Failed, Some(error.into()), &mut t) {
            self.settle(job, tree, path, &mut t);
        }
        t
    }

    /// Finalize a step whose deadline passed without a result.
    pub fn mark_timeout(
        &self,
        job: &mut Job,
        tree: &NodeTree,
        path: &NodePath,
        seconds: u64,
    ) -> Transition {
        let error = Error::StepTimeout { seconds }.to_string();
        let mut t = Transition::ignored();
        if self.transition(job, path, StepStatus::Timeout, Some(error), &mut t) {
            self.settle(job, tree, path, &mut t);
        }
        t
    }

    /// Finalize an in-flight step whose kill was never acknowledged.
    pub fn force_kill(&self, job: &mut Job, tree: &NodeTree, path: &NodePath) -> Transition {
        let error = "killed without acknowledgment from agent".to_string();
        let mut t = Transition::ignored();
        if self.transition(job, path, StepStatus::Killed, Some(error), &mut t) {
            self.settle(job, tree, path, &mut t);
        }
        t
    }

    /// Cancel the job: every Pending step becomes Cancelled and the job
    /// ends Cancelled. An in-flight step keeps its status until the kill is
    /// acknowledged or [`force_kill`](Self::force_kill) is applied.
    pub fn cancel(&self, job: &mut Job) -> Transition {
        let mut t = Transition::ignored();
        for index in pending(job) {
            self.transition_at(job, index, StepStatus::Cancelled, None, &mut t);
        }
        t.set_job_status(job, JobStatus::Cancelled);
        t.outcome = Outcome::Finished(job.status);
        t
    }

    /// End a job that never got to run a step, e.g. no agent could be
    /// acquired. Pending steps are skipped.
    pub fn abort(&self, job: &mut Job, status: JobStatus, error: impl Into<String>) -> Transition {
        let mut t = Transition::ignored();
        for index in pending(job) {
            self.transition_at(job, index, StepStatus::Skipped, None, &mut t);
        }
        job.error = Some(error.into());
        t.set_job_status(job, status);
        t.outcome = Outcome::Finished(job.status);
        t
    }

    /// Final job status from its step records.
    ///
    /// Any failed, killed or timed-out step fails the job, including steps
    /// allowed to fail. A timeout of a step that was not allowed to fail
    /// makes the job Timeout.
    pub fn fold_status(&self, job: &Job) -> JobStatus {
        let mut status = JobStatus::Success;
        for step in job.steps.iter().filter(|s| s.is_failure()) {
            if step.status == StepStatus::Timeout && !step.allow_failure {
                return JobStatus::Timeout;
            }
            status = JobStatus::Failed;
        }
        status
    }

    fn transition(
        &self,
        job: &mut Job,
        path: &NodePath,
        to: StepStatus,
        error: Option<String>,
        t: &mut Transition,
    ) -> bool {
        match job.steps.iter().position(|s| &s.path == path) {
            Some(index) => self.transition_at(job, index, to, error, t),
            None => false,
        }
    }

    fn transition_at(
        &self,
        job: &mut Job,
        index: usize,
        to: StepStatus,
        error: Option<String>,
        t: &mut Transition,
    ) -> bool {
        let Some(step) = job.steps.get_mut(index) else {
            return false;
        };
        let from = step.status;
        if !step.transition(to) {
            return false;
        }
        if error.is_some() {
            step.error = error.clone();
        }
        t.steps.push(StepChange {
            cmd_id: step.id.clone(),
            path: step.path.clone(),
            from,
            to,
            error,
        });
        job.updated_at = Utc::now();
        true
    }

    /// Apply failure propagation for the now-terminal step at `path`, then
    /// decide what runs next.
    ///
    /// A blocking failure skips the failed node's subtree and every node
    /// not covered by a `final` node, itself included.
    fn settle(&self, job: &mut Job, tree: &NodeTree, path: &NodePath, t: &mut Transition) {
        let blocking = job
            .step(path)
            .is_some_and(|s| s.is_failure() && !s.allow_failure);

        if blocking {
            let below = match tree.position(path) {
                Some(start) => start + 1..start + 1 + tree.subtree(path).len(),
                None => 0..0,
            };

            // Parents precede children, so one pass settles inheritance.
            let mut runs_anyway = vec![false; tree.len()];
            for (index, node) in tree.nodes().enumerate() {
                let inherited = tree
                    .parent(node)
                    .and_then(|parent| tree.position(&parent.path))
                    .is_some_and(|parent| runs_anyway[parent]);
                runs_anyway[index] = node.is_final || inherited;

                if below.contains(&index) || !runs_anyway[index] {
                    self.skip(job, index, &node.path, t);
                }
            }
        }

        self.advance(job, t);
    }

    /// Skip the step of the node at tree position `index` if still Pending.
    fn skip(&self, job: &mut Job, index: usize, path: &NodePath, t: &mut Transition) {
        if let Some(step) = step_index(job, index, path)
            && job.steps[step].status == StepStatus::Pending
        {
            self.transition_at(job, step, StepStatus::Skipped, None, t);
        }
    }

    fn advance(&self, job: &mut Job, t: &mut Transition) {
        if job.status.is_terminal() {
            t.outcome = Outcome::Finished(job.status);
            return;
        }

        let next = job
            .steps
            .iter()
            .find(|s| s.status == StepStatus::Pending)
            .map(|s| s.path.clone());

        t.outcome = match next {
            Some(path) => Outcome::Next(path),
            None => {
                let status = self.fold_status(job);
                t.set_job_status(job, status);
                Outcome::Finished(status)
            }
        };
    }
}

/// Step index for the node at tree position `index`. Jobs create their
/// steps in traversal order, so the positions normally coincide.
fn step_index(job: &Job, index: usize, path: &NodePath) -> Option<usize> {
    match job.steps.get(index) {
        Some(step) if &step.path == path => Some(index),
        _ => job.steps.iter().position(|s| &s.path == path),
    }
}

fn pending(job: &Job) -> Vec<usize> {
    job.steps
        .iter()
        .enumerate()
        .filter(|(_, s)| s.status == StepStatus::Pending)
        .map(|(i, _)| i)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::FlowId;
    use strata_core::variables::VariableMap;

    fn path(p: &str) -> NodePath {
        NodePath::parse(p).unwrap()
    }

    fn setup(yaml: &str) -> (NodeTree, Job) {
        let tree = NodeTree::parse(yaml).unwrap();
        let job = Job::new(FlowId::new(), 1, &tree, "hash", VariableMap::new());
        (tree, job)
    }

    fn result(job: &Job, p: &str, status: StepStatus) -> StepResult {
        StepResult::new(CmdId::of(job.id, &path(p)), status)
    }

    fn status_of(job: &Job, p: &str) -> StepStatus {
        job.step(&path(p)).unwrap().status
    }

    /// Walk the job forward, answering every executable step from `answer`.
    fn drive(
        sm: &StepStateMachine,
        tree: &NodeTree,
        job: &mut Job,
        answer: impl Fn(&str) -> StepStatus,
    ) -> JobStatus {
        let mut outcome = sm.start(job).outcome;
        loop {
            outcome = match outcome {
                Outcome::Next(p) => {
                    let node = tree.get(&p).unwrap();
                    if !node.is_executable() {
                        sm.mark_passthrough(job, tree, &p).outcome
                    } else {
                        sm.mark_sent(job, &p, 1);
                        let r = StepResult::new(CmdId::of(job.id, &p), answer(p.name()));
                        sm.apply_result(job, tree, &r).outcome
                    }
                }
                Outcome::Finished(status) => return status,
                other => panic!("unexpected outcome {:?}", other),
            }
        }
    }

    const CHAIN: &str = r#"
steps:
  - name: a
    script: "false"
  - name: b
    script: echo b
  - name: c
    script: echo c
"#;

    #[test]
    fn test_required_failure_skips_rest() {
        let (tree, mut job) = setup(CHAIN);
        let sm = StepStateMachine::new();

        let status = drive(&sm, &tree, &mut job, |name| match name {
            "a" => StepStatus::Failed,
            _ => StepStatus::Success,
        });

        assert_eq!(status, JobStatus::Failed);
        assert_eq!(status_of(&job, "root"), StepStatus::Success);
        assert_eq!(status_of(&job, "root/a"), StepStatus::Failed);
        assert_eq!(status_of(&job, "root/b"), StepStatus::Skipped);
        assert_eq!(status_of(&job, "root/c"), StepStatus::Skipped);
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.finished_at.is_some());
    }

    #[test]
    fn test_blocking_failure_in_wide_tree() {
        let mut yaml = String::from("steps:\n  - name: first\n    script: \"false\"\n");
        for group in 0..500 {
            yaml.push_str(&format!(
                "  - name: g{group}\n    steps:\n      - script: a\n      - script: b\n"
            ));
        }
        yaml.push_str("  - name: teardown\n    final: true\n    steps:\n      - script: down\n");

        let (tree, mut job) = setup(&yaml);
        let sm = StepStateMachine::new();
        let status = drive(&sm, &tree, &mut job, |name| match name {
            "first" => StepStatus::Failed,
            _ => StepStatus::Success,
        });

        assert_eq!(status, JobStatus::Failed);
        let skipped = job
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Skipped)
            .count();
        assert_eq!(skipped, 500 * 3);
        assert_eq!(status_of(&job, "root/g499/step-2"), StepStatus::Skipped);
        assert_eq!(status_of(&job, "root/teardown"), StepStatus::Success);
        assert_eq!(status_of(&job, "root/teardown/step-1"), StepStatus::Success);
    }

    #[test]
    fn test_failure_propagation_with_reordered_steps() {
        let (tree, mut job) = setup(CHAIN);
        job.steps.reverse();
        let sm = StepStateMachine::new();

        sm.fail_step(&mut job, &tree, &path("root/a"), "boom");

        assert_eq!(status_of(&job, "root/a"), StepStatus::Failed);
        assert_eq!(status_of(&job, "root/b"), StepStatus::Skipped);
        assert_eq!(status_of(&job, "root/c"), StepStatus::Skipped);
    }

    #[test]
    fn test_allowed_failure_continues_but_fails_job() {
        let (tree, mut job) = setup(&CHAIN.replace(
            "script: \"false\"",
            "script: \"false\"\n    allow_failure: true",
        ));
        let sm = StepStateMachine::new();

        let status = drive(&sm, &tree, &mut job, |name| match name {
            "a" => StepStatus::Failed,
            _ => StepStatus::Success,
        });

        assert_eq!(status_of(&job, "root/a"), StepStatus::Failed);
        assert_eq!(status_of(&job, "root/b"), StepStatus::Success);
        assert_eq!(status_of(&job, "root/c"), StepStatus::Success);
        assert_eq!(status, JobStatus::Failed);
    }

    #[test]
    fn test_final_steps_run_after_failure() {
        let (tree, mut job) = setup(
            r#"
steps:
  - name: build
    script: make
    steps:
      - name: inner
        script: make inner
  - name: test
    script: make test
  - name: cleanup
    final: true
    steps:
      - name: wipe
        script: rm -rf target
"#,
        );
        let sm = StepStateMachine::new();

        let status = drive(&sm, &tree, &mut job, |name| match name {
            "build" => StepStatus::Failed,
            _ => StepStatus::Success,
        });

        assert_eq!(status, JobStatus::Failed);
        assert_eq!(status_of(&job, "root/build/inner"), StepStatus::Skipped);
        assert_eq!(status_of(&job, "root/test"), StepStatus::Skipped);
        assert_eq!(status_of(&job, "root/cleanup"), StepStatus::Success);
        assert_eq!(status_of(&job, "root/cleanup/wipe"), StepStatus::Success);
    }

    #[test]
    fn test_duplicate_and_unknown_results_are_ignored() {
        let (tree, mut job) = setup(CHAIN);
        let sm = StepStateMachine::new();
        sm.start(&mut job);
        sm.mark_passthrough(&mut job, &tree, &path("root"));
        sm.mark_sent(&mut job, &path("root/a"), 1);

        let mut output = VariableMap::new();
        output.insert("STRATA_VERSION", "1.0");
        let success = result(&job, "root/a", StepStatus::Success).with_output(output);

        let first = sm.apply_result(&mut job, &tree, &success);
        assert_eq!(first.outcome, Outcome::Next(path("root/b")));
        let snapshot = job.clone();

        let again = sm.apply_result(&mut job, &tree, &success);
        assert!(again.is_ignored());
        let late_failure = result(&job, "root/a", StepStatus::Failed);
        assert!(sm.apply_result(&mut job, &tree, &late_failure).is_ignored());
        assert_eq!(job.steps, snapshot.steps);
        assert_eq!(job.context.get("STRATA_VERSION"), Some("1.0"));

        let stranger = StepResult::new(
            CmdId::of(job.id, &path("root/zzz")),
            StepStatus::Success,
        );
        assert!(sm.apply_result(&mut job, &tree, &stranger).is_ignored());
    }

    #[test]
    fn test_running_ack() {
        let (tree, mut job) = setup(CHAIN);
        let sm = StepStateMachine::new();
        sm.start(&mut job);
        sm.mark_passthrough(&mut job, &tree, &path("root"));
        sm.mark_sent(&mut job, &path("root/a"), 2);

        let mut running = result(&job, "root/a", StepStatus::Running);
        running.process_id = Some(4242);

        let t = sm.apply_result(&mut job, &tree, &running);
        assert_eq!(t.outcome, Outcome::Started);
        let step = job.step(&path("root/a")).unwrap();
        assert_eq!(step.status, StepStatus::Running);
        assert_eq!(step.process_id, Some(4242));
        assert_eq!(step.attempts, 2);
        assert!(step.start_at.is_some());

        // A second ack changes nothing.
        assert!(sm.apply_result(&mut job, &tree, &running).is_ignored());
    }

    #[test]
    fn test_timeout_makes_job_timeout() {
        let (tree, mut job) = setup(CHAIN);
        let sm = StepStateMachine::new();
        sm.start(&mut job);
        sm.mark_passthrough(&mut job, &tree, &path("root"));
        sm.mark_sent(&mut job, &path("root/a"), 1);

        let t = sm.mark_timeout(&mut job, &tree, &path("root/a"), 30);

        assert_eq!(t.outcome, Outcome::Finished(JobStatus::Timeout));
        let step = job.step(&path("root/a")).unwrap();
        assert_eq!(step.status, StepStatus::Timeout);
        assert_eq!(step.error.as_deref(), Some("Step timeout after 30 seconds"));
        assert_eq!(status_of(&job, "root/b"), StepStatus::Skipped);
    }

    #[test]
    fn test_fail_step_records_error() {
        let (tree, mut job) = setup(CHAIN);
        let sm = StepStateMachine::new();
        sm.start(&mut job);
        sm.mark_passthrough(&mut job, &tree, &path("root"));

        let t = sm.fail_step(&mut job, &tree, &path("root/a"), "Missing input 'X'");

        assert_eq!(t.outcome, Outcome::Finished(JobStatus::Failed));
        assert_eq!(
            t.job,
            Some(JobChange {
                from: JobStatus::Running,
                to: JobStatus::Failed
            })
        );
        let step = job.step(&path("root/a")).unwrap();
        assert_eq!(step.error.as_deref(), Some("Missing input 'X'"));
    }

    #[test]
    fn test_cancel_with_step_in_flight() {
        let (tree, mut job) = setup(CHAIN);
        let sm = StepStateMachine::new();
        sm.start(&mut job);
        sm.mark_passthrough(&mut job, &tree, &path("root"));
        sm.mark_sent(&mut job, &path("root/a"), 1);
        let running = result(&job, "root/a", StepStatus::Running);
        sm.apply_result(&mut job, &tree, &running);

        let t = sm.cancel(&mut job);
        assert_eq!(t.outcome, Outcome::Finished(JobStatus::Cancelled));
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(status_of(&job, "root/a"), StepStatus::Running);
        assert_eq!(status_of(&job, "root/b"), StepStatus::Cancelled);
        assert_eq!(status_of(&job, "root/c"), StepStatus::Cancelled);

        let killed = result(&job, "root/a", StepStatus::Killed);
        let t = sm.apply_result(&mut job, &tree, &killed);
        assert_eq!(t.outcome, Outcome::Finished(JobStatus::Cancelled));
        assert_eq!(status_of(&job, "root/a"), StepStatus::Killed);
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[test]
    fn test_force_kill_after_cancel() {
        let (tree, mut job) = setup(CHAIN);
        let sm = StepStateMachine::new();
        sm.start(&mut job);
        sm.mark_passthrough(&mut job, &tree, &path("root"));
        sm.mark_sent(&mut job, &path("root/a"), 1);
        sm.cancel(&mut job);

        let t = sm.force_kill(&mut job, &tree, &path("root/a"));
        assert_eq!(t.steps.len(), 1);
        assert_eq!(status_of(&job, "root/a"), StepStatus::Killed);
        assert!(job.in_flight().is_none());
    }

    #[test]
    fn test_abort_before_any_step() {
        let (_, mut job) = setup(CHAIN);
        let sm = StepStateMachine::new();

        let t = sm.abort(&mut job, JobStatus::Failed, "no agent");

        assert_eq!(t.outcome, Outcome::Finished(JobStatus::Failed));
        assert!(job.steps.iter().all(|s| s.status == StepStatus::Skipped));
        assert_eq!(job.error.as_deref(), Some("no agent"));
    }

    #[test]
    fn test_all_success() {
        let (tree, mut job) = setup(CHAIN);
        let sm = StepStateMachine::new();

        let status = drive(&sm, &tree, &mut job, |_| StepStatus::Success);

        assert_eq!(status, JobStatus::Success);
        assert!(job.steps.iter().all(|s| s.status == StepStatus::Success));
    }
}
