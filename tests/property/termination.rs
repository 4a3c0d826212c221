use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use proptest::prelude::*;

use jobgraph::dag::{Job, JobState, TaskState};
use jobgraph::engine::{
    CoreCommand, CoreRuntime, RuntimeEvent, RuntimeOptions, ScheduledTask, TaskOutcome,
};
use jobgraph::store::MemoryStore;

use crate::frontier::{build_graph, dag_strategy, task_name};

fn scheduled(commands: Vec<CoreCommand>) -> Vec<ScheduledTask> {
    commands
        .into_iter()
        .filter_map(|c| match c {
            CoreCommand::DispatchTasks(tasks) => Some(tasks),
            _ => None,
        })
        .flatten()
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_job_reaches_a_terminal_state(
        shape in dag_strategy(12),
        failing in proptest::collection::hash_set(0usize..12, 0..4),
        worker_count in 1usize..4,
    ) {
        let failing: HashSet<usize> = failing.into_iter().filter(|i| *i < shape.deps.len()).collect();
        let (graph, _) = build_graph(&shape, &failing);
        let job = Job::new("property", graph);
        let job_id = job.id();

        let options = RuntimeOptions {
            worker_count,
            exit_when_idle: true,
            ..RuntimeOptions::default()
        };
        let mut core = CoreRuntime::new(Arc::new(MemoryStore::new()), options);

        let mut running: VecDeque<ScheduledTask> = VecDeque::new();
        let step = core.step(RuntimeEvent::JobSubmitted(job));
        running.extend(scheduled(step.commands));

        let mut steps = 0;
        while let Some(task) = running.pop_front() {
            steps += 1;
            prop_assert!(steps <= 100, "simulation did not converge");
            prop_assert!(core.in_flight() <= worker_count);

            let index: usize = task.name[1..].parse().unwrap();
            let outcome = if failing.contains(&index) {
                TaskOutcome::Failed("scripted failure".to_string())
            } else {
                TaskOutcome::Completed
            };
            let step = core.step(RuntimeEvent::TaskFinished {
                job: task.job_id,
                task: task.task_id,
                outcome,
            });
            running.extend(scheduled(step.commands));
        }

        prop_assert!(core.is_idle());
        let job = core.job(job_id).unwrap();
        prop_assert!(job.is_terminal());

        let all_completed = job.graph().iter().all(|t| t.state() == TaskState::Completed);
        if failing.is_empty() {
            prop_assert!(all_completed);
            prop_assert_eq!(job.state(), JobState::Completed);
        } else {
            prop_assert_eq!(job.state(), JobState::Failed);
            prop_assert!(job.failure_reasons().contains(&"scripted failure".to_string()));
        }

        // Nothing left queued could still run.
        for task in job.graph().iter().filter(|t| t.state() == TaskState::Queued) {
            prop_assert!(!job.graph().is_admissible(task.id()), "{} left admissible", task.name());
        }
        for i in failing {
            let task = job.graph().find_by_name(&task_name(i)).unwrap();
            prop_assert!(task.state() == TaskState::Failed || task.state() == TaskState::Queued);
        }
        prop_assert!(core.locks().is_empty());
    }
}
