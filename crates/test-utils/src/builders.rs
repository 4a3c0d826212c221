#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use jobgraph::config::{ConfigFile, RawConfigFile};
use jobgraph::dag::{
    FailurePolicy, MetaTaskWork, Task, TaskContext, TaskGraph, TaskGuard, TaskWork, WorkFuture,
};
use jobgraph::registry::WorkRegistry;
use jobgraph::types::{LockObject, ObjectType, StoreMode, TaskId};
use serde_json::{json, Value};

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn worker_count(mut self, n: usize) -> Self {
        self.config.engine.worker_count = n;
        self
    }

    pub fn exit_when_idle(mut self, val: bool) -> Self {
        self.config.engine.exit_when_idle = val;
        self
    }

    pub fn file_store(mut self, path: &str) -> Self {
        self.config.store.mode = StoreMode::File;
        self.config.store.path = path.into();
        self
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared log of work invocations, in call order.
pub type WorkLog = Arc<Mutex<Vec<String>>>;

pub fn work_log() -> WorkLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn logged(log: &WorkLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Work that appends its label to a log and succeeds, or fails with
/// `fail_with` if set.
pub struct ScriptedWork {
    pub label: String,
    pub fail_with: Option<String>,
    pub log: WorkLog,
}

impl TaskWork for ScriptedWork {
    fn kind(&self) -> &'static str {
        "test.scripted"
    }

    fn params(&self) -> Value {
        json!({ "label": self.label, "fail_with": self.fail_with })
    }

    fn execute<'a>(&'a self, _ctx: &'a TaskContext) -> WorkFuture<'a, ()> {
        Box::pin(async move {
            self.log.lock().unwrap().push(self.label.clone());
            match &self.fail_with {
                Some(reason) => Err(anyhow::anyhow!("{reason}")),
                None => Ok(()),
            }
        })
    }
}

/// Meta-task whose expansion is a fixed list of scripted steps (each with
/// no predecessors), logged like plain work.
pub struct ScriptedMeta {
    pub label: String,
    pub steps: Vec<String>,
    pub log: WorkLog,
}

impl MetaTaskWork for ScriptedMeta {
    fn kind(&self) -> &'static str {
        "test.scripted_meta"
    }

    fn params(&self) -> Value {
        json!({ "label": self.label, "steps": self.steps })
    }

    fn expand<'a>(&'a self, _ctx: &'a TaskContext) -> WorkFuture<'a, TaskGraph> {
        Box::pin(async move {
            self.log.lock().unwrap().push(self.label.clone());
            let mut graph = TaskGraph::new();
            for step in &self.steps {
                let work = ScriptedWork {
                    label: step.clone(),
                    fail_with: None,
                    log: self.log.clone(),
                };
                graph.add_task(Task::work(step.clone(), work), &[])?;
            }
            Ok(graph)
        })
    }
}

/// Registry able to rebuild `ScriptedWork` / `ScriptedMeta` from params,
/// all logging into `log`.
pub fn scripted_registry(log: &WorkLog) -> WorkRegistry {
    let mut registry = WorkRegistry::new();

    let work_log = log.clone();
    registry.register_work("test.scripted", move |params| {
        Ok(ScriptedWork {
            label: params["label"].as_str().unwrap_or_default().to_string(),
            fail_with: params["fail_with"].as_str().map(str::to_string),
            log: work_log.clone(),
        })
    });

    let meta_log = log.clone();
    registry.register_meta("test.scripted_meta", move |params| {
        let steps = params["steps"]
            .as_array()
            .map(|a| a.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        Ok(ScriptedMeta {
            label: params["label"].as_str().unwrap_or_default().to_string(),
            steps,
            log: meta_log.clone(),
        })
    });

    registry
}

pub fn object(id: &str) -> LockObject {
    LockObject::new(id, format!("object-{id}"), ObjectType::SecurityGroup)
}

/// Builder for a `TaskGraph` of scripted tasks addressed by name.
pub struct GraphBuilder {
    graph: TaskGraph,
    ids: HashMap<String, TaskId>,
    log: WorkLog,
}

impl GraphBuilder {
    pub fn new(log: &WorkLog) -> Self {
        Self {
            graph: TaskGraph::new(),
            ids: HashMap::new(),
            log: log.clone(),
        }
    }

    pub fn task(self, name: &str, after: &[&str]) -> Self {
        self.task_with(name, TaskGuard::AllPredecessorsCompleted, after, |t| t)
    }

    pub fn failing(self, name: &str, reason: &str, after: &[&str]) -> Self {
        let work = ScriptedWork {
            label: name.to_string(),
            fail_with: Some(reason.to_string()),
            log: self.log.clone(),
        };
        self.insert(Task::work(name, work), TaskGuard::AllPredecessorsCompleted, after)
    }

    pub fn any_of(self, name: &str, after: &[&str]) -> Self {
        self.task_with(name, TaskGuard::AnyPredecessorCompleted, after, |t| t)
    }

    pub fn aborting(self, name: &str, reason: &str, after: &[&str]) -> Self {
        let work = ScriptedWork {
            label: name.to_string(),
            fail_with: Some(reason.to_string()),
            log: self.log.clone(),
        };
        let task = Task::work(name, work).with_failure_policy(FailurePolicy::AbortJob);
        self.insert(task, TaskGuard::AllPredecessorsCompleted, after)
    }

    pub fn with_objects(self, name: &str, after: &[&str], objects: &[&str]) -> Self {
        let objects: Vec<LockObject> = objects.iter().map(|id| object(id)).collect();
        self.task_with(name, TaskGuard::AllPredecessorsCompleted, after, move |t| {
            t.with_objects(objects)
        })
    }

    pub fn meta(self, name: &str, steps: &[&str], after: &[&str]) -> Self {
        let meta = ScriptedMeta {
            label: name.to_string(),
            steps: steps.iter().map(|s| s.to_string()).collect(),
            log: self.log.clone(),
        };
        self.insert(Task::meta(name, meta), TaskGuard::AllPredecessorsCompleted, after)
    }

    pub fn task_with(
        self,
        name: &str,
        guard: TaskGuard,
        after: &[&str],
        customize: impl FnOnce(Task) -> Task,
    ) -> Self {
        let work = ScriptedWork {
            label: name.to_string(),
            fail_with: None,
            log: self.log.clone(),
        };
        let task = customize(Task::work(name, work));
        self.insert(task, guard, after)
    }

    fn insert(mut self, task: Task, guard: TaskGuard, after: &[&str]) -> Self {
        let name = task.name().to_string();
        let preds: Vec<TaskId> = after
            .iter()
            .map(|p| *self.ids.get(*p).unwrap_or_else(|| panic!("unknown task '{p}'")))
            .collect();
        let id = self
            .graph
            .add_task_with_guard(task, guard, &preds)
            .expect("graph builder produced an invalid graph");
        self.ids.insert(name, id);
        self
    }

    pub fn build(self) -> (TaskGraph, HashMap<String, TaskId>) {
        (self.graph, self.ids)
    }
}
