//! Task Engine: a DAG of declared tasks over the other subsystems, with
//! fingerprint-based skip/execute decisions persisted to a project-root
//! dot-file.
//!
//! Assembly (`Engine<Building>`) and execution (`Engine<Built>`) are kept in
//! separate typestates so a graph can't be mutated mid-run — the same split
//! `turborepo-engine` uses for its own task graph.

mod ledger;

pub use ledger::{TaskLedger, TaskRecord, TaskStatus};

use std::{collections::HashMap, future::Future, marker::PhantomData, pin::Pin};

use color_eyre::{Result, eyre::Context, eyre::bail};
use petgraph::{
    Direction,
    graph::{DiGraph, NodeIndex},
};
use tracing::{info, instrument, warn};

use crate::{
    error::AltoError,
    fingerprint::{Fingerprint, TaskInput, task_fingerprint},
    fs::{FsHandle, ObjectPath},
};

pub type TaskId = String;

/// What a task declares about itself: its fingerprint inputs and the object
/// paths it's expected to leave behind on success. Declared statically at
/// graph-build time, never inferred from observing what a task actually did.
#[derive(Clone, Debug, Default)]
pub struct TaskDeclaration {
    pub inputs: Vec<TaskInput>,
    pub outputs: Vec<ObjectPath>,
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The work a task performs when it isn't up-to-date. Boxed rather than a
/// generic trait bound because a single graph mixes every task kind —
/// `build:*`, `config:*`, `<tap>:<target>` pipeline runs, `clean:*` — each
/// with unrelated bodies; there's no one concrete type to be generic over.
pub trait TaskBody: Send + Sync {
    fn run(&self) -> BoxFuture<'_, Result<(), AltoError>>;
}

impl<F, Fut> TaskBody for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), AltoError>> + Send + 'static,
{
    fn run(&self) -> BoxFuture<'_, Result<(), AltoError>> {
        Box::pin((self)())
    }
}

/// Lets a caller that already has a `Box<dyn TaskBody>` (the engine's own
/// task dispatcher, which picks a body shape per task-kind at graph-build
/// time) hand it to [`Engine::add_task`] without a wrapper newtype.
impl TaskBody for Box<dyn TaskBody> {
    fn run(&self) -> BoxFuture<'_, Result<(), AltoError>> {
        (**self).run()
    }
}

#[derive(Debug, Default)]
pub struct Building;
#[derive(Debug, Default)]
pub struct Built;

struct Node {
    declaration: TaskDeclaration,
    body: Box<dyn TaskBody>,
}

/// The task graph. `Engine<Building>` accumulates nodes and edges;
/// [`Engine::seal`] freezes it into `Engine<Built>`, the only state
/// [`Engine::run`] accepts.
pub struct Engine<S = Built> {
    marker: PhantomData<S>,
    graph: DiGraph<TaskId, ()>,
    lookup: HashMap<TaskId, NodeIndex>,
    nodes: HashMap<TaskId, Node>,
}

impl Engine<Building> {
    pub fn new() -> Self {
        Self { marker: PhantomData, graph: DiGraph::new(), lookup: HashMap::new(), nodes: HashMap::new() }
    }

    fn index_of(&mut self, task_id: &str) -> NodeIndex {
        if let Some(&index) = self.lookup.get(task_id) {
            return index;
        }
        let index = self.graph.add_node(task_id.to_string());
        self.lookup.insert(task_id.to_string(), index);
        index
    }

    /// Declare a task and the body that runs when it's not up-to-date.
    /// `depends_on` are task ids this task's outputs require — each is added
    /// to the graph if not already present, even if it's never separately
    /// declared via `add_task` (its body defaults to a no-op until declared,
    /// letting edges be wired before every node has a definition).
    pub fn add_task(
        &mut self,
        task_id: impl Into<TaskId>,
        declaration: TaskDeclaration,
        body: impl TaskBody + 'static,
        depends_on: impl IntoIterator<Item = TaskId>,
    ) -> &mut Self {
        let task_id = task_id.into();
        let index = self.index_of(&task_id);
        self.nodes.insert(task_id.clone(), Node { declaration, body: Box::new(body) });
        for dependency in depends_on {
            let dep_index = self.index_of(&dependency);
            self.graph.add_edge(index, dep_index, ());
        }
        self
    }

    /// Freeze the graph. Fails if any edge points at a task id that was
    /// never given a declaration and body via [`Engine::add_task`].
    pub fn seal(self) -> Result<Engine<Built>> {
        for task_id in self.lookup.keys() {
            if !self.nodes.contains_key(task_id) {
                bail!("task `{task_id}` is referenced as a dependency but was never declared");
            }
        }
        Ok(Engine { marker: PhantomData, graph: self.graph, lookup: self.lookup, nodes: self.nodes })
    }
}

impl Default for Engine<Building> {
    fn default() -> Self {
        Self::new()
    }
}

/// The terminal state of one task in a run.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Outcome {
    Succeeded,
    Skipped,
    Failed,
}

/// The result of running a task and its transitive dependencies.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub outcomes: Vec<(TaskId, Outcome)>,
}

impl RunReport {
    pub fn outcome_of(&self, task_id: &str) -> Option<Outcome> {
        self.outcomes.iter().find(|(id, _)| id == task_id).map(|(_, o)| *o)
    }

    pub fn all_succeeded_or_skipped(&self) -> bool {
        self.outcomes.iter().all(|(_, o)| *o != Outcome::Failed)
    }
}

impl Engine<Built> {
    /// Run `task_id` and its transitive dependencies, in topological order
    /// (dependencies before dependents), sequentially. On a dependency's
    /// failure, every task downstream of it is recorded as `Skipped` rather
    /// than attempted, and its own status in the ledger is left untouched.
    #[instrument(skip(self, fs, ledger, ledger_path), fields(task_id))]
    pub async fn run(
        &self,
        task_id: &str,
        fs: &impl FsHandle,
        ledger: &mut TaskLedger,
        ledger_path: &std::path::Path,
    ) -> Result<RunReport> {
        let root = *self
            .lookup
            .get(task_id)
            .ok_or_else(|| color_eyre::eyre::eyre!("unknown task `{task_id}`"))?;

        let order = self.closure_in_topological_order(root)?;
        let mut failed: std::collections::HashSet<TaskId> = std::collections::HashSet::new();
        let mut outcomes = Vec::with_capacity(order.len());

        for index in order {
            let id = &self.graph[index];
            let node = self.nodes.get(id).expect("sealed graph has a node for every task id");

            let blocked = self
                .graph
                .neighbors_directed(index, Direction::Outgoing)
                .any(|dep| failed.contains(&self.graph[dep]));
            if blocked {
                warn!(task = %id, "skipping: a dependency failed");
                failed.insert(id.clone());
                outcomes.push((id.clone(), Outcome::Skipped));
                continue;
            }

            let outcome = self.run_one(id, node, fs, ledger).await;
            if outcome == Outcome::Failed {
                failed.insert(id.clone());
            }
            outcomes.push((id.clone(), outcome));
        }

        ledger.store(ledger_path).await.context("persist task ledger")?;
        Ok(RunReport { outcomes })
    }

    #[instrument(skip(self, node, fs, ledger), fields(task_id = %id))]
    async fn run_one(&self, id: &str, node: &Node, fs: &impl FsHandle, ledger: &mut TaskLedger) -> Outcome {
        let fingerprint = task_fingerprint(&node.declaration.inputs);

        if self.up_to_date(id, fingerprint, &node.declaration.outputs, fs, ledger).await {
            info!(task = %id, "up to date, skipping");
            return Outcome::Skipped;
        }

        match node.body.run().await {
            Ok(()) => {
                ledger.record(TaskRecord::succeeded(id.to_string(), fingerprint, node.declaration.outputs.clone()));
                Outcome::Succeeded
            }
            Err(err) => {
                warn!(task = %id, error = %err, "task failed");
                ledger.record(TaskRecord::failed(id.to_string(), fingerprint, node.declaration.outputs.clone()));
                Outcome::Failed
            }
        }
    }

    async fn up_to_date(
        &self,
        id: &str,
        fingerprint: Fingerprint,
        outputs: &[ObjectPath],
        fs: &impl FsHandle,
        ledger: &TaskLedger,
    ) -> bool {
        let Some(record) = ledger.get(id) else { return false };
        if record.status != TaskStatus::Succeeded || record.inputs_fingerprint != fingerprint {
            return false;
        }
        for output in outputs {
            match fs.exists(output).await {
                Ok(true) => continue,
                _ => return false,
            }
        }
        true
    }

    /// The transitive closure of `root`'s dependencies (edges point from a
    /// task to what it depends on), ordered dependencies-first.
    fn closure_in_topological_order(&self, root: NodeIndex) -> Result<Vec<NodeIndex>> {
        let mut reachable = std::collections::HashSet::new();
        let mut stack = vec![root];
        while let Some(index) = stack.pop() {
            if reachable.insert(index) {
                stack.extend(self.graph.neighbors_directed(index, Direction::Outgoing));
            }
        }

        let sub = self.graph.filter_map(
            |index, weight| reachable.contains(&index).then(|| weight.clone()),
            |_, weight| Some(*weight),
        );
        let order = petgraph::algo::toposort(&sub, None)
            .map_err(|cycle| color_eyre::eyre::eyre!("task graph has a cycle at {:?}", cycle.node_id()))?;

        // `sub`'s node indices don't line up with `self.graph`'s after
        // filter_map, but `toposort` gives us task ids via the weight, so
        // map back through `lookup`.
        Ok(order.into_iter().map(|i| self.lookup[&sub[i]]).rev().collect())
    }
}
