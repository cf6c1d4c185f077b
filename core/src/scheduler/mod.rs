//! Cooperative driver for the task forest.
//!
//! A single async loop advances every live task tree: it prepares newly
//! attached tasks, spawns eligible `run()`/`report()` futures (joined back
//! through a `FuturesUnordered`, so sibling tasks overlap), and delivers
//! subtask-completion callbacks one at a time per parent. Dynamic subtasks
//! returned from a callback are attached and driven like any other node.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::task::JoinError;
use tokio::time::Instant;

use crate::config::SchedulerConfig;
use crate::error::{SchedulerError, TaskError};
use crate::task::state::{StateInfo, StateTransition};
use crate::task::{
    FinishedSubtask, IdAlloc, PrepareContext, ReportResult, TaskContext, TaskFlags, TaskHandler,
    TaskId, TaskOutput, TaskSpec, TaskState,
};

/// Terminal snapshot of a top-level task tree.
pub struct FinishedTask {
    pub id: TaskId,
    pub name: String,
    pub state: TaskState,
    pub canceled: bool,
    pub progress: u32,
    /// The task's own sticky error, if any.
    pub error: Option<String>,
    /// First error found in the tree (depth-first, discovery order), with
    /// subtask-name prefixes unless `minimize_subtask_error_text` applies.
    pub tree_error: Option<String>,
    /// Text generated by the task when its reporting flags are set.
    pub report: Option<String>,
    output: Option<TaskOutput>,
}

impl FinishedTask {
    pub fn ok(&self) -> bool {
        !self.canceled && self.tree_error.is_none() && self.error.is_none()
    }

    pub fn take_output<T: 'static>(&mut self) -> Option<Box<T>> {
        match self.output.take() {
            Some(out) => match out.downcast::<T>() {
                Ok(v) => Some(v),
                Err(out) => {
                    self.output = Some(out);
                    None
                }
            },
            None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodePhase {
    /// Needs `prepare()`.
    Fresh,
    /// Children may be live; own run not yet dispatched or just returned.
    Driving,
    RunInFlight,
    /// Eligible for `report()`, possibly waiting out a re-poll timer.
    ReportReady,
    ReportInFlight,
    Done,
}

struct TaskNode {
    id: TaskId,
    parent: Option<TaskId>,
    name: String,
    key: Option<String>,
    flags: TaskFlags,
    state: TaskState,
    info: Arc<StateInfo>,
    /// Taken while a spawned `run()`/`report()` owns the handler.
    handler: Option<Box<dyn TaskHandler>>,
    children: Vec<TaskId>,
    live_children: usize,
    phase: NodePhase,
    run_done: bool,
    cancel_pushed: bool,
    report_after: Option<Instant>,
    output: Option<TaskOutput>,
    report_text: Option<String>,
}

impl TaskNode {
    fn new(id: TaskId, parent: Option<TaskId>, spec: TaskSpec) -> Self {
        Self {
            id,
            parent,
            name: spec.name,
            key: spec.key,
            flags: spec.flags,
            state: TaskState::Created,
            info: Arc::new(StateInfo::default()),
            handler: Some(spec.handler),
            children: Vec::new(),
            live_children: 0,
            phase: NodePhase::Fresh,
            run_done: false,
            cancel_pushed: false,
            report_after: None,
            output: None,
            report_text: None,
        }
    }

    fn is_live(&self) -> bool {
        self.phase != NodePhase::Done
    }
}

enum Inflight {
    Run {
        handler: Box<dyn TaskHandler>,
        result: Result<(), TaskError>,
    },
    Report {
        handler: Box<dyn TaskHandler>,
        result: Result<ReportResult, TaskError>,
    },
}

type JoinedInflight = (TaskId, Result<Inflight, JoinError>);

pub struct TaskScheduler {
    cfg: SchedulerConfig,
    ids: IdAlloc,
    nodes: BTreeMap<TaskId, TaskNode>,
    roots: Vec<TaskId>,
    /// Completed (parent, child) pairs awaiting callback delivery, in
    /// completion order.
    callbacks: VecDeque<(TaskId, TaskId)>,
    inflight: FuturesUnordered<BoxFuture<'static, JoinedInflight>>,
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl TaskScheduler {
    pub fn new(cfg: SchedulerConfig) -> Self {
        Self {
            cfg,
            ids: IdAlloc::default(),
            nodes: BTreeMap::new(),
            roots: Vec::new(),
            callbacks: VecDeque::new(),
            inflight: FuturesUnordered::new(),
        }
    }

    /// Attach a top-level task tree. Driving starts on the next `drive()`.
    pub fn register(&mut self, spec: TaskSpec) -> TaskId {
        let id = self.ids.next();
        tracing::debug!(task = %spec.name, id, "task registered");
        self.nodes.insert(id, TaskNode::new(id, None, spec));
        self.roots.push(id);
        id
    }

    /// Request cancellation of a task. Cooperative: running work observes
    /// the flag at its next suspension point.
    pub fn cancel(&mut self, id: TaskId) {
        if let Some(node) = self.nodes.get(&id) {
            node.info.cancel();
        }
    }

    /// Shared state handle, e.g. for progress display or cancellation from
    /// outside the scheduler loop.
    pub fn info_handle(&self, id: TaskId) -> Option<Arc<StateInfo>> {
        self.nodes.get(&id).map(|n| n.info.clone())
    }

    pub fn state_of(&self, id: TaskId) -> Option<TaskState> {
        self.nodes.get(&id).map(|n| n.state)
    }

    pub fn children_of(&self, id: TaskId) -> Vec<TaskId> {
        self.nodes
            .get(&id)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    /// Register a single tree and drive the whole forest to completion,
    /// returning that tree's terminal snapshot.
    pub async fn run_task(&mut self, spec: TaskSpec) -> Result<FinishedTask, SchedulerError> {
        let id = self.register(spec);
        self.drive().await?;
        self.take_finished(id)
    }

    /// Advance every registered tree until all of them are terminal.
    pub async fn drive(&mut self) -> Result<(), SchedulerError> {
        let tick = Duration::from_millis(self.cfg.tick_interval_ms.max(1));
        loop {
            self.pump().await?;

            if self.all_roots_terminal() {
                return Ok(());
            }

            let wake_after = match self.next_report_deadline() {
                Some(at) => at.saturating_duration_since(Instant::now()).min(tick),
                None => tick,
            };

            if self.inflight.is_empty() {
                if self.next_report_deadline().is_none() && !self.has_pending_cancellation() {
                    return Err(SchedulerError::Stalled(self.stall_diagnostics()));
                }
                tokio::time::sleep(wake_after).await;
                continue;
            }

            let joined = tokio::select! {
                joined = self.inflight.next() => joined,
                _ = tokio::time::sleep(wake_after) => None,
            };
            if let Some(joined) = joined {
                self.on_joined(joined)?;
            }
        }
    }

    /// Remove a terminal top-level tree and return its snapshot.
    pub fn take_finished(&mut self, root: TaskId) -> Result<FinishedTask, SchedulerError> {
        let node = self
            .nodes
            .get(&root)
            .ok_or(SchedulerError::UnknownTask(root))?;
        if node.is_live() {
            return Err(SchedulerError::Stalled(format!(
                "task '{}' is not terminal",
                node.name
            )));
        }

        let tree_error = self.tree_error_text(root);
        let mut subtree = Vec::new();
        self.collect_subtree(root, &mut subtree);

        let mut node = self.nodes.remove(&root).expect("checked above");
        for id in subtree {
            self.nodes.remove(&id);
        }
        self.roots.retain(|r| *r != root);

        Ok(FinishedTask {
            id: node.id,
            name: std::mem::take(&mut node.name),
            state: node.state,
            canceled: node.info.is_canceled(),
            progress: node.info.progress(),
            error: node.info.error_text(),
            tree_error,
            report: node.report_text.take(),
            output: node.output.take(),
        })
    }

    fn all_roots_terminal(&self) -> bool {
        self.roots
            .iter()
            .all(|id| self.nodes.get(id).map(|n| !n.is_live()).unwrap_or(true))
    }

    fn has_pending_cancellation(&self) -> bool {
        self.nodes
            .values()
            .any(|n| n.is_live() && n.info.is_canceled() && !n.cancel_pushed)
    }

    fn stall_diagnostics(&self) -> String {
        let live: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.is_live())
            .map(|n| format!("'{}' ({:?})", n.name, n.phase))
            .collect();
        format!("no runnable work, live tasks: {}", live.join(", "))
    }

    /// Apply every state transition that is possible right now, repeating
    /// until a fixpoint.
    async fn pump(&mut self) -> Result<(), SchedulerError> {
        loop {
            let mut progressed = false;
            progressed |= self.propagate_cancellation();
            progressed |= self.deliver_callbacks()?;
            progressed |= self.prepare_fresh().await?;
            progressed |= self.dispatch_ready()?;
            if !progressed {
                return Ok(());
            }
        }
    }

    /// Push cancellation down to live children: always for an errored
    /// parent, and for a canceled parent carrying
    /// `cancel_on_subtask_cancel`. One-shot per node; children attached
    /// later inherit at attach time.
    fn propagate_cancellation(&mut self) -> bool {
        let mut progressed = false;
        let ids: Vec<TaskId> = self.nodes.keys().copied().collect();
        for id in ids {
            let (wants, children) = {
                let node = self.nodes.get(&id).expect("node just listed");
                if !node.is_live() || node.cancel_pushed {
                    continue;
                }
                let wants = node.info.has_error()
                    || (node.info.is_canceled() && node.flags.cancel_on_subtask_cancel);
                (wants, node.children.clone())
            };
            if !wants {
                continue;
            }
            self.nodes.get_mut(&id).expect("node just listed").cancel_pushed = true;
            progressed = true;
            for child in children {
                if let Some(child_node) = self.nodes.get(&child) {
                    if child_node.is_live() {
                        child_node.info.cancel();
                    }
                }
            }
        }
        progressed
    }

    /// Deliver queued subtask-completion callbacks, strictly one at a time.
    fn deliver_callbacks(&mut self) -> Result<bool, SchedulerError> {
        let mut progressed = false;
        while let Some((pid, cid)) = self.callbacks.pop_front() {
            let parent = match self.nodes.get_mut(&pid) {
                Some(p) => p,
                None => continue,
            };
            if parent.handler.is_none() {
                // Handler is out with a spawned future; retry after it
                // comes home.
                self.callbacks.push_front((pid, cid));
                break;
            }

            let mut snapshot = {
                let child = self.nodes.get_mut(&cid).expect("terminal child retained");
                FinishedSubtask::new(
                    child.id,
                    child.key.clone(),
                    child.name.clone(),
                    child.state,
                    child.info.error_text(),
                    child.info.is_canceled(),
                    child.info.progress(),
                    child.report_text.take(),
                    child.output.take(),
                )
            };

            let parent = self.nodes.get_mut(&pid).expect("checked above");
            parent.live_children -= 1;

            let info = parent.info.clone();
            let mut handler = parent.handler.take().expect("checked above");
            let result = handler.on_subtask_finished(&mut snapshot, &info);
            let parent = self.nodes.get_mut(&pid).expect("checked above");
            parent.handler = Some(handler);

            // Child cancellation is inherited after the callback, so the
            // handler observes the state the task had before this child
            // terminated.
            if parent.flags.cancel_on_subtask_cancel && snapshot.state == TaskState::Canceled {
                parent.info.cancel();
            }

            match result {
                Ok(specs) => {
                    let healthy = !parent.info.is_canceled() && !parent.info.has_error();
                    if healthy {
                        for spec in specs {
                            let id = self.ids.next();
                            self.attach(pid, id, spec);
                        }
                    } else if !specs.is_empty() {
                        tracing::debug!(
                            parent = pid,
                            dropped = specs.len(),
                            "discarding subtasks returned by a canceled or failed task"
                        );
                    }
                }
                Err(e) => {
                    let parent = self.nodes.get_mut(&pid).expect("checked above");
                    parent.info.set_error(e.to_string());
                }
            }

            progressed = true;
        }
        Ok(progressed)
    }

    async fn prepare_fresh(&mut self) -> Result<bool, SchedulerError> {
        let fresh: Vec<TaskId> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.phase == NodePhase::Fresh)
            .map(|(id, _)| *id)
            .collect();

        for id in &fresh {
            self.set_state(*id, TaskState::Prepared)?;

            let (mut handler, info) = {
                let node = self.nodes.get_mut(id).expect("fresh node listed");
                (
                    node.handler.take().expect("fresh node owns its handler"),
                    node.info.clone(),
                )
            };

            let mut new_subtasks = Vec::new();
            if !info.is_canceled() {
                let mut ctx = PrepareContext::new(&info, &self.ids, &mut new_subtasks);
                if let Err(e) = handler.prepare(&mut ctx).await {
                    info.set_error(e.to_string());
                }
            }

            let node = self.nodes.get_mut(id).expect("fresh node listed");
            node.handler = Some(handler);
            node.phase = NodePhase::Driving;

            for (cid, spec) in new_subtasks {
                self.attach(*id, cid, spec);
            }

            let node = self.nodes.get(id).expect("fresh node listed");
            if node.live_children > 0 {
                self.set_state(*id, TaskState::WaitingSubtasks)?;
            }
        }

        Ok(!fresh.is_empty())
    }

    /// Spawn `run()` for tasks whose subtasks are all terminal, and
    /// `report()` for tasks whose own work is done.
    fn dispatch_ready(&mut self) -> Result<bool, SchedulerError> {
        let mut progressed = false;
        let ids: Vec<TaskId> = self.nodes.keys().copied().collect();
        let now = Instant::now();

        for id in ids {
            let node = match self.nodes.get(&id) {
                Some(n) => n,
                None => continue,
            };

            match node.phase {
                NodePhase::Driving => {
                    if node.live_children > 0 || self.callbacks.iter().any(|(p, _)| *p == id) {
                        continue;
                    }
                    let skip_run = node.run_done
                        || node.flags.no_run
                        || node.info.is_canceled()
                        || node.info.has_error();
                    if skip_run {
                        self.nodes.get_mut(&id).expect("listed").phase = NodePhase::ReportReady;
                        progressed = true;
                    } else {
                        self.spawn_run(id)?;
                        progressed = true;
                    }
                }
                NodePhase::ReportReady => {
                    let due = node.report_after.map(|at| at <= now).unwrap_or(true);
                    if due {
                        self.spawn_report(id)?;
                        progressed = true;
                    }
                }
                _ => {}
            }
        }

        Ok(progressed)
    }

    fn spawn_run(&mut self, id: TaskId) -> Result<(), SchedulerError> {
        self.set_state(id, TaskState::Running)?;
        let node = self.nodes.get_mut(&id).expect("dispatching listed node");
        node.phase = NodePhase::RunInFlight;
        let mut handler = node.handler.take().expect("idle node owns its handler");
        let ctx = TaskContext::new(node.info.clone());
        let name = node.name.clone();

        let handle = tokio::spawn(async move {
            tracing::trace!(task = %name, "run started");
            let result = handler.run(ctx).await;
            Inflight::Run { handler, result }
        });
        self.inflight
            .push(async move { (id, handle.await) }.boxed());
        Ok(())
    }

    fn spawn_report(&mut self, id: TaskId) -> Result<(), SchedulerError> {
        self.set_state(id, TaskState::Running)?;
        let node = self.nodes.get_mut(&id).expect("dispatching listed node");
        node.phase = NodePhase::ReportInFlight;
        node.report_after = None;
        let mut handler = node.handler.take().expect("idle node owns its handler");
        let ctx = TaskContext::new(node.info.clone());

        let handle = tokio::spawn(async move {
            let result = handler.report(ctx).await;
            Inflight::Report { handler, result }
        });
        self.inflight
            .push(async move { (id, handle.await) }.boxed());
        Ok(())
    }

    fn on_joined(&mut self, joined: JoinedInflight) -> Result<(), SchedulerError> {
        let (id, result) = joined;
        match result {
            Ok(Inflight::Run { handler, result }) => {
                let node = self.nodes.get_mut(&id).expect("inflight node retained");
                node.handler = Some(handler);
                node.run_done = true;
                node.phase = NodePhase::Driving;
                if let Err(e) = result {
                    node.info.set_error(e.to_string());
                }
            }
            Ok(Inflight::Report { handler, result }) => {
                let node = self.nodes.get_mut(&id).expect("inflight node retained");
                node.handler = Some(handler);
                match result {
                    Ok(ReportResult::CallMeAgain) => {
                        node.phase = NodePhase::ReportReady;
                        node.report_after = Some(
                            Instant::now() + Duration::from_millis(self.cfg.tick_interval_ms),
                        );
                    }
                    Ok(ReportResult::Finished) => self.finish_node(id)?,
                    Err(e) => {
                        node.info.set_error(e.to_string());
                        self.finish_node(id)?;
                    }
                }
            }
            Err(join_err) => {
                // The spawned future panicked or was aborted; the handler is
                // lost with it.
                let node = self.nodes.get_mut(&id).expect("inflight node retained");
                node.info
                    .set_error(format!("task worker failed: {join_err}"));
                let was_run = node.phase == NodePhase::RunInFlight;
                node.handler = None;
                if was_run {
                    node.run_done = true;
                    node.phase = NodePhase::Driving;
                } else {
                    self.finish_node(id)?;
                }
            }
        }
        Ok(())
    }

    fn finish_node(&mut self, id: TaskId) -> Result<(), SchedulerError> {
        let node = self.nodes.get_mut(&id).expect("finishing retained node");

        if let Some(mut handler) = node.handler.take() {
            node.output = handler.take_output();
            if node.flags.reporting_supported && node.flags.reporting_enabled {
                node.report_text = handler.generate_report();
            }
            // Dropping the handler releases task-owned resources (sessions,
            // timers, transports).
        }

        let terminal = if node.info.is_canceled() {
            TaskState::Canceled
        } else {
            TaskState::Finished
        };
        self.set_state(id, terminal)?;

        let node = self.nodes.get_mut(&id).expect("finishing retained node");
        node.phase = NodePhase::Done;
        tracing::debug!(
            task = %node.name,
            state = ?node.state,
            error = node.info.error_text().as_deref().unwrap_or(""),
            "task terminal"
        );

        if let Some(parent) = node.parent {
            self.callbacks.push_back((parent, id));
        }
        Ok(())
    }

    fn attach(&mut self, parent_id: TaskId, id: TaskId, spec: TaskSpec) {
        let node = TaskNode::new(id, Some(parent_id), spec);
        let parent = self.nodes.get_mut(&parent_id).expect("attaching to live parent");
        parent.children.push(id);
        parent.live_children += 1;

        // Children of an already failed or canceled parent start canceled.
        if parent.info.has_error()
            || (parent.info.is_canceled() && parent.flags.cancel_on_subtask_cancel)
        {
            node.info.cancel();
        }

        tracing::debug!(parent = parent_id, task = %node.name, id, "subtask attached");
        self.nodes.insert(id, node);
    }

    fn set_state(&mut self, id: TaskId, to: TaskState) -> Result<(), SchedulerError> {
        let node = self.nodes.get_mut(&id).expect("state change on retained node");
        StateTransition::validate(node.state, to)?;
        if node.state != to {
            tracing::trace!(task = %node.name, from = ?node.state, to = ?to, "state");
            node.state = to;
        }
        Ok(())
    }

    fn next_report_deadline(&self) -> Option<Instant> {
        self.nodes
            .values()
            .filter(|n| n.phase == NodePhase::ReportReady)
            .filter_map(|n| n.report_after)
            .min()
    }

    fn tree_error_text(&self, id: TaskId) -> Option<String> {
        let node = self.nodes.get(&id)?;
        if let Some(own) = node.info.error_text() {
            return Some(own);
        }
        for &cid in &node.children {
            if let Some(text) = self.tree_error_text(cid) {
                if node.flags.minimize_subtask_error_text {
                    return Some(text);
                }
                let child_name = self
                    .nodes
                    .get(&cid)
                    .map(|n| n.name.clone())
                    .unwrap_or_default();
                return Some(format!("subtask '{child_name}' failed: {text}"));
            }
        }
        None
    }

    fn collect_subtree(&self, id: TaskId, out: &mut Vec<TaskId>) {
        if let Some(node) = self.nodes.get(&id) {
            for &cid in &node.children {
                out.push(cid);
                self.collect_subtree(cid, out);
            }
        }
    }
}
