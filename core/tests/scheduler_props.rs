mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{Leaf, PollUntilCanceled};
use seqflow_core::error::TaskError;
use seqflow_core::task::state::StateInfo;
use seqflow_core::task::{
    FinishedSubtask, PrepareContext, ReportResult, TaskContext, TaskFlags, TaskHandler, TaskId,
    TaskSpec, TaskState,
};
use seqflow_core::TaskScheduler;

/// Coordinator that attaches `initial` leaves up front and, when the last of
/// them completes, spawns `extra` more. Every callback is counted per
/// subtask id.
struct DynCoordinator {
    initial: usize,
    extra: usize,
    completed: usize,
    spawned_extra: bool,
    calls: Arc<Mutex<HashMap<TaskId, usize>>>,
}

#[async_trait]
impl TaskHandler for DynCoordinator {
    async fn prepare(&mut self, ctx: &mut PrepareContext<'_>) -> Result<(), TaskError> {
        for i in 0..self.initial {
            ctx.add_subtask(Leaf::ok().spec(&format!("leaf-{i}"), &format!("leaf-{i}")));
        }
        Ok(())
    }

    fn on_subtask_finished(
        &mut self,
        finished: &mut FinishedSubtask,
        state: &StateInfo,
    ) -> Result<Vec<TaskSpec>, TaskError> {
        if state.is_canceled() || state.has_error() {
            return Ok(Vec::new());
        }

        *self
            .calls
            .lock()
            .unwrap()
            .entry(finished.id)
            .or_insert(0) += 1;
        self.completed += 1;

        if self.completed == self.initial && !self.spawned_extra {
            self.spawned_extra = true;
            let specs = (0..self.extra)
                .map(|i| Leaf::ok().spec(&format!("extra-{i}"), &format!("extra-{i}")))
                .collect();
            return Ok(specs);
        }
        Ok(Vec::new())
    }
}

#[tokio::test(start_paused = true)]
async fn on_subtask_finished_fires_exactly_once_per_subtask() {
    let calls = Arc::new(Mutex::new(HashMap::new()));
    let coordinator = DynCoordinator {
        initial: 4,
        extra: 3,
        completed: 0,
        spawned_extra: false,
        calls: calls.clone(),
    };

    let mut scheduler = TaskScheduler::default();
    let finished = scheduler
        .run_task(TaskSpec::new("dyn coordinator", coordinator).with_flags(TaskFlags::coordinator()))
        .await
        .unwrap();

    assert_eq!(finished.state, TaskState::Finished);
    assert!(finished.ok());

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 4 + 3, "every subtask delivered a callback");
    assert!(
        calls.values().all(|&n| n == 1),
        "no callback fired twice: {calls:?}"
    );
}

/// Parent carrying `cancel_on_subtask_cancel`; its only child cancels
/// itself. The parent must observe its own cancellation no later than its
/// `report()`.
struct CancelObserver {
    canceled_at_report: Arc<Mutex<Option<bool>>>,
}

#[async_trait]
impl TaskHandler for CancelObserver {
    async fn prepare(&mut self, ctx: &mut PrepareContext<'_>) -> Result<(), TaskError> {
        ctx.add_subtask(Leaf::canceling().spec("self-canceling child", "child"));
        Ok(())
    }

    async fn report(&mut self, ctx: TaskContext) -> Result<ReportResult, TaskError> {
        *self.canceled_at_report.lock().unwrap() = Some(ctx.is_canceled());
        Ok(ReportResult::Finished)
    }
}

#[tokio::test(start_paused = true)]
async fn subtask_cancel_propagates_up_before_parent_report() {
    let observed = Arc::new(Mutex::new(None));
    let parent = CancelObserver {
        canceled_at_report: observed.clone(),
    };

    let mut scheduler = TaskScheduler::default();
    let finished = scheduler
        .run_task(
            TaskSpec::new("cancel observer", parent)
                .with_flags(TaskFlags::coordinator().with_cancel_on_subtask_cancel()),
        )
        .await
        .unwrap();

    assert_eq!(finished.state, TaskState::Canceled);
    assert!(finished.canceled);
    assert_eq!(*observed.lock().unwrap(), Some(true));
    assert!(finished.error.is_none(), "cancellation is not an error");
}

#[tokio::test(start_paused = true)]
async fn canceling_parent_propagates_down_to_live_children() {
    struct Parent;

    #[async_trait]
    impl TaskHandler for Parent {
        async fn prepare(&mut self, ctx: &mut PrepareContext<'_>) -> Result<(), TaskError> {
            ctx.add_subtask(TaskSpec::new("poller-a", PollUntilCanceled).with_key("a"));
            ctx.add_subtask(TaskSpec::new("poller-b", PollUntilCanceled).with_key("b"));
            Ok(())
        }
    }

    let mut scheduler = TaskScheduler::default();
    let root = scheduler.register(
        TaskSpec::new("canceling parent", Parent)
            .with_flags(TaskFlags::coordinator().with_cancel_on_subtask_cancel()),
    );

    let info = scheduler.info_handle(root).unwrap();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        info.cancel();
    });

    scheduler.drive().await.unwrap();
    let finished = scheduler.take_finished(root).unwrap();
    assert_eq!(finished.state, TaskState::Canceled);
}

/// Failing `prepare`: `run()` must never execute, already-attached subtasks
/// still get their callbacks, and `report()` always runs.
struct FailingPrepare {
    run_called: Arc<AtomicBool>,
    report_called: Arc<AtomicBool>,
    callbacks: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskHandler for FailingPrepare {
    async fn prepare(&mut self, ctx: &mut PrepareContext<'_>) -> Result<(), TaskError> {
        ctx.add_subtask(TaskSpec::new("orphaned child", PollUntilCanceled).with_key("child"));
        Err(TaskError::failed("prepare exploded"))
    }

    async fn run(&mut self, _ctx: TaskContext) -> Result<(), TaskError> {
        self.run_called.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn on_subtask_finished(
        &mut self,
        _finished: &mut FinishedSubtask,
        _state: &StateInfo,
    ) -> Result<Vec<TaskSpec>, TaskError> {
        self.callbacks.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    }

    async fn report(&mut self, _ctx: TaskContext) -> Result<ReportResult, TaskError> {
        self.report_called.store(true, Ordering::SeqCst);
        Ok(ReportResult::Finished)
    }
}

#[tokio::test(start_paused = true)]
async fn prepare_error_skips_run_but_reports() {
    let run_called = Arc::new(AtomicBool::new(false));
    let report_called = Arc::new(AtomicBool::new(false));
    let callbacks = Arc::new(AtomicUsize::new(0));

    let mut scheduler = TaskScheduler::default();
    let finished = scheduler
        .run_task(TaskSpec::new(
            "failing prepare",
            FailingPrepare {
                run_called: run_called.clone(),
                report_called: report_called.clone(),
                callbacks: callbacks.clone(),
            },
        ))
        .await
        .unwrap();

    assert_eq!(finished.error.as_deref(), Some("prepare exploded"));
    assert!(!run_called.load(Ordering::SeqCst), "run must not execute");
    assert!(report_called.load(Ordering::SeqCst), "report always runs");
    assert_eq!(callbacks.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn report_polling_is_reinvoked_until_finished() {
    struct Poller {
        polls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TaskHandler for Poller {
        async fn report(&mut self, _ctx: TaskContext) -> Result<ReportResult, TaskError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Ok(ReportResult::CallMeAgain)
            } else {
                Ok(ReportResult::Finished)
            }
        }
    }

    let polls = Arc::new(AtomicUsize::new(0));
    let mut scheduler = TaskScheduler::default();
    let finished = scheduler
        .run_task(
            TaskSpec::new("poller", Poller { polls: polls.clone() })
                .with_flags(TaskFlags::coordinator()),
        )
        .await
        .unwrap();

    assert_eq!(finished.state, TaskState::Finished);
    assert_eq!(polls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn callbacks_arrive_in_completion_order() {
    struct OrderParent {
        order: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl TaskHandler for OrderParent {
        async fn prepare(&mut self, ctx: &mut PrepareContext<'_>) -> Result<(), TaskError> {
            let mut slow = Leaf::ok();
            slow.delay_ms = 50;
            ctx.add_subtask(slow.spec("slow", "slow"));
            let mut fast = Leaf::ok();
            fast.delay_ms = 10;
            ctx.add_subtask(fast.spec("fast", "fast"));
            Ok(())
        }

        fn on_subtask_finished(
            &mut self,
            finished: &mut FinishedSubtask,
            _state: &StateInfo,
        ) -> Result<Vec<TaskSpec>, TaskError> {
            self.order
                .lock()
                .unwrap()
                .push(finished.key.clone().unwrap_or_default());
            Ok(Vec::new())
        }
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut scheduler = TaskScheduler::default();
    scheduler
        .run_task(
            TaskSpec::new("order parent", OrderParent { order: order.clone() })
                .with_flags(TaskFlags::coordinator()),
        )
        .await
        .unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["fast", "slow"]);
}

#[tokio::test(start_paused = true)]
async fn subtask_error_does_not_fail_parent_unless_adopted() {
    struct TolerantParent;

    #[async_trait]
    impl TaskHandler for TolerantParent {
        async fn prepare(&mut self, ctx: &mut PrepareContext<'_>) -> Result<(), TaskError> {
            ctx.add_subtask(Leaf::failing("boom").spec("flaky", "flaky"));
            ctx.add_subtask(Leaf::ok().spec("steady", "steady"));
            Ok(())
        }
    }

    let mut scheduler = TaskScheduler::default();
    let finished = scheduler
        .run_task(TaskSpec::new("tolerant parent", TolerantParent).with_flags(TaskFlags::coordinator()))
        .await
        .unwrap();

    assert_eq!(finished.state, TaskState::Finished);
    assert!(finished.error.is_none(), "error is local to the subtask");
    assert_eq!(
        finished.tree_error.as_deref(),
        Some("subtask 'flaky' failed: boom")
    );
}

#[tokio::test(start_paused = true)]
async fn minimized_tree_error_uses_subtask_text_verbatim() {
    struct QuietParent;

    #[async_trait]
    impl TaskHandler for QuietParent {
        async fn prepare(&mut self, ctx: &mut PrepareContext<'_>) -> Result<(), TaskError> {
            ctx.add_subtask(Leaf::failing("boom").spec("flaky", "flaky"));
            Ok(())
        }
    }

    let mut scheduler = TaskScheduler::default();
    let finished = scheduler
        .run_task(
            TaskSpec::new("quiet parent", QuietParent)
                .with_flags(TaskFlags::coordinator().with_minimize_subtask_error_text()),
        )
        .await
        .unwrap();

    assert_eq!(finished.tree_error.as_deref(), Some("boom"));
}

#[tokio::test(start_paused = true)]
async fn cancel_before_driving_skips_prepare_but_reports() {
    struct PrepareProbe {
        prepared: Arc<AtomicBool>,
        reported: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TaskHandler for PrepareProbe {
        async fn prepare(&mut self, _ctx: &mut PrepareContext<'_>) -> Result<(), TaskError> {
            self.prepared.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn report(&mut self, _ctx: TaskContext) -> Result<ReportResult, TaskError> {
            self.reported.store(true, Ordering::SeqCst);
            Ok(ReportResult::Finished)
        }
    }

    let prepared = Arc::new(AtomicBool::new(false));
    let reported = Arc::new(AtomicBool::new(false));

    let mut scheduler = TaskScheduler::default();
    let root = scheduler.register(TaskSpec::new(
        "preempted",
        PrepareProbe {
            prepared: prepared.clone(),
            reported: reported.clone(),
        },
    ));
    assert_eq!(scheduler.state_of(root), Some(TaskState::Created));

    scheduler.cancel(root);
    scheduler.drive().await.unwrap();
    assert_eq!(scheduler.state_of(root), Some(TaskState::Canceled));

    let finished = scheduler.take_finished(root).unwrap();
    assert!(finished.canceled);
    assert!(!prepared.load(Ordering::SeqCst), "prepare skipped when canceled early");
    assert!(reported.load(Ordering::SeqCst), "report still runs for resource release");
}

#[tokio::test(start_paused = true)]
async fn subtask_output_reaches_the_parent() {
    struct Collector {
        seen: Arc<Mutex<Option<String>>>,
    }

    #[async_trait]
    impl TaskHandler for Collector {
        async fn prepare(&mut self, ctx: &mut PrepareContext<'_>) -> Result<(), TaskError> {
            let mut leaf = Leaf::ok();
            leaf.output = Some("payload".to_string());
            ctx.add_subtask(leaf.spec("producer", "producer"));
            Ok(())
        }

        fn on_subtask_finished(
            &mut self,
            finished: &mut FinishedSubtask,
            _state: &StateInfo,
        ) -> Result<Vec<TaskSpec>, TaskError> {
            if let Some(out) = finished.take_output::<String>() {
                *self.seen.lock().unwrap() = Some(*out);
            }
            Ok(Vec::new())
        }
    }

    let seen = Arc::new(Mutex::new(None));
    let mut scheduler = TaskScheduler::default();
    scheduler
        .run_task(
            TaskSpec::new("collector", Collector { seen: seen.clone() })
                .with_flags(TaskFlags::coordinator()),
        )
        .await
        .unwrap();

    assert_eq!(seen.lock().unwrap().as_deref(), Some("payload"));
}
