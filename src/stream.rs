//! Stream Task Executor (`spec.md` §4.3, component C3).
//!
//! Drives one stream task: pulls from its input queue, feeds the operator,
//! batches and dumps results, and honors the pause/stop/checkpoint
//! lifecycle. Grounded on
//! `examples/original_source/source/libs/stream/src/streamExec.c`
//! (`streamTryExec`, `streamExecForAll`, `streamExecImpl`,
//! `streamTransferStateToStreamTask`).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::StreamExecConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::log::{log_debug, log_error};
use crate::operator::QueryOperator;
use crate::sink::OutputSink;
use crate::types::{BlockKind, DataBlock, StreamDataBlock, StreamInputKind};

/// `spec.md` §3.2 `TaskStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Normal,
    Halt,
    Pause,
    Stop,
    Dropping,
    CheckpointInProgress,
    CheckpointReady,
}

/// `spec.md` §3.2 `SchedStatus`, driven with compare-and-swap so at most
/// one thread ever runs a task's exec loop at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SchedStatus {
    Inactive = 0,
    Waiting = 1,
    Active = 2,
    Failed = 3,
}

impl SchedStatus {
    fn from_i32(v: i32) -> Self {
        match v {
            0 => SchedStatus::Inactive,
            1 => SchedStatus::Waiting,
            2 => SchedStatus::Active,
            _ => SchedStatus::Failed,
        }
    }
}

/// `spec.md` §3.2 `Task.level`: `Source` tasks read the WAL/recovery scan,
/// `Agg` tasks sit between two stream tasks, `Sink` tasks forward blocks
/// to the output sink without running a query operator (`spec.md` §4.3.3
/// step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLevel {
    Source,
    Agg,
    Sink,
}

/// `spec.md` §3.2 `Task.output_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStatus {
    Normal,
    Blocked,
}

/// `spec.md` §3.2 `Task.chk_info`. `version` is the submit watermark this
/// task has folded into a completed checkpoint; `current_version` is the
/// watermark the operator has actually consumed so far. Invariant 3
/// (`spec.md` §8): `version` never decreases.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChkInfo {
    pub version: i64,
    pub current_version: i64,
    pub checkpointing_id: u64,
}

/// One input item pulled off a task's queue (`spec.md` §3.2 `QueueItem`).
pub enum QueueItem {
    Blocks {
        blocks: Vec<DataBlock>,
        kind: StreamInputKind,
        ver: i64,
    },
    Checkpoint {
        checkpoint_id: u64,
    },
}

/// Vnode-wide checkpoint barrier (`spec.md` §4.3.3): every task decrements
/// this counter when it reaches `CheckpointReady`; the vnode commits once
/// it hits zero. Shared across all tasks on the same vnode.
#[derive(Default)]
pub struct CheckpointBarrier {
    not_ready: AtomicI32,
}

impl CheckpointBarrier {
    pub fn new() -> Self {
        Self {
            not_ready: AtomicI32::new(0),
        }
    }

    pub fn arm(&self, task_count: i32) {
        self.not_ready.store(task_count, Ordering::SeqCst);
    }

    /// Returns `true` if this was the task that brought the counter to zero
    /// (the vnode should commit now).
    pub fn mark_ready(&self) -> bool {
        self.not_ready.fetch_sub(1, Ordering::SeqCst) == 1
    }

    pub fn outstanding(&self) -> i32 {
        self.not_ready.load(Ordering::SeqCst)
    }
}

/// Vnode-wide checkpoint persistence and upstream acknowledgement
/// (`spec.md` §4.3.2), invoked only by `TryExec` once a task reaches
/// `CheckpointReady`. Modeled as a capability trait like `QueryOperator`
/// and `Pager`, since this crate owns neither the meta store behind
/// `BackendDoCheckpoint`/`SaveTasks` nor the upstream RPC channel that
/// `CheckpointSourceRsp`/`CheckpointRsp` go out on.
pub trait CheckpointCommitter {
    /// `BackendDoCheckpoint(meta, checkpointingId)` then `SaveTasks`;
    /// called exactly once per checkpoint, by whichever task's barrier
    /// decrement brought `chkptNotReadyTasks` to zero.
    fn commit(&mut self, checkpointing_id: u64) -> Result<()>;

    /// `CheckpointSourceRsp` for `Source` tasks, `CheckpointRsp`
    /// otherwise; called by every task that reaches `CheckpointReady`,
    /// independent of who performed the commit.
    fn respond(&mut self, task_id: i32, level: TaskLevel, checkpointing_id: u64);
}

/// A runnable stream task (`spec.md` §3.2 `Task`).
pub struct Task<Op, S> {
    pub id: i32,
    pub level: TaskLevel,
    pub status: Mutex<TaskStatus>,
    sched_status: AtomicU32,
    pub input: Mutex<VecDeque<QueueItem>>,
    pub op: Mutex<Op>,
    pub sink: Mutex<S>,
    pub is_idle: AtomicBool,
    pub output_status: Mutex<OutputStatus>,
    pub chk_info: Mutex<ChkInfo>,
    /// A fill-history source replays history into `history_task_id` and
    /// then hands off control (`spec.md` §4.3.7); `transfer_state` is set
    /// once that replay has finished and a handoff is pending.
    pub is_fill_history: bool,
    pub transfer_state: AtomicBool,
    pub history_task_id: Option<i32>,
    pub checkpoint_barrier: Arc<CheckpointBarrier>,
    last_submitted_ver: Mutex<i64>,
}

impl<Op: QueryOperator, S: OutputSink> Task<Op, S> {
    pub fn new(
        id: i32,
        level: TaskLevel,
        op: Op,
        sink: S,
        checkpoint_barrier: Arc<CheckpointBarrier>,
    ) -> Self {
        Self {
            id,
            level,
            status: Mutex::new(TaskStatus::Normal),
            sched_status: AtomicU32::new(SchedStatus::Inactive as u32),
            input: Mutex::new(VecDeque::new()),
            op: Mutex::new(op),
            sink: Mutex::new(sink),
            is_idle: AtomicBool::new(true),
            output_status: Mutex::new(OutputStatus::Normal),
            chk_info: Mutex::new(ChkInfo::default()),
            is_fill_history: false,
            transfer_state: AtomicBool::new(false),
            history_task_id: None,
            checkpoint_barrier,
            last_submitted_ver: Mutex::new(-1),
        }
    }

    /// Marks this task as a fill-history source whose eventual drained
    /// input queue triggers a handoff to `sibling_id` (`spec.md` §4.3.7).
    pub fn with_fill_history(mut self, sibling_id: i32) -> Self {
        self.is_fill_history = true;
        self.transfer_state.store(true, Ordering::SeqCst);
        self.history_task_id = Some(sibling_id);
        self
    }

    fn sched_status(&self) -> SchedStatus {
        SchedStatus::from_i32(self.sched_status.load(Ordering::SeqCst) as i32)
    }

    fn cas_sched_status(&self, from: SchedStatus, to: SchedStatus) -> bool {
        self.sched_status
            .compare_exchange(
                from as u32,
                to as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    fn set_sched_status(&self, to: SchedStatus) {
        self.sched_status.store(to as u32, Ordering::SeqCst);
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.lock().unwrap()
    }

    pub fn set_status(&self, status: TaskStatus) {
        *self.status.lock().unwrap() = status;
    }

    /// `isIdle()` (`spec.md` §4.3.7): input drained, not scheduled, and
    /// not backpressured downstream.
    pub fn is_idle(&self) -> bool {
        self.is_idle.load(Ordering::SeqCst)
            && self.input.lock().unwrap().is_empty()
            && *self.output_status.lock().unwrap() == OutputStatus::Normal
            && self.sched_status() == SchedStatus::Inactive
    }

    /// `SetStreamInputBlock` (`spec.md` §4.3.4): reject submit-log input
    /// that doesn't advance the task's watermark.
    pub fn set_stream_input_block(
        &self,
        blocks: Vec<DataBlock>,
        kind: StreamInputKind,
        ver: i64,
    ) -> Result<()> {
        if matches!(kind, StreamInputKind::DataSubmit | StreamInputKind::MergedSubmit) {
            let mut last = self.last_submitted_ver.lock().unwrap();
            if ver <= *last {
                return Err(Error::with_message(
                    ErrorCode::Misuse,
                    "submit version did not advance task watermark",
                ));
            }
            *last = ver;
            self.chk_info.lock().unwrap().current_version = ver;
        }
        self.input
            .lock()
            .unwrap()
            .push_back(QueueItem::Blocks { blocks, kind, ver });
        Ok(())
    }

    pub fn enqueue_checkpoint(&self, checkpoint_id: u64) {
        self.input
            .lock()
            .unwrap()
            .push_back(QueueItem::Checkpoint { checkpoint_id });
    }
}

/// Result of one `ExecImpl` pass over a single queue item
/// (`spec.md` §4.3.5).
#[derive(Debug)]
pub struct DumpResult {
    pub dumped_blocks: Vec<DataBlock>,
    pub retrieve_blocks: Vec<DataBlock>,
    pub checkpoint_committed: Option<u64>,
}

impl DumpResult {
    fn empty() -> Self {
        Self {
            dumped_blocks: Vec::new(),
            retrieve_blocks: Vec::new(),
            checkpoint_committed: None,
        }
    }
}

/// `DumpResult` (`spec.md` §4.3.5): wrap whatever's accumulated as a
/// `StreamDataBlock` and hand it to the output sink. On `Full` the block
/// is dropped with the error (it was moved into `dispatch`, so ownership
/// already left the caller) so backpressure doesn't leak memory.
fn dump_result<S: OutputSink>(
    sink: &mut S,
    result: &mut DumpResult,
    kind: StreamInputKind,
    ver: i64,
) -> Result<()> {
    if result.dumped_blocks.is_empty() {
        return Ok(());
    }
    let blocks = std::mem::take(&mut result.dumped_blocks);
    let block = StreamDataBlock {
        kind,
        source_ver: ver,
        blocks,
    };
    match sink.dispatch(block) {
        Ok(()) => Ok(()),
        Err(e) if e.code() == ErrorCode::Full => {
            log_error!("output sink full, dropping stream data block");
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// `ExecImpl` (`spec.md` §4.3.5): drains the operator for one input item,
/// retrying transient `Busy` errors up to `exec_retry_limit` times before
/// giving up (the bounded redesign of the original's unbounded retry loop;
/// see `SPEC_FULL.md`), and dumping full batches to the output sink as it
/// goes.
fn exec_impl<Op: QueryOperator, S: OutputSink>(
    op: &mut Op,
    item: QueueItem,
    config: &StreamExecConfig,
    sink: &mut S,
) -> Result<DumpResult> {
    match item {
        QueueItem::Checkpoint { checkpoint_id } => {
            op.set_multi_stream_input(&[], StreamInputKind::Checkpoint);
            Ok(DumpResult {
                dumped_blocks: Vec::new(),
                retrieve_blocks: Vec::new(),
                checkpoint_committed: Some(checkpoint_id),
            })
        }
        QueueItem::Blocks { blocks, kind, ver } => {
            op.set_multi_stream_input(&blocks, kind);

            let mut result = DumpResult::empty();
            let mut retries = 0u32;
            loop {
                match op.exec_task() {
                    Ok(Some(block)) => match block.kind {
                        BlockKind::StreamRetrieve => result.retrieve_blocks.push(block),
                        BlockKind::StreamPullOver => {
                            result.retrieve_blocks.push(block);
                            break;
                        }
                        BlockKind::Normal => {
                            result.dumped_blocks.push(block);
                            if result.dumped_blocks.len() >= config.dump_threshold {
                                dump_result(sink, &mut result, kind, ver)?;
                            }
                        }
                    },
                    Ok(None) => break,
                    Err(e) if e.code() == ErrorCode::Busy => {
                        retries += 1;
                        if retries > config.exec_retry_limit {
                            log_error!(
                                "operator stayed busy past retry limit ({})",
                                config.exec_retry_limit
                            );
                            return Err(e);
                        }
                        op.reset_task_info();
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            dump_result(sink, &mut result, kind, ver)?;
            Ok(result)
        }
    }
}

/// `streamTryExec` (`spec.md` §4.3.2): the scheduler entry point. Returns
/// `Ok(false)` without doing work if another execution is already active.
pub fn try_exec<Op: QueryOperator, S: OutputSink, Ck: CheckpointCommitter>(
    task: &Task<Op, S>,
    config: &StreamExecConfig,
    committer: &mut Ck,
) -> Result<bool> {
    loop {
        match task.sched_status() {
            SchedStatus::Inactive => {
                if task.cas_sched_status(SchedStatus::Inactive, SchedStatus::Active) {
                    break;
                }
            }
            SchedStatus::Waiting => {
                if task.cas_sched_status(SchedStatus::Waiting, SchedStatus::Active) {
                    break;
                }
            }
            SchedStatus::Active => return Ok(false),
            SchedStatus::Failed => {
                return Err(Error::with_message(
                    ErrorCode::Error,
                    "task scheduling previously failed",
                ))
            }
        }
    }

    task.is_idle.store(false, Ordering::SeqCst);
    let outcome = exec_for_all(task, config);
    task.is_idle.store(true, Ordering::SeqCst);

    match outcome {
        Ok(_) => {
            task.set_sched_status(SchedStatus::Inactive);
            if task.status() == TaskStatus::CheckpointReady {
                let checkpointing_id = task.chk_info.lock().unwrap().checkpointing_id;
                if task.checkpoint_barrier.mark_ready() {
                    log_debug!("task {} completed the vnode checkpoint barrier", task.id);
                    committer.commit(checkpointing_id)?;
                }
                committer.respond(task.id, task.level, checkpointing_id);
            }
            Ok(true)
        }
        Err(e) => {
            task.set_sched_status(SchedStatus::Failed);
            Err(e)
        }
    }
}

/// `streamExecForAll` (`spec.md` §4.3.3): drains the input queue, honoring
/// pause/stop/drop status between items. A `Checkpoint` item is a total
/// barrier: once the task reaches `CheckpointReady` this returns
/// immediately, leaving anything still queued for the next `TryExec` pass
/// (`spec.md` §5 ordering invariant — nothing past a checkpoint runs until
/// the task clears `CK -> CK_READY`).
pub fn exec_for_all<Op: QueryOperator, S: OutputSink>(
    task: &Task<Op, S>,
    config: &StreamExecConfig,
) -> Result<Vec<DumpResult>> {
    let mut results = Vec::new();

    loop {
        match task.status() {
            TaskStatus::Stop | TaskStatus::Dropping => {
                log_debug!("task {} stopped mid-drain", task.id);
                break;
            }
            TaskStatus::Pause | TaskStatus::Halt => break,
            _ => {}
        }

        let item = task.input.lock().unwrap().pop_front();
        let Some(item) = item else { break };

        if task.level == TaskLevel::Sink {
            match item {
                QueueItem::Blocks { blocks, kind, ver } => {
                    let mut sink = task.sink.lock().unwrap();
                    let dispatched = sink.dispatch(StreamDataBlock {
                        kind,
                        source_ver: ver,
                        blocks,
                    });
                    drop(sink);
                    dispatched?;
                    continue;
                }
                QueueItem::Checkpoint { checkpoint_id } => {
                    task.set_status(TaskStatus::CheckpointInProgress);
                    task.chk_info.lock().unwrap().checkpointing_id = checkpoint_id;
                    task.set_status(TaskStatus::CheckpointReady);
                    return Ok(results);
                }
            }
        }

        let is_checkpoint = matches!(item, QueueItem::Checkpoint { .. });
        let checkpoint_id = match &item {
            QueueItem::Checkpoint { checkpoint_id } => Some(*checkpoint_id),
            QueueItem::Blocks { .. } => None,
        };
        if is_checkpoint {
            task.set_status(TaskStatus::CheckpointInProgress);
        }
        let starting_version = task.chk_info.lock().unwrap().version;

        let mut op_guard = task.op.lock().unwrap();
        let mut sink_guard = task.sink.lock().unwrap();
        let result = exec_impl(&mut *op_guard, item, config, &mut *sink_guard)?;
        drop(op_guard);
        drop(sink_guard);

        {
            let mut info = task.chk_info.lock().unwrap();
            info.version = info.current_version;
            if let Some(id) = checkpoint_id {
                info.checkpointing_id = id;
            }
            debug_assert!(starting_version <= info.version);
        }

        results.push(result);

        if is_checkpoint {
            task.set_status(TaskStatus::CheckpointReady);
            return Ok(results);
        }
    }

    Ok(results)
}

/// `streamScanExec` (`spec.md` §4.3.6): drive the source recovery scan
/// until the operator reports it finished, reopening it between calls.
pub fn scan_exec<Op: QueryOperator, S: OutputSink>(
    task: &Task<Op, S>,
    config: &StreamExecConfig,
) -> Result<Vec<DataBlock>> {
    let mut produced = Vec::new();
    let mut op = task.op.lock().unwrap();
    loop {
        if task.status() == TaskStatus::Pause || task.status() == TaskStatus::Stop {
            break;
        }
        match op.exec_task()? {
            Some(block) => {
                produced.push(block);
                if produced.len() >= config.dump_threshold {
                    break;
                }
            }
            None => {
                if op.recover_scan_finished() {
                    break;
                }
                op.set_op_open();
            }
        }
    }
    Ok(produced)
}

/// `streamTransferStateToStreamTask` (`spec.md` §4.3.7): a finished
/// fill-history source hands control to its live sibling.
///
/// Returns `Ok(false)` if the source isn't idle yet (step 3); the caller
/// is expected to poll at `idle_poll_interval_ms` and retry. The polling
/// loop itself is left to the caller, since this crate doesn't own a
/// clock or sleep primitive.
pub fn try_transfer_state<Op: QueryOperator, S: OutputSink>(
    source: &Task<Op, S>,
    destination: &Task<Op, S>,
) -> Result<bool> {
    // Step 1: acquire the sibling, asserting history-task linkage.
    if source.history_task_id != Some(destination.id) {
        return Err(Error::with_message(
            ErrorCode::Misuse,
            "destination is not this task's fill-history sibling",
        ));
    }

    // Step 2: a Source sibling must already be halted by its own
    // scheduling path; anything else is driven Normal -> Halt here.
    if destination.level == TaskLevel::Source {
        if destination.status() != TaskStatus::Halt {
            return Err(Error::with_message(
                ErrorCode::Misuse,
                "Source sibling must already be halted before state transfer",
            ));
        }
    } else {
        destination.set_status(TaskStatus::Halt);
    }

    // Step 3: wait for the source to go idle.
    if !source.is_idle() {
        return Ok(false);
    }

    // Step 4: expand the destination's scan window before replaying state
    // into it.
    destination.op.lock().unwrap().reset_stream_info_time_window();

    // Step 5: transfer operator state.
    source.op.lock().unwrap().release_state()?;
    destination.op.lock().unwrap().reload_state()?;

    // Step 6: hand the sibling back to Normal and trigger its scheduler.
    destination.set_status(TaskStatus::Normal);
    source.transfer_state.store(false, Ordering::SeqCst);
    destination.cas_sched_status(SchedStatus::Inactive, SchedStatus::Waiting);

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::mock::MockOperator;
    use crate::sink::mock::MockSink;

    #[derive(Default)]
    struct MockCommitter {
        commits: Vec<u64>,
        responses: Vec<(i32, TaskLevel, u64)>,
    }

    impl CheckpointCommitter for MockCommitter {
        fn commit(&mut self, checkpointing_id: u64) -> Result<()> {
            self.commits.push(checkpointing_id);
            Ok(())
        }

        fn respond(&mut self, task_id: i32, level: TaskLevel, checkpointing_id: u64) {
            self.responses.push((task_id, level, checkpointing_id));
        }
    }

    fn block(kind: BlockKind) -> DataBlock {
        DataBlock {
            rows: 1,
            encoded: vec![9],
            kind,
            child_id: 0,
            source_uid: 1,
        }
    }

    fn agg_task(id: i32, op: MockOperator, barrier: Arc<CheckpointBarrier>) -> Task<MockOperator, MockSink> {
        Task::new(id, TaskLevel::Agg, op, MockSink::default(), barrier)
    }

    #[test]
    fn try_exec_single_flight() {
        let op = MockOperator::default();
        let barrier = Arc::new(CheckpointBarrier::new());
        let task = agg_task(1, op, barrier);
        task.sched_status.store(SchedStatus::Active as u32, Ordering::SeqCst);
        let mut committer = MockCommitter::default();
        let ran = try_exec(&task, &StreamExecConfig::default(), &mut committer).unwrap();
        assert!(!ran);
    }

    #[test]
    fn exec_drains_normal_blocks() {
        let mut op = MockOperator::default();
        op.pending.push_back(block(BlockKind::Normal));
        op.pending.push_back(block(BlockKind::Normal));
        let barrier = Arc::new(CheckpointBarrier::new());
        let task = agg_task(1, op, barrier);
        task.set_stream_input_block(vec![block(BlockKind::Normal)], StreamInputKind::DataBlock, 1)
            .unwrap();
        let results = exec_for_all(&task, &StreamExecConfig::default()).unwrap();
        assert_eq!(results.len(), 1);
        // Blocks are dispatched to the output sink by ExecImpl's DumpResult,
        // not returned for the caller to forward itself.
        assert!(results[0].dumped_blocks.is_empty());
        let sink = task.sink.lock().unwrap();
        assert_eq!(sink.dispatched.len(), 1);
        assert_eq!(sink.dispatched[0].blocks.len(), 2);
    }

    #[test]
    fn rejects_non_monotonic_submit_version() {
        let op = MockOperator::default();
        let barrier = Arc::new(CheckpointBarrier::new());
        let task = agg_task(1, op, barrier);
        task.set_stream_input_block(vec![], StreamInputKind::DataSubmit, 5)
            .unwrap();
        let err = task
            .set_stream_input_block(vec![], StreamInputKind::DataSubmit, 5)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Misuse);
    }

    #[test]
    fn checkpoint_barrier_counts_down() {
        let barrier = CheckpointBarrier::new();
        barrier.arm(2);
        assert!(!barrier.mark_ready());
        assert!(barrier.mark_ready());
    }

    #[test]
    fn checkpoint_barrier_stops_the_drain() {
        let op = MockOperator::default();
        let barrier = Arc::new(CheckpointBarrier::new());
        barrier.arm(1);
        let task = agg_task(1, op, barrier);
        task.enqueue_checkpoint(42);
        task.set_stream_input_block(vec![block(BlockKind::Normal)], StreamInputKind::DataBlock, 1)
            .unwrap();

        let results = exec_for_all(&task, &StreamExecConfig::default()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(task.status(), TaskStatus::CheckpointReady);
        assert_eq!(
            task.input.lock().unwrap().len(),
            1,
            "b2 must not be drained in the same call"
        );
    }

    #[test]
    fn try_exec_commits_once_barrier_hits_zero() {
        let op = MockOperator::default();
        let barrier = Arc::new(CheckpointBarrier::new());
        barrier.arm(1);
        let task = agg_task(7, op, barrier);
        task.enqueue_checkpoint(99);

        let mut committer = MockCommitter::default();
        try_exec(&task, &StreamExecConfig::default(), &mut committer).unwrap();

        assert_eq!(task.status(), TaskStatus::CheckpointReady);
        assert_eq!(committer.commits, vec![99]);
        assert_eq!(committer.responses, vec![(7, TaskLevel::Agg, 99)]);
    }

    #[test]
    fn sink_task_forwards_blocks_directly() {
        let op = MockOperator::default();
        let barrier = Arc::new(CheckpointBarrier::new());
        let task: Task<MockOperator, MockSink> =
            Task::new(1, TaskLevel::Sink, op, MockSink::default(), barrier);
        task.set_stream_input_block(vec![block(BlockKind::Normal)], StreamInputKind::DataBlock, 1)
            .unwrap();

        exec_for_all(&task, &StreamExecConfig::default()).unwrap();

        let sink = task.sink.lock().unwrap();
        assert_eq!(sink.dispatched.len(), 1);
        assert_eq!(sink.dispatched[0].blocks.len(), 1);
    }

    #[test]
    fn sink_full_propagates_backpressure() {
        let op = MockOperator::default();
        let barrier = Arc::new(CheckpointBarrier::new());
        let mut sink = MockSink::default();
        sink.full = true;
        let task: Task<MockOperator, MockSink> = Task::new(1, TaskLevel::Sink, op, sink, barrier);
        task.set_stream_input_block(vec![block(BlockKind::Normal)], StreamInputKind::DataBlock, 1)
            .unwrap();

        let err = exec_for_all(&task, &StreamExecConfig::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Full);
    }

    #[test]
    fn exec_impl_retries_busy_then_gives_up() {
        let mut op = MockOperator::default();
        op.busy_once = true;
        let config = StreamExecConfig {
            exec_retry_limit: 0,
            ..Default::default()
        };
        let item = QueueItem::Blocks {
            blocks: vec![],
            kind: StreamInputKind::DataBlock,
            ver: 0,
        };
        let mut sink = MockSink::default();
        let err = exec_impl(&mut op, item, &config, &mut sink).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Busy);
    }

    #[test]
    fn transfer_state_waits_for_idle() {
        let op_a = MockOperator::default();
        let op_b = MockOperator::default();
        let barrier = Arc::new(CheckpointBarrier::new());
        let source: Task<MockOperator, MockSink> =
            Task::new(1, TaskLevel::Source, op_a, MockSink::default(), barrier.clone())
                .with_fill_history(2);
        let destination: Task<MockOperator, MockSink> =
            Task::new(2, TaskLevel::Agg, op_b, MockSink::default(), barrier);
        source.is_idle.store(false, Ordering::SeqCst);
        assert!(!try_transfer_state(&source, &destination).unwrap());
        source.is_idle.store(true, Ordering::SeqCst);
        assert!(try_transfer_state(&source, &destination).unwrap());
        assert_eq!(destination.status(), TaskStatus::Normal);
        assert!(!source.transfer_state.load(Ordering::SeqCst));
    }

    #[test]
    fn transfer_state_rejects_unrelated_sibling() {
        let op_a = MockOperator::default();
        let op_b = MockOperator::default();
        let barrier = Arc::new(CheckpointBarrier::new());
        let source: Task<MockOperator, MockSink> =
            Task::new(1, TaskLevel::Source, op_a, MockSink::default(), barrier.clone());
        let destination: Task<MockOperator, MockSink> =
            Task::new(2, TaskLevel::Agg, op_b, MockSink::default(), barrier);
        let err = try_transfer_state(&source, &destination).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Misuse);
    }

    #[test]
    fn transfer_state_requires_source_sibling_halted() {
        let op_a = MockOperator::default();
        let op_b = MockOperator::default();
        let barrier = Arc::new(CheckpointBarrier::new());
        let source: Task<MockOperator, MockSink> =
            Task::new(1, TaskLevel::Source, op_a, MockSink::default(), barrier.clone())
                .with_fill_history(2);
        let destination: Task<MockOperator, MockSink> =
            Task::new(2, TaskLevel::Source, op_b, MockSink::default(), barrier);
        source.is_idle.store(true, Ordering::SeqCst);
        let err = try_transfer_state(&source, &destination).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Misuse);

        destination.set_status(TaskStatus::Halt);
        assert!(try_transfer_state(&source, &destination).unwrap());
    }
}
