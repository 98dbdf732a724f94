//! The Query Operator capability consumed by the TMQ Scan Engine and the
//! Stream Task Executor.
//!
//! `spec.md` §6 treats the embedded query planner/optimizer as external:
//! both components only ever reach it through this handful of calls.
//! Modeled as a capability trait (`spec.md` §9 "operator handle as opaque
//! capability") rather than an enum of variants, since neither component
//! needs to know what kind of plan is underneath — only that it can be
//! prepared, stepped, and introspected for offset/meta/name/schema.

use crate::error::Result;
use crate::types::{DataBlock, MetaRsp, Offset, SchemaWrapper, StreamInputKind, SubType, Uid};

pub trait QueryOperator {
    /// Position the operator to resume scanning at `offset`. Returns an
    /// error if the offset can't be honored (e.g. a WAL version that has
    /// already been vacuumed) — `spec.md` §4.2.1 step 1 treats this as
    /// recoverable via the `Log` fallback.
    fn prepare_scan(&mut self, offset: &Offset, sub_type: SubType) -> Result<()>;

    /// Pull the next result block, or `Ok(None)` when the operator is
    /// drained for the current scan.
    fn exec_task(&mut self) -> Result<Option<DataBlock>>;

    /// The offset the operator is positioned at after the last `exec_task`
    /// call. `Offset::None` is a valid return value here (it becomes an
    /// error once it would escape the response boundary).
    fn extract_offset(&self) -> Offset;

    /// Consume the pending meta/schema event, if any.
    fn extract_meta_msg(&mut self) -> Option<MetaRsp>;

    /// The uid the operator still needs to scan before the current
    /// snapshot segment is exhausted; `0` means fully drained.
    fn extract_prepare_uid(&self) -> Uid;

    fn extract_tbname_from_task(&self) -> Option<String>;

    fn extract_schema_from_task(&self) -> Option<SchemaWrapper>;

    /// Feed one batch of input to the operator ahead of the next
    /// `exec_task` call (`spec.md` §4.3.4).
    fn set_multi_stream_input(&mut self, blocks: &[DataBlock], kind: StreamInputKind);

    /// Re-open the scan operator without losing its position; used when a
    /// history-replay scan has to pause and resume (`spec.md` §4.3.6).
    fn set_op_open(&mut self);

    fn recover_scan_finished(&self) -> bool;

    /// Drop whatever `QRY_IN_EXEC` state is pinning the operator so the
    /// next `exec_task` can make progress (`spec.md` §4.3.5 step 2).
    fn reset_task_info(&mut self);

    fn release_state(&mut self) -> Result<()>;

    fn reload_state(&mut self) -> Result<()>;

    fn reset_stream_info_time_window(&mut self);
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// A scriptable operator for exercising the TMQ and stream executor
    /// state machines without a real query engine underneath.
    #[derive(Default)]
    pub struct MockOperator {
        pub pending: VecDeque<DataBlock>,
        pub offset_after_drain: Offset,
        pub prepare_uid: Uid,
        pub pending_meta: Option<MetaRsp>,
        pub tbname: Option<String>,
        pub schema: Option<SchemaWrapper>,
        pub recover_finished: bool,
        pub fail_prepare: bool,
        pub fail_prepare_once: bool,
        pub busy_once: bool,
        pub reset_count: u32,
    }

    impl QueryOperator for MockOperator {
        fn prepare_scan(&mut self, _offset: &Offset, _sub_type: SubType) -> Result<()> {
            if self.fail_prepare {
                return Err(crate::error::Error::new(crate::error::ErrorCode::Error));
            }
            if self.fail_prepare_once {
                self.fail_prepare_once = false;
                return Err(crate::error::Error::new(crate::error::ErrorCode::Error));
            }
            Ok(())
        }

        fn exec_task(&mut self) -> Result<Option<DataBlock>> {
            if self.busy_once {
                self.busy_once = false;
                return Err(crate::error::Error::new(crate::error::ErrorCode::Busy));
            }
            Ok(self.pending.pop_front())
        }

        fn extract_offset(&self) -> Offset {
            self.offset_after_drain
        }

        fn extract_meta_msg(&mut self) -> Option<MetaRsp> {
            self.pending_meta.take()
        }

        fn extract_prepare_uid(&self) -> Uid {
            self.prepare_uid
        }

        fn extract_tbname_from_task(&self) -> Option<String> {
            self.tbname.clone()
        }

        fn extract_schema_from_task(&self) -> Option<SchemaWrapper> {
            self.schema.clone()
        }

        fn set_multi_stream_input(&mut self, _blocks: &[DataBlock], _kind: StreamInputKind) {}

        fn set_op_open(&mut self) {}

        fn recover_scan_finished(&self) -> bool {
            self.recover_finished
        }

        fn reset_task_info(&mut self) {
            self.reset_count += 1;
        }

        fn release_state(&mut self) -> Result<()> {
            Ok(())
        }

        fn reload_state(&mut self) -> Result<()> {
            Ok(())
        }

        fn reset_stream_info_time_window(&mut self) {}
    }
}
