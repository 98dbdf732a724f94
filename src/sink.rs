//! The output sink capability consumed by the Stream Task Executor.
//!
//! `spec.md` §4.3.5 `DumpResult`: wraps accumulated result blocks as a
//! `StreamDataBlock` and hands them to whatever sits downstream of a task
//! (a sibling task's input queue, a sink connector, the TSDB writer). This
//! crate never implements delivery itself, so the boundary is a capability
//! trait, the same way `QueryOperator` and `Pager` are.

use crate::error::Result;
use crate::types::StreamDataBlock;

pub trait OutputSink {
    /// Hand a batch downstream. Returns `Err(ErrorCode::Full)` on
    /// `QUEUE_OUT_OF_MEMORY` (`spec.md` §4.3.5); the block is consumed
    /// either way, so a `Full` error also destroys it rather than leaking
    /// it back to the caller.
    fn dispatch(&mut self, block: StreamDataBlock) -> Result<()>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;

    /// Records dispatched blocks, or rejects them once `full` is set, to
    /// exercise backpressure handling in the stream executor's tests.
    #[derive(Default)]
    pub struct MockSink {
        pub dispatched: VecDeque<StreamDataBlock>,
        pub full: bool,
    }

    impl OutputSink for MockSink {
        fn dispatch(&mut self, block: StreamDataBlock) -> Result<()> {
            if self.full {
                return Err(crate::error::Error::new(crate::error::ErrorCode::Full));
            }
            self.dispatched.push_back(block);
            Ok(())
        }
    }
}
