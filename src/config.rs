//! Runtime configuration for the three components.
//!
//! Plain-data structs handed to a component at construction time, the way
//! the pager takes its page size and cache size as constructor arguments
//! rather than reading a global: callers own the knobs, this crate only
//! defines their defaults and the derived constants computed from them.

/// B-Tree Index Core configuration.
#[derive(Debug, Clone, Copy)]
pub struct BtreeConfig {
    /// Fixed page size in bytes, shared with the pager.
    pub page_size: u32,
    /// Target number of children per interior node when the key length is
    /// variable. `spec.md` §3.3: `TDB_DEFAULT_FANOUT`.
    pub fanout: u8,
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            fanout: 4,
        }
    }
}

/// TMQ Scan Engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct TmqScanConfig {
    /// Row cap per scan while serving snapshot data (`spec.md` §4.2).
    pub snapshot_row_cap: u32,
}

impl Default for TmqScanConfig {
    fn default() -> Self {
        Self {
            snapshot_row_cap: 4096,
        }
    }
}

/// Stream Task Executor configuration.
#[derive(Debug, Clone, Copy)]
pub struct StreamExecConfig {
    /// Result blocks accumulated before a batch is dumped downstream
    /// (`spec.md` §4.3.1: `MAX_STREAM_RESULT_DUMP_THRESHOLD`).
    pub dump_threshold: usize,
    /// Bound on consecutive operator-error retries within one `ExecImpl`
    /// call. `spec.md` §9 flags the original's unbounded retry as a risk;
    /// this is the redesigned, bounded version (see `SPEC_FULL.md`).
    pub exec_retry_limit: u32,
    /// Poll interval while waiting for a sibling task to go idle during
    /// state transfer (`spec.md` §4.3.7).
    pub idle_poll_interval_ms: u64,
}

impl Default for StreamExecConfig {
    fn default() -> Self {
        Self {
            dump_threshold: 100,
            exec_retry_limit: 16,
            idle_poll_interval_ms: 100,
        }
    }
}
