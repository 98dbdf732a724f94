//! Data model shared by the B-tree, TMQ scan, and stream executor modules.

/// Page number type, as used by the pager.
pub type Pgno = u32;

/// WAL submit-log version, monotonically increasing per vnode.
pub type Version = i64;

/// Table unique id, as handed out by the metadata layer.
pub type Uid = i64;

/// `spec.md` §3.1: a tagged union identifying where a scan can resume.
/// `None` is a sentinel that must never escape to a response (`spec.md` §8
/// invariant 1) — encoded as tag `0` on the wire (`spec.md` §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Offset {
    #[default]
    None,
    Log {
        ver: Version,
    },
    SnapshotData {
        uid: Uid,
        ts: i64,
    },
    SnapshotMeta {
        uid: Uid,
        ts: i64,
    },
}

impl Offset {
    pub fn is_none(&self) -> bool {
        matches!(self, Offset::None)
    }

    pub fn is_log(&self) -> bool {
        matches!(self, Offset::Log { .. })
    }

    pub fn is_snapshot_data(&self) -> bool {
        matches!(self, Offset::SnapshotData { .. })
    }
}

/// `spec.md` §3.1: what a subscription handle scans over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubType {
    Column,
    Table,
    Database,
}

/// A minimal stand-in for the real schema wrapper the metadata layer hands
/// out; this crate only needs to clone and transport it, never interpret
/// it (`spec.md` §1 Non-goals: "schema evolution semantics beyond
/// transporting schema wrappers").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaWrapper {
    pub version: i32,
    pub fields: Vec<FieldSchema>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSchema {
    pub name: String,
    pub type_id: i32,
    pub bytes: i32,
}

/// A schema/meta event payload, produced when a scan boundary crosses one
/// (`spec.md` §4.2.2).
#[derive(Debug, Clone, Default)]
pub struct MetaRsp {
    pub rsp_offset: Offset,
    pub meta_bytes: Vec<u8>,
}

/// How a result block should be fed into the operator
/// (`spec.md` §4.3.4 / the external `SetMultiStreamInput` call).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamInputKind {
    DataBlock,
    DataSubmit,
    MergedSubmit,
    Checkpoint,
}

/// Tag on a `DataBlock` produced by the operator, used by the stream
/// executor's `ExecImpl` loop (`spec.md` §4.3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockKind {
    #[default]
    Normal,
    /// Must be broadcast to child tasks rather than accumulated.
    StreamRetrieve,
    /// Synthesized as the final block of a drained retrieve request.
    StreamPullOver,
}

/// A single encoded result block, as produced by the query operator and
/// consumed by both the TMQ response builder and the stream executor's
/// accumulator.
#[derive(Debug, Clone, Default)]
pub struct DataBlock {
    pub rows: u32,
    pub encoded: Vec<u8>,
    pub kind: BlockKind,
    pub child_id: i32,
    pub source_uid: Uid,
}

impl DataBlock {
    pub fn encoded_size(&self) -> usize {
        self.encoded.len()
    }
}

/// A single WAL submit entry, addressed by version (`spec.md` §3.2 `Submit`).
#[derive(Debug, Clone)]
pub struct SubmitMsg {
    pub bytes: Vec<u8>,
    pub ver: Version,
}

/// A batch handed to the output sink by `DumpResult` (`spec.md` §3.2
/// `Stream Data Block`, §4.3.5).
#[derive(Debug, Clone)]
pub struct StreamDataBlock {
    pub kind: StreamInputKind,
    pub source_ver: Version,
    pub blocks: Vec<DataBlock>,
}
