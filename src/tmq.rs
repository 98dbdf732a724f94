//! TMQ Scan Engine (`spec.md` §4.2, component C2).
//!
//! Serves a bounded batch of encoded data blocks starting at a
//! caller-supplied [`Offset`] and returns the next one, wrapping a
//! [`QueryOperator`] and a submit-log [`SubmitLogReader`]. Grounded on
//! `examples/original_source/source/dnode/vnode/src/tq/tqScan.c`
//! (`tqScanData`, `tqScanTaosx`, `tqTaosxScanLog`).

use std::collections::HashSet;

use crate::config::TmqScanConfig;
use crate::error::{Error, ErrorCode, Result};
use crate::log::log_debug;
use crate::operator::QueryOperator;
use crate::types::{DataBlock, MetaRsp, Offset, SchemaWrapper, SubType, Uid, Version};

/// Resolves a table uid to its name; consults the vnode's metadata reader,
/// which `spec.md` §1 puts out of scope for this crate.
pub trait MetaNameResolver {
    fn resolve(&self, uid: Uid) -> Option<String>;
}

/// A decoded batch pulled out of one submit-log entry.
pub struct RetrievedBatch {
    pub blocks: Vec<DataBlock>,
    pub schemas: Vec<SchemaWrapper>,
    pub create_table_req: Option<Vec<u8>>,
}

/// Drains a single submit batch into `(blocks, schemas)` pairs
/// (`spec.md` §4.2.3).
pub trait SubmitLogReader {
    fn set_submit_req(&mut self, bytes: &[u8], ver: Version) -> Result<()>;

    /// Advance to the next decodable block; `false` when the submit batch
    /// is exhausted.
    fn next_data_block(&mut self) -> bool;

    /// Same as `next_data_block`, but skips tables whose uid is in `filter`
    /// (used by `Database`-scoped subscriptions).
    fn next_data_block_filter_out(&mut self, filter: &HashSet<Uid>) -> bool;

    /// Decode the block positioned by the last `next_data_block*` call.
    /// Returns `Err(ErrorCode::NotFound)` when the table's schema can't be
    /// resolved — callers skip the batch and continue.
    fn retrieve_taosx_block(&mut self) -> Result<RetrievedBatch>;

    /// Uid of the table the last decoded block belongs to.
    fn last_blk_uid(&self) -> Uid;

    /// Schema of the table currently being read, used by `ScanTaosx` in
    /// `Log` mode (`spec.md` §4.2.2).
    fn current_schema(&self) -> Option<SchemaWrapper>;
}

/// Immutable per-subscription configuration (`spec.md` §3.1).
pub struct SubscriptionHandle<Op, R, M> {
    pub consumer_id: u64,
    pub snapshot_version: Version,
    pub sub_type: SubType,
    pub with_tbname: bool,
    pub with_schema: bool,
    pub fetch_meta: bool,
    pub precision: u8,
    pub op: Op,
    pub reader: R,
    pub meta: M,
}

/// Response accumulator shared by `ScanData` and `ScanTaosx`
/// (`spec.md` §3.1 Data Response).
#[derive(Debug, Clone, Default)]
pub struct DataResponse {
    pub block_data: Vec<Vec<u8>>,
    pub block_data_len: Vec<i32>,
    pub block_tbname: Vec<String>,
    pub block_schema: Vec<SchemaWrapper>,
    pub create_table_len: Vec<i32>,
    pub create_table_req: Vec<Vec<u8>>,
    pub block_num: u32,
    pub with_tbname: bool,
    pub with_schema: bool,
    pub rsp_offset: Offset,
}

const RETRIEVE_HEADER_LEN: usize = 8 /* useconds */ + 1 /* precision */ + 1 /* compressed */ + 1 /* completed */ + 1 /* pad */ + 8 /* numOfRows */;

/// Builds a `RetrieveTableRsp` envelope and appends it to the response's
/// parallel vectors (`spec.md` §6 wire layout).
fn add_block_to_rsp(resp: &mut DataResponse, block: &DataBlock, precision: u8) {
    let mut buf = Vec::with_capacity(RETRIEVE_HEADER_LEN + block.encoded_size());
    buf.extend_from_slice(&0u64.to_le_bytes()); // useconds
    buf.push(precision);
    buf.push(0); // compressed
    buf.push(1); // completed
    buf.push(0); // pad
    buf.extend_from_slice(&(block.rows as i64).to_be_bytes()); // numOfRows, big-endian
    buf.extend_from_slice(&block.encoded);

    let actual_len = buf.len() as i32;
    resp.block_data_len.push(actual_len);
    resp.block_data.push(buf);
}

/// `spec.md` §4.2.1 steps 1: prepare the operator, falling back to `Log`
/// mode once if the caller-supplied offset can't be honored.
fn prepare_with_fallback<Op: QueryOperator>(
    op: &mut Op,
    offset: &mut Offset,
    sub_type: SubType,
    snapshot_version: Version,
) -> std::result::Result<(), ()> {
    if op.prepare_scan(offset, sub_type).is_ok() {
        return Ok(());
    }
    log_debug!("prepare scan failed, retrying from log offset");
    if offset.is_log() {
        return Err(());
    }
    *offset = Offset::Log {
        ver: snapshot_version,
    };
    if op.prepare_scan(offset, sub_type).is_ok() {
        Ok(())
    } else {
        Err(())
    }
}

/// `ScanData` (`spec.md` §4.2.1): column-only scan, no metadata.
pub fn scan_data<Op, R, M>(
    handle: &mut SubscriptionHandle<Op, R, M>,
    resp: &mut DataResponse,
    offset: &mut Offset,
    config: &TmqScanConfig,
) -> Result<()>
where
    Op: QueryOperator,
{
    resp.with_tbname = handle.with_tbname;
    resp.with_schema = handle.with_schema;

    if prepare_with_fallback(
        &mut handle.op,
        offset,
        handle.sub_type,
        handle.snapshot_version,
    )
    .is_err()
    {
        resp.rsp_offset = *offset;
        return Ok(());
    }

    let mut total_rows: u32 = 0;
    loop {
        let block = handle.op.exec_task()?;
        let Some(block) = block else { break };

        add_block_to_rsp(resp, &block, handle.precision);
        resp.block_num += 1;

        if offset.is_snapshot_data() {
            total_rows += block.rows;
            if total_rows >= config.snapshot_row_cap {
                break;
            }
        }
    }

    resp.rsp_offset = handle.op.extract_offset();
    if resp.rsp_offset.is_none() {
        return Err(Error::with_message(
            ErrorCode::Misuse,
            "operator produced an invalid (None) offset",
        ));
    }

    if resp.with_tbname || resp.with_schema {
        return Err(Error::with_message(
            ErrorCode::Misuse,
            "column-only scan must not request tbname/schema",
        ));
    }

    Ok(())
}

/// `ScanTaosx` (`spec.md` §4.2.2): snapshot + WAL scan with optional
/// tbname/schema/create-table metadata.
pub fn scan_taosx<Op, R, M>(
    handle: &mut SubscriptionHandle<Op, R, M>,
    resp: &mut DataResponse,
    meta_rsp: &mut Option<MetaRsp>,
    offset: &mut Offset,
    config: &TmqScanConfig,
) -> Result<()>
where
    Op: QueryOperator,
    R: SubmitLogReader,
    M: MetaNameResolver,
{
    resp.with_tbname = handle.with_tbname;
    resp.with_schema = handle.with_schema;

    if prepare_with_fallback(
        &mut handle.op,
        offset,
        handle.sub_type,
        handle.snapshot_version,
    )
    .is_err()
    {
        resp.rsp_offset = *offset;
        return Ok(());
    }

    let mut row_count: u32 = 0;
    let mut explicit_offset: Option<Offset> = None;

    loop {
        let block = handle.op.exec_task()?;

        if let Some(ref block) = block {
            if block.rows > 0 {
                if handle.with_tbname {
                    let resolved = if offset.is_log() {
                        let uid = handle.reader.last_blk_uid();
                        handle.meta.resolve(uid)
                    } else {
                        handle.op.extract_tbname_from_task()
                    };
                    match resolved {
                        None => continue,
                        Some(name) => resp.block_tbname.push(name),
                    }
                }
                if handle.with_schema {
                    let schema = if offset.is_log() {
                        handle.reader.current_schema()
                    } else {
                        handle.op.extract_schema_from_task()
                    };
                    if let Some(schema) = schema {
                        resp.block_schema.push(schema);
                    }
                }

                add_block_to_rsp(resp, block, handle.precision);
                resp.block_num += 1;

                if offset.is_log() {
                    continue;
                }
                row_count += block.rows;
                if row_count <= config.snapshot_row_cap {
                    continue;
                }
                // fall through: row cap exceeded, stop accumulating this round
            }
        }

        if block.as_ref().map(|b| b.rows == 0).unwrap_or(true) && offset.is_snapshot_data() {
            if handle.op.extract_prepare_uid() != 0 {
                continue;
            }
            log_debug!(
                "snapshot drained, switching to log at ver {}",
                handle.snapshot_version + 1
            );
            explicit_offset = Some(Offset::Log {
                ver: handle.snapshot_version + 1,
            });
            break;
        }

        if resp.block_num > 0 {
            break;
        }

        let Some(mut meta) = handle.op.extract_meta_msg() else {
            break;
        };
        if meta.rsp_offset.is_snapshot_data() {
            *offset = meta.rsp_offset;
            let _ = handle.op.prepare_scan(offset, handle.sub_type);
            meta.rsp_offset = match meta.rsp_offset {
                Offset::SnapshotData { uid, ts } => Offset::SnapshotMeta { uid, ts },
                other => other,
            };
            continue;
        }

        *meta_rsp = Some(meta);
        break;
    }

    resp.rsp_offset = match explicit_offset {
        Some(o) => o,
        None => handle.op.extract_offset(),
    };

    if resp.rsp_offset.is_none() {
        return Err(Error::with_message(
            ErrorCode::Misuse,
            "operator produced an invalid (None) offset",
        ));
    }

    Ok(())
}

/// `ScanLog` (`spec.md` §4.2.3): drains one submit batch.
pub fn scan_log<Op, R, M>(
    handle: &mut SubscriptionHandle<Op, R, M>,
    submit_bytes: &[u8],
    submit_ver: Version,
    resp: &mut DataResponse,
    filter_out: Option<&HashSet<Uid>>,
) -> Result<i64>
where
    R: SubmitLogReader,
    M: MetaNameResolver,
{
    handle.reader.set_submit_req(submit_bytes, submit_ver)?;

    let mut total_rows: i64 = 0;
    loop {
        let has_next = match filter_out {
            Some(filter) => handle.reader.next_data_block_filter_out(filter),
            None => handle.reader.next_data_block(),
        };
        if !has_next {
            break;
        }

        let batch = match handle.reader.retrieve_taosx_block() {
            Ok(batch) => batch,
            Err(e) if e.code() == ErrorCode::NotFound => continue,
            Err(e) => return Err(e),
        };

        let RetrievedBatch {
            mut blocks,
            schemas,
            create_table_req,
        } = batch;

        if handle.with_tbname {
            let uid = handle.reader.last_blk_uid();
            match handle.meta.resolve(uid) {
                None => {
                    blocks.clear();
                    continue;
                }
                Some(name) => {
                    for _ in 0..blocks.len() {
                        resp.block_tbname.push(name.clone());
                    }
                }
            }
        }

        if handle.fetch_meta {
            if let Some(req) = create_table_req {
                resp.create_table_len.push(req.len() as i32);
                resp.create_table_req.push(req);
            }
        }

        for (block, schema) in blocks.into_iter().zip(schemas.into_iter()) {
            total_rows += block.rows as i64;
            add_block_to_rsp(resp, &block, handle.precision);
            resp.block_schema.push(schema);
            resp.block_num += 1;
        }
    }

    Ok(total_rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::mock::MockOperator;
    use crate::types::{BlockKind, FieldSchema};

    struct NoopReader;
    impl SubmitLogReader for NoopReader {
        fn set_submit_req(&mut self, _bytes: &[u8], _ver: Version) -> Result<()> {
            Ok(())
        }
        fn next_data_block(&mut self) -> bool {
            false
        }
        fn next_data_block_filter_out(&mut self, _filter: &HashSet<Uid>) -> bool {
            false
        }
        fn retrieve_taosx_block(&mut self) -> Result<RetrievedBatch> {
            unreachable!()
        }
        fn last_blk_uid(&self) -> Uid {
            0
        }
        fn current_schema(&self) -> Option<SchemaWrapper> {
            None
        }
    }

    struct NoopMeta;
    impl MetaNameResolver for NoopMeta {
        fn resolve(&self, _uid: Uid) -> Option<String> {
            None
        }
    }

    fn block(rows: u32) -> DataBlock {
        DataBlock {
            rows,
            encoded: vec![1, 2, 3],
            kind: BlockKind::Normal,
            child_id: 0,
            source_uid: 1,
        }
    }

    fn handle_with(op: MockOperator) -> SubscriptionHandle<MockOperator, NoopReader, NoopMeta> {
        SubscriptionHandle {
            consumer_id: 1,
            snapshot_version: 42,
            sub_type: SubType::Column,
            with_tbname: false,
            with_schema: false,
            fetch_meta: false,
            precision: 0,
            op,
            reader: NoopReader,
            meta: NoopMeta,
        }
    }

    #[test]
    fn scan_data_never_emits_none_offset() {
        let mut op = MockOperator::default();
        for _ in 0..3 {
            op.pending.push_back(block(10));
        }
        op.offset_after_drain = Offset::Log { ver: 43 };
        let mut handle = handle_with(op);
        let mut resp = DataResponse::default();
        let mut offset = Offset::Log { ver: 42 };
        scan_data(&mut handle, &mut resp, &mut offset, &TmqScanConfig::default()).unwrap();
        assert!(!resp.rsp_offset.is_none());
        assert_eq!(resp.block_num, 3);
    }

    #[test]
    fn scan_data_snapshot_row_cap() {
        let mut op = MockOperator::default();
        for _ in 0..5000 {
            op.pending.push_back(block(1));
        }
        op.offset_after_drain = Offset::SnapshotData { uid: 1, ts: 100 };
        let mut handle = handle_with(op);
        handle.sub_type = SubType::Column;
        let mut resp = DataResponse::default();
        let mut offset = Offset::SnapshotData { uid: 1, ts: 0 };
        let config = TmqScanConfig::default();
        scan_data(&mut handle, &mut resp, &mut offset, &config).unwrap();
        assert!(resp.block_num as u32 >= config.snapshot_row_cap);
        assert!((resp.block_num as u32) < config.snapshot_row_cap + 1);
        assert!(matches!(resp.rsp_offset, Offset::SnapshotData { .. }));
    }

    #[test]
    fn scan_data_prepare_fallback_to_log() {
        let mut op = MockOperator::default();
        op.fail_prepare = true;
        let mut handle = handle_with(op);
        let mut resp = DataResponse::default();
        let mut offset = Offset::SnapshotData { uid: 1, ts: 0 };
        scan_data(&mut handle, &mut resp, &mut offset, &TmqScanConfig::default()).unwrap();
        assert_eq!(resp.rsp_offset, Offset::Log { ver: 42 });
        assert_eq!(resp.block_num, 0);
    }

    #[test]
    fn scan_data_rejects_meta_flags() {
        let mut op = MockOperator::default();
        op.offset_after_drain = Offset::Log { ver: 1 };
        let mut handle = handle_with(op);
        handle.with_tbname = true;
        let mut resp = DataResponse::default();
        let mut offset = Offset::Log { ver: 0 };
        let err = scan_data(&mut handle, &mut resp, &mut offset, &TmqScanConfig::default())
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Misuse);
    }

    #[test]
    fn scan_taosx_switches_snapshot_to_log() {
        let mut op = MockOperator::default();
        op.prepare_uid = 0; // snapshot already exhausted
        let mut handle = handle_with(op);
        let mut resp = DataResponse::default();
        let mut meta_rsp = None;
        let mut offset = Offset::SnapshotData { uid: 7, ts: 1 };
        scan_taosx(
            &mut handle,
            &mut resp,
            &mut meta_rsp,
            &mut offset,
            &TmqScanConfig::default(),
        )
        .unwrap();
        assert_eq!(resp.rsp_offset, Offset::Log { ver: 43 });
    }

    #[test]
    fn schema_field_roundtrips() {
        let s = SchemaWrapper {
            version: 1,
            fields: vec![FieldSchema {
                name: "ts".into(),
                type_id: 9,
                bytes: 8,
            }],
        };
        assert_eq!(s.fields[0].name, "ts");
    }
}
