//! B-Tree Index Core (`spec.md` §4.1, component C1).
//!
//! A paged, cursor-driven ordered map over `(key, value)` with variable- or
//! fixed-length keys, overflow cells, and balance-on-insert-overflow.
//! Grounded on `examples/tsmarsh-rustql/src/storage/btree.rs` and
//! `examples/original_source/source/libs/tdb/src/db/tdbBtree.c`; the
//! original's balance routine is left as a stub there (`spec.md` §9), so
//! the redistribution policy below is this crate's own, documented in
//! `DESIGN.md`.

use std::cell::Cell as Slot;
use std::cmp::Ordering;
use std::rc::Rc;

use bitflags::bitflags;

use crate::encoding::{
    read_u32, read_u32_le, read_varint, write_u16, write_u32, write_u32_le, write_varint,
};
use crate::error::{Error, ErrorCode, Result};
use crate::pager::{PageBuf, Pager};
use crate::types::Pgno;

bitflags! {
    /// `spec.md` §3.3: valid combinations are `{}`, `{Root}`, `{Leaf}`,
    /// `{Root|Leaf}`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u8 {
        const ROOT = 0b0000_0001;
        const LEAF = 0b0000_0010;
    }
}

const FLAGS_OFF: usize = 0;
const NCELLS_OFF: usize = 1;
const CONTENT_START_OFF: usize = 3;
const RESERVED_OFF: usize = 5;
const PAGE_HDR_LEN: usize = 8;
const AM_HDR_LEN: usize = 4; // right-child pgno, interior pages only
const PTR_SIZE: usize = 2;

fn content_area_start(flags: PageFlags) -> usize {
    if flags.contains(PageFlags::LEAF) {
        PAGE_HDR_LEN
    } else {
        PAGE_HDR_LEN + AM_HDR_LEN
    }
}

fn page_flags(data: &[u8]) -> PageFlags {
    PageFlags::from_bits_truncate(data[FLAGS_OFF])
}

fn page_n_cells(data: &[u8]) -> usize {
    crate::encoding::read_u16(data, NCELLS_OFF).unwrap_or(0) as usize
}

fn page_content_start(data: &[u8]) -> usize {
    crate::encoding::read_u16(data, CONTENT_START_OFF).unwrap_or(data.len() as u16) as usize
}

fn page_right_child(data: &[u8]) -> Pgno {
    read_u32(data, PAGE_HDR_LEN).unwrap_or(0)
}

/// A harvested cell, kept in memory during balance. For interior pages
/// `child` is the subtree to its left; for leaves it's unused.
#[derive(Debug, Clone)]
struct CellRec {
    key: Vec<u8>,
    encoded: Vec<u8>,
    child: Option<Pgno>,
}

/// B-tree configuration derived from `spec.md` §3.3's fixed-page formulas.
#[derive(Debug, Clone, Copy)]
pub struct Derived {
    pub max_local: u32,
    pub min_local: u32,
    pub max_leaf: u32,
    pub min_leaf: u32,
}

impl Derived {
    pub fn compute(page_size: u32, fanout: u8) -> Self {
        let usable = page_size.saturating_sub(PAGE_HDR_LEN as u32);
        let max_local = usable / (fanout.max(1) as u32);
        Self {
            max_local,
            min_local: max_local / 2,
            max_leaf: usable,
            min_leaf: max_local / 2,
        }
    }
}

/// Key/value length mode: `Fixed(n)` omits the varint length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLen {
    Fixed(u32),
    Variable,
}

pub type CmpFn = dyn Fn(&[u8], &[u8]) -> Ordering;

/// Default comparator: lexicographic `memcmp`, shorter key ordered first
/// on a common prefix (`spec.md` §6).
pub fn default_cmp(a: &[u8], b: &[u8]) -> Ordering {
    a.cmp(b)
}

/// `spec.md` §3.3 cursor: `{iPage, idx}` plus a stack of ancestor
/// `(pgno, child_slot)` pairs. `page == 0` and `idx == -1` mean
/// uninitialized.
pub struct Cursor {
    stack: Vec<(Pgno, usize)>,
    page: Pgno,
    idx: i32,
    cmp_result: i32,
}

impl Cursor {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            page: 0,
            idx: -1,
            cmp_result: -1,
        }
    }

    pub fn found(&self) -> bool {
        self.idx >= 0 && self.cmp_result == 0
    }
}

impl Default for Cursor {
    fn default() -> Self {
        Self::new()
    }
}

/// A B-tree handle over a pager (`spec.md` §3.3).
pub struct Btree<P> {
    pager: Rc<P>,
    root_pgno: Slot<Pgno>,
    key_len: KeyLen,
    val_len: KeyLen,
    cmp: Box<CmpFn>,
    fanout: u8,
    derived: Derived,
}

impl<P: Pager> Btree<P> {
    /// `Open` (`spec.md` §4.1): probe for an existing root, or allocate and
    /// zero-initialize one as `{Root|Leaf}`.
    pub fn open(
        pager: Rc<P>,
        existing_root: Option<Pgno>,
        key_len: KeyLen,
        val_len: KeyLen,
        fanout: u8,
    ) -> Result<Self> {
        let derived = Derived::compute(pager.page_size(), fanout);
        let bt = Self {
            pager,
            root_pgno: Slot::new(0),
            key_len,
            val_len,
            cmp: Box::new(default_cmp),
            fanout,
            derived,
        };

        let root_pgno = match existing_root {
            Some(pgno) => pgno,
            None => {
                let flags = PageFlags::ROOT | PageFlags::LEAF;
                let (pgno, _) = bt.pager.new_page(&mut |_pgno, data: &mut [u8]| {
                    zero_page(data, flags);
                    Ok(())
                })?;
                pgno
            }
        };
        bt.root_pgno.set(root_pgno);
        Ok(bt)
    }

    pub fn with_comparator(mut self, cmp: Box<CmpFn>) -> Self {
        self.cmp = cmp;
        self
    }

    pub fn root_pgno(&self) -> Pgno {
        self.root_pgno.get()
    }

    fn is_root(&self, pgno: Pgno) -> bool {
        self.root_pgno.get() == pgno
    }

    fn fetch(&self, pgno: Pgno) -> Result<PageBuf> {
        self.pager.fetch_page(pgno, &mut |p, data: &mut [u8]| {
            // Fault-in of a page the tree has never written is a corruption;
            // writers always zero-init through `new_page`.
            let _ = p;
            Err(Error::with_message(
                ErrorCode::Corrupt,
                "fetched an uninitialized page",
            ))
        })
    }

    fn page_budget(&self, is_leaf: bool) -> usize {
        if is_leaf {
            self.derived.max_leaf as usize
        } else {
            (self.derived.max_local as usize) * (self.fanout.max(1) as usize)
        }
    }

    // ---- cell codec ----------------------------------------------------

    fn encode_leaf_cell(&self, key: &[u8], val: &[u8]) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        if matches!(self.key_len, KeyLen::Variable) {
            write_varint(key.len() as u64, &mut buf);
        }
        if matches!(self.val_len, KeyLen::Variable) {
            write_varint(val.len() as u64, &mut buf);
        }
        let payload_len = key.len() + val.len();
        if payload_len as u32 <= self.derived.max_local {
            buf.extend_from_slice(key);
            buf.extend_from_slice(val);
        } else {
            // Overflow: spill the tail of the concatenated payload to
            // dedicated overflow pages, keep a local prefix plus the
            // overflow chain's head pgno (`spec.md` §3.3 Overflow).
            let local_cap = (self.derived.max_local as usize).saturating_sub(4);
            let mut payload = Vec::with_capacity(payload_len);
            payload.extend_from_slice(key);
            payload.extend_from_slice(val);
            let (local, rest) = payload.split_at(local_cap.min(payload.len()));
            let head = self.write_overflow_chain(rest)?;
            buf.extend_from_slice(local);
            let mut head_buf = [0u8; 4];
            write_u32(&mut head_buf, 0, head)?;
            buf.extend_from_slice(&head_buf);
        }
        Ok(buf)
    }

    fn write_overflow_chain(&self, mut data: &[u8]) -> Result<Pgno> {
        let chunk_cap = self.pager.page_size() as usize - 4;
        let mut pages: Vec<(Pgno, Vec<u8>)> = Vec::new();
        while !data.is_empty() {
            let take = data.len().min(chunk_cap);
            pages.push((0, data[..take].to_vec()));
            data = &data[take..];
        }
        let mut next: Pgno = 0;
        for (_, chunk) in pages.into_iter().rev() {
            let (pgno, _) = self.pager.new_page(&mut |_pgno, buf: &mut [u8]| {
                write_u32(buf, 0, next)?;
                buf[4..4 + chunk.len()].copy_from_slice(&chunk);
                Ok(())
            })?;
            next = pgno;
        }
        Ok(next)
    }

    fn read_overflow_chain(&self, mut pgno: Pgno, total_len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(total_len);
        while pgno != 0 && out.len() < total_len {
            let buf = self.fetch(pgno)?;
            let data = buf.borrow();
            let next = read_u32(&data, 0).unwrap_or(0);
            let remaining = total_len - out.len();
            let chunk_cap = data.len() - 4;
            out.extend_from_slice(&data[4..4 + remaining.min(chunk_cap)]);
            pgno = next;
        }
        Ok(out)
    }

    fn encode_interior_cell(&self, key: &[u8], child: Pgno) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        if matches!(self.key_len, KeyLen::Variable) {
            write_varint(key.len() as u64, &mut buf);
        }
        // `spec.md` §6: interior cells carry a fixed little-endian pgno.
        let mut child_buf = [0u8; 4];
        write_u32_le(&mut child_buf, 0, child)?;
        buf.extend_from_slice(&child_buf);
        buf.extend_from_slice(key);
        Ok(buf)
    }

    /// Decodes the key out of a leaf cell, resolving overflow if needed.
    fn decode_leaf_key(&self, cell: &[u8]) -> Result<Vec<u8>> {
        Ok(self.decode_leaf_payload(cell)?.0)
    }

    /// Returns `(key, value)` for a leaf cell, following overflow if set.
    fn decode_leaf_payload(&self, cell: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut off = 0;
        let klen = match self.key_len {
            KeyLen::Fixed(n) => n as usize,
            KeyLen::Variable => {
                let (v, n) = read_varint(cell, off)?;
                off += n;
                v as usize
            }
        };
        let vlen = match self.val_len {
            KeyLen::Fixed(n) => n as usize,
            KeyLen::Variable => {
                let (v, n) = read_varint(cell, off)?;
                off += n;
                v as usize
            }
        };
        let needed = klen + vlen;
        let local = &cell[off..];
        if needed <= self.derived.max_local as usize {
            let payload = local[..needed].to_vec();
            Ok((payload[..klen].to_vec(), payload[klen..].to_vec()))
        } else {
            let local_cap = local.len() - 4;
            let head = read_u32(local, local_cap).unwrap_or(0);
            let mut payload = local[..local_cap].to_vec();
            payload.extend(self.read_overflow_chain(head, needed - local_cap)?);
            Ok((payload[..klen].to_vec(), payload[klen..].to_vec()))
        }
    }

    fn decode_interior_key(&self, cell: &[u8]) -> Result<Vec<u8>> {
        // Layout is [kLen?][child u32][key]; kLen precedes child when variable.
        let mut pos = 0;
        if matches!(self.key_len, KeyLen::Variable) {
            let (_klen, n) = read_varint(cell, pos)?;
            pos += n;
        }
        pos += 4;
        Ok(cell[pos..].to_vec())
    }

    fn decode_interior_child(&self, cell: &[u8]) -> Result<Pgno> {
        let mut pos = 0;
        if matches!(self.key_len, KeyLen::Variable) {
            let (_klen, n) = read_varint(cell, pos)?;
            pos += n;
        }
        read_u32_le(cell, pos).ok_or_else(|| Error::new(ErrorCode::Corrupt))
    }

    // ---- page read/write -------------------------------------------------

    fn cell_ptr(&self, data: &[u8], flags: PageFlags, i: usize) -> usize {
        let base = content_area_start(flags) + i * PTR_SIZE;
        crate::encoding::read_u16(data, base).unwrap_or(0) as usize
    }

    /// Cells are written back-to-front in index order (`write_page` places
    /// cell 0 nearest the page's end), so cell `i`'s byte range runs from
    /// its own pointer up to cell `i-1`'s pointer (or the page end for
    /// cell 0).
    fn cell_bytes<'a>(&self, data: &'a [u8], flags: PageFlags, i: usize, n: usize) -> &'a [u8] {
        let _ = n;
        let start = self.cell_ptr(data, flags, i);
        let cell_end = if i == 0 {
            data.len()
        } else {
            self.cell_ptr(data, flags, i - 1)
        };
        &data[start..cell_end]
    }

    fn harvest_leaf(&self, pgno: Pgno) -> Result<Vec<CellRec>> {
        let buf = self.fetch(pgno)?;
        let data = buf.borrow();
        let flags = page_flags(&data);
        let n = page_n_cells(&data);
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let cell = self.cell_bytes(&data, flags, i, n).to_vec();
            let key = self.decode_leaf_key(&cell)?;
            out.push(CellRec {
                key,
                encoded: cell,
                child: None,
            });
        }
        Ok(out)
    }

    fn harvest_interior(&self, pgno: Pgno) -> Result<(Vec<CellRec>, Pgno)> {
        let buf = self.fetch(pgno)?;
        let data = buf.borrow();
        let flags = page_flags(&data);
        let n = page_n_cells(&data);
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let cell = self.cell_bytes(&data, flags, i, n).to_vec();
            let key = self.decode_interior_key(&cell)?;
            let child = self.decode_interior_child(&cell)?;
            out.push(CellRec {
                key,
                encoded: cell,
                child: Some(child),
            });
        }
        Ok((out, page_right_child(&data)))
    }

    fn rebuild_leaf(&self, pgno: Pgno, cells: &[CellRec], is_root: bool) -> Result<()> {
        let mut flags = PageFlags::LEAF;
        if is_root {
            flags |= PageFlags::ROOT;
        }
        let buf = self.fetch_for_rewrite(pgno)?;
        let mut data = buf.borrow_mut();
        write_page(&mut data, flags, cells, None);
        Ok(())
    }

    fn rebuild_interior(
        &self,
        pgno: Pgno,
        cells: &[CellRec],
        rchild: Pgno,
        is_root: bool,
    ) -> Result<()> {
        let mut flags = PageFlags::empty();
        if is_root {
            flags |= PageFlags::ROOT;
        }
        let buf = self.fetch_for_rewrite(pgno)?;
        let mut data = buf.borrow_mut();
        write_page(&mut data, flags, cells, Some(rchild));
        Ok(())
    }

    fn fetch_for_rewrite(&self, pgno: Pgno) -> Result<PageBuf> {
        self.pager
            .fetch_page(pgno, &mut |_pgno, data: &mut [u8]| {
                zero_page(data, PageFlags::LEAF);
                Ok(())
            })
    }

    fn new_leaf(&self, cells: &[CellRec]) -> Result<Pgno> {
        let cells_owned = cells.to_vec();
        let (pgno, _) = self.pager.new_page(&mut |_pgno, data: &mut [u8]| {
            write_page(data, PageFlags::LEAF, &cells_owned, None);
            Ok(())
        })?;
        Ok(pgno)
    }

    fn new_interior(&self, cells: &[CellRec], rchild: Pgno) -> Result<Pgno> {
        let cells_owned = cells.to_vec();
        let (pgno, _) = self.pager.new_page(&mut |_pgno, data: &mut [u8]| {
            write_page(data, PageFlags::empty(), &cells_owned, Some(rchild));
            Ok(())
        })?;
        Ok(pgno)
    }

    // ---- seek / insert ----------------------------------------------------

    /// `Seek (MoveTo)` (`spec.md` §4.1): descend to the leaf that would
    /// hold `key`, leaving the cursor positioned there.
    pub fn seek(&self, cursor: &mut Cursor, key: &[u8]) -> Result<()> {
        cursor.stack.clear();
        let mut pgno = self.root_pgno.get();

        loop {
            let buf = self.fetch(pgno)?;
            let data = buf.borrow();
            let n = page_n_cells(&data);
            let flags = page_flags(&data);

            if n == 0 {
                drop(data);
                cursor.page = pgno;
                cursor.idx = -1;
                cursor.cmp_result = -1;
                return Ok(());
            }

            let mut lidx: i64 = 0;
            let mut ridx: i64 = n as i64 - 1;
            let mut midx: i64 = 0;
            let mut c: i32 = 0;
            while lidx <= ridx {
                midx = (lidx + ridx) / 2;
                let cell = self.cell_bytes(&data, flags, midx as usize, n);
                let cell_key = if flags.contains(PageFlags::LEAF) {
                    self.decode_leaf_key(cell)?
                } else {
                    self.decode_interior_key(cell)?
                };
                c = match (self.cmp)(key, &cell_key) {
                    Ordering::Less => -1,
                    Ordering::Equal => 0,
                    Ordering::Greater => 1,
                };
                if c == 0 {
                    break;
                } else if c < 0 {
                    ridx = midx - 1;
                } else {
                    lidx = midx + 1;
                }
            }

            if flags.contains(PageFlags::LEAF) {
                drop(data);
                cursor.page = pgno;
                cursor.idx = midx as i32;
                cursor.cmp_result = c;
                return Ok(());
            }

            let rchild = page_right_child(&data);
            let (slot, child) = if c <= 0 {
                let cell = self.cell_bytes(&data, flags, midx as usize, n);
                (midx as usize, self.decode_interior_child(cell)?)
            } else if midx as usize == n - 1 {
                (n, rchild)
            } else {
                let cell = self.cell_bytes(&data, flags, (midx + 1) as usize, n);
                ((midx + 1) as usize, self.decode_interior_child(cell)?)
            };
            drop(data);
            cursor.stack.push((pgno, slot));
            pgno = child;
        }
    }

    /// `Insert` (`spec.md` §4.1): seek, reject exact-key duplicates,
    /// otherwise splice in and balance on overflow.
    pub fn insert(&self, key: &[u8], val: &[u8]) -> Result<()> {
        let mut cursor = Cursor::new();
        self.seek(&mut cursor, key)?;

        let insert_idx = if cursor.idx == -1 {
            0usize
        } else if cursor.cmp_result == 0 {
            return Err(Error::with_message(
                ErrorCode::Constraint,
                "duplicate key on insert",
            ));
        } else if cursor.cmp_result > 0 {
            cursor.idx as usize + 1
        } else {
            cursor.idx as usize
        };

        let new_cell = self.encode_leaf_cell(key, val)?;
        let mut cells = self.harvest_leaf(cursor.page)?;
        cells.insert(
            insert_idx.min(cells.len()),
            CellRec {
                key: key.to_vec(),
                encoded: new_cell,
                child: None,
            },
        );

        let budget = self.page_budget(true);
        let total: usize = cells.iter().map(|c| c.encoded.len() + PTR_SIZE).sum();
        if total <= budget {
            self.rebuild_leaf(cursor.page, &cells, self.is_root(cursor.page))?;
            return Ok(());
        }

        self.balance_leaf(cursor.page, cells, cursor.stack)
    }

    // ---- balance ----------------------------------------------------------

    /// `Balance-Deeper` (`spec.md` §4.1): the root overflowed with no
    /// parent to redistribute into. Split its cells across fresh leaf
    /// children and turn the root into a one-divider interior page.
    fn balance_deeper_leaf(&self, root_pgno: Pgno, cells: Vec<CellRec>) -> Result<()> {
        let budget = self.page_budget(true);
        let min_budget = self.derived.min_leaf as usize;
        let segments = pack_segments(&cells, budget, min_budget);

        let mut child_pgnos = Vec::with_capacity(segments.len());
        for (s, e) in &segments {
            child_pgnos.push(self.new_leaf(&cells[*s..*e])?);
        }

        let mut dividers = Vec::with_capacity(child_pgnos.len() - 1);
        for (j, pgno) in child_pgnos.iter().enumerate().take(child_pgnos.len() - 1) {
            let divider_key = cells[segments[j].1].key.clone();
            dividers.push(CellRec {
                encoded: self.encode_interior_cell(&divider_key, *pgno)?,
                key: divider_key,
                child: Some(*pgno),
            });
        }
        let rchild = *child_pgnos.last().unwrap();
        self.rebuild_interior(root_pgno, &dividers, rchild, true)
    }

    fn balance_leaf(
        &self,
        pgno: Pgno,
        cells: Vec<CellRec>,
        mut stack: Vec<(Pgno, usize)>,
    ) -> Result<()> {
        let Some((parent_pgno, slot)) = stack.pop() else {
            return self.balance_deeper_leaf(pgno, cells);
        };

        let (parent_cells, parent_rchild) = self.harvest_interior(parent_pgno)?;
        let n_children = parent_cells.len() + 1;
        let lo = slot.saturating_sub(1);
        let hi = (slot + 1).min(n_children - 1);

        let mut sibling_pgnos = Vec::with_capacity(hi - lo + 1);
        for i in lo..=hi {
            let child = if i < parent_cells.len() {
                parent_cells[i].child.unwrap()
            } else {
                parent_rchild
            };
            sibling_pgnos.push(child);
        }

        let mut merged: Vec<CellRec> = Vec::new();
        for &sp in &sibling_pgnos {
            if sp == pgno {
                merged.extend(cells.iter().cloned());
            } else {
                merged.extend(self.harvest_leaf(sp)?);
            }
        }

        let budget = self.page_budget(true);
        let min_budget = self.derived.min_leaf as usize;
        let segments = pack_segments(&merged, budget, min_budget);
        let k = segments.len();

        let new_pgnos = self.allocate_or_reuse(&sibling_pgnos, k)?;
        for (j, (s, e)) in segments.iter().enumerate() {
            self.rebuild_leaf(new_pgnos[j], &merged[*s..*e], false)?;
        }

        let mut new_divider_cells = Vec::with_capacity(k - 1);
        for j in 0..k - 1 {
            let divider_key = merged[segments[j].1].key.clone();
            new_divider_cells.push(CellRec {
                encoded: self.encode_interior_cell(&divider_key, new_pgnos[j])?,
                key: divider_key,
                child: Some(new_pgnos[j]),
            });
        }
        let new_rchild = *new_pgnos.last().unwrap();

        self.splice_into_parent(
            parent_pgno,
            parent_cells,
            parent_rchild,
            lo,
            hi,
            new_divider_cells,
            new_rchild,
            stack,
        )
    }

    /// Replaces the parent's `[lo, hi]` child range with the freshly built
    /// siblings' divider cells, then recurses into balance if the parent
    /// itself now overflows (`spec.md` §4.1 Balance step 5).
    #[allow(clippy::too_many_arguments)]
    fn splice_into_parent(
        &self,
        parent_pgno: Pgno,
        mut parent_cells: Vec<CellRec>,
        parent_rchild: Pgno,
        lo: usize,
        hi: usize,
        new_divider_cells: Vec<CellRec>,
        new_rchild: Pgno,
        stack: Vec<(Pgno, usize)>,
    ) -> Result<()> {
        let (final_cells, final_rchild) = if hi < parent_cells.len() {
            let mut boundary = parent_cells[hi].clone();
            boundary.child = Some(new_rchild);
            boundary.encoded = self.encode_interior_cell(&boundary.key, new_rchild)?;
            let tail = parent_cells.split_off(hi + 1);
            parent_cells.truncate(lo);
            parent_cells.extend(new_divider_cells);
            parent_cells.push(boundary);
            parent_cells.extend(tail);
            (parent_cells, parent_rchild)
        } else {
            parent_cells.truncate(lo);
            parent_cells.extend(new_divider_cells);
            (parent_cells, new_rchild)
        };

        let budget = self.page_budget(false);
        let total: usize = final_cells.iter().map(|c| c.encoded.len() + PTR_SIZE).sum();
        if total <= budget {
            self.rebuild_interior(parent_pgno, &final_cells, final_rchild, self.is_root(parent_pgno))?;
            return Ok(());
        }

        self.balance_interior(parent_pgno, final_cells, final_rchild, stack)
    }

    fn balance_deeper_interior(
        &self,
        root_pgno: Pgno,
        cells: Vec<CellRec>,
        rchild: Pgno,
    ) -> Result<()> {
        let budget = self.page_budget(false);
        let min_budget = self.derived.min_local as usize;
        let (segments, seg_rchildren) = pack_interior_segments(&cells, rchild, budget, min_budget);

        let mut child_pgnos = Vec::with_capacity(segments.len());
        for (j, (s, e)) in segments.iter().enumerate() {
            child_pgnos.push(self.new_interior(&cells[*s..*e], seg_rchildren[j])?);
        }

        let mut dividers = Vec::with_capacity(child_pgnos.len() - 1);
        for (j, pgno) in child_pgnos.iter().enumerate().take(child_pgnos.len() - 1) {
            // The cell just past this segment's end is the promoted divider.
            let cut = &cells[segments[j].1];
            dividers.push(CellRec {
                encoded: self.encode_interior_cell(&cut.key, *pgno)?,
                key: cut.key.clone(),
                child: Some(*pgno),
            });
        }
        let new_rchild = *child_pgnos.last().unwrap();
        self.rebuild_interior(root_pgno, &dividers, new_rchild, true)
    }

    fn balance_interior(
        &self,
        pgno: Pgno,
        cells: Vec<CellRec>,
        rchild: Pgno,
        mut stack: Vec<(Pgno, usize)>,
    ) -> Result<()> {
        let Some((parent_pgno, slot)) = stack.pop() else {
            return self.balance_deeper_interior(pgno, cells, rchild);
        };

        let (parent_cells, parent_rchild) = self.harvest_interior(parent_pgno)?;
        let n_children = parent_cells.len() + 1;
        let lo = slot.saturating_sub(1);
        let hi = (slot + 1).min(n_children - 1);

        let mut sibling_pgnos = Vec::with_capacity(hi - lo + 1);
        for i in lo..=hi {
            let child = if i < parent_cells.len() {
                parent_cells[i].child.unwrap()
            } else {
                parent_rchild
            };
            sibling_pgnos.push(child);
        }

        let mut merged: Vec<CellRec> = Vec::new();
        for (i, &sp) in sibling_pgnos.iter().enumerate() {
            let (sib_cells, sib_rchild) = if sp == pgno {
                (cells.clone(), rchild)
            } else {
                self.harvest_interior(sp)?
            };
            merged.extend(sib_cells);
            if lo + i < hi {
                let divider_key = parent_cells
                    .get(lo + i)
                    .map(|c| c.key.clone())
                    .unwrap_or_default();
                merged.push(CellRec {
                    encoded: self.encode_interior_cell(&divider_key, sib_rchild)?,
                    key: divider_key,
                    child: Some(sib_rchild),
                });
            }
        }

        let budget = self.page_budget(false);
        let min_budget = self.derived.min_local as usize;
        let last_sibling_rchild = if sibling_pgnos.last() == Some(&pgno) {
            rchild
        } else {
            self.harvest_interior(*sibling_pgnos.last().unwrap())?.1
        };
        let (segments, seg_rchildren) =
            pack_interior_segments(&merged, last_sibling_rchild, budget, min_budget);
        let k = segments.len();

        let new_pgnos = self.allocate_or_reuse(&sibling_pgnos, k)?;
        for (j, (s, e)) in segments.iter().enumerate() {
            self.rebuild_interior(new_pgnos[j], &merged[*s..*e], seg_rchildren[j], false)?;
        }

        let mut new_divider_cells = Vec::with_capacity(k - 1);
        for j in 0..k - 1 {
            let cut = &merged[segments[j].1];
            new_divider_cells.push(CellRec {
                encoded: self.encode_interior_cell(&cut.key, new_pgnos[j])?,
                key: cut.key.clone(),
                child: Some(new_pgnos[j]),
            });
        }
        let new_rchild = *new_pgnos.last().unwrap();

        self.splice_into_parent(
            parent_pgno,
            parent_cells,
            parent_rchild,
            lo,
            hi,
            new_divider_cells,
            new_rchild,
            stack,
        )
    }

    /// Reuses as many of `old` as possible for the first `k` result pages,
    /// freeing the rest, or allocates fresh pages if `k > old.len()`.
    fn allocate_or_reuse(&self, old: &[Pgno], k: usize) -> Result<Vec<Pgno>> {
        let mut out = Vec::with_capacity(k);
        for &pgno in old.iter().take(k) {
            out.push(pgno);
        }
        for _ in old.len()..k {
            let (pgno, _) = self
                .pager
                .new_page(&mut |_pgno, data: &mut [u8]| {
                    zero_page(data, PageFlags::LEAF);
                    Ok(())
                })?;
            out.push(pgno);
        }
        for &pgno in old.iter().skip(k) {
            self.pager.free_page(pgno)?;
        }
        Ok(out)
    }
}

fn zero_page(data: &mut [u8], flags: PageFlags) {
    data.fill(0);
    data[FLAGS_OFF] = flags.bits();
    let _ = write_u16(data, NCELLS_OFF, 0);
    let _ = write_u16(data, CONTENT_START_OFF, data.len() as u16);
    let _ = write_u16(data, RESERVED_OFF, 0);
}

/// Rebuilds a page from scratch out of a harvested cell list: writes the
/// header, the pointer array, and the cells packed from the page's tail
/// upward. Replaces in-place free-list maintenance with a full rewrite —
/// simpler to reason about and no less correct, since balance already
/// reconstructs every touched page (see `DESIGN.md`).
fn write_page(data: &mut [u8], flags: PageFlags, cells: &[CellRec], rchild: Option<Pgno>) {
    data.fill(0);
    data[FLAGS_OFF] = flags.bits();
    let _ = write_u16(data, NCELLS_OFF, cells.len() as u16);
    if let Some(rc) = rchild {
        let _ = write_u32(data, PAGE_HDR_LEN, rc);
    }

    let ptr_base = content_area_start(flags);
    let mut content_end = data.len();
    for (i, cell) in cells.iter().enumerate() {
        content_end -= cell.encoded.len();
        data[content_end..content_end + cell.encoded.len()].copy_from_slice(&cell.encoded);
        let _ = write_u16(data, ptr_base + i * PTR_SIZE, content_end as u16);
    }
    let _ = write_u16(data, CONTENT_START_OFF, content_end as u16);
}

/// Greedy bin-packing of harvested leaf cells into page-sized segments,
/// then a single backward merge if the tail segment would fall under
/// `min_budget` (`spec.md` §4.1 Balance step 3). This always produces
/// pages within `[min_budget, budget]` except possibly a lone final page
/// when there simply isn't enough data to split further.
fn pack_segments(cells: &[CellRec], budget: usize, min_budget: usize) -> Vec<(usize, usize)> {
    let sizes: Vec<usize> = cells.iter().map(|c| c.encoded.len() + PTR_SIZE).collect();
    pack_by_size(&sizes, budget, min_budget)
}

fn pack_by_size(sizes: &[usize], budget: usize, min_budget: usize) -> Vec<(usize, usize)> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut acc = 0usize;
    for (i, &sz) in sizes.iter().enumerate() {
        if acc > 0 && acc + sz > budget {
            segments.push((start, i));
            start = i;
            acc = 0;
        }
        acc += sz;
    }
    segments.push((start, sizes.len()));

    if segments.len() > 1 {
        let last_size: usize = sizes[segments.last().unwrap().0..segments.last().unwrap().1]
            .iter()
            .sum();
        if last_size < min_budget {
            let (p0, _) = segments[segments.len() - 2];
            let (_, p2) = segments[segments.len() - 1];
            segments.truncate(segments.len() - 2);
            let mid = p0 + (p2 - p0) / 2;
            let mid = mid.max(p0 + 1).min(p2 - 1).max(p0 + 1);
            segments.push((p0, mid));
            segments.push((mid, p2));
        }
    }
    segments
}

/// Same idea as `pack_segments`, but for interior pages: every element
/// except the ones at a segment boundary becomes a stored cell, while the
/// boundary element is consumed as a promoted divider (its `child` becomes
/// the new right-child of the segment to its left).
fn pack_interior_segments(
    cells: &[CellRec],
    final_rchild: Pgno,
    budget: usize,
    min_budget: usize,
) -> (Vec<(usize, usize)>, Vec<Pgno>) {
    let sizes: Vec<usize> = cells.iter().map(|c| c.encoded.len() + PTR_SIZE).collect();
    let raw_segments = pack_by_size(&sizes, budget, min_budget);

    // Convert raw contiguous segments into (stored-range, rchild) pairs:
    // a segment's last cell (except for the final segment) is promoted.
    let mut out_segments = Vec::with_capacity(raw_segments.len());
    let mut out_rchildren = Vec::with_capacity(raw_segments.len());
    for (i, &(s, e)) in raw_segments.iter().enumerate() {
        if i + 1 < raw_segments.len() {
            let stored_end = e.saturating_sub(1).max(s);
            let rchild = cells[stored_end].child.unwrap_or(final_rchild);
            out_segments.push((s, stored_end));
            out_rchildren.push(rchild);
        } else {
            out_segments.push((s, e));
            out_rchildren.push(final_rchild);
        }
    }
    (out_segments, out_rchildren)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pager::MemPager;

    fn small_tree() -> Btree<MemPager> {
        let pager = Rc::new(MemPager::new(256));
        Btree::open(pager, None, KeyLen::Variable, KeyLen::Variable, 4).unwrap()
    }

    #[test]
    fn open_creates_root_leaf() {
        let bt = small_tree();
        let buf = bt.fetch(bt.root_pgno()).unwrap();
        let data = buf.borrow();
        assert!(page_flags(&data).contains(PageFlags::ROOT | PageFlags::LEAF));
        assert_eq!(page_n_cells(&data), 0);
    }

    #[test]
    fn insert_and_seek_single_key() {
        let bt = small_tree();
        bt.insert(b"alpha", b"1").unwrap();
        let mut cursor = Cursor::new();
        bt.seek(&mut cursor, b"alpha").unwrap();
        assert!(cursor.found());
    }

    #[test]
    fn duplicate_key_rejected() {
        let bt = small_tree();
        bt.insert(b"k", b"v1").unwrap();
        let err = bt.insert(b"k", b"v2").unwrap_err();
        assert_eq!(err.code(), ErrorCode::Constraint);
    }

    #[test]
    fn keys_stay_ordered_after_inserts() {
        let bt = small_tree();
        for k in [b"m", b"a", b"z", b"c", b"t"] {
            bt.insert(k, b"x").unwrap();
        }
        for k in [b"m", b"a", b"z", b"c", b"t"] {
            let mut cursor = Cursor::new();
            bt.seek(&mut cursor, k).unwrap();
            assert!(cursor.found(), "missing key {:?}", k);
        }
    }

    /// S5 (`spec.md` §8): enough inserts to overflow the root leaf should
    /// grow the tree to two levels: an interior root with exactly one
    /// divider and a right child, over two leaves.
    #[test]
    fn root_split_grows_tree_by_one_level() {
        let pager = Rc::new(MemPager::new(128));
        let bt = Btree::open(pager, None, KeyLen::Variable, KeyLen::Variable, 4).unwrap();

        // Each cell is ~28 bytes on the wire; four of them overflow a leaf
        // sized for `max_leaf == 120` bytes.
        for i in 0..4u32 {
            let key = format!("k{:02}", i).into_bytes();
            let val = vec![0xABu8; 20];
            bt.insert(&key, &val).unwrap();
        }

        let root_buf = bt.fetch(bt.root_pgno()).unwrap();
        let root_data = root_buf.borrow();
        let flags = page_flags(&root_data);
        assert!(flags.contains(PageFlags::ROOT));
        assert!(!flags.contains(PageFlags::LEAF));
        assert_eq!(page_n_cells(&root_data), 1);

        let n = page_n_cells(&root_data);
        let divider = bt.cell_bytes(&root_data, flags, 0, n);
        let left_child = bt.decode_interior_child(divider).unwrap();
        let right_child = page_right_child(&root_data);
        drop(root_data);

        for child_pgno in [left_child, right_child] {
            let buf = bt.fetch(child_pgno).unwrap();
            let data = buf.borrow();
            assert!(page_flags(&data).contains(PageFlags::LEAF));
            assert!(page_n_cells(&data) > 0);
        }
    }

    #[test]
    fn overflow_payload_roundtrips() {
        let bt = small_tree();
        let big_val = vec![0x7Fu8; 500];
        bt.insert(b"bigkey", &big_val).unwrap();
        let mut cursor = Cursor::new();
        bt.seek(&mut cursor, b"bigkey").unwrap();
        assert!(cursor.found());
        let buf = bt.fetch(cursor.page).unwrap();
        let data = buf.borrow();
        let flags = page_flags(&data);
        let n = page_n_cells(&data);
        let cell = bt.cell_bytes(&data, flags, cursor.idx as usize, n);
        let (key, val) = bt.decode_leaf_payload(cell).unwrap();
        assert_eq!(key, b"bigkey");
        assert_eq!(val, big_val);
    }
}
