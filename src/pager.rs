//! The Pager capability consumed by the B-Tree Index Core.
//!
//! `spec.md` §1 puts the page cache / pager out of scope: "a paged block
//! store is assumed." This module defines the narrow surface the B-tree
//! actually calls (`spec.md` §6) as a trait, plus a small in-memory
//! implementation used by tests and by embedders that don't need
//! durability. Modeled after `storage::pager::Pager`'s `get`/`write` split
//! in the teacher, minus journaling, WAL, locking, and savepoints — all of
//! which belong to the real pager, not to this crate.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{Error, ErrorCode, Result};
use crate::types::Pgno;

/// A single page's bytes, fixed at the pager's page size.
pub type PageBuf = Rc<RefCell<Vec<u8>>>;

/// An initializer invoked once, right after a page's bytes are brought into
/// memory (freshly zeroed for `new_page`, or loaded for `fetch_page`).
pub trait PageInit {
    fn init(&mut self, pgno: Pgno, data: &mut [u8]) -> Result<()>;
}

impl<F: FnMut(Pgno, &mut [u8]) -> Result<()>> PageInit for F {
    fn init(&mut self, pgno: Pgno, data: &mut [u8]) -> Result<()> {
        self(pgno, data)
    }
}

/// The page store the B-tree is layered over.
pub trait Pager {
    fn page_size(&self) -> u32;

    /// Bring an existing page into memory, running `init` the first time
    /// it's faulted in this session.
    fn fetch_page(&self, pgno: Pgno, init: &mut dyn PageInit) -> Result<PageBuf>;

    /// Allocate a fresh page, zero it, run `init`, and return its number
    /// and bytes.
    fn new_page(&self, init: &mut dyn PageInit) -> Result<(Pgno, PageBuf)>;

    /// Release an allocated page back to the pager's free list.
    fn free_page(&self, pgno: Pgno) -> Result<()>;
}

/// An in-memory pager: no journaling, no durability, one page table behind
/// a `RefCell`. Sufficient for the B-tree's own tests and for embedders
/// that only need the metadata index to live for the process lifetime.
pub struct MemPager {
    page_size: u32,
    pages: RefCell<HashMap<Pgno, PageBuf>>,
    next_pgno: RefCell<Pgno>,
    free_list: RefCell<Vec<Pgno>>,
}

impl MemPager {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            pages: RefCell::new(HashMap::new()),
            next_pgno: RefCell::new(1),
            free_list: RefCell::new(Vec::new()),
        }
    }
}

impl Pager for MemPager {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn fetch_page(&self, pgno: Pgno, init: &mut dyn PageInit) -> Result<PageBuf> {
        if let Some(existing) = self.pages.borrow().get(&pgno) {
            return Ok(existing.clone());
        }
        let mut data = vec![0u8; self.page_size as usize];
        init.init(pgno, &mut data)?;
        let buf = Rc::new(RefCell::new(data));
        self.pages.borrow_mut().insert(pgno, buf.clone());
        Ok(buf)
    }

    fn new_page(&self, init: &mut dyn PageInit) -> Result<(Pgno, PageBuf)> {
        let pgno = if let Some(reused) = self.free_list.borrow_mut().pop() {
            reused
        } else {
            let mut next = self.next_pgno.borrow_mut();
            let pgno = *next;
            *next += 1;
            pgno
        };
        let mut data = vec![0u8; self.page_size as usize];
        init.init(pgno, &mut data)?;
        let buf = Rc::new(RefCell::new(data));
        self.pages.borrow_mut().insert(pgno, buf.clone());
        Ok((pgno, buf))
    }

    fn free_page(&self, pgno: Pgno) -> Result<()> {
        if self.pages.borrow_mut().remove(&pgno).is_none() {
            return Err(Error::new(ErrorCode::Corrupt));
        }
        self.free_list.borrow_mut().push(pgno);
        Ok(())
    }
}
