//! A vnode runtime's TMQ subscription scan engine, stream task executor,
//! and B-tree metadata index, extracted as standalone components.
//!
//! Each module owns one component: [`btree`] is the paged index core,
//! [`tmq`] serves resumable subscription scans over it, and [`stream`]
//! drives per-task continuous query execution. All three depend only on
//! the shared primitives in [`types`], [`error`], [`pager`], [`operator`],
//! [`sink`], [`config`], and [`log`] — never on each other's internals.

#![allow(dead_code)]

pub mod btree;
pub mod config;
pub mod encoding;
pub mod error;
pub mod log;
pub mod operator;
pub mod pager;
pub mod sink;
pub mod stream;
pub mod tmq;
pub mod types;

pub use error::{Error, ErrorCode, Result};
