//! Storage engine for Cairn.
//!
//! This crate provides:
//! - Block file accessor for fixed-size block I/O
//! - Free-space bitmap for block allocation
//! - Block collection coordinating the file and the bitmap
//! - External-memory B+ tree over a block collection

mod bitmap;
mod btree;
mod collection;
mod file;

pub use bitmap::FreeSpaceBitmap;
pub use btree::{
    BTree, BTreeBuilder, FixedCodec, FuseOutcome, IdentitySchema, LeafView, NodeView, Schema,
    TreeParameters, TreePath,
};
pub use collection::BlockCollection;
pub use file::BlockFile;
