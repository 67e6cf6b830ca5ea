//! B+ tree driver: point operations and the in-order dump.

use std::cmp::Ordering;
use std::marker::PhantomData;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::trace;

use cairn_common::{BlockBuffer, BlockHandle, CairnError, Result, StoreConfig};

use crate::collection::BlockCollection;

use super::leaf::{FuseOutcome, LeafView};
use super::node::NodeView;
use super::params::TreeParameters;
use super::path::TreePath;
use super::schema::Schema;

/// External-memory B+ tree over a block collection.
///
/// The root handle and the height live in memory only; the collection file
/// is not self-describing. A caller that needs to reopen a tree later must
/// persist `root()` and `height()` itself and hand them back through
/// [`BTree::open_at`].
///
/// `height == 0` means the root block is a leaf; otherwise the root is an
/// internal node and all leaves sit at depth `height`. An empty tree has
/// no root block at all; the first insert materialises it.
pub struct BTree<S: Schema> {
    pub(crate) collection: BlockCollection,
    pub(crate) root: Option<BlockHandle>,
    pub(crate) height: usize,
    pub(crate) params: TreeParameters,
    temp: Option<tempfile::TempPath>,
    _schema: PhantomData<S>,
}

impl<S: Schema> BTree<S> {
    /// Opens a tree over the collection file at `path`, creating the file
    /// when opened writable. The tree starts empty; use [`BTree::open_at`]
    /// to re-attach persisted state.
    pub fn open(path: impl AsRef<Path>, writable: bool, config: StoreConfig) -> Result<Self> {
        let params = TreeParameters::default_for::<S>(config.block_size)?;
        let collection = BlockCollection::open(path, writable, config)?;
        Ok(Self {
            collection,
            root: None,
            height: 0,
            params,
            temp: None,
            _schema: PhantomData,
        })
    }

    /// Opens a tree whose parameters, root handle and height the caller
    /// persisted after a previous session.
    pub fn open_at(
        path: impl AsRef<Path>,
        writable: bool,
        config: StoreConfig,
        params: TreeParameters,
        root: Option<BlockHandle>,
        height: usize,
    ) -> Result<Self> {
        params.validate()?;
        params.check_capacity::<S>(config.block_size)?;
        let collection = BlockCollection::open(path, writable, config)?;
        Ok(Self {
            collection,
            root,
            height,
            params,
            temp: None,
            _schema: PhantomData,
        })
    }

    /// Opens a scratch tree over a temporary file that is removed when the
    /// tree is dropped. Scratch trees skip fsync.
    pub fn anonymous() -> Result<Self> {
        let temp = NamedTempFile::new()?.into_temp_path();
        let config = StoreConfig {
            fsync_enabled: false,
            ..StoreConfig::default()
        };
        let mut tree = Self::open(&temp, true, config)?;
        tree.temp = Some(temp);
        Ok(tree)
    }

    /// Replaces the degree parameters. Only allowed while the tree is
    /// empty; a failed validation leaves the previous parameters in place.
    pub fn set_parameters(&mut self, params: TreeParameters) -> Result<()> {
        if self.root.is_some() {
            return Err(CairnError::InvariantViolation(
                "parameters change on a non-empty tree",
            ));
        }
        params.validate()?;
        params.check_capacity::<S>(self.collection.block_size())?;
        self.params = params;
        Ok(())
    }

    pub fn parameters(&self) -> TreeParameters {
        self.params
    }

    /// Returns the root block handle, or None while the tree is empty.
    pub fn root(&self) -> Option<BlockHandle> {
        self.root
    }

    /// Depth of the leaves below the root; 0 when the root is a leaf.
    pub fn height(&self) -> usize {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Returns the underlying block collection.
    pub fn collection(&self) -> &BlockCollection {
        &self.collection
    }

    /// Closes the underlying collection. Idempotent; every later operation
    /// on this tree fails with NotOpen.
    pub fn close(&mut self) -> Result<()> {
        self.collection.close()
    }

    pub(crate) fn set_root(&mut self, root: BlockHandle, height: usize) {
        self.root = Some(root);
        self.height = height;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.collection.is_open() {
            Ok(())
        } else {
            Err(CairnError::NotOpen)
        }
    }

    /// Child slot to follow for `key`: the first whose separator is
    /// greater than the key.
    fn child_index_for(node: &NodeView<'_, S>, key: &S::Key) -> usize {
        let key_count = node.key_count();
        let mut i = 0;
        while i < key_count && S::compare(key, &node.key(i)) != Ordering::Less {
            i += 1;
        }
        i
    }

    /// Walks from `root` down to the leaf covering `key`, leaving the leaf
    /// block in `buf` and recording the internal levels in `path`.
    fn descend(
        &self,
        root: BlockHandle,
        key: &S::Key,
        buf: &mut BlockBuffer,
        mut path: Option<&mut TreePath>,
    ) -> Result<BlockHandle> {
        let mut current = root;
        self.collection.read_block(current, buf)?;

        for _ in 0..self.height {
            let (child_index, child) = {
                let node = NodeView::<S>::new(buf.bytes_mut(), self.params)?;
                let child_index = Self::child_index_for(&node, key);
                (child_index, node.child(child_index))
            };
            if child.is_bitmap() {
                return Err(CairnError::InvariantViolation(
                    "zero child handle in an internal node",
                ));
            }
            if let Some(path) = path.as_deref_mut() {
                path.follow(current, child_index);
            }
            trace!(block = current.id(), child = child.id(), "descend");
            current = child;
            self.collection.read_block(current, buf)?;
        }

        Ok(current)
    }

    /// Inserts a value.
    ///
    /// Writes are ordered so the bitmap never points at an uninitialised
    /// block: on a split both new children are written before the parent
    /// is updated, and discarded blocks are freed last.
    pub fn insert(&mut self, value: S::Value) -> Result<()> {
        self.ensure_open()?;

        let key = S::key_of(&value);
        let mut buf = BlockBuffer::new();
        let mut path = TreePath::new();

        let leaf_handle = match self.root {
            Some(root) => self.descend(root, &key, &mut buf, Some(&mut path))?,
            None => {
                // Lazily materialise the root as an empty leaf.
                let handle = self.collection.get_free_block_buffer(&mut buf)?;
                self.root = Some(handle);
                self.height = 0;
                handle
            }
        };

        let leaf_full = { LeafView::<S>::new(buf.bytes_mut(), self.params)?.full() };
        if !leaf_full {
            {
                let mut leaf = LeafView::<S>::new(buf.bytes_mut(), self.params)?;
                leaf.insert(value)?;
            }
            return self.collection.write_block(&buf);
        }

        // Split the leaf and propagate up the recorded path.
        let mut right_buf = BlockBuffer::new();
        let mut right_handle = self.collection.get_free_block_buffer(&mut right_buf)?;
        let mut separator = {
            let mut leaf = LeafView::<S>::new(buf.bytes_mut(), self.params)?;
            let mut right = LeafView::<S>::new(right_buf.bytes_mut(), self.params)?;
            leaf.split_insert(value, &mut right)?
        };
        self.collection.write_block(&buf)?;
        self.collection.write_block(&right_buf)?;
        let mut left_handle = leaf_handle;

        loop {
            let Some((parent_handle, child_index)) = path.current() else {
                // The root itself split: grow the tree by one level.
                let mut root_buf = BlockBuffer::new();
                let new_root = self.collection.get_free_block_buffer(&mut root_buf)?;
                {
                    let mut node = NodeView::<S>::new(root_buf.bytes_mut(), self.params)?;
                    node.new_root(&separator, left_handle, right_handle)?;
                }
                self.collection.write_block(&root_buf)?;
                self.root = Some(new_root);
                self.height += 1;
                return Ok(());
            };
            path.parent();

            self.collection.read_block(parent_handle, &mut buf)?;
            let node_full = { NodeView::<S>::new(buf.bytes_mut(), self.params)?.full() };
            if !node_full {
                {
                    let mut node = NodeView::<S>::new(buf.bytes_mut(), self.params)?;
                    node.insert(child_index, &separator, left_handle, right_handle)?;
                }
                return self.collection.write_block(&buf);
            }

            // The parent is full too: split it into two fresh siblings and
            // discard the old block.
            let mut left_buf = BlockBuffer::new();
            let mut split_right_buf = BlockBuffer::new();
            let new_left = self.collection.get_free_block_buffer(&mut left_buf)?;
            let new_right = self.collection.get_free_block_buffer(&mut split_right_buf)?;
            separator = {
                let mut node = NodeView::<S>::new(buf.bytes_mut(), self.params)?;
                node.split_insert(
                    child_index,
                    &separator,
                    left_handle,
                    right_handle,
                    left_buf.bytes_mut(),
                    split_right_buf.bytes_mut(),
                )?
            };
            self.collection.write_block(&left_buf)?;
            self.collection.write_block(&split_right_buf)?;
            self.collection.free_block(parent_handle)?;
            left_handle = new_left;
            right_handle = new_right;
        }
    }

    /// Erases the value with the given key.
    ///
    /// An underfull leaf is fused with a sibling; merges can make the
    /// parent underfull in turn, so fusing walks back up the path. A root
    /// node left with a single child is demoted, shrinking the tree by one
    /// level.
    pub fn erase(&mut self, key: &S::Key) -> Result<()> {
        self.ensure_open()?;
        let root = self.root.ok_or(CairnError::KeyNotFound)?;

        let mut buf = BlockBuffer::new();
        let mut path = TreePath::new();
        self.descend(root, key, &mut buf, Some(&mut path))?;

        let leaf_underfull = {
            let mut leaf = LeafView::<S>::new(buf.bytes_mut(), self.params)?;
            leaf.erase(key)?;
            leaf.underfull()
        };
        self.collection.write_block(&buf)?;

        if !leaf_underfull || path.is_empty() {
            return Ok(());
        }

        let mut parent_buf = BlockBuffer::new();
        let mut left_buf = BlockBuffer::new();
        let mut right_buf = BlockBuffer::new();
        let mut leaf_level = true;

        loop {
            let (parent_handle, child_index) = match path.current() {
                Some(component) => component,
                None => return Ok(()),
            };
            path.parent();
            self.collection.read_block(parent_handle, &mut parent_buf)?;

            // On underflow at child 0, fuse with child 1; otherwise with
            // the left neighbour.
            let right_index = child_index.max(1);
            let (left_handle, right_handle) = {
                let parent = NodeView::<S>::new(parent_buf.bytes_mut(), self.params)?;
                (parent.child(right_index - 1), parent.child(right_index))
            };
            self.collection.read_block(left_handle, &mut left_buf)?;
            self.collection.read_block(right_handle, &mut right_buf)?;

            let outcome = {
                let mut parent = NodeView::<S>::new(parent_buf.bytes_mut(), self.params)?;
                if leaf_level {
                    parent.fuse_leaves(right_index, left_buf.bytes_mut(), right_buf.bytes_mut())?
                } else {
                    parent.fuse(right_index, left_buf.bytes_mut(), right_buf.bytes_mut())?
                }
            };

            match outcome {
                FuseOutcome::Shared(_) => {
                    self.collection.write_block(&left_buf)?;
                    self.collection.write_block(&right_buf)?;
                    self.collection.write_block(&parent_buf)?;
                    return Ok(());
                }
                FuseOutcome::Merged => {
                    self.collection.write_block(&left_buf)?;
                    self.collection.write_block(&parent_buf)?;
                    self.collection.free_block(right_handle)?;
                }
            }

            let (parent_degree, parent_underfull, only_child) = {
                let parent = NodeView::<S>::new(parent_buf.bytes_mut(), self.params)?;
                (parent.degree(), parent.underfull(), parent.child(0))
            };

            if path.is_empty() {
                // The parent is the root; demote it if the merge left it
                // with a single child.
                if parent_degree == 1 {
                    self.root = Some(only_child);
                    self.height -= 1;
                    self.collection.free_block(parent_handle)?;
                }
                return Ok(());
            }
            if !parent_underfull {
                return Ok(());
            }
            leaf_level = false;
        }
    }

    /// Returns 1 if a value with this key is stored, 0 otherwise.
    pub fn count(&self, key: &S::Key) -> Result<usize> {
        self.ensure_open()?;
        let Some(root) = self.root else {
            return Ok(0);
        };
        let mut buf = BlockBuffer::new();
        self.descend(root, key, &mut buf, None)?;
        let leaf = LeafView::<S>::new(buf.bytes_mut(), self.params)?;
        Ok(leaf.count(key))
    }

    /// Looks up the value with the given key.
    pub fn try_find(&self, key: &S::Key) -> Result<Option<S::Value>> {
        self.ensure_open()?;
        let Some(root) = self.root else {
            return Ok(None);
        };
        let mut buf = BlockBuffer::new();
        self.descend(root, key, &mut buf, None)?;
        let leaf = LeafView::<S>::new(buf.bytes_mut(), self.params)?;
        Ok(leaf.index_of(key).map(|i| leaf.value(i)))
    }

    /// Looks up the value with the given key, failing when absent.
    pub fn find(&self, key: &S::Key) -> Result<S::Value> {
        self.try_find(key)?.ok_or(CairnError::ValueNotFound)
    }

    /// Emits every stored value into `sink` in non-decreasing key order.
    /// Leaves are unordered on disk, so each one is sorted at emit time.
    pub fn in_order_dump<F: FnMut(S::Value)>(&self, mut sink: F) -> Result<()> {
        self.ensure_open()?;
        match self.root {
            Some(root) => self.dump_block(root, 0, &mut sink),
            None => Ok(()),
        }
    }

    fn dump_block<F: FnMut(S::Value)>(
        &self,
        handle: BlockHandle,
        depth: usize,
        sink: &mut F,
    ) -> Result<()> {
        let mut buf = BlockBuffer::new();
        self.collection.read_block(handle, &mut buf)?;

        if depth == self.height {
            let leaf = LeafView::<S>::new(buf.bytes_mut(), self.params)?;
            let mut values = leaf.values();
            values.sort_by(|a, b| S::compare(&S::key_of(a), &S::key_of(b)));
            for value in values {
                sink(value);
            }
            return Ok(());
        }

        let children: Vec<BlockHandle> = {
            let node = NodeView::<S>::new(buf.bytes_mut(), self.params)?;
            (0..node.degree()).map(|i| node.child(i)).collect()
        };
        for child in children {
            self.dump_block(child, depth + 1, sink)?;
        }
        Ok(())
    }

    /// Returns every block handle reachable from the root, ascending.
    /// Together with [`BlockCollection::allocated_blocks`] this allows an
    /// fsck-style leak check: the allocated set should be exactly the
    /// reachable set plus the bitmap block.
    pub fn reachable_blocks(&self) -> Result<Vec<BlockHandle>> {
        self.ensure_open()?;
        let mut blocks = Vec::new();
        if let Some(root) = self.root {
            self.collect_blocks(root, 0, &mut blocks)?;
        }
        blocks.sort_unstable();
        Ok(blocks)
    }

    fn collect_blocks(
        &self,
        handle: BlockHandle,
        depth: usize,
        out: &mut Vec<BlockHandle>,
    ) -> Result<()> {
        out.push(handle);
        if depth == self.height {
            return Ok(());
        }

        let mut buf = BlockBuffer::new();
        self.collection.read_block(handle, &mut buf)?;
        let children: Vec<BlockHandle> = {
            let node = NodeView::<S>::new(buf.bytes_mut(), self.params)?;
            (0..node.degree()).map(|i| node.child(i)).collect()
        };
        for child in children {
            self.collect_blocks(child, depth + 1, out)?;
        }
        Ok(())
    }
}
