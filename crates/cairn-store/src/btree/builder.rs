//! Efficient bottom-up B+ tree building from a sorted sequence.

use std::collections::VecDeque;

use tracing::debug;

use cairn_common::{BlockBuffer, BlockHandle, CairnError, Result};

use super::leaf::LeafView;
use super::node::NodeView;
use super::schema::Schema;
use super::tree::BTree;

enum BuilderState {
    /// No values have been pushed.
    Empty,
    /// Values have been pushed, but end() has not been called.
    Building,
    /// end() has been called.
    Built,
}

struct LayerEntry<K> {
    handle: BlockHandle,
    key: K,
}

/// Per-level deques of (handle, first-key) pairs: level 0 holds completed
/// leaves, level `i + 1` holds completed internal blocks covering level
/// `i`.
struct LayerOverview<K> {
    layers: Vec<VecDeque<LayerEntry<K>>>,
}

impl<K: Copy> LayerOverview<K> {
    fn new() -> Self {
        Self {
            layers: vec![VecDeque::new()],
        }
    }

    fn height(&self) -> usize {
        self.layers.len()
    }

    fn push_layer(&mut self) {
        self.layers.push(VecDeque::new());
    }

    fn layer_size(&self, level: usize) -> usize {
        self.layers[level].len()
    }

    fn front_key(&self, level: usize) -> Result<K> {
        self.layers[level]
            .front()
            .map(|entry| entry.key)
            .ok_or(CairnError::InvariantViolation("front_key on an empty layer"))
    }

    fn front_handle(&self, level: usize) -> Result<BlockHandle> {
        self.layers[level]
            .front()
            .map(|entry| entry.handle)
            .ok_or(CairnError::InvariantViolation(
                "front_handle on an empty layer",
            ))
    }

    fn push_block(&mut self, level: usize, key: K, handle: BlockHandle) -> Result<()> {
        if handle.is_bitmap() {
            return Err(CairnError::InvariantViolation(
                "zero handle pushed to a layer",
            ));
        }
        self.layers[level].push_back(LayerEntry { handle, key });
        Ok(())
    }

    fn pop_front(&mut self, level: usize) -> Result<()> {
        self.layers[level]
            .pop_front()
            .map(|_| ())
            .ok_or(CairnError::InvariantViolation("pop_front on an empty layer"))
    }
}

/// Builds a B+ tree from a sorted sequence with one write per block.
///
/// Push each value in key order, then call [`BTreeBuilder::end`]. Each
/// completed leaf joins level 0 of the layer overview; once a level holds
/// more than `node_min + node_max` fragments, `node_max` of them coalesce
/// into a parent block one level up. Coalescing any earlier could leave
/// the rightmost spine underfull. `end()` drains what remains, straddling
/// the last two blocks of each level so both stay above `node_min`.
///
/// Dropping a builder without calling `end()` leaks the blocks written so
/// far; the tree it was building stays empty.
pub struct BTreeBuilder<'a, S: Schema> {
    state: BuilderState,
    /// Destination tree to build.
    tree: &'a mut BTree<S>,
    /// Next leaf to push into the tree.
    leaf_buf: BlockBuffer,
    leaf_handle: BlockHandle,
    /// Key of the first value inserted into the current leaf.
    leaf_key: Option<S::Key>,
    /// Scratch buffer used while coalescing.
    block_buf: BlockBuffer,
    /// Completed tree fragments, one deque per level.
    layers: LayerOverview<S::Key>,
}

impl<'a, S: Schema> BTreeBuilder<'a, S> {
    /// Creates a builder writing into `tree`, which must be open, writable
    /// and empty.
    pub fn new(tree: &'a mut BTree<S>) -> Result<Self> {
        if !tree.collection.is_open() {
            return Err(CairnError::NotOpen);
        }
        if tree.root.is_some() {
            return Err(CairnError::InvariantViolation(
                "builder requires an empty tree",
            ));
        }

        let mut leaf_buf = BlockBuffer::new();
        let leaf_handle = tree.collection.get_free_block_buffer(&mut leaf_buf)?;

        Ok(Self {
            state: BuilderState::Empty,
            tree,
            leaf_buf,
            leaf_handle,
            leaf_key: None,
            block_buf: BlockBuffer::new(),
            layers: LayerOverview::new(),
        })
    }

    /// Appends the next value of the sorted sequence.
    pub fn push(&mut self, value: S::Value) -> Result<()> {
        if matches!(self.state, BuilderState::Built) {
            return Err(CairnError::BuilderSealed("push after end"));
        }
        self.state = BuilderState::Building;

        let leaf_full = {
            LeafView::<S>::new(self.leaf_buf.bytes_mut(), self.tree.params)?.full()
        };
        if leaf_full {
            self.flush_leaf()?;
            self.new_leaf()?;
        }

        {
            let mut leaf = LeafView::<S>::new(self.leaf_buf.bytes_mut(), self.tree.params)?;
            if leaf.empty() {
                self.leaf_key = Some(S::key_of(&value));
            }
            leaf.insert(value)?;
        }
        Ok(())
    }

    /// Seals the builder and hands the finished tree its root.
    pub fn end(&mut self) -> Result<()> {
        match self.state {
            BuilderState::Built => return Err(CairnError::BuilderSealed("end after end")),
            BuilderState::Empty => {
                // Nothing was pushed; release the pre-allocated leaf so an
                // empty build leaks no blocks.
                self.tree.collection.free_block(self.leaf_handle)?;
                self.state = BuilderState::Built;
                return Ok(());
            }
            BuilderState::Building => {}
        }

        let leaf_empty = {
            LeafView::<S>::new(self.leaf_buf.bytes_mut(), self.tree.params)?.empty()
        };
        if !leaf_empty {
            self.flush_leaf()?;
        }

        let mut level = 0;
        while level < self.layers.height() {
            if level == self.layers.height() - 1 && self.layers.layer_size(level) == 1 {
                break;
            }
            self.finish_layer(level)?;
            level += 1;
        }

        let top = self.layers.height() - 1;
        let root = self.layers.front_handle(top)?;
        self.tree.set_root(root, top);
        self.state = BuilderState::Built;
        Ok(())
    }

    /// Writes the current leaf, records it in level 0, and coalesces.
    fn flush_leaf(&mut self) -> Result<()> {
        let key = self.leaf_key.take().ok_or(CairnError::InvariantViolation(
            "flush of a leaf with no first key",
        ))?;
        self.layers.push_block(0, key, self.leaf_handle)?;
        self.tree.collection.write_block(&self.leaf_buf)?;
        self.reduce_layer(0)
    }

    fn new_leaf(&mut self) -> Result<()> {
        // The fresh buffer is zeroed, so the leaf starts at degree 0.
        self.leaf_handle = self.tree.collection.get_free_block_buffer(&mut self.leaf_buf)?;
        Ok(())
    }

    /// While a level holds more than `node_min + node_max` fragments,
    /// drains `node_max` of them into parent blocks, then recurses upward.
    fn reduce_layer(&mut self, level: usize) -> Result<()> {
        let min = self.tree.params.node_min as usize;
        let max = self.tree.params.node_max as usize;

        if self.layers.layer_size(level) > min + max {
            while self.layers.layer_size(level) > min + max {
                self.coalesce(max, level + 1)?;
            }
            self.reduce_layer(level + 1)?;
        }
        Ok(())
    }

    /// Drains a level completely at end(). If more than `node_max`
    /// fragments remain after bulk draining, the next-to-last block takes
    /// all but `node_min` of them so the last two blocks straddle the
    /// boundary with at least `node_min` children each.
    fn finish_layer(&mut self, level: usize) -> Result<()> {
        let min = self.tree.params.node_min as usize;
        let max = self.tree.params.node_max as usize;

        while self.layers.layer_size(level) > min + max {
            self.coalesce(max, level + 1)?;
        }
        if self.layers.layer_size(level) > max {
            let children = self.layers.layer_size(level) - min;
            self.coalesce(children, level + 1)?;
        }
        if self.layers.layer_size(level) > 0 {
            let children = self.layers.layer_size(level);
            self.coalesce(children, level + 1)?;
        }
        Ok(())
    }

    /// Drains `children` fragments from `level - 1` into one fresh block
    /// appended to `level`.
    fn coalesce(&mut self, children: usize, level: usize) -> Result<()> {
        if level == 0 || level > self.layers.height() {
            return Err(CairnError::InvariantViolation(
                "coalesce into an out-of-range layer",
            ));
        }
        if level == self.layers.height() {
            self.layers.push_layer();
        }

        let handle = self
            .tree
            .collection
            .get_free_block_buffer(&mut self.block_buf)?;
        debug!(block = handle.id(), level, children, "coalescing fragments");

        let first_key = self.layers.front_key(level - 1)?;
        self.layers.push_block(level, first_key, handle)?;

        {
            let mut node = NodeView::<S>::new(self.block_buf.bytes_mut(), self.tree.params)?;
            for i in 0..children {
                let key = self.layers.front_key(level - 1)?;
                let child = self.layers.front_handle(level - 1)?;
                if i == 0 {
                    node.push_first_child(child)?;
                } else {
                    node.push_child(&key, child)?;
                }
                self.layers.pop_front(level - 1)?;
            }
        }
        self.tree.collection.write_block(&self.block_buf)
    }
}
