//! B+ tree internal node buffer view.

use std::marker::PhantomData;

use cairn_common::{BlockHandle, CairnError, Result};

use super::leaf::{FuseOutcome, LeafView};
use super::params::TreeParameters;
use super::schema::{FixedCodec, Schema};
use super::{CHILD_LEN, HEADER_LEN};

/// Typed view over an internal block: a degree header, `node_max` child
/// handle slots, then `node_max - 1` key slots. A node of degree `d` has
/// `d` live children and `d - 1` live separator keys; child `i` covers the
/// keys between separator `i - 1` (inclusive) and separator `i`
/// (exclusive).
pub struct NodeView<'a, S: Schema> {
    bytes: &'a mut [u8],
    params: TreeParameters,
    _schema: PhantomData<S>,
}

impl<'a, S: Schema> NodeView<'a, S> {
    /// Constructs a view over a block's bytes.
    pub fn new(bytes: &'a mut [u8], params: TreeParameters) -> Result<Self> {
        let node_max = params.node_max as usize;
        let required = HEADER_LEN + node_max * CHILD_LEN + (node_max - 1) * S::Key::ENCODED_LEN;
        if bytes.len() < required {
            return Err(CairnError::InvariantViolation(
                "node view over an undersized buffer",
            ));
        }
        Ok(Self {
            bytes,
            params,
            _schema: PhantomData,
        })
    }

    /// Number of children.
    pub fn degree(&self) -> usize {
        u64::from_le_bytes([
            self.bytes[0],
            self.bytes[1],
            self.bytes[2],
            self.bytes[3],
            self.bytes[4],
            self.bytes[5],
            self.bytes[6],
            self.bytes[7],
        ]) as usize
    }

    fn set_degree(&mut self, degree: usize) {
        self.bytes[..HEADER_LEN].copy_from_slice(&(degree as u64).to_le_bytes());
    }

    /// Number of live separator keys (`degree - 1`, or zero when empty).
    pub fn key_count(&self) -> usize {
        self.degree().saturating_sub(1)
    }

    fn child_offset(i: usize) -> usize {
        HEADER_LEN + i * CHILD_LEN
    }

    fn key_offset(&self, i: usize) -> usize {
        HEADER_LEN + self.params.node_max as usize * CHILD_LEN + i * S::Key::ENCODED_LEN
    }

    /// Returns the handle of child `i`.
    pub fn child(&self, i: usize) -> BlockHandle {
        debug_assert!(i < self.degree());
        let off = Self::child_offset(i);
        BlockHandle::from_le_bytes([
            self.bytes[off],
            self.bytes[off + 1],
            self.bytes[off + 2],
            self.bytes[off + 3],
            self.bytes[off + 4],
            self.bytes[off + 5],
            self.bytes[off + 6],
            self.bytes[off + 7],
        ])
    }

    fn set_child(&mut self, i: usize, handle: BlockHandle) {
        let off = Self::child_offset(i);
        self.bytes[off..off + CHILD_LEN].copy_from_slice(&handle.to_le_bytes());
    }

    /// Returns separator key `i`.
    pub fn key(&self, i: usize) -> S::Key {
        debug_assert!(i < self.key_count());
        let off = self.key_offset(i);
        S::Key::decode(&self.bytes[off..off + S::Key::ENCODED_LEN])
    }

    fn set_key(&mut self, i: usize, key: &S::Key) {
        let off = self.key_offset(i);
        key.encode(&mut self.bytes[off..off + S::Key::ENCODED_LEN]);
    }

    /// Resets the node to degree zero.
    pub fn clear(&mut self) {
        self.set_degree(0);
    }

    pub fn full(&self) -> bool {
        self.degree() == self.params.node_max as usize
    }

    pub fn underfull(&self) -> bool {
        self.degree() < self.params.node_min as usize
    }

    pub fn empty(&self) -> bool {
        self.degree() == 0
    }

    /// Initialises a freshly allocated node as the new root after a root
    /// split: degree 2, one separator, the two halves as children.
    pub fn new_root(&mut self, key: &S::Key, left: BlockHandle, right: BlockHandle) -> Result<()> {
        if !self.empty() {
            return Err(CairnError::InvariantViolation(
                "new_root on a non-empty node",
            ));
        }
        self.set_key(0, key);
        self.set_child(0, left);
        self.set_child(1, right);
        self.set_degree(2);
        Ok(())
    }

    /// Sets the single child of an empty node. Builder use.
    pub fn push_first_child(&mut self, handle: BlockHandle) -> Result<()> {
        if !self.empty() {
            return Err(CairnError::InvariantViolation(
                "push_first_child on a non-empty node",
            ));
        }
        self.set_child(0, handle);
        self.set_degree(1);
        Ok(())
    }

    /// Appends a separator and child at the right edge. Builder use.
    pub fn push_child(&mut self, key: &S::Key, handle: BlockHandle) -> Result<()> {
        if self.full() {
            return Err(CairnError::InvariantViolation("push_child on a full node"));
        }
        if self.empty() {
            return Err(CairnError::InvariantViolation("push_child on an empty node"));
        }
        let degree = self.degree();
        self.set_key(degree - 1, key);
        self.set_child(degree, handle);
        self.set_degree(degree + 1);
        Ok(())
    }

    /// Replaces child `i` with the pair `(left, right)` separated by `key`,
    /// shifting the entries to its right. The node must not be full.
    pub fn insert(
        &mut self,
        i: usize,
        key: &S::Key,
        left: BlockHandle,
        right: BlockHandle,
    ) -> Result<()> {
        if self.full() {
            return Err(CairnError::InvariantViolation("insert into a full node"));
        }
        if self.empty() || i >= self.degree() {
            return Err(CairnError::InvariantViolation(
                "insert at an out-of-range child index",
            ));
        }

        let degree = self.degree();
        let key_count = self.key_count();

        // Shift children [i+1, degree) and keys [i, key_count) right by one.
        let child_src = Self::child_offset(i + 1)..Self::child_offset(degree);
        self.bytes.copy_within(child_src, Self::child_offset(i + 2));
        let key_src = self.key_offset(i)..self.key_offset(key_count);
        self.bytes.copy_within(key_src, self.key_offset(i + 1));

        self.set_child(i, left);
        self.set_child(i + 1, right);
        self.set_key(i, key);
        self.set_degree(degree + 1);
        Ok(())
    }

    /// Splits this full node while inserting `(key, left, right)` at child
    /// index `i`. The lower half of the virtual entry sequence lands in
    /// `left_bytes`, the upper half in `right_bytes`, and the centre key is
    /// lifted and returned. `self` ends up cleared.
    pub fn split_insert(
        &mut self,
        i: usize,
        key: &S::Key,
        left: BlockHandle,
        right: BlockHandle,
        left_bytes: &mut [u8],
        right_bytes: &mut [u8],
    ) -> Result<S::Key> {
        if !self.full() {
            return Err(CairnError::InvariantViolation("split of a non-full node"));
        }
        if i >= self.degree() {
            return Err(CairnError::InvariantViolation(
                "split at an out-of-range child index",
            ));
        }

        let mut left_node = NodeView::<S>::new(left_bytes, self.params)?;
        let mut right_node = NodeView::<S>::new(right_bytes, self.params)?;
        if !left_node.empty() || !right_node.empty() {
            return Err(CairnError::InvariantViolation(
                "split into a non-empty node",
            ));
        }

        // The virtual sequence after the hypothetical insertion:
        // node_max + 1 children and node_max keys.
        let mut children: Vec<BlockHandle> = (0..self.degree()).map(|c| self.child(c)).collect();
        let mut keys: Vec<S::Key> = (0..self.key_count()).map(|k| self.key(k)).collect();
        keys.insert(i, *key);
        children[i] = left;
        children.insert(i + 1, right);

        let total_keys = keys.len();
        let mut input = 0;

        let mut out = 0;
        while input * 2 < total_keys {
            left_node.set_child(out, children[input]);
            left_node.set_key(out, &keys[input]);
            input += 1;
            out += 1;
        }
        left_node.set_child(out, children[input]);
        left_node.set_degree(out + 1);

        let mid_key = keys[input];
        input += 1;

        let mut out = 0;
        while input < total_keys {
            right_node.set_child(out, children[input]);
            right_node.set_key(out, &keys[input]);
            input += 1;
            out += 1;
        }
        right_node.set_child(out, children[input]);
        right_node.set_degree(out + 1);

        self.clear();
        Ok(mid_key)
    }

    /// Fuses the two adjacent leaf children around separator
    /// `right_index - 1`, whose blocks are in `left_bytes`/`right_bytes`.
    ///
    /// On a merge the separator and the right child are removed from this
    /// node; on a share the separator is replaced with the new mid key.
    pub fn fuse_leaves(
        &mut self,
        right_index: usize,
        left_bytes: &mut [u8],
        right_bytes: &mut [u8],
    ) -> Result<FuseOutcome<S::Key>> {
        self.check_right_index(right_index)?;

        let mut left = LeafView::<S>::new(left_bytes, self.params)?;
        let mut right = LeafView::<S>::new(right_bytes, self.params)?;

        match left.fuse_with(&mut right)? {
            FuseOutcome::Merged => {
                self.remove_entry(right_index);
                Ok(FuseOutcome::Merged)
            }
            FuseOutcome::Shared(mid_key) => {
                self.set_key(right_index - 1, &mid_key);
                Ok(FuseOutcome::Shared(mid_key))
            }
        }
    }

    /// Fuses the two adjacent internal-node children around separator
    /// `right_index - 1`.
    ///
    /// The children's entries and the separator are concatenated; if they
    /// fit one block everything lands in the left child and the separator
    /// is removed here, otherwise the sequence is split at the midpoint
    /// and the median key replaces the separator.
    pub fn fuse(
        &mut self,
        right_index: usize,
        left_bytes: &mut [u8],
        right_bytes: &mut [u8],
    ) -> Result<FuseOutcome<S::Key>> {
        self.check_right_index(right_index)?;

        let mut left = NodeView::<S>::new(left_bytes, self.params)?;
        let mut right = NodeView::<S>::new(right_bytes, self.params)?;

        let mut keys: Vec<S::Key> = (0..left.key_count()).map(|k| left.key(k)).collect();
        keys.push(self.key(right_index - 1));
        keys.extend((0..right.key_count()).map(|k| right.key(k)));

        let mut children: Vec<BlockHandle> = (0..left.degree()).map(|c| left.child(c)).collect();
        children.extend((0..right.degree()).map(|c| right.child(c)));

        if children.len() <= self.params.node_max as usize {
            left.store(&children, &keys);
            self.remove_entry(right_index);
            Ok(FuseOutcome::Merged)
        } else {
            let half = children.len() / 2;
            left.store(&children[..half], &keys[..half - 1]);
            let mid_key = keys[half - 1];
            self.set_key(right_index - 1, &mid_key);
            right.store(&children[half..], &keys[half..]);
            Ok(FuseOutcome::Shared(mid_key))
        }
    }

    fn check_right_index(&self, right_index: usize) -> Result<()> {
        if right_index == 0 || right_index >= self.degree() {
            return Err(CairnError::InvariantViolation(
                "fuse at an out-of-range child index",
            ));
        }
        Ok(())
    }

    /// Removes separator `right_index - 1` and child `right_index` after a
    /// merge, shifting the entries to their right one slot left.
    fn remove_entry(&mut self, right_index: usize) {
        let degree = self.degree();
        let key_count = self.key_count();

        let key_src = self.key_offset(right_index)..self.key_offset(key_count);
        self.bytes.copy_within(key_src, self.key_offset(right_index - 1));
        let child_src = Self::child_offset(right_index + 1)..Self::child_offset(degree);
        self.bytes
            .copy_within(child_src, Self::child_offset(right_index));

        self.set_degree(degree - 1);
    }

    /// Overwrites this node's live entries with the given children and
    /// separators; `keys` must be one shorter than `children`.
    fn store(&mut self, children: &[BlockHandle], keys: &[S::Key]) {
        debug_assert_eq!(keys.len() + 1, children.len());
        for (i, child) in children.iter().enumerate() {
            self.set_child(i, *child);
        }
        for (i, key) in keys.iter().enumerate() {
            self.set_key(i, key);
        }
        self.set_degree(children.len());
    }
}
