//! Branching and leaf parameters for the B+ tree.

use serde::{Deserialize, Serialize};

use cairn_common::{CairnError, Result};

use super::schema::{FixedCodec, Schema};
use super::{CHILD_LEN, HEADER_LEN};

/// Degree bounds for internal nodes and leaves.
///
/// Except for the root, every internal node has between `node_min` and
/// `node_max` children and every leaf between `leaf_min` and `leaf_max`
/// values. The root leaf may hold any number of values down to zero; the
/// root internal node has at least two children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeParameters {
    pub node_min: u64,
    pub node_max: u64,
    pub leaf_min: u64,
    pub leaf_max: u64,
}

impl TreeParameters {
    /// Creates validated parameters.
    pub fn new(node_min: u64, node_max: u64, leaf_min: u64, leaf_max: u64) -> Result<Self> {
        let params = Self {
            node_min,
            node_max,
            leaf_min,
            leaf_max,
        };
        params.validate()?;
        Ok(params)
    }

    /// Checks the degree constraints:
    /// `node_min >= 2`, `node_max >= 2 * node_min - 1`, and likewise for
    /// the leaf bounds.
    pub fn validate(&self) -> Result<()> {
        let ok = self.node_min >= 2
            && self.node_max >= 2 * self.node_min - 1
            && self.leaf_min >= 2
            && self.leaf_max >= 2 * self.leaf_min - 1;
        if ok {
            Ok(())
        } else {
            Err(self.as_error())
        }
    }

    /// Derives the default parameters for a schema and block size: the
    /// largest fanouts that fit a block, with lower bounds at roughly a
    /// quarter of the upper bounds.
    pub fn default_for<S: Schema>(block_size: usize) -> Result<Self> {
        let node_max = node_capacity::<S>(block_size) as u64;
        let leaf_max = leaf_capacity::<S>(block_size) as u64;
        let params = Self {
            node_min: ((node_max + 3) / 4).max(2),
            node_max,
            leaf_min: ((leaf_max + 3) / 4).max(2),
            leaf_max,
        };
        params.validate()?;
        Ok(params)
    }

    /// Checks that blocks laid out under these parameters fit `block_size`.
    pub fn check_capacity<S: Schema>(&self, block_size: usize) -> Result<()> {
        if self.node_max as usize <= node_capacity::<S>(block_size)
            && self.leaf_max as usize <= leaf_capacity::<S>(block_size)
        {
            Ok(())
        } else {
            Err(self.as_error())
        }
    }

    fn as_error(&self) -> CairnError {
        CairnError::BadParameters {
            node_min: self.node_min,
            node_max: self.node_max,
            leaf_min: self.leaf_min,
            leaf_max: self.leaf_max,
        }
    }
}

/// Maximum children of an internal block: one more child slot than key
/// slots, so one child is accounted for separately.
pub(crate) fn node_capacity<S: Schema>(block_size: usize) -> usize {
    (block_size - HEADER_LEN - CHILD_LEN) / (CHILD_LEN + S::Key::ENCODED_LEN)
}

/// Maximum values of a leaf block.
pub(crate) fn leaf_capacity<S: Schema>(block_size: usize) -> usize {
    (block_size - HEADER_LEN) / S::Value::ENCODED_LEN
}
