//! B+ tree leaf buffer view.

use std::cmp::Ordering;
use std::marker::PhantomData;

use cairn_common::{CairnError, Result};

use super::params::TreeParameters;
use super::schema::{FixedCodec, Schema};
use super::HEADER_LEN;

/// Result of fusing two sibling blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuseOutcome<K> {
    /// All of the right sibling was moved into the left; the right block
    /// is no longer in use.
    Merged,
    /// The siblings rebalanced; the payload is the new lowest key of the
    /// right sibling.
    Shared(K),
}

/// Typed view over a leaf block: a degree header followed by `leaf_max`
/// fixed-size value slots, of which the first `degree` are live. Values
/// are kept in insertion order, not sorted.
///
/// The view does not own memory; mutating it dirties the underlying
/// buffer, which the caller is responsible for writing back.
pub struct LeafView<'a, S: Schema> {
    bytes: &'a mut [u8],
    params: TreeParameters,
    _schema: PhantomData<S>,
}

impl<'a, S: Schema> LeafView<'a, S> {
    /// Constructs a view over a block's bytes.
    pub fn new(bytes: &'a mut [u8], params: TreeParameters) -> Result<Self> {
        let required = HEADER_LEN + params.leaf_max as usize * S::Value::ENCODED_LEN;
        if bytes.len() < required {
            return Err(CairnError::InvariantViolation(
                "leaf view over an undersized buffer",
            ));
        }
        Ok(Self {
            bytes,
            params,
            _schema: PhantomData,
        })
    }

    /// Number of stored values.
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

    fn slot(i: usize) -> std::ops::Range<usize> {
        let start = HEADER_LEN + i * S::Value::ENCODED_LEN;
        start..start + S::Value::ENCODED_LEN
    }

    /// Decodes the value in slot `i`.
    pub fn value(&self, i: usize) -> S::Value {
        debug_assert!(i < self.degree());
        S::Value::decode(&self.bytes[Self::slot(i)])
    }

    fn set_value(&mut self, i: usize, value: &S::Value) {
        value.encode(&mut self.bytes[Self::slot(i)]);
    }

    /// Decodes all live values in slot order.
    pub fn values(&self) -> Vec<S::Value> {
        (0..self.degree()).map(|i| self.value(i)).collect()
    }

    fn store_values(&mut self, values: &[S::Value]) {
        for (i, v) in values.iter().enumerate() {
            self.set_value(i, v);
        }
        self.set_degree(values.len());
    }

    /// Resets the leaf to degree zero.
    pub fn clear(&mut self) {
        self.set_degree(0);
    }

    pub fn full(&self) -> bool {
        self.degree() == self.params.leaf_max as usize
    }

    pub fn underfull(&self) -> bool {
        self.degree() < self.params.leaf_min as usize
    }

    pub fn empty(&self) -> bool {
        self.degree() == 0
    }

    /// Returns the slot of the first value whose key equals `key`, by
    /// linear scan.
    pub fn index_of(&self, key: &S::Key) -> Option<usize> {
        (0..self.degree()).find(|&i| {
            let k = S::key_of(&self.value(i));
            S::compare(&k, key) == Ordering::Equal
        })
    }

    /// Returns 1 if `key` is present, 0 otherwise.
    pub fn count(&self, key: &S::Key) -> usize {
        usize::from(self.index_of(key).is_some())
    }

    /// Appends a value. The leaf must not be full.
    pub fn insert(&mut self, value: S::Value) -> Result<()> {
        if self.full() {
            return Err(CairnError::InvariantViolation("insert into a full leaf"));
        }
        let degree = self.degree();
        self.set_value(degree, &value);
        self.set_degree(degree + 1);
        Ok(())
    }

    /// Removes the value with the given key by overwriting its slot with
    /// the last slot.
    pub fn erase(&mut self, key: &S::Key) -> Result<()> {
        let i = self.index_of(key).ok_or(CairnError::KeyNotFound)?;
        let degree = self.degree();
        if i != degree - 1 {
            let last = self.value(degree - 1);
            self.set_value(i, &last);
        }
        self.set_degree(degree - 1);
        Ok(())
    }

    /// Splits this full leaf plus `value` across `self` and the empty leaf
    /// `right`, and returns the minimum key of the right leaf.
    ///
    /// The `leaf_max + 1` values are partitioned three ways against the
    /// inserted key; the side of the split point the insertion falls on
    /// decides whether the left leaf keeps `leaf_max / 2` or
    /// `leaf_max / 2 + 1` values.
    pub fn split_insert(
        &mut self,
        value: S::Value,
        right: &mut LeafView<'_, S>,
    ) -> Result<S::Key> {
        if !self.full() {
            return Err(CairnError::InvariantViolation("split of a non-full leaf"));
        }
        if !right.empty() {
            return Err(CairnError::InvariantViolation("split into a non-empty leaf"));
        }

        let key = S::key_of(&value);
        let by_key = |a: &S::Value, b: &S::Value| S::compare(&S::key_of(a), &S::key_of(b));

        let mut lowers = Vec::new();
        let mut uppers = Vec::new();
        for v in self.values() {
            if S::compare(&S::key_of(&v), &key) == Ordering::Less {
                lowers.push(v);
            } else {
                uppers.push(v);
            }
        }

        let split_point = self.params.leaf_max as usize / 2;
        let (left_values, right_values) = match lowers.len().cmp(&split_point) {
            Ordering::Less => {
                // The insertion lands in the left leaf; top it up with the
                // smallest uppers so it reaches the split point.
                let take = split_point - lowers.len();
                uppers.select_nth_unstable_by(take, by_key);
                let rest = uppers.split_off(take);
                lowers.extend(uppers);
                lowers.push(value);
                (lowers, rest)
            }
            Ordering::Greater => {
                // The insertion lands in the right leaf; the left keeps the
                // smallest lowers up to the split point.
                lowers.select_nth_unstable_by(split_point, by_key);
                let mut rest = lowers.split_off(split_point);
                rest.push(value);
                rest.extend(uppers);
                (lowers, rest)
            }
            Ordering::Equal => {
                lowers.push(value);
                (lowers, uppers)
            }
        };

        let right_min = right_values
            .iter()
            .copied()
            .min_by(by_key)
            .ok_or(CairnError::InvariantViolation("split produced an empty leaf"))?;

        debug_assert!(left_values
            .iter()
            .all(|l| by_key(l, &right_min) != Ordering::Greater));

        self.store_values(&left_values);
        right.store_values(&right_values);
        Ok(S::key_of(&right_min))
    }

    /// Merges or rebalances `right` into/with `self`.
    ///
    /// When both fit in one leaf, all of `right` moves into `self` and the
    /// right block becomes unused. Otherwise the combined values are split
    /// at the median, the lower half staying left and the upper half going
    /// right.
    pub fn fuse_with(&mut self, right: &mut LeafView<'_, S>) -> Result<FuseOutcome<S::Key>> {
        let by_key = |a: &S::Value, b: &S::Value| S::compare(&S::key_of(a), &S::key_of(b));

        if self.degree() + right.degree() <= self.params.leaf_max as usize {
            let degree = self.degree();
            for (i, v) in right.values().into_iter().enumerate() {
                self.set_value(degree + i, &v);
            }
            self.set_degree(degree + right.degree());
            return Ok(FuseOutcome::Merged);
        }

        let mut combined = self.values();
        combined.extend(right.values());

        let mid = combined.len() / 2;
        combined.select_nth_unstable_by(mid, by_key);
        let upper = combined.split_off(mid);

        let mid_key = S::key_of(&upper[0]);
        self.store_values(&combined);
        right.store_values(&upper);
        Ok(FuseOutcome::Shared(mid_key))
    }
}
