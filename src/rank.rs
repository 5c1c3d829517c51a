/*!
Rank-1 directories over the stem layer.

Navigation locates the children of the stem bit at position `z` via
`rank1(z + 1) * k²`, so every tree carries a [`RankIndex`] over its frozen
stems. The index holds no reference to the bits it describes; the owning
tree passes its stem layer back in at query time and rebuilds the index
whenever that layer is replaced.

[`NaiveDynamicRank`] exists only for the dynamic list construction, where
stems grow mid-build: it keeps a plain prefix-count array and pays O(n) per
update, which is irrelevant next to the bit insertions it accompanies.
*/

use bitvec::slice::BitSlice;
use serde::{Deserialize, Serialize};

/// Absolute counts are sampled once per this many stem bits.
const SAMPLE_BITS: usize = 512;

/// A static rank-1 directory over a frozen bit sequence.
///
/// `samples[b]` holds the number of set bits strictly before position
/// `b * SAMPLE_BITS`; a query popcounts the remainder of its block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankIndex {
  samples: Vec<usize>,
}

impl RankIndex {
  /// Builds the directory for `bits`.
  pub fn new(bits: &BitSlice) -> Self {
    let mut samples = Vec::with_capacity(bits.len() / SAMPLE_BITS + 2);
    samples.push(0);
    let mut total = 0;
    for chunk in bits.chunks(SAMPLE_BITS) {
      total += chunk.count_ones();
      samples.push(total);
    }
    RankIndex { samples }
  }
  /// Returns the number of set bits in `bits[0..i]`.
  ///
  /// `bits` must be the sequence this directory was built for and
  /// `i <= bits.len()`.
  pub fn rank1(&self, bits: &BitSlice, i: usize) -> usize {
    let block = i / SAMPLE_BITS;
    self.samples[block] + bits[block * SAMPLE_BITS..i].count_ones()
  }
}

impl Default for RankIndex {
  fn default() -> Self {
    RankIndex { samples: vec![0] }
  }
}

/// A mutable rank-1 oracle over a bit sequence that is still growing.
///
/// Stores the full prefix-count array `ranks[i] = rank1(i)`; all updates
/// are linear scans or splices.
#[derive(Debug, Clone, Default)]
pub struct NaiveDynamicRank {
  ranks: Vec<usize>,
}

impl NaiveDynamicRank {
  /// An oracle for `len` zero bits.
  pub fn new(len: usize) -> Self {
    NaiveDynamicRank {
      ranks: vec![0; len + 1],
    }
  }
  /// An oracle matching the current contents of `bits`.
  pub fn from_bits(bits: &BitSlice) -> Self {
    let mut ranks = Vec::with_capacity(bits.len() + 1);
    ranks.push(0);
    let mut total = 0;
    for bit in bits.iter().by_vals() {
      total += bit as usize;
      ranks.push(total);
    }
    NaiveDynamicRank { ranks }
  }
  /// Returns the number of set bits in the first `i` positions.
  pub fn rank1(&self, i: usize) -> usize {
    self.ranks[i]
  }
  /// Records that the bit at position `pos - 1` flipped from 0 to 1.
  pub fn increase_from(&mut self, pos: usize) {
    for rank in &mut self.ranks[pos..] {
      *rank += 1;
    }
  }
  /// Records the insertion of `count` zero bits at bit position `pos`.
  pub fn insert(&mut self, pos: usize, count: usize) {
    let below = self.ranks[pos];
    for _ in 0..count {
      self.ranks.insert(pos + 1, below);
    }
  }
}
