#![warn(missing_debug_implementations, rust_2018_idioms, missing_docs)]

/*!
A static, compressed representation of sparse square relations.

A relation here is an n×n table over some element domain with a designated
*null* element; almost all cells are expected to hold null. Viewed through a
Boolean lens the table is the adjacency matrix of a directed graph, and a
non-null cell (i, j) is a link from i to j.

**Note:** this library heavily relies upon [bitvec](https://docs.rs/bitvec)
to store its internal layers. Always compile with optimisations when
benchmarking; bit-level indexing is slow in debug builds.
*/

/*!
# How it Works:

The matrix is padded to the smallest power of k and recursively divided into
k×k sub-blocks. A sub-block containing only nulls collapses into a single 0
bit in its parent; every other block contributes a 1 bit and recurses.

## Original bit-matrix (k = 2):

```ignore
00|00||10|10
00|00||00|11
------------
00|00||00|00
00|00||00|10
============
10|10||00|11
10|00||00|00
------------
00|00||00|00
00|00||00|00
```

## Resulting tree:

```ignore
               0111
          ______|||________
          |     |         |
          1101  1100      0100
|----|----|     |----|    |
1000 1011 0010  1010 1000 1100
```

The child-presence bits of all interior nodes, level by level, form the
stem layer `T`; the k×k cell blocks of the surviving leaves form the leaf
layer `L`:

```ignore
T = [0111; 1101, 1100, 0100]
L = [1000, 1011, 0010, 1010, 1000, 1100]
```

Navigation never decompresses: the children of the node whose presence bit
sits at position `z` of `T` start at position `rank1(z + 1) * k²` of the
concatenation `T ∘ L`, so a rank-1 directory over `T` is the only extra
state queries need.

Two variants share this layout: [`K2Tree`]`<E>` stores arbitrary values in
`L`, while [`BitK2Tree`] packs `L` into a bit vector and answers
graph-flavoured queries (`are_related`, `successors`, ...). Both are built
by any of four constructions (dense matrix, per-row adjacency lists via
three different strategies, or one unordered pair list) that produce
byte-identical layers, and both expose the full query surface through the
[`K2Relation`] trait.
*/

pub use tree::{BitK2Tree, K2Relation, K2Tree, ListBuildMode, ValuedPosition};

/// Tree types, the shared query trait and assosciated value types.
pub mod tree;

/// Library error types.
pub mod error;

/// `BitMatrix` struct.
pub mod matrix;

/// Rank directories over the stem layer.
pub mod rank;

#[cfg(test)]
mod unit_tests;
