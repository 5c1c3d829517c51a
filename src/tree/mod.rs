mod boolean;
pub(crate) mod node;
mod valued;

pub use boolean::BitK2Tree;
pub use valued::K2Tree;

use serde::{Deserialize, Serialize};

/// A single non-null cell of a relation: row, column and stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValuedPosition<E> {
  /// The row of the cell.
  pub row: usize,
  /// The column of the cell.
  pub col: usize,
  /// The stored value.
  pub value: E,
}
impl<E> ValuedPosition<E> {
  /// Bundles a cell from its parts.
  pub fn new(row: usize, col: usize, value: E) -> Self {
    ValuedPosition { row, col, value }
  }
}

/// Selects the strategy used by the list-of-lists constructors.
///
/// All strategies produce identical stem and leaf layers; they differ only
/// in how much transient memory the build uses and how the input is walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListBuildMode {
  /// Depth-first recursion over the padded matrix, consuming each row
  /// through a cursor. Mirrors the dense-matrix build.
  Recursive,
  /// Inserts every cell into a temporary pointer tree, then linearises it
  /// breadth-first.
  Tree,
  /// Grows the stem layer in place, keeping a mutable rank oracle in step
  /// with every inserted block.
  Dynamic,
}

/// The query surface shared by [`K2Tree`] and [`BitK2Tree`].
///
/// Row/column arguments range over the padded matrix, `0..num_rows()`;
/// passing coordinates at or beyond the padded width panics.
pub trait K2Relation {
  /// The element type of the relation. `bool` for [`BitK2Tree`].
  type Elem: Clone + PartialEq;

  /// The height of the conceptual tree.
  fn height(&self) -> usize;
  /// The branching factor.
  fn k(&self) -> usize;
  /// The padded side length, `k^height`.
  fn num_rows(&self) -> usize;
  /// The padded side length, `k^height`.
  fn num_cols(&self) -> usize;
  /// The element value treated as absent.
  fn null_value(&self) -> Self::Elem;

  /// Returns whether the cell (i, j) holds a non-null value.
  fn is_not_null(&self, i: usize, j: usize) -> bool;
  /// Returns the value of the cell (i, j), null included.
  fn get_element(&self, i: usize, j: usize) -> Self::Elem;

  /// The values of all non-null cells in row i, in ascending column order.
  fn successor_elements(&self, i: usize) -> Vec<Self::Elem>;
  /// The columns of all non-null cells in row i, ascending.
  fn successor_positions(&self, i: usize) -> Vec<usize>;
  /// The full (row, column, value) triples of row i, ascending by column.
  fn successor_valued_positions(&self, i: usize) -> Vec<ValuedPosition<Self::Elem>>;

  /// The values of all non-null cells in column j, in ascending row order.
  fn predecessor_elements(&self, j: usize) -> Vec<Self::Elem>;
  /// The rows of all non-null cells in column j, ascending.
  fn predecessor_positions(&self, j: usize) -> Vec<usize>;
  /// The full (row, column, value) triples of column j, ascending by row.
  fn predecessor_valued_positions(&self, j: usize) -> Vec<ValuedPosition<Self::Elem>>;

  /// The smallest column holding a non-null value in row i, or the padded
  /// width if the row is empty.
  fn first_successor(&self, i: usize) -> usize;

  /// The values of all non-null cells in the rectangle rows i1..=i2,
  /// columns j1..=j2.
  fn elements_in_range(&self, i1: usize, i2: usize, j1: usize, j2: usize) -> Vec<Self::Elem>;
  /// The (row, column) positions of all non-null cells in the rectangle.
  fn positions_in_range(&self, i1: usize, i2: usize, j1: usize, j2: usize)
    -> Vec<(usize, usize)>;
  /// The (row, column, value) triples of all non-null cells in the rectangle.
  fn valued_positions_in_range(
    &self,
    i1: usize,
    i2: usize,
    j1: usize,
    j2: usize,
  ) -> Vec<ValuedPosition<Self::Elem>>;

  /// The values of every non-null cell.
  fn all_elements(&self) -> Vec<Self::Elem>;
  /// The positions of every non-null cell.
  fn all_positions(&self) -> Vec<(usize, usize)>;
  /// The (row, column, value) triples of every non-null cell.
  fn all_valued_positions(&self) -> Vec<ValuedPosition<Self::Elem>>;

  /// Returns whether the rectangle rows i1..=i2, columns j1..=j2 contains
  /// at least one non-null cell.
  fn contains_element(&self, i1: usize, i2: usize, j1: usize, j2: usize) -> bool;
  /// The number of non-null cells.
  fn count_elements(&self) -> usize;

  /// Overwrites the cell (i, j) with null, without repairing the stems.
  ///
  /// This is a destructive side door: the leaf value changes but no
  /// collapsed sub-block is pruned, so the tree drops the fully-covered
  /// shortcut of [`contains_element`](Self::contains_element) from then on.
  fn set_null(&mut self, i: usize, j: usize);

  /* Method aliases using relation nomenclature. */

  /// Alias of [`is_not_null`](Self::is_not_null): is there a link i -> j?
  fn are_related(&self, i: usize, j: usize) -> bool {
    self.is_not_null(i, j)
  }
  /// Alias of [`successor_positions`](Self::successor_positions).
  fn successors(&self, i: usize) -> Vec<usize> {
    self.successor_positions(i)
  }
  /// Alias of [`predecessor_positions`](Self::predecessor_positions).
  fn predecessors(&self, j: usize) -> Vec<usize> {
    self.predecessor_positions(j)
  }
  /// Alias of [`positions_in_range`](Self::positions_in_range).
  fn range(&self, i1: usize, i2: usize, j1: usize, j2: usize) -> Vec<(usize, usize)> {
    self.positions_in_range(i1, i2, j1, j2)
  }
  /// Alias of [`contains_element`](Self::contains_element).
  fn contains_link(&self, i1: usize, i2: usize, j1: usize, j2: usize) -> bool {
    self.contains_element(i1, i2, j1, j2)
  }
  /// Alias of [`count_elements`](Self::count_elements).
  fn count_links(&self) -> usize {
    self.count_elements()
  }
}

/* Shared builder plumbing */

/// One pending sub-block of the pair-list build: a square region of the
/// padded matrix and the slice of the pair array that falls inside it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Subproblem {
  pub first_row: usize,
  pub last_row: usize,
  pub first_col: usize,
  pub last_col: usize,
  pub left: usize,
  pub right: usize,
}

/// A queue entry of the iterative successor walk: the column offset a
/// subtree covers and the stem position of its presence bit.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SubrowInfo {
  pub dq: usize,
  pub z: usize,
}

/// Smallest exponent e with k^e >= n.
pub(crate) fn log_k(n: usize, k: usize) -> usize {
  let mut e = 0;
  let mut pow = 1;
  while pow < n {
    pow *= k;
    e += 1;
  }
  e
}

pub(crate) fn is_all_null<E: PartialEq>(block: &[E], null: &E) -> bool {
  block.iter().all(|element| element == null)
}
