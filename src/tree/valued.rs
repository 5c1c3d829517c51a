use std::collections::VecDeque;

use {
  bitvec::{order::Lsb0, prelude::bitvec, vec::BitVec},
  serde::{Deserialize, Serialize},
  crate::error::K2TreeError as Error,
  crate::rank::{NaiveDynamicRank, RankIndex},
  crate::tree::{is_all_null, log_k, node, ListBuildMode, Subproblem, SubrowInfo, ValuedPosition},
};

type Result<T> = std::result::Result<T, Error>;

/// A compressed square matrix of values over an element domain with a
/// designated null element.
///
/// The matrix is padded to `k^h` per side and stored as two layers: the
/// stems `T` (child-presence bits of every interior tree node, level by
/// level) and the leaves `L` (the k×k value blocks of every non-empty leaf,
/// in the same breadth-first order). Sub-blocks holding only nulls occupy a
/// single 0 bit, which is what makes sparse relations small. Once built,
/// the tree is read-only apart from the destructive
/// [`set_null`](K2Tree::set_null) side door.
///
/// ```
/// use k2_relation::K2Tree;
///
/// let mat = vec![
///   vec![0, 0, 0],
///   vec![0, 0, 7],
///   vec![0, 0, 0],
/// ];
/// let tree = K2Tree::from_matrix(&mat, 2, 0).unwrap();
/// assert_eq!(tree.num_rows(), 4); // padded to the next power of k
/// assert_eq!(tree.get_element(1, 2), 7);
/// assert_eq!(tree.get_element(1, 1), 0);
/// assert_eq!(tree.successor_positions(1), vec![2]);
/// assert_eq!(tree.count_elements(), 1);
/// ```
#[derive(Debug, Serialize, Deserialize)]
pub struct K2Tree<E> {
  k: usize,
  height: usize,
  matrix_width: usize,
  null: E,
  stems: BitVec,
  leaves: Vec<E>,
  ranks: RankIndex,
  tainted: bool,
}

/* Construction */
impl<E: Clone + PartialEq> K2Tree<E> {
  /// Builds a tree from a dense matrix given as a slice of equally long
  /// rows. Cells equal to `null` are treated as absent.
  ///
  /// Fails if `k < 2`, if the matrix has no rows or no columns, or if the
  /// rows differ in length.
  pub fn from_matrix(mat: &[Vec<E>], k: usize, null: E) -> Result<Self> {
    if k < 2 {
      return Err(Error::SmallKValue { k });
    }
    if mat.is_empty() || mat[0].is_empty() {
      return Err(Error::EmptyInput);
    }
    let num_cols = mat[0].len();
    for (row, cells) in mat.iter().enumerate() {
      if cells.len() != num_cols {
        return Err(Error::RaggedMatrix {
          row,
          len: cells.len(),
          expected: num_cols,
        });
      }
    }
    let height = std::cmp::max(1, log_k(std::cmp::max(mat.len(), num_cols), k));
    let mut tree = Self::scaffold(k, height, null);
    let mut levels = vec![BitVec::new(); height - 1];
    tree.build_from_matrix(mat, &mut levels, mat.len(), num_cols, tree.matrix_width, 1, 0, 0);
    for level in &levels {
      tree.stems.extend_from_bitslice(level);
    }
    tree.ranks = RankIndex::new(&tree.stems);
    Ok(tree)
  }
  /// Builds a tree from per-row adjacency lists: `lists[i]` holds the
  /// `(column, value)` pairs of row i with strictly ascending columns.
  ///
  /// All [`ListBuildMode`]s produce the same layers; they differ only in
  /// how much transient memory the build keeps alive.
  ///
  /// ```
  /// use k2_relation::{K2Tree, ListBuildMode};
  ///
  /// let lists = vec![
  ///   vec![],
  ///   vec![(0, 3), (2, 8)],
  ///   vec![(1, 4)],
  /// ];
  /// let tree = K2Tree::from_lists(&lists, 2, ListBuildMode::Tree, 0).unwrap();
  /// assert_eq!(tree.successor_positions(1), vec![0, 2]);
  /// assert_eq!(tree.successor_elements(1), vec![3, 8]);
  /// assert_eq!(tree.get_element(2, 1), 4);
  /// ```
  pub fn from_lists(
    lists: &[Vec<(usize, E)>],
    k: usize,
    mode: ListBuildMode,
    null: E,
  ) -> Result<Self> {
    if k < 2 {
      return Err(Error::SmallKValue { k });
    }
    let mut max_col = 0;
    for (row, cells) in lists.iter().enumerate() {
      for window in cells.windows(2) {
        if window[1].0 <= window[0].0 {
          return Err(Error::UnsortedColumns {
            row,
            col: window[1].0,
          });
        }
      }
      if let Some(last) = cells.last() {
        max_col = std::cmp::max(max_col, last.0);
      }
    }
    let height = std::cmp::max(1, log_k(std::cmp::max(lists.len(), max_col + 1), k));
    let mut tree = Self::scaffold(k, height, null);
    match mode {
      ListBuildMode::Recursive => {
        let mut cursors = vec![0usize; lists.len()];
        let mut levels = vec![BitVec::new(); height - 1];
        tree.build_from_lists(lists, &mut cursors, &mut levels, tree.matrix_width, 1, 0, 0);
        for level in &levels {
          tree.stems.extend_from_bitslice(level);
        }
      }
      ListBuildMode::Tree => tree.build_from_lists_via_tree(lists),
      ListBuildMode::Dynamic => tree.build_from_lists_dynamic(lists),
    }
    tree.ranks = RankIndex::new(&tree.stems);
    Ok(tree)
  }
  /// Builds a tree from an unordered list of cells. The list is reordered
  /// in place by repeated counting sorts, one sub-block at a time.
  pub fn from_pairs(mut pairs: Vec<ValuedPosition<E>>, k: usize, null: E) -> Result<Self> {
    if k < 2 {
      return Err(Error::SmallKValue { k });
    }
    let mut max_index = 0;
    for pair in &pairs {
      max_index = std::cmp::max(max_index, std::cmp::max(pair.row, pair.col));
    }
    let height = std::cmp::max(1, log_k(max_index + 1, k));
    let mut tree = Self::scaffold(k, height, null);
    if !pairs.is_empty() {
      tree.build_from_pairs(&mut pairs);
    }
    tree.ranks = RankIndex::new(&tree.stems);
    Ok(tree)
  }

  fn scaffold(k: usize, height: usize, null: E) -> Self {
    K2Tree {
      k,
      height,
      matrix_width: k.pow(height as u32),
      null,
      stems: BitVec::new(),
      leaves: Vec::new(),
      ranks: RankIndex::default(),
      tainted: false,
    }
  }
}

/* Parameters */
impl<E: Clone + PartialEq> K2Tree<E> {
  /// The height of the conceptual tree.
  pub fn height(&self) -> usize {
    self.height
  }
  /// The branching factor.
  pub fn k(&self) -> usize {
    self.k
  }
  /// The padded side length, `k^height`.
  pub fn num_rows(&self) -> usize {
    self.matrix_width
  }
  /// The padded side length, `k^height`.
  pub fn num_cols(&self) -> usize {
    self.matrix_width
  }
  /// The element value treated as absent.
  pub fn null_value(&self) -> E {
    self.null.clone()
  }
  /// The stem layer: child-presence bits of all interior nodes in
  /// breadth-first order.
  pub fn stems(&self) -> &BitVec {
    &self.stems
  }
  /// The leaf layer: the k×k value blocks of all non-empty leaves in
  /// breadth-first order.
  pub fn leaves(&self) -> &[E] {
    &self.leaves
  }
  /// Returns true if the relation holds no non-null cell.
  pub fn is_empty(&self) -> bool {
    self.leaves.iter().all(|value| *value == self.null)
  }
}

/* Queries */
impl<E: Clone + PartialEq> K2Tree<E> {
  /// Returns whether the cell (i, j) holds a non-null value.
  ///
  /// Panics if `i` or `j` is at or beyond [`num_rows`](K2Tree::num_rows).
  pub fn is_not_null(&self, i: usize, j: usize) -> bool {
    self.assert_cell_in_bounds(i, j);
    if self.leaves.is_empty() {
      return false;
    }
    let n = self.matrix_width / self.k;
    self.check(n, i % n, j % n, (i / n) * self.k + j / n)
  }
  /// Returns the value of the cell (i, j); null if the descent dies on an
  /// absent sub-block.
  ///
  /// Panics if `i` or `j` is at or beyond [`num_rows`](K2Tree::num_rows).
  pub fn get_element(&self, i: usize, j: usize) -> E {
    self.assert_cell_in_bounds(i, j);
    if self.leaves.is_empty() {
      return self.null.clone();
    }
    let n = self.matrix_width / self.k;
    self.get(n, i % n, j % n, (i / n) * self.k + j / n)
  }
  /// The values of all non-null cells in row i, in ascending column order.
  pub fn successor_elements(&self, i: usize) -> Vec<E> {
    let mut succs = Vec::new();
    self.each_successor(i, &mut |_, value: &E| succs.push(value.clone()));
    succs
  }
  /// The columns of all non-null cells in row i, ascending.
  pub fn successor_positions(&self, i: usize) -> Vec<usize> {
    let mut succs = Vec::new();
    self.each_successor(i, &mut |col, _| succs.push(col));
    succs
  }
  /// The (row, column, value) triples of all non-null cells in row i,
  /// ascending by column.
  pub fn successor_valued_positions(&self, i: usize) -> Vec<ValuedPosition<E>> {
    let mut succs = Vec::new();
    self.each_successor(i, &mut |col, value: &E| {
      succs.push(ValuedPosition::new(i, col, value.clone()))
    });
    succs
  }
  /// The values of all non-null cells in column j, in ascending row order.
  pub fn predecessor_elements(&self, j: usize) -> Vec<E> {
    let mut preds = Vec::new();
    self.each_predecessor(j, &mut |_, value: &E| preds.push(value.clone()));
    preds
  }
  /// The rows of all non-null cells in column j, ascending.
  pub fn predecessor_positions(&self, j: usize) -> Vec<usize> {
    let mut preds = Vec::new();
    self.each_predecessor(j, &mut |row, _| preds.push(row));
    preds
  }
  /// The (row, column, value) triples of all non-null cells in column j,
  /// ascending by row.
  pub fn predecessor_valued_positions(&self, j: usize) -> Vec<ValuedPosition<E>> {
    let mut preds = Vec::new();
    self.each_predecessor(j, &mut |row, value: &E| {
      preds.push(ValuedPosition::new(row, j, value.clone()))
    });
    preds
  }
  /// The smallest column holding a non-null value in row i, or the padded
  /// width if the row is empty.
  ///
  /// Panics if `i` is at or beyond [`num_rows`](K2Tree::num_rows).
  pub fn first_successor(&self, i: usize) -> usize {
    self.assert_line_in_bounds(i);
    if self.leaves.is_empty() {
      return self.matrix_width;
    }
    if self.stems.is_empty() {
      let offset = i * self.matrix_width;
      for j in 0..self.matrix_width {
        if self.leaves[offset + j] != self.null {
          return j;
        }
      }
      return self.matrix_width;
    }
    let k = self.k;
    let n = self.matrix_width / k;
    let mut stack = vec![DescentFrame {
      n,
      p: i % n,
      dq: 0,
      z: k * (i / n),
      j: 0,
    }];
    while let Some(top) = stack.last_mut() {
      if top.j == k {
        stack.pop();
        continue;
      }
      let cur = *top;
      top.dq += cur.n;
      top.z += 1;
      top.j += 1;
      if cur.z >= self.stems.len() {
        if self.leaves[cur.z - self.stems.len()] != self.null {
          return cur.dq;
        }
      } else if self.stems[cur.z] {
        let m = cur.n / k;
        stack.push(DescentFrame {
          n: m,
          p: cur.p % m,
          dq: cur.dq,
          z: self.child_block(cur.z) + k * (cur.p / m),
          j: 0,
        });
      }
    }
    self.matrix_width
  }
  /// The values of all non-null cells with row in i1..=i2 and column in
  /// j1..=j2, in sub-block order.
  pub fn elements_in_range(&self, i1: usize, i2: usize, j1: usize, j2: usize) -> Vec<E> {
    let mut elements = Vec::new();
    self.each_in_range(i1, i2, j1, j2, &mut |_, _, value: &E| {
      elements.push(value.clone())
    });
    elements
  }
  /// The (row, column) positions of all non-null cells in the rectangle.
  pub fn positions_in_range(
    &self,
    i1: usize,
    i2: usize,
    j1: usize,
    j2: usize,
  ) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    self.each_in_range(i1, i2, j1, j2, &mut |row, col, _| pairs.push((row, col)));
    pairs
  }
  /// The (row, column, value) triples of all non-null cells in the
  /// rectangle.
  ///
  /// ```
  /// use k2_relation::{K2Tree, ValuedPosition};
  ///
  /// let mut mat = vec![vec![0u32; 8]; 8];
  /// mat[2][3] = 5;
  /// mat[5][6] = 9;
  /// let tree = K2Tree::from_matrix(&mat, 2, 0).unwrap();
  /// assert_eq!(
  ///   tree.valued_positions_in_range(0, 3, 0, 3),
  ///   vec![ValuedPosition::new(2, 3, 5)],
  /// );
  /// assert_eq!(
  ///   tree.valued_positions_in_range(4, 7, 4, 7),
  ///   vec![ValuedPosition::new(5, 6, 9)],
  /// );
  /// assert_eq!(tree.valued_positions_in_range(0, 7, 0, 7).len(), 2);
  /// ```
  pub fn valued_positions_in_range(
    &self,
    i1: usize,
    i2: usize,
    j1: usize,
    j2: usize,
  ) -> Vec<ValuedPosition<E>> {
    let mut pairs = Vec::new();
    self.each_in_range(i1, i2, j1, j2, &mut |row, col, value: &E| {
      pairs.push(ValuedPosition::new(row, col, value.clone()))
    });
    pairs
  }
  /// The values of every non-null cell.
  pub fn all_elements(&self) -> Vec<E> {
    self.elements_in_range(0, self.matrix_width - 1, 0, self.matrix_width - 1)
  }
  /// The positions of every non-null cell.
  pub fn all_positions(&self) -> Vec<(usize, usize)> {
    self.positions_in_range(0, self.matrix_width - 1, 0, self.matrix_width - 1)
  }
  /// The (row, column, value) triples of every non-null cell.
  pub fn all_valued_positions(&self) -> Vec<ValuedPosition<E>> {
    self.valued_positions_in_range(0, self.matrix_width - 1, 0, self.matrix_width - 1)
  }
  /// Returns whether the rectangle rows i1..=i2, columns j1..=j2 contains
  /// at least one non-null cell.
  ///
  /// On a tree untouched by [`set_null`](K2Tree::set_null) a sub-block
  /// fully inside the rectangle answers without descending further.
  ///
  /// Panics if the rectangle reaches past [`num_rows`](K2Tree::num_rows).
  pub fn contains_element(&self, i1: usize, i2: usize, j1: usize, j2: usize) -> bool {
    self.assert_cell_in_bounds(i1, j1);
    self.assert_cell_in_bounds(i2, j2);
    if self.leaves.is_empty() {
      return false;
    }
    if !self.tainted
      && i1 == 0
      && j1 == 0
      && i2 == self.matrix_width - 1
      && j2 == self.matrix_width - 1
    {
      return true;
    }
    let n = self.matrix_width / self.k;
    for i in i1 / n..=i2 / n {
      let p1 = if i == i1 / n { i1 % n } else { 0 };
      let p2 = if i == i2 / n { i2 % n } else { n - 1 };
      for j in j1 / n..=j2 / n {
        let q1 = if j == j1 / n { j1 % n } else { 0 };
        let q2 = if j == j2 / n { j2 % n } else { n - 1 };
        if self.element_in_range(n, p1, p2, q1, q2, self.k * i + j) {
          return true;
        }
      }
    }
    false
  }
  /// The number of non-null cells.
  pub fn count_elements(&self) -> usize {
    self.leaves.iter().filter(|value| **value != self.null).count()
  }
  /// Overwrites the cell (i, j) with null, without repairing the stems.
  ///
  /// The leaf value changes but no collapsed sub-block is pruned, so the
  /// fully-covered shortcut of [`contains_element`](K2Tree::contains_element)
  /// is disabled from the first call on. There is no way back.
  ///
  /// Panics if `i` or `j` is at or beyond [`num_rows`](K2Tree::num_rows).
  pub fn set_null(&mut self, i: usize, j: usize) {
    self.assert_cell_in_bounds(i, j);
    if self.leaves.is_empty() {
      return;
    }
    self.tainted = true;
    let n = self.matrix_width / self.k;
    self.set(n, i % n, j % n, (i / n) * self.k + j / n);
  }
  /// Prints the tree parameters and, if `all`, the raw stem bits, leaf
  /// values and rank samples.
  pub fn print(&self, all: bool)
  where
    E: std::fmt::Display,
  {
    println!("### Parameters ###");
    println!("h  = {}", self.height);
    println!("k  = {}", self.k);
    println!("n' = {}", self.matrix_width);
    println!("null = {}", self.null);
    if all {
      println!("### T ###");
      for bit in self.stems.iter().by_vals() {
        print!("{}", bit as usize);
      }
      println!();
      println!("### L ###");
      for value in &self.leaves {
        print!("{} ", value);
      }
      println!();
      println!("### R ###");
      println!("{:?}", self.ranks);
    }
  }
}

/* Traits */
impl<E: Clone + PartialEq> crate::tree::K2Relation for K2Tree<E> {
  type Elem = E;
  fn height(&self) -> usize {
    self.height
  }
  fn k(&self) -> usize {
    self.k
  }
  fn num_rows(&self) -> usize {
    self.matrix_width
  }
  fn num_cols(&self) -> usize {
    self.matrix_width
  }
  fn null_value(&self) -> E {
    self.null.clone()
  }
  fn is_not_null(&self, i: usize, j: usize) -> bool {
    K2Tree::is_not_null(self, i, j)
  }
  fn get_element(&self, i: usize, j: usize) -> E {
    K2Tree::get_element(self, i, j)
  }
  fn successor_elements(&self, i: usize) -> Vec<E> {
    K2Tree::successor_elements(self, i)
  }
  fn successor_positions(&self, i: usize) -> Vec<usize> {
    K2Tree::successor_positions(self, i)
  }
  fn successor_valued_positions(&self, i: usize) -> Vec<ValuedPosition<E>> {
    K2Tree::successor_valued_positions(self, i)
  }
  fn predecessor_elements(&self, j: usize) -> Vec<E> {
    K2Tree::predecessor_elements(self, j)
  }
  fn predecessor_positions(&self, j: usize) -> Vec<usize> {
    K2Tree::predecessor_positions(self, j)
  }
  fn predecessor_valued_positions(&self, j: usize) -> Vec<ValuedPosition<E>> {
    K2Tree::predecessor_valued_positions(self, j)
  }
  fn first_successor(&self, i: usize) -> usize {
    K2Tree::first_successor(self, i)
  }
  fn elements_in_range(&self, i1: usize, i2: usize, j1: usize, j2: usize) -> Vec<E> {
    K2Tree::elements_in_range(self, i1, i2, j1, j2)
  }
  fn positions_in_range(&self, i1: usize, i2: usize, j1: usize, j2: usize) -> Vec<(usize, usize)> {
    K2Tree::positions_in_range(self, i1, i2, j1, j2)
  }
  fn valued_positions_in_range(
    &self,
    i1: usize,
    i2: usize,
    j1: usize,
    j2: usize,
  ) -> Vec<ValuedPosition<E>> {
    K2Tree::valued_positions_in_range(self, i1, i2, j1, j2)
  }
  fn all_elements(&self) -> Vec<E> {
    K2Tree::all_elements(self)
  }
  fn all_positions(&self) -> Vec<(usize, usize)> {
    K2Tree::all_positions(self)
  }
  fn all_valued_positions(&self) -> Vec<ValuedPosition<E>> {
    K2Tree::all_valued_positions(self)
  }
  fn contains_element(&self, i1: usize, i2: usize, j1: usize, j2: usize) -> bool {
    K2Tree::contains_element(self, i1, i2, j1, j2)
  }
  fn count_elements(&self) -> usize {
    K2Tree::count_elements(self)
  }
  fn set_null(&mut self, i: usize, j: usize) {
    K2Tree::set_null(self, i, j)
  }
}

impl<E: Clone + PartialEq> Clone for K2Tree<E> {
  fn clone(&self) -> Self {
    let stems = self.stems.clone();
    let ranks = RankIndex::new(&stems);
    K2Tree {
      k: self.k,
      height: self.height,
      matrix_width: self.matrix_width,
      null: self.null.clone(),
      stems,
      leaves: self.leaves.clone(),
      ranks,
      tainted: self.tainted,
    }
  }
}
impl<E: Clone + PartialEq> PartialEq for K2Tree<E> {
  fn eq(&self, other: &Self) -> bool {
    self.k == other.k
      && self.matrix_width == other.matrix_width
      && self.null == other.null
      && self.stems == other.stems
      && self.leaves == other.leaves
  }
}
impl<E: Clone + Eq> Eq for K2Tree<E> {}
impl<E: Clone + PartialEq + std::hash::Hash> std::hash::Hash for K2Tree<E> {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.k.hash(state);
    self.matrix_width.hash(state);
    self.stems.hash(state);
    self.leaves.hash(state);
  }
}
impl<E: Clone + PartialEq + std::fmt::Display> std::fmt::Display for K2Tree<E> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let k2 = self.k * self.k;
    let mut s = String::new();
    let mut start = 0;
    while start < self.stems.len() {
      let level = &self.stems[start..start + self.level_len(start)];
      for (pos, bit) in level.iter().by_vals().enumerate() {
        if pos > 0 && pos % k2 == 0 {
          s.push(',');
        }
        s.push(if bit { '1' } else { '0' });
      }
      s.push_str("::");
      start += level.len();
    }
    for (pos, value) in self.leaves.iter().enumerate() {
      if pos > 0 {
        s.push(if pos % k2 == 0 { ',' } else { ' ' });
      }
      s.push_str(&value.to_string());
    }
    write!(f, "[{}]", s)
  }
}

/* Descents */
impl<E: Clone + PartialEq> K2Tree<E> {
  /// Queries are only defined inside the padded matrix; the descent
  /// arithmetic wraps silently past it, so reject bad cells up front.
  fn assert_cell_in_bounds(&self, i: usize, j: usize) {
    assert!(
      i < self.matrix_width && j < self.matrix_width,
      "coordinates ({}, {}) are not in the range of the matrix: (0, 0) -> ({}, {})",
      i,
      j,
      self.matrix_width - 1,
      self.matrix_width - 1
    );
  }
  fn assert_line_in_bounds(&self, x: usize) {
    assert!(
      x < self.matrix_width,
      "index {} is not in the range of the matrix rows/columns: 0 -> {}",
      x,
      self.matrix_width - 1
    );
  }
  /// Start of the child block of the set stem bit at `z` within T ∘ L.
  fn child_block(&self, z: usize) -> usize {
    self.ranks.rank1(&self.stems, z + 1) * self.k * self.k
  }
  /// Length of the stem level starting at `start`. The level after it
  /// begins at the child block of this level's first set bit, which is
  /// block rank1(start) + 1.
  fn level_len(&self, start: usize) -> usize {
    let k2 = self.k * self.k;
    (self.ranks.rank1(&self.stems, start) + 1) * k2 - start
  }
  fn check(&self, n: usize, p: usize, q: usize, z: usize) -> bool {
    if z >= self.stems.len() {
      self.leaves[z - self.stems.len()] != self.null
    } else if self.stems[z] {
      let m = n / self.k;
      self.check(m, p % m, q % m, self.child_block(z) + (p / m) * self.k + q / m)
    } else {
      false
    }
  }
  fn get(&self, n: usize, p: usize, q: usize, z: usize) -> E {
    if z >= self.stems.len() {
      self.leaves[z - self.stems.len()].clone()
    } else if self.stems[z] {
      let m = n / self.k;
      self.get(m, p % m, q % m, self.child_block(z) + (p / m) * self.k + q / m)
    } else {
      self.null.clone()
    }
  }
  /// Level-by-level walk over row p; emits (column, value) of every
  /// non-null cell in ascending column order.
  fn each_successor<F: FnMut(usize, &E)>(&self, p: usize, emit: &mut F) {
    self.assert_line_in_bounds(p);
    if self.leaves.is_empty() {
      return;
    }
    let k = self.k;
    let len_t = self.stems.len();
    if len_t == 0 {
      let offset = p * self.matrix_width;
      for j in 0..self.matrix_width {
        if self.leaves[offset + j] != self.null {
          emit(j, &self.leaves[offset + j]);
        }
      }
      return;
    }
    let mut queue = VecDeque::new();
    let mut next_level = VecDeque::new();
    let mut n = self.matrix_width / k;
    let mut rel_p = p;
    {
      let mut dq = 0;
      let mut z = k * (rel_p / n);
      for _ in 0..k {
        queue.push_back(SubrowInfo { dq, z });
        dq += n;
        z += 1;
      }
    }
    rel_p %= n;
    n /= k;
    while n > 1 {
      while let Some(cur) = queue.pop_front() {
        if self.stems[cur.z] {
          let mut y = self.child_block(cur.z) + k * (rel_p / n);
          let mut dq = cur.dq;
          for _ in 0..k {
            next_level.push_back(SubrowInfo { dq, z: y });
            dq += n;
            y += 1;
          }
        }
      }
      std::mem::swap(&mut queue, &mut next_level);
      rel_p %= n;
      n /= k;
    }
    while let Some(cur) = queue.pop_front() {
      if self.stems[cur.z] {
        let mut y = self.child_block(cur.z) + k * rel_p - len_t;
        let mut dq = cur.dq;
        for _ in 0..k {
          if self.leaves[y] != self.null {
            emit(dq, &self.leaves[y]);
          }
          dq += 1;
          y += 1;
        }
      }
    }
  }
  /// Emits (row, value) of every non-null cell in column q, ascending row.
  fn each_predecessor<F: FnMut(usize, &E)>(&self, q: usize, emit: &mut F) {
    self.assert_line_in_bounds(q);
    if self.leaves.is_empty() {
      return;
    }
    let n = self.matrix_width / self.k;
    let y = q / n;
    for i in 0..self.k {
      self.predecessors(n, q % n, n * i, y + i * self.k, emit);
    }
  }
  fn predecessors<F: FnMut(usize, &E)>(&self, n: usize, q: usize, p: usize, z: usize, emit: &mut F) {
    if z >= self.stems.len() {
      let value = &self.leaves[z - self.stems.len()];
      if *value != self.null {
        emit(p, value);
      }
    } else if self.stems[z] {
      let m = n / self.k;
      let y = self.child_block(z) + q / m;
      for i in 0..self.k {
        self.predecessors(m, q % m, p + m * i, y + i * self.k, emit);
      }
    }
  }
  /// Emits (row, column, value) of every non-null cell in the rectangle,
  /// visiting only overlapping sub-blocks.
  fn each_in_range<F: FnMut(usize, usize, &E)>(
    &self,
    p1: usize,
    p2: usize,
    q1: usize,
    q2: usize,
    emit: &mut F,
  ) {
    self.assert_cell_in_bounds(p1, q1);
    self.assert_cell_in_bounds(p2, q2);
    if self.leaves.is_empty() {
      return;
    }
    let n = self.matrix_width / self.k;
    for i in p1 / n..=p2 / n {
      let p1_sub = if i == p1 / n { p1 % n } else { 0 };
      let p2_sub = if i == p2 / n { p2 % n } else { n - 1 };
      for j in q1 / n..=q2 / n {
        let q1_sub = if j == q1 / n { q1 % n } else { 0 };
        let q2_sub = if j == q2 / n { q2 % n } else { n - 1 };
        self.range(n, p1_sub, p2_sub, q1_sub, q2_sub, n * i, n * j, self.k * i + j, emit);
      }
    }
  }
  fn range<F: FnMut(usize, usize, &E)>(
    &self,
    n: usize,
    p1: usize,
    p2: usize,
    q1: usize,
    q2: usize,
    dp: usize,
    dq: usize,
    z: usize,
    emit: &mut F,
  ) {
    if z >= self.stems.len() {
      let value = &self.leaves[z - self.stems.len()];
      if *value != self.null {
        emit(dp, dq, value);
      }
    } else if self.stems[z] {
      let m = n / self.k;
      let y = self.child_block(z);
      for i in p1 / m..=p2 / m {
        let p1_sub = if i == p1 / m { p1 % m } else { 0 };
        let p2_sub = if i == p2 / m { p2 % m } else { m - 1 };
        for j in q1 / m..=q2 / m {
          let q1_sub = if j == q1 / m { q1 % m } else { 0 };
          let q2_sub = if j == q2 / m { q2 % m } else { m - 1 };
          self.range(
            m,
            p1_sub,
            p2_sub,
            q1_sub,
            q2_sub,
            dp + m * i,
            dq + m * j,
            y + self.k * i + j,
            emit,
          );
        }
      }
    }
  }
  fn element_in_range(&self, n: usize, p1: usize, p2: usize, q1: usize, q2: usize, z: usize) -> bool {
    if z >= self.stems.len() {
      return self.leaves[z - self.stems.len()] != self.null;
    }
    if self.stems[z] {
      // The sub-range covers this whole block, which is known non-empty.
      // (Bound is the block side n, not n/k.)
      if !self.tainted && p1 == 0 && q1 == 0 && p2 == n - 1 && q2 == n - 1 {
        return true;
      }
      let m = n / self.k;
      let y = self.child_block(z);
      for i in p1 / m..=p2 / m {
        let p1_sub = if i == p1 / m { p1 % m } else { 0 };
        let p2_sub = if i == p2 / m { p2 % m } else { m - 1 };
        for j in q1 / m..=q2 / m {
          let q1_sub = if j == q1 / m { q1 % m } else { 0 };
          let q2_sub = if j == q2 / m { q2 % m } else { m - 1 };
          if self.element_in_range(m, p1_sub, p2_sub, q1_sub, q2_sub, y + self.k * i + j) {
            return true;
          }
        }
      }
    }
    false
  }
  fn set(&mut self, n: usize, p: usize, q: usize, z: usize) {
    if z >= self.stems.len() {
      let index = z - self.stems.len();
      self.leaves[index] = self.null.clone();
    } else if self.stems[z] {
      let m = n / self.k;
      let y = self.child_block(z) + (p / m) * self.k + q / m;
      self.set(m, p % m, q % m, y);
    }
  }
}

/// One entry of the explicit first-successor stack: the side `n` covered by
/// each of the k sub-blocks still to visit, the local row `p`, the column
/// offset `dq`, the position `z` of the next presence bit and the number
/// `j` of siblings already visited.
#[derive(Debug, Clone, Copy)]
struct DescentFrame {
  n: usize,
  p: usize,
  dq: usize,
  z: usize,
  j: usize,
}

/* Builders */
impl<E: Clone + PartialEq> K2Tree<E> {
  /// Post-order recursion over the padded matrix; returns whether the
  /// visited sub-block holds any non-null cell.
  fn build_from_matrix(
    &mut self,
    mat: &[Vec<E>],
    levels: &mut [BitVec],
    num_rows: usize,
    num_cols: usize,
    n: usize,
    l: usize,
    p: usize,
    q: usize,
  ) -> bool {
    let k = self.k;
    if l == self.height {
      let mut block = Vec::with_capacity(k * k);
      for i in 0..k {
        for j in 0..k {
          block.push(if p + i < num_rows && q + j < num_cols {
            mat[p + i][q + j].clone()
          } else {
            self.null.clone()
          });
        }
      }
      if is_all_null(&block, &self.null) {
        false
      } else {
        self.leaves.extend(block);
        true
      }
    } else {
      let m = n / k;
      let mut block: BitVec = BitVec::with_capacity(k * k);
      for i in 0..k {
        for j in 0..k {
          let set = self.build_from_matrix(mat, levels, num_rows, num_cols, m, l + 1, p + i * m, q + j * m);
          block.push(set);
        }
      }
      if block.not_any() {
        false
      } else {
        levels[l - 1].extend_from_bitslice(&block);
        true
      }
    }
  }
  /// As the matrix build, but reads the non-null cells straight off the
  /// per-row cursors.
  fn build_from_lists(
    &mut self,
    lists: &[Vec<(usize, E)>],
    cursors: &mut [usize],
    levels: &mut [BitVec],
    n: usize,
    l: usize,
    p: usize,
    q: usize,
  ) -> bool {
    let k = self.k;
    if l == self.height {
      let mut block = Vec::with_capacity(k * k);
      for i in 0..k {
        for j in 0..k {
          let row = p + i;
          let hit = row < lists.len()
            && cursors[row] < lists[row].len()
            && lists[row][cursors[row]].0 == q + j;
          if hit {
            block.push(lists[row][cursors[row]].1.clone());
            cursors[row] += 1;
          } else {
            block.push(self.null.clone());
          }
        }
      }
      if is_all_null(&block, &self.null) {
        false
      } else {
        self.leaves.extend(block);
        true
      }
    } else {
      let m = n / k;
      let mut block: BitVec = BitVec::with_capacity(k * k);
      for i in 0..k {
        for j in 0..k {
          let set = self.build_from_lists(lists, cursors, levels, m, l + 1, p + i * m, q + j * m);
          block.push(set);
        }
      }
      if block.not_any() {
        false
      } else {
        levels[l - 1].extend_from_bitslice(&block);
        true
      }
    }
  }
  fn build_from_lists_via_tree(&mut self, lists: &[Vec<(usize, E)>]) {
    let mut root = node::Node::Leaf(self.null.clone());
    for (i, cells) in lists.iter().enumerate() {
      for (col, value) in cells {
        node::insert(&mut root, self.k, self.matrix_width, i, *col, value.clone(), &self.null);
      }
    }
    let leaves = &mut self.leaves;
    self.stems = node::linearise(&root, |label: &E| leaves.push(label.clone()));
  }
  fn build_from_lists_dynamic(&mut self, lists: &[Vec<(usize, E)>]) {
    let k2 = self.k * self.k;
    if self.height == 1 {
      self.leaves = vec![self.null.clone(); k2];
      for (i, cells) in lists.iter().enumerate() {
        for (col, value) in cells {
          self.leaves[i * self.k + col] = value.clone();
        }
      }
      if is_all_null(&self.leaves, &self.null) {
        self.leaves.clear();
      }
      return;
    }
    let mut stems = BitVec::new();
    let mut rank = NaiveDynamicRank::new(0);
    for (i, cells) in lists.iter().enumerate() {
      for (col, value) in cells {
        if stems.is_empty() {
          stems = bitvec![0; k2];
          rank = NaiveDynamicRank::new(k2);
        }
        let n = self.matrix_width / self.k;
        let z = (i / n) * self.k + col / n;
        self.insert_dynamic(&mut stems, &mut rank, n, i % n, col % n, value.clone(), z, 1);
      }
    }
    self.stems = stems;
  }
  /// One cell into the growing stem layer: absent blocks spring into
  /// existence as k² zero bits at the position the rank oracle dictates.
  fn insert_dynamic(
    &mut self,
    stems: &mut BitVec,
    rank: &mut NaiveDynamicRank,
    n: usize,
    p: usize,
    q: usize,
    value: E,
    z: usize,
    l: usize,
  ) {
    let k = self.k;
    let k2 = k * k;
    let m = n / k;
    if !stems[z] {
      stems.set(z, true);
      rank.increase_from(z + 1);
      let y = rank.rank1(z + 1) * k2 + (p / m) * k + q / m;
      if l + 1 == self.height {
        let at = rank.rank1(z + 1) * k2 - stems.len();
        for offset in 0..k2 {
          self.leaves.insert(at + offset, self.null.clone());
        }
        self.leaves[y - stems.len()] = value;
      } else {
        let at = rank.rank1(z + 1) * k2;
        for _ in 0..k2 {
          stems.insert(at, false);
        }
        rank.insert(at, k2);
        self.insert_dynamic(stems, rank, m, p % m, q % m, value, y, l + 1);
      }
    } else {
      let y = rank.rank1(z + 1) * k2 + (p / m) * k + q / m;
      if l + 1 == self.height {
        self.leaves[y - stems.len()] = value;
      } else {
        self.insert_dynamic(stems, rank, m, p % m, q % m, value, y, l + 1);
      }
    }
  }
  /// Breadth-first queue of sub-problems over the pair array; each popped
  /// sub-block either partitions its pairs into k² buckets by counting
  /// sort or, at leaf size, materialises its value block.
  fn build_from_pairs(&mut self, pairs: &mut [ValuedPosition<E>]) {
    let k = self.k;
    let k2 = k * k;
    let mut stems = BitVec::new();
    let mut intervals = vec![(0usize, 0usize); k2];
    let mut queue = VecDeque::new();
    queue.push_back(Subproblem {
      first_row: 0,
      last_row: self.matrix_width - 1,
      first_col: 0,
      last_col: self.matrix_width - 1,
      left: 0,
      right: pairs.len(),
    });
    while let Some(sp) = queue.pop_front() {
      let s = sp.last_row - sp.first_row + 1;
      debug_assert_eq!(sp.last_col - sp.first_col + 1, s);
      if s > k {
        self.counting_sort(pairs, &mut intervals, &sp, s / k);
        for i in 0..k2 {
          if intervals[i].0 < intervals[i].1 {
            stems.push(true);
            queue.push_back(Subproblem {
              first_row: sp.first_row + (i / k) * (s / k),
              last_row: sp.first_row + (i / k + 1) * (s / k) - 1,
              first_col: sp.first_col + (i % k) * (s / k),
              last_col: sp.first_col + (i % k + 1) * (s / k) - 1,
              left: sp.left + intervals[i].0,
              right: sp.left + intervals[i].1,
            });
          } else {
            stems.push(false);
          }
        }
      } else {
        let mut block = vec![self.null.clone(); k2];
        for pair in &pairs[sp.left..sp.right] {
          block[(pair.row - sp.first_row) * k + (pair.col - sp.first_col)] = pair.value.clone();
        }
        self.leaves.extend(block);
      }
    }
    self.stems = stems;
  }
  /// Stable counting sort of the sub-problem's pair slice into k² buckets
  /// keyed by the sub-block each pair falls into; records the bucket
  /// boundaries in `intervals`.
  fn counting_sort(
    &self,
    pairs: &mut [ValuedPosition<E>],
    intervals: &mut [(usize, usize)],
    sp: &Subproblem,
    width: usize,
  ) {
    let k2 = self.k * self.k;
    let key = |pair: &ValuedPosition<E>| ((pair.row - sp.first_row) / width) * self.k + (pair.col - sp.first_col) / width;
    let mut counts = vec![0usize; k2];
    for pair in &pairs[sp.left..sp.right] {
      counts[key(pair)] += 1;
    }
    let mut total = 0;
    for bucket in 0..k2 {
      let count = counts[bucket];
      counts[bucket] = total;
      total += count;
      intervals[bucket] = (counts[bucket], total);
    }
    let mut reordered: Vec<Option<ValuedPosition<E>>> = vec![None; sp.right - sp.left];
    for pair in &pairs[sp.left..sp.right] {
      let bucket = key(pair);
      reordered[counts[bucket]] = Some(pair.clone());
      counts[bucket] += 1;
    }
    for (offset, slot) in reordered.into_iter().enumerate() {
      if let Some(pair) = slot {
        pairs[sp.left + offset] = pair;
      }
    }
  }
}

/* Tests */


#[cfg(test)]
mod build {
  use super::*;

  fn sample_lists() -> Vec<Vec<(usize, u16)>> {
    vec![
      vec![(1, 10), (4, 11)],
      vec![],
      vec![(0, 12), (2, 13), (5, 14)],
      vec![(5, 15)],
      vec![],
      vec![(3, 16)],
    ]
  }
  fn lists_as_pairs(lists: &[Vec<(usize, u16)>]) -> Vec<ValuedPosition<u16>> {
    let mut pairs = Vec::new();
    for (row, cells) in lists.iter().enumerate() {
      for &(col, value) in cells {
        pairs.push(ValuedPosition::new(row, col, value));
      }
    }
    // A deliberately scrambled insertion order.
    pairs.reverse();
    pairs
  }

  #[test]
  fn modes_agree() {
    let lists = sample_lists();
    let recursive = K2Tree::from_lists(&lists, 2, ListBuildMode::Recursive, 0).unwrap();
    let tree = K2Tree::from_lists(&lists, 2, ListBuildMode::Tree, 0).unwrap();
    let dynamic = K2Tree::from_lists(&lists, 2, ListBuildMode::Dynamic, 0).unwrap();
    let pairs = K2Tree::from_pairs(lists_as_pairs(&lists), 2, 0).unwrap();
    assert_eq!(recursive.stems(), tree.stems());
    assert_eq!(recursive.stems(), dynamic.stems());
    assert_eq!(recursive.stems(), pairs.stems());
    assert_eq!(recursive.leaves(), tree.leaves());
    assert_eq!(recursive.leaves(), dynamic.leaves());
    assert_eq!(recursive.leaves(), pairs.leaves());
  }
  #[test]
  fn modes_agree_with_matrix() {
    let lists = sample_lists();
    let mut mat = vec![vec![0u16; 6]; 6];
    for (row, cells) in lists.iter().enumerate() {
      for &(col, value) in cells {
        mat[row][col] = value;
      }
    }
    let from_matrix = K2Tree::from_matrix(&mat, 2, 0).unwrap();
    let from_lists = K2Tree::from_lists(&lists, 2, ListBuildMode::Recursive, 0).unwrap();
    assert_eq!(from_matrix, from_lists);
  }
  #[test]
  fn round_trip_against_matrix() {
    let lists = sample_lists();
    let tree = K2Tree::from_lists(&lists, 2, ListBuildMode::Dynamic, 0).unwrap();
    let mut mat = vec![vec![0u16; tree.num_rows()]; tree.num_rows()];
    for (row, cells) in lists.iter().enumerate() {
      for &(col, value) in cells {
        mat[row][col] = value;
      }
    }
    for i in 0..tree.num_rows() {
      for j in 0..tree.num_cols() {
        assert_eq!(tree.get_element(i, j), mat[i][j], "cell ({}, {})", i, j);
      }
    }
  }
  #[test]
  fn from_pairs_empty() {
    let tree = K2Tree::<u16>::from_pairs(Vec::new(), 2, 0).unwrap();
    assert_eq!(tree.height(), 1);
    assert_eq!(tree.num_rows(), 2);
    assert!(tree.stems().is_empty());
    assert!(tree.leaves().is_empty());
    assert_eq!(tree.first_successor(0), 2);
  }
  #[test]
  fn from_lists_empty_rows() {
    let lists: Vec<Vec<(usize, u16)>> = vec![Vec::new(); 5];
    for &mode in &[ListBuildMode::Recursive, ListBuildMode::Tree, ListBuildMode::Dynamic] {
      let tree = K2Tree::from_lists(&lists, 2, mode, 0).unwrap();
      assert!(tree.stems().is_empty());
      assert!(tree.leaves().is_empty());
      assert!(tree.is_empty());
    }
  }
  #[test]
  fn dynamic_height_one() {
    let lists = vec![vec![(1, 3u8)], vec![(0, 4)]];
    let tree = K2Tree::from_lists(&lists, 2, ListBuildMode::Dynamic, 0).unwrap();
    assert_eq!(tree.height(), 1);
    assert!(tree.stems().is_empty());
    assert_eq!(tree.leaves(), &[0, 3, 4, 0]);
  }
  #[test]
  fn with_k_three() {
    let lists = sample_lists();
    let recursive = K2Tree::from_lists(&lists, 3, ListBuildMode::Recursive, 0).unwrap();
    let dynamic = K2Tree::from_lists(&lists, 3, ListBuildMode::Dynamic, 0).unwrap();
    assert_eq!(recursive.num_rows(), 9);
    assert_eq!(recursive, dynamic);
    assert_eq!(recursive.get_element(2, 5), 14);
    assert_eq!(recursive.successor_positions(2), vec![0, 2, 5]);
  }
}
