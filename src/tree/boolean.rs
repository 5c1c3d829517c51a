use std::collections::VecDeque;

use {
  bitvec::{order::Lsb0, prelude::bitvec, vec::BitVec},
  serde::{Deserialize, Serialize},
  crate::error::K2TreeError as Error,
  crate::matrix::BitMatrix,
  crate::rank::{NaiveDynamicRank, RankIndex},
  crate::tree::{log_k, node, ListBuildMode, Subproblem, SubrowInfo, ValuedPosition},
};

type Result<T> = std::result::Result<T, Error>;

/// The Boolean rendition of [`K2Tree`](crate::K2Tree): a compressed
/// adjacency matrix whose only non-null value is `true`.
///
/// The layout is identical to the valued tree, but the leaf layer packs
/// into a bit vector and counting reduces to a popcount. Queries come in
/// graph flavour (`are_related`, `successors`, `predecessors`); the
/// element-returning queries of the shared surface degenerate to lists of
/// `true` and exist for interchangeability with the valued tree.
///
/// ```
/// use k2_relation::{BitK2Tree, matrix::BitMatrix};
///
/// // The 4x4 identity relation.
/// let mut m = BitMatrix::with_dimensions(4, 4);
/// for i in 0..4 {
///   m.set(i, i, true).unwrap();
/// }
/// let tree = BitK2Tree::from_matrix(&m, 2).unwrap();
/// assert!(tree.are_related(2, 2));
/// assert!(!tree.are_related(2, 3));
/// assert_eq!(tree.successors(1), vec![1]);
/// assert_eq!(tree.predecessors(3), vec![3]);
/// assert_eq!(tree.count_links(), 4);
/// ```
#[derive(Debug, Serialize, Deserialize)]
pub struct BitK2Tree {
  k: usize,
  height: usize,
  matrix_width: usize,
  stems: BitVec,
  leaves: BitVec,
  ranks: RankIndex,
  tainted: bool,
}

/* Construction */
impl BitK2Tree {
  /// Builds a tree from a dense bit-matrix.
  ///
  /// Fails if `k < 2` or the matrix has no rows or no columns.
  pub fn from_matrix(mat: &BitMatrix, k: usize) -> Result<Self> {
    if k < 2 {
      return Err(Error::SmallKValue { k });
    }
    if mat.width == 0 || mat.height == 0 {
      return Err(Error::EmptyInput);
    }
    let height = std::cmp::max(1, log_k(std::cmp::max(mat.height, mat.width), k));
    let mut tree = Self::scaffold(k, height);
    let mut levels = vec![BitVec::new(); height];
    tree.build_from_matrix(mat, &mut levels, tree.matrix_width, 1, 0, 0);
    let leaves = levels.pop().unwrap_or_default();
    for level in &levels {
      tree.stems.extend_from_bitslice(level);
    }
    tree.leaves = leaves;
    tree.ranks = RankIndex::new(&tree.stems);
    Ok(tree)
  }
  /// Builds a tree from per-row adjacency lists: `lists[i]` holds the
  /// linked columns of row i in strictly ascending order.
  pub fn from_lists(lists: &[Vec<usize>], k: usize, mode: ListBuildMode) -> Result<Self> {
    if k < 2 {
      return Err(Error::SmallKValue { k });
    }
    let mut max_col = 0;
    for (row, cols) in lists.iter().enumerate() {
      for window in cols.windows(2) {
        if window[1] <= window[0] {
          return Err(Error::UnsortedColumns {
            row,
            col: window[1],
          });
        }
      }
      if let Some(&last) = cols.last() {
        max_col = std::cmp::max(max_col, last);
      }
    }
    let height = std::cmp::max(1, log_k(std::cmp::max(lists.len(), max_col + 1), k));
    let mut tree = Self::scaffold(k, height);
    match mode {
      ListBuildMode::Recursive => {
        let mut cursors = vec![0usize; lists.len()];
        let mut levels = vec![BitVec::new(); height];
        tree.build_from_lists(lists, &mut cursors, &mut levels, tree.matrix_width, 1, 0, 0);
        let leaves = levels.pop().unwrap_or_default();
        for level in &levels {
          tree.stems.extend_from_bitslice(level);
        }
        tree.leaves = leaves;
      }
      ListBuildMode::Tree => tree.build_from_lists_via_tree(lists),
      ListBuildMode::Dynamic => tree.build_from_lists_dynamic(lists),
    }
    tree.ranks = RankIndex::new(&tree.stems);
    Ok(tree)
  }
  /// Builds a tree from an unordered list of (row, column) links,
  /// reordering the list in place sub-block by sub-block.
  pub fn from_pairs(mut pairs: Vec<(usize, usize)>, k: usize) -> Result<Self> {
    if k < 2 {
      return Err(Error::SmallKValue { k });
    }
    let mut max_index = 0;
    for &(row, col) in &pairs {
      max_index = std::cmp::max(max_index, std::cmp::max(row, col));
    }
    let height = std::cmp::max(1, log_k(max_index + 1, k));
    let mut tree = Self::scaffold(k, height);
    if !pairs.is_empty() {
      tree.build_from_pairs(&mut pairs);
    }
    tree.ranks = RankIndex::new(&tree.stems);
    Ok(tree)
  }

  fn scaffold(k: usize, height: usize) -> Self {
    BitK2Tree {
      k,
      height,
      matrix_width: k.pow(height as u32),
      stems: BitVec::new(),
      leaves: BitVec::new(),
      ranks: RankIndex::default(),
      tainted: false,
    }
  }
}

/* Parameters */
impl BitK2Tree {
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
  /// The stem layer.
  pub fn stems(&self) -> &BitVec {
    &self.stems
  }
  /// The leaf layer.
  pub fn leaves(&self) -> &BitVec {
    &self.leaves
  }
  /// Returns true if the relation holds no link.
  pub fn is_empty(&self) -> bool {
    self.leaves.not_any()
  }
}

/* Queries */
impl BitK2Tree {
  /// Returns whether the link (i, j) exists.
  ///
  /// Panics if `i` or `j` is at or beyond [`num_rows`](BitK2Tree::num_rows).
  pub fn are_related(&self, i: usize, j: usize) -> bool {
    self.assert_cell_in_bounds(i, j);
    if self.leaves.is_empty() {
      return false;
    }
    let n = self.matrix_width / self.k;
    self.check_link(n, i % n, j % n, (i / n) * self.k + j / n)
  }
  /// The columns linked from row i, ascending.
  pub fn successors(&self, i: usize) -> Vec<usize> {
    let mut succs = Vec::new();
    self.each_successor(i, &mut |col| succs.push(col));
    succs
  }
  /// The rows linking to column j, ascending.
  pub fn predecessors(&self, j: usize) -> Vec<usize> {
    let mut preds = Vec::new();
    self.each_predecessor(j, &mut |row| preds.push(row));
    preds
  }
  /// The smallest column linked from row i, or the padded width if row i
  /// links nowhere.
  ///
  /// Panics if `i` is at or beyond [`num_rows`](BitK2Tree::num_rows).
  pub fn first_successor(&self, i: usize) -> usize {
    self.assert_line_in_bounds(i);
    if self.leaves.is_empty() {
      return self.matrix_width;
    }
    if self.stems.is_empty() {
      let offset = i * self.matrix_width;
      for j in 0..self.matrix_width {
        if self.leaves[offset + j] {
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
        if self.leaves[cur.z - self.stems.len()] {
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
  /// The (row, column) links in the rectangle rows i1..=i2, columns
  /// j1..=j2, in sub-block order.
  pub fn links_in_range(&self, i1: usize, i2: usize, j1: usize, j2: usize) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    self.each_in_range(i1, i2, j1, j2, &mut |row, col| pairs.push((row, col)));
    pairs
  }
  /// Returns whether the rectangle rows i1..=i2, columns j1..=j2 holds at
  /// least one link.
  ///
  /// Panics if the rectangle reaches past [`num_rows`](BitK2Tree::num_rows).
  pub fn contains_link(&self, i1: usize, i2: usize, j1: usize, j2: usize) -> bool {
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
        if self.link_in_range(n, p1, p2, q1, q2, self.k * i + j) {
          return true;
        }
      }
    }
    false
  }
  /// The number of links; a popcount of the leaf layer.
  pub fn count_links(&self) -> usize {
    self.leaves.count_ones()
  }
  /// Unsets the link (i, j) without repairing the stems; disables the
  /// fully-covered shortcut of [`contains_link`](BitK2Tree::contains_link).
  ///
  /// Panics if `i` or `j` is at or beyond [`num_rows`](BitK2Tree::num_rows).
  pub fn set_null(&mut self, i: usize, j: usize) {
    self.assert_cell_in_bounds(i, j);
    if self.leaves.is_empty() {
      return;
    }
    self.tainted = true;
    let n = self.matrix_width / self.k;
    self.unset(n, i % n, j % n, (i / n) * self.k + j / n);
  }
  /// Rebuilds the dense bit-matrix this tree represents, at the padded
  /// width.
  pub fn to_bit_matrix(&self) -> Result<BitMatrix> {
    let mut m = BitMatrix::with_dimensions(self.matrix_width, self.matrix_width);
    for (i, j) in self.all_positions() {
      m.set(j, i, true)?;
    }
    Ok(m)
  }
  /// Prints the tree parameters and, if `all`, the raw bits of both layers
  /// and the rank samples.
  pub fn print(&self, all: bool) {
    println!("### Parameters ###");
    println!("h  = {}", self.height);
    println!("k  = {}", self.k);
    println!("n' = {}", self.matrix_width);
    println!("null = false");
    if all {
      println!("### T ###");
      for bit in self.stems.iter().by_vals() {
        print!("{}", bit as usize);
      }
      println!();
      println!("### L ###");
      for bit in self.leaves.iter().by_vals() {
        print!("{}", bit as usize);
      }
      println!();
      println!("### R ###");
      println!("{:?}", self.ranks);
    }
  }
}

/* General queries, for interchangeability with the valued tree. */
impl BitK2Tree {
  /// Alias of [`are_related`](BitK2Tree::are_related).
  pub fn is_not_null(&self, i: usize, j: usize) -> bool {
    self.are_related(i, j)
  }
  /// Alias of [`are_related`](BitK2Tree::are_related).
  pub fn get_element(&self, i: usize, j: usize) -> bool {
    self.are_related(i, j)
  }
  /// One `true` per link in row i.
  pub fn successor_elements(&self, i: usize) -> Vec<bool> {
    vec![true; self.successors(i).len()]
  }
  /// Alias of [`successors`](BitK2Tree::successors).
  pub fn successor_positions(&self, i: usize) -> Vec<usize> {
    self.successors(i)
  }
  /// The links of row i as (row, column, true) triples.
  pub fn successor_valued_positions(&self, i: usize) -> Vec<ValuedPosition<bool>> {
    self
      .successors(i)
      .into_iter()
      .map(|j| ValuedPosition::new(i, j, true))
      .collect()
  }
  /// One `true` per link in column j.
  pub fn predecessor_elements(&self, j: usize) -> Vec<bool> {
    vec![true; self.predecessors(j).len()]
  }
  /// Alias of [`predecessors`](BitK2Tree::predecessors).
  pub fn predecessor_positions(&self, j: usize) -> Vec<usize> {
    self.predecessors(j)
  }
  /// The links of column j as (row, column, true) triples.
  pub fn predecessor_valued_positions(&self, j: usize) -> Vec<ValuedPosition<bool>> {
    self
      .predecessors(j)
      .into_iter()
      .map(|i| ValuedPosition::new(i, j, true))
      .collect()
  }
  /// One `true` per link in the rectangle.
  pub fn elements_in_range(&self, i1: usize, i2: usize, j1: usize, j2: usize) -> Vec<bool> {
    vec![true; self.links_in_range(i1, i2, j1, j2).len()]
  }
  /// Alias of [`links_in_range`](BitK2Tree::links_in_range).
  pub fn positions_in_range(
    &self,
    i1: usize,
    i2: usize,
    j1: usize,
    j2: usize,
  ) -> Vec<(usize, usize)> {
    self.links_in_range(i1, i2, j1, j2)
  }
  /// The links in the rectangle as (row, column, true) triples.
  pub fn valued_positions_in_range(
    &self,
    i1: usize,
    i2: usize,
    j1: usize,
    j2: usize,
  ) -> Vec<ValuedPosition<bool>> {
    self
      .links_in_range(i1, i2, j1, j2)
      .into_iter()
      .map(|(i, j)| ValuedPosition::new(i, j, true))
      .collect()
  }
  /// One `true` per link.
  pub fn all_elements(&self) -> Vec<bool> {
    vec![true; self.count_links()]
  }
  /// Every link as a (row, column) pair.
  pub fn all_positions(&self) -> Vec<(usize, usize)> {
    self.links_in_range(0, self.matrix_width - 1, 0, self.matrix_width - 1)
  }
  /// Every link as a (row, column, true) triple.
  pub fn all_valued_positions(&self) -> Vec<ValuedPosition<bool>> {
    self.valued_positions_in_range(0, self.matrix_width - 1, 0, self.matrix_width - 1)
  }
  /// Alias of [`contains_link`](BitK2Tree::contains_link).
  pub fn contains_element(&self, i1: usize, i2: usize, j1: usize, j2: usize) -> bool {
    self.contains_link(i1, i2, j1, j2)
  }
  /// Alias of [`count_links`](BitK2Tree::count_links).
  pub fn count_elements(&self) -> usize {
    self.count_links()
  }
}

/* Traits */
impl crate::tree::K2Relation for BitK2Tree {
  type Elem = bool;
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
  fn null_value(&self) -> bool {
    false
  }
  fn is_not_null(&self, i: usize, j: usize) -> bool {
    BitK2Tree::are_related(self, i, j)
  }
  fn get_element(&self, i: usize, j: usize) -> bool {
    BitK2Tree::are_related(self, i, j)
  }
  fn successor_elements(&self, i: usize) -> Vec<bool> {
    BitK2Tree::successor_elements(self, i)
  }
  fn successor_positions(&self, i: usize) -> Vec<usize> {
    BitK2Tree::successors(self, i)
  }
  fn successor_valued_positions(&self, i: usize) -> Vec<ValuedPosition<bool>> {
    BitK2Tree::successor_valued_positions(self, i)
  }
  fn predecessor_elements(&self, j: usize) -> Vec<bool> {
    BitK2Tree::predecessor_elements(self, j)
  }
  fn predecessor_positions(&self, j: usize) -> Vec<usize> {
    BitK2Tree::predecessors(self, j)
  }
  fn predecessor_valued_positions(&self, j: usize) -> Vec<ValuedPosition<bool>> {
    BitK2Tree::predecessor_valued_positions(self, j)
  }
  fn first_successor(&self, i: usize) -> usize {
    BitK2Tree::first_successor(self, i)
  }
  fn elements_in_range(&self, i1: usize, i2: usize, j1: usize, j2: usize) -> Vec<bool> {
    BitK2Tree::elements_in_range(self, i1, i2, j1, j2)
  }
  fn positions_in_range(&self, i1: usize, i2: usize, j1: usize, j2: usize) -> Vec<(usize, usize)> {
    BitK2Tree::links_in_range(self, i1, i2, j1, j2)
  }
  fn valued_positions_in_range(
    &self,
    i1: usize,
    i2: usize,
    j1: usize,
    j2: usize,
  ) -> Vec<ValuedPosition<bool>> {
    BitK2Tree::valued_positions_in_range(self, i1, i2, j1, j2)
  }
  fn all_elements(&self) -> Vec<bool> {
    BitK2Tree::all_elements(self)
  }
  fn all_positions(&self) -> Vec<(usize, usize)> {
    BitK2Tree::all_positions(self)
  }
  fn all_valued_positions(&self) -> Vec<ValuedPosition<bool>> {
    BitK2Tree::all_valued_positions(self)
  }
  fn contains_element(&self, i1: usize, i2: usize, j1: usize, j2: usize) -> bool {
    BitK2Tree::contains_link(self, i1, i2, j1, j2)
  }
  fn count_elements(&self) -> usize {
    BitK2Tree::count_links(self)
  }
  fn set_null(&mut self, i: usize, j: usize) {
    BitK2Tree::set_null(self, i, j)
  }
}

impl Clone for BitK2Tree {
  fn clone(&self) -> Self {
    let stems = self.stems.clone();
    let ranks = RankIndex::new(&stems);
    BitK2Tree {
      k: self.k,
      height: self.height,
      matrix_width: self.matrix_width,
      stems,
      leaves: self.leaves.clone(),
      ranks,
      tainted: self.tainted,
    }
  }
}
impl PartialEq for BitK2Tree {
  fn eq(&self, other: &Self) -> bool {
    self.k == other.k
      && self.matrix_width == other.matrix_width
      && self.stems == other.stems
      && self.leaves == other.leaves
  }
}
impl Eq for BitK2Tree {}
impl std::hash::Hash for BitK2Tree {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.k.hash(state);
    self.matrix_width.hash(state);
    self.stems.hash(state);
    self.leaves.hash(state);
  }
}
impl std::fmt::Display for BitK2Tree {
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
    for (pos, bit) in self.leaves.iter().by_vals().enumerate() {
      if pos > 0 && pos % k2 == 0 {
        s.push(',');
      }
      s.push(if bit { '1' } else { '0' });
    }
    write!(f, "[{}]", s)
  }
}

/* Descents */
impl BitK2Tree {
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
  fn child_block(&self, z: usize) -> usize {
    self.ranks.rank1(&self.stems, z + 1) * self.k * self.k
  }
  fn level_len(&self, start: usize) -> usize {
    let k2 = self.k * self.k;
    (self.ranks.rank1(&self.stems, start) + 1) * k2 - start
  }
  fn check_link(&self, n: usize, p: usize, q: usize, z: usize) -> bool {
    if z >= self.stems.len() {
      self.leaves[z - self.stems.len()]
    } else if self.stems[z] {
      let m = n / self.k;
      self.check_link(m, p % m, q % m, self.child_block(z) + (p / m) * self.k + q / m)
    } else {
      false
    }
  }
  fn each_successor<F: FnMut(usize)>(&self, p: usize, emit: &mut F) {
    self.assert_line_in_bounds(p);
    if self.leaves.is_empty() {
      return;
    }
    let k = self.k;
    let len_t = self.stems.len();
    if len_t == 0 {
      let offset = p * self.matrix_width;
      for j in 0..self.matrix_width {
        if self.leaves[offset + j] {
          emit(j);
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
          if self.leaves[y] {
            emit(dq);
          }
          dq += 1;
          y += 1;
        }
      }
    }
  }
  fn each_predecessor<F: FnMut(usize)>(&self, q: usize, emit: &mut F) {
    self.assert_line_in_bounds(q);
    if self.leaves.is_empty() {
      return;
    }
    let n = self.matrix_width / self.k;
    let y = q / n;
    for i in 0..self.k {
      self.predecessor_links(n, q % n, n * i, y + i * self.k, emit);
    }
  }
  fn predecessor_links<F: FnMut(usize)>(&self, n: usize, q: usize, p: usize, z: usize, emit: &mut F) {
    if z >= self.stems.len() {
      if self.leaves[z - self.stems.len()] {
        emit(p);
      }
    } else if self.stems[z] {
      let m = n / self.k;
      let y = self.child_block(z) + q / m;
      for i in 0..self.k {
        self.predecessor_links(m, q % m, p + m * i, y + i * self.k, emit);
      }
    }
  }
  fn each_in_range<F: FnMut(usize, usize)>(
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
        self.range_links(n, p1_sub, p2_sub, q1_sub, q2_sub, n * i, n * j, self.k * i + j, emit);
      }
    }
  }
  fn range_links<F: FnMut(usize, usize)>(
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
      if self.leaves[z - self.stems.len()] {
        emit(dp, dq);
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
          self.range_links(
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
  fn link_in_range(&self, n: usize, p1: usize, p2: usize, q1: usize, q2: usize, z: usize) -> bool {
    if z >= self.stems.len() {
      return self.leaves[z - self.stems.len()];
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
          if self.link_in_range(m, p1_sub, p2_sub, q1_sub, q2_sub, y + self.k * i + j) {
            return true;
          }
        }
      }
    }
    false
  }
  fn unset(&mut self, n: usize, p: usize, q: usize, z: usize) {
    if z >= self.stems.len() {
      let index = z - self.stems.len();
      self.leaves.set(index, false);
    } else if self.stems[z] {
      let m = n / self.k;
      let y = self.child_block(z) + (p / m) * self.k + q / m;
      self.unset(m, p % m, q % m, y);
    }
  }
}

/// One entry of the explicit first-successor stack; see the valued tree.
#[derive(Debug, Clone, Copy)]
struct DescentFrame {
  n: usize,
  p: usize,
  dq: usize,
  z: usize,
  j: usize,
}

/* Builders */
impl BitK2Tree {
  /// Post-order recursion over the padded matrix. The last level buffer
  /// collects the leaf bits; the others become stem levels.
  fn build_from_matrix(
    &mut self,
    mat: &BitMatrix,
    levels: &mut [BitVec],
    n: usize,
    l: usize,
    p: usize,
    q: usize,
  ) -> bool {
    let k = self.k;
    let mut block: BitVec = BitVec::with_capacity(k * k);
    if l == self.height {
      for i in 0..k {
        for j in 0..k {
          let bit =
            p + i < mat.height && q + j < mat.width && mat.get(q + j, p + i).unwrap_or(false);
          block.push(bit);
        }
      }
    } else {
      let m = n / k;
      for i in 0..k {
        for j in 0..k {
          let set = self.build_from_matrix(mat, levels, m, l + 1, p + i * m, q + j * m);
          block.push(set);
        }
      }
    }
    if block.not_any() {
      false
    } else {
      levels[l - 1].extend_from_bitslice(&block);
      true
    }
  }
  fn build_from_lists(
    &mut self,
    lists: &[Vec<usize>],
    cursors: &mut [usize],
    levels: &mut [BitVec],
    n: usize,
    l: usize,
    p: usize,
    q: usize,
  ) -> bool {
    let k = self.k;
    let mut block: BitVec = BitVec::with_capacity(k * k);
    if l == self.height {
      for i in 0..k {
        for j in 0..k {
          let row = p + i;
          let hit =
            row < lists.len() && cursors[row] < lists[row].len() && lists[row][cursors[row]] == q + j;
          if hit {
            cursors[row] += 1;
          }
          block.push(hit);
        }
      }
    } else {
      let m = n / k;
      for i in 0..k {
        for j in 0..k {
          let set = self.build_from_lists(lists, cursors, levels, m, l + 1, p + i * m, q + j * m);
          block.push(set);
        }
      }
    }
    if block.not_any() {
      false
    } else {
      levels[l - 1].extend_from_bitslice(&block);
      true
    }
  }
  fn build_from_lists_via_tree(&mut self, lists: &[Vec<usize>]) {
    let mut root = node::Node::Leaf(false);
    for (i, cols) in lists.iter().enumerate() {
      for &col in cols {
        node::insert(&mut root, self.k, self.matrix_width, i, col, true, &false);
      }
    }
    let leaves = &mut self.leaves;
    self.stems = node::linearise(&root, |&label| leaves.push(label));
  }
  fn build_from_lists_dynamic(&mut self, lists: &[Vec<usize>]) {
    let k2 = self.k * self.k;
    if self.height == 1 {
      self.leaves = bitvec![0; k2];
      for (i, cols) in lists.iter().enumerate() {
        for &col in cols {
          self.leaves.set(i * self.k + col, true);
        }
      }
      if self.leaves.not_any() {
        self.leaves = BitVec::new();
      }
      return;
    }
    let mut stems = BitVec::new();
    let mut rank = NaiveDynamicRank::new(0);
    for (i, cols) in lists.iter().enumerate() {
      for &col in cols {
        if stems.is_empty() {
          stems = bitvec![0; k2];
          rank = NaiveDynamicRank::new(k2);
        }
        let n = self.matrix_width / self.k;
        let z = (i / n) * self.k + col / n;
        self.insert_dynamic(&mut stems, &mut rank, n, i % n, col % n, z, 1);
      }
    }
    self.stems = stems;
  }
  fn insert_dynamic(
    &mut self,
    stems: &mut BitVec,
    rank: &mut NaiveDynamicRank,
    n: usize,
    p: usize,
    q: usize,
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
        for _ in 0..k2 {
          self.leaves.insert(at, false);
        }
        self.leaves.set(y - stems.len(), true);
      } else {
        let at = rank.rank1(z + 1) * k2;
        for _ in 0..k2 {
          stems.insert(at, false);
        }
        rank.insert(at, k2);
        self.insert_dynamic(stems, rank, m, p % m, q % m, y, l + 1);
      }
    } else {
      let y = rank.rank1(z + 1) * k2 + (p / m) * k + q / m;
      if l + 1 == self.height {
        self.leaves.set(y - stems.len(), true);
      } else {
        self.insert_dynamic(stems, rank, m, p % m, q % m, y, l + 1);
      }
    }
  }
  fn build_from_pairs(&mut self, pairs: &mut [(usize, usize)]) {
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
        let mut block = bitvec![0; k2];
        for &(row, col) in &pairs[sp.left..sp.right] {
          block.set((row - sp.first_row) * k + (col - sp.first_col), true);
        }
        self.leaves.extend_from_bitslice(&block);
      }
    }
    self.stems = stems;
  }
  fn counting_sort(
    &self,
    pairs: &mut [(usize, usize)],
    intervals: &mut [(usize, usize)],
    sp: &Subproblem,
    width: usize,
  ) {
    let k2 = self.k * self.k;
    let key =
      |pair: &(usize, usize)| ((pair.0 - sp.first_row) / width) * self.k + (pair.1 - sp.first_col) / width;
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
    let mut reordered = vec![(0usize, 0usize); sp.right - sp.left];
    for pair in &pairs[sp.left..sp.right] {
      let bucket = key(pair);
      reordered[counts[bucket]] = *pair;
      counts[bucket] += 1;
    }
    pairs[sp.left..sp.right].copy_from_slice(&reordered);
  }
}

/* Tests */


#[cfg(test)]
mod build {
  use super::*;

  fn sample_lists() -> Vec<Vec<usize>> {
    vec![
      vec![1, 4],
      vec![],
      vec![0, 2, 5],
      vec![5],
      vec![],
      vec![3],
    ]
  }

  #[test]
  fn modes_agree() {
    let lists = sample_lists();
    let mut pairs = Vec::new();
    for (row, cols) in lists.iter().enumerate() {
      for &col in cols {
        pairs.push((row, col));
      }
    }
    pairs.reverse();
    let recursive = BitK2Tree::from_lists(&lists, 2, ListBuildMode::Recursive).unwrap();
    let tree = BitK2Tree::from_lists(&lists, 2, ListBuildMode::Tree).unwrap();
    let dynamic = BitK2Tree::from_lists(&lists, 2, ListBuildMode::Dynamic).unwrap();
    let inplace = BitK2Tree::from_pairs(pairs, 2).unwrap();
    assert_eq!(recursive.stems(), tree.stems());
    assert_eq!(recursive.stems(), dynamic.stems());
    assert_eq!(recursive.stems(), inplace.stems());
    assert_eq!(recursive.leaves(), tree.leaves());
    assert_eq!(recursive.leaves(), dynamic.leaves());
    assert_eq!(recursive.leaves(), inplace.leaves());
  }
  #[test]
  fn modes_agree_with_matrix() {
    let lists = sample_lists();
    let mut m = BitMatrix::with_dimensions(6, 6);
    for (row, cols) in lists.iter().enumerate() {
      for &col in cols {
        m.set(col, row, true).unwrap();
      }
    }
    let from_matrix = BitK2Tree::from_matrix(&m, 2).unwrap();
    let from_lists = BitK2Tree::from_lists(&lists, 2, ListBuildMode::Tree).unwrap();
    assert_eq!(from_matrix, from_lists);
  }
  #[test]
  fn round_trip() {
    let lists = sample_lists();
    let tree = BitK2Tree::from_lists(&lists, 2, ListBuildMode::Dynamic).unwrap();
    for i in 0..tree.num_rows() {
      for j in 0..tree.num_cols() {
        let expected = i < lists.len() && lists[i].contains(&j);
        assert_eq!(tree.are_related(i, j), expected, "link ({}, {})", i, j);
      }
    }
  }
  #[test]
  fn from_pairs_empty() {
    let tree = BitK2Tree::from_pairs(Vec::new(), 2).unwrap();
    assert_eq!(tree.height(), 1);
    assert!(tree.stems().is_empty());
    assert!(tree.leaves().is_empty());
    assert!(tree.is_empty());
  }
  #[test]
  fn dynamic_height_one() {
    let lists = vec![vec![1], vec![0]];
    let tree = BitK2Tree::from_lists(&lists, 2, ListBuildMode::Dynamic).unwrap();
    assert_eq!(tree.height(), 1);
    assert!(tree.stems().is_empty());
    assert_eq!(tree.leaves(), &bitvec![0, 1, 1, 0]);
  }
  #[test]
  fn validation() {
    assert_eq!(
      BitK2Tree::from_matrix(&BitMatrix::new(), 2),
      Err(Error::EmptyInput)
    );
    assert_eq!(
      BitK2Tree::from_pairs(vec![(0, 0)], 1),
      Err(Error::SmallKValue { k: 1 })
    );
    assert_eq!(
      BitK2Tree::from_lists(&[vec![3, 3]], 2, ListBuildMode::Recursive),
      Err(Error::UnsortedColumns { row: 0, col: 3 })
    );
  }
  #[test]
  fn with_k_three() {
    let lists = sample_lists();
    let recursive = BitK2Tree::from_lists(&lists, 3, ListBuildMode::Recursive).unwrap();
    let dynamic = BitK2Tree::from_lists(&lists, 3, ListBuildMode::Dynamic).unwrap();
    assert_eq!(recursive.num_rows(), 9);
    assert_eq!(recursive, dynamic);
    assert_eq!(recursive.successors(2), vec![0, 2, 5]);
    assert_eq!(recursive.predecessors(5), vec![2, 3]);
  }
}
