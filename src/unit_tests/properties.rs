/* Relation-level invariants checked on randomised inputs. */

use std::collections::HashSet;

use rand::Rng;

use crate::{matrix::BitMatrix, BitK2Tree, K2Tree, ListBuildMode, ValuedPosition};

/// A random relation over an `side`×`side` matrix with `cells` distinct
/// non-null cells, as sorted per-row lists.
fn random_lists(side: usize, cells: usize) -> Vec<Vec<(usize, u32)>> {
  let mut rng = rand::thread_rng();
  let mut lists = vec![Vec::new(); side];
  let mut used = HashSet::new();
  while used.len() < cells {
    let row = rng.gen_range(0..side);
    let col = rng.gen_range(0..side);
    if used.insert((row, col)) {
      lists[row].push((col, rng.gen_range(1..100u32)));
    }
  }
  for row in &mut lists {
    row.sort_by_key(|&(col, _)| col);
  }
  lists
}

fn dense(lists: &[Vec<(usize, u32)>], side: usize) -> Vec<Vec<u32>> {
  let mut mat = vec![vec![0u32; side]; side];
  for (row, cells) in lists.iter().enumerate() {
    for &(col, value) in cells {
      mat[row][col] = value;
    }
  }
  mat
}

fn as_pairs(lists: &[Vec<(usize, u32)>]) -> Vec<ValuedPosition<u32>> {
  let mut pairs = Vec::new();
  for (row, cells) in lists.iter().enumerate() {
    for &(col, value) in cells {
      pairs.push(ValuedPosition::new(row, col, value));
    }
  }
  pairs.reverse();
  pairs
}

#[test]
fn random_modes_agree_and_answer_alike() {
  let lists = random_lists(11, 30);
  let mat = dense(&lists, 11);
  let from_matrix = K2Tree::from_matrix(&mat, 3, 0).unwrap();
  let recursive = K2Tree::from_lists(&lists, 3, ListBuildMode::Recursive, 0).unwrap();
  let via_tree = K2Tree::from_lists(&lists, 3, ListBuildMode::Tree, 0).unwrap();
  let dynamic = K2Tree::from_lists(&lists, 3, ListBuildMode::Dynamic, 0).unwrap();
  let inplace = K2Tree::from_pairs(as_pairs(&lists), 3, 0).unwrap();
  let trees = [&from_matrix, &recursive, &via_tree, &dynamic, &inplace];
  for tree in trees {
    assert_eq!(from_matrix.stems(), tree.stems());
    assert_eq!(from_matrix.leaves(), tree.leaves());
  }

  let mut rng = rand::thread_rng();
  let width = from_matrix.num_rows();
  for _ in 0..200 {
    let i = rng.gen_range(0..width);
    let j = rng.gen_range(0..width);
    let expected = from_matrix.get_element(i, j);
    for tree in trees {
      assert_eq!(tree.get_element(i, j), expected);
      assert_eq!(tree.is_not_null(i, j), expected != 0);
    }
    let succs = from_matrix.successor_positions(i);
    let preds = from_matrix.predecessor_positions(j);
    for tree in trees {
      assert_eq!(tree.successor_positions(i), succs);
      assert_eq!(tree.predecessor_positions(j), preds);
    }
  }
}

#[test]
fn round_trip_against_dense_matrix() {
  let lists = random_lists(13, 25);
  let mat = dense(&lists, 13);
  let tree = K2Tree::from_matrix(&mat, 2, 0).unwrap();
  for i in 0..tree.num_rows() {
    for j in 0..tree.num_cols() {
      let expected = if i < 13 && j < 13 { mat[i][j] } else { 0 };
      assert_eq!(tree.get_element(i, j), expected);
    }
  }
}

#[test]
fn count_matches_direct_scan() {
  let lists = random_lists(16, 40);
  let tree = K2Tree::from_lists(&lists, 2, ListBuildMode::Tree, 0).unwrap();
  let scanned: usize = lists.iter().map(Vec::len).sum();
  assert_eq!(tree.count_elements(), scanned);
}

#[test]
fn successor_predecessor_duality() {
  let lists = random_lists(12, 30);
  let tree = K2Tree::from_lists(&lists, 2, ListBuildMode::Dynamic, 0).unwrap();
  let width = tree.num_rows();
  for i in 0..width {
    for j in tree.successor_positions(i) {
      assert!(tree.predecessor_positions(j).contains(&i));
    }
  }
  for j in 0..width {
    for i in tree.predecessor_positions(j) {
      assert!(tree.successor_positions(i).contains(&j));
    }
  }
}

#[test]
fn successors_ascend_predecessors_ascend() {
  let lists = random_lists(17, 45);
  let tree = K2Tree::from_lists(&lists, 3, ListBuildMode::Recursive, 0).unwrap();
  for i in 0..tree.num_rows() {
    let succs = tree.successor_positions(i);
    assert!(succs.windows(2).all(|w| w[0] < w[1]));
    let preds = tree.predecessor_positions(i);
    assert!(preds.windows(2).all(|w| w[0] < w[1]));
  }
}

#[test]
fn range_covers_every_point() {
  let lists = random_lists(10, 20);
  let tree = K2Tree::from_lists(&lists, 2, ListBuildMode::Recursive, 0).unwrap();
  for (row, cells) in lists.iter().enumerate() {
    for &(col, value) in cells {
      let hits = tree.valued_positions_in_range(row, row, col, col);
      assert_eq!(hits, vec![ValuedPosition::new(row, col, value)]);
    }
  }
  for (i, j) in tree.all_positions() {
    assert!(tree.is_not_null(i, j));
  }
}

#[test]
fn all_positions_equal_union_of_rows() {
  let lists = random_lists(9, 18);
  let tree = K2Tree::from_lists(&lists, 3, ListBuildMode::Tree, 0).unwrap();
  let mut by_rows = Vec::new();
  for i in 0..tree.num_rows() {
    for j in tree.successor_positions(i) {
      by_rows.push((i, j));
    }
  }
  let mut reported = tree.all_positions();
  reported.sort_unstable();
  by_rows.sort_unstable();
  assert_eq!(reported, by_rows);
}

#[test]
fn first_successor_is_minimum() {
  let lists = random_lists(14, 28);
  let tree = K2Tree::from_lists(&lists, 2, ListBuildMode::Dynamic, 0).unwrap();
  let width = tree.num_rows();
  for i in 0..width {
    let succs = tree.successor_positions(i);
    let expected = succs.first().copied().unwrap_or(width);
    assert_eq!(tree.first_successor(i), expected);
  }
}

#[test]
fn containment_matches_range_on_fresh_trees() {
  let lists = random_lists(11, 22);
  let tree = K2Tree::from_lists(&lists, 2, ListBuildMode::Recursive, 0).unwrap();
  let width = tree.num_rows();
  let mut rng = rand::thread_rng();
  for _ in 0..100 {
    let i1 = rng.gen_range(0..width);
    let i2 = rng.gen_range(i1..width);
    let j1 = rng.gen_range(0..width);
    let j2 = rng.gen_range(j1..width);
    let populated = !tree.positions_in_range(i1, i2, j1, j2).is_empty();
    assert_eq!(tree.contains_element(i1, i2, j1, j2), populated);
  }
}

#[test]
fn containment_stays_exact_after_set_null() {
  let lists = random_lists(8, 12);
  let mut tree = K2Tree::from_lists(&lists, 2, ListBuildMode::Recursive, 0).unwrap();
  let positions = tree.all_positions();
  for &(i, j) in &positions {
    tree.set_null(i, j);
  }
  assert_eq!(tree.count_elements(), 0);
  let width = tree.num_rows();
  assert!(!tree.contains_element(0, width - 1, 0, width - 1));
  for &(i, j) in &positions {
    assert!(!tree.contains_element(i, i, j, j));
  }
}

#[test]
fn clone_is_deep() {
  let lists = random_lists(10, 15);
  let tree = K2Tree::from_lists(&lists, 2, ListBuildMode::Tree, 0).unwrap();
  let mut copy = tree.clone();
  for (i, j) in tree.all_positions() {
    copy.set_null(i, j);
  }
  assert_eq!(
    tree.count_elements(),
    lists.iter().map(Vec::len).sum::<usize>()
  );
  assert_eq!(copy.count_elements(), 0);
}

#[test]
fn boolean_variant_mirrors_valued_occupancy() {
  let lists = random_lists(12, 24);
  let bool_lists: Vec<Vec<usize>> = lists
    .iter()
    .map(|row| row.iter().map(|&(col, _)| col).collect())
    .collect();
  let valued = K2Tree::from_lists(&lists, 2, ListBuildMode::Recursive, 0).unwrap();
  let boolean = BitK2Tree::from_lists(&bool_lists, 2, ListBuildMode::Recursive).unwrap();
  assert_eq!(valued.stems(), boolean.stems());
  assert_eq!(valued.all_positions(), boolean.all_positions());
  assert_eq!(valued.count_elements(), boolean.count_links());
  for i in 0..valued.num_rows() {
    assert_eq!(valued.successor_positions(i), boolean.successors(i));
    assert_eq!(valued.first_successor(i), boolean.first_successor(i));
  }
}

#[test]
fn boolean_round_trip_through_bit_matrix() {
  let mut rng = rand::thread_rng();
  let mut m = BitMatrix::with_dimensions(16, 16);
  for _ in 0..48 {
    let x = rng.gen_range(0..16);
    let y = rng.gen_range(0..16);
    m.set(x, y, true).unwrap();
  }
  let tree = BitK2Tree::from_matrix(&m, 2).unwrap();
  let rebuilt = tree.to_bit_matrix().unwrap();
  assert_eq!(m, rebuilt);
}

#[test]
fn flood_of_random_queries_stays_total() {
  let lists = random_lists(20, 60);
  let tree = K2Tree::from_lists(&lists, 2, ListBuildMode::Dynamic, 0).unwrap();
  let width = tree.num_rows();
  let mut rng = rand::thread_rng();
  for _ in 0..500 {
    let i = rng.gen_range(0..width);
    let j = rng.gen_range(0..width);
    tree.get_element(i, j);
    tree.is_not_null(i, j);
    tree.first_successor(i);
  }
}
