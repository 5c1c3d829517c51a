/* Fixture scenarios exercised across variants and construction modes. */

use crate::{
  matrix::BitMatrix,
  BitK2Tree, K2Tree, ListBuildMode, ValuedPosition,
};
use bitvec::prelude::*;

#[test]
fn single_value_in_padded_matrix() {
  // 3x3 with the lone value 7 at (1, 2), k = 2: pads to 4x4, height 2.
  let mut mat = vec![vec![0u32; 3]; 3];
  mat[1][2] = 7;
  let tree = K2Tree::from_matrix(&mat, 2, 0).unwrap();
  assert_eq!(tree.height(), 2);
  assert_eq!(tree.num_rows(), 4);
  assert_eq!(tree.get_element(1, 2), 7);
  assert_eq!(tree.successor_positions(1), vec![2]);
  assert_eq!(tree.predecessor_positions(2), vec![1]);
  assert_eq!(tree.first_successor(1), 2);
  assert_eq!(tree.first_successor(0), 4);
  assert_eq!(tree.count_elements(), 1);
}

#[test]
fn all_null_matrix_with_k_three() {
  let tree = K2Tree::from_matrix(&vec![vec![0u8; 5]; 5], 3, 0).unwrap();
  assert_eq!(tree.height(), 2);
  assert_eq!(tree.num_rows(), 9);
  assert!(tree.stems().is_empty());
  assert!(tree.leaves().is_empty());
  for i in 0..9 {
    assert_eq!(tree.successor_positions(i), Vec::<usize>::new());
    assert_eq!(tree.predecessor_positions(i), Vec::<usize>::new());
    assert_eq!(tree.first_successor(i), 9);
  }
  assert!(!tree.contains_element(0, 8, 0, 8));
  assert_eq!(tree.all_positions(), Vec::<(usize, usize)>::new());
  assert_eq!(tree.count_elements(), 0);
}

#[test]
fn full_two_by_two_links() {
  let m = BitMatrix::from_bits(2, 2, vec![true; 4]);
  let tree = BitK2Tree::from_matrix(&m, 2).unwrap();
  assert_eq!(tree.height(), 1);
  assert!(tree.stems().is_empty());
  assert_eq!(tree.leaves(), &bitvec![1, 1, 1, 1]);
  for i in 0..2 {
    for j in 0..2 {
      assert!(tree.are_related(i, j));
    }
  }
  assert_eq!(tree.count_links(), 4);
  assert_eq!(tree.first_successor(0), 0);
}

#[test]
fn identity_relation() {
  let mut m = BitMatrix::with_dimensions(4, 4);
  for i in 0..4 {
    m.set(i, i, true).unwrap();
  }
  let tree = BitK2Tree::from_matrix(&m, 2).unwrap();
  for i in 0..4 {
    assert_eq!(tree.successors(i), vec![i]);
    assert_eq!(tree.predecessors(i), vec![i]);
  }
  assert!(tree.contains_link(0, 3, 0, 3));
  assert!(!tree.contains_link(0, 1, 2, 3));
}

#[test]
fn disjoint_quadrant_ranges() {
  let mut mat = vec![vec![0u32; 8]; 8];
  mat[2][3] = 10;
  mat[5][6] = 20;
  let tree = K2Tree::from_matrix(&mat, 2, 0).unwrap();
  assert_eq!(
    tree.valued_positions_in_range(0, 3, 0, 3),
    vec![ValuedPosition::new(2, 3, 10)]
  );
  assert_eq!(
    tree.valued_positions_in_range(4, 7, 4, 7),
    vec![ValuedPosition::new(5, 6, 20)]
  );
  let whole = tree.valued_positions_in_range(0, 7, 0, 7);
  assert!(whole.contains(&ValuedPosition::new(2, 3, 10)));
  assert!(whole.contains(&ValuedPosition::new(5, 6, 20)));
  assert_eq!(whole.len(), 2);
}

#[test]
fn valued_modes_build_identical_layers() {
  // A handful of values spread over an 11x11 relation, k = 3.
  let cells: &[(usize, usize, u32)] = &[
    (0, 10, 1),
    (1, 1, 2),
    (2, 7, 3),
    (4, 0, 4),
    (4, 4, 5),
    (5, 9, 6),
    (7, 2, 7),
    (8, 8, 8),
    (10, 3, 9),
    (10, 10, 10),
  ];
  let mut lists: Vec<Vec<(usize, u32)>> = vec![Vec::new(); 11];
  let mut mat = vec![vec![0u32; 11]; 11];
  let mut pairs = Vec::new();
  for &(row, col, value) in cells {
    lists[row].push((col, value));
    mat[row][col] = value;
    pairs.push(ValuedPosition::new(row, col, value));
  }
  pairs.reverse();

  let from_matrix = K2Tree::from_matrix(&mat, 3, 0).unwrap();
  let recursive = K2Tree::from_lists(&lists, 3, ListBuildMode::Recursive, 0).unwrap();
  let via_tree = K2Tree::from_lists(&lists, 3, ListBuildMode::Tree, 0).unwrap();
  let dynamic = K2Tree::from_lists(&lists, 3, ListBuildMode::Dynamic, 0).unwrap();
  let inplace = K2Tree::from_pairs(pairs, 3, 0).unwrap();

  for tree in [&recursive, &via_tree, &dynamic, &inplace] {
    assert_eq!(from_matrix.stems(), tree.stems());
    assert_eq!(from_matrix.leaves(), tree.leaves());
    assert_eq!(tree.num_rows(), 27);
  }
}

#[test]
fn boolean_modes_build_identical_layers() {
  let links: &[(usize, usize)] = &[
    (0, 10),
    (1, 1),
    (2, 7),
    (4, 0),
    (4, 4),
    (5, 9),
    (7, 2),
    (8, 8),
    (10, 3),
    (10, 10),
  ];
  let mut lists: Vec<Vec<usize>> = vec![Vec::new(); 11];
  let mut m = BitMatrix::with_dimensions(11, 11);
  for &(row, col) in links {
    lists[row].push(col);
    m.set(col, row, true).unwrap();
  }
  let mut pairs = links.to_vec();
  pairs.rotate_left(4);

  let from_matrix = BitK2Tree::from_matrix(&m, 3).unwrap();
  let recursive = BitK2Tree::from_lists(&lists, 3, ListBuildMode::Recursive).unwrap();
  let via_tree = BitK2Tree::from_lists(&lists, 3, ListBuildMode::Tree).unwrap();
  let dynamic = BitK2Tree::from_lists(&lists, 3, ListBuildMode::Dynamic).unwrap();
  let inplace = BitK2Tree::from_pairs(pairs, 3).unwrap();

  for tree in [&recursive, &via_tree, &dynamic, &inplace] {
    assert_eq!(from_matrix.stems(), tree.stems());
    assert_eq!(from_matrix.leaves(), tree.leaves());
  }
}

#[test]
fn valued_and_boolean_stems_coincide() {
  // The same occupancy pattern must produce the same stem layer whichever
  // variant stores it.
  let links: &[(usize, usize)] = &[(0, 5), (3, 3), (4, 1), (7, 6)];
  let mut mat = vec![vec![0u16; 8]; 8];
  let mut m = BitMatrix::with_dimensions(8, 8);
  for &(row, col) in links {
    mat[row][col] = 1;
    m.set(col, row, true).unwrap();
  }
  let valued = K2Tree::from_matrix(&mat, 2, 0).unwrap();
  let boolean = BitK2Tree::from_matrix(&m, 2).unwrap();
  assert_eq!(valued.stems(), boolean.stems());
  assert_eq!(valued.all_positions(), boolean.all_positions());
}
