use bitvec::vec::BitVec;
use serde::{Deserialize, Serialize};

use crate::error::BitMatrixError;

type Result<T> = std::result::Result<T, BitMatrixError>;

/// A dense 2-d bit-matrix, stored row-major.
///
/// This is the dense input format of the Boolean tree builder and the
/// output of [`BitK2Tree::to_bit_matrix`](crate::BitK2Tree::to_bit_matrix).
/// Coordinates are (x, y) = (column, row).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BitMatrix {
  /// Width of the matrix.
  pub width: usize,
  /// Height of the matrix.
  pub height: usize,
  bits: BitVec,
}
impl BitMatrix {
  /// Creates an empty BitMatrix with zero width or height.
  pub fn new() -> Self {
    BitMatrix {
      width: 0,
      height: 0,
      bits: BitVec::new(),
    }
  }
  /// Creates an all-zero BitMatrix with predefined dimensions.
  pub fn with_dimensions(width: usize, height: usize) -> Self {
    BitMatrix {
      width,
      height,
      bits: BitVec::repeat(false, width * height),
    }
  }
  /// Builds a BitMatrix instance from another collection of bits.
  ///
  /// If the data passed in contains more bits than will fit a matrix of the
  /// specified height and width, excess data is discarded. If not enough
  /// bits are passed in, 0s will be appended until the right size is reached.
  pub fn from_bits(width: usize, height: usize, data: impl IntoIterator<Item = bool>) -> Self {
    let mut bits: BitVec = data.into_iter().collect();
    bits.resize(width * height, false);
    BitMatrix {
      width,
      height,
      bits,
    }
  }
  /// Returns the state of a bit at a specific coordinate.
  pub fn get(&self, x: usize, y: usize) -> Result<bool> {
    if x >= self.width || y >= self.height {
      return Err(BitMatrixError::OutOfBounds {
        x_y: [x, y],
        max_x_y: [self.width.wrapping_sub(1), self.height.wrapping_sub(1)],
      });
    }
    Ok(self.bits[y * self.width + x])
  }
  /// Changes the state of a bit at a specific coordinate.
  pub fn set(&mut self, x: usize, y: usize, state: bool) -> Result<()> {
    if x >= self.width || y >= self.height {
      return Err(BitMatrixError::OutOfBounds {
        x_y: [x, y],
        max_x_y: [self.width.wrapping_sub(1), self.height.wrapping_sub(1)],
      });
    }
    self.bits.set(y * self.width + x, state);
    Ok(())
  }
  /// Returns the state of all the bits at a specific y-coordinate.
  ///
  /// Bits are ordered by column, starting at x-coordinate 0.
  pub fn get_row(&self, y: usize) -> Result<Vec<bool>> {
    if y >= self.height {
      return Err(BitMatrixError::OutOfBounds {
        x_y: [0, y],
        max_x_y: [self.width.wrapping_sub(1), self.height.wrapping_sub(1)],
      });
    }
    let mut row = Vec::with_capacity(self.width);
    for column in 0..self.width {
      row.push(self.bits[y * self.width + column]);
    }
    Ok(row)
  }
  /// Produces the contents of the matrix as a vec of its rows.
  pub fn to_rows(&self) -> Vec<Vec<bool>> {
    let mut vecs = vec![Vec::with_capacity(self.width); self.height];
    for row in 0..self.height {
      vecs[row].extend(self.bits[row * self.width..(row + 1) * self.width].iter().by_vals());
    }
    vecs
  }
}
impl Default for BitMatrix {
  fn default() -> Self {
    BitMatrix::new()
  }
}
