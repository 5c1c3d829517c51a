/*!
These are all the custom errors that this library could return.

Only construction can fail: the builders validate their inputs up front and
every query on a successfully built tree is total for in-range coordinates.
*/

/// Errors produced while building a k²-tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum K2TreeError {
  /// Produced when a user attempts to create a tree with a k value below 2.
  SmallKValue {
    ///
    k: usize,
  },
  /// Produced when a dense input matrix has no rows or no columns.
  EmptyInput,
  /// Produced when the rows of a dense input matrix differ in length.
  RaggedMatrix {
    /// The offending row.
    row: usize,
    /// The length of the offending row.
    len: usize,
    /// The length of row 0, which all other rows must match.
    expected: usize,
  },
  /// Produced when the column list of a row is not strictly ascending.
  UnsortedColumns {
    /// The offending row.
    row: usize,
    /// The column at which the order breaks.
    col: usize,
  },
  /// Propogation of a BitMatrixError.
  BitMatrixError {
    ///
    source: Box<BitMatrixError>,
  },
}
impl std::error::Error for K2TreeError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      K2TreeError::BitMatrixError { source } => Some(source),
      _ => None,
    }
  }
}
impl std::fmt::Display for K2TreeError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    use K2TreeError::*;
    match self {
      SmallKValue { k } => write!(f, "Attempt to create a k2-tree with a k value of {}, which is less than the minimum of 2.", k),
      EmptyInput => write!(f, "Attempt to build a k2-tree from a matrix with no rows or no columns."),
      RaggedMatrix { row, len, expected } => write!(f, "Row {} of the input matrix has length {} but every row must have length {}.", row, len, expected),
      UnsortedColumns { row, col } => write!(f, "The column list of row {} is not strictly ascending at column {}.", row, col),
      BitMatrixError { source } => write!(f, "{}", source),
    }
  }
}
impl From<BitMatrixError> for K2TreeError {
  fn from(error: BitMatrixError) -> Self {
    K2TreeError::BitMatrixError {
      source: Box::new(error),
    }
  }
}

/// Errors produced as a result of interactions with the BitMatrix object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BitMatrixError {
  /// Produced when a user attempts to read or write to a bit outside of the
  /// valid range.
  OutOfBounds {
    ///
    x_y: [usize; 2],
    ///
    max_x_y: [usize; 2],
  },
}
impl std::error::Error for BitMatrixError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    None
  }
}
impl std::fmt::Display for BitMatrixError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    use BitMatrixError::*;
    match self {
      OutOfBounds {
        x_y: [x, y],
        max_x_y: [max_x, max_y],
      } => write!(f, "Attempt to access a bit at coordinates ({}, {}) which are not in the range of the matrix: (0, 0) -> ({}, {})", x, y, max_x, max_y),
    }
  }
}
