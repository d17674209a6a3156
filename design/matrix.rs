//! # Dense and sparse model matrices
//!
//! `DesignMatrix` hides whether the columns live in an `ndarray` array or a
//! `faer` compressed-column matrix. The engine only ever walks one column at a
//! time, so column iteration is the primitive and everything else is built on it.

use crate::design::DesignError;
use crate::design::builder::{Block, BlockColumn};
use faer::sparse::{SparseColMat, Triplet};
use ndarray::{Array1, Array2, ArrayView1};

/// Unified design matrix representation for dense and sparse workflows.
#[derive(Clone)]
pub enum DesignMatrix {
    Dense(Array2<f64>),
    Sparse(SparseColMat<usize, f64>),
}

impl std::fmt::Debug for DesignMatrix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DesignMatrix::{}({}x{}, {} stored)",
            if self.is_sparse() { "Sparse" } else { "Dense" },
            self.nrows(),
            self.ncols(),
            self.stored_entries()
        )
    }
}

impl DesignMatrix {
    pub fn nrows(&self) -> usize {
        match self {
            Self::Dense(matrix) => matrix.nrows(),
            Self::Sparse(matrix) => matrix.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            Self::Dense(matrix) => matrix.ncols(),
            Self::Sparse(matrix) => matrix.ncols(),
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Self::Sparse(_))
    }

    /// Number of stored entries; for dense matrices every cell counts.
    pub fn stored_entries(&self) -> usize {
        match self {
            Self::Dense(matrix) => matrix.len(),
            Self::Sparse(matrix) => matrix.val().len(),
        }
    }

    /// Calls `f(row, value)` for every stored entry of column `col`. Dense
    /// matrices visit every row; sparse matrices only their non-zeros.
    pub fn for_each_in_column<F: FnMut(usize, f64)>(&self, col: usize, mut f: F) {
        match self {
            Self::Dense(matrix) => {
                for (row, &value) in matrix.column(col).iter().enumerate() {
                    f(row, value);
                }
            }
            Self::Sparse(matrix) => {
                let col_ptr = matrix.symbolic().col_ptr();
                let row_idx = matrix.symbolic().row_idx();
                let values = matrix.val();
                for idx in col_ptr[col]..col_ptr[col + 1] {
                    f(row_idx[idx], values[idx]);
                }
            }
        }
    }

    /// `Σ_i x[i, col] · v[i]`.
    pub fn column_dot(&self, col: usize, vector: &[f64]) -> f64 {
        let mut sum = 0.0;
        self.for_each_in_column(col, |row, value| sum += value * vector[row]);
        sum
    }

    pub fn to_dense(&self) -> Array2<f64> {
        match self {
            Self::Dense(matrix) => matrix.clone(),
            Self::Sparse(_) => {
                let mut dense = Array2::<f64>::zeros((self.nrows(), self.ncols()));
                for col in 0..self.ncols() {
                    self.for_each_in_column(col, |row, value| dense[[row, col]] = value);
                }
                dense
            }
        }
    }

    pub fn matrix_vector_multiply(&self, vector: ArrayView1<f64>) -> Array1<f64> {
        match self {
            Self::Dense(matrix) => matrix.dot(&vector),
            Self::Sparse(_) => {
                let mut output = Array1::<f64>::zeros(self.nrows());
                for col in 0..self.ncols() {
                    let x = vector[col];
                    if x != 0.0 {
                        self.for_each_in_column(col, |row, value| output[row] += value * x);
                    }
                }
                output
            }
        }
    }

    /// Extracts the given rows, in order, keeping the storage kind.
    pub fn select_rows(&self, rows: &[usize]) -> Result<DesignMatrix, DesignError> {
        match self {
            Self::Dense(matrix) => Ok(Self::Dense(matrix.select(ndarray::Axis(0), rows))),
            Self::Sparse(matrix) => {
                // A row may be picked more than once.
                let mut targets: Vec<Vec<usize>> = vec![Vec::new(); matrix.nrows()];
                for (new_row, &old_row) in rows.iter().enumerate() {
                    targets[old_row].push(new_row);
                }
                let mut triplets = Vec::new();
                for col in 0..matrix.ncols() {
                    self.for_each_in_column(col, |row, value| {
                        for &new_row in &targets[row] {
                            triplets.push(Triplet::new(new_row, col, value));
                        }
                    });
                }
                SparseColMat::try_new_from_triplets(rows.len(), matrix.ncols(), &triplets)
                    .map(Self::Sparse)
                    .map_err(|e| DesignError::SparseAssembly(format!("{e:?}")))
            }
        }
    }
}

/// Concatenates per-term blocks, in order, into one matrix.
pub(crate) fn assemble(
    nrows: usize,
    blocks: &[Block],
    sparse: bool,
) -> Result<DesignMatrix, DesignError> {
    let ncols: usize = blocks.iter().map(|b| b.columns.len()).sum();
    let columns = blocks.iter().flat_map(|b| b.columns.iter());

    if !sparse {
        let mut dense = Array2::<f64>::zeros((nrows, ncols));
        for (col, column) in columns.enumerate() {
            match column {
                BlockColumn::Dense(values) => {
                    dense.column_mut(col).assign(&ArrayView1::from(values.as_slice()));
                }
                BlockColumn::Sparse(entries) => {
                    for &(row, value) in entries {
                        dense[[row, col]] = value;
                    }
                }
            }
        }
        return Ok(DesignMatrix::Dense(dense));
    }

    let mut triplets: Vec<Triplet<usize, usize, f64>> = Vec::new();
    for (col, column) in columns.enumerate() {
        match column {
            BlockColumn::Dense(values) => {
                for (row, &value) in values.iter().enumerate() {
                    if value != 0.0 {
                        triplets.push(Triplet::new(row, col, value));
                    }
                }
            }
            BlockColumn::Sparse(entries) => {
                for &(row, value) in entries {
                    if value != 0.0 {
                        triplets.push(Triplet::new(row, col, value));
                    }
                }
            }
        }
    }
    SparseColMat::try_new_from_triplets(nrows, ncols, &triplets)
        .map(DesignMatrix::Sparse)
        .map_err(|e| DesignError::SparseAssembly(format!("{e:?}")))
}
