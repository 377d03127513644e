use serde::{Deserialize, Serialize};

use crate::error::{DiversityError, Result};

/// A dense 2D matrix of f64 values, row-major.
/// Rows are species; columns are communities (or species, for similarities).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    /// Row-major values.
    data: Vec<f64>,
    rows: usize,
    cols: usize,
}

impl Matrix {
    /// Create a new Matrix filled with the given value.
    pub fn new(rows: usize, cols: usize, fill: f64) -> Self {
        Self { data: vec![fill; rows * cols], rows, cols }
    }

    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::new(rows, cols, 0.0)
    }

    /// Wrap row-major values. Fails when `data.len() != rows * cols`.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(DiversityError::InvalidArgument(format!(
                "{} values cannot fill a {rows}x{cols} matrix",
                data.len()
            )));
        }
        Ok(Self { data, rows, cols })
    }

    /// Build from nested rows; every row must have the same length.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self> {
        let cols = rows.first().map_or(0, Vec::len);
        let n = rows.len();
        let mut data = Vec::with_capacity(n * cols);
        for (i, row) in rows.into_iter().enumerate() {
            if row.len() != cols {
                return Err(DiversityError::ShapeMismatch {
                    context: "Matrix::from_rows",
                    expected: (i, cols),
                    got: (i, row.len()),
                });
            }
            data.extend(row);
        }
        Ok(Self { data, rows: n, cols })
    }

    /// A single-column matrix.
    pub fn column_vector(values: Vec<f64>) -> Self {
        let rows = values.len();
        Self { data: values, rows, cols: 1 }
    }

    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m.set(i, i, 1.0);
        }
        m
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, val: f64) {
        self.data[row * self.cols + col] = val;
    }

    #[inline]
    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    pub fn view(&self) -> MatrixView<'_> {
        MatrixView { data: &self.data, rows: self.rows, cols: self.cols }
    }

    pub fn column(&self, col: usize) -> Vec<f64> {
        self.view().column(col)
    }

    pub fn sum(&self) -> f64 {
        self.data.iter().sum()
    }

    /// Per-row sums as a `rows x 1` matrix.
    pub fn row_sums(&self) -> Matrix {
        self.view().row_sums()
    }

    pub fn column_sums(&self) -> Vec<f64> {
        self.view().column_sums()
    }

    /// Repeat a single-column matrix across `cols` columns.
    pub fn broadcast_columns(&self, cols: usize) -> Result<Matrix> {
        if self.cols != 1 {
            return Err(DiversityError::ShapeMismatch {
                context: "Matrix::broadcast_columns",
                expected: (self.rows, 1),
                got: self.shape(),
            });
        }
        let mut out = Matrix::zeros(self.rows, cols);
        for r in 0..self.rows {
            out.data[r * cols..(r + 1) * cols].fill(self.data[r]);
        }
        Ok(out)
    }

    /// Matrix product `self · rhs`.
    pub fn dot(&self, rhs: MatrixView<'_>) -> Result<Matrix> {
        self.view().dot(rhs)
    }

    /// Copy `block` into rows `offset..offset + block.rows()`.
    pub fn write_rows(&mut self, offset: usize, block: &Matrix) -> Result<()> {
        if block.cols != self.cols || offset + block.rows > self.rows {
            return Err(DiversityError::ShapeMismatch {
                context: "Matrix::write_rows",
                expected: (self.rows.saturating_sub(offset), self.cols),
                got: block.shape(),
            });
        }
        self.data[offset * self.cols..(offset + block.rows) * self.cols].copy_from_slice(&block.data);
        Ok(())
    }

    /// Concatenate blocks vertically, in order.
    pub fn vstack(blocks: Vec<Matrix>, cols: usize) -> Result<Matrix> {
        let rows = blocks.iter().map(Matrix::rows).sum();
        let mut data = Vec::with_capacity(rows * cols);
        for block in blocks {
            if block.cols != cols {
                return Err(DiversityError::ShapeMismatch {
                    context: "Matrix::vstack",
                    expected: (block.rows, cols),
                    got: block.shape(),
                });
            }
            data.extend(block.data);
        }
        Ok(Matrix { data, rows, cols })
    }

    /// Select rows and columns by index, in the given order.
    pub fn select(&self, rows: &[usize], cols: &[usize]) -> Matrix {
        let mut data = Vec::with_capacity(rows.len() * cols.len());
        for &r in rows {
            let row = self.row(r);
            data.extend(cols.iter().map(|&c| row[c]));
        }
        Matrix { data, rows: rows.len(), cols: cols.len() }
    }
}

/// Borrowed row-major matrix, e.g. over a memory-mapped buffer.
#[derive(Debug, Clone, Copy)]
pub struct MatrixView<'a> {
    data: &'a [f64],
    rows: usize,
    cols: usize,
}

impl<'a> MatrixView<'a> {
    pub fn from_slice(data: &'a [f64], rows: usize, cols: usize) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(DiversityError::InvalidArgument(format!(
                "{} values cannot back a {rows}x{cols} view",
                data.len()
            )));
        }
        Ok(Self { data, rows, cols })
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    #[inline]
    pub fn row(&self, row: usize) -> &'a [f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    pub fn as_slice(&self) -> &'a [f64] {
        self.data
    }

    pub fn column(&self, col: usize) -> Vec<f64> {
        (0..self.rows).map(|r| self.get(r, col)).collect()
    }

    pub fn row_sums(&self) -> Matrix {
        Matrix::column_vector((0..self.rows).map(|r| self.row(r).iter().sum()).collect())
    }

    pub fn column_sums(&self) -> Vec<f64> {
        let mut sums = vec![0.0; self.cols];
        for r in 0..self.rows {
            for (s, v) in sums.iter_mut().zip(self.row(r)) {
                *s += v;
            }
        }
        sums
    }

    pub fn to_matrix(&self) -> Matrix {
        Matrix { data: self.data.to_vec(), rows: self.rows, cols: self.cols }
    }

    /// Matrix product `self · rhs`.
    pub fn dot(&self, rhs: MatrixView<'_>) -> Result<Matrix> {
        if self.cols != rhs.rows {
            return Err(DiversityError::ShapeMismatch {
                context: "Matrix::dot",
                expected: (self.cols, rhs.cols),
                got: rhs.shape(),
            });
        }
        let mut out = Matrix::zeros(self.rows, rhs.cols);
        for r in 0..self.rows {
            let out_row = &mut out.data[r * rhs.cols..(r + 1) * rhs.cols];
            for (k, &a) in self.row(r).iter().enumerate() {
                if a == 0.0 {
                    continue;
                }
                for (o, &b) in out_row.iter_mut().zip(rhs.row(k)) {
                    *o += a * b;
                }
            }
        }
        Ok(out)
    }
}
