use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use tracing::debug;

use super::{check_rows, Similarity};
use crate::error::{DiversityError, Result};
use crate::matrix::{Matrix, MatrixView};

const F64_BYTES: usize = std::mem::size_of::<f64>();

/// Similarity array stored as raw little-endian f64 values, `n × n`
/// row-major, and read through a read-only memory map. Positional: rows
/// follow the counts' species order.
#[derive(Debug)]
pub struct SimilarityFromMemmap {
    path: PathBuf,
    mmap: Mmap,
    n_species: usize,
}

impl SimilarityFromMemmap {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| DiversityError::io(&path, e))?;
        // SAFETY: the map is read-only and never outlives `self`; the file
        // must not be truncated while the backend is alive.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| DiversityError::io(&path, e))?;

        let values = mmap.len() / F64_BYTES;
        let n_species = (values as f64).sqrt().round() as usize;
        if mmap.len() % F64_BYTES != 0 || n_species * n_species != values || n_species == 0 {
            return Err(DiversityError::InvalidArgument(format!(
                "{}: {} bytes is not a square matrix of f64 values",
                path.display(),
                mmap.len()
            )));
        }
        debug!(path = %path.display(), n_species, "SimilarityFromMemmap::open");
        Ok(Self { path, mmap, n_species })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decodes row `i` into `out`.
    fn read_row(&self, i: usize, out: &mut [f64]) {
        let stride = self.n_species * F64_BYTES;
        let bytes = &self.mmap[i * stride..(i + 1) * stride];
        for (v, b) in out.iter_mut().zip(bytes.chunks_exact(F64_BYTES)) {
            let mut raw = [0u8; F64_BYTES];
            raw.copy_from_slice(b);
            *v = f64::from_le_bytes(raw);
        }
    }
}

impl Similarity for SimilarityFromMemmap {
    fn n_species(&self) -> usize {
        self.n_species
    }

    fn species_order(&self) -> Option<&[String]> {
        None
    }

    fn weighted_similarities(&self, relative_abundances: MatrixView<'_>) -> Result<Matrix> {
        check_rows(self.n_species, relative_abundances)?;
        let mut out = Matrix::zeros(self.n_species, relative_abundances.cols());
        let mut row = Matrix::zeros(1, self.n_species);
        for i in 0..self.n_species {
            self.read_row(i, row.as_mut_slice());
            if let Some(bad) = row.as_slice().iter().find(|v| !v.is_finite() || **v < 0.0) {
                return Err(DiversityError::InvalidArgument(format!(
                    "{}: similarity must be finite and non-negative, found {bad} in row {i}",
                    self.path.display()
                )));
            }
            out.write_rows(i, &row.dot(relative_abundances)?)?;
        }
        Ok(out)
    }
}

/// Writes `matrix` in the layout [`SimilarityFromMemmap`] reads.
pub fn write_memmap(path: impl AsRef<Path>, matrix: &Matrix) -> Result<()> {
    let path = path.as_ref();
    if matrix.rows() != matrix.cols() {
        return Err(DiversityError::ShapeMismatch {
            context: "write_memmap",
            expected: (matrix.rows(), matrix.rows()),
            got: matrix.shape(),
        });
    }
    let file = File::create(path).map_err(|e| DiversityError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    for v in matrix.as_slice() {
        writer.write_all(&v.to_le_bytes()).map_err(|e| DiversityError::io(path, e))?;
    }
    writer.flush().map_err(|e| DiversityError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn mapped_matrix_multiplies_like_dense() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.bin");
        let m = Matrix::from_rows(vec![vec![1.0, 0.3], vec![0.3, 1.0]]).unwrap();
        write_memmap(&path, &m).unwrap();

        let sim = SimilarityFromMemmap::open(&path).unwrap();
        assert_eq!(sim.n_species(), 2);
        let p = Matrix::from_rows(vec![vec![0.2, 0.4], vec![0.8, 0.6]]).unwrap();
        let z = sim.weighted_similarities(p.view()).unwrap();
        let expected = m.dot(p.view()).unwrap();
        for (a, b) in z.as_slice().iter().zip(expected.as_slice()) {
            assert_relative_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn non_square_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.bin");
        std::fs::write(&path, [0u8; 3 * F64_BYTES]).unwrap();
        assert!(matches!(
            SimilarityFromMemmap::open(&path),
            Err(DiversityError::InvalidArgument(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = SimilarityFromMemmap::open("/nonexistent/sim.bin").unwrap_err();
        assert!(matches!(err, DiversityError::Io { .. }));
    }
}
