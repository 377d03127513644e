//! Similarity matrix streamed from a delimited file.
//!
//! File layout: the first line names every species in column order; each
//! following line is one matrix row, rows in the same order as the header.
//! Only `chunk_size` kept rows are held in memory at a time.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use super::{check_rows, restrict_species, ChunkConfig, Similarity};
use crate::delimited::{delimiter_for, split_fields, strip_bom};
use crate::error::{DiversityError, Result};
use crate::matrix::{Matrix, MatrixView};

#[derive(Debug, Clone)]
pub struct SimilarityFromFile {
    path: PathBuf,
    delimiter: char,
    chunk_size: usize,
    /// Number of species in the file header.
    file_species: usize,
    /// Kept species, in file order.
    species: Vec<String>,
    /// File columns to read, aligned with `species`.
    usecols: Vec<usize>,
    /// `skiprows[r]` is true when data row `r` is not in the subset.
    skiprows: Vec<bool>,
}

impl SimilarityFromFile {
    /// Reads only the header; rows are streamed by
    /// [`weighted_similarities`](Similarity::weighted_similarities).
    pub fn new(path: impl Into<PathBuf>, species_subset: Option<&[String]>, chunk: ChunkConfig) -> Result<Self> {
        let path = path.into();
        chunk.validate()?;
        let chunk_size = chunk.chunk_size;
        let delimiter = delimiter_for(&path);
        let mut lines = open_lines(&path)?;
        let header = match lines.next() {
            Some(line) => line.map_err(|e| DiversityError::io(&path, e))?,
            None => return Err(DiversityError::parse(&path, 1, "missing header of species names")),
        };
        let all: Vec<String> = split_fields(strip_bom(&header), delimiter).map(str::to_owned).collect();
        if all.iter().any(String::is_empty) {
            return Err(DiversityError::parse(&path, 1, "empty species name in header"));
        }

        let (species, usecols) = restrict_species(&all, species_subset)?;
        let mut skiprows = vec![true; all.len()];
        for &c in &usecols {
            skiprows[c] = false;
        }
        debug!(
            path = %path.display(),
            file_species = all.len(),
            kept = species.len(),
            chunk_size,
            "SimilarityFromFile::new"
        );
        Ok(Self { path, delimiter, chunk_size, file_species: all.len(), species, usecols, skiprows })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Parses the kept columns of one data line into `out`.
    fn parse_row(&self, line: &str, line_no: usize, out: &mut [f64]) -> Result<()> {
        let fields: Vec<&str> = split_fields(line, self.delimiter).collect();
        if fields.len() != self.file_species {
            return Err(DiversityError::parse(
                &self.path,
                line_no,
                format!("expected {} fields, found {}", self.file_species, fields.len()),
            ));
        }
        for (slot, &c) in out.iter_mut().zip(&self.usecols) {
            let value: f64 = fields[c].parse().map_err(|_| {
                DiversityError::parse(&self.path, line_no, format!("'{}' is not a number", fields[c]))
            })?;
            if !value.is_finite() || value < 0.0 {
                return Err(DiversityError::parse(
                    &self.path,
                    line_no,
                    format!("similarity must be finite and non-negative, found {value}"),
                ));
            }
            *slot = value;
        }
        Ok(())
    }
}

impl Similarity for SimilarityFromFile {
    fn n_species(&self) -> usize {
        self.species.len()
    }

    fn species_order(&self) -> Option<&[String]> {
        Some(&self.species)
    }

    fn weighted_similarities(&self, relative_abundances: MatrixView<'_>) -> Result<Matrix> {
        let n = self.n_species();
        check_rows(n, relative_abundances)?;
        let mut out = Matrix::zeros(n, relative_abundances.cols());
        let mut chunk = Matrix::zeros(self.chunk_size.min(n), n);
        let mut filled = 0;
        let mut offset = 0;
        let mut data_row = 0;

        let mut flush = |chunk: &Matrix, filled: usize, offset: &mut usize| -> Result<()> {
            let block = if filled == chunk.rows() {
                chunk.dot(relative_abundances)?
            } else {
                let rows: Vec<usize> = (0..filled).collect();
                let cols: Vec<usize> = (0..n).collect();
                chunk.select(&rows, &cols).dot(relative_abundances)?
            };
            trace!(offset = *offset, rows = filled, "similarity chunk");
            out.write_rows(*offset, &block)?;
            *offset += filled;
            Ok(())
        };

        for (i, line) in open_lines(&self.path)?.enumerate().skip(1) {
            let line_no = i + 1;
            let line = line.map_err(|e| DiversityError::io(&self.path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            if data_row >= self.file_species {
                return Err(DiversityError::parse(
                    &self.path,
                    line_no,
                    format!("more rows than the {} species in the header", self.file_species),
                ));
            }
            let skip = self.skiprows[data_row];
            data_row += 1;
            if skip {
                continue;
            }
            let width = chunk.cols();
            let row = &mut chunk.as_mut_slice()[filled * width..(filled + 1) * width];
            self.parse_row(&line, line_no, row)?;
            filled += 1;
            if filled == chunk.rows() {
                flush(&chunk, filled, &mut offset)?;
                filled = 0;
            }
        }
        if filled > 0 {
            flush(&chunk, filled, &mut offset)?;
        }
        if data_row != self.file_species {
            return Err(DiversityError::parse(
                &self.path,
                data_row + 2,
                format!("{} rows for the {} species in the header", data_row, self.file_species),
            ));
        }
        Ok(out)
    }
}

fn open_lines(path: &Path) -> Result<std::io::Lines<BufReader<File>>> {
    let file = File::open(path).map_err(|e| DiversityError::io(path, e))?;
    Ok(BufReader::new(file).lines())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;

    fn write_tsv(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    const TSV: &str = "a\tb\tc\n1\t0.5\t0.1\n0.5\t1\t0.2\n0.1\t0.2\t1\n";

    #[test]
    fn streamed_product_matches_dense() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tsv(dir.path(), "sim.tsv", TSV);
        let dense = Matrix::from_rows(vec![
            vec![1.0, 0.5, 0.1],
            vec![0.5, 1.0, 0.2],
            vec![0.1, 0.2, 1.0],
        ])
        .unwrap();
        let p = Matrix::from_rows(vec![vec![0.2, 0.0], vec![0.3, 0.5], vec![0.5, 0.5]]).unwrap();
        let expected = dense.dot(p.view()).unwrap();
        for chunk_size in [1, 2, 3, 10] {
            let sim = SimilarityFromFile::new(&path, None, ChunkConfig::new(chunk_size).unwrap()).unwrap();
            let z = sim.weighted_similarities(p.view()).unwrap();
            for (a, b) in z.as_slice().iter().zip(expected.as_slice()) {
                assert_relative_eq!(a, b, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn subset_skips_rows_and_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tsv(dir.path(), "sim.tsv", TSV);
        let subset = vec!["c".to_string(), "a".to_string()];
        let sim = SimilarityFromFile::new(&path, Some(subset.as_slice()), ChunkConfig::new(1).unwrap()).unwrap();
        assert_eq!(sim.species_order().unwrap(), &["a".to_string(), "c".to_string()][..]);
        let p = Matrix::column_vector(vec![1.0, 0.0]);
        let z = sim.weighted_similarities(p.view()).unwrap();
        assert_eq!(z.as_slice(), &[1.0, 0.1]);
    }

    #[test]
    fn csv_extension_uses_commas() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tsv(dir.path(), "sim.csv", "x,y\n1,0\n0,1\n\n");
        let sim = SimilarityFromFile::new(&path, None, ChunkConfig::new(5).unwrap()).unwrap();
        let z = sim.weighted_similarities(Matrix::column_vector(vec![0.25, 0.75]).view()).unwrap();
        assert_eq!(z.as_slice(), &[0.25, 0.75]);
    }

    #[test]
    fn malformed_value_reports_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tsv(dir.path(), "sim.tsv", "a\tb\n1\t0\n0\tnope\n");
        let sim = SimilarityFromFile::new(&path, None, ChunkConfig::new(10).unwrap()).unwrap();
        let err = sim.weighted_similarities(Matrix::column_vector(vec![0.5, 0.5]).view()).unwrap_err();
        match err {
            DiversityError::Parse { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_rows_are_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tsv(dir.path(), "sim.tsv", "a\tb\n1\t0\n");
        let sim = SimilarityFromFile::new(&path, None, ChunkConfig::new(10).unwrap()).unwrap();
        assert!(matches!(
            sim.weighted_similarities(Matrix::column_vector(vec![0.5, 0.5]).view()),
            Err(DiversityError::Parse { .. })
        ));
    }

    #[test]
    fn zero_chunk_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tsv(dir.path(), "sim.tsv", TSV);
        let chunk = ChunkConfig { chunk_size: 0 };
        assert!(matches!(SimilarityFromFile::new(&path, None, chunk), Err(DiversityError::InvalidArgument(_))));
    }

    #[test]
    fn header_with_byte_order_mark_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tsv(dir.path(), "sim.csv", "\u{feff}x,y\n1,0\n0,1\n");
        let sim = SimilarityFromFile::new(&path, None, ChunkConfig::default()).unwrap();
        assert_eq!(sim.species_order().unwrap(), &["x".to_string(), "y".to_string()][..]);
    }

    #[test]
    fn empty_subset_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_tsv(dir.path(), "sim.tsv", TSV);
        let subset = vec!["zz".to_string()];
        assert!(matches!(
            SimilarityFromFile::new(&path, Some(subset.as_slice()), ChunkConfig::new(1).unwrap()),
            Err(DiversityError::InvalidArgument(_))
        ));
    }
}
