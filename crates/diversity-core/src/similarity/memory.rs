use tracing::debug;

use super::{check_rows, restrict_species, validate_similarities, Similarity};
use crate::error::{DiversityError, Result};
use crate::matrix::{Matrix, MatrixView};

fn require_square(context: &'static str, matrix: &Matrix) -> Result<()> {
    if matrix.rows() != matrix.cols() {
        return Err(DiversityError::ShapeMismatch {
            context,
            expected: (matrix.rows(), matrix.rows()),
            got: matrix.shape(),
        });
    }
    Ok(())
}

/// Similarity matrix held in memory, rows and columns labelled by species.
#[derive(Debug, Clone)]
pub struct SimilarityFromTable {
    species: Vec<String>,
    matrix: Matrix,
}

impl SimilarityFromTable {
    /// `matrix[i][j]` is the similarity of `species[i]` to `species[j]`.
    /// With a subset, only the listed species are kept, in table order.
    pub fn new(species: Vec<String>, matrix: Matrix, species_subset: Option<&[String]>) -> Result<Self> {
        require_square("SimilarityFromTable::new", &matrix)?;
        if species.len() != matrix.rows() {
            return Err(DiversityError::InvalidArgument(format!(
                "{} species labels for a {}x{} similarity matrix",
                species.len(),
                matrix.rows(),
                matrix.cols()
            )));
        }
        validate_similarities(matrix.as_slice(), "similarity table")?;

        let (species, indices) = restrict_species(&species, species_subset)?;
        let matrix = if indices.len() == matrix.rows() {
            matrix
        } else {
            matrix.select(&indices, &indices)
        };
        debug!(n_species = species.len(), "SimilarityFromTable::new");
        Ok(Self { species, matrix })
    }

    pub fn matrix(&self) -> &Matrix {
        &self.matrix
    }
}

impl Similarity for SimilarityFromTable {
    fn n_species(&self) -> usize {
        self.species.len()
    }

    fn species_order(&self) -> Option<&[String]> {
        Some(&self.species)
    }

    fn weighted_similarities(&self, relative_abundances: MatrixView<'_>) -> Result<Matrix> {
        check_rows(self.n_species(), relative_abundances)?;
        self.matrix.dot(relative_abundances)
    }
}

/// Dense similarity array aligned by position with the counts.
#[derive(Debug, Clone)]
pub struct SimilarityFromArray {
    matrix: Matrix,
}

impl SimilarityFromArray {
    pub fn new(matrix: Matrix) -> Result<Self> {
        require_square("SimilarityFromArray::new", &matrix)?;
        validate_similarities(matrix.as_slice(), "similarity array")?;
        debug!(n_species = matrix.rows(), "SimilarityFromArray::new");
        Ok(Self { matrix })
    }
}

impl Similarity for SimilarityFromArray {
    fn n_species(&self) -> usize {
        self.matrix.rows()
    }

    fn species_order(&self) -> Option<&[String]> {
        None
    }

    fn weighted_similarities(&self, relative_abundances: MatrixView<'_>) -> Result<Matrix> {
        check_rows(self.n_species(), relative_abundances)?;
        self.matrix.dot(relative_abundances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn table() -> (Vec<String>, Matrix) {
        let m = Matrix::from_rows(vec![
            vec![1.0, 0.5, 0.1],
            vec![0.5, 1.0, 0.2],
            vec![0.1, 0.2, 1.0],
        ])
        .unwrap();
        (names(&["a", "b", "c"]), m)
    }

    #[test]
    fn weighted_similarities_is_matrix_product() {
        let (species, m) = table();
        let sim = SimilarityFromTable::new(species, m, None).unwrap();
        let p = Matrix::column_vector(vec![0.5, 0.25, 0.25]);
        let z = sim.weighted_similarities(p.view()).unwrap();
        assert_relative_eq!(z.get(0, 0), 0.5 + 0.125 + 0.025, epsilon = 1e-12);
        assert_relative_eq!(z.get(2, 0), 0.05 + 0.05 + 0.25, epsilon = 1e-12);
    }

    #[test]
    fn subset_selects_rows_and_columns_in_table_order() {
        let (species, m) = table();
        let subset = names(&["c", "a"]);
        let sim = SimilarityFromTable::new(species, m, Some(subset.as_slice())).unwrap();
        assert_eq!(sim.species_order().unwrap(), &names(&["a", "c"])[..]);
        assert_eq!(sim.matrix().as_slice(), &[1.0, 0.1, 0.1, 1.0]);
    }

    #[test]
    fn rejects_non_square_and_negative_tables() {
        let m = Matrix::zeros(2, 3);
        assert!(SimilarityFromTable::new(names(&["a", "b"]), m, None).is_err());
        let m = Matrix::from_rows(vec![vec![1.0, -0.1], vec![-0.1, 1.0]]).unwrap();
        match SimilarityFromArray::new(m) {
            Err(DiversityError::InvalidArgument(msg)) => {
                assert!(msg.starts_with("similarity array:"), "{msg}");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn misaligned_abundances_are_rejected() {
        let sim = SimilarityFromArray::new(Matrix::identity(3)).unwrap();
        let p = Matrix::column_vector(vec![0.5, 0.5]);
        assert!(matches!(
            sim.weighted_similarities(p.view()),
            Err(DiversityError::ShapeMismatch { .. })
        ));
    }
}
