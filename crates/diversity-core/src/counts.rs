//! Long-form species counts and the assembly of metacommunities from them.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::abundance::{Abundance, SharedAbundance, SharedArrayManager};
use crate::delimited::{delimiter_for, split_fields, strip_bom};
use crate::error::{DiversityError, Result};
use crate::matrix::Matrix;
use crate::metacommunity::Metacommunity;
use crate::similarity::{make_similarity, ChunkConfig, Similarity, SimilaritySource};

/// Header names of the three columns a counts file must carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountColumns {
    pub subcommunity: String,
    pub species: String,
    pub count: String,
}

impl Default for CountColumns {
    fn default() -> Self {
        Self {
            subcommunity: "subcommunity".into(),
            species: "species".into(),
            count: "count".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountRecord {
    pub subcommunity: String,
    pub species: String,
    pub count: f64,
}

/// Species counts, one record per (subcommunity, species) observation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CountsTable {
    records: Vec<CountRecord>,
}

/// Unique values in order of first appearance.
fn first_appearance<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    values.filter(|v| seen.insert(*v)).map(str::to_owned).collect()
}

impl CountsTable {
    pub fn from_records(records: Vec<CountRecord>) -> Result<Self> {
        if let Some(r) = records.iter().find(|r| !r.count.is_finite() || r.count < 0.0) {
            return Err(DiversityError::InvalidArgument(format!(
                "count of '{}' in '{}' must be finite and non-negative, got {}",
                r.species, r.subcommunity, r.count
            )));
        }
        Ok(Self { records })
    }

    /// Reads a delimited file with a header row naming at least `columns`.
    /// Other columns are ignored.
    pub fn read(path: impl AsRef<Path>, columns: &CountColumns) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| DiversityError::io(path, e))?;
        let delimiter = delimiter_for(path);
        let mut lines = text.lines().enumerate();

        let header: Vec<&str> = match lines.next() {
            Some((_, line)) => split_fields(strip_bom(line), delimiter).collect(),
            None => return Err(DiversityError::parse(path, 1, "missing header")),
        };
        let position = |name: &str| {
            header
                .iter()
                .position(|h| *h == name)
                .ok_or_else(|| DiversityError::parse(path, 1, format!("no column named '{name}'")))
        };
        let sub_col = position(columns.subcommunity.as_str())?;
        let species_col = position(columns.species.as_str())?;
        let count_col = position(columns.count.as_str())?;

        let mut records = Vec::new();
        for (i, line) in lines {
            let line_no = i + 1;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = split_fields(line, delimiter).collect();
            if fields.len() != header.len() {
                return Err(DiversityError::parse(
                    path,
                    line_no,
                    format!("expected {} fields, found {}", header.len(), fields.len()),
                ));
            }
            let count: f64 = fields[count_col].parse().map_err(|_| {
                DiversityError::parse(path, line_no, format!("'{}' is not a count", fields[count_col]))
            })?;
            if !count.is_finite() || count < 0.0 {
                return Err(DiversityError::parse(path, line_no, format!("negative or non-finite count {count}")));
            }
            records.push(CountRecord {
                subcommunity: fields[sub_col].to_owned(),
                species: fields[species_col].to_owned(),
                count,
            });
        }
        debug!(path = %path.display(), records = records.len(), "CountsTable::read");
        Ok(Self { records })
    }

    pub fn records(&self) -> &[CountRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Only the records of the named subcommunities.
    pub fn subset_subcommunities(&self, names: &[String]) -> Self {
        let records = self
            .records
            .iter()
            .filter(|r| names.contains(&r.subcommunity))
            .cloned()
            .collect();
        Self { records }
    }

    /// Subcommunities in order of first appearance.
    pub fn subcommunities(&self) -> Vec<String> {
        first_appearance(self.records.iter().map(|r| r.subcommunity.as_str()))
    }

    /// Species in order of first appearance.
    pub fn species(&self) -> Vec<String> {
        first_appearance(self.records.iter().map(|r| r.species.as_str()))
    }

    /// Species × subcommunity counts with rows in `species_order` and
    /// columns in [`subcommunities`](Self::subcommunities) order. Repeated
    /// records add up.
    pub fn pivot(&self, species_order: &[String]) -> Result<Matrix> {
        let rows: HashMap<&str, usize> =
            species_order.iter().enumerate().map(|(i, s)| (s.as_str(), i)).collect();
        let subcommunities = self.subcommunities();
        let cols: HashMap<&str, usize> =
            subcommunities.iter().enumerate().map(|(j, s)| (s.as_str(), j)).collect();

        let mut counts = Matrix::zeros(species_order.len(), subcommunities.len());
        for r in &self.records {
            let i = *rows.get(r.species.as_str()).ok_or_else(|| {
                DiversityError::InvalidArgument(format!("species '{}' has no similarity entry", r.species))
            })?;
            let j = cols[r.subcommunity.as_str()];
            counts.set(i, j, counts.get(i, j) + r.count);
        }
        Ok(counts)
    }
}

/// Subset counts, build the similarity for their species and pivot the
/// counts onto the similarity's species order.
fn assemble(
    counts: &CountsTable,
    source: SimilaritySource,
    subcommunities: Option<&[String]>,
    chunk: ChunkConfig,
) -> Result<(Box<dyn Similarity>, Matrix, Vec<String>)> {
    let subset = match subcommunities {
        Some(names) => counts.subset_subcommunities(names),
        None => counts.clone(),
    };
    let species = subset.species();
    if species.is_empty() {
        return Err(DiversityError::InvalidArgument(
            "subcommunity selection contains no species".into(),
        ));
    }
    let similarity = make_similarity(source, Some(species.as_slice()), chunk)?;
    let order = similarity.species_order().map_or_else(|| species.clone(), <[String]>::to_vec);
    let matrix = subset.pivot(&order)?;
    Ok((similarity, matrix, subset.subcommunities()))
}

/// A metacommunity over the selected subcommunities (all of them when
/// `subcommunities` is `None`).
pub fn make_metacommunity(
    counts: &CountsTable,
    source: SimilaritySource,
    subcommunities: Option<&[String]>,
    chunk: ChunkConfig,
) -> Result<Metacommunity<Abundance>> {
    debug!(?source, ?subcommunities, ?chunk, "make_metacommunity");
    let (similarity, matrix, names) = assemble(counts, source, subcommunities, chunk)?;
    Metacommunity::new(similarity, Abundance::new(matrix)?)?.with_subcommunity_names(names)
}

/// As [`make_metacommunity`], with abundances held in a shared-memory
/// buffer created by `manager`.
pub fn make_shared_metacommunity(
    counts: &CountsTable,
    source: SimilaritySource,
    subcommunities: Option<&[String]>,
    chunk: ChunkConfig,
    manager: SharedArrayManager,
) -> Result<Metacommunity<SharedAbundance>> {
    debug!(?source, ?subcommunities, ?chunk, "make_shared_metacommunity");
    let (similarity, matrix, names) = assemble(counts, source, subcommunities, chunk)?;
    let abundance = SharedAbundance::from_matrix(&matrix, manager)?;
    Metacommunity::new(similarity, abundance)?.with_subcommunity_names(names)
}

/// One metacommunity per unordered pair of subcommunities `(a, b)`, `a < b`,
/// with pairs in lexicographic order of subcommunity name.
///
/// Each pair keeps only its own species, so the similarity must be
/// labelled by species: a table or a delimited file.
pub fn make_pairwise_metacommunities(
    counts: &CountsTable,
    source: &SimilaritySource,
    chunk: ChunkConfig,
) -> Result<Vec<Metacommunity<Abundance>>> {
    if !matches!(source, SimilaritySource::Table { .. } | SimilaritySource::File(_)) {
        return Err(DiversityError::InvalidArgument(format!(
            "pairwise metacommunities need a species-labelled similarity (table or file), got {source:?}"
        )));
    }
    let mut names = counts.subcommunities();
    names.sort();
    let mut pairs = Vec::with_capacity(names.len() * names.len().saturating_sub(1) / 2);
    for (i, a) in names.iter().enumerate() {
        for b in &names[i + 1..] {
            let pair = [a.clone(), b.clone()];
            pairs.push(make_metacommunity(counts, source.clone(), Some(pair.as_slice()), chunk)?);
        }
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn record(sub: &str, species: &str, count: f64) -> CountRecord {
        CountRecord { subcommunity: sub.into(), species: species.into(), count }
    }

    fn table() -> CountsTable {
        CountsTable::from_records(vec![
            record("s1", "b", 2.0),
            record("s1", "a", 1.0),
            record("s2", "a", 3.0),
            record("s2", "a", 1.0),
            record("s3", "c", 5.0),
        ])
        .unwrap()
    }

    #[test]
    fn pivot_sums_duplicates_and_fills_absent_with_zero() {
        let order = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let m = table().pivot(&order).unwrap();
        assert_eq!(m.shape(), (3, 3));
        assert_eq!(m.row(0), &[1.0, 4.0, 0.0]);
        assert_eq!(m.row(1), &[2.0, 0.0, 0.0]);
        assert_eq!(m.row(2), &[0.0, 0.0, 5.0]);
    }

    #[test]
    fn pivot_rejects_species_without_similarity() {
        let order = vec!["a".to_string()];
        assert!(matches!(table().pivot(&order), Err(DiversityError::InvalidArgument(_))));
    }

    #[test]
    fn subset_keeps_first_appearance_order() {
        let t = table().subset_subcommunities(&["s3".to_string(), "s1".to_string()]);
        assert_eq!(t.subcommunities(), vec!["s1", "s3"]);
        assert_eq!(t.species(), vec!["b", "a", "c"]);
    }

    #[test]
    fn reads_csv_with_custom_columns_and_extra_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "site,taxon,note,n").unwrap();
        writeln!(f, "x,\"a\",ok,2").unwrap();
        writeln!(f, "y,b,,3.5").unwrap();
        drop(f);
        let columns = CountColumns { subcommunity: "site".into(), species: "taxon".into(), count: "n".into() };
        let t = CountsTable::read(&path, &columns).unwrap();
        assert_eq!(t.records()[0], record("x", "a", 2.0));
        assert_eq!(t.records()[1].count, 3.5);
    }

    #[test]
    fn missing_column_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.tsv");
        std::fs::write(&path, "subcommunity\tspecies\n").unwrap();
        assert!(matches!(
            CountsTable::read(&path, &CountColumns::default()),
            Err(DiversityError::Parse { line: 1, .. })
        ));
    }

    #[test]
    fn empty_selection_is_invalid() {
        let source = SimilaritySource::Array(Matrix::identity(3));
        let none = vec!["nowhere".to_string()];
        assert!(matches!(
            make_metacommunity(&table(), source, Some(none.as_slice()), ChunkConfig::default()),
            Err(DiversityError::InvalidArgument(_))
        ));
    }

    #[test]
    fn pairwise_yields_every_unordered_pair() {
        let species = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let source = SimilaritySource::Table { species, matrix: Matrix::identity(3) };
        let pairs = make_pairwise_metacommunities(&table(), &source, ChunkConfig::default()).unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].subcommunity_names(), &["s1".to_string(), "s2".to_string()][..]);
        assert_eq!(pairs[2].subcommunity_names(), &["s2".to_string(), "s3".to_string()][..]);
        assert_eq!(pairs[1].species_order().unwrap().len(), 3);
    }

    #[test]
    fn pairwise_orders_pairs_by_name() {
        let t = CountsTable::from_records(vec![
            record("north", "a", 1.0),
            record("east", "b", 1.0),
            record("south", "a", 2.0),
        ])
        .unwrap();
        let species = vec!["a".to_string(), "b".to_string()];
        let source = SimilaritySource::Table { species, matrix: Matrix::identity(2) };
        let pairs = make_pairwise_metacommunities(&t, &source, ChunkConfig::default()).unwrap();
        let mut names: Vec<Vec<String>> = pairs.iter().map(|m| m.subcommunity_names().to_vec()).collect();
        for pair in &mut names {
            pair.sort();
        }
        assert_eq!(
            names,
            vec![
                vec!["east".to_string(), "north".to_string()],
                vec!["east".to_string(), "south".to_string()],
                vec!["north".to_string(), "south".to_string()],
            ]
        );
        // north and south share one species.
        assert_eq!(pairs[2].species_order().unwrap(), &["a".to_string()][..]);
    }

    #[test]
    fn pairwise_rejects_positional_similarity() {
        let source = SimilaritySource::Array(Matrix::identity(3));
        match make_pairwise_metacommunities(&table(), &source, ChunkConfig::default()) {
            Err(DiversityError::InvalidArgument(msg)) => assert!(msg.contains("species-labelled"), "{msg}"),
            other => panic!("unexpected result {:?}", other.map(|p| p.len())),
        }
    }

    #[test]
    fn header_with_byte_order_mark_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.csv");
        std::fs::write(&path, "\u{feff}subcommunity,species,count\nx,a,2\n").unwrap();
        let t = CountsTable::read(&path, &CountColumns::default()).unwrap();
        assert_eq!(t.records(), &[record("x", "a", 2.0)]);
    }
}
