//! Shared-memory abundances.
//!
//! Arrays live in file-backed memory maps so that another thread or
//! process can map the same bytes from a [`SharedArraySpec`] without
//! copying. [`SharedAbundance`] keeps exactly one scaled version of the
//! species × subcommunity array and rescales it in place when a different
//! quantity is requested.
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use memmap2::{Mmap, MmapMut};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::debug;

use super::{cached, empty_subcommunity, nonzero_total, validate_counts, RelativeAbundance};
use crate::error::{DiversityError, Result};
use crate::matrix::{Matrix, MatrixView};

/// Element type of a shared array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementType {
    F64,
}

impl ElementType {
    pub fn size(self) -> usize {
        match self {
            ElementType::F64 => std::mem::size_of::<f64>(),
        }
    }
}

/// Where a shared array lives and how to interpret its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedArraySpec {
    pub path: PathBuf,
    /// `(rows, cols)`, row-major.
    pub shape: (usize, usize),
    pub dtype: ElementType,
}

impl SharedArraySpec {
    pub fn byte_len(&self) -> usize {
        self.shape.0 * self.shape.1 * self.dtype.size()
    }
}

#[derive(Debug)]
enum Mapping {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

fn unmapped(path: &Path) -> DiversityError {
    DiversityError::io(path, std::io::Error::other("shared array lost its mapping"))
}

/// A row-major f64 array in a file-backed memory map. Read-only except
/// inside [`SharedArray::with_writable`].
#[derive(Debug)]
pub struct SharedArray {
    spec: SharedArraySpec,
    mapping: Option<Mapping>,
}

impl SharedArray {
    fn create(path: PathBuf, shape: (usize, usize)) -> Result<Self> {
        let spec = SharedArraySpec { path, shape, dtype: ElementType::F64 };
        if spec.byte_len() == 0 {
            return Err(DiversityError::InvalidArgument(
                "shared arrays must hold at least one element".into(),
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&spec.path)
            .map_err(|e| DiversityError::io(&spec.path, e))?;
        file.set_len(spec.byte_len() as u64)
            .map_err(|e| DiversityError::io(&spec.path, e))?;
        // SAFETY: the file was created above for this array alone; every other
        // mapping of it goes through `SharedArray::open` on the same spec.
        let mmap = unsafe { MmapMut::map_mut(&file) }.map_err(|e| DiversityError::io(&spec.path, e))?;
        let mmap = mmap.make_read_only().map_err(|e| DiversityError::io(&spec.path, e))?;
        Ok(Self { spec, mapping: Some(Mapping::ReadOnly(mmap)) })
    }

    /// Map an existing array, e.g. from another execution context.
    pub fn open(spec: &SharedArraySpec) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&spec.path)
            .map_err(|e| DiversityError::io(&spec.path, e))?;
        let len = file.metadata().map_err(|e| DiversityError::io(&spec.path, e))?.len();
        if len != spec.byte_len() as u64 {
            return Err(DiversityError::InvalidArgument(format!(
                "{} holds {len} bytes, spec {:?} requires {}",
                spec.path.display(),
                spec.shape,
                spec.byte_len()
            )));
        }
        // SAFETY: see `create`; length was checked against the spec.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| DiversityError::io(&spec.path, e))?;
        Ok(Self { spec: spec.clone(), mapping: Some(Mapping::ReadOnly(mmap)) })
    }

    pub fn spec(&self) -> &SharedArraySpec {
        &self.spec
    }

    pub fn shape(&self) -> (usize, usize) {
        self.spec.shape
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.mapping, Some(Mapping::Writable(_)))
    }

    pub fn as_slice(&self) -> Result<&[f64]> {
        let bytes: &[u8] = match &self.mapping {
            Some(Mapping::ReadOnly(m)) => &m[..],
            Some(Mapping::Writable(m)) => &m[..],
            None => return Err(unmapped(&self.spec.path)),
        };
        bytemuck::try_cast_slice(bytes).map_err(|e| {
            DiversityError::InvalidArgument(format!("{}: {e:?}", self.spec.path.display()))
        })
    }

    pub fn view(&self) -> Result<MatrixView<'_>> {
        let (rows, cols) = self.spec.shape;
        MatrixView::from_slice(self.as_slice()?, rows, cols)
    }

    /// Toggle the page protection of the mapping.
    pub fn set_writable(&mut self, writable: bool) -> Result<()> {
        let mapping = match self.mapping.take() {
            Some(m) => m,
            None => return Err(unmapped(&self.spec.path)),
        };
        let path = &self.spec.path;
        self.mapping = Some(match (mapping, writable) {
            (Mapping::ReadOnly(m), true) => {
                Mapping::Writable(m.make_mut().map_err(|e| DiversityError::io(path, e))?)
            }
            (Mapping::Writable(m), false) => {
                Mapping::ReadOnly(m.make_read_only().map_err(|e| DiversityError::io(path, e))?)
            }
            (m, _) => m,
        });
        Ok(())
    }

    /// Run `f` over the elements with the mapping writable, then seal it
    /// read-only again.
    pub fn with_writable<R>(&mut self, f: impl FnOnce(&mut [f64]) -> R) -> Result<R> {
        self.set_writable(true)?;
        let out = match &mut self.mapping {
            Some(Mapping::Writable(m)) => {
                let values: &mut [f64] = bytemuck::try_cast_slice_mut(&mut m[..]).map_err(|e| {
                    DiversityError::InvalidArgument(format!("{}: {e:?}", self.spec.path.display()))
                })?;
                f(values)
            }
            _ => return Err(unmapped(&self.spec.path)),
        };
        self.set_writable(false)?;
        Ok(out)
    }

    pub fn to_matrix(&self) -> Result<Matrix> {
        Ok(self.view()?.to_matrix())
    }
}

/// Creates shared arrays inside a private temporary directory. Clones
/// share the directory; it is removed when the last clone drops.
#[derive(Debug, Clone)]
pub struct SharedArrayManager {
    dir: Arc<TempDir>,
    next_id: Arc<AtomicUsize>,
}

impl SharedArrayManager {
    pub fn new() -> Result<Self> {
        let dir = TempDir::new().map_err(|e| DiversityError::io(std::env::temp_dir(), e))?;
        Ok(Self { dir: Arc::new(dir), next_id: Arc::new(AtomicUsize::new(0)) })
    }

    /// Place arrays under `parent`, e.g. `/dev/shm`.
    pub fn in_dir(parent: impl AsRef<Path>) -> Result<Self> {
        let parent = parent.as_ref();
        let dir = tempfile::Builder::new()
            .prefix("diversity-")
            .tempdir_in(parent)
            .map_err(|e| DiversityError::io(parent, e))?;
        Ok(Self { dir: Arc::new(dir), next_id: Arc::new(AtomicUsize::new(0)) })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// A zero-filled array of the given shape.
    pub fn empty(&self, shape: (usize, usize)) -> Result<SharedArray> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        SharedArray::create(self.dir.path().join(format!("array-{id}.f64")), shape)
    }

    pub fn from_matrix(&self, matrix: MatrixView<'_>) -> Result<SharedArray> {
        let mut array = self.empty(matrix.shape())?;
        array.with_writable(|values| values.copy_from_slice(matrix.as_slice()))?;
        Ok(array)
    }
}

/// Which quantity the shared buffer currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stored {
    Counts,
    SubcommunityAbundance,
    NormalizedSubcommunityAbundance,
}

impl Stored {
    /// Value of one unit of subcommunity abundance in this representation,
    /// for a subcommunity with normalizing constant `constant`.
    fn unit(self, total: f64, constant: f64) -> f64 {
        match self {
            Stored::Counts => total,
            Stored::SubcommunityAbundance => 1.0,
            Stored::NormalizedSubcommunityAbundance => constant.recip(),
        }
    }

    /// Per-subcommunity multipliers taking stored values from `self` to
    /// `target`. Counts → normalized divides column j by `total · c_j`;
    /// subcommunity → normalized divides by `c_j`; and so on.
    fn rescale_factors(self, target: Stored, total: f64, constants: &[f64]) -> Vec<f64> {
        constants
            .iter()
            .map(|&c| target.unit(total, c) / self.unit(total, c))
            .collect()
    }
}

/// Memory-efficient abundances backed by a single shared array.
///
/// Requesting a quantity other than the one currently stored rescales the
/// buffer in place; repeating a request performs no mutation. A view
/// returned by one accessor is invalidated by the next (enforced by the
/// `&mut self` receivers).
#[derive(Debug)]
pub struct SharedAbundance {
    data: SharedArray,
    stored: Stored,
    total: f64,
    constants: Vec<f64>,
    metacommunity: Option<SharedArray>,
    manager: SharedArrayManager,
    rescales: usize,
}

impl SharedAbundance {
    /// `counts` holds raw counts, one row per species and one column per
    /// subcommunity; `manager` allocates the metacommunity array.
    pub fn new(mut counts: SharedArray, manager: SharedArrayManager) -> Result<Self> {
        debug!(spec = ?counts.spec(), "SharedAbundance::new");
        counts.set_writable(false)?;
        let view = counts.view()?;
        validate_counts(view.as_slice())?;
        let total: f64 = view.as_slice().iter().sum();
        let constants = if total > 0.0 {
            view.column_sums().into_iter().map(|s| s / total).collect()
        } else {
            vec![0.0; view.cols()]
        };
        Ok(Self {
            data: counts,
            stored: Stored::Counts,
            total,
            constants,
            metacommunity: None,
            manager,
            rescales: 0,
        })
    }

    /// Copy `counts` into a fresh shared array owned by `manager`.
    pub fn from_matrix(counts: &Matrix, manager: SharedArrayManager) -> Result<Self> {
        let array = manager.from_matrix(counts.view())?;
        Self::new(array, manager)
    }

    pub fn stored(&self) -> Stored {
        self.stored
    }

    /// Number of in-place rescales performed so far.
    pub fn rescales(&self) -> usize {
        self.rescales
    }

    fn transition(&mut self, target: Stored) -> Result<()> {
        if self.stored == target {
            return Ok(());
        }
        let total = nonzero_total(self.total)?;
        if target == Stored::NormalizedSubcommunityAbundance
            || self.stored == Stored::NormalizedSubcommunityAbundance
        {
            empty_subcommunity(&self.constants)?;
        }
        let factors = self.stored.rescale_factors(target, total, &self.constants);
        let cols = factors.len();
        self.data.with_writable(|values| {
            for (i, v) in values.iter_mut().enumerate() {
                *v *= factors[i % cols];
            }
        })?;
        debug!(from = ?self.stored, to = ?target, "rescaled shared abundance");
        self.stored = target;
        self.rescales += 1;
        Ok(())
    }

    fn metacommunity_array(&mut self) -> Result<&SharedArray> {
        let (data, stored, total, constants, manager) =
            (&self.data, self.stored, self.total, &self.constants, &self.manager);
        cached(&mut self.metacommunity, || {
            let total = nonzero_total(total)?;
            let to_subcommunity = stored.rescale_factors(Stored::SubcommunityAbundance, total, constants);
            let view = data.view()?;
            let sums: Vec<f64> = (0..view.rows())
                .map(|r| view.row(r).iter().zip(&to_subcommunity).map(|(v, f)| v * f).sum())
                .collect();
            manager.from_matrix(Matrix::column_vector(sums).view())
        })
    }

    /// Memory block holding the subcommunity abundance.
    pub fn subcommunity_abundance_spec(&mut self) -> Result<SharedArraySpec> {
        self.transition(Stored::SubcommunityAbundance)?;
        Ok(self.data.spec().clone())
    }

    /// Memory block holding the normalized subcommunity abundance.
    pub fn normalized_subcommunity_abundance_spec(&mut self) -> Result<SharedArraySpec> {
        self.transition(Stored::NormalizedSubcommunityAbundance)?;
        Ok(self.data.spec().clone())
    }

    /// Memory block holding the metacommunity abundance.
    pub fn metacommunity_abundance_spec(&mut self) -> Result<SharedArraySpec> {
        Ok(self.metacommunity_array()?.spec().clone())
    }
}

impl RelativeAbundance for SharedAbundance {
    fn shape(&self) -> (usize, usize) {
        self.data.shape()
    }

    fn subcommunity_abundance(&mut self) -> Result<MatrixView<'_>> {
        self.transition(Stored::SubcommunityAbundance)?;
        self.data.view()
    }

    fn metacommunity_abundance(&mut self) -> Result<MatrixView<'_>> {
        self.metacommunity_array()?.view()
    }

    fn subcommunity_normalizing_constants(&mut self) -> Result<&[f64]> {
        nonzero_total(self.total)?;
        Ok(&self.constants)
    }

    fn normalized_subcommunity_abundance(&mut self) -> Result<MatrixView<'_>> {
        self.transition(Stored::NormalizedSubcommunityAbundance)?;
        self.data.view()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abundance::Abundance;
    use approx::assert_abs_diff_eq;

    fn counts() -> Matrix {
        Matrix::from_rows(vec![
            vec![1.0, 0.0, 4.0],
            vec![3.0, 2.0, 0.0],
            vec![0.0, 6.0, 1.0],
            vec![2.0, 1.0, 0.0],
        ])
        .unwrap()
    }

    fn assert_views_eq(a: MatrixView<'_>, b: MatrixView<'_>) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.as_slice().iter().zip(b.as_slice()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-12);
        }
    }

    #[test]
    fn shared_array_is_sealed_and_reopenable() {
        let manager = SharedArrayManager::new().unwrap();
        let m = counts();
        let array = manager.from_matrix(m.view()).unwrap();
        assert!(!array.is_writable());
        assert_eq!(array.to_matrix().unwrap(), m);

        let other = SharedArray::open(array.spec()).unwrap();
        assert_eq!(other.to_matrix().unwrap(), m);
    }

    #[test]
    fn writes_are_visible_through_other_mappings() {
        let manager = SharedArrayManager::new().unwrap();
        let mut array = manager.empty((2, 2)).unwrap();
        let other = SharedArray::open(array.spec()).unwrap();
        array.with_writable(|v| v[3] = 9.0).unwrap();
        assert_eq!(other.as_slice().unwrap()[3], 9.0);
    }

    #[test]
    fn open_rejects_spec_with_wrong_shape() {
        let manager = SharedArrayManager::new().unwrap();
        let array = manager.empty((2, 2)).unwrap();
        let mut spec = array.spec().clone();
        spec.shape = (3, 3);
        assert!(matches!(SharedArray::open(&spec), Err(DiversityError::InvalidArgument(_))));
    }

    #[test]
    fn matches_in_memory_abundance() {
        let manager = SharedArrayManager::new().unwrap();
        let mut shared = SharedAbundance::from_matrix(&counts(), manager).unwrap();
        let mut plain = Abundance::new(counts()).unwrap();

        assert_views_eq(
            shared.normalized_subcommunity_abundance().unwrap(),
            plain.normalized_subcommunity_abundance().unwrap(),
        );
        // Metacommunity computed while the buffer holds normalized values.
        assert_views_eq(shared.metacommunity_abundance().unwrap(), plain.metacommunity_abundance().unwrap());
        assert_views_eq(shared.subcommunity_abundance().unwrap(), plain.subcommunity_abundance().unwrap());
        assert_eq!(
            shared.subcommunity_normalizing_constants().unwrap(),
            plain.subcommunity_normalizing_constants().unwrap()
        );
    }

    #[test]
    fn repeated_requests_do_not_rescale() {
        let manager = SharedArrayManager::new().unwrap();
        let mut shared = SharedAbundance::from_matrix(&counts(), manager).unwrap();
        assert_eq!(shared.stored(), Stored::Counts);

        shared.subcommunity_abundance().unwrap();
        shared.subcommunity_abundance().unwrap();
        assert_eq!(shared.rescales(), 1);

        shared.normalized_subcommunity_abundance().unwrap();
        shared.normalized_subcommunity_abundance_spec().unwrap();
        assert_eq!(shared.rescales(), 2);
        assert_eq!(shared.stored(), Stored::NormalizedSubcommunityAbundance);
    }

    #[test]
    fn spec_describes_the_rescaled_buffer() {
        let manager = SharedArrayManager::new().unwrap();
        let mut shared = SharedAbundance::from_matrix(&counts(), manager).unwrap();
        let spec = shared.subcommunity_abundance_spec().unwrap();
        assert_eq!(spec.shape, (4, 3));
        assert_eq!(spec.dtype, ElementType::F64);
        let seen = SharedArray::open(&spec).unwrap();
        assert_abs_diff_eq!(seen.as_slice().unwrap().iter().sum::<f64>(), 1.0, epsilon = 1e-12);

        let meta = SharedArray::open(&shared.metacommunity_abundance_spec().unwrap()).unwrap();
        assert_eq!(meta.shape(), (4, 1));
    }

    #[test]
    fn empty_subcommunity_leaves_buffer_untouched() {
        let manager = SharedArrayManager::new().unwrap();
        let m = Matrix::from_rows(vec![vec![1.0, 0.0], vec![3.0, 0.0]]).unwrap();
        let mut shared = SharedAbundance::from_matrix(&m, manager).unwrap();
        shared.subcommunity_abundance().unwrap();
        assert!(matches!(shared.normalized_subcommunity_abundance(), Err(DiversityError::Domain(_))));
        assert_eq!(shared.stored(), Stored::SubcommunityAbundance);
        assert_abs_diff_eq!(shared.subcommunity_abundance().unwrap().get(1, 0), 0.75, epsilon = 1e-12);
    }

    #[test]
    fn zero_total_is_domain_error() {
        let manager = SharedArrayManager::new().unwrap();
        let mut shared = SharedAbundance::from_matrix(&Matrix::zeros(2, 2), manager).unwrap();
        assert!(matches!(shared.subcommunity_abundance(), Err(DiversityError::Domain(_))));
        assert!(matches!(shared.subcommunity_normalizing_constants(), Err(DiversityError::Domain(_))));
    }
}
