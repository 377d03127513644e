//! Similarity-sensitive diversity of a metacommunity partitioned into
//! subcommunities (Leinster–Cobbold / Reeve et al. framework).
//!
//! Counts and a similarity source go in; alpha, rho, beta and gamma
//! diversities (raw and normalized) come out, at subcommunity and
//! metacommunity scope, for any viewpoint in `[0, ∞]`.

pub mod abundance;
pub mod counts;
pub mod delimited;
pub mod error;
pub mod matrix;
pub mod metacommunity;
pub mod power_mean;
pub mod similarity;

pub use abundance::{
    Abundance, ElementType, RelativeAbundance, SharedAbundance, SharedArray, SharedArrayManager, SharedArraySpec,
    Stored,
};
pub use counts::{
    make_metacommunity, make_pairwise_metacommunities, make_shared_metacommunity, CountColumns, CountRecord,
    CountsTable,
};
pub use error::{DiversityError, Result};
pub use matrix::{Matrix, MatrixView};
pub use metacommunity::{DiversityRecord, Metacommunity, METACOMMUNITY_LABEL};
pub use power_mean::{power_mean, power_mean_columns};
pub use similarity::{
    make_similarity, ChunkConfig, Similarity, SimilarityFn, SimilarityFromArray, SimilarityFromFile,
    SimilarityFromFunction, SimilarityFromMemmap, SimilarityFromTable, SimilaritySource,
};
