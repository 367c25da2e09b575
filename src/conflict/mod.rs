//! Conflict detection and resolution.

mod detector;
mod resolver;
mod similarity;
mod types;

pub use detector::{Classification, ConflictDetector, DetectorConfig, StrategyOverrides};
pub use resolver::{ConflictResolver, ResolverConfig, DISCARD_REASON};
pub use similarity::{AntonymTable, JaccardSimilarity, SimilarityFn, DEFAULT_ANTONYM_PAIRS};
pub use types::{
    ConflictId, ConflictKind, ConflictRecord, ConflictStatus, ResolutionDetail, ResolutionStrategy,
};
