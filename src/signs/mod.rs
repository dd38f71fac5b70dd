//! Sign Cipher Module
//!
//! The ordered sign catalog, the keyword rotation applied to reward sequences,
//! and the authoring helpers that persist those sequences onto quests.

pub mod authoring;
pub mod catalog;
pub mod cipher;

pub use authoring::{save_reward, AuthoredReward, RewardStep, MAX_PLACED_SIGNS};
pub use catalog::{SignCatalog, SignDescriptor};

/// Errors raised while loading the catalog or transforming sign sequences
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignError {
    #[error("sign catalog is empty")]
    EmptyCatalog,
    #[error("duplicate sign identifier '{0}' in catalog")]
    DuplicateSign(String),
    #[error("sign '{0}' is not in the catalog")]
    UnknownSign(String),
    #[error("{count} signs placed, at most {max} allowed")]
    TooManySigns { count: usize, max: usize },
    #[error("failed to read sign catalog: {0}")]
    Io(String),
    #[error("failed to parse sign catalog: {0}")]
    Parse(String),
}
