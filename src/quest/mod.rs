//! Quest State Module
//!
//! Cache of quest definitions and the active character's progress, the pure
//! lock derivations it is built on, and the redemption flow that ties the
//! sign cipher to claims.

pub mod definition;
pub mod events;
pub mod locks;
pub mod redeem;
pub mod state;

pub use definition::{
    Category, Character, Claim, HeroicFeat, Quest, Region, SecretUnlockConfig, UnlockRecord, User,
};
pub use events::QuestStateEvent;
pub use locks::{CategoryProgress, LockStatus, QuestIssue};
pub use redeem::{redeem, RedemptionOutcome};
pub use state::{CacheKey, CacheStats, LifecycleState, QuestState, Snapshot, Subscription};

/// Category for quests filed under nothing
pub const UNCATEGORIZED: &str = "Uncategorized";

/// Starter category every character can see
pub const BEGINNER_GUIDE: &str = "The First Steps: Beginner's Guide";

/// Categories in every character's unlocked set
pub const ALWAYS_UNLOCKED_CATEGORIES: [&str; 2] = [UNCATEGORIZED, BEGINNER_GUIDE];

/// Categories named `Archetype: X` are only for characters of archetype X
pub const ARCHETYPE_CATEGORY_PREFIX: &str = "Archetype: ";
