//! Quest state cache and sign cipher for the quest redemption companion.

pub mod backend;
pub mod config;
pub mod error;
pub mod quest;
pub mod session;
pub mod signs;

pub use backend::{Collection, DataAccess, MemoryBackend, Query, Row, SqliteBackend, WriteOp};
pub use config::{AppConfig, ConfigError};
pub use error::{ErrorKind, QuestStateError, RepoError};
pub use quest::{CacheKey, QuestState, QuestStateEvent, RedemptionOutcome};
pub use session::{FileSessionStore, MemorySessionStore, SessionStore};
pub use signs::{SignCatalog, SignError};
