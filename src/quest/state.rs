//! Quest State Cache
//!
//! Mirrors backend state for the signed-in user and their active character.
//! Every change is staged off to the side and swapped in as a new snapshot
//! only once all of its fetches succeeded, so readers never observe a
//! half-loaded cache.
//!
//! Concurrent high-level operations (say `add_claim` racing
//! `set_active_character`) are not serialized against each other: each one
//! commits its own slices onto the latest snapshot, last write wins per
//! slice, and character data loaded for a character that is no longer active
//! is dropped.

use std::collections::{BTreeSet, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::definition::{
    decode_rows, Category, Character, Claim, HeroicFeat, Quest, Region, SecretUnlockConfig,
    UnlockRecord, User,
};
use super::events::QuestStateEvent;
use super::locks::{self, CategoryProgress, LockStatus, QuestIssue};
use crate::backend::{Collection, DataAccess, Filter, Query, Row, WriteOp};
use crate::error::{QuestStateError, RepoError};
use crate::session::{SessionStore, ACTIVE_CHARACTER_KEY};

/// Cache slices that can be invalidated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheKey {
    CharacterData,
    UserClaims,
    UnlockedCategories,
    Quests,
    Characters,
    Regions,
    Categories,
}

impl CacheKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKey::CharacterData => "characterData",
            CacheKey::UserClaims => "userClaims",
            CacheKey::UnlockedCategories => "unlockedCategories",
            CacheKey::Quests => "quests",
            CacheKey::Characters => "characters",
            CacheKey::Regions => "regions",
            CacheKey::Categories => "categories",
        }
    }

    fn is_character_scoped(&self) -> bool {
        matches!(
            self,
            CacheKey::CharacterData | CacheKey::UserClaims | CacheKey::UnlockedCategories
        )
    }
}

impl FromStr for CacheKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "characterData" => Ok(CacheKey::CharacterData),
            "userClaims" => Ok(CacheKey::UserClaims),
            "unlockedCategories" => Ok(CacheKey::UnlockedCategories),
            "quests" => Ok(CacheKey::Quests),
            "characters" => Ok(CacheKey::Characters),
            "regions" => Ok(CacheKey::Regions),
            "categories" => Ok(CacheKey::Categories),
            other => Err(format!("unknown cache key: {}", other)),
        }
    }
}

/// Immutable view of everything cached
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub user: Option<User>,
    pub active_character_id: Option<String>,
    pub active_character: Option<Character>,
    pub characters: Vec<Character>,
    pub quests: Vec<Quest>,
    pub regions: Vec<Region>,
    pub categories: Vec<Category>,
    pub claims: Vec<Claim>,
    pub explicit_unlocks: Vec<UnlockRecord>,
    pub secret_unlock_configs: Vec<SecretUnlockConfig>,
    /// Derived from quests, claims and explicit unlocks; never patched directly
    pub unlocked_categories: BTreeSet<String>,
    pub heroic_feats: Vec<HeroicFeat>,
    pub last_fetch: HashMap<&'static str, DateTime<Utc>>,
}

impl Snapshot {
    fn recompute_unlocked(&mut self) {
        self.unlocked_categories = if self.active_character_id.is_some() {
            locks::compute_unlocked_categories(&self.explicit_unlocks, &self.claims, &self.quests)
        } else {
            BTreeSet::new()
        };
    }

    fn stamp(&mut self, slice: &'static str) {
        self.last_fetch.insert(slice, Utc::now());
    }
}

/// Quests, regions, categories and feats as fetched together
struct StaticData {
    quests: Vec<Quest>,
    regions: Vec<Region>,
    categories: Vec<Category>,
    heroic_feats: Vec<HeroicFeat>,
}

/// Everything scoped to one character
struct CharacterSlice {
    character_id: String,
    character: Option<Character>,
    claims: Vec<Claim>,
    explicit_unlocks: Vec<UnlockRecord>,
    secret_unlock_configs: Vec<SecretUnlockConfig>,
}

impl CharacterSlice {
    fn apply(self, snapshot: &mut Snapshot) {
        snapshot.active_character = self.character;
        snapshot.claims = self.claims;
        snapshot.explicit_unlocks = self.explicit_unlocks;
        snapshot.secret_unlock_configs = self.secret_unlock_configs;
        snapshot.stamp("characterData");
    }
}

/// Lifecycle as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
}

type InitFuture = Shared<BoxFuture<'static, Result<(), QuestStateError>>>;

enum Lifecycle {
    Uninitialized,
    Initializing(InitFuture),
    Ready,
}

type Subscriber = Arc<dyn Fn(&QuestStateEvent) + Send + Sync>;

struct Inner {
    backend: Arc<dyn DataAccess>,
    session: Arc<dyn SessionStore>,
    snapshot: RwLock<Arc<Snapshot>>,
    lifecycle: Mutex<Lifecycle>,
    /// Bumped by `reset` so a stale initialization cannot commit
    generation: AtomicU64,
    subscribers: Mutex<Vec<(u64, Subscriber)>>,
    next_subscriber: AtomicU64,
}

/// Summary of the cache for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub is_initialized: bool,
    pub user: bool,
    pub active_character: bool,
    pub quest_count: usize,
    pub claim_count: usize,
    pub character_count: usize,
    pub unlocked_category_count: usize,
    pub last_fetch: HashMap<String, DateTime<Utc>>,
}

/// Handle returned by [`QuestState::subscribe`]
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|(id, _)| *id != self.id);
        }
    }
}

/// Cache of quest catalog and character progress
///
/// Cheap to clone; clones share the same cache. Construct one per
/// application and hand it to whatever needs it.
#[derive(Clone)]
pub struct QuestState {
    inner: Arc<Inner>,
}

impl QuestState {
    pub fn new(backend: Arc<dyn DataAccess>, session: Arc<dyn SessionStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                session,
                snapshot: RwLock::new(Arc::new(Snapshot::default())),
                lifecycle: Mutex::new(Lifecycle::Uninitialized),
                generation: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
                next_subscriber: AtomicU64::new(0),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn DataAccess> {
        &self.inner.backend
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Load the cache; concurrent callers share one in-flight load
    pub async fn initialize(&self) -> Result<(), QuestStateError> {
        let future = {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            let in_flight = match &*lifecycle {
                Lifecycle::Ready => {
                    debug!("Already initialized, skipping");
                    return Ok(());
                }
                Lifecycle::Initializing(future) => Some(future.clone()),
                Lifecycle::Uninitialized => None,
            };

            match in_flight {
                Some(future) => {
                    debug!("Initialization in progress, awaiting");
                    future
                }
                None => {
                    let generation = self.inner.generation.load(Ordering::SeqCst);
                    let state = self.clone();
                    let future = async move { state.run_initialization(generation).await }
                        .boxed()
                        .shared();
                    *lifecycle = Lifecycle::Initializing(future.clone());
                    future
                }
            }
        };

        future.await
    }

    async fn run_initialization(self, generation: u64) -> Result<(), QuestStateError> {
        info!("Starting quest state initialization");
        let loaded = self.load_everything().await;

        let mut lifecycle = self.inner.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if self.inner.generation.load(Ordering::SeqCst) != generation {
            warn!("Quest state was reset during initialization, discarding loaded data");
            return loaded.map(|_| ());
        }

        match loaded {
            Ok(snapshot) => {
                info!(
                    "Quest state ready: {} quests, {} claims, {} unlocked categories",
                    snapshot.quests.len(),
                    snapshot.claims.len(),
                    snapshot.unlocked_categories.len()
                );
                // Persisted only on commit so a discarded load leaves the session alone
                if let Some(character_id) = &snapshot.active_character_id {
                    self.inner.session.set(ACTIVE_CHARACTER_KEY, character_id);
                }
                *self.inner.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(snapshot);
                *lifecycle = Lifecycle::Ready;
                drop(lifecycle);

                self.notify(QuestStateEvent::Initialized);
                Ok(())
            }
            Err(e) => {
                *lifecycle = Lifecycle::Uninitialized;
                error!("Quest state initialization failed: {}", e);
                Err(e)
            }
        }
    }

    async fn load_everything(&self) -> Result<Snapshot, QuestStateError> {
        let user = self.fetch_user().await?;
        let static_data = self.fetch_static_data().await?;

        let mut snapshot = Snapshot {
            user: user.clone(),
            quests: static_data.quests,
            regions: static_data.regions,
            categories: static_data.categories,
            heroic_feats: static_data.heroic_feats,
            ..Snapshot::default()
        };
        snapshot.stamp("user");
        snapshot.stamp("staticData");
        debug!(
            "Loaded {} quests, {} categories",
            snapshot.quests.len(),
            snapshot.categories.len()
        );
        log_quest_issues(&snapshot.quests);

        match user {
            Some(user) => {
                snapshot.characters = self.fetch_characters(&user.id).await?;
                snapshot.stamp("characters");

                if let Some(character_id) = self.resolve_active_character(&snapshot.characters) {
                    let slice = self.fetch_character_slice(&character_id).await?;
                    snapshot.active_character_id = Some(character_id);
                    slice.apply(&mut snapshot);
                }
            }
            None => debug!("No user logged in, skipping character data"),
        }

        snapshot.recompute_unlocked();
        Ok(snapshot)
    }

    /// Session choice if it still belongs to the user, else the default
    /// character, else the first one
    fn resolve_active_character(&self, characters: &[Character]) -> Option<String> {
        if let Some(session_id) = self.inner.session.get(ACTIVE_CHARACTER_KEY) {
            if characters.iter().any(|c| c.character_id == session_id) {
                debug!("Using session character: {}", session_id);
                return Some(session_id);
            }
        }

        let chosen = characters
            .iter()
            .find(|c| c.is_default_character)
            .or_else(|| characters.first());

        match chosen {
            Some(character) => {
                debug!("Using character: {}", character.character_id);
                Some(character.character_id.clone())
            }
            None => {
                debug!("No characters found for user");
                None
            }
        }
    }

    /// Drop everything and return to `Uninitialized`
    pub fn reset(&self) {
        info!("Resetting quest state");
        {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            self.inner.generation.fetch_add(1, Ordering::SeqCst);
            *lifecycle = Lifecycle::Uninitialized;
        }
        *self.inner.snapshot.write().unwrap_or_else(|e| e.into_inner()) =
            Arc::new(Snapshot::default());
        self.inner.session.remove(ACTIVE_CHARACTER_KEY);

        self.notify(QuestStateEvent::Reset);
    }

    pub fn lifecycle(&self) -> LifecycleState {
        match &*self.inner.lifecycle.lock().unwrap_or_else(|e| e.into_inner()) {
            Lifecycle::Uninitialized => LifecycleState::Uninitialized,
            Lifecycle::Initializing(_) => LifecycleState::Initializing,
            Lifecycle::Ready => LifecycleState::Ready,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.lifecycle() == LifecycleState::Ready
    }

    // ------------------------------------------------------------------
    // Fetching
    // ------------------------------------------------------------------

    async fn fetch_user(&self) -> Result<Option<User>, QuestStateError> {
        match self.inner.backend.current_user().await {
            Ok(user) => Ok(user),
            // A missing session is the normal logged-out state
            Err(RepoError::Unauthorized(reason)) => {
                debug!("No authenticated user: {}", reason);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_records<T: DeserializeOwned>(
        &self,
        query: Query,
    ) -> Result<Vec<T>, QuestStateError> {
        let rows = self.inner.backend.fetch(&query).await?;
        Ok(decode_rows(query.collection, rows))
    }

    async fn fetch_quests(&self) -> Result<Vec<Quest>, QuestStateError> {
        self.fetch_records(
            Query::new(Collection::Quests)
                .eq("active", true)
                .order_by("sort_order", true),
        )
        .await
    }

    async fn fetch_regions(&self) -> Result<Vec<Region>, QuestStateError> {
        self.fetch_records(Query::new(Collection::Regions)).await
    }

    async fn fetch_categories(&self) -> Result<Vec<Category>, QuestStateError> {
        self.fetch_records(Query::new(Collection::Categories)).await
    }

    async fn fetch_static_data(&self) -> Result<StaticData, QuestStateError> {
        let (quests, regions, categories, heroic_feats) = futures::try_join!(
            self.fetch_quests(),
            self.fetch_regions(),
            self.fetch_categories(),
            self.fetch_records::<HeroicFeat>(
                Query::new(Collection::HeroicFeats)
                    .eq("active", true)
                    .order_by("sort_order", true)
            ),
        )?;

        Ok(StaticData {
            quests,
            regions,
            categories,
            heroic_feats,
        })
    }

    async fn fetch_characters(&self, user_id: &str) -> Result<Vec<Character>, QuestStateError> {
        self.fetch_records(
            Query::new(Collection::Characters)
                .eq("user_id", user_id)
                .order_by("created_at", true),
        )
        .await
    }

    async fn fetch_character_slice(
        &self,
        character_id: &str,
    ) -> Result<CharacterSlice, QuestStateError> {
        debug!("Loading data for character: {}", character_id);

        let (characters, claims, explicit_unlocks, secret_unlock_configs) = futures::try_join!(
            self.fetch_records::<Character>(
                Query::new(Collection::Characters).eq("character_id", character_id)
            ),
            self.fetch_records::<Claim>(
                Query::new(Collection::Claims).eq("character_id", character_id)
            ),
            self.fetch_records::<UnlockRecord>(
                Query::new(Collection::UnlockedCategories).eq("character_id", character_id)
            ),
            self.fetch_records::<SecretUnlockConfig>(Query::new(Collection::SecretUnlockConfigs)),
        )?;

        Ok(CharacterSlice {
            character_id: character_id.to_string(),
            character: characters.into_iter().next(),
            claims,
            explicit_unlocks,
            secret_unlock_configs,
        })
    }

    // ------------------------------------------------------------------
    // Committing
    // ------------------------------------------------------------------

    /// Copy the current snapshot, modify the copy, swap it in
    fn update_snapshot<F: FnOnce(&mut Snapshot)>(&self, modify: F) -> Arc<Snapshot> {
        let mut current = self.inner.snapshot.write().unwrap_or_else(|e| e.into_inner());
        let mut next = (**current).clone();
        modify(&mut next);
        let next = Arc::new(next);
        *current = Arc::clone(&next);
        next
    }

    /// Commit a character slice unless its character stopped being active
    fn commit_character_slice(&self, slice: CharacterSlice) -> Option<Arc<Snapshot>> {
        let mut current = self.inner.snapshot.write().unwrap_or_else(|e| e.into_inner());
        if current.active_character_id.as_deref() != Some(slice.character_id.as_str()) {
            debug!(
                "Discarding data for character {} which is no longer active",
                slice.character_id
            );
            return None;
        }

        let mut next = (**current).clone();
        slice.apply(&mut next);
        next.recompute_unlocked();
        let next = Arc::new(next);
        *current = Arc::clone(&next);
        Some(next)
    }

    /// Fold rows that were just written into the cache of `character_id`
    /// when reloading its data failed
    fn merge_written<F: FnOnce(&mut Snapshot)>(&self, character_id: &str, merge: F) {
        let mut current = self.inner.snapshot.write().unwrap_or_else(|e| e.into_inner());
        if current.active_character_id.as_deref() != Some(character_id) {
            return;
        }

        let mut next = (**current).clone();
        merge(&mut next);
        next.recompute_unlocked();
        *current = Arc::new(next);
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Reload claims, unlocks and the derived category set for the active character
    pub async fn refresh_character_data(&self) -> Result<(), QuestStateError> {
        let Some(character_id) = self.active_character_id() else {
            debug!("No active character to refresh");
            return Ok(());
        };

        debug!("Refreshing character data");
        let slice = self.fetch_character_slice(&character_id).await?;
        if let Some(snapshot) = self.commit_character_slice(slice) {
            self.notify(QuestStateEvent::CharacterDataRefreshed {
                character_id,
                claims: snapshot.claims.clone(),
                unlocked_categories: snapshot.unlocked_categories.iter().cloned().collect(),
            });
        }
        Ok(())
    }

    /// Make `character_id` the active character and load its data
    pub async fn set_active_character(&self, character_id: &str) -> Result<(), QuestStateError> {
        if self.active_character_id().as_deref() == Some(character_id) {
            debug!("Character {} already active", character_id);
            return Ok(());
        }

        info!("Switching to character: {}", character_id);
        let slice = self.fetch_character_slice(character_id).await?;
        if slice.character.is_none() {
            warn!("Character {} not found, activating without a record", character_id);
        }

        self.inner.session.set(ACTIVE_CHARACTER_KEY, character_id);
        let snapshot = self.update_snapshot(|s| {
            s.active_character_id = Some(character_id.to_string());
            slice.apply(s);
            s.recompute_unlocked();
        });

        self.notify(QuestStateEvent::CharacterChanged {
            character_id: character_id.to_string(),
            character: snapshot.active_character.clone(),
            claims: snapshot.claims.clone(),
        });
        Ok(())
    }

    fn resolve_context(
        &self,
        user_id: Option<&str>,
        character_id: Option<&str>,
        action: &'static str,
    ) -> Result<(String, String), QuestStateError> {
        let snapshot = self.snapshot();
        let user_id = user_id
            .map(str::to_string)
            .or_else(|| snapshot.user.as_ref().map(|u| u.id.clone()));
        let character_id = character_id
            .map(str::to_string)
            .or_else(|| snapshot.active_character_id.clone());

        match (user_id, character_id) {
            (Some(user_id), Some(character_id)) => Ok((user_id, character_id)),
            _ => Err(QuestStateError::MissingContext { action }),
        }
    }

    /// Record a claim and reload character data
    ///
    /// Falls back to the signed-in user and active character. Nothing is
    /// reloaded or announced when the write fails. Once the write succeeds the
    /// claim is announced and cached even if the reload fails.
    pub async fn add_claim(
        &self,
        quest_id: &str,
        user_id: Option<&str>,
        character_id: Option<&str>,
    ) -> Result<(), QuestStateError> {
        let (user_id, character_id) = self.resolve_context(user_id, character_id, "add claim")?;

        info!("Adding claim for quest {} (character {})", quest_id, character_id);
        let mut row = Row::new();
        row.insert("user_id".to_string(), Value::from(user_id));
        row.insert("quest_id".to_string(), Value::from(quest_id));
        row.insert("character_id".to_string(), Value::from(character_id.as_str()));
        row.insert("claimed_at".to_string(), Value::from(Utc::now().to_rfc3339()));

        let written = self
            .inner
            .backend
            .write(Collection::Claims, WriteOp::Insert(row))
            .await?;

        // The claim is stored; a failed reload must not hide it from the cache
        if let Err(e) = self.refresh_character_data().await {
            warn!("Claim for quest {} recorded but reload failed: {}", quest_id, e);
            let claims: Vec<Claim> = decode_rows(Collection::Claims, written);
            self.merge_written(&character_id, |s| {
                for claim in claims {
                    if !s.claims.iter().any(|c| c.id.is_some() && c.id == claim.id) {
                        s.claims.push(claim);
                    }
                }
            });
        }

        self.notify(QuestStateEvent::QuestClaimed {
            quest_id: quest_id.to_string(),
            character_id,
        });
        Ok(())
    }

    /// Unlock a secret category; repeating it is harmless
    pub async fn unlock_secret_category(
        &self,
        category_name: &str,
        user_id: Option<&str>,
        character_id: Option<&str>,
    ) -> Result<(), QuestStateError> {
        let (user_id, character_id) =
            self.resolve_context(user_id, character_id, "unlock category")?;

        info!("Unlocking secret category: {}", category_name);
        let mut row = Row::new();
        row.insert("user_id".to_string(), Value::from(user_id));
        row.insert("character_id".to_string(), Value::from(character_id.as_str()));
        row.insert("category_name".to_string(), Value::from(category_name));
        row.insert("unlocked_at".to_string(), Value::from(Utc::now().to_rfc3339()));

        let written = self
            .inner
            .backend
            .write(
                Collection::UnlockedCategories,
                WriteOp::Upsert {
                    row,
                    on_conflict: vec!["character_id".to_string(), "category_name".to_string()],
                },
            )
            .await?;

        if let Err(e) = self.refresh_character_data().await {
            warn!("Category {} unlocked but reload failed: {}", category_name, e);
            let unlocks: Vec<UnlockRecord> = decode_rows(Collection::UnlockedCategories, written);
            self.merge_written(&character_id, |s| {
                for unlock in unlocks {
                    if !s.explicit_unlocks.iter().any(|u| u.category_name == unlock.category_name) {
                        s.explicit_unlocks.push(unlock);
                    }
                }
            });
        }

        self.notify(QuestStateEvent::SecretCategoryUnlocked {
            category_name: category_name.to_string(),
            character_id,
        });
        Ok(())
    }

    /// Create a character for the signed-in user
    ///
    /// The first character becomes the default and is activated.
    pub async fn add_character(&self, character_name: &str) -> Result<Character, QuestStateError> {
        let snapshot = self.snapshot();
        let Some(user) = snapshot.user.as_ref() else {
            return Err(QuestStateError::NotAuthenticated);
        };

        info!("Creating character: {}", character_name);
        let mut row = Row::new();
        row.insert("user_id".to_string(), Value::from(user.id.as_str()));
        row.insert("character_name".to_string(), Value::from(character_name));
        row.insert(
            "is_default_character".to_string(),
            Value::from(snapshot.characters.is_empty()),
        );
        row.insert("archetype".to_string(), Value::Null);
        row.insert("created_at".to_string(), Value::from(Utc::now().to_rfc3339()));

        let rows = self
            .inner
            .backend
            .write(Collection::Characters, WriteOp::Insert(row))
            .await?;
        let character = decode_rows::<Character>(Collection::Characters, rows)
            .into_iter()
            .next()
            .ok_or_else(|| RepoError::Serialization("character insert returned no row".to_string()))?;

        let snapshot = self.update_snapshot(|s| s.characters.push(character.clone()));
        if snapshot.characters.len() == 1 {
            self.set_active_character(&character.character_id).await?;
        }

        self.notify(QuestStateEvent::CharacterCreated {
            character: character.clone(),
        });
        Ok(character)
    }

    /// Set a character's archetype (defaults to the active character)
    pub async fn set_character_archetype(
        &self,
        archetype: &str,
        character_id: Option<&str>,
    ) -> Result<(), QuestStateError> {
        let character_id = character_id
            .map(str::to_string)
            .or_else(|| self.active_character_id())
            .ok_or(QuestStateError::NoCharacterSelected)?;

        info!("Setting archetype {} for character {}", archetype, character_id);
        let mut patch = Row::new();
        patch.insert("archetype".to_string(), Value::from(archetype));
        self.inner
            .backend
            .write(
                Collection::Characters,
                WriteOp::Update {
                    filters: vec![Filter::eq("character_id", character_id.as_str())],
                    patch,
                },
            )
            .await?;

        self.update_snapshot(|s| {
            if let Some(active) = s.active_character.as_mut() {
                if active.character_id == character_id {
                    active.archetype = Some(archetype.to_string());
                }
            }
            for character in s.characters.iter_mut().filter(|c| c.character_id == character_id) {
                character.archetype = Some(archetype.to_string());
            }
        });

        self.notify(QuestStateEvent::ArchetypeSet {
            character_id,
            archetype: archetype.to_string(),
        });
        Ok(())
    }

    /// Refetch the named slices concurrently and commit them together
    ///
    /// If any fetch fails nothing is committed and the previous data stays.
    pub async fn invalidate(&self, keys: &[CacheKey]) -> Result<(), QuestStateError> {
        debug!("Invalidating cache keys: {:?}", keys);

        let snapshot = self.snapshot();
        let wants = |key: CacheKey| keys.contains(&key);
        let character_id = snapshot
            .active_character_id
            .clone()
            .filter(|_| keys.iter().any(CacheKey::is_character_scoped));
        let user_id = snapshot
            .user
            .as_ref()
            .map(|u| u.id.clone())
            .filter(|_| wants(CacheKey::Characters));

        let (slice, quests, characters, regions, categories) = futures::try_join!(
            async {
                match character_id.as_deref() {
                    Some(id) => self.fetch_character_slice(id).await.map(Some),
                    None => Ok(None),
                }
            },
            async {
                if wants(CacheKey::Quests) {
                    self.fetch_quests().await.map(Some)
                } else {
                    Ok(None)
                }
            },
            async {
                match user_id.as_deref() {
                    Some(id) => self.fetch_characters(id).await.map(Some),
                    None => Ok(None),
                }
            },
            async {
                if wants(CacheKey::Regions) {
                    self.fetch_regions().await.map(Some)
                } else {
                    Ok(None)
                }
            },
            async {
                if wants(CacheKey::Categories) {
                    self.fetch_categories().await.map(Some)
                } else {
                    Ok(None)
                }
            },
        )?;

        if let Some(ref quests) = quests {
            log_quest_issues(quests);
        }

        let mut character_refreshed = false;
        let committed = self.update_snapshot(|s| {
            if let Some(quests) = quests {
                s.quests = quests;
                s.stamp("quests");
            }
            if let Some(characters) = characters {
                s.characters = characters;
                s.stamp("characters");
            }
            if let Some(regions) = regions {
                s.regions = regions;
                s.stamp("regions");
            }
            if let Some(categories) = categories {
                s.categories = categories;
                s.stamp("categories");
            }
            if let Some(slice) = slice {
                if s.active_character_id.as_deref() == Some(slice.character_id.as_str()) {
                    slice.apply(s);
                    character_refreshed = true;
                } else {
                    debug!("Discarding data for character {} which is no longer active", slice.character_id);
                }
            }
            s.recompute_unlocked();
        });

        if character_refreshed {
            if let Some(character_id) = committed.active_character_id.clone() {
                self.notify(QuestStateEvent::CharacterDataRefreshed {
                    character_id,
                    claims: committed.claims.clone(),
                    unlocked_categories: committed.unlocked_categories.iter().cloned().collect(),
                });
            }
        }

        self.notify(QuestStateEvent::Invalidated(keys.to_vec()));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read accessors (never touch the backend)
    // ------------------------------------------------------------------

    /// Current snapshot; cheap, and stable while held
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.inner.snapshot.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn user(&self) -> Option<User> {
        self.snapshot().user.clone()
    }

    pub fn active_character_id(&self) -> Option<String> {
        self.snapshot().active_character_id.clone()
    }

    pub fn active_character(&self) -> Option<Character> {
        self.snapshot().active_character.clone()
    }

    pub fn characters(&self) -> Vec<Character> {
        self.snapshot().characters.clone()
    }

    pub fn all_quests(&self) -> Vec<Quest> {
        self.snapshot().quests.clone()
    }

    pub fn regions(&self) -> Vec<Region> {
        self.snapshot().regions.clone()
    }

    pub fn user_claims(&self) -> Vec<Claim> {
        self.snapshot().claims.clone()
    }

    pub fn categories(&self) -> Vec<Category> {
        self.snapshot().categories.clone()
    }

    pub fn unlocked_categories(&self) -> BTreeSet<String> {
        self.snapshot().unlocked_categories.clone()
    }

    pub fn heroic_feats(&self) -> Vec<HeroicFeat> {
        self.snapshot().heroic_feats.clone()
    }

    pub fn secret_unlock_configs(&self) -> Vec<SecretUnlockConfig> {
        self.snapshot().secret_unlock_configs.clone()
    }

    pub fn quest_by_id(&self, quest_id: &str) -> Option<Quest> {
        self.snapshot().quests.iter().find(|q| q.id == quest_id).cloned()
    }

    pub fn quest_by_key(&self, quest_key: &str) -> Option<Quest> {
        self.snapshot()
            .quests
            .iter()
            .find(|q| q.quest_key == quest_key)
            .cloned()
    }

    pub fn region_for(&self, quest: &Quest) -> Option<Region> {
        let region_id = quest.region_id.as_deref()?;
        self.snapshot().regions.iter().find(|r| r.id == region_id).cloned()
    }

    pub fn is_quest_claimed(&self, quest_id: &str) -> bool {
        self.snapshot().claims.iter().any(|c| c.quest_id == quest_id)
    }

    pub fn is_category_unlocked(&self, category_name: &str) -> bool {
        self.snapshot().unlocked_categories.contains(category_name)
    }

    pub fn category_progress(&self, category_name: &str) -> CategoryProgress {
        let snapshot = self.snapshot();
        locks::progress_in(category_name, &snapshot.claims, &snapshot.quests)
    }

    /// Lock status of a cached quest against the active character's claims
    pub fn quest_lock_status(&self, quest_id: &str) -> Option<LockStatus> {
        let snapshot = self.snapshot();
        let quest = snapshot.quests.iter().find(|q| q.id == quest_id)?;
        Some(locks::lock_status(quest, &snapshot.claims, &snapshot.quests))
    }

    /// Whether the active character may see the quest at all
    pub fn is_quest_available(&self, quest_id: &str) -> bool {
        let snapshot = self.snapshot();
        let Some(quest) = snapshot.quests.iter().find(|q| q.id == quest_id) else {
            return false;
        };
        let archetype = snapshot
            .active_character
            .as_ref()
            .and_then(|c| c.archetype.as_deref());
        locks::is_quest_available(
            quest,
            archetype,
            &snapshot.categories,
            &snapshot.unlocked_categories,
        )
    }

    pub fn cache_stats(&self) -> CacheStats {
        let snapshot = self.snapshot();
        CacheStats {
            is_initialized: self.is_ready(),
            user: snapshot.user.is_some(),
            active_character: snapshot.active_character.is_some(),
            quest_count: snapshot.quests.len(),
            claim_count: snapshot.claims.len(),
            character_count: snapshot.characters.len(),
            unlocked_category_count: snapshot.unlocked_categories.len(),
            last_fetch: snapshot
                .last_fetch
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // Subscribers
    // ------------------------------------------------------------------

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&QuestStateEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));

        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Deliver `event` to every subscriber; a panicking subscriber is logged
    /// and skipped
    fn notify(&self, event: QuestStateEvent) {
        debug!("Event: {}", event.name());

        let subscribers: Vec<Subscriber> = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, s)| Arc::clone(s))
            .collect();

        for subscriber in subscribers {
            if catch_unwind(AssertUnwindSafe(|| subscriber(&event))).is_err() {
                error!("Subscriber panicked while handling {}", event.name());
            }
        }
    }
}

fn log_quest_issues(quests: &[Quest]) {
    for issue in locks::validate_quest_graph(quests) {
        match issue {
            QuestIssue::MissingPrerequisite { quest_id, missing_id } => warn!(
                "Quest '{}' references non-existent prerequisite '{}'",
                quest_id, missing_id
            ),
            QuestIssue::SelfReference { quest_id } => {
                warn!("Quest '{}' lists itself as a prerequisite", quest_id)
            }
            QuestIssue::Orphan { quest_id } => {
                debug!("Quest '{}' has no prerequisites or dependents", quest_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::quest::BEGINNER_GUIDE;
    use crate::session::MemorySessionStore;
    use serde_json::json;

    fn seeded_backend() -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed(
            Collection::Quests,
            vec![
                json!({ "id": "q1", "quest_key": "first", "active": true, "category": BEGINNER_GUIDE,
                        "unlock_prerequisite_category": "Uncategorized", "sort_order": 1,
                        "reward_key": "three", "cipher_keyword": "b" }),
                json!({ "id": "q2", "quest_key": "second", "active": true, "category": BEGINNER_GUIDE,
                        "unlock_prerequisite_category": "Uncategorized", "sort_order": 2 }),
                json!({ "id": "q3", "quest_key": "hunt", "active": true, "category": "Hunting",
                        "unlock_prerequisite_category": BEGINNER_GUIDE,
                        "unlock_required_count": 1, "sort_order": 3,
                        "prerequisite_quest_ids": ["q1"] }),
                json!({ "id": "q4", "quest_key": "vault", "active": true, "category": "Vault",
                        "unlock_prerequisite_category": "Hunting",
                        "unlock_required_count": 5, "sort_order": 4 }),
                json!({ "id": "q0", "quest_key": "retired", "active": false }),
            ],
        );
        backend.seed(
            Collection::Categories,
            vec![
                json!({ "name": BEGINNER_GUIDE, "is_secret": false }),
                json!({ "name": "Hunting", "is_secret": false }),
                json!({ "name": "Vault", "is_secret": true }),
            ],
        );
        backend.seed(Collection::Regions, vec![json!({ "id": "r1", "name": "Merrie" })]);
        backend.seed(
            Collection::Characters,
            vec![
                json!({ "character_id": "c1", "user_id": "u1", "character_name": "Ash",
                        "created_at": "2025-01-01T00:00:00Z" }),
                json!({ "character_id": "c2", "user_id": "u1", "character_name": "Birch",
                        "is_default_character": true, "created_at": "2025-01-02T00:00:00Z" }),
                json!({ "character_id": "c9", "user_id": "u2", "character_name": "Other" }),
            ],
        );
        backend.seed(
            Collection::SecretUnlockConfigs,
            vec![json!({ "category_name": "Vault", "unlock_sequence": "one,two" })],
        );
        backend
    }

    fn signed_in() -> (Arc<MemoryBackend>, Arc<MemorySessionStore>, QuestState) {
        let backend = seeded_backend();
        backend.sign_in(User { id: "u1".into(), email: None });
        let session = Arc::new(MemorySessionStore::new());
        let state = QuestState::new(backend.clone(), session.clone());
        (backend, session, state)
    }

    fn record_events(state: &QuestState) -> Arc<Mutex<Vec<String>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        state.subscribe(move |event| sink.lock().unwrap().push(event.name().to_string()));
        events
    }

    #[tokio::test]
    async fn test_uninitialized_defaults() {
        let (backend, _, state) = signed_in();
        assert_eq!(state.lifecycle(), LifecycleState::Uninitialized);
        assert!(state.user().is_none());
        assert!(state.all_quests().is_empty());
        assert!(state.unlocked_categories().is_empty());
        assert!(!state.is_quest_claimed("q1"));
        assert_eq!(state.quest_lock_status("q1"), None);
        assert_eq!(backend.fetch_count(Collection::Quests), 0);
    }

    #[tokio::test]
    async fn test_initialize_anonymous() {
        let backend = seeded_backend();
        backend.fail_identity(RepoError::Unauthorized("Auth session missing".into()));
        let state = QuestState::new(backend.clone(), Arc::new(MemorySessionStore::new()));

        state.initialize().await.unwrap();
        assert!(state.is_ready());
        assert!(state.user().is_none());
        assert_eq!(state.all_quests().len(), 4);
        assert_eq!(state.all_quests()[0].id, "q1");
        assert_eq!(state.categories().len(), 3);
        assert!(state.active_character_id().is_none());
        assert_eq!(backend.fetch_count(Collection::Claims), 0);
    }

    #[tokio::test]
    async fn test_initialize_failure_leaves_uninitialized() {
        let (backend, _, state) = signed_in();
        let events = record_events(&state);
        backend.fail_reads(Collection::Categories, RepoError::Transport("offline".into()));

        let err = state.initialize().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Backend);
        assert_eq!(state.lifecycle(), LifecycleState::Uninitialized);
        assert!(state.all_quests().is_empty());
        assert!(state.user().is_none());
        assert!(events.lock().unwrap().is_empty());

        backend.clear_failures();
        state.initialize().await.unwrap();
        assert!(state.is_ready());
        assert_eq!(*events.lock().unwrap(), vec!["initialized"]);
    }

    #[tokio::test]
    async fn test_identity_transport_error_is_fatal() {
        let backend = seeded_backend();
        backend.fail_identity(RepoError::Transport("connection reset".into()));
        let state = QuestState::new(backend.clone(), Arc::new(MemorySessionStore::new()));

        assert!(state.initialize().await.is_err());
        assert!(!state.is_ready());
        assert_eq!(backend.fetch_count(Collection::Quests), 0);
    }

    #[tokio::test]
    async fn test_initialize_is_single_flight() {
        let (backend, _, state) = signed_in();
        let events = record_events(&state);

        let other = state.clone();
        let (first, second) = tokio::join!(state.initialize(), other.initialize());
        first.unwrap();
        second.unwrap();

        assert_eq!(backend.fetch_count(Collection::Quests), 1);
        assert_eq!(backend.fetch_count(Collection::Claims), 1);
        assert_eq!(*events.lock().unwrap(), vec!["initialized"]);
        assert_eq!(state.snapshot().quests, other.snapshot().quests);

        state.initialize().await.unwrap();
        assert_eq!(backend.fetch_count(Collection::Quests), 1);
    }

    #[tokio::test]
    async fn test_concurrent_waiters_share_failure() {
        let (backend, _, state) = signed_in();
        backend.fail_reads(Collection::Regions, RepoError::Transport("offline".into()));

        let other = state.clone();
        let (first, second) = tokio::join!(state.initialize(), other.initialize());
        assert_eq!(first.unwrap_err(), second.unwrap_err());
        assert_eq!(backend.fetch_count(Collection::Regions), 1);
    }

    #[tokio::test]
    async fn test_active_character_resolution() {
        // Default character wins without a session value
        let (_, session, state) = signed_in();
        state.initialize().await.unwrap();
        assert_eq!(state.active_character_id().as_deref(), Some("c2"));
        assert_eq!(session.get(ACTIVE_CHARACTER_KEY).as_deref(), Some("c2"));
        assert_eq!(state.characters().len(), 2);

        // A session value owned by the user wins
        let (_, session, state) = signed_in();
        session.set(ACTIVE_CHARACTER_KEY, "c1");
        state.initialize().await.unwrap();
        assert_eq!(state.active_character_id().as_deref(), Some("c1"));
        assert_eq!(state.active_character().unwrap().character_name, "Ash");

        // Someone else's character in the session is ignored
        let (_, session, state) = signed_in();
        session.set(ACTIVE_CHARACTER_KEY, "c9");
        state.initialize().await.unwrap();
        assert_eq!(state.active_character_id().as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn test_first_character_when_no_default() {
        let backend = Arc::new(MemoryBackend::new());
        backend.seed(
            Collection::Characters,
            vec![json!({ "character_id": "solo", "user_id": "u1", "character_name": "Solo" })],
        );
        backend.sign_in(User { id: "u1".into(), email: None });
        let state = QuestState::new(backend, Arc::new(MemorySessionStore::new()));

        state.initialize().await.unwrap();
        assert_eq!(state.active_character_id().as_deref(), Some("solo"));
    }

    #[tokio::test]
    async fn test_sentinels_only_without_claims() {
        let (_, _, state) = signed_in();
        state.initialize().await.unwrap();

        let expected: BTreeSet<String> = crate::quest::ALWAYS_UNLOCKED_CATEGORIES
            .iter()
            .map(|c| c.to_string())
            .collect();
        assert_eq!(state.unlocked_categories(), expected);
        assert!(!state.is_quest_available("q4"));
        assert_eq!(
            state.quest_lock_status("q3"),
            Some(LockStatus::CategoryLocked { category: BEGINNER_GUIDE.into(), required: 1, have: 0 })
        );
    }

    #[tokio::test]
    async fn test_add_claim_without_character_is_rejected() {
        let backend = seeded_backend();
        let state = QuestState::new(backend.clone(), Arc::new(MemorySessionStore::new()));
        state.initialize().await.unwrap();
        let events = record_events(&state);
        let before = state.snapshot();

        let err = state.add_claim("q1", None, None).await.unwrap_err();
        assert_eq!(err, QuestStateError::MissingContext { action: "add claim" });
        assert_eq!(err.kind(), crate::error::ErrorKind::Precondition);

        assert!(backend.rows(Collection::Claims).is_empty());
        assert_eq!(state.user_claims(), before.claims);
        assert_eq!(state.unlocked_categories(), before.unlocked_categories);
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_claim_reloads_and_unlocks() {
        let (backend, _, state) = signed_in();
        state.initialize().await.unwrap();
        let events = record_events(&state);

        state.add_claim("q1", None, None).await.unwrap();

        let claims = backend.rows(Collection::Claims);
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0]["character_id"], json!("c2"));
        assert_eq!(claims[0]["user_id"], json!("u1"));

        assert!(state.is_quest_claimed("q1"));
        assert!(state.is_category_unlocked("Hunting"));
        assert_eq!(state.quest_lock_status("q3"), Some(LockStatus::Unlocked));
        assert_eq!(state.category_progress(BEGINNER_GUIDE).count, 1);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["characterDataRefreshed", "questClaimed"]
        );
    }

    #[tokio::test]
    async fn test_claim_survives_failed_reload() {
        let (backend, _, state) = signed_in();
        state.initialize().await.unwrap();
        let events = record_events(&state);

        backend.fail_reads(Collection::Claims, RepoError::Transport("blip".into()));
        state.add_claim("q1", None, None).await.unwrap();

        assert_eq!(backend.rows(Collection::Claims).len(), 1);
        assert!(state.is_quest_claimed("q1"));
        assert!(state.is_category_unlocked("Hunting"));
        assert_eq!(*events.lock().unwrap(), vec!["questClaimed"]);

        backend.clear_failures();
        state.refresh_character_data().await.unwrap();
        assert_eq!(state.user_claims().len(), 1);
    }

    #[tokio::test]
    async fn test_unlock_survives_failed_reload() {
        let (backend, _, state) = signed_in();
        state.initialize().await.unwrap();
        let events = record_events(&state);

        backend.fail_reads(Collection::UnlockedCategories, RepoError::Transport("blip".into()));
        state.unlock_secret_category("Vault", None, None).await.unwrap();

        assert!(state.is_category_unlocked("Vault"));
        assert_eq!(*events.lock().unwrap(), vec!["secretCategoryUnlocked"]);
    }

    #[tokio::test]
    async fn test_failed_claim_write_changes_nothing() {
        let (backend, _, state) = signed_in();
        state.initialize().await.unwrap();
        let events = record_events(&state);
        let claim_reads = backend.fetch_count(Collection::Claims);

        backend.fail_writes(Collection::Claims, RepoError::Database("locked".into()));
        let err = state.add_claim("q1", None, None).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Backend);

        assert_eq!(backend.fetch_count(Collection::Claims), claim_reads);
        assert!(state.user_claims().is_empty());
        assert!(events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unlock_secret_category_is_idempotent() {
        let (backend, _, state) = signed_in();
        state.initialize().await.unwrap();

        state.unlock_secret_category("Vault", None, None).await.unwrap();
        let after_first = state.unlocked_categories();
        assert!(after_first.contains("Vault"));
        assert!(state.is_quest_available("q4"));

        state.unlock_secret_category("Vault", None, None).await.unwrap();
        assert_eq!(state.unlocked_categories(), after_first);
        assert_eq!(backend.rows(Collection::UnlockedCategories).len(), 1);
    }

    #[tokio::test]
    async fn test_set_active_character() {
        let (backend, session, state) = signed_in();
        backend.seed(
            Collection::Claims,
            vec![json!({ "character_id": "c1", "quest_id": "q1", "user_id": "u1" })],
        );
        state.initialize().await.unwrap();
        let events = record_events(&state);
        assert!(!state.is_quest_claimed("q1"));

        state.set_active_character("c1").await.unwrap();
        assert_eq!(state.active_character_id().as_deref(), Some("c1"));
        assert_eq!(session.get(ACTIVE_CHARACTER_KEY).as_deref(), Some("c1"));
        assert!(state.is_quest_claimed("q1"));
        assert!(state.is_category_unlocked("Hunting"));

        let reads = backend.fetch_count(Collection::Claims);
        state.set_active_character("c1").await.unwrap();
        assert_eq!(backend.fetch_count(Collection::Claims), reads);
        assert_eq!(*events.lock().unwrap(), vec!["characterChanged"]);
    }

    #[tokio::test]
    async fn test_stale_character_slice_is_discarded() {
        let (_, _, state) = signed_in();
        state.initialize().await.unwrap();

        let stale = state.fetch_character_slice("c2").await.unwrap();
        state.set_active_character("c1").await.unwrap();
        assert!(state.commit_character_slice(stale).is_none());
        assert_eq!(state.active_character().unwrap().character_id, "c1");
    }

    #[tokio::test]
    async fn test_invalidate_commits_only_on_full_success() {
        let (backend, _, state) = signed_in();
        state.initialize().await.unwrap();
        let events = record_events(&state);

        backend.seed(Collection::Quests, vec![json!({ "id": "q5", "quest_key": "new", "active": true })]);
        backend.fail_reads(Collection::Regions, RepoError::Transport("offline".into()));

        assert!(state
            .invalidate(&[CacheKey::Quests, CacheKey::Regions])
            .await
            .is_err());
        assert_eq!(state.all_quests().len(), 4);
        assert_eq!(state.regions().len(), 1);
        assert!(events.lock().unwrap().is_empty());

        backend.clear_failures();
        state
            .invalidate(&[CacheKey::Quests, CacheKey::Regions])
            .await
            .unwrap();
        assert!(state.quest_by_key("new").is_some());
        assert_eq!(*events.lock().unwrap(), vec!["invalidated"]);
    }

    #[tokio::test]
    async fn test_invalidate_character_data() {
        let (backend, _, state) = signed_in();
        state.initialize().await.unwrap();
        let events = record_events(&state);

        backend.seed(
            Collection::Claims,
            vec![json!({ "character_id": "c2", "quest_id": "q2" })],
        );
        let quest_reads = backend.fetch_count(Collection::Quests);
        state.invalidate(&[CacheKey::UserClaims]).await.unwrap();

        assert!(state.is_quest_claimed("q2"));
        assert_eq!(backend.fetch_count(Collection::Quests), quest_reads);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["characterDataRefreshed", "invalidated"]
        );
    }

    #[tokio::test]
    async fn test_panicking_subscriber_is_isolated() {
        let (_, _, state) = signed_in();
        state.initialize().await.unwrap();

        state.subscribe(|_| panic!("subscriber bug"));
        let events = record_events(&state);

        state.add_claim("q1", None, None).await.unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec!["characterDataRefreshed", "questClaimed"]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let (_, _, state) = signed_in();
        let count = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&count);
        let subscription = state.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(state.subscriber_count(), 1);

        state.initialize().await.unwrap();
        subscription.unsubscribe();
        state.reset();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(state.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_reset_during_initialization_discards_load() {
        let (backend, session, state) = signed_in();
        let events = record_events(&state);

        let (result, _) = tokio::join!(state.initialize(), async {
            tokio::task::yield_now().await;
            assert_eq!(state.lifecycle(), LifecycleState::Initializing);
            state.reset();
        });
        result.unwrap();

        assert_eq!(backend.fetch_count(Collection::Quests), 1);
        assert_eq!(state.lifecycle(), LifecycleState::Uninitialized);
        assert!(state.user().is_none());
        assert!(state.all_quests().is_empty());
        assert!(state.active_character_id().is_none());
        assert!(state.unlocked_categories().is_empty());
        assert!(session.get(ACTIVE_CHARACTER_KEY).is_none());
        assert_eq!(*events.lock().unwrap(), vec!["reset"]);

        state.initialize().await.unwrap();
        assert!(state.is_ready());
    }

    #[tokio::test]
    async fn test_reset() {
        let (backend, session, state) = signed_in();
        state.initialize().await.unwrap();
        assert!(session.get(ACTIVE_CHARACTER_KEY).is_some());

        state.reset();
        assert_eq!(state.lifecycle(), LifecycleState::Uninitialized);
        assert!(state.all_quests().is_empty());
        assert!(state.active_character_id().is_none());
        assert!(session.get(ACTIVE_CHARACTER_KEY).is_none());

        state.initialize().await.unwrap();
        assert!(state.is_ready());
        assert_eq!(backend.fetch_count(Collection::Quests), 2);
    }

    #[tokio::test]
    async fn test_add_character_and_archetype() {
        let backend = seeded_backend();
        backend.sign_in(User { id: "u3".into(), email: None });
        let state = QuestState::new(backend.clone(), Arc::new(MemorySessionStore::new()));
        state.initialize().await.unwrap();
        assert!(state.characters().is_empty());
        let events = record_events(&state);

        let created = state.add_character("Cedar").await.unwrap();
        assert!(created.is_default_character);
        assert_eq!(state.active_character_id(), Some(created.character_id.clone()));

        let second = state.add_character("Dune").await.unwrap();
        assert!(!second.is_default_character);
        assert_eq!(state.active_character_id(), Some(created.character_id.clone()));

        state.set_character_archetype("Warden", None).await.unwrap();
        assert_eq!(state.active_character().unwrap().archetype.as_deref(), Some("Warden"));
        assert_eq!(state.characters()[0].archetype.as_deref(), Some("Warden"));

        assert_eq!(
            *events.lock().unwrap(),
            vec!["characterChanged", "characterCreated", "characterCreated", "archetypeSet"]
        );
    }

    #[tokio::test]
    async fn test_add_character_requires_user() {
        let backend = seeded_backend();
        let state = QuestState::new(backend, Arc::new(MemorySessionStore::new()));
        state.initialize().await.unwrap();

        let err = state.add_character("Nobody").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotLoggedIn);
        assert_eq!(
            state.set_character_archetype("Seer", None).await.unwrap_err(),
            QuestStateError::NoCharacterSelected
        );
    }

    #[tokio::test]
    async fn test_cache_stats() {
        let (_, _, state) = signed_in();
        state.initialize().await.unwrap();

        let stats = state.cache_stats();
        assert!(stats.is_initialized);
        assert!(stats.user);
        assert!(stats.active_character);
        assert_eq!(stats.quest_count, 4);
        assert_eq!(stats.character_count, 2);
        assert!(stats.last_fetch.contains_key("staticData"));
        assert!(stats.last_fetch.contains_key("characterData"));
    }

    #[test]
    fn test_cache_key_names() {
        for key in [
            CacheKey::CharacterData,
            CacheKey::UserClaims,
            CacheKey::UnlockedCategories,
            CacheKey::Quests,
            CacheKey::Characters,
            CacheKey::Regions,
            CacheKey::Categories,
        ] {
            assert_eq!(key.as_str().parse::<CacheKey>(), Ok(key));
        }
    }
}
