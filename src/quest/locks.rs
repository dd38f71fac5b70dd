//! Lock and Unlock Derivations
//!
//! Pure functions over (quests, claims, unlock records). Nothing here touches
//! the backend, so the cache can recompute any of it from its snapshot.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Serialize;

use super::definition::{Category, Claim, Quest, UnlockRecord};
use super::{ALWAYS_UNLOCKED_CATEGORIES, ARCHETYPE_CATEGORY_PREFIX};

/// Why a quest cannot be completed (or seen) yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LockStatus {
    Unlocked,
    /// Hidden: the prerequisite category has too few claims
    CategoryLocked {
        category: String,
        required: u32,
        have: u32,
    },
    /// Hidden: specific quests must be claimed first
    HardLocked { missing: Vec<String> },
    /// Visible but not completable until these quests are claimed
    SoftLocked { missing: Vec<String> },
}

impl LockStatus {
    pub fn is_locked(&self) -> bool {
        !matches!(self, LockStatus::Unlocked)
    }

    /// Visible to the player (unlocked or only soft-locked)
    pub fn is_viewable(&self) -> bool {
        matches!(self, LockStatus::Unlocked | LockStatus::SoftLocked { .. })
    }
}

/// Progress through one category
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CategoryProgress {
    pub count: usize,
    pub total: usize,
    pub percentage: f64,
}

/// Claims per quest category (only quests with an explicit category count)
pub fn category_progress(claims: &[Claim], quests: &[Quest]) -> HashMap<String, u32> {
    let by_id: HashMap<&str, &Quest> = quests.iter().map(|q| (q.id.as_str(), q)).collect();

    let mut progress = HashMap::new();
    for claim in claims {
        let category = by_id
            .get(claim.quest_id.as_str())
            .and_then(|q| q.category.as_deref())
            .filter(|c| !c.is_empty());
        if let Some(category) = category {
            *progress.entry(category.to_string()).or_insert(0) += 1;
        }
    }
    progress
}

/// Claimed count and total quests in `category`
pub fn progress_in(category: &str, claims: &[Claim], quests: &[Quest]) -> CategoryProgress {
    let count = category_progress(claims, quests)
        .get(category)
        .copied()
        .unwrap_or(0) as usize;
    let total = quests
        .iter()
        .filter(|q| q.category.as_deref() == Some(category))
        .count();

    CategoryProgress {
        count,
        total,
        percentage: if total > 0 {
            count as f64 / total as f64 * 100.0
        } else {
            0.0
        },
    }
}

/// Lock status of `quest` given the character's claims
///
/// Checks run in order: category requirement, hard-lock quests, soft
/// prerequisites. The first unmet one decides.
pub fn lock_status(quest: &Quest, claims: &[Claim], quests: &[Quest]) -> LockStatus {
    let claimed: HashSet<&str> = claims.iter().map(|c| c.quest_id.as_str()).collect();

    if let Some(category) = quest.prerequisite_category() {
        let have = category_progress(claims, quests)
            .get(category)
            .copied()
            .unwrap_or(0);
        if have < quest.unlock_required_count {
            return LockStatus::CategoryLocked {
                category: category.to_string(),
                required: quest.unlock_required_count,
                have,
            };
        }
    }

    let missing = |ids: &[String]| -> Vec<String> {
        ids.iter()
            .filter(|id| !claimed.contains(id.as_str()))
            .cloned()
            .collect()
    };

    let hard = missing(&quest.hard_lock_quest_ids);
    if !hard.is_empty() {
        return LockStatus::HardLocked { missing: hard };
    }

    let soft = missing(&quest.prerequisite_quest_ids);
    if !soft.is_empty() {
        return LockStatus::SoftLocked { missing: soft };
    }

    LockStatus::Unlocked
}

pub fn is_quest_locked(quest: &Quest, claims: &[Claim], quests: &[Quest]) -> bool {
    lock_status(quest, claims, quests).is_locked()
}

/// Derive the unlocked-category set from scratch
///
/// The union of the always-on categories, explicit unlock records, every
/// category with no prerequisite or a satisfied one, and every category the
/// character already has a claim in. A single claim can satisfy several
/// thresholds at once, so this is always recomputed in full.
pub fn compute_unlocked_categories(
    explicit: &[UnlockRecord],
    claims: &[Claim],
    quests: &[Quest],
) -> BTreeSet<String> {
    let mut unlocked: BTreeSet<String> = ALWAYS_UNLOCKED_CATEGORIES
        .iter()
        .map(|c| c.to_string())
        .collect();

    unlocked.extend(explicit.iter().map(|u| u.category_name.clone()));

    let progress = category_progress(claims, quests);

    for quest in quests {
        let category = quest.category_name();
        if unlocked.contains(category) {
            continue;
        }

        let satisfied = match quest.prerequisite_category() {
            None => true,
            Some(required) => {
                progress.get(required).copied().unwrap_or(0) >= quest.unlock_required_count
            }
        };
        if satisfied {
            unlocked.insert(category.to_string());
        }
    }

    unlocked.extend(progress.into_keys());
    unlocked
}

/// Whether the character may see `quest` at all
///
/// `Archetype: X` categories and `allowed_archetypes` restrict by archetype;
/// secret categories must be unlocked.
pub fn is_quest_available(
    quest: &Quest,
    archetype: Option<&str>,
    categories: &[Category],
    unlocked: &BTreeSet<String>,
) -> bool {
    let category = quest.category_name();

    if let Some(required) = category.strip_prefix(ARCHETYPE_CATEGORY_PREFIX) {
        if archetype != Some(required.trim()) {
            return false;
        }
    }

    if !quest.allowed_archetypes.is_empty() {
        match archetype {
            Some(a) if quest.allowed_archetypes.iter().any(|allowed| allowed == a) => {}
            _ => return false,
        }
    }

    let secret = categories.iter().any(|c| c.name == category && c.is_secret);
    !secret || unlocked.contains(category)
}

/// Structural problem in the quest graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuestIssue {
    /// A prerequisite or hard-lock id that no quest has
    MissingPrerequisite { quest_id: String, missing_id: String },
    /// A quest listing itself as a prerequisite
    SelfReference { quest_id: String },
    /// A quest with no prerequisites and nothing depending on it
    Orphan { quest_id: String },
}

/// Validate quest prerequisite references
pub fn validate_quest_graph(quests: &[Quest]) -> Vec<QuestIssue> {
    let ids: HashSet<&str> = quests.iter().map(|q| q.id.as_str()).collect();
    let mut referenced: HashSet<&str> = HashSet::new();
    let mut issues = Vec::new();

    for quest in quests {
        for prereq in quest.prerequisite_quest_ids.iter().chain(&quest.hard_lock_quest_ids) {
            referenced.insert(prereq.as_str());
            if prereq == &quest.id {
                issues.push(QuestIssue::SelfReference {
                    quest_id: quest.id.clone(),
                });
            } else if !ids.contains(prereq.as_str()) {
                issues.push(QuestIssue::MissingPrerequisite {
                    quest_id: quest.id.clone(),
                    missing_id: prereq.clone(),
                });
            }
        }
    }

    // Quests only make sense as a graph once there is more than one
    if quests.len() > 1 {
        for quest in quests {
            let has_prereqs =
                !quest.prerequisite_quest_ids.is_empty() || !quest.hard_lock_quest_ids.is_empty();
            if !has_prereqs && !referenced.contains(quest.id.as_str()) {
                issues.push(QuestIssue::Orphan {
                    quest_id: quest.id.clone(),
                });
            }
        }
    }

    issues
}
