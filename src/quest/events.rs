//! Quest State Events
//!
//! Notifications delivered to subscribers after the cache changes. Event
//! names and payload field names are relied on by the UI layer.

use serde::Serialize;

use super::definition::{Character, Claim};
use super::state::CacheKey;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum QuestStateEvent {
    Initialized,
    #[serde(rename_all = "camelCase")]
    CharacterChanged {
        character_id: String,
        character: Option<Character>,
        claims: Vec<Claim>,
    },
    #[serde(rename_all = "camelCase")]
    CharacterDataRefreshed {
        character_id: String,
        claims: Vec<Claim>,
        unlocked_categories: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    QuestClaimed {
        quest_id: String,
        character_id: String,
    },
    #[serde(rename_all = "camelCase")]
    SecretCategoryUnlocked {
        category_name: String,
        character_id: String,
    },
    CharacterCreated {
        character: Character,
    },
    #[serde(rename_all = "camelCase")]
    ArchetypeSet {
        character_id: String,
        archetype: String,
    },
    Invalidated(Vec<CacheKey>),
    Reset,
}

impl QuestStateEvent {
    /// Event name as subscribers see it
    pub fn name(&self) -> &'static str {
        match self {
            QuestStateEvent::Initialized => "initialized",
            QuestStateEvent::CharacterChanged { .. } => "characterChanged",
            QuestStateEvent::CharacterDataRefreshed { .. } => "characterDataRefreshed",
            QuestStateEvent::QuestClaimed { .. } => "questClaimed",
            QuestStateEvent::SecretCategoryUnlocked { .. } => "secretCategoryUnlocked",
            QuestStateEvent::CharacterCreated { .. } => "characterCreated",
            QuestStateEvent::ArchetypeSet { .. } => "archetypeSet",
            QuestStateEvent::Invalidated(_) => "invalidated",
            QuestStateEvent::Reset => "reset",
        }
    }
}
