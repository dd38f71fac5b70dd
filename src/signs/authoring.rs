//! Reward authoring
//!
//! Turns an author's placed signs and keyword into the encoded sequence and
//! reward key stored on a quest record.

use serde_json::{json, Map};
use tracing::info;

use super::catalog::{item_name, SignCatalog};
use super::{cipher, SignError};
use crate::backend::{Collection, DataAccess, Filter, WriteOp};
use crate::error::QuestStateError;

/// Authoring policy: a reward sequence has at most this many signs
pub const MAX_PLACED_SIGNS: usize = 5;

/// One column of the authoring view: what the author placed and what the
/// player has to enter for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardStep {
    pub placed: String,
    pub encoded: String,
    /// Display label for the encoded sign
    pub label: String,
}

/// A validated reward sequence ready to be stored on a quest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthoredReward {
    pub placed: Vec<String>,
    pub keyword: String,
    pub encoded: Vec<String>,
    pub reward_key: String,
}

impl AuthoredReward {
    pub fn new(
        placed: Vec<String>,
        keyword: &str,
        catalog: &SignCatalog,
    ) -> Result<Self, SignError> {
        if placed.len() > MAX_PLACED_SIGNS {
            return Err(SignError::TooManySigns {
                count: placed.len(),
                max: MAX_PLACED_SIGNS,
            });
        }

        // Encode with the keyword exactly as it will be stored
        let keyword = keyword.trim();
        let encoded = cipher::encode(&placed, keyword, catalog)?;
        let reward_key = cipher::player_key(&encoded);

        Ok(Self {
            placed,
            keyword: keyword.to_string(),
            encoded,
            reward_key,
        })
    }

    pub fn steps(&self) -> Vec<RewardStep> {
        self.placed
            .iter()
            .zip(&self.encoded)
            .map(|(placed, encoded)| RewardStep {
                placed: placed.clone(),
                encoded: encoded.clone(),
                label: item_name(encoded).replace(['_', '-'], " "),
            })
            .collect()
    }
}

/// Persist the reward onto the quest record
pub async fn save_reward(
    backend: &dyn DataAccess,
    quest_id: &str,
    reward: &AuthoredReward,
) -> Result<(), QuestStateError> {
    let mut patch = Map::new();
    patch.insert("signs".to_string(), json!(reward.placed));
    patch.insert("cipher_keyword".to_string(), json!(reward.keyword));
    patch.insert("reward_key".to_string(), json!(reward.reward_key));

    backend
        .write(
            Collection::Quests,
            WriteOp::Update {
                filters: vec![Filter::eq("id", quest_id)],
                patch,
            },
        )
        .await?;

    info!("Saved reward sequence for quest {} ({} signs)", quest_id, reward.placed.len());
    Ok(())
}
