//! Redemption
//!
//! A player enters a sign sequence and a keyword. Secret unlock sequences are
//! checked first, then quest reward keys.

use serde::Serialize;
use tracing::{debug, info};

use super::definition::Quest;
use super::state::QuestState;
use crate::error::QuestStateError;
use crate::signs::{cipher, SignCatalog};

const DEFAULT_DISCOVERY_MESSAGE: &str = "You have unlocked a new category.";

/// Result of a redemption attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RedemptionOutcome {
    SecretCategoryUnlocked {
        category_name: String,
        message: String,
    },
    AlreadyUnlocked {
        category_name: String,
    },
    QuestClaimed {
        quest_id: String,
        quest_name: String,
    },
    AlreadyClaimed {
        quest_id: String,
    },
    NoMatch,
}

/// Key a quest expects: the stored reward key, or the placed signs run
/// through the cipher when none was stored
fn expected_key(quest: &Quest, catalog: &SignCatalog) -> Option<String> {
    match quest.reward_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => Some(key.to_string()),
        _ if !quest.signs.is_empty() => cipher::reward_key(&quest.signs, quest.keyword(), catalog)
            .map_err(|e| debug!("Quest {} has an undecodable sequence: {}", quest.id, e))
            .ok(),
        _ => None,
    }
}

/// Try to redeem `entered` signs with `keyword` for the active character
pub async fn redeem(
    state: &QuestState,
    catalog: &SignCatalog,
    entered: &[String],
    keyword: &str,
) -> Result<RedemptionOutcome, QuestStateError> {
    let snapshot = state.snapshot();
    if snapshot.active_character_id.is_none() {
        return Err(QuestStateError::NoCharacterSelected);
    }
    if entered.is_empty() {
        return Ok(RedemptionOutcome::NoMatch);
    }

    let player_key = cipher::player_key(entered);
    let full_key = entered.iter().map(|s| s.trim()).collect::<Vec<_>>().join(",");
    let keyword = cipher::normalize_keyword(keyword);
    debug!("Redeeming sequence {} (keyword '{}')", player_key, keyword);

    // Unlock sequences are stored as full sign ids or as item names
    let secret = snapshot.secret_unlock_configs.iter().find(|config| {
        let sequence = config.unlock_sequence.trim();
        (sequence == full_key || sequence == player_key)
            && cipher::normalize_keyword(config.cipher_keyword.as_deref().unwrap_or("")) == keyword
    });
    if let Some(config) = secret {
        if snapshot.unlocked_categories.contains(&config.category_name) {
            return Ok(RedemptionOutcome::AlreadyUnlocked {
                category_name: config.category_name.clone(),
            });
        }

        state
            .unlock_secret_category(&config.category_name, None, None)
            .await?;
        info!("Secret category unlocked: {}", config.category_name);
        return Ok(RedemptionOutcome::SecretCategoryUnlocked {
            category_name: config.category_name.clone(),
            message: config
                .discovery_message
                .clone()
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_DISCOVERY_MESSAGE.to_string()),
        });
    }

    let quest = snapshot.quests.iter().find(|quest| {
        expected_key(quest, catalog).as_deref() == Some(player_key.as_str())
            && cipher::normalize_keyword(quest.keyword()) == keyword
    });
    let Some(quest) = quest else {
        return Ok(RedemptionOutcome::NoMatch);
    };

    if snapshot.claims.iter().any(|c| c.quest_id == quest.id) {
        return Ok(RedemptionOutcome::AlreadyClaimed {
            quest_id: quest.id.clone(),
        });
    }

    state.add_claim(&quest.id, None, None).await?;
    info!("Quest deciphered: {}", quest.quest_name);
    Ok(RedemptionOutcome::QuestClaimed {
        quest_id: quest.id.clone(),
        quest_name: quest.quest_name.clone(),
    })
}
