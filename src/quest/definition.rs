//! Quest Record Structures
//!
//! Typed shapes of the rows the backend returns. Decoding is lenient about
//! the representations older records use (lists stored as JSON text, numbers
//! stored as strings, nulls for defaults) and strict about everything else.

use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::backend::{Collection, Row};

/// Authenticated identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(deserialize_with = "lenient_id")]
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    #[serde(deserialize_with = "lenient_id")]
    pub character_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub character_name: String,
    #[serde(default)]
    pub archetype: Option<String>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_default_character: bool,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    #[serde(deserialize_with = "lenient_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_secret: bool,
}

/// A cipher quest as authored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quest {
    #[serde(deserialize_with = "lenient_id")]
    pub id: String,
    #[serde(default)]
    pub quest_key: String,
    #[serde(default)]
    pub quest_name: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "lenient_optional_id")]
    pub region_id: Option<String>,
    /// Placed signs, in order, as chosen by the author
    #[serde(default, deserialize_with = "string_list")]
    pub signs: Vec<String>,
    #[serde(default)]
    pub cipher_keyword: Option<String>,
    #[serde(default)]
    pub reward_key: Option<String>,
    #[serde(default)]
    pub unlock_prerequisite_category: Option<String>,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub unlock_required_count: u32,
    /// Soft prerequisites: visible but not completable until claimed
    #[serde(default, deserialize_with = "string_list")]
    pub prerequisite_quest_ids: Vec<String>,
    /// Hard prerequisites: hidden until claimed
    #[serde(default, deserialize_with = "string_list")]
    pub hard_lock_quest_ids: Vec<String>,
    #[serde(default, deserialize_with = "string_list")]
    pub allowed_archetypes: Vec<String>,
    #[serde(default = "default_true", deserialize_with = "lenient_bool_true")]
    pub active: bool,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub sort_order: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub gold: i64,
    #[serde(default, deserialize_with = "string_list")]
    pub items: Vec<String>,
    #[serde(default = "default_max_claims", deserialize_with = "lenient_max_claims")]
    pub max_claims: u32,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub lore: Option<String>,
}

impl Quest {
    /// Category the quest is filed under
    pub fn category_name(&self) -> &str {
        match self.category.as_deref() {
            Some(c) if !c.is_empty() => c,
            _ => super::UNCATEGORIZED,
        }
    }

    /// Category whose claims gate this quest, if any
    pub fn prerequisite_category(&self) -> Option<&str> {
        self.unlock_prerequisite_category
            .as_deref()
            .filter(|c| !c.is_empty())
    }

    pub fn keyword(&self) -> &str {
        self.cipher_keyword.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    #[serde(default, deserialize_with = "lenient_optional_id")]
    pub id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(deserialize_with = "lenient_id")]
    pub character_id: String,
    #[serde(deserialize_with = "lenient_id")]
    pub quest_id: String,
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub claimed_at: Option<DateTime<Utc>>,
}

/// Explicit unlock of a (usually secret) category for a character
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockRecord {
    #[serde(default)]
    pub character_id: Option<String>,
    pub category_name: String,
}

/// Sequence that unlocks a secret category when redeemed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretUnlockConfig {
    #[serde(default, deserialize_with = "lenient_optional_id")]
    pub id: Option<String>,
    pub category_name: String,
    #[serde(default)]
    pub unlock_sequence: String,
    #[serde(default)]
    pub cipher_keyword: Option<String>,
    #[serde(default)]
    pub discovery_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeroicFeat {
    #[serde(deserialize_with = "lenient_id")]
    pub id: String,
    #[serde(default)]
    pub feat_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub sort_order: i64,
}

/// Decode rows into typed records, skipping (and logging) malformed ones
pub fn decode_rows<T: DeserializeOwned>(collection: Collection, rows: Vec<Row>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value(Value::Object(row)) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Skipping malformed {} row: {}", collection.as_str(), e);
                None
            }
        })
        .collect()
}

fn default_true() -> bool {
    true
}

fn default_max_claims() -> u32 {
    1
}

fn lenient_id<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected id, found {}", other))),
    }
}

fn lenient_optional_id<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    match Value::deserialize(d)? {
        Value::String(s) if s.is_empty() => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        _ => Ok(None),
    }
}

/// Arrays, JSON text of an array, comma-separated text, or null
fn string_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
    fn element(v: Value) -> Option<String> {
        match v {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    match Value::deserialize(d)? {
        Value::Array(values) => Ok(values.into_iter().filter_map(element).collect()),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.starts_with('[') {
                let values: Vec<Value> = serde_json::from_str(trimmed)
                    .map_err(|e| serde::de::Error::custom(format!("bad list text: {}", e)))?;
                Ok(values.into_iter().filter_map(element).collect())
            } else {
                Ok(trimmed
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect())
            }
        }
        _ => Ok(Vec::new()),
    }
}

fn number_from(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_u32<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(number_from(&value).map(|n| n.max(0.0) as u32).unwrap_or(0))
}

fn lenient_max_claims<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(number_from(&value)
        .map(|n| n as u32)
        .filter(|n| *n > 0)
        .unwrap_or(1))
}

fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(number_from(&value).map(|n| n as i64).unwrap_or(0))
}

fn bool_from(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|n| n != 0.0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "t" | "1" => Some(true),
            "false" | "f" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(bool_from(&value).unwrap_or(false))
}

fn lenient_bool_true<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    let value = Value::deserialize(d)?;
    Ok(bool_from(&value).unwrap_or(true))
}

/// RFC 3339 or SQLite `YYYY-MM-DD HH:MM:SS`; anything else becomes `None`
fn lenient_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    let value = Value::deserialize(d)?;
    let Value::String(s) = value else {
        return Ok(None);
    };

    if let Ok(ts) = DateTime::parse_from_rfc3339(&s) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    Ok(chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => Row::new(),
        }
    }

    #[test]
    fn test_quest_defaults() {
        let quests: Vec<Quest> = decode_rows(
            Collection::Quests,
            vec![row(json!({ "id": 42, "quest_key": "first-steps" }))],
        );
        let quest = &quests[0];
        assert_eq!(quest.id, "42");
        assert!(quest.active);
        assert_eq!(quest.max_claims, 1);
        assert_eq!(quest.unlock_required_count, 0);
        assert!(quest.signs.is_empty());
        assert_eq!(quest.category_name(), "Uncategorized");
        assert_eq!(quest.prerequisite_category(), None);
    }

    #[test]
    fn test_quest_lenient_fields() {
        let quests: Vec<Quest> = decode_rows(
            Collection::Quests,
            vec![row(json!({
                "id": "q1",
                "category": "",
                "unlock_prerequisite_category": "",
                "unlock_required_count": "3",
                "prerequisite_quest_ids": "[\"q0\", \"q00\"]",
                "hard_lock_quest_ids": null,
                "items": "Iron Ore, Ember Shard,",
                "signs": ["fire_ember", "water_tide"],
                "active": "true",
                "max_claims": 0,
                "sort_order": 4.0
            }))],
        );
        let quest = &quests[0];
        assert_eq!(quest.unlock_required_count, 3);
        assert_eq!(quest.prerequisite_quest_ids, vec!["q0", "q00"]);
        assert!(quest.hard_lock_quest_ids.is_empty());
        assert_eq!(quest.items, vec!["Iron Ore", "Ember Shard"]);
        assert_eq!(quest.signs.len(), 2);
        assert_eq!(quest.max_claims, 1);
        assert_eq!(quest.sort_order, 4);
        assert_eq!(quest.category_name(), "Uncategorized");
        assert_eq!(quest.prerequisite_category(), None);
    }

    #[test]
    fn test_malformed_rows_skipped() {
        let claims: Vec<Claim> = decode_rows(
            Collection::Claims,
            vec![
                row(json!({ "character_id": "c1", "quest_id": "q1" })),
                row(json!({ "character_id": "c1" })),
                row(json!({ "character_id": "c1", "quest_id": "q2", "claimed_at": "2025-03-01T10:00:00+00:00" })),
            ],
        );
        assert_eq!(claims.len(), 2);
        assert!(claims[1].claimed_at.is_some());
    }

    #[test]
    fn test_timestamps() {
        let characters: Vec<Character> = decode_rows(
            Collection::Characters,
            vec![
                row(json!({ "character_id": "c1", "created_at": "2025-01-02 03:04:05" })),
                row(json!({ "character_id": "c2", "created_at": "yesterday", "is_default_character": 1 })),
            ],
        );
        assert!(characters[0].created_at.is_some());
        assert!(characters[1].created_at.is_none());
        assert!(characters[1].is_default_character);
    }
}
