//! Sign Catalog
//!
//! Loads the static sign descriptor and flattens it into the ordered ring of
//! identifiers the cipher rotates over.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use super::SignError;

/// Sign descriptor as it appears in `signs.json`
#[derive(Debug, Clone, Deserialize)]
pub struct SignDescriptor {
    #[serde(default)]
    pub config: SignAssetConfig,
    pub categories: Vec<SignCategory>,
}

/// Where sign images are served from
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignAssetConfig {
    #[serde(rename = "baseUrl", default)]
    pub base_url: String,
    /// Cache-busting tag; some descriptors store it as a number
    #[serde(default)]
    pub version: serde_json::Value,
}

impl SignAssetConfig {
    fn version_tag(&self) -> String {
        match &self.version {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// A group of signs sharing an identifier prefix
#[derive(Debug, Clone, Deserialize)]
pub struct SignCategory {
    pub id: String,
    #[serde(default)]
    pub items: Vec<String>,
}

/// Ordered, duplicate-free list of sign identifiers
///
/// Order defines the ring used by the cipher shift, so it must match the
/// descriptor file exactly. A catalog is never empty.
#[derive(Debug, Clone)]
pub struct SignCatalog {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    assets: SignAssetConfig,
}

impl SignCatalog {
    /// Build a catalog from an explicit identifier list
    pub fn from_ids(ids: Vec<String>) -> Result<Self, SignError> {
        Self::build(ids, SignAssetConfig::default())
    }

    /// Flatten a descriptor into `category_item` identifiers in file order
    pub fn from_descriptor(descriptor: SignDescriptor) -> Result<Self, SignError> {
        let ids = descriptor
            .categories
            .iter()
            .flat_map(|category| {
                category
                    .items
                    .iter()
                    .map(move |item| format!("{}_{}", category.id, item))
            })
            .collect();

        Self::build(ids, descriptor.config)
    }

    /// Load and validate the descriptor at `path`
    pub fn load(path: &Path) -> Result<Self, SignError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SignError::Io(format!("{:?}: {}", path, e)))?;

        let descriptor: SignDescriptor = serde_json::from_str(&content)
            .map_err(|e| SignError::Parse(format!("{:?}: {}", path, e)))?;

        let catalog = Self::from_descriptor(descriptor)?;
        info!("Loaded {} signs from {:?}", catalog.len(), path);
        Ok(catalog)
    }

    fn build(ids: Vec<String>, assets: SignAssetConfig) -> Result<Self, SignError> {
        if ids.is_empty() {
            return Err(SignError::EmptyCatalog);
        }

        let mut index = HashMap::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            if index.insert(id.clone(), i).is_some() {
                return Err(SignError::DuplicateSign(id.clone()));
            }
        }

        Ok(Self { ids, index, assets })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Never true for a validated catalog
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Identifier at ring position `index`
    pub fn get(&self, index: usize) -> Option<&str> {
        self.ids.get(index).map(String::as_str)
    }

    /// Ring position of `id`
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Image URL for a sign, as the picker renders it
    pub fn image_url(&self, id: &str) -> String {
        format!("{}{}.webp?{}", self.assets.base_url, id, self.assets.version_tag())
    }
}

/// Identifier minus its category prefix
pub fn item_name(id: &str) -> &str {
    match id.split_once('_') {
        Some((_, name)) => name,
        None => id,
    }
}
