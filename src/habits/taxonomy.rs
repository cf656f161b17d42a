//! Plaid category taxonomy
//!
//! Parsed from the JSON returned by Plaid's categories endpoint.

use crate::Result;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Category {
    pub category_id: String,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub hierarchy: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CategoryTaxonomy {
    #[serde(default)]
    categories: Vec<Category>,
}

impl CategoryTaxonomy {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// Ids of every category with `level` somewhere in its hierarchy
    pub fn ids_in_hierarchy(&self, level: &str) -> Vec<String> {
        self.categories
            .iter()
            .filter(|c| c.hierarchy.iter().any(|h| h == level))
            .map(|c| c.category_id.clone())
            .collect()
    }

    pub fn get(&self, category_id: &str) -> Option<&Category> {
        self.categories.iter().find(|c| c.category_id == category_id)
    }
}
