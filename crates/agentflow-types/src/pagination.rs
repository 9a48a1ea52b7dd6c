//! Listing options shared by every paginated repository query.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sort order for list queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Equality filter on a top-level field of the stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub value: Value,
}

impl FieldFilter {
    pub fn new(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Offset pagination with optional filters and sort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListOptions {
    #[serde(default)]
    pub offset: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub filters: Vec<FieldFilter>,
    /// Top-level field to sort by. Defaults to `created_at`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_by: Option<String>,
    #[serde(default)]
    pub order: SortOrder,
}

fn default_limit() -> usize {
    50
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: default_limit(),
            filters: Vec::new(),
            sort_by: None,
            order: SortOrder::default(),
        }
    }
}

impl ListOptions {
    pub fn page(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit,
            ..Self::default()
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(FieldFilter::new(field, value));
        self
    }

    pub fn sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort_by = Some(field.into());
        self.order = order;
        self
    }

    /// The sort field, falling back to `created_at`.
    pub fn sort_field(&self) -> &str {
        self.sort_by.as_deref().unwrap_or("created_at")
    }
}

/// One page of a list query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Matching items before pagination.
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        self.offset + self.items.len() < self.total
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            offset: self.offset,
            limit: self.limit,
        }
    }
}
