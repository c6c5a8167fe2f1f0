//! Canonical product records and the merge rules for writing them
//!
//! Every product attribute belongs to exactly one provenance class:
//!
//! - **source-owned** ([`SourceFields`]): whatever the marketplace currently
//!   says. Overwritten on every successful re-fetch.
//! - **user-owned** ([`UserFields`]): community tags and curation notes added
//!   by people. The crawl engine never writes them.
//!
//! Because the engine only ever writes source-owned columns, its upserts
//! commute with concurrent admin edits to user-owned columns.

mod upsert;

pub use upsert::{UpsertEngine, UpsertResult};

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Attributes the marketplace owns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceFields {
    /// Absolute URL of the item's detail page
    pub url: String,
    pub title: String,
    pub description: String,
    /// Lowest listed price (whole currency units)
    pub price_low: Option<i64>,
    /// Highest listed price, equal to `price_low` for single-variant items
    pub price_high: Option<i64>,
    pub image_urls: Vec<String>,
    pub official_tags: Vec<String>,
    pub shop_name: String,
    /// Absolute URL of the seller's shop page, empty when unknown
    pub shop_url: String,
    /// Normalized to `R-18`, `R-15` or `all-ages` when known
    pub age_rating: Option<String>,
}

/// Attributes people own
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserFields {
    pub community_tags: BTreeSet<String>,
    pub curation_note: Option<String>,
}

/// A stored product, keyed by the marketplace's item id
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalProduct {
    pub external_id: String,
    pub source: SourceFields,
    pub user: UserFields,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One item as extracted from a fetched page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedItem {
    pub external_id: String,
    pub source: SourceFields,
}

impl ParsedItem {
    pub fn new(external_id: impl Into<String>, source: SourceFields) -> Self {
        Self {
            external_id: external_id.into(),
            source,
        }
    }
}
