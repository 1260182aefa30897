//! Work discovery: turning a resource family into a finite sequence of fetch targets
//!
//! - [`RangeDiscovery`]: every integer in `[start, end]`, ascending
//! - [`ExplicitDiscovery`]: a caller-supplied id list, in the caller's order
//! - [`PaginationDiscovery`]: page 1 probed for metadata, then pages `2..=N`
//!
//! Each `targets()` call starts a fresh iterator, so a plan can be replayed.

pub mod listing;
pub mod pagination;
pub mod template;

pub use pagination::{LastPageSource, PageObservation, PageStopRule, PaginationDiscovery, PaginationPlan};
pub use template::UrlTemplate;

use crate::error::{BronzeError, Result};
use crate::models::{ArchivedPayload, FetchTarget, ResourceFamily};
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct RangeDiscovery {
    family: ResourceFamily,
    template: UrlTemplate,
    start: i64,
    end: i64,
}

impl RangeDiscovery {
    pub fn new(family: ResourceFamily, template: UrlTemplate, start: i64, end: i64) -> Result<Self> {
        if start > end {
            return Err(BronzeError::Discovery(format!(
                "range start {} is after end {}",
                start, end
            )));
        }
        Ok(Self {
            family,
            template,
            start,
            end,
        })
    }

    pub fn len(&self) -> u64 {
        self.end.abs_diff(self.start).saturating_add(1)
    }

    /// Never empty: `new` rejects inverted bounds
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn targets(&self) -> impl Iterator<Item = FetchTarget> + Send + 'static {
        let family = self.family.clone();
        let template = self.template.clone();
        (self.start..=self.end).map(move |id| family.target(Some(id), template.render(id)))
    }
}

#[derive(Debug, Clone)]
pub struct ExplicitDiscovery {
    family: ResourceFamily,
    template: UrlTemplate,
    ids: Vec<i64>,
}

impl ExplicitDiscovery {
    pub fn new(family: ResourceFamily, template: UrlTemplate, ids: Vec<i64>) -> Self {
        Self {
            family,
            template,
            ids,
        }
    }

    /// Ids listed in previously archived listing payloads, sorted ascending
    pub fn from_listings(family: ResourceFamily, template: UrlTemplate, listings: &[ArchivedPayload]) -> Self {
        let ids = listing::extract_ids(listings.iter().map(|p| &p.payload), &listing::LISTING_ID_KEYS);
        Self::new(family, template, ids)
    }

    /// Drop ids already present, e.g. those archived by an earlier run
    pub fn without(mut self, skip: &BTreeSet<i64>) -> Self {
        self.ids.retain(|id| !skip.contains(id));
        self
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn targets(&self) -> impl Iterator<Item = FetchTarget> + Send + 'static {
        let family = self.family.clone();
        let template = self.template.clone();
        self.ids
            .clone()
            .into_iter()
            .map(move |id| family.target(Some(id), template.render(id)))
    }
}

impl From<RangeDiscovery> for ExplicitDiscovery {
    fn from(range: RangeDiscovery) -> Self {
        let ids = (range.start..=range.end).collect();
        Self::new(range.family, range.template, ids)
    }
}
