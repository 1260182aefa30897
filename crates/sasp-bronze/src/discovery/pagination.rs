//! Paginated listing discovery

use super::listing::PageMeta;
use super::template::with_page;
use crate::error::{BronzeError, Result};
use crate::fetcher::{AttemptClass, FetchError, FetchResponse, RateLimitedFetcher};
use crate::models::{FetchTarget, ResourceFamily};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_MAX_PAGES: u32 = 50;

/// Consecutive empty or failed pages that end a scan early
pub const EMPTY_PAGE_LIMIT: usize = 3;

/// How the last page number was decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastPageSource {
    /// The listing reported its page count (capped at the page ceiling)
    Metadata,
    /// Page 1 had `links.next == null`
    NextLinkNull,
    /// No usable metadata; scanning up to the page ceiling
    Fallback,
    /// The caller asked for every page up to the ceiling
    Forced,
}

#[derive(Debug, Clone)]
pub struct PaginationDiscovery {
    family: ResourceFamily,
    base_url: Url,
    max_pages: u32,
    force_full_pages: bool,
}

impl PaginationDiscovery {
    /// `base_url` is any page of the listing; its `page` parameter is replaced
    pub fn new(family: ResourceFamily, base_url: impl AsRef<str>) -> Result<Self> {
        let base_url = base_url.as_ref();
        let base_url = Url::parse(base_url).map_err(|e| BronzeError::Template {
            template: base_url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            family,
            base_url,
            max_pages: DEFAULT_MAX_PAGES,
            force_full_pages: false,
        })
    }

    /// Hard ceiling on the page number, whatever the listing reports
    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn with_force_full_pages(mut self, force: bool) -> Self {
        self.force_full_pages = force;
        self
    }

    pub fn family(&self) -> &ResourceFamily {
        &self.family
    }

    pub fn page_target(&self, page: u32) -> FetchTarget {
        self.family
            .target(Some(i64::from(page)), with_page(self.base_url.clone(), page))
    }

    /// Fetch page 1 and plan the rest of the scan
    ///
    /// A failed probe is not an error: the plan falls back to the page ceiling.
    pub async fn probe(&self, fetcher: &RateLimitedFetcher) -> PaginationPlan {
        let first_page = self.page_target(1);
        let result = fetcher.fetch(&first_page.url).await;
        self.plan(first_page, Some(result))
    }

    /// Plan without probing, e.g. when page 1 is known to be unavailable
    pub fn unprobed_plan(&self) -> PaginationPlan {
        self.plan(self.page_target(1), None)
    }

    fn plan(
        &self,
        first_page: FetchTarget,
        first_result: Option<std::result::Result<FetchResponse, FetchError>>,
    ) -> PaginationPlan {
        let meta = match &first_result {
            Some(Ok(response)) if response.class() == AttemptClass::Success => {
                response.json().ok().map(|payload| PageMeta::read(&payload))
            },
            Some(Ok(response)) => {
                warn!(url = %first_page.url, status = response.status, "Pagination probe failed");
                None
            },
            Some(Err(e)) => {
                warn!(url = %first_page.url, error = %e, "Pagination probe failed");
                None
            },
            None => None,
        };

        let (last_page, source) = match meta {
            _ if self.force_full_pages => (self.max_pages, LastPageSource::Forced),
            Some(meta) if meta.is_known() => match meta.last_page {
                Some(n) => (n.clamp(1, self.max_pages), LastPageSource::Metadata),
                None => (1, LastPageSource::NextLinkNull),
            },
            Some(_) => {
                debug!(url = %first_page.url, "No pagination metadata on page 1");
                (self.max_pages, LastPageSource::Fallback)
            },
            None => (self.max_pages, LastPageSource::Fallback),
        };

        info!(
            family = %self.family,
            last_page,
            max_pages = self.max_pages,
            source = ?source,
            "Planned paginated scan"
        );

        PaginationPlan {
            first_page,
            first_result,
            last_page,
            source,
            family: self.family.clone(),
            base_url: self.base_url.clone(),
            force_full_pages: self.force_full_pages,
        }
    }
}

#[derive(Debug)]
pub struct PaginationPlan {
    pub first_page: FetchTarget,
    /// Outcome of the probe, `None` when page 1 was not requested
    pub first_result: Option<std::result::Result<FetchResponse, FetchError>>,
    pub last_page: u32,
    pub source: LastPageSource,
    family: ResourceFamily,
    base_url: Url,
    force_full_pages: bool,
}

impl PaginationPlan {
    /// Targets for pages `2..=last_page`, built as they are pulled
    pub fn remaining_targets(&self) -> impl Iterator<Item = FetchTarget> + Send + 'static {
        let family = self.family.clone();
        let base_url = self.base_url.clone();
        (2..=self.last_page).map(move |page| {
            family.target(Some(i64::from(page)), with_page(base_url.clone(), page))
        })
    }

    pub fn stop_rule(&self) -> PageStopRule {
        PageStopRule::new(self.force_full_pages)
    }
}

/// What a completed page looked like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageObservation {
    Listing(PageMeta),
    Failed,
}

/// Decides when to stop requesting further pages
///
/// Pages complete out of order, so empty pages are tracked by page number and
/// a run only counts when the page numbers are adjacent.
#[derive(Debug, Clone)]
pub struct PageStopRule {
    force_full_pages: bool,
    empty_pages: BTreeSet<i64>,
}

impl PageStopRule {
    pub fn new(force_full_pages: bool) -> Self {
        Self {
            force_full_pages,
            empty_pages: BTreeSet::new(),
        }
    }

    /// Record what `page` returned; true once no further pages should be dequeued
    pub fn observe(&mut self, page: i64, observation: PageObservation) -> bool {
        if self.force_full_pages {
            return false;
        }

        match observation {
            PageObservation::Listing(meta) if meta.next_is_null => return true,
            PageObservation::Listing(meta) if !meta.empty => return false,
            _ => {},
        }

        self.empty_pages.insert(page);
        let adjacent = |step: i64| {
            (1..)
                .map_while(|d: i64| page.checked_add(step * d))
                .take_while(|p| self.empty_pages.contains(p))
                .count()
        };
        adjacent(-1) + 1 + adjacent(1) >= EMPTY_PAGE_LIMIT
    }
}
