//! Page-by-page fetching with a guard against sources that keep repeating ids.

use std::collections::HashSet;

use catmirror_core::{pipeline_id_for_host, ConfigError, PageCursor, RawRecord};
use catmirror_storage::{RegionalClient, RequestError, ShutdownSignal};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{CatalogSource, PageDecodeError, PaginationStyle};

pub const DEFAULT_PAGE_SIZE: usize = 1000;
pub const DEFAULT_MAX_OFFSET: u64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
    pub page_size: usize,
    /// Offset pagination stops once the next offset passes this ceiling.
    pub max_offset: u64,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            max_offset: DEFAULT_MAX_OFFSET,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("decoding page from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: PageDecodeError,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Continuation source returned no next token.
    Exhausted,
    EmptyPage,
    ShortPage,
    OffsetCeiling,
    DuplicateStreak,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::EmptyPage => "empty_page",
            Self::ShortPage => "short_page",
            Self::OffsetCeiling => "offset_ceiling",
            Self::DuplicateStreak => "duplicate_streak",
        }
    }

    /// Whether pagination reached the real end of the catalog rather than a
    /// safety limit. Only then is it safe to retire rows the sweep never saw.
    pub fn covers_catalog(self) -> bool {
        matches!(self, Self::Exhausted | Self::EmptyPage | Self::ShortPage)
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub records: Vec<RawRecord>,
    /// Cursor this page was requested with.
    pub cursor: PageCursor,
    /// Where the following page starts; committing it marks this page as done.
    pub next_cursor: PageCursor,
    pub returned: usize,
    /// Records whose id already appeared on an earlier page. They are still
    /// returned; freshness decides which copy is kept downstream.
    pub repeated: usize,
    pub malformed: usize,
    pub region: String,
    pub failed_over: bool,
}

pub struct PaginatedFetcher<'a> {
    client: &'a RegionalClient,
    source: &'a dyn CatalogSource,
    options: FetchOptions,
    cursor: PageCursor,
    seen: HashSet<String>,
    duplicate_streak: usize,
    expected_total: Option<u64>,
    pages: usize,
    stopped: Option<StopReason>,
}

impl<'a> PaginatedFetcher<'a> {
    /// Starts at `resume`, or at the source's first page. A cursor of the wrong
    /// pagination kind is rejected instead of silently restarting.
    pub fn new(
        client: &'a RegionalClient,
        source: &'a dyn CatalogSource,
        options: FetchOptions,
        resume: Option<PageCursor>,
    ) -> Result<Self, FetchError> {
        let cursor = match resume {
            Some(cursor) if source.accepts_cursor(&cursor) => cursor,
            Some(cursor) => {
                return Err(ConfigError::MalformedResumeToken {
                    pipeline_id: pipeline_id_for_host(source.host()),
                    reason: format!(
                        "cursor {} does not fit {:?} pagination",
                        cursor.describe(),
                        source.pagination()
                    ),
                }
                .into())
            }
            None => source.initial_cursor(),
        };
        Ok(Self {
            client,
            source,
            options: FetchOptions {
                page_size: options.page_size.max(1),
                ..options
            },
            cursor,
            seen: HashSet::new(),
            duplicate_streak: 0,
            expected_total: None,
            pages: 0,
            stopped: None,
        })
    }

    pub fn cursor(&self) -> &PageCursor {
        &self.cursor
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Catalog size as last reported by the source, when it reports one.
    pub fn expected_total(&self) -> Option<u64> {
        self.expected_total
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stopped
    }

    pub fn is_done(&self) -> bool {
        self.stopped.is_some()
    }

    fn stop(&mut self, reason: StopReason) {
        debug!(
            host = self.source.host(),
            reason = reason.as_str(),
            pages = self.pages,
            cursor = %self.cursor.describe(),
            "pagination finished"
        );
        self.stopped = Some(reason);
    }

    /// Fetches the page at the current cursor. `None` once the source is exhausted.
    pub async fn next_page(
        &mut self,
        shutdown: &ShutdownSignal,
    ) -> Result<Option<FetchedPage>, FetchError> {
        if self.stopped.is_some() {
            return Ok(None);
        }
        if let PageCursor::Offset { offset } = self.cursor {
            if offset > self.options.max_offset {
                warn!(
                    host = self.source.host(),
                    offset,
                    max_offset = self.options.max_offset,
                    expected_total = ?self.expected_total,
                    "offset ceiling reached"
                );
                self.stop(StopReason::OffsetCeiling);
                return Ok(None);
            }
        }

        let requested = self.cursor.clone();
        let page_size = self.options.page_size;
        let source = self.source;
        let regional = self
            .client
            .execute(source.host(), shutdown, |endpoint| {
                source.build_request(endpoint, &requested, page_size)
            })
            .await?;
        let decoded = source
            .decode_page(&regional.response.body, page_size)
            .map_err(|source| FetchError::Decode {
                url: regional.response.final_url.clone(),
                source,
            })?;
        self.pages += 1;

        let returned = decoded.records.len() + decoded.malformed;
        let next_cursor = match &requested {
            PageCursor::Offset { offset } => PageCursor::Offset {
                offset: offset + page_size as u64,
            },
            PageCursor::Continuation { .. } => PageCursor::Continuation {
                token: decoded.next_token.clone(),
            },
        };

        let records = decoded.records;
        let mut repeated = 0;
        let mut identified = 0;
        for record in &records {
            if let Some(id) = record.identifier() {
                identified += 1;
                if self.seen.contains(id) {
                    repeated += 1;
                }
            }
        }
        // Ids repeated within this page count as new; the normalizer collapses them.
        for record in &records {
            if let Some(id) = record.identifier() {
                self.seen.insert(id.to_string());
            }
        }
        if repeated > 0 {
            debug!(
                host = source.host(),
                repeated,
                cursor = %requested.describe(),
                "page repeats ids from earlier pages"
            );
        }
        if let Some(expected) = decoded.result_set_size {
            self.expected_total = Some(expected);
        }

        if identified > 0 && repeated == identified {
            self.duplicate_streak += repeated;
        } else {
            self.duplicate_streak = 0;
        }

        self.cursor = next_cursor.clone();
        match source.pagination() {
            PaginationStyle::Offset if returned == 0 => self.stop(StopReason::EmptyPage),
            PaginationStyle::Offset if returned < page_size => self.stop(StopReason::ShortPage),
            PaginationStyle::Continuation if decoded.next_token.is_none() => {
                self.stop(StopReason::Exhausted)
            }
            _ if self.duplicate_streak > page_size => {
                warn!(
                    host = source.host(),
                    streak = self.duplicate_streak,
                    "source keeps repeating ids, stopping pagination"
                );
                self.stop(StopReason::DuplicateStreak)
            }
            _ => {}
        }

        Ok(Some(FetchedPage {
            records,
            cursor: requested,
            next_cursor,
            returned,
            repeated,
            malformed: decoded.malformed,
            region: regional.endpoint.region,
            failed_over: regional.failed_over,
        }))
    }

    /// Drains every remaining page. Returns the records and the final cursor.
    pub async fn fetch_all(
        mut self,
        shutdown: &ShutdownSignal,
    ) -> Result<(Vec<RawRecord>, PageCursor), FetchError> {
        let mut records = Vec::new();
        while let Some(page) = self.next_page(shutdown).await? {
            records.extend(page.records);
        }
        Ok((records, self.cursor))
    }
}
