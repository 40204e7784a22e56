//! Paginated, throttled iteration over large record sets.
//!
//! A [`BatchWalker`] pulls pages from a [`PageSource`] strictly in order,
//! hands each page to an async handler and concatenates what the handlers
//! return. Between pages it sleeps for the configured inter-batch delay so
//! downstream services see a bounded request rate.
//!
//! ```rust
//! use cadence_queue::walker::{BatchRequest, BatchWalker, SlicePageSource};
//! use std::time::Duration;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> cadence_queue::Result<()> {
//! let source = SlicePageSource::new((1..=250u32).collect());
//! let walker = BatchWalker::new(source).with_inter_batch_delay(Duration::from_millis(10));
//!
//! let request = BatchRequest::new(|n: &u32| n % 2 == 0, 50);
//! let doubled = walker
//!     .walk(&request, |page| async move {
//!         Ok::<_, cadence_queue::CadenceError>(page.items.iter().map(|n| n * 2).collect::<Vec<_>>())
//!     })
//!     .await?;
//! assert_eq!(doubled.len(), 125);
//! # Ok(())
//! # }
//! ```

use crate::{CadenceError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fmt::{self, Display},
    future::Future,
    marker::PhantomData,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, warn};

/// What to walk: a filter understood by the page source and a page size.
#[derive(Debug, Clone)]
pub struct BatchRequest<F> {
    pub filter: F,
    pub page_limit: u32,
    /// Fields to fetch. `None` fetches whole records.
    pub fields: Option<Vec<String>>,
}

impl<F> BatchRequest<F> {
    pub fn new(filter: F, page_limit: u32) -> Self {
        Self {
            filter,
            page_limit,
            fields: None,
        }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }
}

/// One page of matching records. Pages are numbered from 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<R> {
    pub items: Vec<R>,
    pub page: u32,
    pub total: u64,
    pub has_next_page: bool,
}

/// Per-record output of a batch handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItem<T> {
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<T>,
}

impl<T> BatchItem<T> {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            fields: None,
        }
    }

    pub fn with_fields(entity_id: impl Into<String>, fields: T) -> Self {
        Self {
            entity_id: entity_id.into(),
            fields: Some(fields),
        }
    }
}

/// A paginated collection, ordered by whatever default order the source has.
///
/// Sources receive the whole request so they can apply the filter, the page
/// limit and the field projection in one fetch.
#[async_trait]
pub trait PageSource<R, F>: Send + Sync
where
    F: Sync,
{
    async fn fetch_page(&self, request: &BatchRequest<F>, page: u32) -> Result<Page<R>>;
}

pub struct BatchWalker<S, R, F> {
    source: S,
    inter_batch_delay: Duration,
    _marker: PhantomData<fn(&F) -> R>,
}

impl<S, R, F> BatchWalker<S, R, F>
where
    S: PageSource<R, F>,
    F: Sync,
{
    pub fn new(source: S) -> Self {
        Self {
            source,
            inter_batch_delay: Duration::ZERO,
            _marker: PhantomData,
        }
    }

    /// Sleep between consecutive pages
    pub fn with_inter_batch_delay(mut self, delay: Duration) -> Self {
        self.inter_batch_delay = delay;
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Walk every matching page in order and concatenate the handler results.
    ///
    /// Stops at the first empty page or the first page without a successor.
    /// A handler error aborts the walk and is returned as is; handlers that
    /// want per-item isolation should go through [`process_items`].
    pub async fn walk<T, E, H, Fut>(
        &self,
        request: &BatchRequest<F>,
        mut handler: H,
    ) -> std::result::Result<Vec<T>, E>
    where
        E: From<CadenceError>,
        H: FnMut(Page<R>) -> Fut,
        Fut: Future<Output = std::result::Result<Vec<T>, E>>,
    {
        if request.page_limit == 0 {
            return Err(
                CadenceError::Config("Batch page_limit must be at least 1".to_string()).into(),
            );
        }

        let mut results = Vec::new();
        let mut page_number = 1u32;

        loop {
            let page = self.source.fetch_page(request, page_number).await?;

            if page.items.is_empty() {
                debug!(page = page_number, "Empty page, batch walk finished");
                break;
            }

            let has_next_page = page.has_next_page;
            let item_count = page.items.len();
            debug!(page = page_number, items = item_count, total = page.total, "Processing batch");

            let mut batch = handler(page).await?;
            debug!(
                page = page_number,
                produced = batch.len(),
                omitted = item_count.saturating_sub(batch.len()),
                "Batch processed"
            );
            results.append(&mut batch);

            if !has_next_page {
                break;
            }

            if !self.inter_batch_delay.is_zero() {
                tokio::time::sleep(self.inter_batch_delay).await;
            }
            page_number += 1;
        }

        info!(pages = page_number, results = results.len(), "Batch walk complete");
        Ok(results)
    }
}

/// Run `work` for each item in sequence, logging and dropping the failures.
pub async fn process_items<I, T, E, W, Fut>(items: I, mut work: W) -> Vec<T>
where
    I: IntoIterator,
    W: FnMut(I::Item) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Display,
{
    let mut produced = Vec::new();
    for (index, item) in items.into_iter().enumerate() {
        match work(item).await {
            Ok(value) => produced.push(value),
            Err(e) => warn!(index, error = %e, "Item failed, excluding it from the batch"),
        }
    }
    produced
}

type Projection<R> = Arc<dyn Fn(&R, &[String]) -> R + Send + Sync>;

/// In-memory [`PageSource`] over a vector; the filter is a predicate.
///
/// Requested fields are applied through the projection set with
/// [`with_projection`](Self::with_projection). Without one, records are
/// returned whole.
#[derive(Clone)]
pub struct SlicePageSource<R> {
    records: Vec<R>,
    projection: Option<Projection<R>>,
}

impl<R: fmt::Debug> fmt::Debug for SlicePageSource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlicePageSource")
            .field("records", &self.records)
            .field("projection", &self.projection.is_some())
            .finish()
    }
}

impl<R> SlicePageSource<R> {
    pub fn new(records: Vec<R>) -> Self {
        Self {
            records,
            projection: None,
        }
    }

    pub fn with_projection<P>(mut self, projection: P) -> Self
    where
        P: Fn(&R, &[String]) -> R + Send + Sync + 'static,
    {
        self.projection = Some(Arc::new(projection));
        self
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl<R, F> PageSource<R, F> for SlicePageSource<R>
where
    R: Clone + Send + Sync,
    F: Fn(&R) -> bool + Send + Sync,
{
    async fn fetch_page(&self, request: &BatchRequest<F>, page: u32) -> Result<Page<R>> {
        let page = page.max(1);
        let limit = request.page_limit.max(1) as usize;
        let offset = (page as usize - 1).saturating_mul(limit);

        let matching: Vec<&R> = self
            .records
            .iter()
            .filter(|r| (request.filter)(*r))
            .collect();
        let total = matching.len();
        let window = matching.into_iter().skip(offset).take(limit);
        let items: Vec<R> = match (&request.fields, &self.projection) {
            (Some(fields), Some(project)) => window.map(|r| project(r, fields)).collect(),
            _ => window.cloned().collect(),
        };

        Ok(Page {
            has_next_page: offset.saturating_add(limit) < total,
            items,
            page,
            total: total as u64,
        })
    }
}

impl SlicePageSource<Value> {
    /// A source over JSON records that honours requested fields.
    pub fn json(records: Vec<Value>) -> Self {
        Self::new(records).with_projection(project_json)
    }
}

/// Keep only `fields` of a JSON object. Non-objects are returned unchanged.
pub fn project_json(record: &Value, fields: &[String]) -> Value {
    match record {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| fields.iter().any(|f| f == *key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}
