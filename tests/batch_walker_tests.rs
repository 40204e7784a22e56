use async_trait::async_trait;
use cadence_queue::{
    BatchItem, BatchRequest, BatchWalker, CadenceError, Page, PageSource, RetryingInvoker,
    retry::HttpStatusError,
    walker::{SlicePageSource, process_items},
};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};
use tokio::time::Instant;

fn all(_: &u32) -> bool {
    true
}

type AllFilter = fn(&u32) -> bool;

/// Page source that records each fetch and the fields it was asked for.
struct CountingSource {
    inner: SlicePageSource<u32>,
    fetches: AtomicU32,
    requested_fields: Mutex<Vec<Option<Vec<String>>>>,
}

impl CountingSource {
    fn new(count: u32) -> Self {
        Self {
            inner: SlicePageSource::new((1..=count).collect()),
            fetches: AtomicU32::new(0),
            requested_fields: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PageSource<u32, AllFilter> for CountingSource {
    async fn fetch_page(
        &self,
        request: &BatchRequest<AllFilter>,
        page: u32,
    ) -> cadence_queue::Result<Page<u32>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.requested_fields
            .lock()
            .unwrap()
            .push(request.fields.clone());
        self.inner.fetch_page(request, page).await
    }
}

#[tokio::test]
async fn test_every_page_fetch_carries_requested_fields() {
    let walker = BatchWalker::new(CountingSource::new(30));
    let request = BatchRequest::new(all as AllFilter, 10).with_fields(["email", "first_name"]);

    walker
        .walk(&request, |page| async move { Ok::<_, CadenceError>(page.items) })
        .await
        .unwrap();

    let seen = walker.source().requested_fields.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    for fields in seen {
        assert_eq!(
            fields,
            Some(vec!["email".to_string(), "first_name".to_string()])
        );
    }
}

#[tokio::test]
async fn test_walk_250_records_in_pages_of_100() {
    let walker = BatchWalker::new(CountingSource::new(250));
    let request = BatchRequest::new(all as AllFilter, 100);
    let page_sizes = Arc::new(Mutex::new(Vec::new()));

    let results = walker
        .walk(&request, |page| {
            let page_sizes = Arc::clone(&page_sizes);
            async move {
                page_sizes.lock().unwrap().push(page.items.len());
                Ok::<_, CadenceError>(
                    page.items
                        .into_iter()
                        .map(|n| BatchItem::<()>::new(n.to_string()))
                        .collect::<Vec<_>>(),
                )
            }
        })
        .await
        .unwrap();

    assert_eq!(*page_sizes.lock().unwrap(), vec![100, 100, 50]);
    assert_eq!(results.len(), 250);
    assert_eq!(results[0].entity_id, "1");
    assert_eq!(results[249].entity_id, "250");
    // The last page reports no successor, so no extra fetch happens
    assert_eq!(walker.source().fetches.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_per_item_failure_only_drops_that_item() {
    let walker = BatchWalker::new(SlicePageSource::new((1..=250u32).collect()));
    let request = BatchRequest::new(all as AllFilter, 100);
    let pages_seen = Arc::new(Mutex::new(Vec::new()));

    let results = walker
        .walk(&request, |page| {
            let pages_seen = Arc::clone(&pages_seen);
            async move {
                pages_seen.lock().unwrap().push(page.page);
                let items = process_items(page.items, |n| async move {
                    if n == 150 {
                        Err(HttpStatusError::new(500, "record 150 rejected"))
                    } else {
                        Ok(BatchItem::with_fields(n.to_string(), n * 2))
                    }
                })
                .await;
                Ok::<_, CadenceError>(items)
            }
        })
        .await
        .unwrap();

    assert_eq!(*pages_seen.lock().unwrap(), vec![1, 2, 3]);
    assert_eq!(results.len(), 249);
    assert!(results.iter().all(|item| item.entity_id != "150"));
    assert!(results.iter().any(|item| item.entity_id == "250"));
}

#[tokio::test]
async fn test_no_matching_records_never_calls_handler() {
    let walker = BatchWalker::new(SlicePageSource::new((1..=20u32).collect()));
    let request = BatchRequest::new(|n: &u32| *n > 1_000, 10);
    let calls = AtomicU32::new(0);

    let results: Vec<u32> = walker
        .walk(&request, |page| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, CadenceError>(page.items) }
        })
        .await
        .unwrap();

    assert!(results.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_handler_error_aborts_walk() {
    let walker = BatchWalker::new(SlicePageSource::new((1..=30u32).collect()));
    let request = BatchRequest::new(all as AllFilter, 10);
    let calls = AtomicU32::new(0);

    let result = walker
        .walk(&request, |page| {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call == 2 {
                    Err(CadenceError::Worker {
                        message: "downstream exploded".to_string(),
                    })
                } else {
                    Ok(page.items)
                }
            }
        })
        .await;

    assert!(matches!(result, Err(CadenceError::Worker { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_inter_batch_delay_is_awaited_between_pages() {
    let walker = BatchWalker::new(SlicePageSource::new((1..=25u32).collect()))
        .with_inter_batch_delay(Duration::from_millis(500));
    let request = BatchRequest::new(all as AllFilter, 10);

    let start = Instant::now();
    let results = walker
        .walk(&request, |page| async move { Ok::<_, CadenceError>(page.items) })
        .await
        .unwrap();

    assert_eq!(results.len(), 25);
    // Three pages, two gaps; nothing after the last page
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(1000));
    assert!(elapsed < Duration::from_millis(1500));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_items_are_retried_inside_a_batch() {
    let walker = BatchWalker::new(SlicePageSource::new((1..=5u32).collect()));
    let request = BatchRequest::new(all as AllFilter, 5);
    let invoker = RetryingInvoker::<HttpStatusError>::rate_limited().with_label("crm");
    let remote_calls = Arc::new(AtomicU32::new(0));

    let results = walker
        .walk(&request, |page| {
            let invoker = invoker.clone();
            let remote_calls = Arc::clone(&remote_calls);
            async move {
                let items = process_items(page.items, |n| {
                    let invoker = invoker.clone();
                    let remote_calls = Arc::clone(&remote_calls);
                    async move {
                        let attempts = Arc::new(AtomicU32::new(0));
                        invoker
                            .invoke(
                                || {
                                    remote_calls.fetch_add(1, Ordering::SeqCst);
                                    let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                                    async move {
                                        match (n, attempt) {
                                            // Item 2 is throttled once, then goes through
                                            (2, 0) => Err(HttpStatusError::new(429, "slow down")),
                                            // Item 4 is rejected outright
                                            (4, _) => Err(HttpStatusError::new(400, "bad record")),
                                            _ => Ok(BatchItem::<()>::new(n.to_string())),
                                        }
                                    }
                                },
                                3,
                            )
                            .await
                    }
                })
                .await;
                Ok::<_, CadenceError>(items)
            }
        })
        .await
        .unwrap();

    let ids: Vec<_> = results.iter().map(|item| item.entity_id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3", "5"]);
    // One extra call for the throttled item, none for the rejected one
    assert_eq!(remote_calls.load(Ordering::SeqCst), 6);
}
