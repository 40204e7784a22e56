use cadence_queue::{
    Admin, Cadence, CadenceConfig, ChildJob, EventFilter, EventManager, HandlerRegistry, JobFailure,
    JobKind, JobLifecycleEventType, JobOptions, JobOutcome, JobQueue, JobStatus, JobStore,
    MemoryStore, MockClock, NextJob, ProcessRole, QueueRuntime, RecurringJobRegistrar,
    RecurringJobSpec, RepeatOptions, Scheduler, TickReport, UpsertOutcome, Worker,
    registry::handler_fn,
};
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    CachedDataCleanup,
    MonthlyImpactReport,
    SendEmail,
}

impl JobKind for Kind {
    const ALL: &'static [Self] = &[Kind::CachedDataCleanup, Kind::MonthlyImpactReport, Kind::SendEmail];

    fn as_str(&self) -> &'static str {
        match self {
            Kind::CachedDataCleanup => "cached-data-cleanup",
            Kind::MonthlyImpactReport => "user-monthly-impact-report",
            Kind::SendEmail => "send-email",
        }
    }
}

fn registry(cleanups: Arc<AtomicU32>) -> HandlerRegistry<Kind> {
    HandlerRegistry::new()
        .with(
            Kind::CachedDataCleanup,
            handler_fn(move |_job| {
                let cleanups = Arc::clone(&cleanups);
                async move {
                    cleanups.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, JobFailure>(JobOutcome::with_result(json!({"removed": 12})))
                }
            }),
        )
        .with(
            Kind::MonthlyImpactReport,
            handler_fn(|job| async move {
                let user = job.payload["user"].as_str().unwrap_or_default().to_string();
                Ok::<_, JobFailure>(
                    JobOutcome::empty().then(NextJob::new("send-email", json!({"to": user}))),
                )
            }),
        )
        .with(
            Kind::SendEmail,
            handler_fn(|job| async move {
                match job.payload["to"].as_str() {
                    Some(to) if !to.is_empty() => Ok(JobOutcome::with_result(json!({"sent_to": to}))),
                    _ => Err(JobFailure::fatal("missing recipient")),
                }
            }),
        )
}

fn table() -> RecurringJobRegistrar {
    RecurringJobRegistrar::new(vec![
        RecurringJobSpec::new("cached-data-cleanup", Cadence::bihourly()),
        RecurringJobSpec::new("user-monthly-impact-report", Cadence::monthly())
            .with_payload(json!({"user": "someone@example.com"})),
    ])
}

fn clocked_store() -> (MockClock, MemoryStore) {
    let clock = MockClock::at(Utc.with_ymd_and_hms(2024, 5, 31, 23, 30, 0).unwrap());
    let store = MemoryStore::with_clock(clock.clone());
    (clock, store)
}

#[tokio::test]
async fn test_redeclaring_recurring_job_keeps_one_registration() {
    let store = MemoryStore::new();
    let queue = JobQueue::new("main", Arc::new(store.clone()));

    for round in 0..10 {
        let accepted = queue
            .create_job(
                "cached-data-cleanup",
                json!({}),
                JobOptions::new()
                    .job_key("cached-data-cleanup-bihourly")
                    .repeat(RepeatOptions::cron("0 */2 * * *")),
            )
            .await
            .unwrap();

        let expected = if round == 0 {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Unchanged
        };
        assert_eq!(
            accepted,
            cadence_queue::JobAccepted::Recurring {
                key: "cached-data-cleanup-bihourly".to_string(),
                outcome: expected,
            }
        );
    }

    assert_eq!(store.list_recurring("main").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_only_the_lease_holder_fires_cron_jobs() {
    let (clock, store) = clocked_store();
    let shared: Arc<dyn JobStore> = Arc::new(store.clone());
    let queue = JobQueue::new("main", Arc::clone(&shared));
    table().register_all(&queue).await.unwrap();

    let schedulers: Vec<Scheduler> = (0..3)
        .map(|i| Scheduler::new("main", Arc::clone(&shared)).with_holder_id(format!("instance-{i}")))
        .collect();

    // Midnight on June 1st: only the bihourly job is due, the monthly one runs at 03:00
    clock.advance(chrono::Duration::minutes(30));

    let mut leaders = 0;
    for scheduler in &schedulers {
        match scheduler.tick().await.unwrap() {
            TickReport::Standby => {}
            TickReport::Leader { fired, .. } => {
                leaders += 1;
                assert_eq!(fired, 1);
            }
        }
    }
    assert_eq!(leaders, 1);

    let names: Vec<String> = store.all_jobs("main").await.into_iter().map(|j| j.name).collect();
    assert_eq!(names.len(), 1);
    assert_eq!(names[0], "cached-data-cleanup");
}

#[tokio::test]
async fn test_cron_fire_flows_through_worker_and_follow_up_jobs() {
    let (clock, store) = clocked_store();
    let cleanups = Arc::new(AtomicU32::new(0));
    let events = EventManager::new(64);
    let queue = JobQueue::new("main", Arc::new(store.clone())).with_events(events.clone());
    let scheduler = Scheduler::new("main", Arc::clone(queue.store())).with_events(events.clone());
    let worker = Worker::new(queue.clone(), Arc::new(registry(Arc::clone(&cleanups))), events.clone());
    let mut completions = events.subscribe_filtered(
        EventFilter::new().with_event_types(vec![JobLifecycleEventType::Completed]),
    );

    table().register_all(&queue).await.unwrap();

    // Nothing is due yet
    assert!(!worker.process_next().await.unwrap());

    // 03:00 on June 1st: the bihourly cleanup (missed fires collapsed) and the monthly report
    clock.set_time(Utc.with_ymd_and_hms(2024, 6, 1, 3, 0, 0).unwrap());
    assert_eq!(
        scheduler.tick().await.unwrap(),
        TickReport::Leader { promoted: 0, recovered: 0, fired: 2, skipped: 0 }
    );

    while worker.process_next().await.unwrap() {}

    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    let jobs = store.all_jobs("main").await;
    assert_eq!(jobs.len(), 3);
    assert!(jobs.iter().all(|job| job.status == JobStatus::Completed));

    let email = jobs.iter().find(|job| job.name == "send-email").unwrap();
    assert_eq!(email.result, Some(json!({"sent_to": "someone@example.com"})));
    for _ in 0..3 {
        let event = completions.recv().await.unwrap();
        assert!(jobs.iter().any(|job| job.id == event.job_id));
    }

    // A second tick in the same window fires nothing new
    assert_eq!(
        scheduler.tick().await.unwrap(),
        TickReport::Leader { promoted: 0, recovered: 0, fired: 0, skipped: 0 }
    );
}

#[tokio::test]
async fn test_flow_parent_runs_after_its_children() {
    let (_clock, store) = clocked_store();
    let cleanups = Arc::new(AtomicU32::new(0));
    let events = EventManager::new(64);
    let queue = JobQueue::new("main", Arc::new(store.clone())).with_events(events.clone());
    let worker = Worker::new(queue.clone(), Arc::new(registry(Arc::clone(&cleanups))), events);

    let parent_id = queue
        .create_flow(
            "cached-data-cleanup",
            json!({}),
            vec![
                ChildJob::new("send-email", json!({"to": "a@example.com"})),
                ChildJob::new("send-email", json!({"to": "b@example.com"})),
            ],
            JobOptions::new(),
        )
        .await
        .unwrap()
        .job_id()
        .unwrap();
    assert_eq!(queue.job_status(parent_id).await.unwrap(), Some(JobStatus::WaitingChildren));

    assert!(worker.process_next().await.unwrap());
    assert_eq!(cleanups.load(Ordering::SeqCst), 0);
    assert_eq!(queue.job_status(parent_id).await.unwrap(), Some(JobStatus::WaitingChildren));

    assert!(worker.process_next().await.unwrap());
    assert_eq!(queue.job_status(parent_id).await.unwrap(), Some(JobStatus::Ready));

    assert!(worker.process_next().await.unwrap());
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    assert_eq!(queue.job_status(parent_id).await.unwrap(), Some(JobStatus::Completed));
    assert!(!worker.process_next().await.unwrap());
}

#[tokio::test]
async fn test_failed_child_fails_its_flow_parent() {
    let (_clock, store) = clocked_store();
    let cleanups = Arc::new(AtomicU32::new(0));
    let events = EventManager::new(64);
    let queue = JobQueue::new("main", Arc::new(store.clone())).with_events(events.clone());
    let worker = Worker::new(queue.clone(), Arc::new(registry(Arc::clone(&cleanups))), events);

    let parent_id = queue
        .create_flow(
            "cached-data-cleanup",
            json!({}),
            vec![ChildJob::new("send-email", json!({"to": ""}))],
            JobOptions::new(),
        )
        .await
        .unwrap()
        .job_id()
        .unwrap();

    assert!(worker.process_next().await.unwrap());
    assert!(!worker.process_next().await.unwrap());

    let parent = queue.get_job(parent_id).await.unwrap().unwrap();
    assert_eq!(parent.status, JobStatus::Failed);
    assert!(parent.error_message.unwrap().ends_with("failed: missing recipient"));
    assert_eq!(cleanups.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_scheduler_retries_job_abandoned_by_crashed_worker() {
    let (clock, store) = clocked_store();
    let cleanups = Arc::new(AtomicU32::new(0));
    let events = EventManager::new(64);
    let queue = JobQueue::new("main", Arc::new(store.clone())).with_events(events.clone());
    let scheduler = Scheduler::new("main", Arc::clone(queue.store()));
    let worker = Worker::new(queue.clone(), Arc::new(registry(Arc::clone(&cleanups))), events);

    let id = queue
        .create_job("cached-data-cleanup", json!({}), JobOptions::new().attempts(2))
        .await
        .unwrap()
        .job_id()
        .unwrap();

    // A worker claims the job and dies without settling it
    store.dequeue("main", Duration::from_secs(30)).await.unwrap().unwrap();
    assert_eq!(
        scheduler.tick().await.unwrap(),
        TickReport::Leader { promoted: 0, recovered: 0, fired: 0, skipped: 0 }
    );

    clock.advance(chrono::Duration::seconds(31));
    assert_eq!(
        scheduler.tick().await.unwrap(),
        TickReport::Leader { promoted: 0, recovered: 1, fired: 0, skipped: 0 }
    );

    assert!(worker.process_next().await.unwrap());
    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts, 2);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fatal_failure_is_terminal_and_observable() {
    let (_clock, store) = clocked_store();
    let events = EventManager::new(64);
    let queue = JobQueue::new("main", Arc::new(store.clone())).with_events(events.clone());
    let worker = Worker::new(queue.clone(), Arc::new(registry(Arc::default())), events.clone());
    let mut failures = events.subscribe_filtered(
        EventFilter::new().with_event_types(vec![JobLifecycleEventType::Failed]),
    );

    let id = queue
        .create_job("send-email", json!({"to": ""}), JobOptions::new().attempts(5))
        .await
        .unwrap()
        .job_id()
        .unwrap();

    assert!(worker.process_next().await.unwrap());

    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.error_message.as_deref(), Some("missing recipient"));

    let event = failures.recv().await.unwrap();
    assert_eq!(event.job_id, id);
    assert_eq!(event.error.map(|e| e.retryable), Some(false));
}

#[tokio::test]
async fn test_purge_leaves_running_jobs_alone() {
    let (_clock, store) = clocked_store();
    let queue = JobQueue::new("main", Arc::new(store.clone()));
    let admin = Admin::new(Arc::clone(queue.store()));

    table().register_all(&queue).await.unwrap();
    for n in 0..3 {
        queue
            .create_job("send-email", json!({"to": format!("user{n}@example.com")}), JobOptions::new())
            .await
            .unwrap();
    }
    queue
        .create_job(
            "send-email",
            json!({"to": "later@example.com"}),
            JobOptions::new().delay(Duration::from_secs(600)),
        )
        .await
        .unwrap();

    let running = store.dequeue("main", Duration::from_secs(30)).await.unwrap().unwrap();

    assert_eq!(admin.list_ready_and_delayed("main").await.unwrap().len(), 3);
    assert_eq!(admin.purge_queue("main").await.unwrap(), 5);

    assert!(admin.list_ready_and_delayed("main").await.unwrap().is_empty());
    assert!(admin.list_recurring("main").await.unwrap().is_empty());
    assert_eq!(
        queue.job_status(running.id).await.unwrap(),
        Some(JobStatus::Active)
    );
}

#[tokio::test]
async fn test_primary_runtime_processes_jobs_and_producer_does_not() {
    let store = MemoryStore::new();
    let cleanups = Arc::new(AtomicU32::new(0));

    let mut config = CadenceConfig::new().with_role(ProcessRole::Producer);
    config.worker.poll_interval = Duration::from_millis(10);
    config.scheduler.tick_interval = Duration::from_millis(20);

    let mut producer = QueueRuntime::init(
        &config,
        JobQueue::new("main", Arc::new(store.clone())),
        registry(Arc::clone(&cleanups)),
        table(),
    )
    .await
    .unwrap();

    let id = producer
        .queue()
        .create_job("send-email", json!({"to": "someone@example.com"}), JobOptions::new())
        .await
        .unwrap()
        .job_id()
        .unwrap();
    assert_eq!(producer.queue().job_status(id).await.unwrap(), Some(JobStatus::Ready));

    let config = config.with_role(ProcessRole::Primary);
    let mut primary = QueueRuntime::init(
        &config,
        JobQueue::new("main", Arc::new(store.clone())),
        registry(Arc::clone(&cleanups)),
        table(),
    )
    .await
    .unwrap();
    assert_eq!(primary.registration().map(|r| r.created), Some(2));

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if producer.queue().job_status(id).await.unwrap() == Some(JobStatus::Completed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(
        producer.queue().job_result(id).await.unwrap(),
        Some(json!({"sent_to": "someone@example.com"}))
    );

    primary.shutdown().await.unwrap();
    producer.shutdown().await.unwrap();
    assert!(store.lease_holder("main").await.is_none());
}
