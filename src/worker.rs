use crate::{
    CadenceError, Result,
    config::WorkerConfig,
    events::{EventManager, JobLifecycleEvent, JobLifecycleEventType},
    job::{Job, JobFailure, JobOutcome},
    queue::JobQueue,
    rate_limit::RateLimiter,
    registry::{HandlerRegistry, JobHandler, JobKind},
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::{self, error::TryRecvError},
    task::JoinHandle,
    time::{Instant, sleep},
};
use tracing::{debug, error, info, warn};

/// One consumer pulling jobs from a queue, one at a time.
pub struct Worker<K: JobKind> {
    id: usize,
    queue: JobQueue,
    registry: Arc<HandlerRegistry<K>>,
    events: EventManager,
    poll_interval: Duration,
    lock_duration: Duration,
    limiter: Option<RateLimiter>,
}

impl<K: JobKind> Worker<K> {
    pub fn new(queue: JobQueue, registry: Arc<HandlerRegistry<K>>, events: EventManager) -> Self {
        Self {
            id: 0,
            queue,
            registry,
            events,
            poll_interval: Duration::from_millis(500),
            lock_duration: WorkerConfig::default().lock_duration,
            limiter: None,
        }
    }

    pub fn with_id(mut self, id: usize) -> Self {
        self.id = id;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// How long a claimed job stays locked without a renewal. The lock is
    /// renewed every half period while the handler runs.
    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }

    /// Share a limiter with the other workers of the pool
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Pull jobs until a shutdown signal arrives. A job that has started
    /// always runs to settlement before the signal is honored.
    pub async fn run(&self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
        info!(queue = %self.queue.name(), worker = self.id, "Worker started");

        loop {
            match shutdown_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            let idle = match self.process_next().await {
                Ok(processed) => !processed,
                Err(e) => {
                    error!(queue = %self.queue.name(), worker = self.id, error = %e, "Error dequeuing job");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = sleep(self.poll_interval) => {}
                }
            }
        }

        info!(queue = %self.queue.name(), worker = self.id, "Worker shutting down");
        Ok(())
    }

    /// Claim and settle one Ready job. Returns false when the queue had none.
    ///
    /// With a rate limiter the permit is taken before the claim, so a job
    /// never sits locked while its worker waits for a token.
    pub async fn process_next(&self) -> Result<bool> {
        if let Some(limiter) = &self.limiter {
            if let Err(e) = limiter.acquire().await {
                warn!(worker = self.id, error = %e, "Rate limiter unavailable, claiming anyway");
            }
        }

        match self
            .queue
            .store()
            .dequeue(self.queue.name(), self.lock_duration)
            .await?
        {
            Some(job) => {
                debug!(job_id = %job.id, job_name = %job.name, worker = self.id, "Processing job");
                self.process_job(job).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn process_job(&self, job: Job) {
        let handler = match self.registry.resolve(&job.name) {
            Ok(handler) => handler,
            Err(e) => {
                warn!(job_id = %job.id, job_name = %job.name, error = %e, "Unrecognized job, failing it");
                self.settle_failure(&job, None, JobFailure::fatal(e.to_string()))
                    .await;
                return;
            }
        };

        self.events
            .publish(JobLifecycleEvent::for_job(&job, JobLifecycleEventType::Started));
        let started = Instant::now();

        // Run on its own task so a panicking handler only fails its job
        let task_handler = Arc::clone(&handler);
        let task_job = job.clone();
        let mut task = tokio::spawn(async move { task_handler.process(&task_job).await });
        let renew_every = (self.lock_duration / 2).max(Duration::from_millis(1));

        let result = loop {
            tokio::select! {
                joined = &mut task => break match joined {
                    Ok(result) => result,
                    Err(join_error) => Err(JobFailure::retryable(format!(
                        "Handler panicked: {}",
                        join_error
                    ))),
                },
                _ = sleep(renew_every) => self.renew_lock(&job).await,
            }
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(outcome) => self.settle_success(&job, handler.as_ref(), outcome, elapsed_ms).await,
            Err(failure) => self.settle_failure(&job, Some(handler.as_ref()), failure).await,
        }
    }

    async fn renew_lock(&self, job: &Job) {
        let store = self.queue.store();
        let Some(until) = chrono::Duration::from_std(self.lock_duration)
            .ok()
            .and_then(|lock| store.now().checked_add_signed(lock))
        else {
            return;
        };

        match store.extend_lock(job.id, until).await {
            Ok(true) => debug!(job_id = %job.id, %until, "Renewed job lock"),
            Ok(false) => warn!(job_id = %job.id, "Job lock lost; it may run again elsewhere"),
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to renew job lock"),
        }
    }

    async fn settle_success(
        &self,
        job: &Job,
        handler: &dyn JobHandler,
        outcome: JobOutcome,
        elapsed_ms: u64,
    ) {
        if let Err(e) = self
            .queue
            .store()
            .complete_job(job.id, outcome.result.clone())
            .await
        {
            error!(job_id = %job.id, error = %e, "Failed to record job completion");
        }

        handler.on_complete(job, &outcome).await;
        self.events.publish(
            JobLifecycleEvent::for_job(job, JobLifecycleEventType::Completed)
                .with_processing_time(elapsed_ms)
                .with_result(outcome.result.clone()),
        );

        for next in outcome.next_jobs {
            match self
                .queue
                .create_job(&next.name, next.payload, next.options)
                .await
            {
                Ok(accepted) => {
                    debug!(parent = %job.id, job_name = %next.name, ?accepted, "Enqueued follow-up job")
                }
                Err(e) => {
                    error!(parent = %job.id, job_name = %next.name, error = %e, "Failed to enqueue follow-up job")
                }
            }
        }
    }

    async fn settle_failure(&self, job: &Job, handler: Option<&dyn JobHandler>, failure: JobFailure) {
        let store = self.queue.store();

        if failure.retryable && job.has_attempts_remaining() {
            let retry_at = job.retry_at(store.now());
            info!(
                job_id = %job.id,
                job_name = %job.name,
                attempt = job.attempts,
                max_attempts = job.max_attempts,
                %retry_at,
                "Retrying job"
            );
            if let Err(e) = store.fail_job(job.id, &failure.message, Some(retry_at)).await {
                error!(job_id = %job.id, error = %e, "Failed to schedule job retry");
            }
            self.events.publish(
                JobLifecycleEvent::for_job(job, JobLifecycleEventType::Retrying)
                    .with_error(&failure)
                    .with_retry_at(retry_at),
            );
        } else {
            if let Err(e) = store.fail_job(job.id, &failure.message, None).await {
                error!(job_id = %job.id, error = %e, "Failed to record job failure");
            }
            self.events.publish(
                JobLifecycleEvent::for_job(job, JobLifecycleEventType::Failed).with_error(&failure),
            );
        }

        if let Some(handler) = handler {
            handler.on_failure(job, &failure).await;
        }
    }
}

/// `concurrency` workers draining one queue.
pub struct WorkerPool<K: JobKind> {
    queue: JobQueue,
    registry: Arc<HandlerRegistry<K>>,
    events: EventManager,
    config: WorkerConfig,
    limiter: Option<RateLimiter>,
    shutdown_tx: Vec<mpsc::Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl<K: JobKind> WorkerPool<K> {
    pub fn new(
        queue: JobQueue,
        registry: Arc<HandlerRegistry<K>>,
        events: EventManager,
        config: WorkerConfig,
    ) -> Self {
        let limiter = config.rate_limit.clone().map(RateLimiter::new);
        Self {
            queue,
            registry,
            events,
            config,
            limiter,
            shutdown_tx: Vec::new(),
            handles: Vec::new(),
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    /// Spawn the workers. Returns immediately.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(CadenceError::Worker {
                message: format!("Worker pool for '{}' already started", self.queue.name()),
            });
        }

        let concurrency = self.config.concurrency.max(1);
        info!(queue = %self.queue.name(), concurrency, "Starting worker pool");

        for id in 0..concurrency {
            let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
            self.shutdown_tx.push(shutdown_tx);

            let mut worker = Worker::new(
                self.queue.clone(),
                Arc::clone(&self.registry),
                self.events.clone(),
            )
            .with_id(id)
            .with_poll_interval(self.config.poll_interval)
            .with_lock_duration(self.config.lock_duration);
            if let Some(limiter) = &self.limiter {
                worker = worker.with_rate_limiter(limiter.clone());
            }

            self.handles.push(tokio::spawn(async move {
                if let Err(e) = worker.run(shutdown_rx).await {
                    error!(worker = id, error = %e, "Worker error");
                }
            }));
        }

        Ok(())
    }

    /// Signal every worker and wait for in-flight jobs to settle.
    pub async fn shutdown(&mut self) -> Result<()> {
        info!(queue = %self.queue.name(), "Shutting down worker pool");

        for tx in self.shutdown_tx.drain(..) {
            if tx.send(()).await.is_err() {
                warn!("Failed to send shutdown signal to worker");
            }
        }

        for handle in self.handles.drain(..) {
            handle.await.map_err(|e| CadenceError::Worker {
                message: format!("Worker task failed: {}", e),
            })?;
        }

        Ok(())
    }
}
