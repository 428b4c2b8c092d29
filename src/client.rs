use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::channel::{mpsc, oneshot};
use futures::future::{self, Either};
use futures::{FutureExt, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::cache::ResponseCache;
use crate::cancel::{or_cancelled, CancellationManager};
use crate::offline::{OfflineQueue, QueuedRequest, Waiter};
use crate::pending::{PendingEntry, PendingRegistry, SharedOutcome};
use crate::retry::{run_with_retry, DelayCalculator, Jitter, RandomJitter, RetryContext};
use crate::runtime::{self, BoxFuture, Clock, Sleeper};
use crate::stats::StatsCollector;
use crate::{
    generate_key, Body, ConnectivityEvent, ConnectivityMonitor, LinkQuality, NetworkStats,
    OrchestratorOptions, PendingRequest, ReplayReport, RequestConfig, RequestError, RequestKey,
    Response, Result, RetryOverride, RetryPolicy, Transport, TransportRequest,
};

struct State {
    cache: ResponseCache,
    pending: PendingRegistry,
    handles: CancellationManager,
    queue: OfflineQueue,
    stats: StatsCollector,
    flushing: bool,
}

impl State {
    fn new(options: &OrchestratorOptions) -> Self {
        Self {
            cache: ResponseCache::default(),
            pending: PendingRegistry::default(),
            handles: CancellationManager::default(),
            queue: OfflineQueue::default(),
            stats: StatsCollector::new(options.latency_window),
            flushing: false,
        }
    }
}

fn lock_state(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where a request goes once the synchronous bookkeeping is done.
enum Route {
    Ready(Result<Response>),
    Attached(SharedOutcome),
    Queued(Waiter),
}

impl Route {
    async fn outcome(self) -> Result<Response> {
        match self {
            Self::Ready(result) => result,
            Self::Attached(outcome) => outcome.await,
            Self::Queued(waiter) => waiter.await.unwrap_or_else(|_| Err(RequestError::Aborted)),
        }
    }
}

#[derive(Clone)]
/// Issues requests through a [`Transport`] with caching, deduplication,
/// retries, cancellation and offline queueing.
///
/// Clones share all state. Nothing runs in the background unless
/// [`spawn_replay_worker`](Self::spawn_replay_worker) is called; without it
/// the offline queue is flushed only through
/// [`flush_offline_queue`](Self::flush_offline_queue).
///
/// Each dispatch runs as a spawned task and settles even if its callers
/// stop waiting, so on native targets requests must be issued from inside a
/// Tokio runtime.
///
/// # Example
///
/// ```no_run
/// use request_orchestrator::{ReqwestTransport, RequestConfig, RequestOrchestrator};
///
/// # async fn run() -> request_orchestrator::Result<()> {
/// let orchestrator = RequestOrchestrator::new(ReqwestTransport::new());
/// let response = orchestrator
///     .execute(RequestConfig::get("https://api.example.com/items"))
///     .await?;
/// println!("{} {}", response.status, response.body);
/// # Ok(())
/// # }
/// ```
pub struct RequestOrchestrator {
    transport: Arc<dyn Transport>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    jitter: Arc<dyn Jitter>,
    monitor: ConnectivityMonitor,
    options: OrchestratorOptions,
    default_retry: RetryPolicy,
    state: Arc<Mutex<State>>,
}

impl fmt::Debug for RequestOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("RequestOrchestrator")
            .field("online", &self.monitor.is_online())
            .field("pending", &state.pending.len())
            .field("in_flight", &state.handles.len())
            .field("queued", &state.queue.len())
            .field("options", &self.options)
            .field("default_retry", &self.default_retry)
            .finish()
    }
}

impl RequestOrchestrator {
    /// Creates an orchestrator over `transport` with default options.
    pub fn new<T: Transport>(transport: T) -> Self {
        Self::from_shared(Arc::new(transport))
    }

    /// Creates an orchestrator over an already shared transport.
    pub fn from_shared(transport: Arc<dyn Transport>) -> Self {
        let options = OrchestratorOptions::default();
        Self {
            transport,
            sleeper: runtime::default_sleeper(),
            clock: runtime::default_clock(),
            jitter: Arc::new(RandomJitter),
            monitor: ConnectivityMonitor::default(),
            state: Arc::new(Mutex::new(State::new(&options))),
            options,
            default_retry: RetryPolicy::default(),
        }
    }

    /// Applies cache, jitter, stats and replay options.
    pub fn with_options(mut self, opts: OrchestratorOptions) -> Self {
        self.lock().stats = StatsCollector::new(opts.latency_window);
        self.options = opts;
        self
    }

    /// Sets the retry policy used by requests that carry none.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Shares connectivity state with the host.
    pub fn with_connectivity(mut self, monitor: ConnectivityMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    /// Replaces the timer used for backoff, timeouts and replay pacing.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Replaces the clock used for cache expiry and latency.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the jitter source added to backoff delays.
    pub fn with_jitter(mut self, jitter: Arc<dyn Jitter>) -> Self {
        self.jitter = jitter;
        self
    }

    /// Executes `config` with its own (or the default) retry policy.
    ///
    /// In order: GET responses are served from cache while fresh, identical
    /// in-flight requests share one outcome, requests made while offline are
    /// queued and settle once replayed, everything else is dispatched.
    pub async fn execute(&self, config: RequestConfig) -> Result<Response> {
        self.execute_with(config, RetryOverride::default()).await
    }

    /// Like [`execute`](Self::execute) with retry fields overridden for this
    /// call.
    pub async fn execute_with(
        &self,
        config: RequestConfig,
        overrides: RetryOverride,
    ) -> Result<Response> {
        self.lock().stats.record_request();
        let policy = match self.resolve_policy(&config, &overrides) {
            Ok(policy) => policy,
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(url = %config.url, error = %err, "rejected invalid request");

                self.lock().stats.record_failure(&err);
                return Err(err);
            }
        };
        self.route(config, policy, true).outcome().await
    }

    /// Executes a GET for `url`.
    pub async fn get(&self, url: impl Into<String>) -> Result<Response> {
        self.execute(RequestConfig::get(url)).await
    }

    /// Executes a POST of `body` to `url`.
    pub async fn post(&self, url: impl Into<String>, body: impl Into<Body>) -> Result<Response> {
        self.execute(RequestConfig::post(url, body)).await
    }

    /// Executes a PUT of `body` to `url`.
    pub async fn put(&self, url: impl Into<String>, body: impl Into<Body>) -> Result<Response> {
        self.execute(RequestConfig::put(url, body)).await
    }

    /// Executes a DELETE for `url`.
    pub async fn delete(&self, url: impl Into<String>) -> Result<Response> {
        self.execute(RequestConfig::delete(url)).await
    }

    /// Aborts the in-flight request matching `config` and drops matching
    /// entries from the offline queue.
    ///
    /// Every caller sharing the outcome, or waiting on a dropped queue entry,
    /// receives [`RequestError::Aborted`]. Returns `false` when nothing
    /// matched.
    pub fn cancel(&self, config: &RequestConfig) -> bool {
        let key = generate_key(config);
        let (cancelled, dequeued) = {
            let mut state = self.lock();
            let cancelled = state.handles.cancel(&key);
            state.pending.forget(&key);
            let dequeued = state.queue.take_matching(&key);
            for _ in &dequeued {
                state.stats.record_failure(&RequestError::Aborted);
            }
            (cancelled, dequeued)
        };

        #[cfg(feature = "tracing")]
        tracing::info!(request = %key, cancelled, dequeued = dequeued.len(), "cancel requested");

        let dequeued_any = !dequeued.is_empty();
        for request in dequeued {
            request.settle(Err(RequestError::Aborted));
        }
        cancelled || dequeued_any
    }

    /// Aborts every in-flight request and returns how many were signalled.
    ///
    /// Queued offline requests are untouched.
    pub fn cancel_all(&self) -> usize {
        let mut state = self.lock();
        let cancelled = state.handles.cancel_all();
        state.pending.clear();

        #[cfg(feature = "tracing")]
        tracing::info!(count = cancelled.len(), "cancelled all in-flight requests");

        cancelled.len()
    }

    /// Queues `config` for dispatch on the next flush without waiting for it.
    pub fn enqueue_offline(&self, config: RequestConfig) -> Result<()> {
        let policy = self.resolve_policy(&config, &RetryOverride::default())?;

        #[cfg(feature = "tracing")]
        tracing::info!(request = %generate_key(&config), "queued request for replay");

        self.lock()
            .queue
            .enqueue(QueuedRequest::detached(config, policy));
        Ok(())
    }

    /// Drops every cached response and forgets in-flight entries.
    ///
    /// Forgotten requests keep running; later identical calls dispatch anew.
    pub fn clear_caches(&self) {
        let mut state = self.lock();
        state.cache.clear();
        state.pending.clear();
        state.stats.reset_cache_hits();

        #[cfg(feature = "tracing")]
        tracing::info!("cleared response cache and pending registry");
    }

    /// Drops every queued request. Callers waiting on them receive
    /// [`RequestError::Aborted`].
    pub fn clear_offline_queue(&self) -> usize {
        let dropped = {
            let mut state = self.lock();
            let dropped = state.queue.take_all();
            for _ in 0..dropped.len() {
                state.stats.record_failure(&RequestError::Aborted);
            }
            dropped
        };
        let count = dropped.len();
        for request in dropped {
            request.settle(Err(RequestError::Aborted));
        }
        count
    }

    /// Snapshot of the request counters.
    pub fn stats(&self) -> NetworkStats {
        self.lock().stats.snapshot()
    }

    /// Zeroes every counter and the latency window.
    pub fn reset_stats(&self) {
        self.lock().stats.reset();
    }

    /// Number of requests registered as in flight.
    pub fn pending_request_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Requests currently registered as in flight, oldest first.
    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        let now = self.clock.now_ms();
        let state = self.lock();
        let mut entries: Vec<&PendingEntry> = state.pending.entries().collect();
        entries.sort_by_key(|entry| entry.dispatch_id);
        entries
            .into_iter()
            .map(|entry| PendingRequest {
                config: entry.config.clone(),
                age_ms: now.saturating_sub(entry.started_at),
            })
            .collect()
    }

    /// Configs waiting in the offline queue, in replay order.
    pub fn queued_requests(&self) -> Vec<RequestConfig> {
        self.lock().queue.configs()
    }

    /// Number of requests waiting in the offline queue.
    pub fn queued_request_count(&self) -> usize {
        self.lock().queue.len()
    }

    /// Fresh cached response for `config`, without counting a cache hit.
    pub fn cached_response(&self, config: &RequestConfig) -> Option<Response> {
        if !config.method.is_cacheable() {
            return None;
        }
        let now = self.clock.now_ms();
        self.lock().cache.get(&generate_key(config), now)
    }

    /// Deduplication and cache key for `config`.
    pub fn request_key(&self, config: &RequestConfig) -> RequestKey {
        generate_key(config)
    }

    /// Current connectivity as last reported by the host.
    pub fn is_online(&self) -> bool {
        self.monitor.is_online()
    }

    /// Link quality as last reported by the host.
    pub fn link_quality(&self) -> LinkQuality {
        self.monitor.link_quality()
    }

    /// The monitor this orchestrator reads connectivity from.
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    /// Replays queued requests in submission order.
    ///
    /// Does nothing while offline or while another flush is running. Failed
    /// replays go back to the tail of the queue; a request whose replay is
    /// aborted, or that exhausts `max_replay_attempts`, is dropped and its
    /// caller receives the error. If connectivity drops mid-flush, or the
    /// returned future is dropped, the unreplayed remainder returns to the
    /// front of the queue.
    pub async fn flush_offline_queue(&self) -> ReplayReport {
        let mut report = ReplayReport::default();
        let batch = {
            let mut state = self.lock();
            if state.flushing || state.queue.is_empty() || !self.monitor.is_online() {
                return report;
            }
            state.flushing = true;
            state.queue.take_all()
        };
        let mut flush = FlushGuard {
            state: &self.state,
            remaining: batch,
            current: None,
        };

        #[cfg(feature = "tracing")]
        tracing::info!(count = flush.remaining.len(), "replaying offline queue");

        while let Some(request) = flush.remaining.pop_front() {
            if !self.monitor.is_online() {
                flush.remaining.push_front(request);
                report.requeued += flush.remaining.len();

                #[cfg(feature = "tracing")]
                tracing::info!(remaining = flush.remaining.len(), "connectivity lost during replay");

                return report;
            }

            let route = self.route(request.config.clone(), request.policy.clone(), false);
            flush.current = Some(request);
            let result = route.outcome().await;
            let Some(mut request) = flush.current.take() else {
                break;
            };
            match result {
                Ok(response) => {
                    #[cfg(feature = "tracing")]
                    tracing::info!(url = %request.config.url, status = response.status, "replayed queued request");

                    report.replayed += 1;
                    request.settle(Ok(response));
                }
                Err(err) => {
                    report.failed += 1;
                    request.replay_failures += 1;
                    let exhausted = self
                        .options
                        .max_replay_attempts
                        .is_some_and(|max| request.replay_failures >= max);
                    if err.is_aborted() || exhausted {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(url = %request.config.url, error = %err, "dropping queued request");

                        request.settle(Err(err));
                    } else {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(url = %request.config.url, error = %err, "replay failed, re-queued");

                        report.requeued += 1;
                        self.lock().queue.enqueue(request);
                    }
                }
            }

            if !flush.remaining.is_empty() && self.options.replay_spacing_ms > 0 {
                self.sleeper
                    .sleep(Duration::from_millis(self.options.replay_spacing_ms))
                    .await;
            }
        }

        #[cfg(feature = "tracing")]
        tracing::info!(
            replayed = report.replayed,
            failed = report.failed,
            requeued = report.requeued,
            "offline queue replay finished"
        );

        report
    }

    /// Future that flushes the offline queue whenever connectivity returns.
    ///
    /// The connectivity subscription is taken when this is called, so
    /// transitions between the call and the first poll are not missed. While
    /// online with requests still queued, it also flushes every
    /// `reflush_interval_ms`. It never completes on its own.
    pub fn replay_worker(&self) -> impl Future<Output = ()> + 'static {
        let (sender, mut events) = mpsc::unbounded();
        let subscription = self.monitor.on_change(move |event| {
            let _ = sender.unbounded_send(*event);
        });
        let this = self.clone();

        async move {
            let _subscription = subscription;
            loop {
                let interval = this
                    .options
                    .reflush_interval_ms
                    .filter(|_| this.monitor.is_online() && this.queued_request_count() > 0);
                let wake = match interval {
                    Some(interval_ms) => {
                        let timer = this.sleeper.sleep(Duration::from_millis(interval_ms));
                        match future::select(events.next(), timer).await {
                            Either::Left((event, _)) => event.map(Wake::Event),
                            Either::Right(((), _)) => Some(Wake::Scheduled),
                        }
                    }
                    None => events.next().await.map(Wake::Event),
                };

                match wake {
                    Some(Wake::Event(ConnectivityEvent::Online)) => {
                        if this.options.replay_delay_ms > 0 {
                            this.sleeper
                                .sleep(Duration::from_millis(this.options.replay_delay_ms))
                                .await;
                        }
                        this.flush_offline_queue().await;
                    }
                    Some(Wake::Scheduled) => {
                        this.flush_offline_queue().await;
                    }
                    Some(Wake::Event(_)) => {}
                    None => break,
                }
            }
        }
    }

    /// Runs [`replay_worker`](Self::replay_worker) on the tokio runtime.
    #[cfg(not(target_arch = "wasm32"))]
    pub fn spawn_replay_worker(&self) -> tokio::task::JoinHandle<()> {
        runtime::spawn(self.replay_worker())
    }

    /// Runs [`replay_worker`](Self::replay_worker) on the browser event loop.
    #[cfg(target_arch = "wasm32")]
    pub fn spawn_replay_worker(&self) {
        runtime::spawn(self.replay_worker())
    }

    fn resolve_policy(&self, config: &RequestConfig, overrides: &RetryOverride) -> Result<RetryPolicy> {
        config.validate()?;
        let policy = config
            .retry
            .as_ref()
            .unwrap_or(&self.default_retry)
            .merged(overrides);
        policy.validate()?;
        Ok(policy)
    }

    // Everything up to the returned route happens under one lock, so two
    // identical calls can never both dispatch.
    fn route(&self, config: RequestConfig, policy: RetryPolicy, divert_offline: bool) -> Route {
        let key = generate_key(&config);
        let now = self.clock.now_ms();
        let mut state = self.lock();

        if config.method.is_cacheable() {
            if let Some(response) = state.cache.get(&key, now) {
                #[cfg(feature = "tracing")]
                tracing::debug!(request = %key, "served from cache");

                state.stats.record_cache_hit();
                return Route::Ready(Ok(response));
            }
        }

        if let Some(outcome) = state.pending.attach(&key) {
            #[cfg(feature = "tracing")]
            tracing::debug!(request = %key, "joined in-flight request");

            state.stats.record_duplicate();
            return Route::Attached(outcome);
        }

        if divert_offline && !self.monitor.is_online() {
            #[cfg(feature = "tracing")]
            tracing::info!(request = %key, "offline, queued request for replay");

            let (request, waiter) = QueuedRequest::waiting(config, policy);
            state.queue.enqueue(request);
            return Route::Queued(waiter);
        }

        Route::Attached(self.dispatch(&mut state, key, config, policy, now))
    }

    fn dispatch(
        &self,
        state: &mut State,
        key: RequestKey,
        config: RequestConfig,
        policy: RetryPolicy,
        now: u64,
    ) -> SharedOutcome {
        let dispatch_id = state.pending.next_dispatch_id();
        let token = state.handles.register(key.clone(), dispatch_id);
        let job = Dispatch {
            transport: Arc::clone(&self.transport),
            sleeper: Arc::clone(&self.sleeper),
            clock: Arc::clone(&self.clock),
            delays: DelayCalculator::new(
                Duration::from_millis(self.options.jitter_ceiling_ms),
                Arc::clone(&self.jitter),
            ),
            request: TransportRequest::from(&config),
            timeout_ms: config.timeout_ms,
            cache_ttl_ms: config
                .method
                .is_cacheable()
                .then_some(self.options.cache_ttl_ms),
            policy,
            token,
            started_at: now,
            key: key.clone(),
            dispatch_id,
            state: Arc::downgrade(&self.state),
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(request = %key, dispatch_id, "dispatching request");

        // The job runs as its own task so it settles and releases its
        // registry entries even if every caller stops polling.
        let (sender, receiver) = oneshot::channel();
        runtime::spawn(async move {
            let _ = sender.send(job.run().await);
        });
        let future: BoxFuture<'static, Result<Response>> = Box::pin(
            receiver.map(|received| received.unwrap_or_else(|_| Err(RequestError::Aborted))),
        );
        let outcome = future.shared();
        state.pending.register(
            key,
            PendingEntry {
                dispatch_id,
                outcome: outcome.clone(),
                started_at: now,
                config,
            },
        );
        outcome
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        lock_state(&self.state)
    }
}

enum Wake {
    Event(ConnectivityEvent),
    Scheduled,
}

/// Owns a flush's unreplayed requests so they return to the queue however
/// the flush ends.
struct FlushGuard<'a> {
    state: &'a Mutex<State>,
    remaining: VecDeque<QueuedRequest>,
    /// Replay awaiting its outcome.
    current: Option<QueuedRequest>,
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        let mut unreplayed = std::mem::take(&mut self.remaining);
        if let Some(request) = self.current.take() {
            unreplayed.push_front(request);
        }
        let mut state = lock_state(self.state);
        state.flushing = false;
        if !unreplayed.is_empty() {
            state.queue.restore_front(unreplayed);
        }
    }
}

/// Everything one dispatch needs, detached from the orchestrator so it can
/// run as its own task.
struct Dispatch {
    transport: Arc<dyn Transport>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    delays: DelayCalculator,
    request: TransportRequest,
    timeout_ms: Option<u64>,
    cache_ttl_ms: Option<u64>,
    policy: RetryPolicy,
    token: CancellationToken,
    started_at: u64,
    key: RequestKey,
    dispatch_id: u64,
    state: Weak<Mutex<State>>,
}

impl Dispatch {
    async fn run(self) -> Result<Response> {
        let label = self.key.to_string();
        let ctx = RetryContext {
            delays: &self.delays,
            sleeper: &*self.sleeper,
            cancel: &self.token,
            label: &label,
        };
        let result = run_with_retry(
            &self.policy,
            ctx,
            |_| self.attempt(),
            |_, _| {
                if let Some(state) = self.state.upgrade() {
                    lock_state(&state).stats.record_retry();
                }
            },
        )
        .await;

        self.settle(&result);
        result
    }

    async fn attempt(&self) -> Result<Response> {
        if self.token.is_cancelled() {
            return Err(RequestError::Aborted);
        }

        let signal = self.token.child_token();
        let exchange = self.transport.send(self.request.clone(), signal.clone());
        let response = match self.timeout_ms {
            Some(timeout_ms) => {
                let timer = self.sleeper.sleep(Duration::from_millis(timeout_ms));
                match or_cancelled(&self.token, future::select(exchange, timer)).await? {
                    Either::Left((result, _)) => result,
                    Either::Right(((), _)) => {
                        signal.cancel();
                        Err(RequestError::Timeout { timeout_ms })
                    }
                }
            }
            None => or_cancelled(&self.token, exchange).await?,
        }?;

        if response.is_success() {
            Ok(response)
        } else {
            Err(RequestError::Http {
                status: response.status,
                body: response.body,
            })
        }
    }

    fn settle(&self, result: &Result<Response>) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let now = self.clock.now_ms();
        let mut state = lock_state(&state);
        state.pending.remove(&self.key, self.dispatch_id);
        state.handles.release(&self.key, self.dispatch_id);

        match result {
            Ok(response) => {
                if let Some(ttl_ms) = self.cache_ttl_ms {
                    state.cache.put(self.key.clone(), response.clone(), now, ttl_ms);
                }
                state
                    .stats
                    .record_success(now.saturating_sub(self.started_at));

                #[cfg(feature = "tracing")]
                tracing::debug!(
                    request = %self.key,
                    status = response.status,
                    latency_ms = now.saturating_sub(self.started_at),
                    "request succeeded"
                );
            }
            Err(err) => {
                state.stats.record_failure(err);

                #[cfg(feature = "tracing")]
                tracing::warn!(request = %self.key, error = %err, "request failed");
            }
        }
    }
}
