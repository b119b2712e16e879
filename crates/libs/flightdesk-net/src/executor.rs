//! Request execution with caching, in-flight deduplication, staleness-safe
//! cancellation and retry.
//!
//! A [`RequestExecutor`] owns the shared pieces (cache, in-flight map,
//! sequence counter, backoff). Each call-site obtains its own
//! [`CallContext`]; a new call on a context supersedes the previous one, and
//! a superseded call settles as `Ok(None)` without touching any state.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffScheduler;
use crate::cache::{CacheStats, Invalidation, ResponseCache};
use crate::config::RequestConfig;
use crate::error::NetError;

/// Upper bound for a single retry delay.
pub const RETRY_DELAY_CAP: Duration = Duration::from_secs(10);

/// A wrapped request function.
///
/// Implemented for any `Fn(Vec<Value>, CancellationToken) -> impl Future`
/// closure. Implementations should resolve to [`NetError::Aborted`] once the
/// token fires, but the executor does not depend on it.
pub trait Operation: Send + Sync + 'static {
    fn call(
        &self,
        args: Vec<Value>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Value, NetError>>;
}

impl<F, Fut> Operation for F
where
    F: Fn(Vec<Value>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, NetError>> + Send + 'static,
{
    fn call(
        &self,
        args: Vec<Value>,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Value, NetError>> {
        self(args, cancel).boxed()
    }
}

/// `operation_id:json(args)`; serde_json keeps object keys sorted.
pub fn cache_key(operation_id: &str, args: &[Value]) -> String {
    format!("{operation_id}:{}", Value::Array(args.to_vec()))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub cache: bool,
    pub cache_ttl: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub debounce: Option<Duration>,
}

impl From<&RequestConfig> for ExecuteOptions {
    fn from(config: &RequestConfig) -> Self {
        Self {
            cache: config.cache_enabled,
            cache_ttl: config.cache_ttl(),
            retry_attempts: config.retry_attempts,
            retry_delay: config.retry_delay(),
            debounce: config.debounce_delay(),
        }
    }
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self::from(&RequestConfig::default())
    }
}

impl ExecuteOptions {
    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    pub fn with_retry_attempts(mut self, retry_attempts: u32) -> Self {
        self.retry_attempts = retry_attempts;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_debounce(mut self, debounce: Option<Duration>) -> Self {
        self.debounce = debounce;
        self
    }
}

/// One logical call, alive from `execute` until it settles or is superseded.
#[derive(Clone, Debug, PartialEq)]
pub struct Invocation {
    pub sequence: u64,
    pub method: String,
    pub args: Vec<Value>,
    pub started_at: Instant,
}

type SharedCall = Shared<BoxFuture<'static, Result<Value, NetError>>>;

struct InFlight {
    call_id: u64,
    epoch: u64,
    cancel: CancellationToken,
    call: SharedCall,
}

enum Fetched {
    Cached(Value),
    /// `epoch` is the invalidation epoch the underlying call started in.
    Fresh { value: Value, epoch: u64 },
}

struct ExecutorShared {
    defaults: ExecuteOptions,
    cache: Mutex<ResponseCache>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_sequence: AtomicU64,
    next_call_id: AtomicU64,
    /// Bumped on every invalidation. Results of calls started in an older
    /// epoch are returned but never cached or joined.
    epoch: AtomicU64,
    backoff: BackoffScheduler,
}

impl ExecutorShared {
    fn cache(&self) -> MutexGuard<'_, ResponseCache> {
        self.cache.lock().expect("response cache mutex poisoned")
    }

    fn in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight.lock().expect("in-flight map mutex poisoned")
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn invalidate(&self, selector: &Invalidation) -> usize {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cache().invalidate(selector)
    }

    fn clear_cache(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.cache().clear();
    }

    /// Attaches to a live call for `key`, or starts one. Also returns the
    /// call's epoch and whether this caller started it.
    fn join_or_start(
        self: &Arc<Self>,
        key: &str,
        operation: &Arc<dyn Operation>,
        args: &[Value],
        options: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> (SharedCall, u64, bool) {
        let mut in_flight = self.in_flight();
        let epoch = self.epoch();
        if let Some(existing) = in_flight.get(key) {
            if !existing.cancel.is_cancelled() && existing.epoch == epoch {
                log::debug!("executor: joined in-flight call key={key}");
                return (existing.call.clone(), existing.epoch, false);
            }
        }

        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(self);
        let task_key = key.to_owned();
        let run = run_with_retry(
            Arc::clone(operation),
            args.to_vec(),
            cancel.clone(),
            options.retry_attempts,
            options.retry_delay,
            self.backoff.clone(),
            task_key.clone(),
        );
        // The entry is released by the task itself, so it goes away even when
        // every waiter has dropped the shared future.
        let task = tokio::spawn(async move {
            let result = run.await;
            shared.finish(&task_key, call_id);
            result
        });
        let call = async move {
            match task.await {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => Err(NetError::Aborted),
                Err(err) => Err(NetError::transient(format!("request task failed: {err}"))),
            }
        }
        .boxed()
        .shared();

        in_flight.insert(key.to_owned(), InFlight { call_id, epoch, cancel: cancel.clone(), call: call.clone() });
        (call, epoch, true)
    }

    fn finish(&self, key: &str, call_id: u64) {
        let mut in_flight = self.in_flight();
        if in_flight.get(key).is_some_and(|entry| entry.call_id == call_id) {
            in_flight.remove(key);
        }
    }
}

async fn run_with_retry(
    operation: Arc<dyn Operation>,
    args: Vec<Value>,
    cancel: CancellationToken,
    retry_attempts: u32,
    retry_delay: Duration,
    backoff: BackoffScheduler,
    key: String,
) -> Result<Value, NetError> {
    let mut attempt = 0u32;
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(NetError::Aborted),
            result = operation.call(args.clone(), cancel.child_token()) => result,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < retry_attempts => {
                let delay = backoff.delay(attempt, retry_delay, RETRY_DELAY_CAP);
                attempt += 1;
                log::debug!(
                    "executor: retrying key={key} attempt={attempt}/{retry_attempts} delay_ms={} err={err}",
                    delay.as_millis()
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(NetError::Aborted),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// Shared request machinery for a set of call contexts.
#[derive(Clone)]
pub struct RequestExecutor {
    shared: Arc<ExecutorShared>,
}

impl RequestExecutor {
    pub fn new(config: &RequestConfig) -> Self {
        Self::with_backoff(config, BackoffScheduler::new())
    }

    pub fn with_backoff(config: &RequestConfig, backoff: BackoffScheduler) -> Self {
        Self {
            shared: Arc::new(ExecutorShared {
                defaults: ExecuteOptions::from(config),
                cache: Mutex::new(ResponseCache::new()),
                in_flight: Mutex::new(HashMap::new()),
                next_sequence: AtomicU64::new(0),
                next_call_id: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                backoff,
            }),
        }
    }

    /// Options derived from the executor's [`RequestConfig`].
    pub fn defaults(&self) -> &ExecuteOptions {
        &self.shared.defaults
    }

    /// A fresh caller context (one per component or call-site).
    pub fn context(&self) -> CallContext {
        CallContext {
            shared: Arc::clone(&self.shared),
            state: Arc::new(Mutex::new(ContextState::default())),
        }
    }

    /// Drops matching cache entries. Calls already in flight still resolve
    /// for their callers but leave the cache alone.
    pub fn invalidate(&self, selector: &Invalidation) -> usize {
        self.shared.invalidate(selector)
    }

    pub fn clear_cache(&self) {
        self.shared.clear_cache();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache().stats()
    }

    pub fn in_flight_count(&self) -> usize {
        self.shared.in_flight().len()
    }

    /// Cancels every in-flight call and drops the cache.
    pub fn dispose(&self) {
        for entry in self.shared.in_flight().values() {
            entry.cancel.cancel();
        }
        self.clear_cache();
    }
}

#[derive(Default)]
struct ContextState {
    current: u64,
    cancel: CancellationToken,
    loading: bool,
    data: Option<Value>,
    error: Option<NetError>,
    active: Option<Invocation>,
}

/// Per-call-site view of an executor.
///
/// Clones share the same state, so a clone handed to a spawned task still
/// supersedes (and is superseded by) calls made through the original.
#[derive(Clone)]
pub struct CallContext {
    shared: Arc<ExecutorShared>,
    state: Arc<Mutex<ContextState>>,
}

impl CallContext {
    fn state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().expect("call context mutex poisoned")
    }

    /// Runs `operation` for `args`.
    ///
    /// Returns `Ok(None)` when the call was superseded by a newer call on this
    /// context or cancelled; such calls never surface an error.
    pub async fn execute(
        &self,
        operation_id: &str,
        operation: Arc<dyn Operation>,
        args: Vec<Value>,
        options: &ExecuteOptions,
    ) -> Result<Option<Value>, NetError> {
        let started_at = Instant::now();
        let sequence = self.shared.next_sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let key = cache_key(operation_id, &args);
        let cancel = {
            let mut state = self.state();
            state.cancel.cancel();
            state.cancel = CancellationToken::new();
            state.current = sequence;
            state.loading = true;
            state.active = Some(Invocation {
                sequence,
                method: operation_id.to_owned(),
                args: args.clone(),
                started_at,
            });
            state.cancel.clone()
        };

        if let Some(delay) = options.debounce {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.settle(sequence, &key, Err(NetError::Aborted), options),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let outcome = self.fetch(&key, operation, &args, options, &cancel).await;
        self.settle(sequence, &key, outcome, options)
    }

    /// [`CallContext::execute`] followed by decoding into `T`.
    pub async fn execute_as<T: DeserializeOwned>(
        &self,
        operation_id: &str,
        operation: Arc<dyn Operation>,
        args: Vec<Value>,
        options: &ExecuteOptions,
    ) -> Result<Option<T>, NetError> {
        let Some(value) = self.execute(operation_id, operation, args, options).await? else {
            return Ok(None);
        };
        let payload = value.to_string();
        serde_json::from_value(value)
            .map(Some)
            .map_err(|err| NetError::decode(err.to_string(), payload))
    }

    async fn fetch(
        &self,
        key: &str,
        operation: Arc<dyn Operation>,
        args: &[Value],
        options: &ExecuteOptions,
        cancel: &CancellationToken,
    ) -> Result<Fetched, NetError> {
        loop {
            if options.cache {
                if let Some(value) = self.shared.cache().get(key) {
                    log::debug!("executor: cache hit key={key}");
                    return Ok(Fetched::Cached(value));
                }
            }

            let (call, epoch, started) =
                self.shared.join_or_start(key, &operation, args, options, cancel);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(NetError::Aborted),
                result = call => result,
            };
            match result {
                Ok(value) => return Ok(Fetched::Fresh { value, epoch }),
                // The context that started the shared call gave up on it.
                Err(NetError::Aborted) if !started && !cancel.is_cancelled() => {
                    log::debug!("executor: shared call aborted by its owner, reissuing key={key}");
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn settle(
        &self,
        sequence: u64,
        key: &str,
        outcome: Result<Fetched, NetError>,
        options: &ExecuteOptions,
    ) -> Result<Option<Value>, NetError> {
        let mut state = self.state();
        if state.current != sequence {
            log::debug!(
                "executor: discarded stale result key={key} seq={sequence} current={}",
                state.current
            );
            return Ok(None);
        }
        state.loading = false;
        let elapsed_ms = state
            .active
            .take()
            .map(|invocation| invocation.started_at.elapsed().as_millis())
            .unwrap_or_default();

        match outcome {
            Ok(fetched) => {
                let value = match fetched {
                    Fetched::Cached(value) => value,
                    Fetched::Fresh { value, epoch } => {
                        if options.cache && epoch == self.shared.epoch() {
                            self.shared.cache().set(key, value.clone(), options.cache_ttl);
                        } else if options.cache {
                            log::debug!("executor: not caching result from before invalidation key={key}");
                        }
                        value
                    }
                };
                state.data = Some(value.clone());
                state.error = None;
                Ok(Some(value))
            }
            Err(NetError::Aborted) => Ok(None),
            Err(err) => {
                log::debug!("executor: call failed key={key} seq={sequence} elapsed_ms={elapsed_ms} err={err}");
                state.error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Cancels the current call, which then settles as `Ok(None)`.
    pub fn cancel(&self) {
        self.state().cancel.cancel();
    }

    pub fn is_loading(&self) -> bool {
        self.state().loading
    }

    /// Value of the last call that settled successfully while current.
    pub fn data(&self) -> Option<Value> {
        self.state().data.clone()
    }

    pub fn error(&self) -> Option<NetError> {
        self.state().error.clone()
    }

    pub fn current_sequence(&self) -> u64 {
        self.state().current
    }

    pub fn active_invocation(&self) -> Option<Invocation> {
        self.state().active.clone()
    }
}

#[cfg(test)]
mod tests;
