//! # Publisher
//!
//! The delivery queue and batcher. A single task owns every queued `Context`: it groups them
//! into batches, sends up to `max_in_flight` batches at once, retries failed batches with
//! backoff, and settles each `Context` exactly once.
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time;

use analytics_core::context::Context;
use analytics_core::emitter::{Emitter, Notification, NotificationKind};
use analytics_core::error::ContextError;
use analytics_core::event::format_timestamp;
use analytics_core::pipeline::Plugins;
use analytics_core::retry::RetryPolicy;
use bytes::Bytes;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use http::{HeaderMap, Method};
use serde::Serialize;
use serde_json::value::RawValue;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, instrument, warn};
use url::Url;

use crate::abort::abort_signal_after_timeout;
use crate::error::{classify, DeliveryError, TransportError};
use crate::http_client::{HttpClient, HttpRequest};

/// Largest serialized event accepted by the ingestion API.
pub const MAX_EVENT_SIZE: usize = 32 * 1024;
/// Largest sum of serialized events sent in one batch.
pub const MAX_BATCH_SIZE: usize = 480 * 1024;

/// Stands in for a deadline that would overflow `Instant`. Matches tokio's own far future.
const FAR_FUTURE: time::Duration = time::Duration::from_secs(86400 * 365 * 30);

pub(crate) enum Command {
    Enqueue(Context),
    /// Cut every pending event into a batch and answer once everything admitted so far is settled.
    Flush(oneshot::Sender<()>),
    /// Settle everything still held as `Discarded`, including later arrivals.
    Discard,
}

#[derive(Debug, Clone)]
pub(crate) struct PublisherSettings {
    pub endpoint: Url,
    pub headers: HeaderMap,
    pub batch_size: usize,
    pub max_retries: u32,
    pub flush_interval: time::Duration,
    pub request_timeout: time::Duration,
    pub max_in_flight: usize,
    pub retry_policy: RetryPolicy,
}

struct Entry {
    /// Admission order, used to answer flush requests.
    seq: u64,
    context: Context,
    payload: Box<RawValue>,
}

pub(crate) struct Batch {
    id: u64,
    entries: Vec<Entry>,
    attempt: u32,
    not_before: Option<Instant>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Payload<'a> {
    batch: Vec<&'a RawValue>,
    sent_at: String,
}

type Attempt = BoxFuture<'static, (u64, Result<(), DeliveryError>)>;

enum Wake {
    Command(Option<Command>),
    Settled(u64, Result<(), DeliveryError>),
    Timer,
}

pub(crate) struct Publisher {
    settings: PublisherSettings,
    client: Arc<dyn HttpClient>,
    plugins: Arc<Plugins>,
    emitter: Arc<Emitter>,
    next_seq: u64,
    next_batch: u64,
    pending: Vec<Entry>,
    pending_bytes: usize,
    oldest_pending: Option<Instant>,
    ready: VecDeque<Batch>,
    backoff: Vec<Batch>,
    sending: HashMap<u64, Batch>,
    /// Sequence numbers of every admitted entry not settled yet.
    outstanding: BTreeSet<u64>,
    waiters: Vec<(u64, oneshot::Sender<()>)>,
    discarding: bool,
}

impl Publisher {
    pub(crate) fn new(
        settings: PublisherSettings,
        client: Arc<dyn HttpClient>,
        plugins: Arc<Plugins>,
        emitter: Arc<Emitter>,
    ) -> Self {
        Self {
            settings,
            client,
            plugins,
            emitter,
            next_seq: 0,
            next_batch: 0,
            pending: Vec::new(),
            pending_bytes: 0,
            oldest_pending: None,
            ready: VecDeque::new(),
            backoff: Vec::new(),
            sending: HashMap::new(),
            outstanding: BTreeSet::new(),
            waiters: Vec::new(),
            discarding: false,
        }
    }

    /// Process commands until every sender is dropped, then discard whatever is left without
    /// making any further network calls.
    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut attempts: FuturesUnordered<Attempt> = FuturesUnordered::new();

        loop {
            let now = Instant::now();
            if self
                .oldest_pending
                .is_some_and(|oldest| now >= deadline(oldest, self.settings.flush_interval))
            {
                debug!("flush interval elapsed");
                self.cut_batches();
            }
            self.promote_due_retries(now);

            while attempts.len() < self.settings.max_in_flight {
                let Some(batch) = self.ready.pop_front() else {
                    break;
                };
                if let Some(attempt) = self.start(batch) {
                    attempts.push(attempt);
                }
            }
            metrics::gauge!("analytics_publisher_saturation_percent")
                .set(attempts.len() as f64 / self.settings.max_in_flight as f64);

            self.notify_waiters();

            let deadline = self.next_wake();
            let wake = tokio::select! {
                command = commands.recv() => Wake::Command(command),
                Some((id, result)) = attempts.next(), if !attempts.is_empty() => Wake::Settled(id, result),
                _ = sleep_until(deadline) => Wake::Timer,
            };

            match wake {
                Wake::Command(Some(Command::Enqueue(ctx))) => self.enqueue(ctx),
                Wake::Command(Some(Command::Flush(done))) => self.flush(done),
                Wake::Command(Some(Command::Discard)) => {
                    attempts = FuturesUnordered::new();
                    self.discarding = true;
                    self.discard_all();
                }
                Wake::Command(None) => break,
                Wake::Settled(id, result) => self.settle(id, result),
                Wake::Timer => {}
            }
        }

        drop(attempts);
        self.discard_all();
        self.notify_waiters();
        debug!("publisher stopped");
    }

    /// Admit a context that cleared the plugin pipeline.
    pub(crate) fn enqueue(&mut self, ctx: Context) {
        if self.discarding {
            self.fail(ctx, ContextError::Discarded, false);
            return;
        }

        let payload = match serde_json::value::to_raw_value(ctx.event()) {
            Ok(payload) => payload,
            Err(e) => {
                error!(context = %ctx.id(), "failed to serialize event: {}", e);
                let failure = ContextError::Delivery {
                    attempts: 0,
                    status: None,
                    message: format!("failed to serialize event: {}", e),
                };
                self.fail(ctx, failure, false);
                return;
            }
        };

        let size = payload.get().len();
        if size > MAX_EVENT_SIZE {
            warn!(context = %ctx.id(), size, "event exceeds the maximum event size");
            let failure = ContextError::EventTooLarge {
                size,
                limit: MAX_EVENT_SIZE,
            };
            self.fail(ctx, failure, false);
            return;
        }

        metrics::counter!("analytics_events_queued_total").increment(1);
        self.emitter
            .emit_with(NotificationKind::Queued, || Notification::Queued {
                context: ctx.clone(),
            });

        if !self.pending.is_empty() && self.pending_bytes + size > MAX_BATCH_SIZE {
            self.cut_batches();
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.outstanding.insert(seq);
        self.oldest_pending.get_or_insert_with(Instant::now);
        self.pending.push(Entry {
            seq,
            context: ctx,
            payload,
        });
        self.pending_bytes += size;

        if self.pending.len() >= self.settings.batch_size {
            self.cut_batches();
        }
    }

    /// Move every pending entry into ready batches of at most `batch_size` events and
    /// `MAX_BATCH_SIZE` bytes, keeping admission order.
    pub(crate) fn cut_batches(&mut self) {
        let entries = std::mem::take(&mut self.pending);
        self.pending_bytes = 0;
        self.oldest_pending = None;

        let mut batch = Vec::new();
        let mut bytes = 0;
        for entry in entries {
            let size = entry.payload.get().len();
            if !batch.is_empty()
                && (batch.len() >= self.settings.batch_size || bytes + size > MAX_BATCH_SIZE)
            {
                let entries = std::mem::take(&mut batch);
                self.push_ready(entries);
                bytes = 0;
            }
            bytes += size;
            batch.push(entry);
        }
        if !batch.is_empty() {
            self.push_ready(batch);
        }
    }

    fn push_ready(&mut self, entries: Vec<Entry>) {
        let id = self.next_batch;
        self.next_batch += 1;
        self.ready.push_back(Batch {
            id,
            entries,
            attempt: 0,
            not_before: None,
        });
    }

    fn flush(&mut self, done: oneshot::Sender<()>) {
        self.cut_batches();
        self.waiters.push((self.next_seq, done));
    }

    fn promote_due_retries(&mut self, now: Instant) {
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.backoff)
            .into_iter()
            .partition(|batch| batch.not_before.map_or(true, |at| at <= now));
        self.backoff = waiting;
        self.ready.extend(due);
    }

    fn next_wake(&self) -> Option<Instant> {
        let flush_at = self
            .oldest_pending
            .map(|oldest| deadline(oldest, self.settings.flush_interval));
        let retry_at = self
            .backoff
            .iter()
            .filter_map(|batch| batch.not_before)
            .min();

        match (flush_at, retry_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn start(&mut self, mut batch: Batch) -> Option<Attempt> {
        batch.attempt += 1;
        batch.not_before = None;
        for entry in batch.entries.iter_mut() {
            entry.context.record_attempt();
        }

        let body = match encode(&batch.entries) {
            Ok(body) => body,
            Err(e) => {
                error!(batch = batch.id, "failed to encode batch: {}", e);
                let failure = ContextError::Delivery {
                    attempts: batch.attempt,
                    status: None,
                    message: format!("failed to encode batch: {}", e),
                };
                self.fail_batch(batch, failure, false);
                return None;
            }
        };

        self.emitter
            .emit_with(NotificationKind::Flushed, || Notification::Flushed {
                attempt: batch.attempt,
                events: batch
                    .entries
                    .iter()
                    .map(|entry| entry.context.event().clone())
                    .collect(),
            });
        metrics::counter!("analytics_batches_sent_total").increment(1);
        metrics::histogram!("analytics_batch_size").record(batch.entries.len() as f64);
        debug!(
            batch = batch.id,
            attempt = batch.attempt,
            events = batch.entries.len(),
            "sending batch"
        );

        let request = HttpRequest {
            url: self.settings.endpoint.clone(),
            method: Method::POST,
            headers: self.settings.headers.clone(),
            body,
        };
        let client = self.client.clone();
        let timeout = self.settings.request_timeout;
        let id = batch.id;
        self.sending.insert(id, batch);

        Some(
            send(client, request, timeout)
                .map(move |result| (id, result))
                .boxed(),
        )
    }

    fn settle(&mut self, id: u64, result: Result<(), DeliveryError>) {
        let Some(batch) = self.sending.remove(&id) else {
            return;
        };

        match result {
            Ok(()) => self.ack(batch),
            Err(error) => {
                warn!(
                    batch = id,
                    attempt = batch.attempt,
                    "batch delivery failed: {}",
                    error
                );
                self.emitter
                    .emit_with(NotificationKind::HttpError, || Notification::HttpError {
                        status: error.status(),
                        message: error.to_string(),
                    });
                self.retry(batch, error);
            }
        }
    }

    /// Settle every context of a delivered batch as successful.
    pub(crate) fn ack(&mut self, batch: Batch) {
        metrics::counter!("analytics_events_delivered_total")
            .increment(batch.entries.len() as u64);

        for Entry {
            seq, mut context, ..
        } in batch.entries
        {
            self.outstanding.remove(&seq);
            context.resolve();
            self.emitter
                .emit_with(NotificationKind::Delivered, || Notification::Delivered {
                    context: context.clone(),
                });
            self.plugins.run_after(&context);
        }
    }

    /// Schedule another attempt for a failed batch, or fail its contexts when the failure is
    /// terminal or the batch is out of attempts.
    pub(crate) fn retry(&mut self, mut batch: Batch, error: DeliveryError) {
        let failure = ContextError::Delivery {
            attempts: batch.attempt,
            status: error.status(),
            message: error.to_string(),
        };

        let retry_after = match &error {
            DeliveryError::Terminal { .. } => {
                self.fail_batch(batch, failure, false);
                return;
            }
            DeliveryError::Retryable { retry_after, .. } => *retry_after,
        };

        if batch.attempt >= self.settings.max_retries {
            warn!(
                batch = batch.id,
                attempts = batch.attempt,
                "giving up on batch, retries exhausted"
            );
            self.fail_batch(batch, failure, true);
            return;
        }

        let wait = self
            .settings
            .retry_policy
            .retry_interval(batch.attempt, retry_after);
        batch.not_before = Some(deadline(Instant::now(), wait));
        metrics::counter!("analytics_batch_retries_total").increment(1);
        debug!(batch = batch.id, attempt = batch.attempt, ?wait, "scheduled batch retry");

        let attempt = batch.attempt;
        for entry in batch.entries.iter_mut() {
            entry.context.set_failure(failure.clone());
            self.emitter
                .emit_with(NotificationKind::RetryScheduled, || {
                    Notification::RetryScheduled {
                        context: entry.context.clone(),
                        attempt,
                        wait,
                    }
                });
        }
        self.backoff.push(batch);
    }

    fn fail_batch(&mut self, batch: Batch, error: ContextError, exhausted: bool) {
        for entry in batch.entries {
            self.outstanding.remove(&entry.seq);
            self.fail(entry.context, error.clone(), exhausted);
        }
    }

    fn fail(&self, mut context: Context, error: ContextError, exhausted: bool) {
        metrics::counter!("analytics_events_failed_total").increment(1);
        context.set_failure(error.clone());

        if exhausted {
            self.emitter
                .emit_with(NotificationKind::RetryExhausted, || {
                    Notification::RetryExhausted {
                        context: context.clone(),
                        error: error.clone(),
                    }
                });
        } else {
            self.emitter
                .emit_with(NotificationKind::Failed, || Notification::Failed {
                    context: context.clone(),
                    error: error.clone(),
                });
        }

        context.resolve_failed(error);
        self.plugins.run_after(&context);
    }

    fn discard_all(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        self.pending_bytes = 0;
        self.oldest_pending = None;

        let mut batches: Vec<Batch> = self
            .ready
            .drain(..)
            .chain(self.backoff.drain(..))
            .chain(self.sending.drain().map(|(_, batch)| batch))
            .collect();
        batches.sort_by_key(|batch| batch.id);

        let entries: Vec<Entry> = pending
            .into_iter()
            .chain(batches.into_iter().flat_map(|batch| batch.entries))
            .collect();
        if !entries.is_empty() {
            warn!(events = entries.len(), "discarding undelivered events");
        }

        for entry in entries {
            self.outstanding.remove(&entry.seq);
            self.fail(entry.context, ContextError::Discarded, false);
        }
    }

    fn notify_waiters(&mut self) {
        if self.waiters.is_empty() {
            return;
        }

        let settled_upto = self
            .outstanding
            .first()
            .copied()
            .unwrap_or(self.next_seq);
        let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|(upto, _)| *upto <= settled_upto);
        self.waiters = waiting;

        for (_, done) in done {
            _ = done.send(());
        }
    }
}

fn encode(entries: &[Entry]) -> serde_json::Result<Bytes> {
    let payload = Payload {
        batch: entries.iter().map(|entry| entry.payload.as_ref()).collect(),
        sent_at: format_timestamp(&Utc::now()),
    };

    serde_json::to_vec(&payload).map(Bytes::from)
}

/// `from + wait`, saturating to a deadline that never fires in practice.
fn deadline(from: Instant, wait: time::Duration) -> Instant {
    from.checked_add(wait)
        .unwrap_or_else(|| from + FAR_FUTURE)
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// One delivery attempt, bounded by `timeout` through a cooperative cancellation signal.
#[instrument(skip_all)]
async fn send(
    client: Arc<dyn HttpClient>,
    request: HttpRequest,
    timeout: time::Duration,
) -> Result<(), DeliveryError> {
    let signal = abort_signal_after_timeout(timeout);
    let token = signal.token();

    let result = tokio::select! {
        result = client.send(request, signal.token()) => result,
        _ = token.cancelled() => Err(TransportError::Timeout),
    };
    let result = match result {
        Err(TransportError::Cancelled) if signal.is_aborted() => Err(TransportError::Timeout),
        result => result,
    };

    classify(result)
}
