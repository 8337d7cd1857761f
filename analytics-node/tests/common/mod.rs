#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use analytics_node::error::TransportError;
use analytics_node::http_client::{HttpClient, HttpRequest, HttpResponse};
use analytics_node::Settings;
use async_trait::async_trait;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

static TRACING_INIT: Once = Once::new();

pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

/// How the `RecordingClient` answers one request.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16),
    RetryAfter(u16, Duration),
    /// Answer with the status after a delay, unless cancelled first.
    Delayed(Duration, u16),
    /// Never answer. Only cancellation ends the request.
    Hang,
    NetworkError,
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub headers: HeaderMap,
    pub body: Value,
    pub at: Instant,
}

/// An in-memory transport that answers from a script and records every request.
pub struct RecordingClient {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    requests: Mutex<Vec<Recorded>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl RecordingClient {
    /// A client that accepts every batch.
    pub fn new() -> Arc<Self> {
        Self::scripted(Vec::new(), Reply::Status(200))
    }

    /// A client that answers with `replies` in order, then with `fallback`.
    pub fn scripted(replies: Vec<Reply>, fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(replies.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// The events of every request, in the order requests were made.
    pub fn batches(&self) -> Vec<Vec<Value>> {
        self.requests()
            .into_iter()
            .map(|request| request.body["batch"].as_array().cloned().unwrap_or_default())
            .collect()
    }

    /// The `event` field of every event in every batch.
    pub fn event_names(&self) -> Vec<Vec<String>> {
        self.batches()
            .into_iter()
            .map(|batch| {
                batch
                    .iter()
                    .filter_map(|event| event["event"].as_str().map(str::to_owned))
                    .collect()
            })
            .collect()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_reply(&self) -> Reply {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn respond(status: u16, retry_after: Option<Duration>) -> Result<HttpResponse, TransportError> {
    Ok(HttpResponse {
        status: StatusCode::from_u16(status).unwrap(),
        retry_after,
    })
}

#[async_trait]
impl HttpClient for RecordingClient {
    async fn send(
        &self,
        request: HttpRequest,
        signal: CancellationToken,
    ) -> Result<HttpResponse, TransportError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        self.requests.lock().unwrap().push(Recorded {
            headers: request.headers.clone(),
            body: serde_json::from_slice(&request.body).unwrap(),
            at: Instant::now(),
        });

        match self.next_reply() {
            Reply::Status(status) => respond(status, None),
            Reply::RetryAfter(status, after) => respond(status, Some(after)),
            Reply::Delayed(delay, status) => tokio::select! {
                _ = tokio::time::sleep(delay) => respond(status, None),
                _ = signal.cancelled() => Err(TransportError::Cancelled),
            },
            Reply::Hang => {
                signal.cancelled().await;
                Err(TransportError::Cancelled)
            }
            Reply::NetworkError => Err(TransportError::Request("connection reset".to_owned())),
        }
    }
}

/// Settings pointing at a local host, delivering through `client`.
pub fn settings(client: Arc<RecordingClient>) -> Settings {
    Settings::new("__TEST__")
        .host("http://localhost:3000")
        .http_client(client)
}

pub fn basic_auth(write_key: &str) -> HeaderValue {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{}:", write_key));
    HeaderValue::from_str(&format!("Basic {}", encoded)).unwrap()
}

pub fn authorization(recorded: &Recorded) -> Option<&HeaderValue> {
    recorded.headers.get(header::AUTHORIZATION)
}

pub async fn assert_or_retry<F>(check: F)
where
    F: Fn() -> bool,
{
    assert_or_retry_for_duration(check, Duration::from_secs(5)).await
}

pub async fn assert_or_retry_for_duration<F>(check: F, timeout: Duration)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !check() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(check())
}
