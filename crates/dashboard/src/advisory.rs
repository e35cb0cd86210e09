//! Soil advisory: the chat-completion client and the coordinator that
//! debounces requests and folds results into the dashboard state.
//!
//! ```text
//! Idle ──request──▶ Pending ──ok──▶ Fulfilled(text)
//!   ▲                  │
//!   └──── clear ───────┴──err──▶ Failed(reason)
//! ```
//!
//! Requests inside the debounce window (measured from the start of the last
//! accepted request) are ignored.  A result is discarded once a newer request
//! has been accepted, after `clear()`, or after engine shutdown.

use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::AdvisoryConfig;
use crate::error::AdvisoryError;
use crate::model::SensorReading;
use crate::state::{AdvisoryState, SharedState};

/// Minimum spacing between accepted advisory requests.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(30);

/// Shown when a completion comes back without content.
pub const EMPTY_COMPLETION: &str = "Unable to generate recommendation";

/// Failure reason used when the error carries no message of its own.
pub const GENERIC_FAILURE: &str = "Failed to fetch recommendations";

// ---------------------------------------------------------------------------
// Source trait
// ---------------------------------------------------------------------------

pub type AdvisoryFuture<'a> =
    Pin<Box<dyn Future<Output = Result<String, AdvisoryError>> + Send + 'a>>;

/// Anything that turns a sensor snapshot into advisory text.
pub trait AdvisorySource: Send + Sync {
    fn recommend<'a>(&'a self, reading: &'a SensorReading) -> AdvisoryFuture<'a>;
}

// ---------------------------------------------------------------------------
// OpenRouter (OpenAI-compatible chat completions) client
// ---------------------------------------------------------------------------

pub struct OpenRouterClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    api_key_env: String,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatContent,
}

#[derive(Deserialize)]
struct ChatContent {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorDetail {
    Object { message: String },
    Text(String),
}

impl OpenRouterClient {
    /// `api_key` of `None` yields a client whose requests fail with
    /// [`AdvisoryError::NotConfigured`].
    pub fn new(cfg: &AdvisoryConfig, api_key: Option<String>) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert("HTTP-Referer", HeaderValue::from_str(&cfg.referer)?);
        headers.insert("X-Title", HeaderValue::from_str(&cfg.title)?);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            api_key,
            api_key_env: cfg.api_key_env.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
        })
    }

    async fn complete(&self, reading: &SensorReading) -> Result<String, AdvisoryError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| AdvisoryError::NotConfigured(format!("{} is not set", self.api_key_env)))?;

        let prompt = prompt(reading);
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: &prompt,
            }],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let url = format!("{}/chat/completions", self.base_url);
        debug!(%url, model = %self.model, "requesting advisory");
        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(service_error(status.as_u16(), &text));
        }
        parse_completion(&text)
    }
}

impl AdvisorySource for OpenRouterClient {
    fn recommend<'a>(&'a self, reading: &'a SensorReading) -> AdvisoryFuture<'a> {
        Box::pin(self.complete(reading))
    }
}

/// The fixed prompt contract: concise actions as HTML restricted to
/// `<p>`, `<ul>`, `<li>` and `<strong>`.
pub fn prompt(r: &SensorReading) -> String {
    let npk = |f: fn(&crate::model::NutrientReading) -> f64| {
        r.npk
            .as_ref()
            .map(|n| format!("{}", f(n)))
            .unwrap_or_else(|| "n/a".to_string())
    };

    format!(
        "Based on soil data (moisture: {soil}%, temp: {temp}°C, humidity: {hum}%, \
NPK N:{n} P:{p} K:{k}, pH: {ph}, EC: {ec}), provide ONLY essential actions to improve soil health.

Be extremely concise. List only:
- 1-2 immediate actions needed
- Recommended fertilizer/nutrients if needed
- Irrigation adjustment if needed
- Timeline (days/weeks)

Do NOT repeat the input data or device info. Be direct and practical for farmers.

Return output as simple HTML using only <p>, <ul>, <li>, <strong>. No markdown, no additional text beyond the recommendations.",
        soil = r.soil,
        temp = r.temp,
        hum = r.hum,
        n = npk(|n| n.n),
        p = npk(|n| n.p),
        k = npk(|n| n.k),
        ph = npk(|n| n.ph),
        ec = npk(|n| n.ec),
    )
}

fn parse_completion(body: &str) -> Result<String, AdvisoryError> {
    let resp: ChatResponse =
        serde_json::from_str(body).map_err(|e| AdvisoryError::Decode(e.to_string()))?;
    let content = resp
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty());
    Ok(content.unwrap_or_else(|| EMPTY_COMPLETION.to_string()))
}

/// Prefer the service's own error message; fall back to the raw body.
fn service_error(status: u16, body: &str) -> AdvisoryError {
    let message = match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            error: ErrorDetail::Object { message },
        })
        | Ok(ErrorBody {
            error: ErrorDetail::Text(message),
        }) => message,
        Err(_) => body.trim().to_string(),
    };
    AdvisoryError::Service { status, message }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct AdvisoryCoordinator {
    source: Arc<dyn AdvisorySource>,
    shared: SharedState,
    min_interval: Duration,
    last_accepted: Mutex<Option<Instant>>,
    /// Bumped by every accepted request and by `clear()`; a fetch only
    /// applies if it still matches.
    generation: AtomicU64,
    shutdown: watch::Receiver<bool>,
}

impl AdvisoryCoordinator {
    pub fn new(
        source: Arc<dyn AdvisorySource>,
        shared: SharedState,
        min_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            shared,
            min_interval,
            last_accepted: Mutex::new(None),
            generation: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Start a fetch for `reading` unless one was accepted within the
    /// debounce window.  Returns the fetch task when accepted.
    pub async fn request(self: &Arc<Self>, reading: SensorReading) -> Option<JoinHandle<()>> {
        if *self.shutdown.borrow() {
            return None;
        }

        let now = Instant::now();
        {
            let mut last = self
                .last_accepted
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(prev) = *last {
                let since = now.duration_since(prev);
                if since < self.min_interval {
                    debug!(
                        wait_ms = (self.min_interval - since).as_millis() as u64,
                        "advisory request debounced"
                    );
                    return None;
                }
            }
            *last = Some(now);
        }

        // Each accepted request supersedes any fetch still in flight.
        let generation = {
            let mut st = self.shared.write().await;
            st.advisory = AdvisoryState::Pending;
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };
        info!(device = %reading.device, "fetching advisory");

        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            this.fetch(reading, generation).await;
        }))
    }

    /// Back to idle; any cached text or error is dropped and an in-flight
    /// result will not be applied.
    pub async fn clear(&self) {
        let mut st = self.shared.write().await;
        self.generation.fetch_add(1, Ordering::SeqCst);
        st.advisory = AdvisoryState::Idle;
    }

    async fn fetch(&self, reading: SensorReading, generation: u64) {
        let result = self.source.recommend(&reading).await;

        let mut st = self.shared.write().await;
        if *self.shutdown.borrow() || self.generation.load(Ordering::SeqCst) != generation {
            debug!("discarding stale advisory result");
            return;
        }
        st.advisory = match result {
            Ok(text) => {
                info!(len = text.len(), "advisory received");
                AdvisoryState::Fulfilled(text)
            }
            Err(e) => {
                warn!(status = ?e.status(), "advisory failed: {e}");
                AdvisoryState::Failed(failure_reason(&e))
            }
        };
    }
}

fn failure_reason(err: &AdvisoryError) -> String {
    match err {
        AdvisoryError::Service { message, .. } if message.trim().is_empty() => {
            GENERIC_FAILURE.to_string()
        }
        other => {
            let msg = other.to_string();
            if msg.trim().is_empty() {
                GENERIC_FAILURE.to_string()
            } else {
                msg
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
