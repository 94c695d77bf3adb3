//! Scenario definitions: grouped steps over a per-VU session.
//!
//! A [`Scenario`] is an ordered list of named groups, each an ordered list of
//! [`Step`]s. Step definitions are immutable and shared read-only across all
//! virtual users; all mutable state lives in the per-VU [`Session`] that the
//! [`StepContext`] hands to each step.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tracing::warn;

use crate::checks::CheckEvaluator;
use crate::client::{url_host, ClientError, HttpClient, HttpResponse};
use crate::credentials::Credential;
use crate::metrics::{Aggregator, Threshold};
use crate::session::Session;

/// Pacing delay between steps, simulating a human reading or deciding.
///
/// Randomized delays draw from the caller-supplied RNG so that seeded runs
/// reproduce their pacing exactly.
#[derive(Debug, Clone, Copy)]
pub enum ThinkTime {
    Fixed(Duration),
    Random { min: Duration, max: Duration },
}

impl ThinkTime {
    pub fn delay<R: Rng>(&self, rng: &mut R) -> Duration {
        match self {
            ThinkTime::Fixed(duration) => *duration,
            ThinkTime::Random { min, max } => {
                let min_ms = min.as_millis() as u64;
                let max_ms = max.as_millis() as u64;
                if min_ms >= max_ms {
                    return *min;
                }
                Duration::from_millis(rng.gen_range(min_ms..=max_ms))
            }
        }
    }
}

/// Result of one step execution.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    /// HTTP status of the step's (last) call; `None` for transport failures
    /// and for steps that made no request.
    pub status: Option<u16>,
    /// Elapsed time of the step's call, zero for purely local steps.
    pub duration: Duration,
    /// Ordered (assertion name, passed) pairs recorded by this step.
    pub checks: Vec<(String, bool)>,
    /// When set, the sequencer skips every remaining step in this iteration.
    pub aborts_sequence: bool,
}

impl StepOutcome {
    pub fn from_response(response: &HttpResponse) -> Self {
        Self {
            status: Some(response.status),
            duration: response.elapsed,
            ..Self::default()
        }
    }

    /// Transport failure: no status, nothing to report but the checks.
    pub fn transport_failure() -> Self {
        Self::default()
    }

    /// A step that performed no HTTP call (e.g. cookie injection).
    pub fn local() -> Self {
        Self::default()
    }

    pub fn with_checks(mut self, checks: Vec<(String, bool)>) -> Self {
        self.checks = checks;
        self
    }

    /// Mark the iteration as aborted after this step.
    pub fn abort(mut self) -> Self {
        self.aborts_sequence = true;
        self
    }
}

/// Everything a step may touch while executing: the transport, its VU's
/// session, the shared check log and sample log, and the VU's identity.
pub struct StepContext<'a> {
    pub client: &'a dyn HttpClient,
    pub session: &'a mut Session,
    pub checks: &'a CheckEvaluator,
    pub metrics: &'a Aggregator,
    pub base_url: &'a str,
    pub credential: &'a Credential,
    pub vu_id: usize,
}

impl StepContext<'_> {
    /// Resolve a path against the scenario base URL. Absolute URLs pass
    /// through untouched.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}{}", self.base_url, path)
        }
    }

    /// GET through the shared client. Records one tagged sample and folds
    /// response cookies back into the session.
    pub async fn get(
        &mut self,
        path: &str,
        headers: &[(&str, &str)],
        tag: &str,
    ) -> Result<HttpResponse, ClientError> {
        let url = self.url(path);
        let headers = own_headers(headers);
        let started = Instant::now();
        let result = self.client.get(&url, &headers, self.session).await;
        self.finish(tag, &url, started, result)
    }

    /// POST through the shared client. Same sample/cookie handling as `get`.
    pub async fn post(
        &mut self,
        path: &str,
        body: Option<String>,
        headers: &[(&str, &str)],
        tag: &str,
    ) -> Result<HttpResponse, ClientError> {
        let url = self.url(path);
        let headers = own_headers(headers);
        let started = Instant::now();
        let result = self.client.post(&url, body, &headers, self.session).await;
        self.finish(tag, &url, started, result)
    }

    fn finish(
        &mut self,
        tag: &str,
        url: &str,
        started: Instant,
        result: Result<HttpResponse, ClientError>,
    ) -> Result<HttpResponse, ClientError> {
        match result {
            Ok(response) => {
                self.metrics.record(
                    tag,
                    response.elapsed.as_secs_f64() * 1000.0,
                    response.is_failure(),
                );

                // Fold Set-Cookie records into the VU's jar. Host-only
                // cookies are scoped to the responding host.
                let host = url_host(url).to_string();
                for (name, records) in &response.cookies {
                    if let Some(record) = records.last() {
                        let domain = if record.attrs.domain.is_empty() {
                            host.as_str()
                        } else {
                            record.attrs.domain.as_str()
                        };
                        self.session
                            .set_cookie(domain, name, &record.value, record.attrs.clone());
                    }
                }
                Ok(response)
            }
            Err(error) => {
                warn!(
                    vu_id = self.vu_id,
                    tag,
                    kind = error.kind(),
                    error = %error,
                    "transport failure"
                );
                self.metrics
                    .record(tag, started.elapsed().as_secs_f64() * 1000.0, true);
                Err(error)
            }
        }
    }
}

fn own_headers(headers: &[(&str, &str)]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

/// One unit of user behavior: issue a call, update the session, run checks.
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn execute(&self, cx: &mut StepContext<'_>) -> StepOutcome;
}

/// Immutable step definition, shared read-only across all VUs.
#[derive(Clone)]
pub struct Step {
    pub name: String,
    pub action: Arc<dyn StepAction>,
}

impl Step {
    pub fn new(name: &str, action: impl StepAction + 'static) -> Self {
        Self {
            name: name.to_string(),
            action: Arc::new(action),
        }
    }
}

/// Named ordered group of steps.
#[derive(Clone)]
pub struct StepGroup {
    pub name: String,
    pub steps: Vec<Step>,
}

impl StepGroup {
    pub fn new(name: &str, steps: Vec<Step>) -> Self {
        Self {
            name: name.to_string(),
            steps,
        }
    }
}

/// A full user journey plus the thresholds it is judged against.
#[derive(Clone)]
pub struct Scenario {
    pub name: String,
    pub groups: Vec<StepGroup>,
    pub thresholds: Vec<Threshold>,
    pub think_time: Option<ThinkTime>,
}
