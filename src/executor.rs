//! VU executor: spawns one task per virtual user, drives iterations through
//! the sequencer, and collapses everything into a single [`RunResult`].
//!
//! Each VU owns its session and its RNG. The check log and the sample log
//! are the only shared state, and both are append-only. Thresholds are
//! evaluated exactly once, after every VU task has been joined.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::checks::CheckEvaluator;
use crate::client::HttpClient;
use crate::credentials::{Credential, CredentialError, CredentialSource};
use crate::metrics::{Aggregator, TagStats, ThresholdResult};
use crate::scenario::{Scenario, StepContext};
use crate::sequencer::{run_iteration, IterationStatus};
use crate::session::Session;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid run options: {0}")]
    InvalidOptions(String),

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("VU task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Knobs for one run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub vu_count: usize,
    pub iterations_per_vu: usize,
    pub max_duration: Duration,
    /// Seed for reproducible runs. `None` seeds each VU from entropy.
    pub seed: Option<u64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            vu_count: 1,
            iterations_per_vu: 1,
            max_duration: Duration::from_secs(60),
            seed: None,
        }
    }
}

/// Lifecycle of one VU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuState {
    /// Spawned but not yet iterating. Summaries never carry this state;
    /// a VU reports only after it reaches a terminal state.
    Idle,
    Running,
    /// All iterations ran to the end of the step sequence.
    Completed,
    /// At least one iteration was cut short by an aborting step.
    Aborted,
    /// The run deadline expired while this VU still had work.
    TimedOut,
}

/// Terminal report for one VU.
#[derive(Debug, Clone)]
pub struct VuSummary {
    pub vu_id: usize,
    pub state: VuState,
    pub iterations_completed: usize,
    pub aborted_iterations: usize,
}

/// Everything a caller needs to judge the run.
#[derive(Debug)]
pub struct RunResult {
    pub all_checks_passed: bool,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub threshold_results: Vec<ThresholdResult>,
    pub sample_count: usize,
    pub tag_stats: Vec<TagStats>,
    pub vus: Vec<VuSummary>,
    pub elapsed: Duration,
}

impl RunResult {
    /// Thresholds are the pass/fail contract of a run; failing checks only
    /// sink the run through the failure-rate threshold they feed.
    pub fn success(&self) -> bool {
        self.threshold_results.iter().all(|result| result.passed)
    }

    pub fn check_pass_rate(&self) -> f64 {
        let total = self.checks_passed + self.checks_failed;
        if total == 0 {
            return 1.0;
        }
        self.checks_passed as f64 / total as f64
    }
}

/// Owns the scenario, the transport, and the credential source for a run.
pub struct Engine {
    base_url: String,
    scenario: Arc<Scenario>,
    client: Arc<dyn HttpClient>,
    credentials: Arc<CredentialSource>,
}

impl Engine {
    pub fn new(
        base_url: impl Into<String>,
        scenario: Scenario,
        client: Arc<dyn HttpClient>,
        credentials: CredentialSource,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            scenario: Arc::new(scenario),
            client,
            credentials: Arc::new(credentials),
        }
    }

    /// Run the scenario to completion and evaluate thresholds once.
    pub async fn run(&self, options: RunOptions) -> Result<RunResult, EngineError> {
        if options.vu_count == 0 {
            return Err(EngineError::InvalidOptions("vu_count must be at least 1".into()));
        }
        if options.iterations_per_vu == 0 {
            return Err(EngineError::InvalidOptions(
                "iterations_per_vu must be at least 1".into(),
            ));
        }
        if let Some(pool_size) = self.credentials.pool_size() {
            if options.vu_count > pool_size {
                return Err(EngineError::Credential(CredentialError::PoolExhausted {
                    vu_id: pool_size,
                    available: pool_size,
                }));
            }
        }

        info!(
            scenario = %self.scenario.name,
            vus = options.vu_count,
            iterations_per_vu = options.iterations_per_vu,
            max_duration_secs = options.max_duration.as_secs(),
            seeded = options.seed.is_some(),
            "starting run"
        );

        let checks = Arc::new(CheckEvaluator::new());
        let metrics = Arc::new(Aggregator::new());
        let started = Instant::now();
        let deadline = started + options.max_duration;

        let mut handles = Vec::with_capacity(options.vu_count);
        for vu_id in 0..options.vu_count {
            let mut rng = match options.seed {
                Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(vu_id as u64)),
                None => StdRng::from_entropy(),
            };
            let credential = self.credentials.credential_for(vu_id, &mut rng)?;

            let scenario = Arc::clone(&self.scenario);
            let client = Arc::clone(&self.client);
            let checks = Arc::clone(&checks);
            let metrics = Arc::clone(&metrics);
            let base_url = self.base_url.clone();
            let iterations = options.iterations_per_vu;

            handles.push(tokio::spawn(async move {
                drive_vu(
                    vu_id,
                    scenario,
                    client,
                    checks,
                    metrics,
                    base_url,
                    credential,
                    rng,
                    iterations,
                    deadline,
                )
                .await
            }));
        }

        let mut vus = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(summary) => vus.push(summary),
                Err(join_error) => {
                    error!(error = %join_error, "VU task failed");
                    return Err(EngineError::Join(join_error));
                }
            }
        }

        let elapsed = started.elapsed();
        let threshold_results = metrics.evaluate(&self.scenario.thresholds);
        let (checks_passed, checks_failed) = checks.counts();
        for result in &threshold_results {
            if result.passed {
                debug!(threshold = %result.threshold, "threshold passed");
            } else {
                warn!(
                    threshold = %result.threshold,
                    observed = ?result.observed,
                    "threshold failed"
                );
            }
        }
        info!(
            elapsed_secs = elapsed.as_secs_f64(),
            samples = metrics.sample_count(),
            checks_passed,
            checks_failed,
            "run finished"
        );

        Ok(RunResult {
            all_checks_passed: checks_failed == 0,
            checks_passed,
            checks_failed,
            threshold_results,
            sample_count: metrics.sample_count(),
            tag_stats: metrics.tag_stats(),
            vus,
            elapsed,
        })
    }
}

/// One VU's whole life: a fresh session, then `iterations` trips through the
/// step sequence. The session persists across iterations, like a browser
/// left open between user journeys.
#[allow(clippy::too_many_arguments)]
async fn drive_vu(
    vu_id: usize,
    scenario: Arc<Scenario>,
    client: Arc<dyn HttpClient>,
    checks: Arc<CheckEvaluator>,
    metrics: Arc<Aggregator>,
    base_url: String,
    credential: Credential,
    mut rng: StdRng,
    iterations: usize,
    deadline: Instant,
) -> VuSummary {
    let mut state = VuState::Running;
    let mut session = Session::new();
    let mut iterations_completed = 0;
    let mut aborted_iterations = 0;

    debug!(vu_id, username = %credential.username, "VU starting");

    for iteration in 0..iterations {
        if Instant::now() >= deadline {
            state = VuState::TimedOut;
            break;
        }

        let mut cx = StepContext {
            client: client.as_ref(),
            session: &mut session,
            checks: &checks,
            metrics: &metrics,
            base_url: &base_url,
            credential: &credential,
            vu_id,
        };

        let outcome = run_iteration(&scenario, &mut cx, &mut rng, deadline).await;
        match outcome.status {
            IterationStatus::Completed => {
                iterations_completed += 1;
            }
            IterationStatus::Aborted { step } => {
                warn!(vu_id, iteration, step = %step, "iteration aborted");
                iterations_completed += 1;
                aborted_iterations += 1;
            }
            IterationStatus::DeadlineExceeded => {
                state = VuState::TimedOut;
                break;
            }
        }
    }

    if state != VuState::TimedOut {
        state = if aborted_iterations > 0 {
            VuState::Aborted
        } else {
            VuState::Completed
        };
    }

    debug!(
        vu_id,
        ?state,
        iterations_completed,
        aborted_iterations,
        "VU finished"
    );

    VuSummary {
        vu_id,
        state,
        iterations_completed,
        aborted_iterations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, HttpResponse};
    use crate::metrics::Threshold;
    use crate::scenario::{Step, StepAction, StepGroup, StepOutcome};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopClient;

    #[async_trait]
    impl HttpClient for NoopClient {
        async fn get(
            &self,
            _url: &str,
            _headers: &[(String, String)],
            _session: &Session,
        ) -> Result<HttpResponse, ClientError> {
            Err(ClientError::Other("noop".to_string()))
        }

        async fn post(
            &self,
            _url: &str,
            _body: Option<String>,
            _headers: &[(String, String)],
            _session: &Session,
        ) -> Result<HttpResponse, ClientError> {
            Err(ClientError::Other("noop".to_string()))
        }
    }

    /// Records a fast sample per execution; optionally aborts on VU 0.
    struct RecordingStep {
        executions: Arc<AtomicUsize>,
        abort_on_vu_zero: bool,
    }

    #[async_trait]
    impl StepAction for RecordingStep {
        async fn execute(&self, cx: &mut StepContext<'_>) -> StepOutcome {
            self.executions.fetch_add(1, Ordering::SeqCst);
            cx.metrics.record("recorded", 5.0, false);
            let outcome = StepOutcome::local();
            if self.abort_on_vu_zero && cx.vu_id == 0 {
                outcome.abort()
            } else {
                outcome
            }
        }
    }

    struct SlowStep;

    #[async_trait]
    impl StepAction for SlowStep {
        async fn execute(&self, _cx: &mut StepContext<'_>) -> StepOutcome {
            tokio::time::sleep(Duration::from_millis(200)).await;
            StepOutcome::local()
        }
    }

    fn single_step_scenario(action: impl StepAction + 'static) -> Scenario {
        Scenario {
            name: "executor-test".to_string(),
            groups: vec![StepGroup::new("g", vec![Step::new("s", action)])],
            thresholds: vec![],
            think_time: None,
        }
    }

    fn engine_for(scenario: Scenario) -> Engine {
        Engine::new(
            "https://test.invalid",
            scenario,
            Arc::new(NoopClient),
            CredentialSource::Generated,
        )
    }

    #[tokio::test]
    async fn runs_every_vu_for_every_iteration() {
        let executions = Arc::new(AtomicUsize::new(0));
        let engine = engine_for(single_step_scenario(RecordingStep {
            executions: executions.clone(),
            abort_on_vu_zero: false,
        }));

        let result = engine
            .run(RunOptions {
                vu_count: 3,
                iterations_per_vu: 2,
                max_duration: Duration::from_secs(30),
                seed: Some(7),
            })
            .await
            .unwrap();

        assert_eq!(executions.load(Ordering::SeqCst), 6);
        assert_eq!(result.sample_count, 6);
        assert_eq!(result.vus.len(), 3);
        for vu in &result.vus {
            assert_eq!(vu.state, VuState::Completed);
            assert_eq!(vu.iterations_completed, 2);
            assert_eq!(vu.aborted_iterations, 0);
        }
        assert!(result.success());
    }

    #[tokio::test]
    async fn aborting_vu_does_not_disturb_the_others() {
        let executions = Arc::new(AtomicUsize::new(0));
        let engine = engine_for(single_step_scenario(RecordingStep {
            executions: executions.clone(),
            abort_on_vu_zero: true,
        }));

        let result = engine
            .run(RunOptions {
                vu_count: 2,
                iterations_per_vu: 3,
                max_duration: Duration::from_secs(30),
                seed: Some(7),
            })
            .await
            .unwrap();

        let vu0 = result.vus.iter().find(|v| v.vu_id == 0).unwrap();
        let vu1 = result.vus.iter().find(|v| v.vu_id == 1).unwrap();
        assert_eq!(vu0.state, VuState::Aborted);
        assert_eq!(vu0.aborted_iterations, 3);
        // An aborted iteration still counts as a finished trip.
        assert_eq!(vu0.iterations_completed, 3);
        assert_eq!(vu1.state, VuState::Completed);
        assert_eq!(vu1.aborted_iterations, 0);
    }

    #[tokio::test]
    async fn deadline_marks_vus_timed_out() {
        let engine = engine_for(single_step_scenario(SlowStep));

        let result = engine
            .run(RunOptions {
                vu_count: 1,
                iterations_per_vu: 50,
                max_duration: Duration::from_millis(50),
                seed: Some(1),
            })
            .await
            .unwrap();

        assert_eq!(result.vus[0].state, VuState::TimedOut);
        assert!(result.vus[0].iterations_completed < 50);
    }

    #[tokio::test]
    async fn pool_smaller_than_vu_count_is_rejected_up_front() {
        let executions = Arc::new(AtomicUsize::new(0));
        let scenario = single_step_scenario(RecordingStep {
            executions: executions.clone(),
            abort_on_vu_zero: false,
        });
        let pool = CredentialSource::Pool(vec![Credential {
            username: "only-one".to_string(),
            password: "pw".to_string(),
        }]);
        let engine = Engine::new("https://test.invalid", scenario, Arc::new(NoopClient), pool);

        let err = engine
            .run(RunOptions {
                vu_count: 2,
                iterations_per_vu: 1,
                max_duration: Duration::from_secs(5),
                seed: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::Credential(CredentialError::PoolExhausted { .. })
        ));
        assert_eq!(executions.load(Ordering::SeqCst), 0, "no VU should start");
    }

    #[tokio::test]
    async fn zero_vus_is_invalid() {
        let executions = Arc::new(AtomicUsize::new(0));
        let engine = engine_for(single_step_scenario(RecordingStep {
            executions,
            abort_on_vu_zero: false,
        }));

        let err = engine.run(RunOptions { vu_count: 0, ..Default::default() }).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidOptions(_)));
    }

    #[tokio::test]
    async fn thresholds_are_evaluated_against_recorded_samples() {
        let executions = Arc::new(AtomicUsize::new(0));
        let mut scenario = single_step_scenario(RecordingStep {
            executions,
            abort_on_vu_zero: false,
        });
        scenario.thresholds = vec![
            Threshold::global("rate<0.01").unwrap(),
            Threshold::global("p(95)<500").unwrap(),
            Threshold::tagged("recorded", "p(95)<10").unwrap(),
        ];
        let engine = engine_for(scenario);

        let result = engine
            .run(RunOptions {
                vu_count: 2,
                iterations_per_vu: 2,
                max_duration: Duration::from_secs(10),
                seed: Some(3),
            })
            .await
            .unwrap();

        assert_eq!(result.threshold_results.len(), 3);
        assert!(result.success());
        assert!(result.all_checks_passed);
        assert_eq!(result.check_pass_rate(), 1.0);
    }
}
