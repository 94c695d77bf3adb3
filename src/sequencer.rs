//! Step sequencing for one VU iteration.
//!
//! Groups run in declaration order, steps strictly in order within a group.
//! An `aborts_sequence` outcome skips the rest of the current group and all
//! later groups for this iteration only; the abort is recorded and the VU
//! moves on to its next iteration. Aborts never fault the process and never
//! affect other VUs.

use rand::Rng;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::scenario::{Scenario, StepContext, StepOutcome};

/// How one iteration of the full group sequence ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationStatus {
    /// Every step ran.
    Completed,
    /// A step aborted the sequence; remaining steps were skipped.
    Aborted { step: String },
    /// The run deadline expired before the iteration finished. The partial
    /// iteration is discarded by the executor.
    DeadlineExceeded,
}

/// Per-iteration record of step outcomes in execution order.
#[derive(Debug)]
pub struct IterationOutcome {
    pub status: IterationStatus,
    pub steps: Vec<(String, StepOutcome)>,
}

/// Run every group of `scenario` once against the VU's context.
///
/// The deadline is checked immediately before each step; an in-flight step
/// is never pre-empted, but nothing further starts once the deadline has
/// passed. Think-time is inserted between steps (never before the first),
/// drawn from `rng` so seeded runs pace identically.
pub async fn run_iteration<R: Rng>(
    scenario: &Scenario,
    cx: &mut StepContext<'_>,
    rng: &mut R,
    deadline: Instant,
) -> IterationOutcome {
    let mut executed = Vec::new();
    let mut first = true;

    for group in &scenario.groups {
        debug!(vu_id = cx.vu_id, group = %group.name, "entering group");

        for step in &group.steps {
            if !first {
                if let Some(think) = scenario.think_time {
                    let delay = think.delay(rng);
                    debug!(
                        vu_id = cx.vu_id,
                        delay_ms = delay.as_millis() as u64,
                        "think time"
                    );
                    sleep(delay).await;
                }
            }
            first = false;

            if Instant::now() >= deadline {
                info!(
                    vu_id = cx.vu_id,
                    group = %group.name,
                    step = %step.name,
                    "deadline reached, abandoning iteration"
                );
                return IterationOutcome {
                    status: IterationStatus::DeadlineExceeded,
                    steps: executed,
                };
            }

            let outcome = step.action.execute(cx).await;
            let aborts = outcome.aborts_sequence;
            debug!(
                vu_id = cx.vu_id,
                step = %step.name,
                status = ?outcome.status,
                elapsed_ms = outcome.duration.as_millis() as u64,
                aborts,
                "step finished"
            );
            executed.push((step.name.clone(), outcome));

            if aborts {
                // Non-fatal: this iteration ends here, later groups included.
                warn!(
                    vu_id = cx.vu_id,
                    group = %group.name,
                    step = %step.name,
                    "step aborted the sequence"
                );
                return IterationOutcome {
                    status: IterationStatus::Aborted {
                        step: step.name.clone(),
                    },
                    steps: executed,
                };
            }
        }
    }

    IterationOutcome {
        status: IterationStatus::Completed,
        steps: executed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::CheckEvaluator;
    use crate::client::{ClientError, HttpClient, HttpResponse};
    use crate::credentials::Credential;
    use crate::metrics::Aggregator;
    use crate::scenario::{Step, StepAction, StepGroup};
    use crate::session::Session;
    use async_trait::async_trait;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Client that fails every request; sequencer tests never reach the wire.
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

    struct CountingStep {
        executions: Arc<AtomicUsize>,
        abort: bool,
    }

    #[async_trait]
    impl StepAction for CountingStep {
        async fn execute(&self, cx: &mut StepContext<'_>) -> StepOutcome {
            self.executions.fetch_add(1, Ordering::SeqCst);
            cx.metrics.record("counted", 1.0, false);
            let outcome = StepOutcome::local();
            if self.abort {
                outcome.abort()
            } else {
                outcome
            }
        }
    }

    fn scenario_with(groups: Vec<StepGroup>) -> Scenario {
        Scenario {
            name: "test".to_string(),
            groups,
            thresholds: vec![],
            think_time: None,
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    struct Harness {
        client: NoopClient,
        checks: CheckEvaluator,
        metrics: Aggregator,
        credential: Credential,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                client: NoopClient,
                checks: CheckEvaluator::new(),
                metrics: Aggregator::new(),
                credential: Credential {
                    username: "default".to_string(),
                    password: "12345678".to_string(),
                },
            }
        }

        fn context<'a>(&'a self, session: &'a mut Session) -> StepContext<'a> {
            StepContext {
                client: &self.client,
                session,
                checks: &self.checks,
                metrics: &self.metrics,
                base_url: "https://test.invalid",
                credential: &self.credential,
                vu_id: 0,
            }
        }
    }

    #[tokio::test]
    async fn steps_run_in_declaration_order_across_groups() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        struct Recorder {
            order: Arc<std::sync::Mutex<Vec<&'static str>>>,
            tag: &'static str,
        }

        #[async_trait]
        impl StepAction for Recorder {
            async fn execute(&self, _cx: &mut StepContext<'_>) -> StepOutcome {
                self.order.lock().unwrap().push(self.tag);
                StepOutcome::local()
            }
        }

        let scenario = scenario_with(vec![
            StepGroup::new(
                "g1",
                vec![
                    Step::new("a", Recorder { order: order.clone(), tag: "a" }),
                    Step::new("b", Recorder { order: order.clone(), tag: "b" }),
                ],
            ),
            StepGroup::new(
                "g2",
                vec![Step::new("c", Recorder { order: order.clone(), tag: "c" })],
            ),
        ]);

        let harness = Harness::new();
        let mut session = Session::new();
        let mut cx = harness.context(&mut session);
        let mut rng = StdRng::seed_from_u64(1);

        let outcome = run_iteration(&scenario, &mut cx, &mut rng, far_deadline()).await;

        assert_eq!(outcome.status, IterationStatus::Completed);
        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(outcome.steps.len(), 3);
    }

    #[tokio::test]
    async fn abort_skips_remaining_steps_and_later_groups() {
        let before = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));

        let scenario = scenario_with(vec![
            StepGroup::new(
                "auth",
                vec![
                    Step::new(
                        "csrf",
                        CountingStep {
                            executions: before.clone(),
                            abort: true,
                        },
                    ),
                    Step::new(
                        "login",
                        CountingStep {
                            executions: after.clone(),
                            abort: false,
                        },
                    ),
                ],
            ),
            StepGroup::new(
                "business",
                vec![Step::new(
                    "pizza",
                    CountingStep {
                        executions: after.clone(),
                        abort: false,
                    },
                )],
            ),
        ]);

        let harness = Harness::new();
        let mut session = Session::new();
        let mut cx = harness.context(&mut session);
        let mut rng = StdRng::seed_from_u64(1);

        let outcome = run_iteration(&scenario, &mut cx, &mut rng, far_deadline()).await;

        assert_eq!(
            outcome.status,
            IterationStatus::Aborted {
                step: "csrf".to_string()
            }
        );
        assert_eq!(before.load(Ordering::SeqCst), 1);
        assert_eq!(after.load(Ordering::SeqCst), 0, "skipped steps must not run");
        // Skipped steps produce no samples either.
        assert_eq!(harness.metrics.sample_count(), 1);
        assert_eq!(outcome.steps.len(), 1);
    }

    #[tokio::test]
    async fn expired_deadline_stops_before_next_step() {
        let executions = Arc::new(AtomicUsize::new(0));
        let scenario = scenario_with(vec![StepGroup::new(
            "g",
            vec![Step::new(
                "never",
                CountingStep {
                    executions: executions.clone(),
                    abort: false,
                },
            )],
        )]);

        let harness = Harness::new();
        let mut session = Session::new();
        let mut cx = harness.context(&mut session);
        let mut rng = StdRng::seed_from_u64(1);

        let past = Instant::now() - Duration::from_millis(1);
        let outcome = run_iteration(&scenario, &mut cx, &mut rng, past).await;

        assert_eq!(outcome.status, IterationStatus::DeadlineExceeded);
        assert_eq!(executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn think_time_is_applied_between_steps() {
        let executions = Arc::new(AtomicUsize::new(0));
        let mut scenario = scenario_with(vec![StepGroup::new(
            "g",
            vec![
                Step::new(
                    "one",
                    CountingStep {
                        executions: executions.clone(),
                        abort: false,
                    },
                ),
                Step::new(
                    "two",
                    CountingStep {
                        executions: executions.clone(),
                        abort: false,
                    },
                ),
            ],
        )]);
        scenario.think_time = Some(crate::scenario::ThinkTime::Fixed(Duration::from_millis(80)));

        let harness = Harness::new();
        let mut session = Session::new();
        let mut cx = harness.context(&mut session);
        let mut rng = StdRng::seed_from_u64(1);

        let started = std::time::Instant::now();
        run_iteration(&scenario, &mut cx, &mut rng, far_deadline()).await;
        let elapsed = started.elapsed();

        assert_eq!(executions.load(Ordering::SeqCst), 2);
        // One gap between two steps, none before the first.
        assert!(elapsed >= Duration::from_millis(80));
        assert!(elapsed < Duration::from_millis(160));
    }
}
