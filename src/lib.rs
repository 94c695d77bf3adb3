//! stepload: an authenticated multi-step workflow load-test engine.
//!
//! A [`Scenario`](scenario::Scenario) is an ordered list of step groups. The
//! [`Engine`](executor::Engine) runs it with N virtual users, each owning a
//! private [`Session`](session::Session) of cookies and cached tokens.
//! Checks and timing samples land in shared append-only logs; thresholds
//! like `p(95)<500` or `rate<0.01` are judged once, when the run ends.

pub mod checks;
pub mod client;
pub mod config;
pub mod credentials;
pub mod executor;
pub mod metrics;
pub mod pizza;
pub mod scenario;
pub mod sequencer;
pub mod session;

pub use checks::{CheckEvaluator, CheckRecord};
pub use client::{ClientError, HttpClient, HttpResponse, ReqwestClient};
pub use credentials::{Credential, CredentialError, CredentialSource};
pub use executor::{Engine, EngineError, RunOptions, RunResult, VuState, VuSummary};
pub use metrics::{Aggregator, Sample, Threshold, ThresholdExpr, ThresholdResult};
pub use scenario::{Scenario, Step, StepAction, StepContext, StepGroup, StepOutcome, ThinkTime};
pub use sequencer::{IterationOutcome, IterationStatus};
pub use session::{CookieAttributes, CookieRecord, SameSite, Session};
