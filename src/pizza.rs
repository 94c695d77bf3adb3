//! The QuickPizza user journey: fetch a CSRF token, log in, carry the
//! session cookie, then ask for a pizza recommendation and rate it.
//!
//! Step tags double as sample tags, so every threshold in
//! [`pizza_scenario`] lines up with exactly one step's traffic.

use serde_json::{json, Value};
use tracing::warn;

use crate::client::url_host;
use crate::metrics::Threshold;
use crate::scenario::{
    Scenario, Step, StepAction, StepContext, StepGroup, StepOutcome, ThinkTime,
};
use crate::session::{CookieAttributes, SameSite};
use async_trait::async_trait;

const TAG_CSRF: &str = "00_GetCsrfToken";
const TAG_LOGIN: &str = "01_LoginAction";
const TAG_RATINGS: &str = "02_RatingsAfterLogin";
const TAG_HOME: &str = "03_HomeWithAuth";
const TAG_PIZZA: &str = "04_GetPizzaSuggestion";
const TAG_RATING_POST: &str = "05_PostRating";

const CSRF_COOKIE: &str = "csrf_token";
const SESSION_COOKIE: &str = "qp_user_token";

/// Obtain a CSRF token. The server answers with a `csrf_token` cookie; a
/// missing cookie means nothing downstream can authenticate, so the rest of
/// the iteration is skipped.
pub struct FetchCsrfToken;

#[async_trait]
impl StepAction for FetchCsrfToken {
    async fn execute(&self, cx: &mut StepContext<'_>) -> StepOutcome {
        let result = cx.post("/api/csrf-token", None, &[], TAG_CSRF).await;

        let response = match result {
            Ok(response) => response,
            Err(_) => {
                let checks = cx
                    .checks
                    .check(TAG_CSRF, None)
                    .assert("csrf cookie present", |_| true)
                    .into_results();
                return StepOutcome::transport_failure().with_checks(checks).abort();
            }
        };

        // The token must come from this response's Set-Cookie, not the jar:
        // the session outlives the iteration, and a stale cookie from an
        // earlier iteration must not let login run with an outdated token.
        let csrf = response
            .cookie(CSRF_COOKIE)
            .map(|record| record.value.clone());
        let present = csrf.is_some();
        let checks = cx
            .checks
            .check(TAG_CSRF, Some(&response))
            .assert("csrf cookie present", |_| present)
            .into_results();

        match csrf {
            Some(token) => {
                cx.session.set_token("csrf", &token);
                StepOutcome::from_response(&response).with_checks(checks)
            }
            None => {
                warn!(vu_id = cx.vu_id, "no csrf cookie in response, aborting iteration");
                StepOutcome::from_response(&response).with_checks(checks).abort()
            }
        }
    }
}

/// Log in with the VU's credential. The auth token from the response body is
/// cached for the steps that send it as a bearer header.
pub struct Login;

#[async_trait]
impl StepAction for Login {
    async fn execute(&self, cx: &mut StepContext<'_>) -> StepOutcome {
        let csrf = cx.session.get_token("csrf").unwrap_or_default().to_string();
        let body = json!({
            "username": cx.credential.username,
            "password": cx.credential.password,
            "csrf": csrf,
        })
        .to_string();

        let result = cx
            .post(
                "/api/users/token/login?set_cookie=true",
                Some(body),
                &[("Content-Type", "application/json"), ("X-Csrf-Token", &csrf)],
                TAG_LOGIN,
            )
            .await;

        let response = match result {
            Ok(response) => response,
            Err(_) => {
                let checks = cx
                    .checks
                    .check(TAG_LOGIN, None)
                    .assert("login succeeded", |_| true)
                    .assert("auth token received", |_| true)
                    .into_results();
                return StepOutcome::transport_failure().with_checks(checks);
            }
        };

        let checks = cx
            .checks
            .check(TAG_LOGIN, Some(&response))
            .assert("login succeeded", |r| r.status == 200)
            .assert("auth token received", |r| {
                r.json()
                    .and_then(|v| v.get("token"))
                    .and_then(Value::as_str)
                    .is_some()
            })
            .into_results();

        if let Some(token) = response
            .json()
            .and_then(|v| v.get("token"))
            .and_then(Value::as_str)
        {
            cx.session.set_token("auth", token);
        }

        StepOutcome::from_response(&response).with_checks(checks)
    }
}

/// Plant the `qp_user_token` session cookie, the way a browser would hold
/// it after the login response. No HTTP call; aborts when there is no auth
/// token to plant.
pub struct InjectSessionCookie;

#[async_trait]
impl StepAction for InjectSessionCookie {
    async fn execute(&self, cx: &mut StepContext<'_>) -> StepOutcome {
        let token = match cx.session.get_token("auth") {
            Some(token) => token.to_string(),
            None => {
                warn!(vu_id = cx.vu_id, "no auth token cached, aborting iteration");
                return StepOutcome::local().abort();
            }
        };

        let host = url_host(cx.base_url).to_string();
        cx.session.set_cookie(
            &host,
            SESSION_COOKIE,
            &token,
            CookieAttributes {
                path: "/".to_string(),
                domain: host.clone(),
                // The client refuses to send secure cookies over http, so
                // only mark the cookie secure when the target actually is.
                secure: cx.base_url.starts_with("https://"),
                http_only: true,
                same_site: SameSite::Strict,
            },
        );

        StepOutcome::local()
    }
}

/// Hit the ratings listing to prove the fresh session is accepted.
pub struct VerifyRatings;

#[async_trait]
impl StepAction for VerifyRatings {
    async fn execute(&self, cx: &mut StepContext<'_>) -> StepOutcome {
        let bearer = bearer_header(cx);
        let result = cx
            .get("/api/ratings", &[("Authorization", &bearer)], TAG_RATINGS)
            .await;

        let response = match result {
            Ok(response) => response,
            Err(_) => {
                let checks = cx
                    .checks
                    .check(TAG_RATINGS, None)
                    .assert("ratings listing accessible", |_| true)
                    .into_results();
                return StepOutcome::transport_failure().with_checks(checks);
            }
        };

        let checks = cx
            .checks
            .check(TAG_RATINGS, Some(&response))
            .assert("ratings listing accessible", |r| r.status == 200)
            .into_results();
        StepOutcome::from_response(&response).with_checks(checks)
    }
}

/// Load the home page as a logged-in user. Auth travels in the session
/// cookie alone.
pub struct OpenHome;

#[async_trait]
impl StepAction for OpenHome {
    async fn execute(&self, cx: &mut StepContext<'_>) -> StepOutcome {
        let result = cx.get("/", &[], TAG_HOME).await;

        let response = match result {
            Ok(response) => response,
            Err(_) => {
                let checks = cx
                    .checks
                    .check(TAG_HOME, None)
                    .assert("home page loads", |_| true)
                    .into_results();
                return StepOutcome::transport_failure().with_checks(checks);
            }
        };

        let checks = cx
            .checks
            .check(TAG_HOME, Some(&response))
            .assert("home page loads", |r| r.status == 200)
            .into_results();
        StepOutcome::from_response(&response).with_checks(checks)
    }
}

/// Ask for a pizza recommendation under fixed dietary constraints and cache
/// the suggested pizza's id for the rating step.
pub struct GetPizzaSuggestion;

#[async_trait]
impl StepAction for GetPizzaSuggestion {
    async fn execute(&self, cx: &mut StepContext<'_>) -> StepOutcome {
        let bearer = bearer_header(cx);
        let csrf = cx.session.get_token("csrf").unwrap_or_default().to_string();
        let body = json!({
            "maxCaloriesPerSlice": 1000,
            "mustBeVegetarian": false,
            "excludedIngredients": [],
            "excludedTools": [],
            "maxNumberOfToppings": 5,
            "minNumberOfToppings": 2,
        })
        .to_string();

        let result = cx
            .post(
                "/api/pizza",
                Some(body),
                &[
                    ("Content-Type", "application/json"),
                    ("Authorization", &bearer),
                    ("X-Csrf-Token", &csrf),
                ],
                TAG_PIZZA,
            )
            .await;

        let response = match result {
            Ok(response) => response,
            Err(_) => {
                let checks = cx
                    .checks
                    .check(TAG_PIZZA, None)
                    .assert("suggestion returned", |_| true)
                    .assert("pizza id present", |_| true)
                    .into_results();
                return StepOutcome::transport_failure().with_checks(checks);
            }
        };

        let checks = cx
            .checks
            .check(TAG_PIZZA, Some(&response))
            .assert("suggestion returned", |r| r.status == 200)
            .assert("pizza id present", |r| {
                r.json().and_then(|v| v.pointer("/pizza/id")).is_some()
            })
            .into_results();

        if let Some(id) = response.json().and_then(|v| v.pointer("/pizza/id")) {
            cx.session.set_token("pizza_id", &id.to_string());
        }

        StepOutcome::from_response(&response).with_checks(checks)
    }
}

/// Rate the suggested pizza five stars and expect a created rating back.
pub struct PostRating;

#[async_trait]
impl StepAction for PostRating {
    async fn execute(&self, cx: &mut StepContext<'_>) -> StepOutcome {
        let pizza_id = match cx.session.get_token("pizza_id") {
            Some(raw) => serde_json::from_str::<Value>(raw).unwrap_or(Value::Null),
            None => {
                warn!(vu_id = cx.vu_id, "no pizza id cached, skipping rating");
                let checks = cx
                    .checks
                    .check(TAG_RATING_POST, None)
                    .assert("rating created", |_| true)
                    .assert("rating id returned", |_| true)
                    .into_results();
                return StepOutcome::local().with_checks(checks);
            }
        };

        let bearer = bearer_header(cx);
        let csrf = cx.session.get_token("csrf").unwrap_or_default().to_string();
        let body = json!({ "pizza_id": pizza_id, "stars": 5 }).to_string();

        let result = cx
            .post(
                "/api/ratings",
                Some(body),
                &[
                    ("Content-Type", "application/json"),
                    ("Authorization", &bearer),
                    ("X-Csrf-Token", &csrf),
                ],
                TAG_RATING_POST,
            )
            .await;

        let response = match result {
            Ok(response) => response,
            Err(_) => {
                let checks = cx
                    .checks
                    .check(TAG_RATING_POST, None)
                    .assert("rating created", |_| true)
                    .assert("rating id returned", |_| true)
                    .into_results();
                return StepOutcome::transport_failure().with_checks(checks);
            }
        };

        let checks = cx
            .checks
            .check(TAG_RATING_POST, Some(&response))
            .assert("rating created", |r| r.status == 201)
            .assert("rating id returned", |r| {
                r.json().and_then(|v| v.get("id")).is_some()
            })
            .into_results();
        StepOutcome::from_response(&response).with_checks(checks)
    }
}

fn bearer_header(cx: &StepContext<'_>) -> String {
    format!("Bearer {}", cx.session.get_token("auth").unwrap_or_default())
}

/// The full journey with its threshold set. Per-tag latency budgets reflect
/// what each endpoint does: login and the recommendation engine get more
/// headroom than the cheap reads.
pub fn pizza_scenario(think_time: Option<ThinkTime>) -> Scenario {
    let thresholds = vec![
        Threshold::global("rate<0.01").expect("static threshold expression"),
        Threshold::global("p(95)<500").expect("static threshold expression"),
        Threshold::tagged(TAG_CSRF, "p(95)<200").expect("static threshold expression"),
        Threshold::tagged(TAG_LOGIN, "p(95)<500").expect("static threshold expression"),
        Threshold::tagged(TAG_RATINGS, "p(95)<250").expect("static threshold expression"),
        Threshold::tagged(TAG_HOME, "p(95)<200").expect("static threshold expression"),
        Threshold::tagged(TAG_PIZZA, "p(95)<300").expect("static threshold expression"),
        Threshold::tagged(TAG_RATING_POST, "p(95)<200").expect("static threshold expression"),
    ];

    Scenario {
        name: "quickpizza-authenticated-journey".to_string(),
        groups: vec![
            StepGroup::new(
                "01_Authentication_Flow",
                vec![
                    Step::new(TAG_CSRF, FetchCsrfToken),
                    Step::new(TAG_LOGIN, Login),
                    Step::new("inject_session_cookie", InjectSessionCookie),
                    Step::new(TAG_RATINGS, VerifyRatings),
                    Step::new(TAG_HOME, OpenHome),
                ],
            ),
            StepGroup::new(
                "02_Pizza_Selection_and_Rating",
                vec![
                    Step::new(TAG_PIZZA, GetPizzaSuggestion),
                    Step::new(TAG_RATING_POST, PostRating),
                ],
            ),
        ],
        thresholds,
        think_time,
    }
}
