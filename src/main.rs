use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stepload::config::Config;
use stepload::credentials::CredentialSource;
use stepload::executor::{Engine, RunOptions};
use stepload::metrics::format_stats_table;
use stepload::pizza::pizza_scenario;
use stepload::scenario::ThinkTime;
use stepload::ReqwestClient;

/// Prints helpful configuration documentation.
fn print_config_help() {
    eprintln!("Required environment variables:");
    eprintln!("  BASE_URL             - Target base URL (e.g. https://quickpizza.grafana.com)");
    eprintln!();
    eprintln!("Optional environment variables:");
    eprintln!("  VUS                  - Number of virtual users (default: one per pool entry, or 1)");
    eprintln!("  ITERATIONS           - Iterations per VU (default: 1)");
    eprintln!("  MAX_DURATION         - Run deadline: 30s, 1m, 2h (default: 1m)");
    eprintln!("  THINK_TIME_MIN_SECS  - Minimum pause between steps (default: 1)");
    eprintln!("  THINK_TIME_MAX_SECS  - Maximum pause between steps (default: 2)");
    eprintln!("  CREDENTIALS_FILE     - JSON user pool; omit to generate credentials per VU");
    eprintln!("  RANDOM_SEED          - Seed for reproducible pacing and generated credentials");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            eprintln!("Configuration error: {}\n", error);
            print_config_help();
            std::process::exit(1);
        }
    };
    config.print_summary();

    let client = match ReqwestClient::new() {
        Ok(client) => Arc::new(client),
        Err(error) => {
            error!(error = %error, "failed to build HTTP client");
            std::process::exit(1);
        }
    };

    let credentials = match &config.credentials_file {
        Some(path) => match CredentialSource::from_json_file(path) {
            Ok(source) => source,
            Err(error) => {
                error!(error = %error, path = %path, "failed to load credential pool");
                std::process::exit(1);
            }
        },
        None => CredentialSource::Generated,
    };

    // With a pool and no explicit VUS, run one VU per credential.
    let vu_count = config
        .vus
        .or_else(|| credentials.pool_size())
        .unwrap_or(1);

    let think_time = if config.think_time_max > Duration::ZERO {
        Some(ThinkTime::Random {
            min: config.think_time_min,
            max: config.think_time_max,
        })
    } else {
        None
    };

    let scenario = pizza_scenario(think_time);
    let engine = Engine::new(config.base_url.clone(), scenario, client, credentials);

    let result = match engine
        .run(RunOptions {
            vu_count,
            iterations_per_vu: config.iterations_per_vu,
            max_duration: config.max_duration,
            seed: config.random_seed,
        })
        .await
    {
        Ok(result) => result,
        Err(error) => {
            error!(error = %error, "run failed");
            std::process::exit(1);
        }
    };

    println!("\n--- RUN SUMMARY ---");
    println!(
        "checks: {} passed, {} failed ({:.1}% pass rate)",
        result.checks_passed,
        result.checks_failed,
        result.check_pass_rate() * 100.0
    );
    println!("samples: {}", result.sample_count);
    println!("\n{}", format_stats_table(&result.tag_stats));
    println!("thresholds:");
    for threshold in &result.threshold_results {
        let verdict = if threshold.passed { "PASS" } else { "FAIL" };
        match threshold.observed {
            Some(observed) => println!(
                "  [{}] {} (observed {:.2})",
                verdict, threshold.threshold, observed
            ),
            None => println!("  [{}] {} (no samples)", verdict, threshold.threshold),
        }
    }
    for vu in &result.vus {
        info!(
            vu_id = vu.vu_id,
            state = ?vu.state,
            iterations = vu.iterations_completed,
            aborted = vu.aborted_iterations,
            "VU summary"
        );
    }
    println!("--- END OF RUN SUMMARY ---\n");

    std::process::exit(if result.success() { 0 } else { 1 });
}
