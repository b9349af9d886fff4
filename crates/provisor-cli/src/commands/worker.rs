//! Worker commands: show the effective pool and retry settings.

use std::time::Duration;

use provisor_config::Config;
use provisor_tasks::RetryPolicy;

use crate::theme::Theme;

/// Delays for each retry until the ceiling is reached.
///
/// Returns the listed delays and how many further retries wait the full
/// ceiling.
pub(crate) fn retry_schedule(policy: &RetryPolicy) -> (Vec<Duration>, u32) {
    let mut delays = Vec::new();
    let mut retry = 0u32;
    while policy.should_retry(retry) {
        let delay = policy.delay(retry);
        delays.push(delay);
        retry = retry.saturating_add(1);
        if delay >= policy.ceiling {
            break;
        }
    }
    let remaining = policy.max_retries.saturating_sub(retry);
    (delays, remaining)
}

/// `provisor worker show`
pub(crate) fn show(config: &Config) {
    let policy = RetryPolicy::from(&config.worker);
    let (delays, remaining) = retry_schedule(&policy);

    println!("{}", Theme::header("Worker pool"));
    println!("  concurrency   {}", config.worker.concurrency.max(1));
    println!("  rpc timeout   {}ms", config.plugins.rpc_timeout().as_millis());
    println!("  max retries   {}", policy.max_retries);

    println!("{}", Theme::header("Retry schedule"));
    if delays.is_empty() {
        println!("  {}", Theme::dimmed("(no retries, failures go straight to dead)"));
        return;
    }
    for (n, delay) in delays.iter().enumerate() {
        println!("  retry {:>3}   {}ms", n.saturating_add(1), delay.as_millis());
    }
    if remaining > 0 {
        println!(
            "  {}",
            Theme::dimmed(&format!(
                "{remaining} more at {}ms",
                policy.ceiling.as_millis()
            ))
        );
    }
}
