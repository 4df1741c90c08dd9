//! Shared helpers for breaker integration tests.

#![allow(dead_code)]

use std::time::{Duration, Instant};

use tripwire_core::{BreakerConfig, BreakerState, CircuitBreaker, PoolConfig};

/// Error returned by simulated downstream calls.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("downstream refused the request")]
pub struct Refused;

/// Config with short timeouts so state changes happen within a test.
pub fn fast_config(max_failures: u32) -> BreakerConfig {
    BreakerConfig::new(
        max_failures,
        Duration::from_millis(100),
        Duration::from_millis(200),
    )
    .with_name("integration")
    .with_pool(PoolConfig::new(2, 4, 4))
    .with_watchdog_interval(Duration::from_millis(10))
}

/// An operation that never completes on its own.
pub async fn hang() -> Result<u32, Refused> {
    tokio::time::sleep(Duration::from_secs(3600)).await;
    Ok(0)
}

/// Poll until the breaker reaches `expected` or `within` elapses.
pub async fn wait_for_state(breaker: &CircuitBreaker, expected: BreakerState, within: Duration) {
    let deadline = Instant::now() + within;
    while breaker.state() != expected {
        assert!(
            Instant::now() < deadline,
            "breaker stayed {} instead of becoming {}",
            breaker.state(),
            expected
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
