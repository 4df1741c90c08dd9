//! Tripwire: a circuit breaker that runs guarded operations on its own
//! bounded pool and cancels them when they overrun.
//!
//! A [`CircuitBreaker`] dispatches each call to an execution pool and hands
//! back a [`CallHandle`]. Results retrieved through the handle feed the state
//! machine; a watchdog cancels operations that exceed the call timeout and
//! counts them as failures. After `max_failures` consecutive failures the
//! circuit opens, everything in flight is cancelled and the pool is
//! discarded. Once the reset timeout elapses a single trial call decides
//! whether the circuit closes again.
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use tripwire_core::{BreakerConfig, BreakerError, CircuitBreaker};
//!
//! let breaker = CircuitBreaker::new(
//!     BreakerConfig::new(3, Duration::from_secs(3), Duration::from_secs(30)).with_name("quotes"),
//! )?;
//!
//! match breaker.call(fetch_quote("ACME"))?.get().await {
//!     Ok(quote) => println!("{quote}"),
//!     Err(BreakerError::Operation(err)) => eprintln!("upstream failed: {err}"),
//!     Err(err) => eprintln!("not attempted: {err}"),
//! }
//! ```

pub mod config;
pub mod error;
pub mod metrics;

mod breaker;
mod pool;
mod timers;

pub use breaker::{BreakerState, CallHandle, CircuitBreaker, OperationId};
pub use config::{BreakerConfig, ConfigError, PoolConfig};
pub use error::{BreakerError, SetupError};
pub use metrics::BreakerMetrics;
