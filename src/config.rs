//! # Runtime configuration.
//!
//! [`Config`] sizes the shared worker pool, names the dedicated "main"
//! thread, and bounds how long a scope teardown waits for in-flight work.
//!
//! ```
//! use std::time::Duration;
//! use mvvm_rx::config::Config;
//!
//! let mut cfg = Config::default();
//! cfg.pool_size = 2;
//! cfg.shutdown_grace = Duration::from_secs(1);
//! assert_eq!(cfg.pool_size, 2);
//! ```

use std::time::Duration;

use crate::error::{Error, Result};

/// Environment variable overriding [`Config::pool_size`].
pub const ENV_POOL_SIZE: &str = "MVVM_RX_POOL_SIZE";
/// Environment variable overriding [`Config::main_thread_name`].
pub const ENV_MAIN_THREAD_NAME: &str = "MVVM_RX_MAIN_THREAD_NAME";

#[derive(Clone, Debug)]
pub struct Config {
  /// Worker threads in the background pool (0 = one per CPU).
  pub pool_size: usize,
  /// Thread name prefix for background pool workers.
  pub pool_name_prefix: String,
  /// Name of the dedicated thread backing the main dispatcher.
  pub main_thread_name: String,
  /// Default delay of [`ActionBuffer::post`](crate::collab::ActionBuffer::post)
  /// for buffers handed out by
  /// [`LifetimeScope::action_buffer`](crate::scope::LifetimeScope::action_buffer).
  pub debounce: Duration,
  /// Upper bound on how long a scope teardown waits for its transaction to
  /// close.
  pub shutdown_grace: Duration,
}

impl Default for Config {
  /// - `pool_size = 0` (one per CPU)
  /// - `pool_name_prefix = "mvvm-rx-pool-"`
  /// - `main_thread_name = "mvvm-rx-main"`
  /// - `debounce = 300ms`
  /// - `shutdown_grace = 10s`
  fn default() -> Self {
    Self {
      pool_size: 0,
      pool_name_prefix: "mvvm-rx-pool-".to_string(),
      main_thread_name: "mvvm-rx-main".to_string(),
      debounce: Duration::from_millis(300),
      shutdown_grace: Duration::from_secs(10),
    }
  }
}

impl Config {
  /// Defaults overridden by `MVVM_RX_POOL_SIZE` and `MVVM_RX_MAIN_THREAD_NAME`.
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
    let mut cfg = Config::default();
    if let Some(raw) = lookup(ENV_POOL_SIZE) {
      cfg.pool_size = raw
        .trim()
        .parse()
        .map_err(|_| Error::msg(format!("{ENV_POOL_SIZE} must be an integer, got {raw:?}")))?;
    }
    if let Some(name) = lookup(ENV_MAIN_THREAD_NAME).filter(|n| !n.trim().is_empty()) {
      cfg.main_thread_name = name;
    }
    Ok(cfg)
  }

  /// Pool size with the "one per CPU" default resolved.
  pub fn effective_pool_size(&self) -> usize {
    if self.pool_size > 0 {
      self.pool_size
    } else {
      std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }
  }
}
