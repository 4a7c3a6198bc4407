//! Flasher configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the write path moves data to the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStrategy {
    /// One stub invocation per scratch-buffer-sized chunk; the host copies
    /// each chunk into the scratch area before the run.
    #[default]
    Buffered,
    /// A single stub invocation fed by a continuous double-buffered data
    /// stream through the scratch area. Faster for large images, but
    /// requires 4-byte-aligned offsets.
    Streaming,
}

/// Configuration of the stub flasher.
///
/// The stub binary is an externally built artifact; its location is always
/// injected here, never compiled in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StubConfig {
    /// Path to the pre-built stub ELF.
    pub stub_path: PathBuf,
    /// Write transfer strategy.
    #[serde(default)]
    pub write_strategy: WriteStrategy,
    /// Host-side timeout for a single stub invocation, in milliseconds.
    #[serde(default = "default_algo_timeout_ms")]
    pub algo_timeout_ms: u64,
    /// Whether to stamp and scan the stub stack around every run to detect
    /// overflows.
    #[serde(default = "default_stack_canary")]
    pub stack_canary: bool,
}

impl StubConfig {
    /// Creates a configuration with default timeout, canary and strategy
    /// settings.
    pub fn new(stub_path: impl Into<PathBuf>) -> Self {
        Self {
            stub_path: stub_path.into(),
            write_strategy: WriteStrategy::default(),
            algo_timeout_ms: default_algo_timeout_ms(),
            stack_canary: default_stack_canary(),
        }
    }

    /// The stub invocation timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.algo_timeout_ms)
    }
}

/// Declarative description of a flash bank, loadable from a config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BankConfig {
    /// Address the flash is mapped at.
    pub base_address: u32,
    /// Total bank size in bytes.
    pub size: u32,
    /// Stub flasher settings for this bank.
    pub stub: StubConfig,
}

fn default_algo_timeout_ms() -> u64 {
    1000
}

fn default_stack_canary() -> bool {
    true
}
