//! Runtime kernel configuration
//!
//! ```text
//! ALICE_I2S_BACKEND   = auto | scalar | lanes | avx2   (default: auto)
//! ALICE_I2S_SKIP_ZERO = 0 | 1                          (default: 1)
//! ```

use std::str::FromStr;

use tracing::warn;

use crate::backend::Backend;
use crate::error::{KernelError, Result};

/// Environment variable selecting the backend
pub const BACKEND_ENV: &str = "ALICE_I2S_BACKEND";

/// Environment variable toggling the forward zero-input skip
pub const SKIP_ZERO_ENV: &str = "ALICE_I2S_SKIP_ZERO";

/// Requested backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendChoice {
    /// Fastest backend the CPU supports
    #[default]
    Auto,
    /// A specific backend; rejected if the CPU cannot run it
    Fixed(Backend),
}

impl FromStr for BackendChoice {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(BackendChoice::Auto)
        } else {
            s.parse().map(BackendChoice::Fixed)
        }
    }
}

/// Kernel dispatcher configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Backend selection
    pub backend: BackendChoice,
    /// Skip forward-pass columns whose input is exactly zero.
    ///
    /// Never changes results; only affects speed on sparse inputs.
    pub skip_zero_inputs: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self { backend: BackendChoice::Auto, skip_zero_inputs: true }
    }
}

impl KernelConfig {
    /// Pin a specific backend
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = BackendChoice::Fixed(backend);
        self
    }

    /// Toggle the zero-input skip
    pub fn with_skip_zero_inputs(mut self, skip: bool) -> Self {
        self.skip_zero_inputs = skip;
        self
    }

    /// Read [`BACKEND_ENV`] and [`SKIP_ZERO_ENV`].
    ///
    /// An unparseable backend name is an error; an unparseable skip flag
    /// keeps the default with a warning.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(
            std::env::var(BACKEND_ENV).ok().as_deref(),
            std::env::var(SKIP_ZERO_ENV).ok().as_deref(),
        )
    }

    fn from_vars(backend: Option<&str>, skip_zero: Option<&str>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(name) = backend.filter(|s| !s.trim().is_empty()) {
            config.backend = name.parse()?;
        }
        if let Some(flag) = skip_zero {
            match parse_flag(flag) {
                Some(skip) => config.skip_zero_inputs = skip,
                None => warn!(value = flag, "ignoring unparseable {SKIP_ZERO_ENV}"),
            }
        }
        Ok(config)
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}
