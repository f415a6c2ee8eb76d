//! Engine configuration

use crate::types::CpuIsa;
use std::env;

/// Knobs that change how implementations negotiate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Pin the instruction set the engine reports. `None` detects the
    /// running machine.
    pub isa: Option<CpuIsa>,
    /// Let eligible 1x1 convolutions run as a matrix multiplication.
    pub matmul_reduction: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            isa: None,
            matmul_reduction: true,
        }
    }
}

impl EngineConfig {
    /// Read configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TESSERA_CPU_ISA` - cap or pin the ISA (`avx2`, `avx512_core`, ...)
    /// - `TESSERA_CONV_MATMUL_REDUCTION` - `0`/`false`/`no` disables the
    ///   matmul path for convolutions
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(isa) = env::var("TESSERA_CPU_ISA") {
            match CpuIsa::from_name(&isa) {
                Some(parsed) => config.isa = Some(parsed),
                None => tracing::warn!(value = %isa, "ignoring unknown TESSERA_CPU_ISA"),
            }
        }

        if let Ok(flag) = env::var("TESSERA_CONV_MATMUL_REDUCTION") {
            config.matmul_reduction =
                !(flag == "0" || flag.eq_ignore_ascii_case("false") || flag.eq_ignore_ascii_case("no"));
        }

        config
    }

    pub fn with_isa(mut self, isa: CpuIsa) -> Self {
        self.isa = Some(isa);
        self
    }

    pub fn with_matmul_reduction(mut self, enabled: bool) -> Self {
        self.matmul_reduction = enabled;
        self
    }
}
