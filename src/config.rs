// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel configuration
//!
//! Every tunable of the kernel core lives in [`KernelConfig`]. The embedding
//! boot code builds one (usually from `KernelConfig::default()`) and hands it
//! to [`Kernel::new`](crate::kernel::Kernel::new), which validates it before
//! any CPU is brought up.

use crate::kernel::KernelError;

/// Maximum number of CPUs the kernel can drive
///
/// Bounded by the width of [`CpuMask`](crate::kernel::CpuMask).
pub const MAX_CPUS: usize = 64;

/// Default user time slice in milliseconds
pub const DEFAULT_TIME_SLICE_MS: u64 = 10;

/// Default CPU-quota super period in microseconds
pub const DEFAULT_SUPER_PERIOD_US: u64 = 1_000_000;

/// Default number of thread slots per protection domain
pub const DEFAULT_MAX_THREADS_PER_PD: usize = 256;

/// Default size of a thread's message buffer (UTCB) in bytes
pub const DEFAULT_UTCB_SIZE: usize = 4096;

/// Default timer resolution (1 MHz)
pub const DEFAULT_TICKS_PER_MS: u64 = 1_000;

/// Kernel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of CPUs to bring up
    pub cpus: usize,
    /// Thread slots per protection domain
    pub max_threads_per_pd: usize,
    /// Round-robin quantum for threads without (or out of) CPU quota
    pub time_slice_ms: u64,
    /// Period after which every CPU quota is refilled
    pub super_period_us: u64,
    /// Timer ticks per millisecond
    ///
    /// This is the rounding parameter of the time base: all tick/time
    /// conversions round down against it.
    pub ticks_per_ms: u64,
    /// Message buffer size per thread
    pub utcb_size: usize,
}

impl KernelConfig {
    /// Configuration for `cpus` CPUs, defaults otherwise
    pub const fn with_cpus(cpus: usize) -> Self {
        Self {
            cpus,
            max_threads_per_pd: DEFAULT_MAX_THREADS_PER_PD,
            time_slice_ms: DEFAULT_TIME_SLICE_MS,
            super_period_us: DEFAULT_SUPER_PERIOD_US,
            ticks_per_ms: DEFAULT_TICKS_PER_MS,
            utcb_size: DEFAULT_UTCB_SIZE,
        }
    }

    /// Check the configuration for values the kernel cannot run with
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.cpus == 0 || self.cpus > MAX_CPUS {
            return Err(KernelError::InvalidConfig("cpu count out of range"));
        }
        if self.max_threads_per_pd == 0 || self.max_threads_per_pd > u16::MAX as usize {
            return Err(KernelError::InvalidConfig("thread slots out of range"));
        }
        if self.time_slice_ms == 0 {
            return Err(KernelError::InvalidConfig("time slice must not be zero"));
        }
        if self.super_period_us < self.time_slice_ms * 1_000 {
            return Err(KernelError::InvalidConfig("super period shorter than time slice"));
        }
        if self.utcb_size < 16 {
            return Err(KernelError::InvalidConfig("utcb too small for a message header"));
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::with_cpus(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = KernelConfig::default();
        assert_eq!(config.cpus, 1);
        assert_eq!(config.time_slice_ms, DEFAULT_TIME_SLICE_MS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_values() {
        assert!(KernelConfig::with_cpus(0).validate().is_err());
        assert!(KernelConfig::with_cpus(MAX_CPUS + 1).validate().is_err());

        let mut config = KernelConfig::default();
        config.max_threads_per_pd = 0;
        assert!(config.validate().is_err());

        let mut config = KernelConfig::default();
        config.super_period_us = 1_000;
        assert!(config.validate().is_err());
    }
}
