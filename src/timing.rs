//! Cycle-counter based timing
//!
//! Deadlines and delays are derived from the Cortex-M DWT cycle counter;
//! the counter must be running (`DWT::enable_cycle_counter`) before the
//! host is started. Host-side (non-embedded) builds get inert stubs so
//! the pure-logic paths stay testable.

/// CPU core clock in Hz used for cycle/time conversion.
///
/// Matches the common 168 MHz STM32F4 configuration; adjust the
/// conversions below if your core clock differs significantly. Timeouts
/// in this crate are generous enough that a 2x clock mismatch only
/// scales them, it does not break protocol behavior.
pub const CPU_FREQ_HZ: u32 = 168_000_000;

const CYCLES_PER_MS: u32 = CPU_FREQ_HZ / 1_000;
const CYCLES_PER_US: u32 = CPU_FREQ_HZ / 1_000_000;

/// Read the current cycle counter
#[inline(always)]
pub fn cycle_count() -> u32 {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    {
        cortex_m::peripheral::DWT::cycle_count()
    }
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    {
        0
    }
}

/// Convert milliseconds to CPU cycles
#[inline]
pub const fn ms_to_cycles(ms: u32) -> u32 {
    ms.saturating_mul(CYCLES_PER_MS)
}

/// Convert microseconds to CPU cycles
#[inline]
pub const fn us_to_cycles(us: u32) -> u32 {
    us.saturating_mul(CYCLES_PER_US)
}

/// Busy-wait for the given number of milliseconds
pub fn delay_ms(ms: u32) {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    cortex_m::asm::delay(ms_to_cycles(ms));
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    let _ = ms;
}

/// Busy-wait for the given number of microseconds
pub fn delay_us(us: u32) {
    #[cfg(all(target_arch = "arm", target_os = "none"))]
    cortex_m::asm::delay(us_to_cycles(us));
    #[cfg(not(all(target_arch = "arm", target_os = "none")))]
    let _ = us;
}

/// A point in the future, measured in CPU cycles
pub struct Deadline {
    start: u32,
    timeout_cycles: u32,
}

impl Deadline {
    /// Deadline `timeout_ms` milliseconds from now
    pub fn after_ms(timeout_ms: u32) -> Self {
        Self {
            start: cycle_count(),
            timeout_cycles: ms_to_cycles(timeout_ms),
        }
    }

    /// Check whether the deadline has passed
    #[inline(always)]
    pub fn is_expired(&self) -> bool {
        cycle_count().wrapping_sub(self.start) >= self.timeout_cycles
    }

    /// Spin until `condition` returns true or the deadline passes
    pub fn wait_for<F>(&self, mut condition: F) -> crate::error::Result<()>
    where
        F: FnMut() -> bool,
    {
        while !condition() {
            if self.is_expired() {
                return Err(crate::error::UsbError::Timeout);
            }
            core::hint::spin_loop();
        }
        Ok(())
    }
}
