//! HTTP/2 flow control window arithmetic (RFC 7540 Section 6.9).
//!
//! [`Window`] is the single-owner building block. The receive side of a
//! connection keeps one per stream plus one for the connection and uses
//! [`Window::reclaim`] to decide when to emit WINDOW_UPDATE.

use crate::error::H2Error;

/// Default initial window size (RFC 7540 Section 6.9.2).
pub const DEFAULT_WINDOW_SIZE: i64 = 65_535;

/// Largest legal window (2^31 - 1).
pub const MAX_WINDOW_SIZE: i64 = 0x7fff_ffff;

/// A send or receive flow control window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    available: i64,
}

impl Window {
    pub fn new(initial: i64) -> Self {
        Self { available: initial }
    }

    /// Current window size. Negative only after a SETTINGS shrink.
    pub fn available(&self) -> i64 {
        self.available
    }

    /// Take `amount` bytes out of the window. Leaves the window untouched
    /// and fails if it would drop below zero.
    pub fn consume(&mut self, amount: u32) -> Result<(), H2Error> {
        let next = self.available - i64::from(amount);
        if next < 0 {
            return Err(H2Error::FlowControlError);
        }
        self.available = next;
        Ok(())
    }

    /// Grow the window by `increment` (WINDOW_UPDATE). Fails past 2^31 - 1.
    pub fn increase(&mut self, increment: u32) -> Result<(), H2Error> {
        self.adjust(i64::from(increment))
    }

    /// Shift the window by a SETTINGS_INITIAL_WINDOW_SIZE delta, which may
    /// be negative.
    pub fn adjust(&mut self, delta: i64) -> Result<(), H2Error> {
        let next = self.available + delta;
        if next > MAX_WINDOW_SIZE {
            return Err(H2Error::FlowControlError);
        }
        self.available = next;
        Ok(())
    }

    /// If the window has fallen below `threshold`, refill it to `target`
    /// and return the increment to advertise.
    pub fn reclaim(&mut self, target: i64, threshold: i64) -> Option<u32> {
        if self.available >= threshold {
            return None;
        }
        let increment = target - self.available;
        if increment <= 0 {
            return None;
        }
        self.available = target;
        Some(increment as u32)
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_then_increase() {
        let mut w = Window::default();
        w.consume(1000).unwrap();
        assert_eq!(w.available(), 64535);
        w.increase(500).unwrap();
        assert_eq!(w.available(), 65035);
    }

    #[test]
    fn consume_underflow_leaves_window() {
        let mut w = Window::new(100);
        assert_eq!(w.consume(101), Err(H2Error::FlowControlError));
        assert_eq!(w.available(), 100);
        w.consume(100).unwrap();
        assert_eq!(w.available(), 0);
    }

    #[test]
    fn increase_past_max_rejected() {
        let mut w = Window::new(MAX_WINDOW_SIZE);
        assert!(w.increase(1).is_err());
        assert_eq!(w.available(), MAX_WINDOW_SIZE);
    }

    #[test]
    fn settings_shrink_can_go_negative() {
        let mut w = Window::new(100);
        w.adjust(-300).unwrap();
        assert_eq!(w.available(), -200);
        assert!(w.consume(1).is_err());
    }

    #[test]
    fn reclaim_below_threshold() {
        let mut w = Window::default();
        w.consume(20_000).unwrap();
        assert_eq!(w.reclaim(DEFAULT_WINDOW_SIZE, 32_768), None);
        w.consume(20_000).unwrap();
        assert_eq!(w.reclaim(DEFAULT_WINDOW_SIZE, 32_768), Some(40_000));
        assert_eq!(w.available(), DEFAULT_WINDOW_SIZE);
    }
}
