//! Completion handles for the two halves of a forwarded call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quanta::Instant;

use crate::error::{Error, Result};

/// One-shot completion flag, signalled from an operation callback and
/// awaited by `wait` through cooperative progress.
#[derive(Clone, Debug)]
pub(crate) struct Completion {
    fired: Arc<AtomicBool>,
}

impl Completion {
    pub fn new() -> Self {
        Self {
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn complete(&self) {
        self.fired.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Drive `progress` until this completion fires or `timeout` elapses.
    /// Returns whether the completion fired; a progress timeout only ends
    /// the current iteration, any other progress failure is surfaced.
    pub fn wait(
        &self,
        timeout: Duration,
        mut progress: impl FnMut(Duration) -> Result<()>,
    ) -> Result<bool> {
        let start = Instant::now();
        loop {
            if self.is_complete() {
                return Ok(true);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Ok(false);
            }
            match progress(timeout - elapsed) {
                Ok(()) | Err(Error::Timeout) => {}
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_completes() {
        let c = Completion::new();
        let c2 = c.clone();
        let mut calls = 0;
        let fired = c
            .wait(Duration::from_secs(1), |_| {
                calls += 1;
                c2.complete();
                Ok(())
            })
            .unwrap();
        assert!(fired);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_wait_times_out() {
        let c = Completion::new();
        let fired = c
            .wait(Duration::from_millis(5), |_| Err(Error::Timeout))
            .unwrap();
        assert!(!fired);
    }

    #[test]
    fn test_wait_surfaces_progress_failure() {
        let c = Completion::new();
        let res = c.wait(Duration::from_millis(50), |_| Err(Error::Protocol));
        assert_eq!(res, Err(Error::Protocol));
    }
}
