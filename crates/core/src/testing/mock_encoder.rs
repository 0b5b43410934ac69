//! Mock image encoder for testing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::encoder::{EncoderError, ImageEncoder};

#[derive(Debug, Default)]
struct Behavior {
    fail_marker: Option<Vec<u8>>,
    panic_marker: Option<Vec<u8>>,
    fixed_output_len: Option<usize>,
    delay: Duration,
    calls: Vec<(usize, u8)>,
}

/// Deterministic stand-in for a real codec.
///
/// The output is `input.len() * quality / 100` bytes (at least one), so
/// lowering the quality always shrinks the output. Inputs containing a
/// configured marker fail or panic.
#[derive(Debug, Clone, Default)]
pub struct MockEncoder {
    behavior: Arc<Mutex<Behavior>>,
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

impl MockEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn behavior(&self) -> MutexGuard<'_, Behavior> {
        self.behavior.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Always produce `len` bytes, whatever the quality.
    pub fn with_fixed_output_len(self, len: usize) -> Self {
        self.behavior().fixed_output_len = Some(len);
        self
    }

    /// Sleep this long in every call.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.behavior().delay = delay;
        self
    }

    /// Fail with a decode error on inputs containing `marker`.
    pub fn fail_on(self, marker: &[u8]) -> Self {
        self.behavior().fail_marker = Some(marker.to_vec());
        self
    }

    /// Panic on inputs containing `marker`.
    pub fn panic_on(self, marker: &[u8]) -> Self {
        self.behavior().panic_marker = Some(marker.to_vec());
        self
    }

    /// `(input length, quality)` of every call so far.
    pub fn calls(&self) -> Vec<(usize, u8)> {
        self.behavior().calls.clone()
    }
}

impl ImageEncoder for MockEncoder {
    fn name(&self) -> &str {
        "mock"
    }

    fn target_extension(&self) -> &str {
        "webp"
    }

    fn encode(&self, input: &[u8], quality: u8) -> Result<Vec<u8>, EncoderError> {
        let (should_fail, should_panic, fixed, delay) = {
            let mut behavior = self.behavior();
            behavior.calls.push((input.len(), quality));
            (
                behavior.fail_marker.as_deref().is_some_and(|m| contains(input, m)),
                behavior.panic_marker.as_deref().is_some_and(|m| contains(input, m)),
                behavior.fixed_output_len,
                behavior.delay,
            )
        };

        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if should_panic {
            panic!("mock encoder panic");
        }
        if should_fail {
            return Err(EncoderError::decode("mock decode failure"));
        }

        let len = fixed.unwrap_or_else(|| (input.len() * quality as usize / 100).max(1));
        Ok(vec![b'w'; len])
    }
}
