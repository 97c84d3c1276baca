/// Token-counting capability used to estimate output tokens locally.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> u64;
}

/// Estimate the number of tokens in `text`.
///
/// Uses a lightweight heuristic (`bytes / 4`) to avoid loading model BPE tables.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// [`TokenCounter`] backed by [`estimate_tokens`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, text: &str) -> u64 {
        estimate_tokens(text)
    }
}

impl<F> TokenCounter for F
where
    F: Fn(&str) -> u64 + Send + Sync,
{
    fn count(&self, text: &str) -> u64 {
        self(text)
    }
}
