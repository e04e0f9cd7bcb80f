use anyhow::{anyhow, Result};
use tiktoken_rs::CoreBPE;

/// Deterministic token count used for budget reservations.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// BPE tokenizer matching the deployed chat model.
pub struct TiktokenCounter {
    bpe: CoreBPE,
}

impl TiktokenCounter {
    /// `o200k_base`, the encoding of the gpt-4o model family.
    pub fn o200k() -> Result<Self> {
        let bpe = tiktoken_rs::o200k_base()
            .map_err(|err| anyhow!("failed to load o200k_base tokenizer: {err}"))?;
        Ok(Self { bpe })
    }

    /// Encoding for a known model name, falling back to `o200k_base` for
    /// deployment names tiktoken does not recognize.
    pub fn for_model(model: &str) -> Result<Self> {
        match tiktoken_rs::get_bpe_from_model(model) {
            Ok(bpe) => Ok(Self { bpe }),
            Err(_) => Self::o200k(),
        }
    }
}

impl TokenCounter for TiktokenCounter {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Rough four-characters-per-token estimate, for dry runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicCounter;

impl TokenCounter for HeuristicCounter {
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        ((text.chars().count() as f64) / 4.0).ceil() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_rounds_up() {
        assert_eq!(HeuristicCounter.count(""), 0);
        assert_eq!(HeuristicCounter.count("abc"), 1);
        assert_eq!(HeuristicCounter.count("abcde"), 2);
    }

    #[test]
    fn tiktoken_is_stable_across_calls() -> anyhow::Result<()> {
        let counter = TiktokenCounter::for_model("my-custom-deployment")?;
        let text = "Caption: a blue shirt\nTags: shirt, blue";
        let first = counter.count(text);
        assert!(first > 0);
        assert_eq!(counter.count(text), first);
        Ok(())
    }
}
