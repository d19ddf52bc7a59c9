//! Caption tokenizer: BPE from a `tokenizer.json`, fixed-length output.

use anyhow::{anyhow, bail, Result};
use std::path::Path;
use std::str::FromStr;
use tokenizers::Tokenizer;

pub struct TextTokenizer {
    inner: Tokenizer,
}

impl TextTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("cannot load tokenizer {}: {e}", path.display()))?;
        Ok(Self { inner })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let inner = Tokenizer::from_str(json).map_err(|e| anyhow!("invalid tokenizer json: {e}"))?;
        Ok(Self { inner })
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Token ids for one caption, without special tokens.
    pub fn encode(&self, text: &str) -> Result<Vec<usize>> {
        let encoding = self
            .inner
            .encode(clean_text(text), false)
            .map_err(|e| anyhow!("tokenizing {text:?}: {e}"))?;
        Ok(encoding.get_ids().iter().map(|&id| id as usize).collect())
    }

    /// Encode and fit to `context_length`, zero padded.
    pub fn tokenize(&self, text: &str, context_length: usize, truncate: bool) -> Result<Vec<usize>> {
        fit_to_context(self.encode(text)?, context_length, truncate, text)
    }
}

/// Lowercase and collapse whitespace.
fn clean_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn fit_to_context(
    mut ids: Vec<usize>,
    context_length: usize,
    truncate: bool,
    text: &str,
) -> Result<Vec<usize>> {
    if ids.len() > context_length {
        if !truncate {
            bail!(
                "caption {text:?} has {} tokens, more than the context length {context_length} \
                 (pass --truncate_captions to cut it)",
                ids.len()
            );
        }
        ids.truncate(context_length);
    }
    ids.resize(context_length, 0);
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORD_LEVEL: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {"[UNK]": 1, "a": 2, "red": 3, "cube": 4},
            "unk_token": "[UNK]"
        }
    }"#;

    #[test]
    fn pads_with_zeros() {
        let tok = TextTokenizer::from_json(WORD_LEVEL).unwrap();
        assert_eq!(tok.tokenize("A  red\tcube", 5, false).unwrap(), vec![2, 3, 4, 0, 0]);
    }

    #[test]
    fn long_captions_need_truncation_flag() {
        let tok = TextTokenizer::from_json(WORD_LEVEL).unwrap();
        assert!(tok.tokenize("a red cube", 2, false).is_err());
        assert_eq!(tok.tokenize("a red cube", 2, true).unwrap(), vec![2, 3]);
    }

    #[test]
    fn unknown_words_map_to_unk() {
        let tok = TextTokenizer::from_json(WORD_LEVEL).unwrap();
        assert_eq!(tok.encode("blue cube").unwrap(), vec![1, 4]);
    }
}
