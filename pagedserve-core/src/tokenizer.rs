use std::ops::Deref;

use tokenizers::Tokenizer;

use crate::error::{Error, Result};

/// Text to token ids and back.
pub trait TokenizerLike: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> Result<String>;
}

impl TokenizerLike for Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Deref::deref(self)
            .encode(text, false)
            .map(|encoding| encoding.get_ids().to_vec())
            .map_err(|e| Error::Tokenizer(e.to_string()))
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        Deref::deref(self)
            .decode(ids, true)
            .map_err(|e| Error::Tokenizer(e.to_string()))
    }
}
