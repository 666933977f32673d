//! Token vocabularies loaded from one-token-per-line files.

use std::collections::HashMap;
use std::path::Path;

use seqrun_core::{IoResultExt, Result};

pub const PAD_TOKEN: &str = "<blank>";
pub const BOS_TOKEN: &str = "<s>";
pub const EOS_TOKEN: &str = "</s>";
pub const UNK_TOKEN: &str = "<unk>";

pub const PAD_ID: u32 = 0;
pub const BOS_ID: u32 = 1;
pub const EOS_ID: u32 = 2;
pub const UNK_ID: u32 = 3;

/// Bidirectional token <-> id mapping. The four special tokens always
/// occupy ids 0..4.
#[derive(Debug, Clone)]
pub struct Vocab {
    tokens: Vec<String>,
    ids: HashMap<String, u32>,
}

impl Vocab {
    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut vocab = Self {
            tokens: Vec::new(),
            ids: HashMap::new(),
        };
        for special in [PAD_TOKEN, BOS_TOKEN, EOS_TOKEN, UNK_TOKEN] {
            vocab.insert(special.to_string());
        }
        for token in tokens {
            vocab.insert(token.into());
        }
        vocab
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).with_path(&path)?;
        let vocab = Self::from_tokens(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        );
        tracing::debug!(path = %path.as_ref().display(), size = vocab.len(), "Loaded vocabulary");
        Ok(vocab)
    }

    fn insert(&mut self, token: String) {
        if !self.ids.contains_key(&token) {
            self.ids.insert(token.clone(), self.tokens.len() as u32);
            self.tokens.push(token);
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn lookup(&self, token: &str) -> u32 {
        self.ids.get(token).copied().unwrap_or(UNK_ID)
    }

    pub fn token(&self, id: u32) -> &str {
        self.tokens
            .get(id as usize)
            .map(String::as_str)
            .unwrap_or(UNK_TOKEN)
    }

    pub fn encode(&self, tokens: &[String]) -> Vec<u32> {
        tokens.iter().map(|t| self.lookup(t)).collect()
    }
}
