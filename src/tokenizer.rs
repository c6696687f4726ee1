//! Tokenizer loading and padding normalization.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::error::{Result, TuneError};

/// Tokenizer definition file.
pub const TOKENIZER_FILENAME: &str = "tokenizer.json";
/// Special-token metadata file.
pub const TOKENIZER_CONFIG_FILENAME: &str = "tokenizer_config.json";

const EOS_CANDIDATES: [&str; 4] = ["</s>", "<|endoftext|>", "<eos>", "<|end_of_text|>"];
const MASK_CANDIDATES: [&str; 2] = ["<mask>", "[MASK]"];

/// Special tokens declared next to the tokenizer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    /// End-of-sequence token.
    #[serde(default, deserialize_with = "token_content", skip_serializing_if = "Option::is_none")]
    pub eos_token: Option<String>,
    /// Padding token.
    #[serde(default, deserialize_with = "token_content", skip_serializing_if = "Option::is_none")]
    pub pad_token: Option<String>,
    /// Mask token for masked language modeling.
    #[serde(default, deserialize_with = "token_content", skip_serializing_if = "Option::is_none")]
    pub mask_token: Option<String>,
}

/// Accept both `"</s>"` and `{"content": "</s>", ...}`.
fn token_content<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Token {
        Plain(String),
        Added { content: String },
    }

    Ok(Option::<Token>::deserialize(deserializer)?.map(|t| match t {
        Token::Plain(s) | Token::Added { content: s } => s,
    }))
}

impl SpecialTokens {
    /// Read a `tokenizer_config.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// A `tokenizers` tokenizer together with its special tokens.
#[derive(Clone)]
pub struct TextTokenizer {
    inner: Tokenizer,
    special: SpecialTokens,
}

impl std::fmt::Debug for TextTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextTokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("special", &self.special)
            .finish()
    }
}

impl TextTokenizer {
    /// Wrap a tokenizer. Special tokens missing from `special` are looked up
    /// among common spellings in the vocabulary.
    #[must_use]
    pub fn new(inner: Tokenizer, mut special: SpecialTokens) -> Self {
        let known = |candidates: &[&str]| {
            candidates
                .iter()
                .find(|t| inner.token_to_id(t).is_some())
                .map(|t| (*t).to_string())
        };
        if special.eos_token.is_none() {
            special.eos_token = known(&EOS_CANDIDATES);
        }
        if special.mask_token.is_none() {
            special.mask_token = known(&MASK_CANDIDATES);
        }
        Self { inner, special }
    }

    /// Load `tokenizer.json` and, if present, `tokenizer_config.json` from a
    /// directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the tokenizer file is unreadable.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let inner = Tokenizer::from_file(dir.join(TOKENIZER_FILENAME))?;
        let config_path = dir.join(TOKENIZER_CONFIG_FILENAME);
        let special = if config_path.exists() {
            SpecialTokens::from_file(config_path)?
        } else {
            SpecialTokens::default()
        };
        Ok(Self::new(inner, special))
    }

    /// Underlying tokenizer.
    #[must_use]
    pub fn inner(&self) -> &Tokenizer {
        &self.inner
    }

    /// Special tokens currently in effect.
    #[must_use]
    pub fn special_tokens(&self) -> &SpecialTokens {
        &self.special
    }

    /// Vocabulary size including added tokens.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Id of the end-of-sequence token.
    #[must_use]
    pub fn eos_token_id(&self) -> Option<u32> {
        self.special
            .eos_token
            .as_deref()
            .and_then(|t| self.inner.token_to_id(t))
    }

    /// Id of the padding token.
    #[must_use]
    pub fn pad_token_id(&self) -> Option<u32> {
        self.special
            .pad_token
            .as_deref()
            .and_then(|t| self.inner.token_to_id(t))
    }

    /// Id of the mask token.
    #[must_use]
    pub fn mask_token_id(&self) -> Option<u32> {
        self.special
            .mask_token
            .as_deref()
            .and_then(|t| self.inner.token_to_id(t))
    }

    /// Ids of every special token: eos, pad, mask and added tokens flagged
    /// special, sorted and deduplicated.
    #[must_use]
    pub fn special_token_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = [
            self.eos_token_id(),
            self.pad_token_id(),
            self.mask_token_id(),
        ]
        .into_iter()
        .flatten()
        .chain(
            self.inner
                .get_added_tokens_decoder()
                .into_iter()
                .filter(|(_, token)| token.special)
                .map(|(id, _)| id),
        )
        .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Use the end-of-sequence token for padding. Most causal models ship
    /// without a dedicated padding token.
    ///
    /// `fallback_eos_id` (usually the model config's `eos_token_id`) is used
    /// when the tokenizer itself declares no eos token.
    ///
    /// # Errors
    ///
    /// Returns an error if no end-of-sequence token can be resolved.
    pub fn set_pad_to_eos(&mut self, fallback_eos_id: Option<u32>) -> Result<u32> {
        if self.eos_token_id().is_none() {
            self.special.eos_token = fallback_eos_id.and_then(|id| self.inner.id_to_token(id));
        }
        let (eos, eos_id) = match (self.special.eos_token.clone(), self.eos_token_id()) {
            (Some(eos), Some(id)) => (eos, id),
            _ => {
                return Err(TuneError::Model(
                    "tokenizer defines no end-of-sequence token to pad with".into(),
                ))
            }
        };

        let mut padding = self.inner.get_padding().cloned().unwrap_or_default();
        padding.pad_id = eos_id;
        padding.pad_token = eos.clone();
        self.inner.with_padding(Some(padding));
        self.special.pad_token = Some(eos);
        Ok(eos_id)
    }

    /// Encode text into token ids.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self.inner.encode(text, true)?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode token ids back into text.
    ///
    /// # Errors
    ///
    /// Returns an error if decoding fails.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        Ok(self.inner.decode(ids, true)?)
    }

    /// Write `tokenizer.json` and `tokenizer_config.json` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be written.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        self.inner.save(dir.join(TOKENIZER_FILENAME), true)?;
        std::fs::write(
            dir.join(TOKENIZER_CONFIG_FILENAME),
            serde_json::to_string_pretty(&self.special)?,
        )?;
        Ok(())
    }
}
