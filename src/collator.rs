//! Batch collation for language modeling.

use std::collections::BTreeSet;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::Rng;

use crate::dataset::TokenizedRecord;
use crate::error::{Result, TuneError};

/// Label value excluded from the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Collation objective.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CollationMode {
    /// Next-token prediction; labels are the inputs.
    Causal,
    /// Masked-token prediction.
    Masked {
        /// Id written over selected tokens.
        mask_token_id: u32,
        /// Fraction of non-special tokens selected.
        probability: f64,
    },
}

/// A padded batch ready for the model.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[batch, seq]` `u32` token ids.
    pub input_ids: Tensor,
    /// `[batch, seq]` `i64` labels, [`IGNORE_INDEX`] where no loss applies.
    pub labels: Tensor,
    /// Positions contributing to the loss.
    pub num_targets: usize,
}

/// Pads records into a [`Batch`] and derives labels.
#[derive(Debug, Clone)]
pub struct DataCollator {
    mode: CollationMode,
    pad_token_id: u32,
    vocab_size: usize,
    special_token_ids: BTreeSet<u32>,
}

impl DataCollator {
    /// Collator for next-token prediction.
    #[must_use]
    pub fn causal(pad_token_id: u32, vocab_size: usize) -> Self {
        Self {
            mode: CollationMode::Causal,
            pad_token_id,
            vocab_size,
            special_token_ids: BTreeSet::from([pad_token_id]),
        }
    }

    /// Collator for masked language modeling.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Config`] if there is no mask token or the
    /// probability is outside `(0, 1)`.
    pub fn masked(
        pad_token_id: u32,
        vocab_size: usize,
        mask_token_id: Option<u32>,
        probability: f64,
    ) -> Result<Self> {
        let mask_token_id = mask_token_id.ok_or_else(|| {
            TuneError::Config(
                "masked language modeling requires a tokenizer with a mask token".into(),
            )
        })?;
        if !(probability > 0.0 && probability < 1.0) {
            return Err(TuneError::Config(format!(
                "mlm_probability must be in (0, 1), got {probability}"
            )));
        }
        Ok(Self {
            mode: CollationMode::Masked {
                mask_token_id,
                probability,
            },
            pad_token_id,
            vocab_size,
            special_token_ids: BTreeSet::from([pad_token_id, mask_token_id]),
        })
    }

    /// Never select these ids for masking, in addition to the pad and mask
    /// tokens.
    #[must_use]
    pub fn with_special_tokens(mut self, ids: impl IntoIterator<Item = u32>) -> Self {
        self.special_token_ids.extend(ids);
        self
    }

    /// Objective in use.
    #[must_use]
    pub fn mode(&self) -> CollationMode {
        self.mode
    }

    /// Whether labels align with inputs instead of the next position.
    #[must_use]
    pub fn is_masked(&self) -> bool {
        matches!(self.mode, CollationMode::Masked { .. })
    }

    /// Pad `records` to the longest one and build labels.
    ///
    /// Padded positions and positions with a zero attention mask get
    /// [`IGNORE_INDEX`]. Causal labels also ignore every token equal to the
    /// pad id; with pad set to eos this drops eos from the loss. Masked
    /// labelling never selects a special token.
    ///
    /// # Errors
    ///
    /// Returns an error if `records` is empty or all records are empty.
    pub fn collate(
        &self,
        records: &[&TokenizedRecord],
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Batch> {
        let seq_len = records.iter().map(|r| r.len()).max().unwrap_or(0);
        if seq_len == 0 {
            return Err(TuneError::Dataset("cannot collate an empty batch".into()));
        }

        let mut ids = Vec::with_capacity(records.len() * seq_len);
        let mut labels = Vec::with_capacity(records.len() * seq_len);
        let mut num_targets = 0;

        for record in records {
            for pos in 0..seq_len {
                let Some(&token) = record.input_ids.get(pos) else {
                    ids.push(self.pad_token_id);
                    labels.push(IGNORE_INDEX);
                    continue;
                };
                let attended = record
                    .attention_mask
                    .as_ref()
                    .and_then(|m| m.get(pos))
                    .map_or(true, |&m| m != 0);
                let (input, label) = if attended {
                    self.label_token(token, rng)
                } else {
                    (token, IGNORE_INDEX)
                };
                if label != IGNORE_INDEX {
                    num_targets += 1;
                }
                ids.push(input);
                labels.push(label);
            }
        }

        let shape = (records.len(), seq_len);
        Ok(Batch {
            input_ids: Tensor::from_vec(ids, shape, device)?,
            labels: Tensor::from_vec(labels, shape, device)?,
            num_targets,
        })
    }

    fn label_token(&self, token: u32, rng: &mut StdRng) -> (u32, i64) {
        match self.mode {
            CollationMode::Causal if token == self.pad_token_id => (token, IGNORE_INDEX),
            CollationMode::Causal => (token, i64::from(token)),
            CollationMode::Masked {
                mask_token_id,
                probability,
            } => {
                if self.special_token_ids.contains(&token) || !rng.gen_bool(probability) {
                    return (token, IGNORE_INDEX);
                }
                let roll: f64 = rng.gen();
                let input = if roll < 0.8 {
                    mask_token_id
                } else if roll < 0.9 {
                    #[allow(clippy::cast_possible_truncation)]
                    let random = rng.gen_range(0..self.vocab_size) as u32;
                    random
                } else {
                    token
                };
                (input, i64::from(token))
            }
        }
    }
}
