//! 4-bit weight storage backed by `qlora-rs`.
//!
//! Weights are flattened and zero-padded to a multiple of the block size
//! before [`qlora_rs::quantize_nf4`] packs them; [`PackedWeight::dequantize`]
//! strips the padding and restores the original shape.

use candle_core::{DType, Device, Tensor};
use qlora_rs::{dequantize_nf4, quantize_nf4, QuantizedTensor};

use crate::config::{QuantType, QuantizationSettings};
use crate::error::{Result, TuneError};

/// A weight held as packed NF4 codes.
#[derive(Debug, Clone)]
pub struct PackedWeight {
    inner: QuantizedTensor,
    shape: Vec<usize>,
    block_size: usize,
    device: Device,
}

impl PackedWeight {
    /// Quantize a floating point tensor.
    ///
    /// # Errors
    ///
    /// Returns [`TuneError::Config`] for a zero block size or a code book
    /// other than NF4, and a [`TuneError::Qlora`] if packing fails.
    pub fn quantize(tensor: &Tensor, settings: &QuantizationSettings) -> Result<Self> {
        if settings.block_size == 0 {
            return Err(TuneError::Config(
                "quantization block_size must be > 0".into(),
            ));
        }
        if settings.quant_type != QuantType::Nf4 {
            return Err(TuneError::Config(format!(
                "quant_type {:?} is not supported; use nf4",
                settings.quant_type
            )));
        }

        let flat = tensor.to_dtype(DType::F32)?.flatten_all()?;
        let numel = flat.elem_count();
        let padding = numel.div_ceil(settings.block_size) * settings.block_size - numel;
        let flat = if padding > 0 {
            flat.pad_with_zeros(0, 0, padding)?
        } else {
            flat
        };

        Ok(Self {
            inner: quantize_nf4(&flat, settings.block_size)?,
            shape: tensor.dims().to_vec(),
            block_size: settings.block_size,
            device: tensor.device().clone(),
        })
    }

    /// Restore an `f32` tensor with the original shape.
    ///
    /// # Errors
    ///
    /// Returns an error if unpacking fails.
    pub fn dequantize(&self) -> Result<Tensor> {
        let flat = dequantize_nf4(&self.inner, &self.device)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .narrow(0, 0, self.elem_count())?;
        Ok(flat.reshape(self.shape.as_slice())?)
    }

    /// Logical shape.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of logical elements.
    #[must_use]
    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }

    /// Block size the codes were packed with.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Code book in use.
    #[must_use]
    pub fn quant_type(&self) -> QuantType {
        QuantType::Nf4
    }
}
