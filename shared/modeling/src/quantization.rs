use candle_core::{DType, Result, Tensor};

/// Weights whose names contain these are left in floating point.
const SKIPPED_MODULES: [&str; 5] = ["embed", "wte", "wpe", "lm_head", "embed_out"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuantizationConfig {
    pub load_in_8bit: bool,
}

/// Row-wise absmax int8 weight.
///
/// Codes are stored as `u8` with a zero point of 128, so a row's largest
/// magnitude maps to 1 or 255.
#[derive(Debug, Clone)]
pub struct Int8Weight {
    codes: Tensor,
    scale: Tensor,
}

const ZERO_POINT: f64 = 128.0;
const LEVELS: f64 = 127.0;

impl Int8Weight {
    pub fn quantize(weight: &Tensor) -> Result<Self> {
        let weight = weight.to_dtype(DType::F32)?;
        let scale = (weight.abs()?.max_keepdim(1)? + 1e-12)?;
        let codes = weight
            .broadcast_div(&scale)?
            .affine(LEVELS, ZERO_POINT)?
            .round()?
            .clamp(0f32, 255f32)?
            .to_dtype(DType::U8)?;
        Ok(Self { codes, scale })
    }

    pub fn dequantize(&self, dtype: DType) -> Result<Tensor> {
        self.codes
            .to_dtype(DType::F32)?
            .affine(1.0 / LEVELS, -ZERO_POINT / LEVELS)?
            .broadcast_mul(&self.scale)?
            .to_dtype(dtype)
    }

    pub fn dims(&self) -> &[usize] {
        self.codes.dims()
    }

    pub fn codes(&self) -> &Tensor {
        &self.codes
    }

    pub fn scale(&self) -> &Tensor {
        &self.scale
    }
}

/// Linear layer weights are quantized. Embeddings, the output head, norms and
/// biases are not.
pub fn is_quantizable(name: &str, tensor: &Tensor) -> bool {
    tensor.rank() == 2
        && tensor.dtype().is_float()
        && name.ends_with(".weight")
        && !SKIPPED_MODULES.iter().any(|module| name.contains(module))
}
