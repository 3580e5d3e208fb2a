use std::fmt;

use candle_core::{DType, Device, DeviceLocation};

/// Numeric precision requested from the model loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrecisionChoice {
    Float16,
    BFloat16,
    /// Whatever the checkpoint declares.
    Auto,
}

impl PrecisionChoice {
    /// First match wins: 8-bit quantization computes in float16, then bf16
    /// if the hardware has it, otherwise the checkpoint decides.
    pub fn select(load_in_8bit: bool, bf16_supported: bool) -> Self {
        if load_in_8bit {
            PrecisionChoice::Float16
        } else if bf16_supported {
            PrecisionChoice::BFloat16
        } else {
            PrecisionChoice::Auto
        }
    }

    pub fn dtype(self) -> Option<DType> {
        match self {
            PrecisionChoice::Float16 => Some(DType::F16),
            PrecisionChoice::BFloat16 => Some(DType::BF16),
            PrecisionChoice::Auto => None,
        }
    }
}

impl fmt::Display for PrecisionChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrecisionChoice::Float16 => write!(f, "float16"),
            PrecisionChoice::BFloat16 => write!(f, "bfloat16"),
            PrecisionChoice::Auto => write!(f, "auto"),
        }
    }
}

#[cfg(feature = "cuda")]
fn cuda_compute_capability_major(ordinal: usize) -> Option<i32> {
    use cudarc::driver::{sys::CUdevice_attribute, CudaContext};

    CudaContext::new(ordinal)
        .and_then(|ctx| {
            ctx.attribute(CUdevice_attribute::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
        })
        .ok()
}

#[cfg(not(feature = "cuda"))]
fn cuda_compute_capability_major(_ordinal: usize) -> Option<i32> {
    None
}

/// Whether `device` computes natively in bfloat16.
///
/// Only CUDA devices of compute capability 8.0 (Ampere) or newer qualify.
pub fn supports_bf16(device: &Device) -> bool {
    match device.location() {
        DeviceLocation::Cuda { gpu_id } => {
            cuda_compute_capability_major(gpu_id).is_some_and(|major| major >= 8)
        }
        _ => false,
    }
}
