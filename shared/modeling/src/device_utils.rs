use std::{fmt, str::FromStr};

use candle_core::Device;
use itertools::Itertools;
use thiserror::Error;

/// Get all available CUDA devices
#[cfg(feature = "cuda")]
fn get_cuda_devices() -> Vec<usize> {
    match cudarc::driver::CudaContext::device_count() {
        Ok(count) => (0..count.max(0) as usize).collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(not(feature = "cuda"))]
fn get_cuda_devices() -> Vec<usize> {
    Vec::new()
}

/// Get the optimal devices for the current platform
///
/// Returns every CUDA device if there is at least one, the CPU otherwise.
pub fn get_optimal_devices() -> Devices {
    let cuda_device_indices = get_cuda_devices();

    if !cuda_device_indices.is_empty() {
        return Devices::Cuda(cuda_device_indices);
    }

    Devices::Cpu
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Devices {
    Cpu,
    Cuda(Vec<usize>),
}

impl Default for Devices {
    fn default() -> Self {
        get_optimal_devices()
    }
}

impl fmt::Display for Devices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Devices::Cpu => write!(f, "CPU"),
            Devices::Cuda(device_ids) => write!(f, "CUDA({})", device_ids.iter().join(", ")),
        }
    }
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("no device for rank {rank} in {devices}")]
    NoDeviceForRank { rank: usize, devices: String },

    #[error("failed to open device: {0}")]
    Candle(#[from] candle_core::Error),
}

impl Devices {
    /// Opens the nth device in this devices set.
    pub fn device_for_rank(&self, n: usize) -> Result<Device, DeviceError> {
        match self {
            Devices::Cpu if n == 0 => Ok(Device::Cpu),
            Devices::Cuda(device_indices) if n < device_indices.len() => {
                Ok(Device::new_cuda(device_indices[n])?)
            }
            _ => Err(DeviceError::NoDeviceForRank {
                rank: n,
                devices: self.to_string(),
            }),
        }
    }
}

/// Binds this process to the accelerator a launcher assigned it.
///
/// Each local rank owns exactly one accelerator, so hosts without one for
/// `local_device_index` cannot take part in a distributed run.
pub fn bind_device(local_device_index: usize) -> Result<Device, DeviceError> {
    match get_optimal_devices() {
        Devices::Cuda(indices) => Devices::Cuda(indices).device_for_rank(local_device_index),
        Devices::Cpu => Err(DeviceError::NoDeviceForRank {
            rank: local_device_index,
            devices: "no accelerators".to_owned(),
        }),
    }
}

/// Get all available devices, for debugging purposes
fn get_all_device_strings() -> Vec<String> {
    let mut strings = vec!["auto".to_string(), "cpu".to_string()];
    let cuda = get_cuda_devices();
    if !cuda.is_empty() {
        strings.push("cuda".to_string());
        strings.push(format!("cuda:{}", cuda.into_iter().join(",")));
    }
    strings
}

#[derive(Error, Debug)]
pub enum DevicesParseError {
    #[error("device {0} is not available on this system. Available devices are: {1}")]
    DeviceNotAvailable(String, String),

    #[error("invalid format for device(s) {0}: '{1}'")]
    InvalidDeviceFormat(String, String),

    #[error("invalid device '{0}'. Available devices are: {1}")]
    InvalidDevicesString(String, String),
}

impl FromStr for Devices {
    type Err = DevicesParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.to_lowercase();
        let not_available = |name: String| {
            DevicesParseError::DeviceNotAvailable(name, get_all_device_strings().join(", "))
        };
        match s.as_str() {
            "auto" => Ok(get_optimal_devices()),
            "cpu" => Ok(Devices::Cpu),
            "cuda" => {
                let available = get_cuda_devices();
                if available.is_empty() {
                    return Err(not_available("CUDA".to_owned()));
                }
                Ok(Devices::Cuda(available))
            }
            _ => {
                let Some(devices_str) = s.strip_prefix("cuda:") else {
                    return Err(DevicesParseError::InvalidDevicesString(
                        s.clone(),
                        get_all_device_strings().join(", "),
                    ));
                };
                let device_ids = devices_str
                    .split(',')
                    .map(|id_str| {
                        id_str.trim().parse::<usize>().map_err(|_| {
                            DevicesParseError::InvalidDeviceFormat(s.clone(), id_str.to_owned())
                        })
                    })
                    .collect::<Result<Vec<usize>, _>>()?;

                let available = get_cuda_devices();
                if let Some(missing) = device_ids.iter().find(|id| !available.contains(*id)) {
                    return Err(not_available(format!("cuda:{missing}")));
                }
                Ok(Devices::Cuda(device_ids))
            }
        }
    }
}
