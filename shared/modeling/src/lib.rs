mod auto_config;
mod auto_model;
mod auto_tokenizer;
mod device_utils;
mod precision;
mod quantization;
mod trainer;

pub use auto_config::{
    dtype_name, parse_torch_dtype, ModelConfig, ModelLoadError, PretrainedSource,
};
pub use auto_model::{
    auto_model_from_pretrained, fetch_pretrained, load_weights, ModelHandle, ModelLoadRequest,
};
pub use auto_tokenizer::{auto_tokenizer, AutoTokenizerError, HubTokenizer};
pub use device_utils::{bind_device, get_optimal_devices, DeviceError, Devices, DevicesParseError};
pub use precision::{supports_bf16, PrecisionChoice};
pub use quantization::{is_quantizable, Int8Weight, QuantizationConfig};
pub use trainer::{DataFeedTrainer, FitSummary, Trainer, TrainerSettings};
