pub const PARQUET_EXTENSION: &str = "parquet";
pub const JSONL_EXTENSION: &str = "jsonl";
pub const TEXT_EXTENSION: &str = "txt";

pub const DATA_FILE_EXTENSIONS: [&str; 3] = [".parquet", ".jsonl", ".txt"];
pub const MODEL_FILE_EXTENSIONS: [&str; 2] = [".safetensors", ".json"];
