mod chunking;
mod dataset;
mod file_extensions;
mod hub;
mod tokenized;

pub use chunking::{
    chunk_and_tokenize, ChunkError, ChunkOptions, TextTokenizer, DEFAULT_CHUNK_BATCH_SIZE,
    DEFAULT_SEPARATOR,
};
pub use dataset::{
    load_dataset, select_split_files, DatasetError, LoadOptions, RawDataset, DEFAULT_TEXT_KEY,
};
pub use file_extensions::{DATA_FILE_EXTENSIONS, MODEL_FILE_EXTENSIONS, PARQUET_EXTENSION};
pub use hub::{download_dataset_repo_sync, download_model_repo_sync, PARQUET_CONVERSION_REVISION};
pub use tokenized::{TokenSequence, TokenizedDataset};
