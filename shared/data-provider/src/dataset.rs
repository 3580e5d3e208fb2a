use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
};

use hf_hub::api::sync::ApiError;
use parquet::{
    errors::ParquetError,
    file::reader::{FileReader, SerializedFileReader},
    record::Field,
};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    download_dataset_repo_sync,
    file_extensions::{DATA_FILE_EXTENSIONS, JSONL_EXTENSION, PARQUET_EXTENSION, TEXT_EXTENSION},
    hub::PARQUET_CONVERSION_REVISION,
};

pub const DEFAULT_TEXT_KEY: &str = "text";

/// Split names a data file may carry. Files that carry none belong to `train`.
const KNOWN_SPLITS: [&str; 5] = ["train", "validation", "valid", "test", "dev"];

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("failed to fetch dataset from HF hub: {0}")]
    HfHub(#[from] ApiError),

    #[error("failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("failed to read parquet file {path}: {source}")]
    Parquet {
        path: PathBuf,
        source: ParquetError,
    },

    #[error("{path}:{line}: invalid JSON: {source}")]
    Json {
        path: PathBuf,
        line: usize,
        source: serde_json::Error,
    },

    #[error("{path} has no string column `{column}`")]
    MissingColumn { path: PathBuf, column: String },

    #[error("dataset {0} has no .parquet, .jsonl or .txt files")]
    NoDataFiles(String),

    #[error("dataset {0} is defined by a loading script and trust_remote_code is disabled")]
    RemoteCodeRequired(String),

    #[error("dataset {dataset} has no files for split `{split}`")]
    NoSuchSplit { dataset: String, split: String },

    #[error("dataset {0} contains no documents")]
    Empty(String),
}

/// Where and how to read a dataset.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub split: String,
    pub text_key: String,
    /// Allows falling back to the hub's parquet export for repositories that
    /// only ship a loading script.
    pub trust_remote_code: bool,
    pub revision: Option<String>,
    pub cache: Option<PathBuf>,
    pub token: Option<String>,
    pub progress_bar: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            split: "train".to_owned(),
            text_key: DEFAULT_TEXT_KEY.to_owned(),
            trust_remote_code: true,
            revision: None,
            cache: None,
            token: None,
            progress_bar: false,
        }
    }
}

/// The text documents of one split, in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawDataset {
    texts: Vec<String>,
}

impl RawDataset {
    pub fn new(texts: Vec<String>) -> Self {
        Self { texts }
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    pub fn texts(&self) -> &[String] {
        &self.texts
    }
}

fn mentions_split(filename: &str, split: &str) -> bool {
    filename
        .to_lowercase()
        .split(['/', '\\', '-', '_', '.'])
        .any(|token| token == split)
}

/// Picks the files belonging to `split` out of a dataset's data files.
///
/// Files are matched on any path segment naming the split. A dataset whose
/// files name no split at all is treated as a single `train` split.
pub fn select_split_files(mut files: Vec<String>, split: &str) -> Vec<String> {
    files.sort();
    let split = split.to_lowercase();
    let matching: Vec<String> = files
        .iter()
        .filter(|file| mentions_split(file, &split))
        .cloned()
        .collect();
    if !matching.is_empty() {
        return matching;
    }
    let names_any_split = files
        .iter()
        .any(|file| KNOWN_SPLITS.iter().any(|known| mentions_split(file, known)));
    match split == "train" && !names_any_split {
        true => files,
        false => Vec::new(),
    }
}

fn is_data_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| DATA_FILE_EXTENSIONS.iter().any(|ext| name.ends_with(ext)))
}

fn collect_local_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), DatasetError> {
    let io_err = |source| DatasetError::Io {
        path: dir.to_owned(),
        source,
    };
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_dir() {
            collect_local_files(root, &path, out)?;
        } else if is_data_file(&path) {
            if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_string_lossy().into_owned());
            }
        }
    }
    Ok(())
}

fn read_parquet(path: &Path, text_key: &str) -> Result<Vec<String>, DatasetError> {
    let parquet_err = |source| DatasetError::Parquet {
        path: path.to_owned(),
        source,
    };
    let file = File::open(path).map_err(|source| DatasetError::Io {
        path: path.to_owned(),
        source,
    })?;
    let reader = SerializedFileReader::new(file).map_err(parquet_err)?;
    let mut texts = Vec::with_capacity(reader.metadata().file_metadata().num_rows().max(0) as usize);
    for row in reader.get_row_iter(None).map_err(parquet_err)? {
        let row = row.map_err(parquet_err)?;
        let text = row
            .get_column_iter()
            .find_map(|(name, field)| match field {
                Field::Str(text) if name == text_key => Some(text.clone()),
                _ => None,
            })
            .ok_or_else(|| DatasetError::MissingColumn {
                path: path.to_owned(),
                column: text_key.to_owned(),
            })?;
        texts.push(text);
    }
    Ok(texts)
}

fn read_jsonl(path: &Path, text_key: &str) -> Result<Vec<String>, DatasetError> {
    let io_err = |source| DatasetError::Io {
        path: path.to_owned(),
        source,
    };
    let reader = BufReader::new(File::open(path).map_err(io_err)?);
    let mut texts = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line.map_err(io_err)?;
        if line.trim().is_empty() {
            continue;
        }
        let record: serde_json::Value =
            serde_json::from_str(&line).map_err(|source| DatasetError::Json {
                path: path.to_owned(),
                line: index + 1,
                source,
            })?;
        let text = record
            .get(text_key)
            .and_then(|value| value.as_str())
            .ok_or_else(|| DatasetError::MissingColumn {
                path: path.to_owned(),
                column: text_key.to_owned(),
            })?;
        texts.push(text.to_owned());
    }
    Ok(texts)
}

/// One document per line, in a single `text` column.
fn read_text(path: &Path, text_key: &str) -> Result<Vec<String>, DatasetError> {
    if text_key != DEFAULT_TEXT_KEY {
        return Err(DatasetError::MissingColumn {
            path: path.to_owned(),
            column: text_key.to_owned(),
        });
    }
    let contents = std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
        path: path.to_owned(),
        source,
    })?;
    Ok(contents.lines().map(str::to_owned).collect())
}

fn read_data_file(path: &Path, text_key: &str) -> Result<Vec<String>, DatasetError> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some(PARQUET_EXTENSION) => read_parquet(path, text_key),
        Some(JSONL_EXTENSION) => read_jsonl(path, text_key),
        Some(TEXT_EXTENSION) => read_text(path, text_key),
        _ => Ok(Vec::new()),
    }
}

fn read_files(dataset: &str, files: &[PathBuf], text_key: &str) -> Result<RawDataset, DatasetError> {
    let texts = files
        .par_iter()
        .map(|file| read_data_file(file, text_key))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
    if texts.is_empty() {
        return Err(DatasetError::Empty(dataset.to_owned()));
    }
    info!(
        dataset,
        files = files.len(),
        documents = texts.len(),
        "Loaded dataset"
    );
    Ok(RawDataset::new(texts))
}

fn load_local(path: &Path, options: &LoadOptions) -> Result<RawDataset, DatasetError> {
    let name = path.display().to_string();
    if path.is_file() {
        return read_files(&name, &[path.to_owned()], &options.text_key);
    }

    let mut available = Vec::new();
    collect_local_files(path, path, &mut available)?;
    if available.is_empty() {
        return Err(DatasetError::NoDataFiles(name));
    }
    let files: Vec<PathBuf> = select_split_files(available, &options.split)
        .into_iter()
        .map(|relative| path.join(relative))
        .collect();
    if files.is_empty() {
        return Err(DatasetError::NoSuchSplit {
            dataset: name,
            split: options.split.clone(),
        });
    }
    read_files(&name, &files, &options.text_key)
}

fn download_split(
    repo_id: &str,
    revision: Option<String>,
    options: &LoadOptions,
) -> Result<(usize, Vec<PathBuf>), DatasetError> {
    let mut available = 0;
    let files = download_dataset_repo_sync(
        repo_id,
        revision,
        options.cache.clone(),
        options.token.clone(),
        options.progress_bar,
        |files| {
            available = files.len();
            select_split_files(files, &options.split)
        },
    )?;
    Ok((available, files))
}

/// Picks the files of the requested split, given `fetch` downloading the
/// split's files at a revision and reporting how many data files the repo has.
///
/// A repo with no data files is defined by a loading script. Those are read
/// through the hub's parquet export, and only when `trust_remote_code` is set.
fn resolve_hub_files(
    repo_id: &str,
    options: &LoadOptions,
    mut fetch: impl FnMut(Option<String>) -> Result<(usize, Vec<PathBuf>), DatasetError>,
) -> Result<Vec<PathBuf>, DatasetError> {
    let (mut available, mut files) = fetch(options.revision.clone())?;
    if available == 0 {
        if !options.trust_remote_code {
            return Err(DatasetError::RemoteCodeRequired(repo_id.to_owned()));
        }
        warn!(
            dataset = repo_id,
            revision = PARQUET_CONVERSION_REVISION,
            "Dataset ships no data files, reading the hub's parquet export instead"
        );
        (available, files) = fetch(Some(PARQUET_CONVERSION_REVISION.to_owned()))?;
    }
    if available == 0 {
        return Err(DatasetError::NoDataFiles(repo_id.to_owned()));
    }
    if files.is_empty() {
        return Err(DatasetError::NoSuchSplit {
            dataset: repo_id.to_owned(),
            split: options.split.clone(),
        });
    }
    Ok(files)
}

fn load_hub(repo_id: &str, options: &LoadOptions) -> Result<RawDataset, DatasetError> {
    let files = resolve_hub_files(repo_id, options, |revision| {
        download_split(repo_id, revision, options)
    })?;
    read_files(repo_id, &files, &options.text_key)
}

/// Loads one split of a dataset, from a local path if one exists, otherwise
/// from the Hugging Face hub.
pub fn load_dataset(dataset: &str, options: &LoadOptions) -> Result<RawDataset, DatasetError> {
    let path = Path::new(dataset);
    if path.exists() {
        load_local(path, options)
    } else {
        load_hub(dataset, options)
    }
}
