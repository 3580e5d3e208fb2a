use hf_hub::{
    api::sync::{ApiBuilder, ApiError},
    Cache, Repo, RepoType,
};
use std::{path::PathBuf, time::Instant};
use tracing::{debug, info};

use crate::file_extensions::{DATA_FILE_EXTENSIONS, MODEL_FILE_EXTENSIONS};

/// Hub revision holding the automatic parquet export of a dataset.
pub const PARQUET_CONVERSION_REVISION: &str = "refs/convert/parquet";

fn has_extension(filename: &str, extensions: &[&'static str]) -> bool {
    extensions.is_empty() || extensions.iter().any(|ext| filename.ends_with(ext))
}

fn download_repo_sync(
    repo: Repo,
    cache: Option<PathBuf>,
    token: Option<String>,
    progress_bar: bool,
    extensions: &[&'static str],
    select: impl FnOnce(Vec<String>) -> Vec<String>,
) -> Result<Vec<PathBuf>, ApiError> {
    let cache = match cache {
        Some(cache) => Cache::new(cache),
        None => Cache::default(),
    };
    let api = ApiBuilder::new()
        .with_cache_dir(cache.path().clone())
        .with_token(token.or(cache.token()))
        .with_progress(progress_bar)
        .build()?
        .repo(repo);
    let candidates = api
        .info()?
        .siblings
        .into_iter()
        .map(|sibling| sibling.rfilename)
        .filter(|name| has_extension(name, extensions))
        .collect::<Vec<_>>();

    select(candidates)
        .into_iter()
        .map(|filename| -> Result<PathBuf, ApiError> {
            let start_time = Instant::now();
            debug!(filename, "Starting file download from hub");
            let path = api.get(&filename)?;
            info!(
                filename,
                duration_secs = start_time.elapsed().as_secs_f32(),
                "Finished downloading file from hub"
            );
            Ok(path)
        })
        .collect()
}

/// Downloads the weights, configs and tokenizer of a model repository.
pub fn download_model_repo_sync(
    repo_id: &str,
    revision: Option<String>,
    cache: Option<PathBuf>,
    token: Option<String>,
    progress_bar: bool,
) -> Result<Vec<PathBuf>, ApiError> {
    download_repo_sync(
        match revision {
            Some(revision) => Repo::with_revision(repo_id.to_owned(), RepoType::Model, revision),
            None => Repo::model(repo_id.to_owned()),
        },
        cache,
        token,
        progress_bar,
        &MODEL_FILE_EXTENSIONS,
        |files| files,
    )
}

/// Downloads the data files of a dataset repository that `select` keeps.
///
/// `select` sees the repository-relative names of every data file.
pub fn download_dataset_repo_sync(
    repo_id: &str,
    revision: Option<String>,
    cache: Option<PathBuf>,
    token: Option<String>,
    progress_bar: bool,
    select: impl FnOnce(Vec<String>) -> Vec<String>,
) -> Result<Vec<PathBuf>, ApiError> {
    download_repo_sync(
        match revision {
            Some(revision) => Repo::with_revision(repo_id.to_owned(), RepoType::Dataset, revision),
            None => Repo::new(repo_id.to_owned(), RepoType::Dataset),
        },
        cache,
        token,
        progress_bar,
        &DATA_FILE_EXTENSIONS,
        select,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_filter() {
        assert!(has_extension("model.safetensors", &MODEL_FILE_EXTENSIONS));
        assert!(has_extension("config.json", &MODEL_FILE_EXTENSIONS));
        assert!(!has_extension("modeling_gpt.py", &MODEL_FILE_EXTENSIONS));
        assert!(has_extension("data/train-0000.parquet", &DATA_FILE_EXTENSIONS));
        assert!(!has_extension("README.md", &DATA_FILE_EXTENSIONS));
        assert!(has_extension("anything", &[]));
    }
}
