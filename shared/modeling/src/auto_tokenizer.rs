use std::path::{Path, PathBuf};

use sae_data_provider::TextTokenizer;
use serde::Deserialize;
use thiserror::Error;
use tokenizers::Tokenizer;

#[derive(Error, Debug)]
pub enum AutoTokenizerError {
    #[error("could not find tokenizer.json")]
    FileNotFound,

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid tokenizer_config.json: {0}")]
    Config(#[from] serde_json::Error),

    #[error("could not load tokenizer: {0}")]
    Tokenizer(String),
}

/// Special tokens can be spelled as a plain string or as an added-token object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TokenSpec {
    Plain(String),
    Added { content: String },
}

impl TokenSpec {
    fn into_content(self) -> String {
        match self {
            TokenSpec::Plain(content) | TokenSpec::Added { content } => content,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenizerConfig {
    eos_token: Option<TokenSpec>,
    model_max_length: Option<f64>,
}

/// Anything above this is the "unlimited" sentinel transformers writes.
const MAX_SANE_MODEL_LENGTH: f64 = 1e9;

/// A `tokenizers` tokenizer plus the bits of `tokenizer_config.json` the
/// chunker needs.
#[derive(Debug, Clone)]
pub struct HubTokenizer {
    tokenizer: Tokenizer,
    eos_token: Option<String>,
    model_max_length: Option<usize>,
}

impl HubTokenizer {
    pub fn new(
        tokenizer: Tokenizer,
        eos_token: Option<String>,
        model_max_length: Option<usize>,
    ) -> Self {
        Self {
            tokenizer,
            eos_token,
            model_max_length,
        }
    }

    pub fn eos_token_id(&self) -> Option<u32> {
        self.eos_token
            .as_deref()
            .and_then(|token| self.tokenizer.token_to_id(token))
    }
}

impl TextTokenizer for HubTokenizer {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|err| anyhow::anyhow!("{err}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn eos_token(&self) -> Option<&str> {
        self.eos_token.as_deref()
    }

    fn model_max_length(&self) -> Option<usize> {
        self.model_max_length
    }
}

fn find_file<'a>(files: &'a [PathBuf], name: &str) -> Option<&'a Path> {
    files
        .iter()
        .find(|path| path.file_name().is_some_and(|file| file == name))
        .map(PathBuf::as_path)
}

/// Loads `tokenizer.json` and, if present, `tokenizer_config.json` from a
/// model repository's files.
pub fn auto_tokenizer(repo_files: &[PathBuf]) -> Result<HubTokenizer, AutoTokenizerError> {
    let tokenizer_path =
        find_file(repo_files, "tokenizer.json").ok_or(AutoTokenizerError::FileNotFound)?;
    let tokenizer = Tokenizer::from_file(tokenizer_path)
        .map_err(|err| AutoTokenizerError::Tokenizer(err.to_string()))?;

    let config = match find_file(repo_files, "tokenizer_config.json") {
        Some(path) => {
            let contents =
                std::fs::read_to_string(path).map_err(|source| AutoTokenizerError::Io {
                    path: path.to_owned(),
                    source,
                })?;
            serde_json::from_str(&contents)?
        }
        None => TokenizerConfig::default(),
    };

    let model_max_length = config
        .model_max_length
        .filter(|len| *len >= 1.0 && *len < MAX_SANE_MODEL_LENGTH)
        .map(|len| len as usize);
    Ok(HubTokenizer::new(
        tokenizer,
        config.eos_token.map(TokenSpec::into_content),
        model_max_length,
    ))
}
