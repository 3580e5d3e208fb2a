use std::time::Instant;

use rayon::{
    iter::{IndexedParallelIterator, ParallelIterator},
    slice::ParallelSlice,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::{RawDataset, TokenSequence, TokenizedDataset};

/// Documents tokenized and packed together before chunking.
pub const DEFAULT_CHUNK_BATCH_SIZE: usize = 2048;
/// Separator used when the tokenizer has no EOS token.
pub const DEFAULT_SEPARATOR: &str = "<|endoftext|>";

/// What the chunker needs from a tokenizer.
pub trait TextTokenizer: Send + Sync {
    /// Token ids of `text`, without any special tokens added.
    fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>>;

    fn eos_token(&self) -> Option<&str>;

    /// Longest sequence the model was trained on, if the tokenizer knows it.
    fn model_max_length(&self) -> Option<usize>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOptions {
    pub max_seq_len: usize,
    pub batch_size: usize,
}

impl ChunkOptions {
    pub fn new(max_seq_len: usize) -> Self {
        Self {
            max_seq_len,
            batch_size: DEFAULT_CHUNK_BATCH_SIZE,
        }
    }
}

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("chunk length must be positive")]
    ZeroLength,

    #[error("failed to tokenize document {index}: {source}")]
    Tokenizer {
        index: usize,
        source: anyhow::Error,
    },

    #[error("{documents} documents are too short to fill a single {chunk_size} token chunk")]
    NotEnoughData { documents: usize, chunk_size: usize },
}

fn chunk_batch(
    first_index: usize,
    texts: &[String],
    tokenizer: &dyn TextTokenizer,
    separator: &str,
    chunk_size: usize,
) -> Result<Vec<TokenSequence>, ChunkError> {
    let mut tokens = Vec::new();
    // (token offset, document index) for every document of the batch
    let mut starts = Vec::with_capacity(texts.len());
    for (offset, text) in texts.iter().enumerate() {
        let index = first_index + offset;
        let ids = tokenizer
            .encode(&format!("{separator}{text}"))
            .map_err(|source| ChunkError::Tokenizer { index, source })?;
        starts.push((tokens.len(), index));
        tokens.extend(ids);
    }

    Ok(tokens
        .chunks_exact(chunk_size)
        .enumerate()
        .map(|(chunk, input_ids)| {
            let begin = chunk * chunk_size;
            let owner = starts.partition_point(|(offset, _)| *offset <= begin);
            TokenSequence {
                input_ids: input_ids.to_vec(),
                source_index: starts[owner - 1].1,
            }
        })
        .collect())
}

/// Tokenizes every document and cuts the token stream into equal chunks.
///
/// Documents are taken `batch_size` at a time. Within a batch each document is
/// prefixed with the EOS separator, the token ids are concatenated, and the
/// stream is cut into windows of `min(model_max_length, max_seq_len)` tokens;
/// a trailing partial window is dropped. Batches run in parallel and the output
/// keeps document order.
pub fn chunk_and_tokenize(
    dataset: &RawDataset,
    tokenizer: &dyn TextTokenizer,
    options: &ChunkOptions,
) -> Result<TokenizedDataset, ChunkError> {
    let chunk_size = match tokenizer.model_max_length() {
        Some(max) => max.min(options.max_seq_len),
        None => options.max_seq_len,
    };
    if chunk_size == 0 {
        return Err(ChunkError::ZeroLength);
    }
    let separator = tokenizer.eos_token().unwrap_or(DEFAULT_SEPARATOR);
    let batch_size = options.batch_size.max(1);
    debug!(chunk_size, batch_size, separator, "Chunking dataset");

    let start_time = Instant::now();
    let batches: Vec<Vec<TokenSequence>> = dataset
        .texts()
        .par_chunks(batch_size)
        .enumerate()
        .map(|(batch, texts)| {
            chunk_batch(batch * batch_size, texts, tokenizer, separator, chunk_size)
        })
        .collect::<Result<_, _>>()?;
    let sequences: Vec<TokenSequence> = batches.into_iter().flatten().collect();

    if sequences.is_empty() {
        return Err(ChunkError::NotEnoughData {
            documents: dataset.len(),
            chunk_size,
        });
    }
    info!(
        documents = dataset.len(),
        sequences = sequences.len(),
        chunk_size,
        duration_secs = start_time.elapsed().as_secs_f32(),
        "Tokenized dataset"
    );
    Ok(TokenizedDataset::new(chunk_size, sequences))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// One token per whitespace-separated word, the separator is token 0.
    struct WordTokenizer {
        max_len: Option<usize>,
    }

    impl TextTokenizer for WordTokenizer {
        fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
            let (sep, rest) = match text.strip_prefix("<eos>") {
                Some(rest) => (vec![0], rest),
                None => (vec![], text),
            };
            Ok(sep
                .into_iter()
                .chain(rest.split_whitespace().map(|w| w.len() as u32))
                .collect())
        }

        fn eos_token(&self) -> Option<&str> {
            Some("<eos>")
        }

        fn model_max_length(&self) -> Option<usize> {
            self.max_len
        }
    }

    fn docs(words_per_doc: &[usize]) -> RawDataset {
        RawDataset::new(
            words_per_doc
                .iter()
                .map(|n| vec!["word"; *n].join(" "))
                .collect(),
        )
    }

    #[test]
    fn documents_that_fill_one_chunk_each() {
        let tokenizer = WordTokenizer { max_len: None };
        let tokenized =
            chunk_and_tokenize(&docs(&[7; 10]), &tokenizer, &ChunkOptions::new(8)).unwrap();
        assert_eq!(tokenized.len(), 10);
        assert_eq!(tokenized.seq_len(), 8);
        let sources: Vec<_> = tokenized.iter().map(|s| s.source_index).collect();
        assert_eq!(sources, (0..10).collect::<Vec<_>>());
        assert_eq!(tokenized.get(0).unwrap().input_ids, vec![0, 4, 4, 4, 4, 4, 4, 4]);
    }

    #[test]
    fn trailing_partial_chunk_is_dropped() {
        let tokenizer = WordTokenizer { max_len: None };
        // 3 + 3 + 3 tokens with separators = 9 tokens, chunks of 4
        let tokenized =
            chunk_and_tokenize(&docs(&[2, 2, 2]), &tokenizer, &ChunkOptions::new(4)).unwrap();
        assert_eq!(tokenized.len(), 2);
        let sources: Vec<_> = tokenized.iter().map(|s| s.source_index).collect();
        assert_eq!(sources, vec![0, 1]);
    }

    #[test]
    fn model_max_length_caps_the_chunk() {
        let tokenizer = WordTokenizer { max_len: Some(4) };
        let tokenized =
            chunk_and_tokenize(&docs(&[7, 7]), &tokenizer, &ChunkOptions::new(2048)).unwrap();
        assert_eq!(tokenized.seq_len(), 4);
        assert_eq!(tokenized.len(), 4);
    }

    #[test]
    fn batches_are_chunked_independently() {
        let tokenizer = WordTokenizer { max_len: None };
        let options = ChunkOptions {
            max_seq_len: 4,
            batch_size: 1,
        };
        // each document alone is 3 tokens, too short for a chunk
        let result = chunk_and_tokenize(&docs(&[2, 2, 2]), &tokenizer, &options);
        assert!(matches!(
            result,
            Err(ChunkError::NotEnoughData {
                documents: 3,
                chunk_size: 4
            })
        ));
    }

    #[test]
    fn output_order_matches_input_order_across_batches() {
        let tokenizer = WordTokenizer { max_len: None };
        let options = ChunkOptions {
            max_seq_len: 4,
            batch_size: 3,
        };
        let tokenized = chunk_and_tokenize(&docs(&[3; 100]), &tokenizer, &options).unwrap();
        assert_eq!(tokenized.len(), 100);
        let sources: Vec<_> = tokenized.iter().map(|s| s.source_index).collect();
        assert_eq!(sources, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn zero_context_is_rejected() {
        let tokenizer = WordTokenizer { max_len: None };
        assert!(matches!(
            chunk_and_tokenize(&docs(&[3]), &tokenizer, &ChunkOptions::new(0)),
            Err(ChunkError::ZeroLength)
        ));
    }
}
