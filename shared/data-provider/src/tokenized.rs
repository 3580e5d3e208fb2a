use sae_core::{shard_indices, PartitionError, ShardStrategy};

/// One fixed-length window of token ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSequence {
    pub input_ids: Vec<u32>,
    /// Index of the document the window starts in.
    pub source_index: usize,
}

/// Ordered collection of equally long token sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedDataset {
    seq_len: usize,
    sequences: Vec<TokenSequence>,
}

impl TokenizedDataset {
    pub fn new(seq_len: usize, sequences: Vec<TokenSequence>) -> Self {
        debug_assert!(sequences.iter().all(|s| s.input_ids.len() == seq_len));
        Self { seq_len, sequences }
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn num_tokens(&self) -> usize {
        self.seq_len * self.sequences.len()
    }

    pub fn get(&self, index: usize) -> Option<&TokenSequence> {
        self.sequences.get(index)
    }

    pub fn sequences(&self) -> &[TokenSequence] {
        &self.sequences
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TokenSequence> {
        self.sequences.iter()
    }

    /// Keeps only shard `index` of `num_shards`.
    ///
    /// Every rank calls this with the same dataset and its own index; the
    /// shards are disjoint and together hold every sequence once.
    pub fn shard(
        self,
        num_shards: usize,
        index: usize,
        strategy: ShardStrategy,
    ) -> Result<Self, PartitionError> {
        let indices = shard_indices(self.len(), num_shards, index, strategy)?;
        let sequences = self
            .sequences
            .into_iter()
            .enumerate()
            .filter(|(i, _)| indices.contains(*i))
            .map(|(_, sequence)| sequence)
            .collect();
        Ok(Self {
            seq_len: self.seq_len,
            sequences,
        })
    }
}

impl<'a> IntoIterator for &'a TokenizedDataset {
    type Item = &'a TokenSequence;
    type IntoIter = std::slice::Iter<'a, TokenSequence>;

    fn into_iter(self) -> Self::IntoIter {
        self.sequences.iter()
    }
}
