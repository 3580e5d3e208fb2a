use std::{fmt, ops::Range};

use clap::ValueEnum;
use thiserror::Error;

/// How an ordered collection is split between ranks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ShardStrategy {
    /// Each rank gets one contiguous block. Earlier ranks take the remainder.
    #[default]
    Contiguous,
    /// Rank `r` gets every element whose index is congruent to `r`.
    Strided,
}

impl fmt::Display for ShardStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardStrategy::Contiguous => write!(f, "contiguous"),
            ShardStrategy::Strided => write!(f, "strided"),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PartitionError {
    #[error("cannot split data into zero shards")]
    NoShards,

    #[error("shard index {index} is out of range for {num_shards} shards")]
    IndexOutOfRange { index: usize, num_shards: usize },

    #[error("{len} sequences cannot be split across {num_shards} ranks without leaving a rank empty")]
    NotEnoughSequences { len: usize, num_shards: usize },
}

/// The indices of one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardIndices {
    Contiguous(Range<usize>),
    Strided { start: usize, step: usize, end: usize },
}

impl ShardIndices {
    pub fn len(&self) -> usize {
        match self {
            ShardIndices::Contiguous(range) => range.len(),
            ShardIndices::Strided { start, step, end } => {
                if start >= end {
                    0
                } else {
                    (end - start).div_ceil(*step)
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, index: usize) -> bool {
        match self {
            ShardIndices::Contiguous(range) => range.contains(&index),
            ShardIndices::Strided { start, step, end } => {
                index >= *start && index < *end && (index - start) % step == 0
            }
        }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = usize> + '_> {
        match self {
            ShardIndices::Contiguous(range) => Box::new(range.clone()),
            ShardIndices::Strided { start, step, end } => Box::new((*start..*end).step_by(*step)),
        }
    }
}

/// Computes which indices of a `len`-long collection belong to shard `index`.
///
/// Every rank computes its own shard with no communication, so the result
/// depends only on the arguments. The shards of all indices cover `0..len`
/// exactly once and their sizes differ by at most one. A world larger than the
/// collection is rejected rather than handing some ranks nothing.
pub fn shard_indices(
    len: usize,
    num_shards: usize,
    index: usize,
    strategy: ShardStrategy,
) -> Result<ShardIndices, PartitionError> {
    if num_shards == 0 {
        return Err(PartitionError::NoShards);
    }
    if index >= num_shards {
        return Err(PartitionError::IndexOutOfRange { index, num_shards });
    }
    if len < num_shards {
        return Err(PartitionError::NotEnoughSequences { len, num_shards });
    }

    Ok(match strategy {
        ShardStrategy::Contiguous => {
            let div = len / num_shards;
            let rem = len % num_shards;
            let start = div * index + index.min(rem);
            let end = start + div + usize::from(index < rem);
            ShardIndices::Contiguous(start..end)
        }
        ShardStrategy::Strided => ShardIndices::Strided {
            start: index,
            step: num_shards,
            end: len,
        },
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn collect_all(len: usize, world: usize, strategy: ShardStrategy) -> Vec<Vec<usize>> {
        (0..world)
            .map(|rank| {
                shard_indices(len, world, rank, strategy)
                    .unwrap()
                    .iter()
                    .collect()
            })
            .collect()
    }

    #[test]
    fn contiguous_shards_of_ten_over_four() {
        let shards = collect_all(10, 4, ShardStrategy::Contiguous);
        assert_eq!(
            shards,
            vec![vec![0, 1, 2], vec![3, 4, 5], vec![6, 7], vec![8, 9]]
        );
    }

    #[test]
    fn strided_shards_of_ten_over_four() {
        let shards = collect_all(10, 4, ShardStrategy::Strided);
        assert_eq!(
            shards,
            vec![vec![0, 4, 8], vec![1, 5, 9], vec![2, 6], vec![3, 7]]
        );
    }

    #[test]
    fn shards_cover_everything_exactly_once() {
        for strategy in [ShardStrategy::Contiguous, ShardStrategy::Strided] {
            for len in 1..40 {
                for world in 1..=len.min(9) {
                    let shards = collect_all(len, world, strategy);
                    let mut seen: Vec<usize> = shards.iter().flatten().copied().collect();
                    seen.sort_unstable();
                    assert_eq!(seen, (0..len).collect::<Vec<_>>());

                    let sizes: Vec<usize> = shards.iter().map(Vec::len).collect();
                    let max = *sizes.iter().max().unwrap();
                    let min = *sizes.iter().min().unwrap();
                    assert!(max - min <= 1, "{strategy} {len}/{world}: {sizes:?}");

                    for (rank, shard) in shards.iter().enumerate() {
                        let indices = shard_indices(len, world, rank, strategy).unwrap();
                        assert_eq!(indices.len(), shard.len());
                        let members: Vec<usize> =
                            (0..len).filter(|i| indices.contains(*i)).collect();
                        assert_eq!(&members, shard);
                    }
                }
            }
        }
    }

    #[test]
    fn same_arguments_same_shard() {
        let a = shard_indices(1000, 7, 3, ShardStrategy::Contiguous).unwrap();
        let b = shard_indices(1000, 7, 3, ShardStrategy::Contiguous).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn single_shard_is_identity() {
        assert_eq!(
            shard_indices(5, 1, 0, ShardStrategy::Contiguous).unwrap(),
            ShardIndices::Contiguous(0..5)
        );
    }

    #[test]
    fn invalid_partitions_fail() {
        assert_eq!(
            shard_indices(10, 0, 0, ShardStrategy::Contiguous),
            Err(PartitionError::NoShards)
        );
        assert_eq!(
            shard_indices(10, 4, 4, ShardStrategy::Strided),
            Err(PartitionError::IndexOutOfRange {
                index: 4,
                num_shards: 4
            })
        );
        assert_eq!(
            shard_indices(3, 4, 0, ShardStrategy::Contiguous),
            Err(PartitionError::NotEnoughSequences {
                len: 3,
                num_shards: 4
            })
        );
    }
}
