use std::fmt;

use smallvec::{smallvec, SmallVec};

use super::Mismatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strand {
    Forward,
    Reverse,
}

impl Strand {
    pub fn sigil(&self) -> u8 {
        match self {
            Strand::Forward => b'+',
            Strand::Reverse => b'-',
        }
    }

    pub fn from_sigil(c: u8) -> Option<Self> {
        match c {
            b'+' | b'F' => Some(Strand::Forward),
            b'-' | b'R' => Some(Strand::Reverse),
            _ => None,
        }
    }
}

impl fmt::Display for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sigil() as char)
    }
}

/// A contiguous stretch of a map on one reference sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MapBlock {
    pub seq_name: String,
    pub strand: Strand,
    /// 1-based genomic start.
    pub position: u64,
    /// Span on the reference.
    pub length: u64,
    pub mismatches: Vec<Mismatch>,
}

impl MapBlock {
    pub fn new(seq_name: impl Into<String>, strand: Strand, position: u64, length: u64) -> Self {
        Self {
            seq_name: seq_name.into(),
            strand,
            position,
            length,
            mismatches: Vec::new(),
        }
    }

    pub fn with_mismatches(mut self, mismatches: Vec<Mismatch>) -> Self {
        self.mismatches = mismatches;
        self
    }

    /// Exclusive genomic end.
    pub fn end(&self) -> u64 {
        self.position + self.length
    }

    pub fn distance(&self) -> u64 {
        self.mismatches.len() as u64
    }

    pub fn levenshtein(&self) -> u64 {
        self.mismatches.iter().map(|m| m.levenshtein()).sum()
    }

    /// Genomic gap to the following block of the same map, `None` when the
    /// blocks are on different references or strands.
    pub fn junction_size(&self, next: &MapBlock) -> Option<u64> {
        if self.seq_name != next.seq_name || self.strand != next.strand {
            return None;
        }
        let gap = match self.strand {
            Strand::Forward => next.position.saturating_sub(self.end()),
            Strand::Reverse => self.position.saturating_sub(next.end()),
        };
        Some(gap)
    }
}

/// One candidate placement of a read. A split map holds several blocks in
/// read order; the chain is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Map {
    blocks: SmallVec<[MapBlock; 1]>,
    pub score: Option<u64>,
}

impl Map {
    pub fn new(block: MapBlock) -> Self {
        Self {
            blocks: smallvec![block],
            score: None,
        }
    }

    pub fn with_score(mut self, score: u64) -> Self {
        self.score = Some(score);
        self
    }

    /// Append the next block of a split map.
    pub fn push_block(&mut self, block: MapBlock) {
        self.blocks.push(block);
    }

    pub fn blocks(&self) -> &[MapBlock] {
        &self.blocks
    }

    pub fn first_block(&self) -> &MapBlock {
        &self.blocks[0]
    }

    pub fn last_block(&self) -> &MapBlock {
        &self.blocks[self.blocks.len() - 1]
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_split(&self) -> bool {
        self.blocks.len() > 1
    }

    pub fn seq_name(&self) -> &str {
        &self.first_block().seq_name
    }

    pub fn position(&self) -> u64 {
        self.first_block().position
    }

    pub fn strand(&self) -> Strand {
        self.first_block().strand
    }

    /// Total reference span covered by the blocks (junctions excluded).
    pub fn length(&self) -> u64 {
        self.blocks.iter().map(|b| b.length).sum()
    }

    /// Every junction between blocks is charged as one event.
    pub fn global_distance(&self) -> u64 {
        self.blocks.iter().map(|b| b.distance()).sum::<u64>() + (self.num_blocks() as u64 - 1)
    }

    /// Distance without the junction penalty: `global - (num_blocks - 1)`.
    pub fn no_split_distance(&self) -> u64 {
        self.global_distance() - (self.num_blocks() as u64 - 1)
    }

    pub fn levenshtein(&self) -> u64 {
        self.blocks.iter().map(|b| b.levenshtein()).sum()
    }

    pub fn mismatches(&self) -> impl Iterator<Item = &Mismatch> {
        self.blocks.iter().flat_map(|b| b.mismatches.iter())
    }

    /// Junction sizes between consecutive blocks; chimeric junctions are
    /// reported as `u64::MAX`.
    pub fn junction_sizes(&self) -> impl Iterator<Item = u64> + '_ {
        self.blocks
            .windows(2)
            .map(|w| w[0].junction_size(&w[1]).unwrap_or(u64::MAX))
    }

    pub fn min_junction_size(&self) -> Option<u64> {
        self.junction_sizes().min()
    }

    pub fn min_block_length(&self) -> u64 {
        self.blocks.iter().map(|b| b.length).min().unwrap_or(0)
    }

    /// Mapping quality used by the score filters.
    pub fn mapq(&self) -> u64 {
        mapq(self.score)
    }

    /// Leftmost and rightmost (exclusive) genomic coordinates of the map on
    /// its first reference.
    pub fn genomic_span(&self) -> (u64, u64) {
        let name = self.seq_name();
        self.blocks
            .iter()
            .filter(|b| b.seq_name == name)
            .fold((u64::MAX, 0), |(lo, hi), b| (lo.min(b.position), hi.max(b.end())))
    }
}

/// Mapping quality of a score: clamped to 255, missing scores count as 0.
pub fn mapq(score: Option<u64>) -> u64 {
    score.unwrap_or(0).min(255)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(pos: u64, len: u64, misms: usize) -> MapBlock {
        MapBlock::new("chr1", Strand::Forward, pos, len).with_mismatches(
            (0..misms)
                .map(|i| Mismatch::Substitution { position: i, base: b'A' })
                .collect(),
        )
    }

    #[test]
    fn test_no_split_distance() {
        for k in 1..=5usize {
            let mut map = Map::new(block(100, 20, 2));
            for i in 1..k {
                map.push_block(block(100 + i as u64 * 1000, 20, 1));
            }
            let d = map.global_distance();
            assert_eq!(d, 2 + (k as u64 - 1) + (k as u64 - 1));
            assert_eq!(map.no_split_distance(), d - (k as u64 - 1));
        }
    }

    #[test]
    fn test_junction_sizes() {
        let mut map = Map::new(block(100, 50, 0));
        map.push_block(block(500, 25, 0));
        map.push_block(block(600, 25, 0));
        assert_eq!(map.junction_sizes().collect::<Vec<_>>(), vec![350, 75]);
        assert_eq!(map.min_junction_size(), Some(75));
        assert_eq!(map.min_block_length(), 25);
        assert_eq!(map.length(), 100);
        assert_eq!(map.genomic_span(), (100, 625));

        let mut rev = Map::new(MapBlock::new("chr2", Strand::Reverse, 900, 30));
        rev.push_block(MapBlock::new("chr2", Strand::Reverse, 500, 40));
        assert_eq!(rev.min_junction_size(), Some(360));

        let mut chimera = Map::new(block(100, 50, 0));
        chimera.push_block(MapBlock::new("chr9", Strand::Forward, 10, 10));
        assert_eq!(chimera.min_junction_size(), Some(u64::MAX));
    }

    #[test]
    fn test_levenshtein_counts_indel_sizes() {
        let b = MapBlock::new("chr1", Strand::Forward, 1, 40).with_mismatches(vec![
            Mismatch::Substitution { position: 3, base: b'C' },
            Mismatch::Insertion { position: 10, size: 3 },
            Mismatch::Deletion { position: 20, size: 2 },
        ]);
        assert_eq!(b.distance(), 3);
        assert_eq!(b.levenshtein(), 6);
    }

    #[test]
    fn test_mapq_clamps() {
        assert_eq!(Map::new(block(1, 1, 0)).mapq(), 0);
        assert_eq!(Map::new(block(1, 1, 0)).with_score(253).mapq(), 253);
        assert_eq!(Map::new(block(1, 1, 0)).with_score(70000).mapq(), 255);
    }
}
