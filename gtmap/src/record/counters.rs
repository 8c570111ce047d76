/// Strata histogram: `counts[d]` is the number of candidates at distance `d`.
///
/// `mcs` (max complete strata) is the number of leading strata the mapper
/// searched exhaustively. It is written as a `+` separator in the text
/// format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    counts: Vec<u64>,
    mcs: Option<usize>,
}

impl Counters {
    pub fn new(counts: Vec<u64>, mcs: Option<usize>) -> Self {
        Self { counts, mcs }
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.counts
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn get(&self, stratum: usize) -> u64 {
        self.counts.get(stratum).copied().unwrap_or(0)
    }

    pub fn mcs(&self) -> Option<usize> {
        self.mcs
    }

    pub fn set_mcs(&mut self, mcs: Option<usize>) {
        self.mcs = mcs;
    }

    /// Drop every count but keep the max complete strata.
    pub fn clear(&mut self) {
        self.counts.clear();
    }

    pub fn increment(&mut self, stratum: usize) {
        if self.counts.len() <= stratum {
            self.counts.resize(stratum + 1, 0);
        }
        self.counts[stratum] += 1;
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn is_mapped(&self) -> bool {
        self.counts.iter().any(|&c| c > 0)
    }

    /// Number of empty strata separating a unique best match from the next
    /// populated stratum; 0 when the best stratum is ambiguous and -1 when
    /// nothing mapped.
    pub fn uniq_degree(&self) -> i64 {
        let Some(best) = self.counts.iter().position(|&c| c > 0) else {
            return -1;
        };
        if self.counts[best] > 1 {
            return 0;
        }
        let next = self.counts[best + 1..]
            .iter()
            .position(|&c| c > 0)
            .map(|i| best + 1 + i)
            .unwrap_or_else(|| self.counts.len().max(self.mcs.unwrap_or(0)));
        (next - best - 1) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_grows() {
        let mut counters = Counters::default();
        counters.increment(3);
        counters.increment(3);
        counters.increment(0);
        assert_eq!(counters.as_slice(), &[1, 0, 0, 2]);
        assert_eq!(counters.total(), 3);
        counters.clear();
        assert!(!counters.is_mapped());
    }

    #[test]
    fn test_uniq_degree() {
        assert_eq!(Counters::new(vec![0], None).uniq_degree(), -1);
        assert_eq!(Counters::new(vec![], None).uniq_degree(), -1);
        assert_eq!(Counters::new(vec![0, 2, 1], None).uniq_degree(), 0);
        assert_eq!(Counters::new(vec![1, 0, 0, 4], None).uniq_degree(), 2);
        assert_eq!(Counters::new(vec![0, 1], None).uniq_degree(), 0);
        assert_eq!(Counters::new(vec![0, 1, 0], Some(2)).uniq_degree(), 1);
        assert_eq!(Counters::new(vec![1], Some(0)).uniq_degree(), 0);
    }
}
