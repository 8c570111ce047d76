use std::sync::LazyLock;

use bstr::{BString, ByteSlice};
use regex::bytes::Regex;

use super::{Counters, Map};

static CASAVA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[12]:[YN]:[0-9]+:\S*$").expect("valid CASAVA pattern"));

/// Read identifier split into its name, the CASAVA 1.8 comment and whatever
/// trails them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tag {
    pub name: BString,
    pub casava: Option<BString>,
    pub extra: Option<BString>,
}

impl Tag {
    pub fn new(name: impl Into<BString>) -> Self {
        Self {
            name: name.into(),
            casava: None,
            extra: None,
        }
    }

    /// Split a raw identifier (without the FASTA/FASTQ sigil).
    pub fn parse(raw: &[u8]) -> Self {
        let raw = raw.trim_end_with(|c| c == '\r');
        let Some(i) = raw.find_byteset(b" \t") else {
            return Self::new(raw);
        };
        let name = BString::from(&raw[..i]);
        let rest = raw[i + 1..].trim_start();
        if rest.is_empty() {
            return Self::new(name);
        }
        let (first, tail) = match rest.find_byteset(b" \t") {
            Some(j) => (&rest[..j], Some(rest[j + 1..].trim_start())),
            None => (rest, None),
        };
        if CASAVA.is_match(first) {
            Self {
                name,
                casava: Some(first.into()),
                extra: tail.filter(|t| !t.is_empty()).map(BString::from),
            }
        } else {
            Self {
                name,
                casava: None,
                extra: Some(rest.into()),
            }
        }
    }

    /// Name with any `/1` or `/2` mate suffix removed.
    pub fn mate_free_name(&self) -> &[u8] {
        strip_mate_suffix(&self.name).0
    }
}

/// Returns the name without its mate suffix and the mate number, if any.
pub fn strip_mate_suffix(name: &[u8]) -> (&[u8], Option<u8>) {
    match name {
        [head @ .., b'/', m @ (b'1' | b'2')] => (head, Some(m - b'0')),
        _ => (name, None),
    }
}

/// One sequenced end with its candidate placements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Alignment {
    pub read: BString,
    pub qualities: Option<BString>,
    pub maps: Vec<Map>,
    pub counters: Counters,
}

impl Alignment {
    pub fn new(read: impl Into<BString>, qualities: Option<BString>) -> Self {
        Self {
            read: read.into(),
            qualities,
            maps: Vec::new(),
            counters: Counters::default(),
        }
    }

    /// Phred quality (offset 33) at a read position.
    pub fn quality_at(&self, position: usize) -> Option<u8> {
        self.qualities
            .as_ref()
            .and_then(|q| q.get(position))
            .map(|q| q.saturating_sub(33))
    }
}

/// A cross-end pairing of maps. `maps[i]` indexes `PairedEnd::ends[i].maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Combination {
    pub maps: [usize; 2],
    pub distance: u64,
    pub score: Option<u64>,
    pub insert_size: Option<i64>,
}

impl Combination {
    pub fn mapq(&self) -> u64 {
        super::map::mapq(self.score)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairedEnd {
    pub ends: [Alignment; 2],
    pub combinations: Vec<Combination>,
    pub counters: Counters,
}

impl PairedEnd {
    pub fn new(end1: Alignment, end2: Alignment) -> Self {
        Self {
            ends: [end1, end2],
            combinations: Vec::new(),
            counters: Counters::default(),
        }
    }

    /// Add a pairing, reusing identical maps already held by the ends.
    pub fn push_combination(&mut self, map1: Map, map2: Map, score: Option<u64>) {
        let insert_size = insert_size(&map1, &map2);
        let distance = map1.global_distance() + map2.global_distance();
        let maps = [self.intern(0, map1), self.intern(1, map2)];
        self.combinations.push(Combination {
            maps,
            distance,
            score,
            insert_size,
        });
    }

    fn intern(&mut self, end: usize, map: Map) -> usize {
        let maps = &mut self.ends[end].maps;
        match maps.iter().position(|m| *m == map) {
            Some(i) => i,
            None => {
                maps.push(map);
                maps.len() - 1
            }
        }
    }

    pub fn maps_of(&self, combination: &Combination) -> (&Map, &Map) {
        (
            &self.ends[0].maps[combination.maps[0]],
            &self.ends[1].maps[combination.maps[1]],
        )
    }

    pub fn no_split_distance(&self, combination: &Combination) -> u64 {
        let (m1, m2) = self.maps_of(combination);
        m1.no_split_distance() + m2.no_split_distance()
    }

    pub fn global_distance(&self, combination: &Combination) -> u64 {
        let (m1, m2) = self.maps_of(combination);
        m1.global_distance() + m2.global_distance()
    }

    pub fn levenshtein(&self, combination: &Combination) -> u64 {
        let (m1, m2) = self.maps_of(combination);
        m1.levenshtein() + m2.levenshtein()
    }

    /// Keep only the selected combinations, moving their maps into fresh
    /// end lists.
    pub fn retain_combinations(self, keep: &[bool]) -> Self {
        let PairedEnd {
            ends: [mut end1, mut end2],
            combinations,
            counters,
        } = self;
        let mut pools = [
            std::mem::take(&mut end1.maps)
                .into_iter()
                .map(Some)
                .collect::<Vec<_>>(),
            std::mem::take(&mut end2.maps)
                .into_iter()
                .map(Some)
                .collect::<Vec<_>>(),
        ];
        let mut remap: [Vec<Option<usize>>; 2] =
            [vec![None; pools[0].len()], vec![None; pools[1].len()]];
        let mut order: [Vec<usize>; 2] = [Vec::new(), Vec::new()];
        let combinations = combinations
            .into_iter()
            .zip(keep)
            .filter(|(_, &k)| k)
            .map(|(mut combination, _)| {
                for e in 0..2 {
                    let old = combination.maps[e];
                    combination.maps[e] = *remap[e][old].get_or_insert_with(|| {
                        order[e].push(old);
                        order[e].len() - 1
                    });
                }
                combination
            })
            .collect();
        let [maps1, maps2] = [0, 1].map(|e| {
            order[e]
                .iter()
                .filter_map(|&i| pools[e][i].take())
                .collect::<Vec<_>>()
        });
        end1.maps = maps1;
        end2.maps = maps2;
        let ends = [end1, end2];
        Self {
            ends,
            combinations,
            counters,
        }
    }
}

/// Observed template length for a pair of maps on the same reference.
pub fn insert_size(map1: &Map, map2: &Map) -> Option<i64> {
    if map1.seq_name() != map2.seq_name() {
        return None;
    }
    let (start1, end1) = map1.genomic_span();
    let (start2, end2) = map2.genomic_span();
    let size = match map1.strand() {
        super::Strand::Forward => end2 as i64 - start1 as i64,
        super::Strand::Reverse => end1 as i64 - start2 as i64,
    };
    Some(size)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
    SingleEnd(Alignment),
    PairedEnd(PairedEnd),
}

/// One read event and every candidate placement of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub tag: Tag,
    pub layout: Layout,
}

impl Template {
    pub fn single(tag: Tag, alignment: Alignment) -> Self {
        Self {
            tag,
            layout: Layout::SingleEnd(alignment),
        }
    }

    pub fn paired(tag: Tag, paired: PairedEnd) -> Self {
        Self {
            tag,
            layout: Layout::PairedEnd(paired),
        }
    }

    pub fn num_blocks(&self) -> usize {
        match &self.layout {
            Layout::SingleEnd(_) => 1,
            Layout::PairedEnd(_) => 2,
        }
    }

    pub fn is_paired(&self) -> bool {
        matches!(self.layout, Layout::PairedEnd(_))
    }

    pub fn alignments(&self) -> &[Alignment] {
        match &self.layout {
            Layout::SingleEnd(alignment) => std::slice::from_ref(alignment),
            Layout::PairedEnd(paired) => &paired.ends,
        }
    }

    pub fn counters(&self) -> &Counters {
        match &self.layout {
            Layout::SingleEnd(alignment) => &alignment.counters,
            Layout::PairedEnd(paired) => &paired.counters,
        }
    }

    pub fn counters_mut(&mut self) -> &mut Counters {
        match &mut self.layout {
            Layout::SingleEnd(alignment) => &mut alignment.counters,
            Layout::PairedEnd(paired) => &mut paired.counters,
        }
    }

    /// Maps for single-end templates, combinations for paired ones.
    pub fn num_candidates(&self) -> usize {
        match &self.layout {
            Layout::SingleEnd(alignment) => alignment.maps.len(),
            Layout::PairedEnd(paired) => paired.combinations.len(),
        }
    }

    pub fn is_mapped(&self) -> bool {
        self.num_candidates() > 0
    }

    pub fn uniq_degree(&self) -> i64 {
        self.counters().uniq_degree()
    }

    pub fn num_bases(&self) -> usize {
        self.alignments().iter().map(|a| a.read.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{MapBlock, Strand};

    #[test]
    fn test_tag_parse() {
        let tag = Tag::parse(b"HWI-ST661:153:D0FTJACXX:2:1102:13924:124292 1:N:0:GCCAAT");
        assert_eq!(tag.name, "HWI-ST661:153:D0FTJACXX:2:1102:13924:124292");
        assert_eq!(tag.casava.as_ref().map(|s| s.as_bstr()), Some(b"1:N:0:GCCAAT".as_bstr()));
        assert_eq!(tag.extra, None);

        let tag = Tag::parse(b"read7 length=75 sample=x");
        assert_eq!(tag.name, "read7");
        assert_eq!(tag.casava, None);
        assert_eq!(tag.extra.as_ref().map(|s| s.as_bstr()), Some(b"length=75 sample=x".as_bstr()));

        let tag = Tag::parse(b"read8 2:Y:18:ATCACG bc=1");
        assert_eq!(tag.casava.as_ref().map(|s| s.as_bstr()), Some(b"2:Y:18:ATCACG".as_bstr()));
        assert_eq!(tag.extra.as_ref().map(|s| s.as_bstr()), Some(b"bc=1".as_bstr()));
    }

    #[test]
    fn test_strip_mate_suffix() {
        assert_eq!(strip_mate_suffix(b"r1/1"), (&b"r1"[..], Some(1)));
        assert_eq!(strip_mate_suffix(b"r1/2"), (&b"r1"[..], Some(2)));
        assert_eq!(strip_mate_suffix(b"r1/3"), (&b"r1/3"[..], None));
        assert_eq!(strip_mate_suffix(b"r1"), (&b"r1"[..], None));
    }

    fn map(pos: u64, strand: Strand) -> Map {
        Map::new(MapBlock::new("chr1", strand, pos, 50))
    }

    #[test]
    fn test_push_combination_interns_maps() {
        let mut pe = PairedEnd::new(Alignment::new("ACGT", None), Alignment::new("TTTT", None));
        pe.push_combination(map(100, Strand::Forward), map(300, Strand::Reverse), Some(5));
        pe.push_combination(map(100, Strand::Forward), map(900, Strand::Reverse), None);
        assert_eq!(pe.ends[0].maps.len(), 1);
        assert_eq!(pe.ends[1].maps.len(), 2);
        assert_eq!(pe.combinations[1].maps, [0, 1]);
        assert_eq!(pe.combinations[0].insert_size, Some(250));

        let kept = pe.retain_combinations(&[false, true]);
        assert_eq!(kept.combinations.len(), 1);
        assert_eq!(kept.combinations[0].maps, [0, 0]);
        assert_eq!(kept.ends[1].maps[0].position(), 900);
        assert_eq!(kept.ends[0].maps.len(), 1);
    }

    #[test]
    fn test_insert_size_needs_same_reference() {
        let other = Map::new(MapBlock::new("chr2", Strand::Reverse, 300, 50));
        assert_eq!(insert_size(&map(100, Strand::Forward), &other), None);
        assert_eq!(
            insert_size(&map(300, Strand::Reverse), &map(100, Strand::Forward)),
            Some(250)
        );
    }
}
