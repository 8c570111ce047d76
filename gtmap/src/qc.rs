use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::ops::{Deref, DerefMut};

use indexmap::IndexMap;
use serde::Serialize;

use crate::rank::best_candidate;
use crate::record::{Alignment, Layout, Map, Mismatch, Strand, Template};

/// Flat key/value summary of a run, in insertion order.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Metrics(IndexMap<String, f64>);

impl Metrics {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl From<IndexMap<String, f64>> for Metrics {
    fn from(map: IndexMap<String, f64>) -> Self {
        Metrics(map)
    }
}

impl From<Metrics> for IndexMap<String, f64> {
    fn from(val: Metrics) -> Self {
        val.0
    }
}

impl Deref for Metrics {
    type Target = IndexMap<String, f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Metrics {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.0 {
            writeln!(f, "{}\t{}", key, value)?;
        }
        Ok(())
    }
}

/// Growable histogram; merging two histograms pads the shorter one.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Histogram(Vec<u64>);

impl Histogram {
    pub fn add(&mut self, bin: usize) {
        self.add_n(bin, 1);
    }

    pub fn add_n(&mut self, bin: usize, n: u64) {
        if self.0.len() <= bin {
            self.0.resize(bin + 1, 0);
        }
        self.0[bin] += n;
    }

    pub fn get(&self, bin: usize) -> u64 {
        self.0.get(bin).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    pub fn as_slice(&self) -> &[u64] {
        &self.0
    }

    pub fn combine(&mut self, other: &Self) {
        for (bin, &n) in other.0.iter().enumerate() {
            if n > 0 {
                self.add_n(bin, n);
            }
        }
    }

    fn nonzero(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.0.iter().copied().enumerate().filter(|(_, n)| *n > 0)
    }
}

/// Which candidates of a template feed the statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccumulateMode {
    All,
    /// Only the top-ranked candidate.
    Best,
}

const BASES: [u8; 5] = [b'A', b'C', b'G', b'T', b'N'];
const INSS_BIN_WIDTH: i64 = 10;
/// Upper bounds of the junction length bins; the last bin holds the rest.
const JUNCTION_BINS: [u64; 7] = [50, 100, 500, 1000, 5000, 10000, 50000];
const JUNCTION_LABELS: [&str; 9] = [
    "[0,50)",
    "[50,100)",
    "[100,500)",
    "[500,1000)",
    "[1000,5000)",
    "[5000,10000)",
    "[10000,50000)",
    "[50000,inf)",
    "chimeric",
];

fn base_index(base: u8) -> usize {
    match base.to_ascii_uppercase() {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        b'T' => 3,
        _ => 4,
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MapsProfile {
    pub bases_aligned: u64,
    pub mismatches: u64,
    pub insertions: u64,
    pub deletions: u64,
    pub levenshtein: u64,
    pub error_events: u64,
    pub misms_quality: Histogram,
    pub errors_quality: Histogram,
    pub misms_position: Histogram,
    /// `[reference][read]` base substitutions.
    pub transitions: [[u64; 5]; 5],
    /// Substitutions with one read base of context on each side, indexed by
    /// `((before * 5 + reference) * 5 + read) * 5 + after`.
    pub transitions_1context: Histogram,
    /// Insert sizes binned by `INSS_BIN_WIDTH`.
    pub inss: BTreeMap<i64, u64>,
    /// FR, RF, FF, RR mate orientations.
    pub strand_pairs: [u64; 4],
}

impl MapsProfile {
    fn add_map(&mut self, end: &Alignment, map: &Map) {
        self.bases_aligned += map.length();
        self.levenshtein += map.levenshtein();
        for mismatch in map.mismatches() {
            let quality = end.quality_at(mismatch.position());
            self.error_events += 1;
            if let Some(q) = quality {
                self.errors_quality.add(q as usize);
            }
            match *mismatch {
                Mismatch::Substitution { position, base } => {
                    self.mismatches += 1;
                    self.misms_position.add(position);
                    if let Some(q) = quality {
                        self.misms_quality.add(q as usize);
                    }
                    let read = end.read.get(position).map_or(4, |&b| base_index(b));
                    let reference = base_index(base);
                    self.transitions[reference][read] += 1;
                    let before = position
                        .checked_sub(1)
                        .and_then(|p| end.read.get(p))
                        .map_or(4, |&b| base_index(b));
                    let after = end.read.get(position.saturating_add(1)).map_or(4, |&b| base_index(b));
                    self.transitions_1context
                        .add(((before * 5 + reference) * 5 + read) * 5 + after);
                }
                Mismatch::Insertion { .. } => self.insertions += 1,
                Mismatch::Deletion { .. } => self.deletions += 1,
            }
        }
    }

    fn add_pair(&mut self, map1: &Map, map2: &Map, insert_size: Option<i64>) {
        let orientation = match (map1.strand(), map2.strand()) {
            (Strand::Forward, Strand::Reverse) => 0,
            (Strand::Reverse, Strand::Forward) => 1,
            (Strand::Forward, Strand::Forward) => 2,
            (Strand::Reverse, Strand::Reverse) => 3,
        };
        self.strand_pairs[orientation] += 1;
        if let Some(size) = insert_size {
            *self
                .inss
                .entry(size.div_euclid(INSS_BIN_WIDTH) * INSS_BIN_WIDTH)
                .or_default() += 1;
        }
    }

    pub fn combine(&mut self, other: &Self) {
        self.bases_aligned += other.bases_aligned;
        self.mismatches += other.mismatches;
        self.insertions += other.insertions;
        self.deletions += other.deletions;
        self.levenshtein += other.levenshtein;
        self.error_events += other.error_events;
        self.misms_quality.combine(&other.misms_quality);
        self.errors_quality.combine(&other.errors_quality);
        self.misms_position.combine(&other.misms_position);
        for (row, other_row) in self.transitions.iter_mut().zip(&other.transitions) {
            for (cell, n) in row.iter_mut().zip(other_row) {
                *cell += n;
            }
        }
        self.transitions_1context
            .combine(&other.transitions_1context);
        for (&bin, &n) in &other.inss {
            *self.inss.entry(bin).or_default() += n;
        }
        for (cell, n) in self.strand_pairs.iter_mut().zip(&other.strand_pairs) {
            *cell += n;
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SplitMapsProfile {
    pub split_maps: u64,
    pub junctions: u64,
    pub blocks_per_map: Histogram,
    pub junction_lengths: [u64; 9],
    pub pe_split_split: u64,
    pub pe_split_regular: u64,
    pub pe_regular_regular: u64,
}

impl SplitMapsProfile {
    fn add_map(&mut self, map: &Map) {
        self.blocks_per_map.add(map.num_blocks());
        if !map.is_split() {
            return;
        }
        self.split_maps += 1;
        for size in map.junction_sizes() {
            self.junctions += 1;
            let bin = if size == u64::MAX {
                JUNCTION_LABELS.len() - 1
            } else {
                JUNCTION_BINS
                    .iter()
                    .position(|&upper| size < upper)
                    .unwrap_or(JUNCTION_BINS.len())
            };
            self.junction_lengths[bin] += 1;
        }
    }

    fn add_pair(&mut self, map1: &Map, map2: &Map) {
        match (map1.is_split(), map2.is_split()) {
            (true, true) => self.pe_split_split += 1,
            (false, false) => self.pe_regular_regular += 1,
            _ => self.pe_split_regular += 1,
        }
    }

    pub fn combine(&mut self, other: &Self) {
        self.split_maps += other.split_maps;
        self.junctions += other.junctions;
        self.blocks_per_map.combine(&other.blocks_per_map);
        for (cell, n) in self.junction_lengths.iter_mut().zip(&other.junction_lengths) {
            *cell += n;
        }
        self.pe_split_split += other.pe_split_split;
        self.pe_split_regular += other.pe_split_regular;
        self.pe_regular_regular += other.pe_regular_regular;
    }
}

/// Per-worker statistics accumulator.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats {
    pub num_templates: u64,
    pub num_paired: u64,
    pub num_blocks: u64,
    pub num_bases: u64,
    pub num_mapped: u64,
    pub num_unique: u64,
    /// Candidates folded in (maps, or combinations for paired data).
    pub num_maps: u64,
    /// Malformed records skipped by the decoder.
    pub num_skipped: u64,
    /// Candidates by global distance.
    pub strata: Histogram,
    pub maps: MapsProfile,
    pub splits: SplitMapsProfile,
}

impl Stats {
    /// Fold one template in. `Best` takes the top-ranked candidate whatever
    /// the order the candidates are stored in.
    pub fn add(&mut self, template: &Template, mode: AccumulateMode) {
        self.num_templates += 1;
        self.num_blocks += template.num_blocks() as u64;
        self.num_bases += template.num_bases() as u64;
        if template.is_paired() {
            self.num_paired += 1;
        }
        if template.is_mapped() {
            self.num_mapped += 1;
        }
        if template.uniq_degree() > 0 {
            self.num_unique += 1;
        }
        let best = match mode {
            AccumulateMode::All => None,
            AccumulateMode::Best => Some(best_candidate(template)),
        };
        let selected = |i: usize| best.map_or(true, |b| b == Some(i));
        match &template.layout {
            Layout::SingleEnd(end) => {
                let maps = end.maps.iter().enumerate().filter(|(i, _)| selected(*i));
                for (_, map) in maps {
                    self.num_maps += 1;
                    self.strata.add(map.global_distance() as usize);
                    self.maps.add_map(end, map);
                    self.splits.add_map(map);
                }
            }
            Layout::PairedEnd(paired) => {
                let combinations = paired
                    .combinations
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| selected(*i));
                for (_, combination) in combinations {
                    let (map1, map2) = paired.maps_of(combination);
                    self.num_maps += 1;
                    self.strata.add(paired.global_distance(combination) as usize);
                    self.maps.add_map(&paired.ends[0], map1);
                    self.maps.add_map(&paired.ends[1], map2);
                    self.maps.add_pair(map1, map2, combination.insert_size);
                    self.splits.add_map(map1);
                    self.splits.add_map(map2);
                    self.splits.add_pair(map1, map2);
                }
            }
        }
    }

    pub fn add_skipped(&mut self, n: u64) {
        self.num_skipped += n;
    }

    /// Element-wise addition; associative and commutative.
    pub fn combine(&mut self, other: &Self) {
        self.num_templates += other.num_templates;
        self.num_paired += other.num_paired;
        self.num_blocks += other.num_blocks;
        self.num_bases += other.num_bases;
        self.num_mapped += other.num_mapped;
        self.num_unique += other.num_unique;
        self.num_maps += other.num_maps;
        self.num_skipped += other.num_skipped;
        self.strata.combine(&other.strata);
        self.maps.combine(&other.maps);
        self.splits.combine(&other.splits);
    }

    pub fn is_paired(&self) -> bool {
        self.num_paired > 0
    }

    pub fn report(&self, metric: &mut Metrics) {
        metric.insert("templates".to_string(), self.num_templates as f64);
        metric.insert("paired_templates".to_string(), self.num_paired as f64);
        metric.insert("bases".to_string(), self.num_bases as f64);
        metric.insert("skipped_records".to_string(), self.num_skipped as f64);
        if self.num_templates > 0 {
            metric.insert(
                "frac_mapped".to_string(),
                self.num_mapped as f64 / self.num_templates as f64,
            );
            metric.insert(
                "frac_unique".to_string(),
                self.num_unique as f64 / self.num_templates as f64,
            );
            metric.insert(
                "maps_per_template".to_string(),
                self.num_maps as f64 / self.num_templates as f64,
            );
        }
        if self.maps.bases_aligned > 0 {
            metric.insert(
                "mismatch_rate".to_string(),
                self.maps.mismatches as f64 / self.maps.bases_aligned as f64,
            );
            metric.insert(
                "error_rate".to_string(),
                self.maps.error_events as f64 / self.maps.bases_aligned as f64,
            );
        }
        if self.num_maps > 0 {
            metric.insert(
                "frac_split_maps".to_string(),
                self.splits.split_maps as f64 / self.num_maps as f64,
            );
        }
    }
}

pub fn accumulate(stats: &mut Stats, template: &Template, mode: AccumulateMode) {
    stats.add(template, mode);
}

pub fn merge<'a, I: IntoIterator<Item = &'a Stats>>(stats: I) -> Stats {
    stats.into_iter().fold(Stats::default(), |mut acc, s| {
        acc.combine(s);
        acc
    })
}

fn pct(n: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        100.0 * n as f64 / total as f64
    }
}

/// Text report of a merged [`Stats`].
pub struct Report<'a>(pub &'a Stats);

impl Display for Report<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        let m = &s.maps;
        writeln!(f, "[GENERAL.STATS]")?;
        writeln!(f, "Templates\t{}", s.num_templates)?;
        if s.is_paired() {
            writeln!(f, "PairedTemplates\t{}", s.num_paired)?;
        }
        writeln!(f, "Blocks\t{}", s.num_blocks)?;
        writeln!(f, "Bases\t{}", s.num_bases)?;
        writeln!(f, "Mapped\t{}\t({:.2}%)", s.num_mapped, pct(s.num_mapped, s.num_templates))?;
        writeln!(f, "Unique\t{}\t({:.2}%)", s.num_unique, pct(s.num_unique, s.num_templates))?;
        writeln!(f, "Maps\t{}", s.num_maps)?;
        writeln!(f, "Skipped\t{}", s.num_skipped)?;

        writeln!(f, "[MAPS.PROFILE]")?;
        writeln!(f, "Strata")?;
        for (distance, n) in s.strata.nonzero() {
            writeln!(f, "  {}\t{}\t({:.2}%)", distance, n, pct(n, s.num_maps))?;
        }
        writeln!(f, "BasesAligned\t{}", m.bases_aligned)?;
        for (label, n) in [
            ("Mismatches", m.mismatches),
            ("Insertions", m.insertions),
            ("Deletions", m.deletions),
            ("Levenshtein", m.levenshtein),
            ("ErrorEvents", m.error_events),
        ] {
            writeln!(f, "{}\t{}\t({:.4}%)", label, n, pct(n, m.bases_aligned))?;
        }
        if s.is_paired() {
            let pairs = m.strand_pairs.iter().sum();
            for (label, n) in ["FR", "RF", "FF", "RR"].iter().zip(m.strand_pairs) {
                writeln!(f, "Strands.{}\t{}\t({:.2}%)", label, n, pct(n, pairs))?;
            }

            writeln!(f, "[INSS.DISTRIBUTION]")?;
            let total = m.inss.values().sum();
            for (&bin, &n) in &m.inss {
                writeln!(
                    f,
                    "  [{},{})\t{}\t({:.2}%)",
                    bin,
                    bin + INSS_BIN_WIDTH,
                    n,
                    pct(n, total)
                )?;
            }
        }

        if m.mismatches > 0 {
            writeln!(f, "[MISMATCH.QUALITY]")?;
            for (q, n) in m.misms_quality.nonzero() {
                writeln!(f, "  Q{}\t{}\t({:.2}%)", q, n, pct(n, m.mismatches))?;
            }
        }
        if m.error_events > 0 {
            writeln!(f, "[ERRORS.QUALITY]")?;
            for (q, n) in m.errors_quality.nonzero() {
                writeln!(f, "  Q{}\t{}\t({:.2}%)", q, n, pct(n, m.error_events))?;
            }
        }

        if m.mismatches > 0 {
            writeln!(f, "[MISMATCH.TRANSITIONS]")?;
            writeln!(f, "MismsTransitions")?;
            write!(f, "ref\\read")?;
            for base in BASES {
                write!(f, "\t{}", base as char)?;
            }
            writeln!(f)?;
            for (reference, row) in m.transitions.iter().enumerate() {
                write!(f, "{}", BASES[reference] as char)?;
                for &n in row {
                    write!(f, "\t{}", n)?;
                }
                writeln!(f)?;
            }
            writeln!(f, "MismsTransitions.1-Nucleotide.Context")?;
            for (index, n) in m.transitions_1context.nonzero() {
                let after = BASES[index % 5] as char;
                let read = BASES[index / 5 % 5] as char;
                let reference = BASES[index / 25 % 5] as char;
                let before = BASES[index / 125] as char;
                writeln!(
                    f,
                    "  {}[{}>{}]{}\t{}\t({:.2}%)",
                    before,
                    reference,
                    read,
                    after,
                    n,
                    pct(n, m.mismatches)
                )?;
            }
        }

        let sp = &s.splits;
        writeln!(f, "[SPLITMAPS.PROFILE]")?;
        writeln!(f, "SplitMaps\t{}\t({:.2}%)", sp.split_maps, pct(sp.split_maps, sp.blocks_per_map.total()))?;
        writeln!(f, "Junctions\t{}", sp.junctions)?;
        writeln!(f, "BlocksPerMap")?;
        for (blocks, n) in sp.blocks_per_map.nonzero() {
            writeln!(f, "  {}\t{}", blocks, n)?;
        }
        writeln!(f, "JunctionLength")?;
        for (label, &n) in JUNCTION_LABELS.iter().zip(&sp.junction_lengths) {
            writeln!(f, "  {}\t{}\t({:.2}%)", label, n, pct(n, sp.junctions))?;
        }
        if s.is_paired() {
            writeln!(f, "Pairs.SplitSplit\t{}", sp.pe_split_split)?;
            writeln!(f, "Pairs.SplitRegular\t{}", sp.pe_split_regular)?;
            writeln!(f, "Pairs.RegularRegular\t{}", sp.pe_regular_regular)?;
        }
        Ok(())
    }
}

pub fn render_report(stats: &Stats) -> String {
    Report(stats).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::parse_map_record;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    const RECORDS: [&str; 6] = [
        "r1\tACGTACGTAC\tIIIII#IIII\t0:1\tchr1:+:100:10:G@5:::40",
        "r2\tACGTACGTAC\t1:2\tchr1:+:100:10:::60,chr2:-:900:10:T@0,chr3:+:5:10:(I,4,2)",
        "r3\tACGTACGTAC\t0\t-",
        "r4\tACGTACGTAC\t1\tchr1:+:100:4~chr1:+:400:6:::10",
        "p1\tACGT TTGA\t!!!! IIII\t0:1\tchr1:+:100:4:A@2::chr1:-:300:4:::7",
        "p2\tACGT TTGA\t0:0:1\tchr1:+:100:2~chr1:+:20000:2::chr5:+:300:4:C@1G@3",
    ];

    fn templates() -> Vec<Template> {
        RECORDS
            .iter()
            .map(|r| parse_map_record(r.as_bytes(), 1, 0).unwrap())
            .collect()
    }

    fn stats_of<'a>(templates: impl IntoIterator<Item = &'a Template>, mode: AccumulateMode) -> Stats {
        let mut stats = Stats::default();
        for t in templates {
            accumulate(&mut stats, t, mode);
        }
        stats
    }

    #[test]
    fn test_accumulate_all_and_best() {
        let templates = templates();
        let all = stats_of(&templates, AccumulateMode::All);
        assert_eq!(all.num_templates, 6);
        assert_eq!(all.num_paired, 2);
        assert_eq!(all.num_blocks, 8);
        assert_eq!(all.num_mapped, 5);
        assert_eq!(all.num_maps, 7);
        assert_eq!(all.maps.mismatches, 5);
        assert_eq!(all.maps.insertions, 1);
        assert_eq!(all.maps.error_events, 6);
        // G@5 on read ACGTA[C]GTAC: reference G, read C, context A.C -> A[G>C]G
        assert_eq!(all.maps.transitions[2][1], 1);
        assert_eq!(all.maps.misms_quality.get(2), 1);
        assert_eq!(all.maps.misms_quality.get(0), 1);
        assert_eq!(all.splits.split_maps, 2);
        assert_eq!(all.splits.junction_lengths[2], 1);
        assert_eq!(all.splits.junction_lengths[6], 1);
        assert_eq!(all.splits.pe_split_regular, 1);
        assert_eq!(all.maps.strand_pairs, [1, 0, 1, 0]);
        assert_eq!(all.maps.inss.get(&200), Some(&1));

        let best = stats_of(&templates, AccumulateMode::Best);
        assert_eq!(best.num_maps, 5);
        assert_eq!(best.maps.mismatches, 4);
    }

    #[test]
    fn test_best_is_top_ranked() {
        let t = parse_map_record(b"r\tACGT\t1:1\tc:+:1:4:A@0,c:+:9:4", 1, 0).unwrap();
        let best = stats_of([&t], AccumulateMode::Best);
        assert_eq!(best.num_maps, 1);
        assert_eq!(best.maps.mismatches, 0);
        assert_eq!(best.strata.as_slice(), &[1]);

        let unmapped = parse_map_record(b"u\tACGT\t0\t-", 1, 0).unwrap();
        let best = stats_of([&unmapped], AccumulateMode::Best);
        assert_eq!(best.num_maps, 0);
        assert_eq!(best.num_templates, 1);
    }

    #[test]
    fn test_merge_is_associative() {
        let templates = templates();
        let reference = stats_of(&templates, AccumulateMode::All);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let mut shuffled = templates.iter().collect::<Vec<_>>();
            shuffled.shuffle(&mut rng);
            let mut parts: [Vec<&Template>; 3] = Default::default();
            for t in shuffled {
                parts[rng.random_range(0..3)].push(t);
            }
            let [a, b, c] = parts.map(|p| stats_of(p, AccumulateMode::All));
            let left = merge([&merge([&a, &b]), &c]);
            let right = merge([&a, &merge([&b, &c])]);
            assert_eq!(left, right);
            assert_eq!(left, merge([&a, &b, &c]));
            assert_eq!(left, merge([&c, &a, &b]));
            assert_eq!(left, reference);
        }
    }

    #[test]
    fn test_report_sections() {
        let stats = stats_of(&templates(), AccumulateMode::All);
        let report = render_report(&stats);
        let sections = report
            .lines()
            .filter(|l| l.starts_with('['))
            .collect::<Vec<_>>();
        assert_eq!(
            sections,
            vec![
                "[GENERAL.STATS]",
                "[MAPS.PROFILE]",
                "[INSS.DISTRIBUTION]",
                "[MISMATCH.QUALITY]",
                "[ERRORS.QUALITY]",
                "[MISMATCH.TRANSITIONS]",
                "[SPLITMAPS.PROFILE]",
            ]
        );
        assert!(report.contains("Templates\t6\n"));
        assert!(report.contains("  A[G>C]G\t1\t"));

        let empty = render_report(&Stats::default());
        assert!(!empty.contains("[MISMATCH.QUALITY]"));
        assert!(!empty.contains("[INSS.DISTRIBUTION]"));
    }

    #[test]
    fn test_metrics_json() {
        let stats = stats_of(&templates(), AccumulateMode::All);
        let mut metrics = Metrics::default();
        stats.report(&mut metrics);
        assert_eq!(metrics["templates"], 6.0);
        let json = serde_json::to_string(&metrics).unwrap();
        assert!(json.starts_with("{\"templates\":6.0"));
        let parsed: IndexMap<String, f64> = serde_json::from_str(&metrics.to_json().unwrap()).unwrap();
        assert_eq!(parsed.get("paired_templates"), Some(&2.0));
    }
}
