//! Per-template candidate filtering.

use std::path::{Path, PathBuf};

use anyhow::Context;
use log::debug;
use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};

use crate::annotate::{AnnotationReport, OverlapIndex};
use crate::codec::DecodeOptions;
use crate::error::{GtError, Result};
use crate::io::open_file;
use crate::rank::{recalculate_counters, recalculate_counters_no_splits, sort_by_distance_then_score};
use crate::record::{mapq, Layout, Map, PairedEnd, Template};

/// Filter configuration. Every field has a value that disables its check,
/// which is also its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterParams {
    pub min_score: u64,
    pub min_event_distance: u64,
    pub max_event_distance: u64,
    pub min_levenshtein_distance: u64,
    pub max_levenshtein_distance: u64,
    pub min_intron_length: u64,
    pub min_block_length: u64,
    /// Negative disables the uniqueness filter.
    pub min_unique_level: i64,
    pub min_inss: i64,
    pub max_inss: i64,
    pub filter_by_strand: bool,
    pub keep_unique: bool,
    pub group_1: bool,
    pub group_2: bool,
    pub group_3: bool,
    pub group_4: bool,
    /// 0 keeps every candidate.
    pub max_matches: usize,
    pub annotation_source: Option<PathBuf>,
    pub paired: bool,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            min_score: 0,
            min_event_distance: 0,
            max_event_distance: u64::MAX,
            min_levenshtein_distance: 0,
            max_levenshtein_distance: u64::MAX,
            min_intron_length: 0,
            min_block_length: 0,
            min_unique_level: -1,
            min_inss: i64::MIN,
            max_inss: i64::MAX,
            filter_by_strand: false,
            keep_unique: false,
            group_1: false,
            group_2: false,
            group_3: false,
            group_4: false,
            max_matches: 0,
            annotation_source: None,
            paired: false,
        }
    }
}

impl FilterParams {
    /// Load parameters from a YAML (or JSON) file and validate them.
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let reader = open_file(path)?;
        let params: Self = serde_yaml::from_reader(reader)
            .with_context(|| format!("cannot parse filter parameters: {}", path.display()))?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        fn bounds<T: PartialOrd + std::fmt::Display>(
            field: &'static str,
            min: T,
            max: T,
        ) -> Result<()> {
            if min > max {
                Err(GtError::FilterConfig {
                    field,
                    reason: format!("minimum {} exceeds maximum {}", min, max),
                })
            } else {
                Ok(())
            }
        }
        bounds("event_distance", self.min_event_distance, self.max_event_distance)?;
        bounds(
            "levenshtein_distance",
            self.min_levenshtein_distance,
            self.max_levenshtein_distance,
        )?;
        bounds("inss", self.min_inss, self.max_inss)?;
        Ok(())
    }

    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions::default()
            .with_paired(self.paired)
            .with_max_matches(self.max_matches)
    }

    fn inss_enabled(&self) -> bool {
        self.min_inss != i64::MIN || self.max_inss != i64::MAX
    }

    fn bands(&self) -> ScoreBands {
        ScoreBands {
            groups: [self.group_1, self.group_2, self.group_3, self.group_4],
        }
    }
}

/// Mapping-quality bands of the score-group filter.
#[derive(Debug, Clone, Copy)]
struct ScoreBands {
    groups: [bool; 4],
}

impl ScoreBands {
    fn any(&self) -> bool {
        self.groups.iter().any(|&g| g)
    }

    fn is_mid(&self, mapq: u64) -> bool {
        self.groups[3] && (114..=119).contains(&mapq)
    }

    /// `saw_mid` widens the last band to 95..=110.
    fn contains(&self, mapq: u64, saw_mid: bool) -> bool {
        (self.groups[0] && (252..=254).contains(&mapq))
            || (self.groups[1] && (177..=180).contains(&mapq))
            || (self.groups[2] && (123..=127).contains(&mapq))
            || (self.groups[3]
                && ((114..=119).contains(&mapq) || (saw_mid && (95..=110).contains(&mapq))))
    }
}

/// Borrowed view of one candidate: a map or a combination of two.
struct Candidate<'a> {
    maps: SmallVec<[&'a Map; 2]>,
    score: Option<u64>,
    insert_size: Option<i64>,
}

impl Candidate<'_> {
    fn distance(&self) -> u64 {
        self.maps.iter().map(|m| m.no_split_distance()).sum()
    }

    fn levenshtein(&self) -> u64 {
        self.maps.iter().map(|m| m.levenshtein()).sum()
    }

    fn min_junction_size(&self) -> Option<u64> {
        self.maps.iter().filter_map(|m| m.min_junction_size()).min()
    }

    fn min_block_length(&self) -> Option<u64> {
        self.maps
            .iter()
            .filter(|m| m.is_split())
            .map(|m| m.min_block_length())
            .min()
    }

    fn same_strand(&self) -> bool {
        matches!(self.maps.as_slice(), [a, b] if a.strand() == b.strand())
    }
}

fn candidates(template: &Template) -> Vec<Candidate<'_>> {
    match &template.layout {
        Layout::SingleEnd(end) => end
            .maps
            .iter()
            .map(|m| Candidate {
                maps: smallvec![m],
                score: m.score,
                insert_size: None,
            })
            .collect(),
        Layout::PairedEnd(paired) => paired
            .combinations
            .iter()
            .map(|c| {
                let (m1, m2) = paired.maps_of(c);
                Candidate {
                    maps: smallvec![m1, m2],
                    score: c.score,
                    insert_size: c.insert_size,
                }
            })
            .collect(),
    }
}

/// A filtered template and the annotation lines of its survivors.
#[derive(Debug, Clone)]
pub struct Filtered {
    pub template: Template,
    pub annotations: Vec<AnnotationReport>,
}

/// Rank, filter and optionally annotate one template. The returned template
/// carries counters in the native (global distance) convention.
pub fn filter(
    mut template: Template,
    params: &FilterParams,
    index: Option<&dyn OverlapIndex>,
) -> Filtered {
    recalculate_counters_no_splits(&mut template);
    sort_by_distance_then_score(&mut template);

    let unique_kept = params.keep_unique && template.num_candidates() == 1;
    if template.is_mapped() && !unique_kept {
        let keep = select(&template, params);
        let before = template.num_candidates();
        retain(&mut template, &keep);
        debug!(
            "{}: kept {} of {} candidates",
            template.tag.name,
            template.num_candidates(),
            before
        );
    }

    let mut annotations = Vec::new();
    if let Some(index) = index {
        annotations = index
            .hits(&template)
            .into_iter()
            .enumerate()
            .map(|(candidate, hit)| AnnotationReport {
                tag: template.tag.name.clone(),
                candidate,
                hit,
            })
            .collect();
        recalculate_counters_no_splits(&mut template);
    }

    recalculate_counters(&mut template);
    Filtered {
        template,
        annotations,
    }
}

/// Decide, in rank order, which candidates survive.
fn select(template: &Template, params: &FilterParams) -> Vec<bool> {
    let candidates = candidates(template);
    let bands = params.bands();
    let unique = params.min_unique_level >= 0 && template.uniq_degree() >= params.min_unique_level;
    let mut already_emitted_best = false;
    let mut saw_mid_band = false;
    let mut keep = vec![false; candidates.len()];

    for (i, candidate) in candidates.iter().enumerate() {
        let quality = mapq(candidate.score);
        if bands.any() {
            saw_mid_band |= bands.is_mid(quality);
            if !bands.contains(quality, saw_mid_band) || already_emitted_best {
                continue;
            }
            already_emitted_best = true;
        }
        if quality < params.min_score {
            continue;
        }
        let distance = candidate.distance();
        if distance < params.min_event_distance || distance > params.max_event_distance {
            continue;
        }
        let lev = candidate.levenshtein();
        if lev < params.min_levenshtein_distance || lev > params.max_levenshtein_distance {
            continue;
        }
        if candidate
            .min_junction_size()
            .is_some_and(|j| j < params.min_intron_length)
        {
            continue;
        }
        if candidate
            .min_block_length()
            .is_some_and(|l| l < params.min_block_length)
        {
            continue;
        }
        if template.is_paired() {
            if params.inss_enabled()
                && !candidate
                    .insert_size
                    .is_some_and(|s| s >= params.min_inss && s <= params.max_inss)
            {
                continue;
            }
            if params.filter_by_strand && candidate.same_strand() {
                continue;
            }
        }
        keep[i] = true;
        if unique {
            break;
        }
    }
    keep
}

fn retain(template: &mut Template, keep: &[bool]) {
    match &mut template.layout {
        Layout::SingleEnd(end) => {
            let maps = std::mem::take(&mut end.maps);
            end.maps = maps
                .into_iter()
                .zip(keep)
                .filter_map(|(map, &k)| k.then_some(map))
                .collect();
        }
        Layout::PairedEnd(paired) => {
            *paired = std::mem::take::<PairedEnd>(paired).retain_combinations(keep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::OverlapHit;
    use crate::codec::{encode, parse_map_record, EncodeOptions};

    fn template(line: &str) -> Template {
        parse_map_record(line.as_bytes(), 1, 0).unwrap()
    }

    fn positions(t: &Template) -> Vec<u64> {
        match &t.layout {
            Layout::SingleEnd(end) => end.maps.iter().map(|m| m.position()).collect(),
            Layout::PairedEnd(paired) => paired
                .combinations
                .iter()
                .map(|c| paired.maps_of(c).0.position())
                .collect(),
        }
    }

    #[test]
    fn test_validate() {
        assert!(FilterParams::default().validate().is_ok());
        let params = FilterParams {
            min_event_distance: 3,
            max_event_distance: 2,
            ..Default::default()
        };
        match params.validate() {
            Err(GtError::FilterConfig { field, .. }) => assert_eq!(field, "event_distance"),
            other => panic!("expected config error, got {other:?}"),
        }
        let params = FilterParams {
            min_inss: 500,
            max_inss: 100,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_params_from_yaml() {
        let params: FilterParams =
            serde_yaml::from_str("max_event_distance: 2\nkeep_unique: true\ngroup_4: true\n").unwrap();
        assert_eq!(params.max_event_distance, 2);
        assert!(params.keep_unique && params.group_4);
        assert_eq!(params.max_levenshtein_distance, u64::MAX);
        assert_eq!(params.min_unique_level, -1);
        assert!(serde_yaml::from_str::<FilterParams>("max_distance: 2\n").is_err());
    }

    #[test]
    fn test_scenario_paired_distance_and_keep_unique() {
        let params = FilterParams {
            min_event_distance: 0,
            max_event_distance: 2,
            keep_unique: true,
            ..Default::default()
        };
        let records = [
            "p1\tACGT TTTT\t0:1\tc:+:10:4:A@0::c:-:90:4",
            "p2\tACGT TTTT\t0:0:0:0:1\tc:+:10:4:A@0C@1::c:-:90:4:A@0G@1",
            "p3\tACGT TTTT\t1:1:0:1\tc:+:30:4:A@0::c:-:90:4:A@0C@1,c:+:20:4:A@0::c:-:90:4,c:+:10:4::c:-:90:4",
        ];
        let out = records
            .iter()
            .map(|r| filter(template(r), &params, None).template)
            .collect::<Vec<_>>();

        // single candidates pass untouched, whatever their distance
        assert_eq!(out[0], {
            let mut t = template(records[0]);
            recalculate_counters(&mut t);
            t
        });
        assert_eq!(out[1].num_candidates(), 1);
        assert_eq!(out[1].counters().as_slice(), &[0, 0, 0, 0, 1]);

        // the distance-3 combination is dropped, the rest are re-ranked
        assert_eq!(positions(&out[2]), vec![10, 20]);
        assert_eq!(out[2].counters().as_slice(), &[1, 1]);
        let Layout::PairedEnd(paired) = &out[2].layout else { unreachable!() };
        assert_eq!(paired.ends[0].maps.len(), 2);
        assert_eq!(paired.ends[1].maps.len(), 1);
    }

    #[test]
    fn test_score_bands_keep_at_most_one() {
        let t = template(
            "r\tACGTACGT\t5\tc:+:1:8:::253,c:+:2:8:::178,c:+:3:8:::60,c:+:4:8:::254,c:+:5:8:::125",
        );
        let params = FilterParams {
            group_1: true,
            group_2: true,
            group_3: true,
            ..Default::default()
        };
        // ranked by score, so the 254 candidate is the one band hit kept
        let out = filter(t.clone(), &params, None).template;
        assert_eq!(positions(&out), vec![4]);

        let params = FilterParams {
            group_3: true,
            ..Default::default()
        };
        assert_eq!(positions(&filter(t, &params, None).template), vec![5]);
    }

    #[test]
    fn test_mid_band_widens_group_4() {
        let params = FilterParams {
            group_4: true,
            ..Default::default()
        };
        // without a 114..=119 candidate, 100 is outside every band
        let t = template("r\tACGT\t2\tc:+:1:4:::100,c:+:2:4:::30");
        assert!(!filter(t, &params, None).template.is_mapped());

        // ranked by score: 116 is kept, and the widened band cannot add more
        let t = template("r\tACGT\t2\tc:+:1:4:::100,c:+:2:4:::116");
        assert_eq!(positions(&filter(t, &params, None).template), vec![2]);
    }

    #[test]
    fn test_split_map_filters() {
        let line = "r\tACGTACGTAC\t1\tc:+:100:5~c:+:130:5,c:+:100:5~c:+:5000:5,c:+:100:2~c:+:9000:8";
        let params = FilterParams {
            min_intron_length: 50,
            ..Default::default()
        };
        assert_eq!(
            positions(&filter(template(line), &params, None).template),
            vec![100, 100]
        );
        let params = FilterParams {
            min_block_length: 3,
            ..Default::default()
        };
        let out = filter(template(line), &params, None).template;
        assert_eq!(out.num_candidates(), 2);
        let Layout::SingleEnd(end) = &out.layout else { unreachable!() };
        assert!(end.maps.iter().all(|m| m.min_block_length() >= 3));
    }

    #[test]
    fn test_min_score_and_levenshtein() {
        let line = "r\tACGTACGT\t1\tc:+:1:8:(I,2,3):::50,c:+:2:8:A@1:::10,c:+:3:8:::5";
        let params = FilterParams {
            min_score: 8,
            max_levenshtein_distance: 2,
            ..Default::default()
        };
        assert_eq!(positions(&filter(template(line), &params, None).template), vec![2]);
    }

    #[test]
    fn test_uniqueness_keeps_top_candidate() {
        let line = "r\tACGT\t1\tc:+:1:4:::9,c:+:2:4:A@0C@1:::50,c:+:3:4:A@0C@1G@2";
        let params = FilterParams {
            min_unique_level: 1,
            ..Default::default()
        };
        assert_eq!(positions(&filter(template(line), &params, None).template), vec![1]);

        // an ambiguous best stratum keeps everything
        let line = "r\tACGT\t2\tc:+:1:4,c:+:2:4,c:+:3:4:A@0";
        let out = filter(template(line), &params, None).template;
        assert_eq!(out.num_candidates(), 3);
    }

    #[test]
    fn test_insert_size_and_strand() {
        let line = "p\tACGT TTTT\t3\tc:+:100:4::c:-:300:4,c:+:100:4::c:+:300:4,c:+:100:4::c:-:5000:4,c:+:100:4::d:-:300:4";
        let params = FilterParams {
            min_inss: 0,
            max_inss: 1000,
            ..Default::default()
        };
        assert_eq!(filter(template(line), &params, None).template.num_candidates(), 2);
        let params = FilterParams {
            filter_by_strand: true,
            ..Default::default()
        };
        assert_eq!(filter(template(line), &params, None).template.num_candidates(), 3);
    }

    struct FixedIndex;

    impl OverlapIndex for FixedIndex {
        fn search(&self, map: &Map) -> OverlapHit {
            OverlapHit {
                feature_id: Some(format!("f{}", map.position())),
                feature_type: Some("exon".to_string()),
                overlap: 1.0,
                exonic: true,
            }
        }
    }

    #[test]
    fn test_annotation_side_channel() {
        let line = "r\tACGT\t0:1+0\tc:+:7:4:A@0:::3,c:+:5:4:::1";
        let t = template(line);
        let filtered = filter(t, &FilterParams::default(), Some(&FixedIndex));
        assert_eq!(filtered.annotations.len(), 2);
        assert_eq!(filtered.annotations[0].candidate, 0);
        assert_eq!(filtered.annotations[0].hit.feature_id.as_deref(), Some("f5"));
        let out = encode(&filtered.template, &EncodeOptions::default());
        assert_eq!(out, b"r\tACGT\t1:1+0\tc:+:5:4:::1,c:+:7:4:A@0:::3\n");
    }
}
