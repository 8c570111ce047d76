//! Strata counters and candidate ranking.

use std::cmp::Reverse;

use crate::record::{Layout, Map, Template};

/// Rebuild the counters from no-split distances. For paired templates the
/// summed distance is also stored in each combination.
pub fn recalculate_counters_no_splits(template: &mut Template) {
    recalculate(template, Map::no_split_distance);
}

/// Rebuild the counters from global distances, junctions included.
pub fn recalculate_counters(template: &mut Template) {
    recalculate(template, Map::global_distance);
}

fn recalculate(template: &mut Template, distance: fn(&Map) -> u64) {
    match &mut template.layout {
        Layout::SingleEnd(end) => {
            end.counters.clear();
            for map in &end.maps {
                end.counters.increment(distance(map) as usize);
            }
        }
        Layout::PairedEnd(paired) => {
            paired.counters.clear();
            for combination in paired.combinations.iter_mut() {
                let d = distance(&paired.ends[0].maps[combination.maps[0]])
                    + distance(&paired.ends[1].maps[combination.maps[1]]);
                combination.distance = d;
                paired.counters.increment(d as usize);
            }
        }
    }
}

/// Stable sort by ascending no-split distance, then descending score.
pub fn sort_by_distance_then_score(template: &mut Template) {
    match &mut template.layout {
        Layout::SingleEnd(end) => {
            end.maps
                .sort_by_cached_key(|m| (m.no_split_distance(), Reverse(m.score.unwrap_or(0))));
        }
        Layout::PairedEnd(paired) => {
            let mut combinations = std::mem::take(&mut paired.combinations);
            combinations.sort_by_cached_key(|c| {
                (paired.no_split_distance(c), Reverse(c.score.unwrap_or(0)))
            });
            paired.combinations = combinations;
        }
    }
}

/// Index of the candidate [`sort_by_distance_then_score`] would put first.
pub fn best_candidate(template: &Template) -> Option<usize> {
    match &template.layout {
        Layout::SingleEnd(end) => end
            .maps
            .iter()
            .enumerate()
            .min_by_key(|(i, m)| (m.no_split_distance(), Reverse(m.score.unwrap_or(0)), *i))
            .map(|(i, _)| i),
        Layout::PairedEnd(paired) => paired
            .combinations
            .iter()
            .enumerate()
            .min_by_key(|(i, c)| {
                (paired.no_split_distance(c), Reverse(c.score.unwrap_or(0)), *i)
            })
            .map(|(i, _)| i),
    }
}
