//! Merging the templates that several mappers produced for the same reads.

use crate::error::{GtError, Result};
use crate::rank::{recalculate_counters, sort_by_distance_then_score};
use crate::record::{Layout, Map, Template};

fn same_placement(a: &Map, b: &Map) -> bool {
    a.blocks() == b.blocks()
}

/// Max complete strata of a merge: the smallest one that is known.
fn min_mcs(a: Option<usize>, b: Option<usize>) -> Option<usize> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// Union of the candidates of `templates` without duplicates. The first
/// template supplies tag and reads; the result is re-ranked and carries
/// recalculated counters with the smallest max complete strata.
pub fn merge_templates<I: IntoIterator<Item = Template>>(templates: I) -> Result<Template> {
    let mut templates = templates.into_iter();
    let Some(mut merged) = templates.next() else {
        return Err(GtError::Merge {
            tag: String::new(),
            reason: "no templates".to_string(),
        });
    };
    let mut mcs = merged.counters().mcs();
    for other in templates {
        let err = |reason: &str| GtError::Merge {
            tag: merged.tag.name.to_string(),
            reason: reason.to_string(),
        };
        if merged.alignments().iter().map(|a| &a.read).ne(other.alignments().iter().map(|a| &a.read)) {
            return Err(err("reads differ"));
        }
        mcs = min_mcs(mcs, other.counters().mcs());
        match (&mut merged.layout, other.layout) {
            (Layout::SingleEnd(end), Layout::SingleEnd(other)) => {
                if end.qualities.is_none() {
                    end.qualities = other.qualities;
                }
                for map in other.maps {
                    if !end.maps.iter().any(|m| same_placement(m, &map)) {
                        end.maps.push(map);
                    }
                }
            }
            (Layout::PairedEnd(paired), Layout::PairedEnd(other)) => {
                for combination in &other.combinations {
                    let (m1, m2) = other.maps_of(combination);
                    let seen = paired.combinations.iter().any(|c| {
                        let (n1, n2) = paired.maps_of(c);
                        same_placement(n1, m1) && same_placement(n2, m2)
                    });
                    if !seen {
                        paired.push_combination(m1.clone(), m2.clone(), combination.score);
                    }
                }
            }
            _ => return Err(err("single-end and paired-end templates")),
        }
    }
    sort_by_distance_then_score(&mut merged);
    recalculate_counters(&mut merged);
    merged.counters_mut().set_mcs(mcs);
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode, parse_map_record, EncodeOptions};

    fn template(line: &str) -> Template {
        parse_map_record(line.as_bytes(), 1, 0).unwrap()
    }

    fn merged(lines: &[&str]) -> String {
        let t = merge_templates(lines.iter().map(|l| template(l))).unwrap();
        String::from_utf8(encode(&t, &EncodeOptions::default())).unwrap()
    }

    #[test]
    fn test_union_without_duplicates() {
        let out = merged(&[
            "r\tACGT\t0+1\tc:+:9:4:A@0:::5",
            "r\tACGT\t1+0:0\tc:+:3:4:::8,c:+:9:4:A@0:::5",
        ]);
        assert_eq!(out, "r\tACGT\t1+1\tc:+:3:4:::8,c:+:9:4:A@0:::5\n");
    }

    #[test]
    fn test_paired_union() {
        let out = merged(&[
            "p\tACGT TTTT\t1\tc:+:1:4::c:-:50:4",
            "p\tACGT TTTT\t0:1\tc:+:1:4::c:-:50:4,c:+:1:4::c:-:90:4:T@0",
        ]);
        assert_eq!(out, "p\tACGT TTTT\t1:1\tc:+:1:4::c:-:50:4,c:+:1:4::c:-:90:4:T@0\n");
    }

    #[test]
    fn test_incompatible() {
        let err = merge_templates([
            template("r\tACGT\t0\t-"),
            template("r\tACGA\t0\t-"),
        ])
        .unwrap_err();
        assert!(matches!(err, GtError::Merge { .. }));
        assert!(!err.is_fatal());

        let err = merge_templates([template("p\tACGT\t0\t-"), template("p\tACGT TT\t0\t-")])
            .unwrap_err();
        assert!(format!("{err}").contains("reads differ"));
    }
}
