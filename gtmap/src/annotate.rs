//! Overlap of candidate maps with annotated features.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use bed_utils::bed::map::GIntervalMap;
use bed_utils::bed::{BEDLike, GenomicRange};
use bstr::BString;
use noodles::gtf;

use crate::error::GtError;
use crate::io::open_file;
use crate::record::{Layout, Map, Template};

/// Best overlapping feature of one candidate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlapHit {
    pub feature_id: Option<String>,
    pub feature_type: Option<String>,
    /// Fraction of the candidate's aligned bases covered by the feature.
    pub overlap: f64,
    /// Whether any exon overlaps the candidate.
    pub exonic: bool,
}

impl OverlapHit {
    fn better_than(&self, other: &OverlapHit) -> bool {
        (self.overlap, self.exonic) > (other.overlap, other.exonic)
    }
}

/// Read-only feature index shared by every worker.
pub trait OverlapIndex: Sync {
    fn search(&self, map: &Map) -> OverlapHit;

    /// One hit per candidate of the template, in candidate order. A
    /// combination reports the better of its two mates.
    fn hits(&self, template: &Template) -> Vec<OverlapHit> {
        match &template.layout {
            Layout::SingleEnd(end) => end.maps.iter().map(|m| self.search(m)).collect(),
            Layout::PairedEnd(paired) => paired
                .combinations
                .iter()
                .map(|c| {
                    let (m1, m2) = paired.maps_of(c);
                    let (h1, h2) = (self.search(m1), self.search(m2));
                    if h2.better_than(&h1) {
                        h2
                    } else {
                        h1
                    }
                })
                .collect(),
        }
    }
}

/// Side-channel line describing the annotation of one surviving candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationReport {
    pub tag: BString,
    pub candidate: usize,
    pub hit: OverlapHit,
}

impl fmt::Display for AnnotationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}\t{:.4}\t{}",
            self.tag,
            self.candidate,
            self.hit.feature_id.as_deref().unwrap_or("."),
            self.hit.feature_type.as_deref().unwrap_or("."),
            self.hit.overlap,
            if self.hit.exonic { "exonic" } else { "non-exonic" },
        )
    }
}

#[derive(Debug, Clone)]
struct Feature {
    id: String,
    ty: String,
}

/// Gene and exon features loaded from a GTF file.
pub struct GtfIndex {
    features: GIntervalMap<Feature>,
    len: usize,
}

impl GtfIndex {
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut reader = gtf::io::Reader::new(reader);
        let mut features = Vec::new();
        for result in reader.record_bufs() {
            let record = result?;
            if record.reference_sequence_name().is_empty() {
                continue;
            }
            let ty = record.ty().to_string();
            if ty != "gene" && ty != "exon" {
                continue;
            }
            let id = record
                .attributes()
                .get(b"gene_id")
                .map(|value| value.as_string().unwrap_or_default().to_string())
                .with_context(|| format!("{} feature without gene_id", ty))?;
            let chrom = record.reference_sequence_name().to_string();
            // GTF is 1-based closed, the interval map is 0-based half-open
            let start = record.start().get() as u64 - 1;
            let end = record.end().get() as u64;
            features.push((GenomicRange::new(&chrom, start, end), Feature { id, ty }));
        }
        let len = features.len();
        Ok(Self {
            features: features.into_iter().collect(),
            len,
        })
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> std::result::Result<Self, GtError> {
        let path = path.as_ref();
        open_file(path)
            .and_then(|r| Self::from_reader(BufReader::new(r)))
            .map_err(|e| GtError::AnnotationSource {
                path: path.to_path_buf(),
                reason: format!("{:#}", e),
            })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl OverlapIndex for GtfIndex {
    fn search(&self, map: &Map) -> OverlapHit {
        // (id, type) -> overlapping bases
        let mut overlaps: BTreeMap<(&str, &str), u64> = BTreeMap::new();
        for block in map.blocks() {
            let start = block.position.saturating_sub(1);
            let end = start + block.length;
            let region = GenomicRange::new(&block.seq_name, start, end);
            for (range, feature) in self.features.find(&region) {
                let covered = end.min(range.end()).saturating_sub(start.max(range.start()));
                *overlaps
                    .entry((feature.id.as_str(), feature.ty.as_str()))
                    .or_default() += covered;
            }
        }
        let exonic = overlaps.keys().any(|(_, ty)| *ty == "exon");
        let total = map.length().max(1) as f64;
        // exons win ties over genes, then the smallest id
        let best = overlaps
            .into_iter()
            .max_by(|((id_a, ty_a), a), ((id_b, ty_b), b)| {
                a.cmp(b)
                    .then_with(|| (*ty_a == "exon").cmp(&(*ty_b == "exon")))
                    .then_with(|| id_b.cmp(id_a))
            });
        match best {
            Some(((id, ty), bases)) => OverlapHit {
                feature_id: Some(id.to_string()),
                feature_type: Some(ty.to_string()),
                overlap: bases as f64 / total,
                exonic,
            },
            None => OverlapHit::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{MapBlock, Strand};

    const GTF: &str = "chr1\ttest\tgene\t101\t1000\t.\t+\t.\tgene_id \"g1\"; gene_name \"A\";\n\
chr1\ttest\texon\t101\t200\t.\t+\t.\tgene_id \"g1\"; transcript_id \"t1\";\n\
chr1\ttest\texon\t801\t1000\t.\t+\t.\tgene_id \"g1\"; transcript_id \"t1\";\n\
chr2\ttest\tgene\t5001\t6000\t.\t-\t.\tgene_id \"g2\";\n";

    fn index() -> GtfIndex {
        GtfIndex::from_reader(GTF.as_bytes()).unwrap()
    }

    #[test]
    fn test_exonic_hit() {
        let index = index();
        assert_eq!(index.len(), 4);
        let hit = index.search(&Map::new(MapBlock::new("chr1", Strand::Forward, 151, 50)));
        assert_eq!(hit.feature_id.as_deref(), Some("g1"));
        assert_eq!(hit.feature_type.as_deref(), Some("exon"));
        assert!(hit.exonic);
        assert!((hit.overlap - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_intronic_and_intergenic() {
        let index = index();
        let hit = index.search(&Map::new(MapBlock::new("chr1", Strand::Forward, 401, 50)));
        assert_eq!(hit.feature_type.as_deref(), Some("gene"));
        assert!(!hit.exonic);

        let hit = index.search(&Map::new(MapBlock::new("chr3", Strand::Forward, 401, 50)));
        assert_eq!(hit, OverlapHit::default());
    }

    #[test]
    fn test_partial_overlap() {
        let index = index();
        let hit = index.search(&Map::new(MapBlock::new("chr2", Strand::Reverse, 4976, 50)));
        assert_eq!(hit.feature_id.as_deref(), Some("g2"));
        assert!((hit.overlap - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_missing_file() {
        match GtfIndex::from_path("/nonexistent/annotation.gtf") {
            Err(GtError::AnnotationSource { path, .. }) => {
                assert_eq!(path, Path::new("/nonexistent/annotation.gtf"))
            }
            other => panic!("expected annotation error, got {:?}", other.map(|i| i.len())),
        }
    }

    #[test]
    fn test_report_line() {
        let report = AnnotationReport {
            tag: "r1".into(),
            candidate: 0,
            hit: OverlapHit {
                feature_id: Some("g1".to_string()),
                feature_type: Some("exon".to_string()),
                overlap: 0.5,
                exonic: true,
            },
        };
        assert_eq!(report.to_string(), "r1\t0\tg1\texon\t0.5000\texonic");
    }
}
