//! The MAP line format.
//!
//! `tag TAB reads [TAB quals] TAB counters TAB maps`, where paired reads and
//! qualities are separated by a space, candidates by `,`, the ends of a
//! paired candidate by `::` and the blocks of a split map by `~`.

use bstr::{BString, ByteSlice};

use super::{push_num, push_tag, EncodeOptions};
use crate::error::ParseError;
use crate::record::{
    Alignment, Counters, Layout, Map, MapBlock, Mismatch, PairedEnd, Strand, Tag, Template,
};

/// Decode one MAP line. At most `max_matches` candidates are kept (0 keeps
/// every candidate).
pub fn parse_map_record(text: &[u8], line: u64, max_matches: usize) -> Result<Template, ParseError> {
    let fields = text.split_str("\t").collect::<Vec<_>>();
    let (tag, reads, quals, counters, maps) = match fields.as_slice() {
        [tag, reads, counters, maps] => (*tag, *reads, None, *counters, *maps),
        [tag, reads, quals, counters, maps] => (*tag, *reads, Some(*quals), *counters, *maps),
        _ => {
            return Err(ParseError::new(
                line,
                format!("expected 4 or 5 tab-separated fields, found {}", fields.len()),
            ))
        }
    };

    let reads = reads.split_str(" ").collect::<Vec<_>>();
    if reads.len() > 2 {
        return Err(ParseError::new(line, "at most two reads per record"));
    }
    let quals: Vec<Option<BString>> = match quals {
        Some(quals) => {
            let quals = quals.split_str(" ").collect::<Vec<_>>();
            if quals.len() != reads.len() {
                return Err(ParseError::new(line, "reads and qualities differ in number"));
            }
            if let Some(i) = (0..reads.len()).find(|&i| reads[i].len() != quals[i].len()) {
                return Err(ParseError::new(
                    line,
                    format!("read {} and its qualities differ in length", i + 1),
                ));
            }
            quals.into_iter().map(|q| Some(BString::from(q))).collect()
        }
        None => vec![None; reads.len()],
    };
    let mut ends = reads
        .into_iter()
        .zip(quals)
        .map(|(read, qual)| Alignment::new(read, qual));

    let counters = parse_counters(counters).map_err(|reason| ParseError::new(line, reason))?;
    let candidates = split_candidates(maps, max_matches);
    let tag = Tag::parse(tag);

    match (ends.next(), ends.next()) {
        (Some(mut end), None) => {
            let read_lengths = [end.read.len()];
            for candidate in candidates {
                let (mut endmaps, score) = parse_candidate(candidate, line, &read_lengths)?;
                if endmaps.len() != 1 {
                    return Err(ParseError::new(line, "paired candidate in a single-end record"));
                }
                let mut map = endmaps.swap_remove(0);
                map.score = score;
                end.maps.push(map);
            }
            end.counters = counters;
            Ok(Template::single(tag, end))
        }
        (Some(end1), Some(end2)) => {
            let read_lengths = [end1.read.len(), end2.read.len()];
            let mut paired = PairedEnd::new(end1, end2);
            for candidate in candidates {
                let (endmaps, score) = parse_candidate(candidate, line, &read_lengths)?;
                let endmaps: Result<[Map; 2], _> = endmaps.try_into();
                let Ok([map1, map2]) = endmaps else {
                    return Err(ParseError::new(line, "paired candidate needs one map per end"));
                };
                paired.push_combination(map1, map2, score);
            }
            paired.counters = counters;
            Ok(Template::paired(tag, paired))
        }
        _ => Err(ParseError::new(line, "record has no read")),
    }
}

/// Parse a counters field such as `0:1+2:0`.
pub fn parse_counters(field: &[u8]) -> Result<Counters, String> {
    let mut counts = Vec::new();
    let mut mcs = None;
    let mut start = 0;
    for (i, &c) in field.iter().enumerate().chain(std::iter::once((field.len(), &b':'))) {
        if c != b':' && c != b'+' {
            continue;
        }
        let token = &field[start..i];
        counts.push(
            lexical::parse::<u64, _>(token)
                .map_err(|_| format!("invalid counter '{}'", token.as_bstr()))?,
        );
        if c == b'+' {
            if mcs.is_some() {
                return Err("more than one '+' in counters".to_string());
            }
            mcs = Some(counts.len());
        }
        start = i + 1;
    }
    Ok(Counters::new(counts, mcs))
}

/// Split the maps field on top-level commas; commas inside `(I,3,1)` indel
/// groups belong to the candidate.
fn split_candidates(field: &[u8], max_matches: usize) -> Vec<&[u8]> {
    if field == b"-" || field.is_empty() {
        return Vec::new();
    }
    let mut candidates = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, &c) in field.iter().enumerate() {
        match c {
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                candidates.push(&field[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        if max_matches > 0 && candidates.len() == max_matches {
            return candidates;
        }
    }
    candidates.push(&field[start..]);
    candidates
}

/// `read_lengths[i]` bounds the mismatch positions of the i-th endmap.
fn parse_candidate(
    candidate: &[u8],
    line: u64,
    read_lengths: &[usize],
) -> Result<(Vec<Map>, Option<u64>), ParseError> {
    let (maps, score) = match candidate.rfind(":::") {
        Some(i) => {
            let score = lexical::parse::<u64, _>(&candidate[i + 3..]).map_err(|_| {
                ParseError::new(line, format!("invalid score in '{}'", candidate.as_bstr()))
            })?;
            (&candidate[..i], Some(score))
        }
        None => (candidate, None),
    };
    let maps = maps
        .split_str("::")
        .enumerate()
        .map(|(i, endmap)| parse_endmap(endmap, line, read_lengths.get(i).copied()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((maps, score))
}

fn parse_endmap(endmap: &[u8], line: u64, read_length: Option<usize>) -> Result<Map, ParseError> {
    let mut blocks = endmap
        .split_str("~")
        .map(|block| parse_block(block, line, read_length));
    let mut map = match blocks.next() {
        Some(block) => Map::new(block?),
        None => return Err(ParseError::new(line, "empty map")),
    };
    for block in blocks {
        map.push_block(block?);
    }
    Ok(map)
}

fn parse_block(block: &[u8], line: u64, read_length: Option<usize>) -> Result<MapBlock, ParseError> {
    let err = |reason: &str| ParseError::new(line, format!("{reason} in map block '{}'", block.as_bstr()));
    let mut fields = block.splitn_str(5, ":");
    let name = fields.next().filter(|n| !n.is_empty()).ok_or_else(|| err("missing name"))?;
    let strand = match fields.next() {
        Some([c]) => Strand::from_sigil(*c).ok_or_else(|| err("bad strand"))?,
        _ => return Err(err("bad strand")),
    };
    let position = fields
        .next()
        .and_then(|p| lexical::parse::<u64, _>(p).ok())
        .ok_or_else(|| err("bad position"))?;
    let length = fields
        .next()
        .and_then(|l| lexical::parse::<u64, _>(l).ok())
        .ok_or_else(|| err("bad length"))?;
    let mismatches = match fields.next() {
        Some(m) => parse_mismatches(m).map_err(|reason| err(&reason))?,
        None => Vec::new(),
    };
    if let Some(len) = read_length {
        // an indel may sit right after the last base
        let outside = mismatches.iter().find(|m| match m {
            Mismatch::Substitution { position, .. } => *position >= len,
            Mismatch::Insertion { position, .. } | Mismatch::Deletion { position, .. } => {
                *position > len
            }
        });
        if let Some(m) = outside {
            return Err(err(&format!(
                "mismatch position {} outside a read of length {}",
                m.position(),
                len
            )));
        }
    }
    let name = name
        .to_str()
        .map_err(|_| err("non UTF-8 name"))?
        .to_string();
    Ok(MapBlock::new(name, strand, position, length).with_mismatches(mismatches))
}

fn parse_mismatches(mut text: &[u8]) -> Result<Vec<Mismatch>, String> {
    let mut mismatches = Vec::new();
    while !text.is_empty() {
        if let Some(rest) = text.strip_prefix(b"(") {
            let end = rest.find_byte(b')').ok_or("unterminated indel")?;
            let parts = rest[..end].split_str(",").collect::<Vec<_>>();
            let [kind, position, size] = parts.as_slice() else {
                return Err("indel needs kind, position and size".to_string());
            };
            let position = lexical::parse::<usize, _>(position).map_err(|_| "bad indel position")?;
            let size = lexical::parse::<usize, _>(size).map_err(|_| "bad indel size")?;
            mismatches.push(match *kind {
                b"I" => Mismatch::Insertion { position, size },
                b"D" => Mismatch::Deletion { position, size },
                _ => return Err(format!("unknown indel kind '{}'", kind.as_bstr())),
            });
            text = &rest[end + 1..];
        } else {
            let [base, b'@', rest @ ..] = text else {
                return Err("substitution must be 'base@position'".to_string());
            };
            let digits = rest.iter().take_while(|c| c.is_ascii_digit()).count();
            let position = lexical::parse::<usize, _>(&rest[..digits])
                .map_err(|_| "bad substitution position")?;
            mismatches.push(Mismatch::Substitution {
                position,
                base: *base,
            });
            text = &rest[digits..];
        }
    }
    Ok(mismatches)
}

pub(super) fn write_map_record(buf: &mut Vec<u8>, template: &Template, options: &EncodeOptions) {
    push_tag(buf, &template.tag, options, None);
    let ends = template.alignments();
    buf.push(b'\t');
    for (i, end) in ends.iter().enumerate() {
        if i > 0 {
            buf.push(b' ');
        }
        buf.extend_from_slice(&end.read);
    }
    if ends.iter().all(|end| end.qualities.is_some()) {
        buf.push(b'\t');
        for (i, qual) in ends.iter().filter_map(|end| end.qualities.as_ref()).enumerate() {
            if i > 0 {
                buf.push(b' ');
            }
            buf.extend_from_slice(qual);
        }
    }
    buf.push(b'\t');
    write_counters(buf, template.counters());
    buf.push(b'\t');
    if !template.is_mapped() {
        buf.push(b'-');
    }
    let score = |s: Option<u64>| s.filter(|_| options.print_scores);
    match &template.layout {
        Layout::SingleEnd(end) => {
            for (i, map) in end.maps.iter().enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                write_map(buf, map);
                write_score(buf, score(map.score));
            }
        }
        Layout::PairedEnd(paired) => {
            for (i, combination) in paired.combinations.iter().enumerate() {
                if i > 0 {
                    buf.push(b',');
                }
                let (map1, map2) = paired.maps_of(combination);
                write_map(buf, map1);
                buf.extend_from_slice(b"::");
                write_map(buf, map2);
                write_score(buf, score(combination.score));
            }
        }
    }
    buf.push(b'\n');
}

fn write_counters(buf: &mut Vec<u8>, counters: &Counters) {
    let mcs = counters.mcs().filter(|&m| m > 0);
    // strata up to the mcs mark are printed even when empty
    let len = counters.len().max(mcs.map_or(0, |m| m + 1));
    if len == 0 {
        buf.push(b'0');
        return;
    }
    for i in 0..len {
        if i > 0 {
            buf.push(if Some(i) == mcs { b'+' } else { b':' });
        }
        push_num(buf, counters.get(i));
    }
}

fn write_score(buf: &mut Vec<u8>, score: Option<u64>) {
    if let Some(score) = score {
        buf.extend_from_slice(b":::");
        push_num(buf, score);
    }
}

fn write_map(buf: &mut Vec<u8>, map: &Map) {
    for (i, block) in map.blocks().iter().enumerate() {
        if i > 0 {
            buf.push(b'~');
        }
        buf.extend_from_slice(block.seq_name.as_bytes());
        buf.push(b':');
        buf.push(block.strand.sigil());
        buf.push(b':');
        push_num(buf, block.position);
        buf.push(b':');
        push_num(buf, block.length);
        if !block.mismatches.is_empty() {
            buf.push(b':');
            for mismatch in &block.mismatches {
                match *mismatch {
                    Mismatch::Substitution { position, base } => {
                        buf.push(base);
                        buf.push(b'@');
                        push_num(buf, position);
                    }
                    Mismatch::Insertion { position, size } | Mismatch::Deletion { position, size } => {
                        let kind = if matches!(mismatch, Mismatch::Insertion { .. }) { b'I' } else { b'D' };
                        buf.extend_from_slice(&[b'(', kind, b',']);
                        push_num(buf, position);
                        buf.push(b',');
                        push_num(buf, size);
                        buf.push(b')');
                    }
                }
            }
        }
    }
}
