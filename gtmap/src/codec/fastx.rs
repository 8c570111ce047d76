use bstr::BString;

use super::{push_tag, EncodeOptions, FileFormat, Lines};
use crate::error::ParseError;
use crate::record::{Alignment, Tag, Template};

type End = (Tag, Alignment);

pub(super) fn read_fastq(lines: &mut Lines<'_>) -> Option<Result<End, ParseError>> {
    let (line, header) = lines.next_line()?;
    Some(parse_fastq(lines, line, header))
}

fn parse_fastq(lines: &mut Lines<'_>, line: u64, header: &[u8]) -> Result<End, ParseError> {
    let name = header
        .strip_prefix(b"@")
        .ok_or_else(|| ParseError::new(line, "FASTQ header must start with '@'"))?;
    let mut field = |what: &str| {
        lines
            .next_line()
            .map(|(_, text)| text)
            .ok_or_else(|| ParseError::new(line, format!("FASTQ record ends before its {what}")))
    };
    let seq = field("sequence")?;
    let plus = field("separator")?;
    let qual = field("qualities")?;
    if !plus.starts_with(b"+") {
        return Err(ParseError::new(line, "FASTQ separator must start with '+'"));
    }
    if seq.len() != qual.len() {
        return Err(ParseError::new(
            line,
            format!(
                "sequence and quality lengths differ ({} vs {})",
                seq.len(),
                qual.len()
            ),
        ));
    }
    Ok((
        Tag::parse(name),
        Alignment::new(seq, Some(BString::from(qual))),
    ))
}

/// Header plus every sequence line up to the next `>`.
pub(super) fn read_fasta(lines: &mut Lines<'_>) -> Option<Result<End, ParseError>> {
    let (line, header) = lines.next_line()?;
    let Some(name) = header.strip_prefix(b">") else {
        return Some(Err(ParseError::new(
            line,
            "FASTA header must start with '>'",
        )));
    };
    let mut seq = Vec::new();
    while lines.peek_byte().is_some_and(|b| b != b'>') {
        if let Some((_, text)) = lines.next_line() {
            seq.extend_from_slice(text);
        }
    }
    Some(Ok((Tag::parse(name), Alignment::new(seq, None))))
}

pub(super) fn write_fastx(buf: &mut Vec<u8>, template: &Template, options: &EncodeOptions) {
    let paired = template.is_paired();
    for (i, end) in template.alignments().iter().enumerate() {
        let mate = paired.then_some(i + 1);
        match (&end.qualities, options.format) {
            (Some(qual), FileFormat::Fastq) => {
                buf.push(b'@');
                push_tag(buf, &template.tag, options, mate);
                buf.push(b'\n');
                buf.extend_from_slice(&end.read);
                buf.extend_from_slice(b"\n+\n");
                buf.extend_from_slice(qual);
                buf.push(b'\n');
            }
            _ => {
                buf.push(b'>');
                push_tag(buf, &template.tag, options, mate);
                buf.push(b'\n');
                buf.extend_from_slice(&end.read);
                buf.push(b'\n');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{decode_bytes, encode, DecodeOptions};
    use super::*;

    #[test]
    fn test_multiline_fasta() {
        let data = b">chrA desc\nACGT\nTTGG\n>chrB\nAA\n";
        let templates = decode_bytes(data, FileFormat::Fasta, 1, DecodeOptions::default())
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[0].alignments()[0].read, "ACGTTTGG");
        assert_eq!(templates[0].tag.extra.as_ref().unwrap(), "desc");
        assert_eq!(templates[1].tag.name, "chrB");
    }

    #[test]
    fn test_truncated_fastq() {
        let data = b"@r1\nACGT\n+\n";
        let err = decode_bytes(data, FileFormat::Fastq, 7, DecodeOptions::default())
            .next()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.line, 7);
        assert!(err.reason.contains("qualities"));
    }

    #[test]
    fn test_fastq_without_qualities_falls_back_to_fasta() {
        let t = Template::single(Tag::new("r2"), Alignment::new("ACGT", None));
        let out = encode(&t, &EncodeOptions::default().with_format(FileFormat::Fastq));
        assert_eq!(out, b">r2\nACGT\n");
    }
}
