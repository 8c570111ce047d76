//! Text codecs for MAP, FASTQ and FASTA records.
//!
//! Decoding works on the raw bytes of one [`Chunk`] and yields templates
//! lazily; encoding appends to a caller-owned buffer so that workers can
//! batch a whole chunk before touching the shared sink.

mod fastx;
mod map;

use bstr::{BString, ByteSlice};

use crate::error::ParseError;
use crate::reader::Chunk;
use crate::record::{PairedEnd, Tag, Template};

pub use map::{parse_counters, parse_map_record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileFormat {
    #[default]
    Map,
    Fastq,
    Fasta,
}

impl FileFormat {
    /// Guess the format from the first byte of a record.
    pub fn detect(first: u8) -> Self {
        match first {
            b'>' => FileFormat::Fasta,
            b'@' => FileFormat::Fastq,
            _ => FileFormat::Map,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    /// Join consecutive FASTA/FASTQ records into paired templates.
    pub paired: bool,
    /// Maximum number of candidates kept per template; 0 keeps all.
    pub max_matches: usize,
}

impl DecodeOptions {
    pub fn with_paired(mut self, paired: bool) -> Self {
        self.paired = paired;
        self
    }

    pub fn with_max_matches(mut self, max_matches: usize) -> Self {
        self.max_matches = max_matches;
        self
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    pub format: FileFormat,
    pub print_extra: bool,
    pub print_casava: bool,
    pub print_scores: bool,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            format: FileFormat::Map,
            print_extra: true,
            print_casava: true,
            print_scores: true,
        }
    }
}

impl EncodeOptions {
    pub fn with_format(mut self, format: FileFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_extra(mut self, print_extra: bool) -> Self {
        self.print_extra = print_extra;
        self
    }

    pub fn with_casava(mut self, print_casava: bool) -> Self {
        self.print_casava = print_casava;
        self
    }

    pub fn with_scores(mut self, print_scores: bool) -> Self {
        self.print_scores = print_scores;
        self
    }
}

pub fn decode(chunk: &Chunk, options: DecodeOptions) -> Records<'_> {
    decode_bytes(&chunk.data, chunk.format, chunk.first_line, options)
}

/// Decode raw text that starts at line `first_line` of its source.
pub fn decode_bytes(
    data: &[u8],
    format: FileFormat,
    first_line: u64,
    options: DecodeOptions,
) -> Records<'_> {
    Records {
        lines: Lines {
            data,
            pos: 0,
            line: first_line,
        },
        format,
        options,
    }
}

pub(crate) struct Lines<'a> {
    data: &'a [u8],
    pos: usize,
    line: u64,
}

impl<'a> Lines<'a> {
    /// Next line without its terminator, together with its line number.
    pub(crate) fn next_line(&mut self) -> Option<(u64, &'a [u8])> {
        if self.pos >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.pos..];
        let (line, advance) = match rest.find_byte(b'\n') {
            Some(i) => (&rest[..i], i + 1),
            None => (rest, rest.len()),
        };
        self.pos += advance;
        let number = self.line;
        self.line += 1;
        Some((number, line.strip_suffix(b"\r").unwrap_or(line)))
    }

    pub(crate) fn peek_byte(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Skip lines holding nothing but whitespace, counting them.
    pub(crate) fn skip_blank(&mut self) {
        loop {
            let rest = self.data.get(self.pos..).unwrap_or_default();
            let end = rest.find_byte(b'\n').unwrap_or(rest.len());
            if rest.is_empty() || !rest[..end].trim().is_empty() {
                break;
            }
            self.next_line();
        }
    }

    pub(crate) fn line(&self) -> u64 {
        self.line
    }
}

/// Lazy decoder over one chunk. A malformed record yields a `ParseError`
/// and decoding resumes with the following record.
pub struct Records<'a> {
    lines: Lines<'a>,
    format: FileFormat,
    options: DecodeOptions,
}

impl Iterator for Records<'_> {
    type Item = Result<Template, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.lines.skip_blank();
        match self.format {
            FileFormat::Map => {
                let (line, text) = self.lines.next_line()?;
                Some(parse_map_record(text, line, self.options.max_matches))
            }
            FileFormat::Fastq | FileFormat::Fasta => {
                let format = self.format;
                let read = |lines: &mut Lines<'_>| match format {
                    FileFormat::Fastq => fastx::read_fastq(lines),
                    _ => fastx::read_fasta(lines),
                };
                let line = self.lines.line();
                let first = match read(&mut self.lines)? {
                    Ok(end) => end,
                    Err(e) => return Some(Err(e)),
                };
                if !self.options.paired {
                    let (tag, alignment) = first;
                    return Some(Ok(Template::single(tag, alignment)));
                }
                self.lines.skip_blank();
                let second = match read(&mut self.lines) {
                    Some(Ok(end)) => end,
                    Some(Err(e)) => return Some(Err(e)),
                    None => return Some(Err(ParseError::new(line, "missing second mate"))),
                };
                Some(join_mates(first, second, line))
            }
        }
    }
}

fn join_mates(
    (mut tag, end1): (Tag, crate::record::Alignment),
    (tag2, end2): (Tag, crate::record::Alignment),
    line: u64,
) -> Result<Template, ParseError> {
    let name = BString::from(tag.mate_free_name());
    if name != tag2.mate_free_name() {
        return Err(ParseError::new(
            line,
            format!("mate names differ: {} != {}", tag.name, tag2.name),
        ));
    }
    tag.name = name;
    Ok(Template::paired(tag, PairedEnd::new(end1, end2)))
}

pub fn encode(template: &Template, options: &EncodeOptions) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(&mut buf, template, options);
    buf
}

/// Append the textual form of `template`, newline included.
pub fn encode_into(buf: &mut Vec<u8>, template: &Template, options: &EncodeOptions) {
    match options.format {
        FileFormat::Map => map::write_map_record(buf, template, options),
        FileFormat::Fastq | FileFormat::Fasta => fastx::write_fastx(buf, template, options),
    }
}

pub(crate) fn push_tag(buf: &mut Vec<u8>, tag: &Tag, options: &EncodeOptions, mate: Option<usize>) {
    buf.extend_from_slice(&tag.name);
    let casava = tag.casava.as_ref().filter(|_| options.print_casava);
    match (mate, casava) {
        (_, Some(casava)) => {
            buf.push(b' ');
            buf.extend_from_slice(casava);
        }
        (Some(mate), None) => {
            buf.push(b'/');
            push_num(buf, mate as u64);
        }
        (None, None) => {}
    }
    if let Some(extra) = tag.extra.as_ref().filter(|_| options.print_extra) {
        buf.push(b' ');
        buf.extend_from_slice(extra);
    }
}

pub(crate) fn push_num<N: lexical::ToLexical>(buf: &mut Vec<u8>, n: N) {
    buf.extend_from_slice(lexical::to_string(n).as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use bstr::ByteSlice;
    use crate::record::Layout;

    #[test]
    fn test_detect() {
        assert_eq!(FileFormat::detect(b'>'), FileFormat::Fasta);
        assert_eq!(FileFormat::detect(b'@'), FileFormat::Fastq);
        assert_eq!(FileFormat::detect(b'r'), FileFormat::Map);
    }

    #[test]
    fn test_fastq_paired_decode() {
        let data = b"@r1/1\nACGT\n+\nIIII\n\n@r1/2\nTTGA\n+\nIIHH\n";
        let templates = decode_bytes(data, FileFormat::Fastq, 1, DecodeOptions::default().with_paired(true))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(templates.len(), 1);
        assert_eq!(templates[0].tag.name, "r1");
        match &templates[0].layout {
            Layout::PairedEnd(pe) => {
                assert_eq!(pe.ends[1].read, "TTGA");
                assert_eq!(pe.ends[1].qualities.as_ref().map(|s| s.as_bstr()), Some(b"IIHH".as_bstr()));
            }
            Layout::SingleEnd(_) => panic!("expected paired template"),
        }

        let out = encode(
            &templates[0],
            &EncodeOptions::default().with_format(FileFormat::Fastq),
        );
        assert_eq!(out, b"@r1/1\nACGT\n+\nIIII\n@r1/2\nTTGA\n+\nIIHH\n");
    }

    #[test]
    fn test_mate_name_mismatch() {
        let data = b"@r1/1\nACGT\n+\nIIII\n@r2/2\nTTGA\n+\nIIHH\n";
        let result = decode_bytes(data, FileFormat::Fastq, 1, DecodeOptions::default().with_paired(true))
            .next()
            .unwrap();
        assert!(result.unwrap_err().reason.contains("mate names differ"));
    }

    #[test]
    fn test_casava_replaces_mate_suffix() {
        let data = b"@r9 1:N:0:ACGT\nAAAA\n+\n####\n";
        let t = decode_bytes(data, FileFormat::Fastq, 1, DecodeOptions::default())
            .next()
            .unwrap()
            .unwrap();
        let out = encode(&t, &EncodeOptions::default().with_format(FileFormat::Fasta));
        assert_eq!(out, b">r9 1:N:0:ACGT\nAAAA\n");
        let out = encode(
            &t,
            &EncodeOptions::default()
                .with_format(FileFormat::Fasta)
                .with_casava(false),
        );
        assert_eq!(out, b">r9\nAAAA\n");
    }
}
