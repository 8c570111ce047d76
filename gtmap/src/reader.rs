//! Chunked reading of one or more record-aligned streams.
//!
//! All cursors sit behind a single mutex. A call to
//! [`SynchronizedReader::next_chunk`] copies the raw bytes of the next
//! records from every stream in lock-step, so record `N` of every stream
//! always ends up in the same [`ChunkSet`]. Decoding happens afterwards,
//! outside the lock.

use std::io::{self, BufRead};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::Result as AnyResult;
use bstr::{BString, ByteSlice};
use itertools::Itertools;
use log::debug;
use smallvec::SmallVec;

use crate::codec::FileFormat;
use crate::error::{GtError, Result};
use crate::io::open_file;
use crate::record::strip_mate_suffix;

pub const DEFAULT_CHUNK_SIZE: usize = 4 << 20;

pub type Stream = Box<dyn BufRead + Send>;

/// Raw bytes of consecutive records from one stream.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub format: FileFormat,
    pub data: Vec<u8>,
    /// Raw records in `data`; interleaved mates count separately.
    pub records: usize,
    /// Line number of the first record in its stream.
    pub first_line: u64,
}

/// One unit of work: a chunk per logical stream, all covering the same
/// record range.
#[derive(Debug, Clone)]
pub struct ChunkSet {
    pub id: u64,
    pub chunks: SmallVec<[Chunk; 2]>,
}

impl ChunkSet {
    pub fn num_records(&self) -> usize {
        self.chunks.first().map_or(0, |c| c.records)
    }

    pub fn num_bytes(&self) -> usize {
        self.chunks.iter().map(|c| c.data.len()).sum()
    }
}

struct RawRecord {
    name: BString,
    line: u64,
}

struct Source {
    reader: Stream,
    format: Option<FileFormat>,
    line: u64,
}

impl Source {
    fn new(reader: Stream) -> Self {
        Self {
            reader,
            format: None,
            line: 0,
        }
    }

    fn read_line(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        let n = self.reader.read_until(b'\n', out)?;
        if n > 0 {
            self.line += 1;
            if out.last() != Some(&b'\n') {
                out.push(b'\n');
            }
        }
        Ok(n)
    }

    /// Append the next record of this stream to `out`. Blank lines before
    /// it are kept when `keep_blank` is set, so that line numbers counted
    /// over `out` stay in step with the stream.
    fn read_record(
        &mut self,
        stream: usize,
        out: &mut Vec<u8>,
        keep_blank: bool,
    ) -> Result<Option<RawRecord>> {
        let origin = out.len();
        let mut start = origin;
        loop {
            if self.read_line(out)? == 0 {
                out.truncate(origin);
                return Ok(None);
            }
            if !out[start..].trim().is_empty() {
                break;
            }
            if keep_blank {
                start = out.len();
            } else {
                out.truncate(start);
            }
        }
        let line = self.line;
        let format = *self
            .format
            .get_or_insert_with(|| FileFormat::detect(out[start]));
        let name = record_name(&out[start..], format);
        match format {
            FileFormat::Map => {}
            FileFormat::Fastq => {
                for _ in 0..3 {
                    if self.read_line(out)? == 0 {
                        return Err(GtError::TruncatedInput {
                            stream,
                            line: self.line,
                        });
                    }
                }
            }
            FileFormat::Fasta => loop {
                let at_next = matches!(self.reader.fill_buf()?.first(), None | Some(b'>'));
                if at_next {
                    break;
                }
                self.read_line(out)?;
            },
        }
        Ok(Some(RawRecord { name, line }))
    }
}

fn record_name(header: &[u8], format: FileFormat) -> BString {
    let header = match format {
        FileFormat::Map => header,
        FileFormat::Fastq | FileFormat::Fasta => &header[1..],
    };
    let end = header
        .find_byteset(b" \t\r\n")
        .unwrap_or(header.len());
    header[..end].into()
}

struct State {
    sources: Vec<Source>,
    current: usize,
    next_id: u64,
    poison: Option<GtError>,
}

pub struct SynchronizedReader {
    state: Mutex<State>,
    num_streams: usize,
    chunk_size: usize,
    paired: bool,
    check_tags: bool,
    chained: bool,
}

impl SynchronizedReader {
    /// Streams that must stay record-aligned (e.g. mate files).
    pub fn new<I: IntoIterator<Item = Stream>>(streams: I) -> Self {
        let sources = streams.into_iter().map(Source::new).collect::<Vec<_>>();
        Self {
            num_streams: sources.len(),
            state: Mutex::new(State {
                sources,
                current: 0,
                next_id: 0,
                poison: None,
            }),
            chunk_size: DEFAULT_CHUNK_SIZE,
            paired: false,
            check_tags: true,
            chained: false,
        }
    }

    /// Streams read one after another as a single logical stream.
    pub fn chained<I: IntoIterator<Item = Stream>>(streams: I) -> Self {
        let mut reader = Self::new(streams);
        reader.num_streams = 1;
        reader.chained = true;
        reader
    }

    /// Byte budget per chunk, summed over all streams.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Keep interleaved FASTA/FASTQ mates in the same chunk.
    pub fn with_paired(mut self, paired: bool) -> Self {
        self.paired = paired;
        self
    }

    pub fn with_tag_check(mut self, check_tags: bool) -> Self {
        self.check_tags = check_tags;
        self
    }

    /// Number of chunks in every [`ChunkSet`].
    pub fn num_streams(&self) -> usize {
        self.num_streams
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next chunk set, or `None` once every stream is exhausted. Safe to call
    /// from many workers at once. After a fatal error every later call fails
    /// the same way.
    pub fn next_chunk(&self) -> Result<Option<ChunkSet>> {
        let mut state = self.lock();
        if let Some(err) = &state.poison {
            return Err(replay(err));
        }
        let result = if self.chained {
            self.fill_chained(&mut state)
        } else {
            self.fill_lockstep(&mut state)
        };
        match result {
            Ok(Some(chunks)) => {
                let id = state.next_id;
                state.next_id += 1;
                let set = ChunkSet { id, chunks };
                debug!(
                    "chunk {}: {} records, {} bytes",
                    set.id,
                    set.num_records(),
                    set.num_bytes()
                );
                Ok(Some(set))
            }
            Ok(None) => Ok(None),
            Err(err) => {
                state.poison = Some(replay(&err));
                Err(err)
            }
        }
    }

    fn fill_lockstep(&self, state: &mut State) -> Result<Option<SmallVec<[Chunk; 2]>>> {
        if state.sources.is_empty() {
            return Ok(None);
        }
        let id = state.next_id;
        let mut chunks: SmallVec<[Chunk; 2]> =
            (0..state.sources.len()).map(|_| Chunk::default()).collect();
        let mut accumulated = 0;
        let mut steps = 0;
        while accumulated < self.chunk_size {
            match self.read_step(state, &mut chunks, id, steps)? {
                Some(n) => accumulated += n,
                None => break,
            }
            steps += 1;
            let interleaved = state.sources[0]
                .format
                .is_some_and(|f| f != FileFormat::Map);
            if self.paired && interleaved {
                match self.read_step(state, &mut chunks, id, steps)? {
                    Some(n) => accumulated += n,
                    None => {
                        return Err(GtError::TruncatedInput {
                            stream: 0,
                            line: state.sources[0].line,
                        })
                    }
                }
                steps += 1;
            }
        }
        Ok((steps > 0).then_some(chunks))
    }

    /// Read one record from every stream. Returns the bytes read, or `None`
    /// when all streams ended together.
    fn read_step(
        &self,
        state: &mut State,
        chunks: &mut [Chunk],
        id: u64,
        step: usize,
    ) -> Result<Option<usize>> {
        let mut names: SmallVec<[BString; 2]> = SmallVec::new();
        let mut missing = None;
        let mut bytes = 0;
        for (i, (source, chunk)) in state.sources.iter_mut().zip(chunks.iter_mut()).enumerate() {
            let before = chunk.data.len();
            match source.read_record(i, &mut chunk.data, chunk.records > 0)? {
                Some(record) => {
                    if chunk.records == 0 {
                        chunk.first_line = record.line;
                        chunk.format = source.format.unwrap_or_default();
                    }
                    chunk.records += 1;
                    bytes += chunk.data.len() - before;
                    names.push(record.name);
                }
                None => {
                    missing.get_or_insert((i, source.line));
                }
            }
        }
        if names.is_empty() {
            return Ok(None);
        }
        if let Some((stream, line)) = missing {
            return Err(GtError::TruncatedInput { stream, line });
        }
        if self.check_tags
            && names.len() > 1
            && !names.iter().map(|n| strip_mate_suffix(n).0).all_equal()
        {
            return Err(GtError::Desync {
                chunk: id,
                record: step,
                tags: names.iter().map(|n| n.to_string()).collect(),
            });
        }
        Ok(Some(bytes))
    }

    fn fill_chained(&self, state: &mut State) -> Result<Option<SmallVec<[Chunk; 2]>>> {
        let mut chunk = Chunk::default();
        while chunk.data.len() < self.chunk_size && state.current < state.sources.len() {
            let stream = state.current;
            let source = &mut state.sources[stream];
            match source.read_record(stream, &mut chunk.data, chunk.records > 0)? {
                Some(record) => {
                    if chunk.records == 0 {
                        chunk.first_line = record.line;
                        chunk.format = source.format.unwrap_or_default();
                    }
                    chunk.records += 1;
                    let interleaved = source.format.is_some_and(|f| f != FileFormat::Map);
                    if self.paired && interleaved {
                        if source.read_record(stream, &mut chunk.data, true)?.is_none() {
                            return Err(GtError::TruncatedInput {
                                stream,
                                line: source.line,
                            });
                        }
                        chunk.records += 1;
                    }
                }
                None => {
                    state.current += 1;
                    // a chunk never spans two sources
                    if chunk.records > 0 {
                        break;
                    }
                }
            }
        }
        Ok((chunk.records > 0).then(|| SmallVec::from_iter([chunk])))
    }
}

/// Rebuild a fatal error so it can be reported again by later calls.
fn replay(err: &GtError) -> GtError {
    match err {
        GtError::Desync { chunk, record, tags } => GtError::Desync {
            chunk: *chunk,
            record: *record,
            tags: tags.clone(),
        },
        GtError::TruncatedInput { stream, line } => GtError::TruncatedInput {
            stream: *stream,
            line: *line,
        },
        other => GtError::Io(io::Error::other(other.to_string())),
    }
}

pub fn open_synchronized<I: IntoIterator<Item = Stream>>(streams: I) -> SynchronizedReader {
    SynchronizedReader::new(streams)
}

/// Open (possibly compressed) files as record-aligned streams.
pub fn open_synchronized_paths<P: AsRef<Path>>(paths: &[P]) -> AnyResult<SynchronizedReader> {
    let streams = paths
        .iter()
        .map(|p| open_file(p).map(|r| Box::new(io::BufReader::new(r)) as Stream))
        .collect::<AnyResult<Vec<_>>>()?;
    Ok(SynchronizedReader::new(streams))
}
