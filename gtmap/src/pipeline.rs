//! Worker pool driving reader, processors and output sink.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};

use crate::annotate::{GtfIndex, OverlapIndex};
use crate::codec::{decode, encode_into, DecodeOptions, EncodeOptions, Records};
use crate::error::{GtError, Result};
use crate::filter::{filter, FilterParams};
use crate::merge::merge_templates;
use crate::output::SynchronizedWriter;
use crate::qc::{merge, AccumulateMode, Stats};
use crate::reader::{ChunkSet, SynchronizedReader};
use crate::record::Template;

/// Per-record work of a pipeline. A record group holds one template per
/// input stream, all describing the same reads.
pub trait Processor: Sync {
    /// Worker-local state, returned to the caller when the run ends.
    type State: Send;

    fn init(&self) -> Self::State;

    /// Consume one record group and append its output to `buf`.
    fn process(&self, state: &mut Self::State, group: Vec<Template>, buf: &mut Vec<u8>) -> Result<()>;

    /// Called for every record group dropped because it failed to decode.
    fn skip(&self, _state: &mut Self::State) {}

    /// Called once the buffer of chunk `chunk_id` has been handed over.
    fn end_chunk(&self, _state: &mut Self::State, _chunk_id: u64) -> Result<()> {
        Ok(())
    }
}

/// Counts of a finished run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub chunks: u64,
    pub templates: u64,
    pub skipped: u64,
    pub bytes_read: u64,
}

pub struct RunOutput<S> {
    pub summary: RunSummary,
    /// One state per worker, in worker order. After a fatal error they hold
    /// everything processed before the workers stopped.
    pub states: Vec<S>,
    /// First fatal error, if the run stopped early.
    pub failure: Option<GtError>,
}

impl<S> RunOutput<S> {
    /// Turn a stopped run into [`GtError::Aborted`].
    pub fn into_result(mut self) -> Result<Self> {
        match self.failure.take() {
            Some(source) => Err(GtError::Aborted {
                processed: self.summary.templates,
                source: Box::new(source),
            }),
            None => Ok(self),
        }
    }
}

pub struct Pipeline {
    num_threads: usize,
    decode_options: DecodeOptions,
    progress: bool,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Pipeline {
    pub fn new(num_threads: usize) -> Self {
        Self {
            num_threads: num_threads.max(1),
            decode_options: DecodeOptions::default(),
            progress: false,
        }
    }

    pub fn with_decode_options(mut self, decode_options: DecodeOptions) -> Self {
        self.decode_options = decode_options;
        self
    }

    /// Show a progress bar counting processed records.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Run every worker until the reader is exhausted or a fatal error
    /// occurs. After a fatal error the workers stop once their current chunk
    /// is done and the run fails with [`GtError::Aborted`].
    pub fn run<P, W>(
        &self,
        reader: &SynchronizedReader,
        processor: &P,
        writer: &SynchronizedWriter<W>,
    ) -> Result<RunOutput<P::State>>
    where
        P: Processor,
        W: Write + Send,
    {
        self.run_partial(reader, processor, writer)?.into_result()
    }

    /// Like [`Pipeline::run`], but a fatal error is returned in
    /// [`RunOutput::failure`] next to the worker states gathered so far.
    pub fn run_partial<P, W>(
        &self,
        reader: &SynchronizedReader,
        processor: &P,
        writer: &SynchronizedWriter<W>,
    ) -> Result<RunOutput<P::State>>
    where
        P: Processor,
        W: Write + Send,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.num_threads)
            .build()
            .map_err(|e| GtError::Io(io::Error::other(e)))?;
        let progress_bar = if self.progress {
            let style = ProgressStyle::with_template("[{elapsed}] {human_pos:>7} records ({per_sec})")
                .map_err(|e| GtError::Io(io::Error::other(e)))?;
            ProgressBar::new_spinner().with_style(style)
        } else {
            ProgressBar::hidden()
        };
        let ctx = RunContext {
            reader,
            writer,
            processor,
            decode_options: self.decode_options,
            progress_bar,
            abort: AtomicBool::new(false),
            failure: Mutex::new(None),
            chunks: AtomicU64::new(0),
            templates: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
        };

        let states = pool.broadcast(|worker| ctx.worker(worker.index()));
        ctx.progress_bar.finish_and_clear();

        let summary = RunSummary {
            chunks: ctx.chunks.load(Ordering::Relaxed),
            templates: ctx.templates.load(Ordering::Relaxed),
            skipped: ctx.skipped.load(Ordering::Relaxed),
            bytes_read: ctx.bytes_read.load(Ordering::Relaxed),
        };
        let failure = ctx.failure.into_inner().unwrap_or_else(PoisonError::into_inner);
        match &failure {
            Some(err) => warn!("run stopped after {} templates: {}", summary.templates, err),
            None => info!(
                "processed {} templates in {} chunks with {} workers ({} skipped)",
                summary.templates, summary.chunks, self.num_threads, summary.skipped
            ),
        }
        Ok(RunOutput {
            summary,
            states,
            failure,
        })
    }
}

struct RunContext<'a, P: Processor, W: Write> {
    reader: &'a SynchronizedReader,
    writer: &'a SynchronizedWriter<W>,
    processor: &'a P,
    decode_options: DecodeOptions,
    progress_bar: ProgressBar,
    abort: AtomicBool,
    failure: Mutex<Option<GtError>>,
    chunks: AtomicU64,
    templates: AtomicU64,
    skipped: AtomicU64,
    bytes_read: AtomicU64,
}

impl<P: Processor, W: Write + Send> RunContext<'_, P, W> {
    fn worker(&self, index: usize) -> P::State {
        let mut state = self.processor.init();
        let mut buf = Vec::new();
        while !self.abort.load(Ordering::Relaxed) {
            let set = match self.reader.next_chunk() {
                Ok(Some(set)) => set,
                Ok(None) => break,
                Err(err) => {
                    self.fail(err);
                    break;
                }
            };
            let result = self
                .process_chunk(&set, &mut state, &mut buf)
                .and_then(|n| {
                    self.writer.write_chunk(set.id, std::mem::take(&mut buf))?;
                    self.processor.end_chunk(&mut state, set.id)?;
                    Ok(n)
                });
            match result {
                Ok(n) => {
                    debug!("worker {} finished chunk {} ({} templates)", index, set.id, n);
                    self.chunks.fetch_add(1, Ordering::Relaxed);
                    self.bytes_read.fetch_add(set.num_bytes() as u64, Ordering::Relaxed);
                    self.progress_bar.inc(n);
                }
                Err(err) => {
                    self.fail(err);
                    break;
                }
            }
        }
        state
    }

    /// Keep the first fatal error and stop every worker.
    fn fail(&self, err: GtError) {
        self.abort.store(true, Ordering::Relaxed);
        let mut failure = self.failure.lock().unwrap_or_else(PoisonError::into_inner);
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    fn process_chunk(&self, set: &ChunkSet, state: &mut P::State, buf: &mut Vec<u8>) -> Result<u64> {
        buf.clear();
        let mut records = set
            .chunks
            .iter()
            .map(|chunk| decode(chunk, self.decode_options))
            .collect::<Vec<Records>>();
        let mut processed = 0;
        for index in 0.. {
            let items = records.iter_mut().map(Iterator::next).collect::<Vec<_>>();
            if items.iter().all(Option::is_none) {
                break;
            }
            let mut group = Vec::with_capacity(items.len());
            let mut skip = false;
            for (stream, item) in items.into_iter().enumerate() {
                match item {
                    Some(Ok(template)) => group.push(template),
                    Some(Err(err)) => {
                        warn!("skipping malformed record in stream {}: {}", stream, err);
                        skip = true;
                    }
                    None => {
                        return Err(GtError::Desync {
                            chunk: set.id,
                            record: index,
                            tags: vec![format!("stream {} ended early", stream)],
                        })
                    }
                }
            }
            if skip {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                self.processor.skip(state);
                continue;
            }
            match self.processor.process(state, group, buf) {
                Ok(()) => processed += 1,
                Err(err) if !err.is_fatal() => {
                    warn!("skipping record group {} of chunk {}: {}", index, set.id, err);
                    self.skipped.fetch_add(1, Ordering::Relaxed);
                    self.processor.skip(state);
                }
                Err(err) => return Err(err),
            }
        }
        self.templates.fetch_add(processed, Ordering::Relaxed);
        Ok(processed)
    }
}

/// Worker state of [`FilterProcessor`].
#[derive(Debug, Default)]
pub struct FilterState {
    pub stats: Stats,
    annotations: Vec<u8>,
}

/// Filter every template, optionally annotating it and accumulating stats
/// over the survivors.
pub struct FilterProcessor<'a> {
    params: FilterParams,
    encode_options: EncodeOptions,
    index: Option<&'a dyn OverlapIndex>,
    loaded_index: Option<GtfIndex>,
    stats: Option<AccumulateMode>,
    annotation_sink: Option<&'a SynchronizedWriter<Box<dyn Write + Send>>>,
}

impl<'a> FilterProcessor<'a> {
    /// Validate `params` and load the GTF named by `annotation_source`, so a
    /// bad configuration fails before any record is read.
    pub fn new(params: FilterParams) -> Result<Self> {
        params.validate()?;
        let loaded_index = match &params.annotation_source {
            Some(path) => {
                let index = GtfIndex::from_path(path)?;
                info!("loaded {} features from {}", index.len(), path.display());
                Some(index)
            }
            None => None,
        };
        Ok(Self {
            params,
            encode_options: EncodeOptions::default(),
            index: None,
            loaded_index,
            stats: None,
            annotation_sink: None,
        })
    }

    pub fn with_encode_options(mut self, encode_options: EncodeOptions) -> Self {
        self.encode_options = encode_options;
        self
    }

    /// Use `index` instead of the one loaded from `annotation_source`.
    pub fn with_index(mut self, index: &'a dyn OverlapIndex) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_stats(mut self, mode: AccumulateMode) -> Self {
        self.stats = Some(mode);
        self
    }

    /// Where annotation lines go; without a sink they are logged at debug
    /// level.
    pub fn with_annotation_sink(
        mut self,
        sink: &'a SynchronizedWriter<Box<dyn Write + Send>>,
    ) -> Self {
        self.annotation_sink = Some(sink);
        self
    }

    pub fn params(&self) -> &FilterParams {
        &self.params
    }

    fn index(&self) -> Option<&dyn OverlapIndex> {
        match (self.index, &self.loaded_index) {
            (Some(index), _) => Some(index),
            (None, Some(index)) => Some(index),
            (None, None) => None,
        }
    }
}

impl Processor for FilterProcessor<'_> {
    type State = FilterState;

    fn init(&self) -> FilterState {
        FilterState::default()
    }

    fn process(&self, state: &mut FilterState, group: Vec<Template>, buf: &mut Vec<u8>) -> Result<()> {
        for template in group {
            let filtered = filter(template, &self.params, self.index());
            for report in &filtered.annotations {
                if self.annotation_sink.is_some() {
                    state.annotations.extend_from_slice(report.to_string().as_bytes());
                    state.annotations.push(b'\n');
                } else {
                    debug!("{}", report);
                }
            }
            if let Some(mode) = self.stats {
                state.stats.add(&filtered.template, mode);
            }
            encode_into(buf, &filtered.template, &self.encode_options);
        }
        Ok(())
    }

    fn skip(&self, state: &mut FilterState) {
        state.stats.add_skipped(1);
    }

    fn end_chunk(&self, state: &mut FilterState, chunk_id: u64) -> Result<()> {
        if let Some(sink) = self.annotation_sink {
            sink.write_chunk(chunk_id, std::mem::take(&mut state.annotations))?;
        }
        Ok(())
    }
}

/// Worker state of [`StatsProcessor`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StatsState {
    pub all: Stats,
    pub best: Stats,
}

impl StatsState {
    pub fn combine(&mut self, other: &Self) {
        self.all.combine(&other.all);
        self.best.combine(&other.best);
    }
}

/// Fold the per-worker states of a stats run.
pub fn merge_stats_states(states: &[StatsState]) -> StatsState {
    StatsState {
        all: merge(states.iter().map(|s| &s.all)),
        best: merge(states.iter().map(|s| &s.best)),
    }
}

/// Accumulate statistics over every candidate and over the best one; writes
/// no output.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatsProcessor;

impl Processor for StatsProcessor {
    type State = StatsState;

    fn init(&self) -> StatsState {
        StatsState::default()
    }

    fn process(&self, state: &mut StatsState, group: Vec<Template>, _buf: &mut Vec<u8>) -> Result<()> {
        for template in &group {
            state.all.add(template, AccumulateMode::All);
            state.best.add(template, AccumulateMode::Best);
        }
        Ok(())
    }

    fn skip(&self, state: &mut StatsState) {
        state.all.add_skipped(1);
        state.best.add_skipped(1);
    }
}

/// Re-serialize templates; the templates of a record group are written one
/// after another, which interleaves lock-step streams.
#[derive(Debug, Default, Clone)]
pub struct ConvertProcessor {
    encode_options: EncodeOptions,
}

impl ConvertProcessor {
    pub fn new(encode_options: EncodeOptions) -> Self {
        Self { encode_options }
    }
}

impl Processor for ConvertProcessor {
    type State = ();

    fn init(&self) {}

    fn process(&self, _state: &mut (), group: Vec<Template>, buf: &mut Vec<u8>) -> Result<()> {
        for template in &group {
            encode_into(buf, template, &self.encode_options);
        }
        Ok(())
    }
}

/// Merge the templates of each record group into one.
#[derive(Debug, Default, Clone)]
pub struct MergeProcessor {
    encode_options: EncodeOptions,
}

impl MergeProcessor {
    pub fn new(encode_options: EncodeOptions) -> Self {
        Self { encode_options }
    }
}

impl Processor for MergeProcessor {
    type State = ();

    fn init(&self) {}

    fn process(&self, _state: &mut (), group: Vec<Template>, buf: &mut Vec<u8>) -> Result<()> {
        let merged = merge_templates(group)?;
        encode_into(buf, &merged, &self.encode_options);
        Ok(())
    }
}
