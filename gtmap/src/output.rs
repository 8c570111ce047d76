//! Shared output sink for worker buffers.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::warn;

use crate::error::Result;

/// Order in which worker buffers reach the sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputOrder {
    /// Chunks are written in chunk id order, whatever order workers finish in.
    #[default]
    Sorted,
    /// Chunks are written as soon as they arrive.
    Unsorted,
}

/// Releases items in sequence order; slot `i` holds sequence `next_seq + i`.
#[derive(Debug)]
struct ReorderBuffer<T> {
    slots: VecDeque<Option<T>>,
    next_seq: u64,
    count: usize,
}

impl<T> ReorderBuffer<T> {
    fn new() -> Self {
        Self {
            slots: VecDeque::new(),
            next_seq: 0,
            count: 0,
        }
    }

    fn insert(&mut self, seq: u64, item: T) {
        debug_assert!(seq >= self.next_seq, "sequence {seq} already released");
        let index = (seq - self.next_seq) as usize;
        while self.slots.len() <= index {
            self.slots.push_back(None);
        }
        debug_assert!(self.slots[index].is_none(), "duplicate sequence {seq}");
        self.slots[index] = Some(item);
        self.count += 1;
    }

    fn try_pop_next(&mut self) -> Option<T> {
        match self.slots.front_mut().and_then(Option::take) {
            Some(item) => {
                self.slots.pop_front();
                self.next_seq += 1;
                self.count -= 1;
                Some(item)
            }
            None => None,
        }
    }

    /// Remaining items in sequence order, skipping gaps.
    fn drain_all(&mut self) -> impl Iterator<Item = (u64, T)> + '_ {
        let base = self.next_seq;
        self.count = 0;
        self.next_seq += self.slots.len() as u64;
        self.slots
            .drain(..)
            .enumerate()
            .filter_map(move |(i, item)| item.map(|it| (base + i as u64, it)))
    }

    fn len(&self) -> usize {
        self.count
    }
}

struct WriterState<W> {
    sink: W,
    pending: ReorderBuffer<Vec<u8>>,
    bytes_written: u64,
}

/// Lock-guarded sink that workers hand their encoded chunks to.
pub struct SynchronizedWriter<W: Write> {
    state: Mutex<WriterState<W>>,
    order: OutputOrder,
}

impl<W: Write> SynchronizedWriter<W> {
    pub fn new(sink: W, order: OutputOrder) -> Self {
        Self {
            state: Mutex::new(WriterState {
                sink,
                pending: ReorderBuffer::new(),
                bytes_written: 0,
            }),
            order,
        }
    }

    pub fn sorted(sink: W) -> Self {
        Self::new(sink, OutputOrder::Sorted)
    }

    pub fn unsorted(sink: W) -> Self {
        Self::new(sink, OutputOrder::Unsorted)
    }

    pub fn order(&self) -> OutputOrder {
        self.order
    }

    fn lock(&self) -> MutexGuard<'_, WriterState<W>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand over the buffer produced for chunk `id`. Every chunk id must be
    /// written exactly once, empty buffers included, or sorted output stalls
    /// until [`SynchronizedWriter::finish`].
    pub fn write_chunk(&self, id: u64, buf: Vec<u8>) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        match self.order {
            OutputOrder::Unsorted => {
                state.sink.write_all(&buf)?;
                state.bytes_written += buf.len() as u64;
            }
            OutputOrder::Sorted => {
                state.pending.insert(id, buf);
                while let Some(buf) = state.pending.try_pop_next() {
                    state.sink.write_all(&buf)?;
                    state.bytes_written += buf.len() as u64;
                }
            }
        }
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.lock().bytes_written
    }

    /// Flush buffered chunks and return the sink. Chunks still waiting on a
    /// missing predecessor (after an aborted run) are written in id order.
    pub fn finish(self) -> Result<W> {
        let mut state = self.state.into_inner().unwrap_or_else(PoisonError::into_inner);
        if state.pending.len() > 0 {
            warn!(
                "{} output chunks written after a gap in the chunk sequence",
                state.pending.len()
            );
        }
        let mut tail = Vec::new();
        for (_, buf) in state.pending.drain_all() {
            tail.push(buf);
        }
        for buf in tail {
            state.sink.write_all(&buf)?;
            state.bytes_written += buf.len() as u64;
        }
        state.sink.flush()?;
        Ok(state.sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reorder_buffer() {
        let mut buffer = ReorderBuffer::new();
        buffer.insert(2, "c");
        buffer.insert(0, "a");
        assert_eq!(buffer.try_pop_next(), Some("a"));
        assert_eq!(buffer.try_pop_next(), None);
        buffer.insert(1, "b");
        assert_eq!(buffer.try_pop_next(), Some("b"));
        assert_eq!(buffer.try_pop_next(), Some("c"));
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn test_sorted_output() {
        let writer = SynchronizedWriter::sorted(Vec::new());
        for id in [3u64, 1, 0, 2] {
            writer.write_chunk(id, format!("{id}\n").into_bytes()).unwrap();
        }
        assert_eq!(writer.bytes_written(), 8);
        assert_eq!(writer.finish().unwrap(), b"0\n1\n2\n3\n");
    }

    #[test]
    fn test_unsorted_output() {
        let writer = SynchronizedWriter::unsorted(Vec::new());
        for id in [2u64, 0, 1] {
            writer.write_chunk(id, format!("{id}\n").into_bytes()).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), b"2\n0\n1\n");
    }

    #[test]
    fn test_gap_flushed_on_finish() {
        let writer = SynchronizedWriter::sorted(Vec::new());
        writer.write_chunk(0, b"a".to_vec()).unwrap();
        writer.write_chunk(3, b"d".to_vec()).unwrap();
        writer.write_chunk(2, b"c".to_vec()).unwrap();
        assert_eq!(writer.bytes_written(), 1);
        assert_eq!(writer.finish().unwrap(), b"acd");
    }

    #[test]
    fn test_concurrent_sorted() {
        let writer = SynchronizedWriter::sorted(Vec::new());
        std::thread::scope(|s| {
            for t in 0..4u64 {
                let writer = &writer;
                s.spawn(move || {
                    for id in (t as usize..64).step_by(4).rev().map(|id| id as u64) {
                        writer.write_chunk(id, vec![id as u8]).unwrap();
                    }
                });
            }
        });
        assert_eq!(writer.finish().unwrap(), (0..64u8).collect::<Vec<_>>());
    }
}
