//! In-memory model of alignment records: templates, their ends, candidate
//! maps and the mismatches inside them.

mod counters;
mod map;
mod mismatch;
mod template;

pub use counters::Counters;
pub use map::{mapq, Map, MapBlock, Strand};
pub use mismatch::Mismatch;
pub use template::{
    insert_size, strip_mate_suffix, Alignment, Combination, Layout, PairedEnd, Tag, Template,
};
