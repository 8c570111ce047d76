pub mod annotate;
pub mod codec;
pub mod error;
pub mod filter;
pub mod io;
pub mod merge;
pub mod output;
pub mod pipeline;
pub mod qc;
pub mod rank;
pub mod reader;
pub mod record;

pub use codec::{decode, encode, encode_into, DecodeOptions, EncodeOptions, FileFormat};
pub use error::{GtError, ParseError};
pub use filter::{filter, FilterParams};
pub use output::{OutputOrder, SynchronizedWriter};
pub use pipeline::Pipeline;
pub use qc::{accumulate, merge, render_report, AccumulateMode, Stats};
pub use reader::{open_synchronized, open_synchronized_paths, SynchronizedReader};
pub use record::Template;
