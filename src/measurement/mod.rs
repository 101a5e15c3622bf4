//! Measurement planning: from operator parameters to a device command plan.
//!
//! - [`mode`]: the four modes, UI-level parameters and device-level configs
//! - [`sweep`]: point-count arithmetic and buffer capacity
//! - [`custom_list`]: custom sweep lists from free-form text
//! - [`filter`]: averaging filter selection
//! - [`command`]: typed commands and the ordered per-mode sequence
//! - [`parser`]: trace buffer decoding and persisted line format

pub mod command;
pub mod custom_list;
pub mod filter;
pub mod mode;
pub mod parser;
pub mod sweep;

pub use command::{Command, CommandBuilder, CommandPlan, Query};
pub use custom_list::{CustomListBuilder, LengthPolicy, ListKind};
pub use filter::{FilterConfig, FilterKind};
pub use mode::{MeasurementMode, ModeConfig, ModeParameterSet, ModeParameters, SourceSettings};
pub use parser::{parse_buffer, ParsedBuffer, Record};
pub use sweep::{SweepSpec, BUFFER_CAPACITY};
