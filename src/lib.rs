//! Encodes graphs of values (numbers, strings, bitvectors, vectors, sets and
//! maps, possibly cyclic) into a single immutable buffer that can be read
//! back through offsets without parsing.

pub mod builder;
mod classify;
pub mod cycle;
pub mod encoding;
mod hash;
mod hash_table;
mod hashable;
mod layout;
pub mod options;
pub mod sink;
mod value;
pub mod view;

pub use builder::Builder;
pub use cycle::{mark_cycles, ContainerGraph, CycleMarks};
pub use encoding::{FormatVersion, Header, RawValue, Tag};
pub use options::Options;
pub use value::{Handle, PrimKind, Primitive};
pub use view::GraphView;
