//! Sidecar control-file persistence and positional file writing.
//!
//! This crate owns the two pieces of on-disk state a download touches: the
//! output file itself ([`writer`]) and the JSON sidecar that lets an
//! interrupted download resume ([`control`]).

pub mod control;
pub mod error;
pub mod writer;

pub use control::{ControlRecord, ControlStore, SegmentRecord, SegmentStatus, CONTROL_VERSION};
pub use error::StorageError;
pub use writer::{parse_segment_size, probe, Allocation, FileStatus, FileWriter};
