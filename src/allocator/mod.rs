//! Storage path allocation.
//!
//! - [`SequentialAllocator`]: one artifact per sequence number, partitioned
//!   into fixed-size folders
//! - [`BatchAllocator`]: many small records grouped into bounded batch files
//!
//! Both own their counter records. Nothing else writes them.

pub mod batch;
pub mod sequential;

pub use batch::{batch_key, BatchAllocator, BatchAppend, BatchWrite, DEFAULT_BATCH_CAPACITY};
pub use sequential::{
    folder_and_file, format_key, format_path, AllocatedPath, SequentialAllocator,
    DEFAULT_FOLDER_CAPACITY,
};
