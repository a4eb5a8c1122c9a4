//! Record storage.

pub mod storage;

pub use storage::{CsvRecorder, MemoryRecorder, Recorder};
