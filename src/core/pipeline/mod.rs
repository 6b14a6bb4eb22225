//! Transfer pipeline: splitting outgoing files and rebuilding incoming ones.
//!
//! - `chunk`: the chunk unit, size arithmetic and the per-file accumulator
//! - `chunker`: streams a byte source as indexed chunks with progress
//! - `assembler`: turns a complete chunk set back into a file

pub mod assembler;
pub mod chunk;
pub mod chunker;
