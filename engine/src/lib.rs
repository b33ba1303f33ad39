// chunkflow — Chunked array engine
//
// Library root. Plans are built lazily from `array::Context`, optimized by
// `optimize`, and run by `schedule::execute_plan` on an `executor`.

pub mod api;
pub mod array;
pub mod block;
pub mod blockwise;
pub mod cert;
pub mod chunks;
pub mod config;
pub mod dot;
pub mod dtype;
pub mod error;
pub mod executor;
pub mod func;
pub mod graph;
pub mod id;
pub mod index;
pub mod lexer;
pub mod memory;
pub mod ops;
pub mod optimize;
pub mod pipeline;
pub mod rechunk;
pub mod schedule;
pub mod script;
pub mod store;
pub mod subscripts;
