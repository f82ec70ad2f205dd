//! Orchestration library behind the `puv` binary.
//!
//! Exposed as a library so integration tests can drive the full pipeline
//! against the mock transport.

pub mod assess;
pub mod bundle;
pub mod capacity;
pub mod cluster;
pub mod collect;
pub mod deploy;
pub mod pool;
pub mod progress;
pub mod report;
pub mod run;
