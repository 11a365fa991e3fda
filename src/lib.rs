//! Local development file server with request introspection and
//! network-fault injection.
//!
//! Every request runs through a fixed pipeline: the observer logs it, the
//! delay and abort injectors simulate a bad network, the static stage serves
//! files and directory listings, and the fallback answers whatever is left.
//! The library can be embedded; the `peekserve` binary wraps it in a CLI.

pub mod abort;
pub mod config;
pub mod delay;
pub mod error;
pub mod fallback;
pub mod logging;
pub mod net;
pub mod observer;
pub mod pipeline;
pub mod server;
pub mod static_files;

pub use config::{OptimizeFor, PipelineConfig, RawOptions};
pub use error::{Aborted, ServeError};
pub use logging::{LogSink, MemorySink, TracingSink};
pub use pipeline::{Flow, Outcome, Pipeline, Stage};
