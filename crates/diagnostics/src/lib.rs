//! Log diagnostics for dynamic system installs: parses device log lines,
//! classifies failures, and assembles the final report.

mod classifier;
mod engine;
mod parser;
pub mod patterns;
mod source;
mod suggestions;

pub use classifier::{classify, detect_signal, LogSignal};
pub use engine::{
    parse_progress, DiagnosticEngine, EngineState, LogProgress, ReportContext, StreamEnd,
};
pub use parser::parse_line;
pub use source::{CapturedLog, CommandLog, FileLog, LogSource, LogStream};
pub use suggestions::{architecture_mismatch, generate_suggestions};
