use thiserror::Error;

/// Recoverable errors: bad configuration and trace loading. Protocol
/// violations inside the coherence engine are not represented here; they
/// indicate a broken invariant and abort with context instead.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("trace i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("trace parse error at line {line}: {msg}")]
    Trace { line: usize, msg: String },
    #[error("unknown protocol '{0}' (expected MESI or MSI)")]
    Protocol(String),
}
