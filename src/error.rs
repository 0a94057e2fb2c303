//! Fatal error taxonomy for the trainer. Per-entry alignment failures are not
//! errors, they are accumulated into failure lists by the aligner and reported
//! at the end of the pass.
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LtsError {
    /// A data file (lexicon, tree, WFST, allowables) could not be parsed.
    #[error("malformed input: {0}")]
    MalformedInput(String),
    /// Letter filtering was requested without an allowables table.
    #[error("letter filtering requested but no allowables table provided")]
    MissingAllowables,
    /// An external collaborator binary could not be located.
    #[error("cannot find the {tool} executable, set ${env} or add it to PATH")]
    SubprocessMissing { tool: String, env: String },
    /// An external collaborator exited nonzero or produced no output.
    #[error("{tool} failed for {output}, see {log}")]
    SubprocessFailed {
        tool: String,
        output: PathBuf,
        log: PathBuf,
    },
    /// A packed rule field exceeds its bit width (21 bits for the value, 8 for
    /// the feature).
    #[error("packed rule field out of range: feat={feat} val={val}")]
    RuleOverflow { feat: u32, val: u32 },
    /// A tree condition names a positional feature we have no offset for.
    #[error("unknown feature in tree condition: {0}")]
    UnknownFeature(String),
}
