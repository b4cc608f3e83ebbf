//! Errors raised while running or analyzing a campaign.

use thiserror::Error;

/// Conditions that stop a campaign (or an offline analysis).
///
/// Everything here is fatal: the run loop stops at the point where the
/// condition is detected and no partially-filled log is handed out.
/// Zero-steps and the expected protection fault at the start of each run are
/// *not* errors and never show up here.
#[derive(Error, Debug)]
pub enum CampaignError {
    /// The handler tried to write past the end of the measurement log.
    #[error("measurement log is full ({capacity} records); unexpected number \
        of zero-steps, try adjusting the timer interval or the zero-step \
        tolerance")]
    LogFull { capacity: usize },

    /// The protected domain crossed into more pages than were provisioned.
    #[error("page pool exhausted after {pages} tracked pages; the measured \
        code touches more pages than expected")]
    PoolExhausted { pages: usize },

    /// A campaign buffer could not be allocated up front.
    #[error("couldn't allocate {what} ({len} entries)")]
    Alloc { what: &'static str, len: usize },

    /// The fault handler ran too many times during a single run.
    #[error("caught {faults} protection faults in run {run}; execution is \
        not being restored on the faulting page")]
    FaultStorm { run: usize, faults: usize },

    /// The protected domain doesn't export the requested symbol.
    #[error("symbol '{0}' not found in the protected domain")]
    UnknownSymbol(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// The protected domain (or the remapping collaborator) reported an error.
    #[error("protected domain: {0}")]
    Domain(String),

    #[error("couldn't parse line {line}: {msg}")]
    Parse { line: usize, msg: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CampaignError>;
