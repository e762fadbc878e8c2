use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// The requested ledger entry does not exist (`entryNotFound`). For a
    /// previously bound channel this is terminal: the channel was closed
    /// out from under us.
    #[error("entryNotFound: no such ledger entry")]
    EntryNotFound,
    #[error("ledger request timed out")]
    Timeout,
    /// A `tem`-class result or other unretriable rejection.
    #[error("transaction failed terminally: {0}")]
    Terminal(String),
    #[error("ledger rpc error: {0}")]
    Rpc(String),
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Timeout | LedgerError::Rpc(_))
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("transaction failed terminally: {0}")]
    Terminal(String),
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: LedgerError },
}
