use thiserror::Error;

/// Error codes of the network stack that correspond to [`CacheError`] variants.
pub mod net {
    pub const OK: i32 = 0;
    pub const ERR_FAILED: i32 = -2;
    pub const ERR_CACHE_MISS: i32 = -400;
    pub const ERR_CACHE_CREATE_FAILURE: i32 = -405;
    pub const ERR_CACHE_RACE: i32 = -406;
    pub const ERR_CACHE_WRITE_FAILURE: i32 = -407;
}

/// An error that happens while coordinating access to cache entries.
///
/// Besides [`Failed`](Self::Failed) and [`Io`](Self::Io), which are propagated verbatim from the
/// backend, all of these are recoverable: the affected transaction is expected to restart its
/// request against the coordinator, or fall back to the network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The entry a transaction was working with became invalid underneath it.
    ///
    /// This happens when the entry was doomed, a writer failed, a validating transaction was
    /// bumped, or a queued backend operation lost its race against the in-flight one.
    #[error("cache race")]
    CacheRace,
    /// A create request was queued behind a successful open or create of the same key.
    ///
    /// Unlike [`CacheRace`](Self::CacheRace), the entry *does* exist and is in use by someone else.
    #[error("cache entry could not be created")]
    CreateFailure,
    /// The backend does not have an entry for the requested key.
    #[error("not found")]
    NotFound,
    /// The backend is not available, or a backend operation failed.
    #[error("backend operation failed")]
    Failed,
    /// Reading or writing entry data failed.
    ///
    /// The attached string contains the underlying error message.
    #[error("i/o error: {0}")]
    Io(String),
    /// An unexpected error in the coordinator itself.
    #[error("internal error")]
    InternalError,
}

impl From<std::io::Error> for CacheError {
    #[track_caller]
    fn from(err: std::io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    #[track_caller]
    pub(crate) fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        let location = std::panic::Location::caller();
        tracing::error!(error = dynerr, %location, "entry i/o failed");
        Self::Io(e.to_string())
    }

    /// Returns the network-stack error code for this error.
    pub fn net_error(&self) -> i32 {
        match self {
            CacheError::CacheRace => net::ERR_CACHE_RACE,
            CacheError::CreateFailure => net::ERR_CACHE_CREATE_FAILURE,
            CacheError::NotFound => net::ERR_CACHE_MISS,
            CacheError::Failed | CacheError::InternalError => net::ERR_FAILED,
            CacheError::Io(_) => net::ERR_CACHE_WRITE_FAILURE,
        }
    }

    /// A short name used to tag metrics.
    pub fn as_tag(&self) -> &'static str {
        match self {
            CacheError::CacheRace => "race",
            CacheError::CreateFailure => "create_failure",
            CacheError::NotFound => "not_found",
            CacheError::Failed => "failed",
            CacheError::Io(_) => "io",
            CacheError::InternalError => "internal",
        }
    }

    /// Whether the transaction should restart its request from the top.
    pub fn is_restartable(&self) -> bool {
        matches!(self, CacheError::CacheRace | CacheError::CreateFailure)
    }
}

/// The result of a coordinator or backend operation.
pub type CacheResult<T = ()> = Result<T, CacheError>;

/// Converts a result into the network-stack error code, with `0` meaning success.
pub fn net_error<T>(result: &CacheResult<T>) -> i32 {
    match result {
        Ok(_) => net::OK,
        Err(err) => err.net_error(),
    }
}
