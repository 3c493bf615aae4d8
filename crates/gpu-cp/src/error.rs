use thiserror::Error;

use crate::query::QueryId;
use crate::winsys::WinsysError;

pub type Result<T> = std::result::Result<T, CpError>;

#[derive(Debug, Error)]
pub enum CpError {
    /// A batch, query or kernel buffer could not be allocated.
    #[error("out of memory: {0}")]
    OutOfMemory(#[source] WinsysError),

    /// A single operation references more memory than the aperture can map,
    /// even from an empty batch.
    #[error("operation needs {required} bytes of aperture but only {aperture} are available")]
    ApertureExceeded { required: u64, aperture: u64 },

    #[error("unknown query {0:?}")]
    UnknownQuery(QueryId),

    #[error("query {0:?} is still active")]
    QueryActive(QueryId),

    #[error("query {0:?} was never begun")]
    QueryNotActive(QueryId),
}
