//! Error plumbing shared by the togather crates.
//!
//! The repository contract and the ingest/admin services use typed
//! snafu enums at their boundaries; [`BoxedError`] is the escape
//! hatch those enums wrap storage-layer failures in, and
//! [`FmtCompact`] renders any error chain on a single line for
//! structured log fields (`err = %e.fmt_compact()`).

use std::error::Error;
use std::fmt;

pub type BoxedError = Box<dyn Error + Send + Sync + 'static>;
pub type BoxedErrorResult<T> = std::result::Result<T, BoxedError>;

/// Renders an error and its source chain on a single line,
/// `outermost: cause: root`, for use as a tracing field.
pub struct CompactError<'e, E: ?Sized>(&'e E);

impl<E> fmt::Display for CompactError<'_, E>
where
    E: Error + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;

        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

pub trait FmtCompact {
    fn fmt_compact(&self) -> CompactError<'_, Self>;
}

impl<E> FmtCompact for E
where
    E: Error + ?Sized,
{
    fn fmt_compact(&self) -> CompactError<'_, Self> {
        CompactError(self)
    }
}
