//! Error types shared by every agent crate.
//!
//! Library code with a closed set of failure modes defines its own `snafu` enums. Everything that only needs to carry
//! an error upwards, with some context attached, uses [`GenericError`].
use std::fmt::Display;

/// An opaque, context-carrying error.
pub type GenericError = anyhow::Error;

/// Builds a [`GenericError`].
///
/// Accepts a string literal, a format string followed by its arguments, or an existing error value. When given an
/// error value, its source chain is preserved.
#[macro_export]
macro_rules! generic_error {
    ($msg:literal $(,)?) => { $crate::_anyhow!($msg) };
    ($err:expr $(,)?) => { $crate::_anyhow!($err) };
    ($fmt:expr, $($arg:tt)*) => { $crate::_anyhow!($fmt, $($arg)*) };
}

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

mod sealed {
    pub trait Sealed {}

    impl<T, E> Sealed for Result<T, E> {}
}

/// Attaches context to the error side of a `Result`, converting it into a [`GenericError`].
///
/// This mirrors `anyhow::Context` under different method names so that it can be imported alongside
/// `snafu::ResultExt` without the two colliding.
pub trait ErrorContext<T, E>: sealed::Sealed {
    /// Wraps the error with `context`.
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static;

    /// Wraps the error with the context produced by `f`, which is only called on the error path.
    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C;
}

impl<T, E> ErrorContext<T, E> for Result<T, E>
where
    Result<T, E>: anyhow::Context<T, E>,
{
    fn error_context<C>(self, context: C) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
    {
        anyhow::Context::context(self, context)
    }

    fn with_error_context<C, F>(self, f: F) -> Result<T, GenericError>
    where
        C: Display + Send + Sync + 'static,
        F: FnOnce() -> C,
    {
        anyhow::Context::with_context(self, f)
    }
}

/// Renders an error and its full source chain on a single line, separated by `: `.
///
/// Used wherever an error has to be stored as a plain string, such as in status snapshots.
pub fn error_chain_string(e: &GenericError) -> String {
    format!("{:#}", e)
}
