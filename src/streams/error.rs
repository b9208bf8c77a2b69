use std::{error::Error, fmt, sync::Arc};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("Stream operation was canceled{}", reason_suffix(.0))]
    Canceled(Option<String>),
    #[error("Stream was aborted{}", reason_suffix(.0))]
    Aborted(Option<String>),
    #[error("Stream is closing")]
    Closing,
    #[error("Stream is closed")]
    Closed,
    #[error("Stream is locked to another reader or writer")]
    Locked,
    #[error("Reader was released while a read was pending")]
    Released,
    #[error("Stream task was dropped")]
    TaskDropped,
    #[error("TypeError: {0}")]
    Type(String),
    #[error("{0}")]
    Other(#[source] Arc<dyn Error + Send + Sync>),
}

fn reason_suffix(reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!(": {reason}"),
        None => String::new(),
    }
}

impl StreamError {
    /// Wrap any error type into `StreamError`
    pub fn other<E>(e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(e))
    }

    /// Wrap a boxed error
    pub fn other_boxed(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }

    /// True for errors produced by an abort signal or a writer abort.
    pub fn is_abort(&self) -> bool {
        matches!(self, StreamError::Aborted(_))
    }

    pub(crate) fn reason(&self) -> Option<String> {
        match self {
            StreamError::Canceled(reason) | StreamError::Aborted(reason) => reason.clone(),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug)]
struct SimpleError(String);

impl fmt::Display for SimpleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for SimpleError {}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        StreamError::Other(Arc::new(SimpleError(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::Other(Arc::new(SimpleError(s)))
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Other(Arc::new(e))
    }
}

impl From<Box<dyn Error + Send + Sync>> for StreamError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

/// Macro for users to add direct `From` implementations for their error types.
/// This allows using `?` directly without `.map_err(StreamError::other)`.
///
/// # Example
/// ```rust
/// use bridged_streams::{StreamError, impl_stream_error_from};
///
/// #[derive(Debug)]
/// struct ParseError;
/// impl std::fmt::Display for ParseError {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         f.write_str("parse error")
///     }
/// }
/// impl std::error::Error for ParseError {}
///
/// impl_stream_error_from!(ParseError);
///
/// fn example() -> Result<(), StreamError> {
///     Err::<(), _>(ParseError)?;
///     Ok(())
/// }
/// assert!(example().is_err());
/// ```
#[macro_export]
macro_rules! impl_stream_error_from {
    ($($error_type:ty),* $(,)?) => {
        $(
            impl From<$error_type> for $crate::streams::error::StreamError {
                fn from(e: $error_type) -> Self {
                    $crate::streams::error::StreamError::Other(std::sync::Arc::new(e))
                }
            }
        )*
    };
}
