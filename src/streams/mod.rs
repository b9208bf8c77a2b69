pub mod error;
pub mod pipe;
pub mod readable;
pub(crate) mod state;
pub mod tee;
pub mod transform;
pub mod writable;

// Re-export main types
pub use error::*;
pub use pipe::*;
pub use readable::*;
pub use state::{ReadableState, WritableState};
pub use tee::*;
pub use transform::*;
pub use writable::*;

pub type StreamResult<T> = Result<T, StreamError>;
