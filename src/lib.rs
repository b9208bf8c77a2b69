//! Readable, writable and transform streams driven by per-stream tasks on one
//! owning scheduling context, plus a bridge that lets host work running on
//! any thread settle guest-visible promises.
//!
//! Every stream is built through a builder and spawned with the caller's
//! spawner, usually `tokio::task::spawn_local` inside a `LocalSet`.

pub mod abort;
pub mod bridge;
pub mod streams;

pub use abort::{AbortController, AbortSignal};
pub use bridge::{
    Completer, FutureBridge, GuestPromise, GuestValue, HostFuture, HostPullSource, Thenable,
    ThenFn,
};
pub use streams::*;
