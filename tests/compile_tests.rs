/// Compile-time checks for the thread-safety split between host and guest types.
///
/// Host-facing handles must cross threads; errors must be shareable so one
/// error value can settle many pending requests. These tests only need to
/// compile.
use bridged_streams::{Completer, HostFuture, StreamError, StreamPipeOptions};

fn assert_send<T: Send>() {}

fn assert_sync<T: Sync>() {}

fn assert_shared_error<E: std::error::Error + Clone + Send + Sync + 'static>() {}

#[test]
fn completer_is_send_and_sync() {
    assert_send::<Completer<String>>();
    assert_sync::<Completer<String>>();
    assert_send::<Completer<Option<Vec<u8>>>>();
}

#[test]
fn host_future_is_send() {
    assert_send::<HostFuture<u64>>();
}

#[test]
fn stream_error_is_a_shared_std_error() {
    assert_shared_error::<StreamError>();
}

#[test]
fn pipe_options_default_to_full_propagation() {
    let options = StreamPipeOptions::default();
    assert!(!options.prevent_close);
    assert!(!options.prevent_abort);
    assert!(!options.prevent_cancel);
    assert!(options.signal.is_none());
}
