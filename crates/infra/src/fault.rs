//! Catch-and-convert boundary around handler code.
//!
//! Handlers are third-party-facing and may panic on malformed vendor data.
//! Every handler invocation runs through [`guard`] so a panic ends up on the
//! ordinary failure path (queue row failed, quota released) instead of taking
//! down a worker thread.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use taskforge_core::{TaskError, TaskResult};

/// Run `f`, turning a panic into [`TaskError::HandlerPanic`].
pub fn guard<T>(f: impl FnOnce() -> TaskResult<T>) -> TaskResult<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(TaskError::HandlerPanic(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
