//! boxed error type used by every fallible path in the crate.
//!
//! Needs Send + Sync so Results can move between the network thread and
//! the control thread.
pub type BoxError = std::boxed::Box<
    dyn std::error::Error // must implement Error to satisfy ?
        + std::marker::Send // needed for threads
        + std::marker::Sync, // needed for threads
>;
