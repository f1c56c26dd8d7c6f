//! type created so that errors can cross thread boundaries.
//!
//! The `run` entry points for the server and client spawn threads and hand
//! errors back through them, so the boxed error must be Send + Sync.
pub type BoxError = std::boxed::Box<
    dyn std::error::Error // must implement Error to satisfy ?
        + std::marker::Send // needed for threads
        + std::marker::Sync, // needed for threads
>;
