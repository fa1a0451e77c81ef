//! Contracts between the window runtime and applications.
//!
//! The runtime owns the event loop, the window and the [`Context`](crate::context::Context);
//! applications only see it through these callbacks.

mod app;
mod ctx;

pub use app::{App, AppControl};
pub use ctx::FrameCtx;
