//! Window + runtime loop.
//!
//! Owns the `winit` EventLoop and Window, and wires them to a [`Context`](crate::context::Context).

mod runtime;

pub use runtime::{ContextSettings, Runtime, RuntimeConfig};
