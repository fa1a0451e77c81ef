use winit::event::WindowEvent;

use super::ctx::FrameCtx;
use crate::context::Context;
use crate::error::RenderError;

/// Control directive returned by app callbacks.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AppControl {
    Continue,
    Exit,
}

/// Application contract driven by [`Runtime`](crate::window::Runtime).
pub trait App {
    /// Called for window events before the runtime handles them.
    fn on_window_event(&mut self, context: &mut Context, event: &WindowEvent) -> AppControl {
        let _ = (context, event);
        AppControl::Continue
    }

    /// Called once per redraw while the context is active.
    fn on_frame(&mut self, ctx: &mut FrameCtx<'_>) -> AppControl;

    /// Called when a frame or resize fails, or the context is found inactive.
    ///
    /// The default rebuilds the device on the same adapter and exits if that
    /// fails too.
    fn on_device_error(&mut self, context: &mut Context, error: &RenderError) -> AppControl {
        log::warn!("recovering from device error: {error}");
        match context.set_adapter(context.adapter()) {
            Ok(()) => AppControl::Continue,
            Err(e) => {
                log::error!("device recovery failed: {e}");
                AppControl::Exit
            }
        }
    }
}
