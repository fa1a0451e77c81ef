use winit::window::Window;

use crate::commands::CommandList;
use crate::context::Context;
use crate::descriptor::HostDescriptor;
use crate::error::RenderResult;

/// Per-frame context passed to `core::App::on_frame`.
pub struct FrameCtx<'a> {
    pub window: &'a Window,
    pub context: &'a mut Context,
    /// Number of frames the runtime has driven so far.
    pub frame: u64,
}

impl FrameCtx<'_> {
    /// Opens a frame, lets `draw` record after the clear, then submits and
    /// presents.
    ///
    /// `draw` receives the command list and the current back buffer's render
    /// target view.
    pub fn render<F>(&mut self, draw: F) -> RenderResult<()>
    where
        F: FnOnce(&mut CommandList<'_>, HostDescriptor),
    {
        self.context.begin()?;
        {
            let target = self.context.render_target()?;
            let mut list = self.context.command_list()?;
            draw(&mut list, target);
        }
        self.context.end()
    }

    /// Presents a frame containing only the clear.
    pub fn present(&mut self) -> RenderResult<()> {
        self.context.present()
    }
}
