use std::fmt;
use std::sync::Arc;

use crate::hal::RawTexture;
use crate::memory::Allocation;

/// Pixel formats usable for presentable surfaces.
///
/// Every format is 4 bytes per texel; the reference backend stores one packed
/// `u32` per pixel with the first channel in the lowest byte.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Format {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
}

impl Format {
    pub fn bytes_per_pixel(self) -> u32 {
        4
    }

    pub fn is_srgb(self) -> bool {
        matches!(self, Format::Rgba8UnormSrgb | Format::Bgra8UnormSrgb)
    }

    pub fn to_wgpu(self) -> wgpu::TextureFormat {
        match self {
            Format::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            Format::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            Format::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
            Format::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
        }
    }

    pub fn from_wgpu(format: wgpu::TextureFormat) -> Option<Self> {
        match format {
            wgpu::TextureFormat::Rgba8Unorm => Some(Format::Rgba8Unorm),
            wgpu::TextureFormat::Rgba8UnormSrgb => Some(Format::Rgba8UnormSrgb),
            wgpu::TextureFormat::Bgra8Unorm => Some(Format::Bgra8Unorm),
            wgpu::TextureFormat::Bgra8UnormSrgb => Some(Format::Bgra8UnormSrgb),
            _ => None,
        }
    }

    /// Encodes a linear RGBA colour as one texel of this format.
    pub fn pack(self, colour: [f32; 4]) -> u32 {
        let encode = |c: f32, srgb: bool| {
            let c = c.clamp(0.0, 1.0);
            let c = if srgb { linear_to_srgb(c) } else { c };
            (c * 255.0).round() as u32
        };

        let srgb = self.is_srgb();
        let [r, g, b, a] = colour;
        let (r, g, b) = (encode(r, srgb), encode(g, srgb), encode(b, srgb));
        let a = encode(a, false);

        match self {
            Format::Rgba8Unorm | Format::Rgba8UnormSrgb => r | (g << 8) | (b << 16) | (a << 24),
            Format::Bgra8Unorm | Format::Bgra8UnormSrgb => b | (g << 8) | (r << 16) | (a << 24),
        }
    }
}

fn linear_to_srgb(c: f32) -> f32 {
    if c <= 0.003_130_8 {
        c * 12.92
    } else {
        1.055 * c.powf(1.0 / 2.4) - 0.055
    }
}

/// Native resource states a surface moves between.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ResourceState {
    Common,
    Present,
    RenderTarget,
    CopySource,
    CopyDest,
    ShaderResource,
}

bitflags::bitflags! {
    /// How a texture may be used once created.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct TextureUsage: u32 {
        const RENDER_TARGET   = 1 << 0;
        const COPY_SRC        = 1 << 1;
        const COPY_DST        = 1 << 2;
        const SHADER_RESOURCE = 1 << 3;
    }
}

/// Creation parameters for a 2D texture.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub usage: TextureUsage,
    pub initial_state: ResourceState,
    pub clear_colour: Option<[f32; 4]>,
}

impl TextureDesc {
    /// A presentable render target, created in the `Present` state.
    pub fn render_target(width: u32, height: u32, format: Format) -> Self {
        Self {
            label: None,
            width,
            height,
            format,
            usage: TextureUsage::RENDER_TARGET | TextureUsage::COPY_SRC,
            initial_state: ResourceState::Present,
            clear_colour: None,
        }
    }

    pub fn with_label(mut self, label: Option<String>) -> Self {
        self.label = label;
        self
    }

    pub fn with_clear_colour(mut self, colour: [f32; 4]) -> Self {
        self.clear_colour = Some(colour);
        self
    }

    pub fn byte_size(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(self.format.bytes_per_pixel())
    }
}

/// Shared handle to a device texture.
///
/// Cloning is cheap. The handle remembers the epoch of the device that created
/// it so command submission can reject resources from a previous device.
#[derive(Clone)]
pub struct Surface {
    raw: Arc<dyn RawTexture>,
    desc: Arc<TextureDesc>,
    epoch: u64,
    _allocation: Option<Arc<Allocation>>,
}

impl Surface {
    pub(crate) fn new(
        raw: Arc<dyn RawTexture>,
        desc: TextureDesc,
        epoch: u64,
        allocation: Option<Allocation>,
    ) -> Self {
        Self {
            raw,
            desc: Arc::new(desc),
            epoch,
            _allocation: allocation.map(Arc::new),
        }
    }

    pub fn desc(&self) -> &TextureDesc {
        &self.desc
    }

    pub fn width(&self) -> u32 {
        self.desc.width
    }

    pub fn height(&self) -> u32 {
        self.desc.height
    }

    pub fn format(&self) -> Format {
        self.desc.format
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn name(&self) -> &str {
        self.desc.label.as_deref().unwrap_or("<unnamed surface>")
    }

    /// State tracked by the backend, if the backend tracks states at all.
    pub fn tracked_state(&self) -> Option<ResourceState> {
        self.raw.tracked_state()
    }

    pub(crate) fn raw(&self) -> &Arc<dyn RawTexture> {
        &self.raw
    }

    /// Returns true if both handles refer to the same native texture.
    pub fn same_resource(&self, other: &Surface) -> bool {
        Arc::ptr_eq(&self.raw, &other.raw)
    }
}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("name", &self.name())
            .field("width", &self.desc.width)
            .field("height", &self.desc.height)
            .field("format", &self.desc.format)
            .field("epoch", &self.epoch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_rgba_places_red_in_low_byte() {
        assert_eq!(Format::Rgba8Unorm.pack([0.0, 0.2, 0.4, 1.0]), 0xff66_3300);
    }

    #[test]
    fn pack_bgra_swaps_red_and_blue() {
        assert_eq!(Format::Bgra8Unorm.pack([1.0, 0.0, 0.0, 1.0]), 0xffff_0000);
        assert_eq!(Format::Rgba8Unorm.pack([1.0, 0.0, 0.0, 1.0]), 0xff00_00ff);
    }

    #[test]
    fn pack_srgb_encodes_midtones() {
        // linear 0.5 encodes to ~0.735 in sRGB.
        let texel = Format::Rgba8UnormSrgb.pack([0.5, 0.5, 0.5, 0.5]);
        assert_eq!(texel & 0xff, 188);
        assert_eq!(texel >> 24, 128);
    }

    #[test]
    fn pack_clamps_out_of_range() {
        assert_eq!(Format::Rgba8Unorm.pack([2.0, -1.0, 0.0, 1.0]), 0xff00_00ff);
    }

    #[test]
    fn wgpu_format_round_trips_for_supported_formats() {
        for format in [
            Format::Rgba8Unorm,
            Format::Rgba8UnormSrgb,
            Format::Bgra8Unorm,
            Format::Bgra8UnormSrgb,
        ] {
            assert_eq!(Format::from_wgpu(format.to_wgpu()), Some(format));
        }
        assert_eq!(Format::from_wgpu(wgpu::TextureFormat::R8Unorm), None);
    }
}
