//! Real-time CMYK halftone print simulation.
//!
//! [`kernel::shade_pixel`] is the per-pixel algorithm. [`gpu::GpuRenderer`]
//! runs the same algorithm as a WGSL fragment shader and
//! [`software::SoftwareRenderer`] rasterizes it on the CPU. A
//! [`session::RenderSession`] owns one of them together with the bound
//! source texture and the current parameter snapshot.

pub mod color;
pub mod composite;
pub mod dot;
pub mod error;
pub mod gpu;
pub mod kernel;
pub mod moire;
pub mod noise;
pub mod params;
pub mod prefilter;
pub mod session;
pub mod software;
pub mod target;
pub mod texture;
pub mod video;

pub use error::HalftoneError;
pub use params::HalftoneParameters;
pub use session::{RenderBackend, RenderSession, SessionState};
pub use target::{RenderTarget, RenderedFrame};
pub use texture::Texture;
