// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Performance: Zero-cost abstractions, explicit control

pub mod device;
pub mod error;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod sync;

pub use device::DeviceContext;
pub use error::{PipelineError, RendererError, ShaderError};
pub use pipeline::PipelineState;
pub use shader::ShaderStage;
pub use surface::Surface;
pub use sync::{Acquired, FrameSync, PresentStatus};
