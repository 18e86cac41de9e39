// Error taxonomy for the renderer backend
//
// Setup and fatal runtime failures are RendererError. Shader compilation
// failures are a separate type because they come from the compiler, not the
// device, and carry a diagnostic string worth showing to the user.
// Suboptimal/out-of-date presentation statuses are NOT errors; they are
// returned as values from acquire/present (see sync.rs).

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RendererError {
    /// No physical device has a queue family with graphics support,
    /// presentation support, and a large enough push-constant budget.
    #[error("no suitable device found")]
    NoDeviceFound,

    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    /// The graphics queue family cannot present to the created surface.
    #[error("surface not supported")]
    SurfaceNotSupported,

    /// No device memory type satisfies the requested property flags.
    #[error("no suitable memory type")]
    NoMemoryType,

    #[error("vulkan call failed: {0}")]
    Vk(#[from] vk::Result),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ShaderError {
    #[error("failed to read shader {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("shader compilation failed:\n{diagnostic}")]
    Compile { diagnostic: String },

    #[error("shader module creation failed: {0}")]
    Module(vk::Result),
}

impl ShaderError {
    /// Compiler diagnostic text, if this failure produced one.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            ShaderError::Compile { diagnostic } => Some(diagnostic),
            _ => None,
        }
    }
}

/// Errors from assembling a complete pipeline state: either a shader failed
/// to compile or a device object failed to build.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Shader(#[from] ShaderError),

    #[error(transparent)]
    Renderer(#[from] RendererError),
}

/// Statuses that signal "schedule a resize" rather than a failure.
pub fn is_transient(result: vk::Result) -> bool {
    matches!(
        result,
        vk::Result::SUBOPTIMAL_KHR | vk::Result::ERROR_OUT_OF_DATE_KHR
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suboptimal_and_out_of_date_are_transient() {
        assert!(is_transient(vk::Result::SUBOPTIMAL_KHR));
        assert!(is_transient(vk::Result::ERROR_OUT_OF_DATE_KHR));
    }

    #[test]
    fn real_failures_are_not_transient() {
        assert!(!is_transient(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        assert!(!is_transient(vk::Result::ERROR_DEVICE_LOST));
        assert!(!is_transient(vk::Result::ERROR_SURFACE_LOST_KHR));
    }

    #[test]
    fn shader_compile_error_exposes_diagnostic() {
        let err = ShaderError::Compile {
            diagnostic: "scene.frag:12: error: 'foo' : undeclared identifier".into(),
        };
        assert!(err.diagnostic().unwrap().contains("undeclared identifier"));

        let err = ShaderError::Module(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
        assert!(err.diagnostic().is_none());
    }
}
