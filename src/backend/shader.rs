// Shader compilation and module creation
//
// Shaders are kept as GLSL source on disk and compiled to SPIR-V at runtime
// so the pipeline can be rebuilt when a source file changes. Compilation
// failures carry the compiler's diagnostic text; see error::ShaderError.

use super::device::DeviceContext;
use super::error::ShaderError;
use ash::vk;
use shaderc::{IncludeType, ResolvedInclude};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    fn kind(self) -> shaderc::ShaderKind {
        match self {
            ShaderStage::Vertex => shaderc::ShaderKind::Vertex,
            ShaderStage::Fragment => shaderc::ShaderKind::Fragment,
        }
    }
}

/// Compile the GLSL source at `path` and create a shader module from it.
pub fn create_shader(
    ctx: &DeviceContext,
    path: &Path,
    stage: ShaderStage,
) -> Result<vk::ShaderModule, ShaderError> {
    let code = compile(path, stage)?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
    let module = unsafe { ctx.device.create_shader_module(&create_info, None) }
        .map_err(ShaderError::Module)?;

    Ok(module)
}

fn compile(path: &Path, stage: ShaderStage) -> Result<Vec<u32>, ShaderError> {
    let source = std::fs::read_to_string(path).map_err(|source| ShaderError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let compiler = shaderc::Compiler::new().ok_or_else(|| ShaderError::Compile {
        diagnostic: "shaderc compiler unavailable".into(),
    })?;
    let mut options = shaderc::CompileOptions::new().ok_or_else(|| ShaderError::Compile {
        diagnostic: "shaderc compile options unavailable".into(),
    })?;
    options.set_optimization_level(shaderc::OptimizationLevel::Size);
    options.set_include_callback(|requested, include_type, requesting, _depth| {
        let resolved = resolve_include(requested, include_type, requesting);
        let content = std::fs::read_to_string(&resolved)
            .map_err(|e| format!("failed to read include {}: {e}", resolved.display()))?;
        Ok(ResolvedInclude {
            resolved_name: resolved.to_string_lossy().into_owned(),
            content,
        })
    });

    let artifact = compiler
        .compile_into_spirv(
            &source,
            stage.kind(),
            &path.to_string_lossy(),
            "main",
            Some(&options),
        )
        .map_err(|err| ShaderError::Compile {
            diagnostic: match err {
                shaderc::Error::CompilationError(_, diagnostic) => diagnostic,
                other => other.to_string(),
            },
        })?;

    Ok(artifact.as_binary().to_vec())
}

/// Relative includes resolve against the including file's directory;
/// standard (`<...>`) includes are taken as given.
fn resolve_include(requested: &str, include_type: IncludeType, requesting: &str) -> PathBuf {
    match include_type {
        IncludeType::Relative => {
            let parent = Path::new(requesting).parent().unwrap_or(Path::new(""));
            parent.join(requested)
        }
        IncludeType::Standard => PathBuf::from(requested),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_include_resolves_against_including_file() {
        let resolved =
            resolve_include("common.glsl", IncludeType::Relative, "shaders/scene.frag");
        assert_eq!(resolved, PathBuf::from("shaders/common.glsl"));
    }

    #[test]
    fn standard_include_is_taken_verbatim() {
        let resolved = resolve_include("lib/noise.glsl", IncludeType::Standard, "whatever.frag");
        assert_eq!(resolved, PathBuf::from("lib/noise.glsl"));
    }
}
