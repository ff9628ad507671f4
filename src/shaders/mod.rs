// SPDX-License-Identifier: GPL-3.0-only
//! WGSL programs used by the preview scenes
//!
//! Sources live next to this module and are embedded at build time.
//! [`validate`] runs them through naga the way the device does before
//! building a pipeline.

/// Source and interface of a shader program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderProgramSource {
    pub name: &'static str,
    /// WGSL module holding both stages
    pub source: &'static str,
    pub vertex_entry: &'static str,
    pub fragment_entry: &'static str,
    /// Which texture target the fragment stage expects to be bound
    pub sampler: SamplerKind,
}

const QUAD: &str = include_str!("quad.wgsl");

/// Full-window quad sampling an external (camera) image
pub const QUAD_EXTERNAL: ShaderProgramSource = ShaderProgramSource {
    name: "quad_external",
    source: QUAD,
    vertex_entry: "vs_main",
    fragment_entry: "fs_main",
    sampler: SamplerKind::External,
};

/// Full-window quad sampling a regular 2D texture
pub const QUAD_TEXTURE_2D: ShaderProgramSource = ShaderProgramSource {
    name: "quad_2d",
    source: QUAD,
    vertex_entry: "vs_main",
    fragment_entry: "fs_main",
    sampler: SamplerKind::Texture2D,
};

/// Overlay rectangle outlines with per-vertex colour
pub const OVERLAY_LINE: ShaderProgramSource = ShaderProgramSource {
    name: "overlay_line",
    source: include_str!("overlay_line.wgsl"),
    vertex_entry: "vs_main",
    fragment_entry: "fs_main",
    sampler: SamplerKind::None,
};

/// Two triangles covering NDC space
pub const QUAD_VERTICES: [[f32; 2]; 6] = [
    [-1.0, -1.0],
    [1.0, 1.0],
    [1.0, -1.0],
    [-1.0, 1.0],
    [1.0, 1.0],
    [-1.0, -1.0],
];

/// How a program's fragment stage samples its texture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    /// No sampler: colour comes from the vertex stage
    None,
    External,
    Texture2D,
}

/// Parse and validate a program, then check its entry points and bindings
pub fn validate(program: &ShaderProgramSource) -> Result<(), String> {
    let module = naga::front::wgsl::parse_str(program.source)
        .map_err(|e| e.emit_to_string(program.source))?;

    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| format!("{:?}", e.into_inner()))?;

    for (entry, stage) in [
        (program.vertex_entry, naga::ShaderStage::Vertex),
        (program.fragment_entry, naga::ShaderStage::Fragment),
    ] {
        if !module
            .entry_points
            .iter()
            .any(|ep| ep.name == entry && ep.stage == stage)
        {
            return Err(format!("no {:?} entry point '{}'", stage, entry));
        }
    }

    let samples = module
        .global_variables
        .iter()
        .any(|(_, var)| matches!(module.types[var.ty].inner, naga::TypeInner::Image { .. }));
    match (program.sampler, samples) {
        (SamplerKind::None, true) => Err("module declares a texture but the program has no sampler".into()),
        (SamplerKind::External | SamplerKind::Texture2D, false) => {
            Err("program samples a texture the module does not declare".into())
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_programs_validate() {
        for program in [QUAD_EXTERNAL, QUAD_TEXTURE_2D, OVERLAY_LINE] {
            validate(&program).unwrap_or_else(|e| panic!("{}: {}", program.name, e));
        }
    }

    #[test]
    fn test_parse_errors_are_reported() {
        let program = ShaderProgramSource {
            source: "fn vs_main( {",
            ..QUAD_TEXTURE_2D
        };
        assert!(validate(&program).is_err());
    }

    #[test]
    fn test_missing_entry_point() {
        let program = ShaderProgramSource {
            fragment_entry: "fs_overlay",
            ..OVERLAY_LINE
        };
        assert!(validate(&program).unwrap_err().contains("fs_overlay"));
    }

    #[test]
    fn test_sampler_must_match_bindings() {
        let program = ShaderProgramSource {
            sampler: SamplerKind::Texture2D,
            ..OVERLAY_LINE
        };
        assert!(validate(&program).is_err());

        let program = ShaderProgramSource {
            sampler: SamplerKind::None,
            ..QUAD_EXTERNAL
        };
        assert!(validate(&program).is_err());
    }
}
