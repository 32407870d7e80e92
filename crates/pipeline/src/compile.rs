//! GLSL sources for the display filter programs.
//!
//! All variants share one vertex shader and one uniform block so a kernel
//! change is a buffer write, never a recompile. The block layout must match
//! `FilterUniforms` in `gpu/hardware.rs`.

use crate::filter::FilterVariant;

/// Uniform block and bindings shared by every filter variant.
const HEADER: &str = r"#version 450
layout(location = 0) in vec2 v_uv;
layout(location = 0) out vec4 outColor;

layout(std140, set = 0, binding = 0) uniform FilterParams {
    mat4 u_tex_matrix;
    vec4 u_kernel[3];
    vec4 u_tex_offset[9];
    vec4 u_color_adjust;
} params;

layout(set = 0, binding = 1) uniform texture2D camera_texture;
layout(set = 0, binding = 2) uniform sampler camera_sampler;

vec2 camera_coord() {
    vec2 uv = vec2(v_uv.x, 1.0 - v_uv.y);
    return (params.u_tex_matrix * vec4(uv, 0.0, 1.0)).xy;
}

vec4 camera_sample(vec2 tc) {
    return texture(sampler2D(camera_texture, camera_sampler), tc);
}
";

const PASSTHROUGH_BODY: &str = r"void main() {
    outColor = vec4(camera_sample(camera_coord()).rgb, 1.0);
}
";

const GRAYSCALE_BODY: &str = r"void main() {
    vec4 tc = camera_sample(camera_coord());
    float color = tc.r * 0.3 + tc.g * 0.59 + tc.b * 0.11;
    outColor = vec4(color, color, color, 1.0);
}
";

// Taps are unrolled; kernel[i] lives in u_kernel[i / 3][i % 3].
const CONVOLVE_BODY: &str = r"void main() {
    vec2 tc = camera_coord();
    vec3 sum = vec3(0.0);
    sum += camera_sample(tc + params.u_tex_offset[0].xy).rgb * params.u_kernel[0].x;
    sum += camera_sample(tc + params.u_tex_offset[1].xy).rgb * params.u_kernel[0].y;
    sum += camera_sample(tc + params.u_tex_offset[2].xy).rgb * params.u_kernel[0].z;
    sum += camera_sample(tc + params.u_tex_offset[3].xy).rgb * params.u_kernel[1].x;
    sum += camera_sample(tc + params.u_tex_offset[4].xy).rgb * params.u_kernel[1].y;
    sum += camera_sample(tc + params.u_tex_offset[5].xy).rgb * params.u_kernel[1].z;
    sum += camera_sample(tc + params.u_tex_offset[6].xy).rgb * params.u_kernel[2].x;
    sum += camera_sample(tc + params.u_tex_offset[7].xy).rgb * params.u_kernel[2].y;
    sum += camera_sample(tc + params.u_tex_offset[8].xy).rgb * params.u_kernel[2].z;
    sum += vec3(params.u_color_adjust.x);
    outColor = vec4(clamp(sum, 0.0, 1.0), 1.0);
}
";

/// Solid recording indicator, drawn under a scissor rect.
pub(crate) const INDICATOR_FRAGMENT_GLSL: &str = r"#version 450
layout(location = 0) out vec4 outColor;

void main() {
    outColor = vec4(1.0, 0.0, 0.0, 1.0);
}
";

/// Minimal full-screen triangle vertex shader.
pub(crate) const VERTEX_SHADER_GLSL: &str = r"#version 450
layout(location = 0) out vec2 v_uv;

const vec2 positions[3] = vec2[3](
    vec2(-1.0, -3.0),
    vec2(3.0, 1.0),
    vec2(-1.0, 1.0)
);

void main() {
    uint vertex_index = uint(gl_VertexIndex);
    vec2 pos = positions[vertex_index];
    v_uv = pos * 0.5 + vec2(0.5, 0.5);
    gl_Position = vec4(pos, 0.0, 1.0);
}
";

/// Full fragment shader source for `variant`.
pub(crate) fn fragment_source(variant: FilterVariant) -> String {
    let body = match variant {
        FilterVariant::Passthrough => PASSTHROUGH_BODY,
        FilterVariant::Grayscale => GRAYSCALE_BODY,
        FilterVariant::Convolve => CONVOLVE_BODY,
    };
    format!("{HEADER}\n{body}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_shares_the_uniform_block() {
        for variant in [
            FilterVariant::Passthrough,
            FilterVariant::Grayscale,
            FilterVariant::Convolve,
        ] {
            let source = fragment_source(variant);
            assert!(source.starts_with("#version 450"));
            assert!(source.contains("uniform FilterParams"));
            assert_eq!(source.matches("void main()").count(), 1);
        }
    }

    #[test]
    fn convolve_reads_all_nine_taps() {
        let source = fragment_source(FilterVariant::Convolve);
        for tap in 0..9 {
            assert!(source.contains(&format!("u_tex_offset[{tap}]")));
        }
        assert!(source.contains("u_color_adjust"));
    }
}
