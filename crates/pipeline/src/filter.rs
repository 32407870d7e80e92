//! Filter table and lazy shader-program management for the display path.
//!
//! A filter resolves to a [`FilterSpec`]: a shader variant plus, for the
//! convolution variant, a 3×3 kernel and colour bias. Switching between two
//! filters of the same variant only rewrites uniforms; a program is compiled
//! again only when the variant itself changes.

use std::fmt;

use crate::error::{GpuError, PipelineError};
use crate::gpu::GpuContext;
use crate::types::ProgramId;

/// Row-major 3×3 convolution kernel.
pub type Kernel = [f32; 9];

pub const BLUR_KERNEL: Kernel = [
    1.0 / 16.0, 2.0 / 16.0, 1.0 / 16.0, //
    2.0 / 16.0, 4.0 / 16.0, 2.0 / 16.0, //
    1.0 / 16.0, 2.0 / 16.0, 1.0 / 16.0,
];

pub const SHARPEN_KERNEL: Kernel = [
    0.0, -1.0, 0.0, //
    -1.0, 5.0, -1.0, //
    0.0, -1.0, 0.0,
];

pub const EDGE_DETECT_KERNEL: Kernel = [
    -1.0, -1.0, -1.0, //
    -1.0, 8.0, -1.0, //
    -1.0, -1.0, -1.0,
];

pub const EMBOSS_KERNEL: Kernel = [
    2.0, 0.0, 0.0, //
    0.0, -1.0, 0.0, //
    0.0, 0.0, -1.0,
];

pub const EMBOSS_COLOR_BIAS: f32 = 0.5;

/// Shader family; programs are shared across filters of the same variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterVariant {
    /// Straight copy of the external texture.
    Passthrough,
    /// Black & white via luminance weights.
    Grayscale,
    /// 3×3 convolution with a colour bias.
    Convolve,
}

impl fmt::Display for FilterVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterVariant::Passthrough => f.write_str("TEXTURE_EXT"),
            FilterVariant::Grayscale => f.write_str("TEXTURE_EXT_BW"),
            FilterVariant::Convolve => f.write_str("TEXTURE_EXT_FILT"),
        }
    }
}

/// The six filters the shell can request, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterId {
    #[default]
    None = 0,
    BlackWhite = 1,
    Blur = 2,
    Sharpen = 3,
    EdgeDetect = 4,
    Emboss = 5,
}

impl FilterId {
    pub const ALL: [FilterId; 6] = [
        FilterId::None,
        FilterId::BlackWhite,
        FilterId::Blur,
        FilterId::Sharpen,
        FilterId::EdgeDetect,
        FilterId::Emboss,
    ];

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn label(self) -> &'static str {
        match self {
            FilterId::None => "none",
            FilterId::BlackWhite => "black & white",
            FilterId::Blur => "blur",
            FilterId::Sharpen => "sharpen",
            FilterId::EdgeDetect => "edge detect",
            FilterId::Emboss => "emboss",
        }
    }

    pub fn spec(self) -> FilterSpec {
        match self {
            FilterId::None => FilterSpec::plain(FilterVariant::Passthrough),
            FilterId::BlackWhite => FilterSpec::plain(FilterVariant::Grayscale),
            FilterId::Blur => FilterSpec::convolve(BLUR_KERNEL, 0.0),
            FilterId::Sharpen => FilterSpec::convolve(SHARPEN_KERNEL, 0.0),
            FilterId::EdgeDetect => FilterSpec::convolve(EDGE_DETECT_KERNEL, 0.0),
            FilterId::Emboss => FilterSpec::convolve(EMBOSS_KERNEL, EMBOSS_COLOR_BIAS),
        }
    }
}

impl TryFrom<u32> for FilterId {
    type Error = PipelineError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        FilterId::ALL
            .get(value as usize)
            .copied()
            .ok_or(PipelineError::InvalidFilterId(value))
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterSpec {
    pub variant: FilterVariant,
    pub kernel: Option<Kernel>,
    pub color_bias: f32,
}

impl FilterSpec {
    const fn plain(variant: FilterVariant) -> Self {
        Self {
            variant,
            kernel: None,
            color_bias: 0.0,
        }
    }

    const fn convolve(kernel: Kernel, color_bias: f32) -> Self {
        Self {
            variant: FilterVariant::Convolve,
            kernel: Some(kernel),
            color_bias,
        }
    }
}

/// Maps a raw filter id to its spec.
pub fn select(filter_id: u32) -> Result<FilterSpec, PipelineError> {
    FilterId::try_from(filter_id).map(FilterId::spec)
}

/// Kernel and bias changes reuse the compiled program; only a variant change recompiles.
pub fn needs_recompile(current: FilterVariant, requested: FilterVariant) -> bool {
    current != requested
}

/// Compiled program currently bound to the display path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveProgram {
    pub id: ProgramId,
    pub variant: FilterVariant,
}

/// Tracks the requested filter and brings the compiled program up to date.
#[derive(Debug, Default)]
pub struct FilterProgramSelector {
    requested: FilterId,
    current: Option<FilterId>,
}

impl FilterProgramSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&mut self, filter: FilterId) {
        self.requested = filter;
    }

    pub fn requested(&self) -> FilterId {
        self.requested
    }

    pub fn current(&self) -> Option<FilterId> {
        self.current
    }

    pub fn is_pending(&self) -> bool {
        self.current != Some(self.requested)
    }

    /// Forgets the applied filter; the next [`apply`](Self::apply) re-applies the request.
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Compiles the program every fresh context starts with.
    pub fn compile_default<G: GpuContext>(gpu: &mut G) -> Result<ActiveProgram, GpuError> {
        let id = gpu.compile_program(FilterVariant::Passthrough)?;
        Ok(ActiveProgram {
            id,
            variant: FilterVariant::Passthrough,
        })
    }

    /// Applies the requested filter to `program`.
    ///
    /// Returns `true` when a new program was compiled, in which case its
    /// texture-size uniform still has to be pushed.
    pub fn apply<G: GpuContext>(
        &mut self,
        gpu: &mut G,
        program: &mut ActiveProgram,
    ) -> Result<bool, GpuError> {
        let filter = self.requested;
        let spec = filter.spec();
        tracing::debug!(filter = %filter, variant = %spec.variant, "updating filter");

        let recompiled = needs_recompile(program.variant, spec.variant);
        if recompiled {
            let id = gpu.compile_program(spec.variant)?;
            gpu.release_program(program.id);
            *program = ActiveProgram {
                id,
                variant: spec.variant,
            };
        }

        if let Some(kernel) = spec.kernel.as_ref() {
            gpu.set_kernel(program.id, kernel, spec.color_bias)?;
        }

        self.current = Some(filter);
        Ok(recompiled)
    }
}
