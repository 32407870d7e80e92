//! Headless `wgpu` implementation of [`GpuContext`].
//!
//! The display surface is an offscreen texture. Contexts created with
//! [`HardwareContext::shared_with`] reuse the same device and queue, which is
//! how the encoder context reaches the camera texture without a copy.

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use wgpu::naga::ShaderStage;

use super::{tap_offsets, GpuContext};
use crate::compile::{fragment_source, INDICATOR_FRAGMENT_GLSL, VERTEX_SHADER_GLSL};
use crate::error::GpuError;
use crate::filter::{FilterVariant, Kernel};
use crate::frame::FrameSlot;
use crate::types::{
    ContextId, ContextRef, IndicatorRect, PreviewGeometry, ProgramId, SharedTextureHandle,
    SurfaceImage, TextureId, IDENTITY_TRANSFORM,
};

const SURFACE_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;
const CAMERA_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Device, queue, and camera textures visible to every context in the group.
pub struct HardwareShareGroup {
    device: wgpu::Device,
    queue: wgpu::Queue,
    textures: Mutex<HashMap<(ContextId, TextureId), wgpu::Texture>>,
}

impl HardwareShareGroup {
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// GPU texture currently backing `handle`, once a frame has been latched.
    pub fn texture(&self, handle: &SharedTextureHandle) -> Option<wgpu::Texture> {
        self.textures
            .lock()
            .get(&(handle.context(), handle.texture()))
            .cloned()
    }

    /// Reads back the last frame latched into `handle`, for encoders that
    /// consume pixels on the host.
    pub fn read_texture(
        &self,
        handle: &SharedTextureHandle,
    ) -> Result<Option<Vec<u8>>, GpuError> {
        let Some(texture) = self.texture(handle) else {
            return Ok(None);
        };
        read_texture(&self.device, &self.queue, &texture, "read_shared_texture").map(Some)
    }
}

/// Mirrors `FilterParams` in the GLSL header (std140).
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct FilterUniforms {
    tex_matrix: [[f32; 4]; 4],
    kernel: [[f32; 4]; 3],
    tex_offset: [[f32; 4]; 9],
    color_adjust: [f32; 4],
}

impl FilterUniforms {
    fn new() -> Self {
        let mut uniforms = Self::zeroed();
        uniforms.set_transform(&IDENTITY_TRANSFORM);
        uniforms
    }

    fn set_transform(&mut self, transform: &[f32; 16]) {
        for (column, chunk) in self.tex_matrix.iter_mut().zip(transform.chunks_exact(4)) {
            column.copy_from_slice(chunk);
        }
    }

    fn set_kernel(&mut self, kernel: &Kernel, color_bias: f32) {
        for (index, weight) in kernel.iter().enumerate() {
            self.kernel[index / 3][index % 3] = *weight;
        }
        self.color_adjust = [color_bias, 0.0, 0.0, 0.0];
    }

    fn set_offsets(&mut self, offsets: &[[f32; 2]; 9]) {
        for (slot, offset) in self.tex_offset.iter_mut().zip(offsets.iter()) {
            *slot = [offset[0], offset[1], 0.0, 0.0];
        }
    }
}

struct CameraTexture {
    slot: FrameSlot,
    gpu: Option<UploadedTexture>,
}

struct UploadedTexture {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    geometry: PreviewGeometry,
}

struct FilterProgram {
    pipeline: wgpu::RenderPipeline,
    uniforms: FilterUniforms,
    buffer: wgpu::Buffer,
}

struct SurfaceTarget {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    width: u32,
    height: u32,
}

pub struct HardwareContext {
    id: ContextId,
    share: Arc<HardwareShareGroup>,
    bind_layout: wgpu::BindGroupLayout,
    filter_layout: wgpu::PipelineLayout,
    vertex_module: wgpu::ShaderModule,
    indicator_pipeline: wgpu::RenderPipeline,
    sampler: wgpu::Sampler,
    textures: HashMap<TextureId, CameraTexture>,
    programs: HashMap<ProgramId, FilterProgram>,
    surface_size: Option<(u32, u32)>,
    surface: Option<SurfaceTarget>,
    next_texture: u32,
    next_program: u32,
}

impl HardwareContext {
    /// Creates a context on a new headless device.
    pub fn new() -> Result<Self, GpuError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
            backend_options: wgpu::BackendOptions::default(),
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::LowPower,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|err| GpuError::new("request_adapter", err.to_string()))?;

        let info = adapter.get_info();
        tracing::debug!(
            name = %info.name,
            backend = ?info.backend,
            device_type = ?info.device_type,
            "selected GPU adapter"
        );

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("dualcam device"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|err| GpuError::new("request_device", err.to_string()))?;

        Self::with_share_group(Arc::new(HardwareShareGroup {
            device,
            queue,
            textures: Mutex::new(HashMap::new()),
        }))
    }

    /// Creates a context on the device of `other`, sharing its textures.
    pub fn shared_with(other: &ContextRef) -> Result<Self, GpuError> {
        match other.share_group::<HardwareShareGroup>() {
            Some(group) => Self::with_share_group(group),
            None => {
                tracing::warn!(
                    context = %other.id(),
                    "share reference is not a hardware context; creating an unshared device"
                );
                Self::new()
            }
        }
    }

    fn with_share_group(share: Arc<HardwareShareGroup>) -> Result<Self, GpuError> {
        let device = share.device.clone();
        let (bind_layout, filter_layout, vertex_module, indicator_pipeline, sampler) =
            scoped(&device, "create_context", || {
                let bind_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some("filter layout"),
                    entries: &[
                        wgpu::BindGroupLayoutEntry {
                            binding: 0,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Buffer {
                                ty: wgpu::BufferBindingType::Uniform,
                                has_dynamic_offset: false,
                                min_binding_size: None,
                            },
                            count: None,
                        },
                        wgpu::BindGroupLayoutEntry {
                            binding: 1,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Texture {
                                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                                view_dimension: wgpu::TextureViewDimension::D2,
                                multisampled: false,
                            },
                            count: None,
                        },
                        wgpu::BindGroupLayoutEntry {
                            binding: 2,
                            visibility: wgpu::ShaderStages::FRAGMENT,
                            ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                            count: None,
                        },
                    ],
                });
                let filter_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some("filter pipeline layout"),
                    bind_group_layouts: &[&bind_layout],
                    push_constant_ranges: &[],
                });
                let indicator_layout =
                    device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                        label: Some("indicator pipeline layout"),
                        bind_group_layouts: &[],
                        push_constant_ranges: &[],
                    });

                let vertex_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("fullscreen triangle vertex"),
                    source: wgpu::ShaderSource::Glsl {
                        shader: Cow::Borrowed(VERTEX_SHADER_GLSL),
                        stage: ShaderStage::Vertex,
                        defines: &[],
                    },
                });
                let indicator_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("recording indicator fragment"),
                    source: wgpu::ShaderSource::Glsl {
                        shader: Cow::Borrowed(INDICATOR_FRAGMENT_GLSL),
                        stage: ShaderStage::Fragment,
                        defines: &[],
                    },
                });
                let indicator_pipeline = create_pipeline(
                    &device,
                    "recording indicator",
                    &indicator_layout,
                    &vertex_module,
                    &indicator_module,
                );

                let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
                    label: Some("camera sampler"),
                    address_mode_u: wgpu::AddressMode::ClampToEdge,
                    address_mode_v: wgpu::AddressMode::ClampToEdge,
                    address_mode_w: wgpu::AddressMode::ClampToEdge,
                    mag_filter: wgpu::FilterMode::Linear,
                    min_filter: wgpu::FilterMode::Linear,
                    ..Default::default()
                });

                (
                    bind_layout,
                    filter_layout,
                    vertex_module,
                    indicator_pipeline,
                    sampler,
                )
            })?;

        Ok(Self {
            id: ContextId::next(),
            share,
            bind_layout,
            filter_layout,
            vertex_module,
            indicator_pipeline,
            sampler,
            textures: HashMap::new(),
            programs: HashMap::new(),
            surface_size: None,
            surface: None,
            next_texture: 1,
            next_program: 1,
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    fn program_mut(&mut self, id: ProgramId) -> Result<&mut FilterProgram, GpuError> {
        self.programs
            .get_mut(&id)
            .ok_or_else(|| GpuError::new("use_program", format!("unknown program {}", id.0)))
    }

    fn camera_texture(&self, handle: &SharedTextureHandle) -> Result<&CameraTexture, GpuError> {
        if handle.context() != self.id {
            return Err(GpuError::new(
                "bind_texture",
                format!("{handle} belongs to another context"),
            ));
        }
        self.textures.get(&handle.texture()).ok_or_else(|| {
            GpuError::new("bind_texture", format!("unknown texture {}", handle.texture().0))
        })
    }

    fn write_uniforms(&self, program: &FilterProgram) {
        self.share
            .queue
            .write_buffer(&program.buffer, 0, bytemuck::bytes_of(&program.uniforms));
    }

    fn ensure_surface(&mut self, fallback: Option<PreviewGeometry>) {
        let (width, height) = self
            .surface_size
            .or_else(|| fallback.map(|g| (g.width, g.height)))
            .unwrap_or((1, 1));
        let current = self
            .surface
            .as_ref()
            .is_some_and(|s| s.width == width && s.height == height);
        if !current {
            self.surface = Some(create_surface(&self.share.device, width, height));
        }
    }
}

impl GpuContext for HardwareContext {
    fn context_ref(&self) -> ContextRef {
        ContextRef::new(self.id, self.share.clone())
    }

    fn create_external_texture(&mut self) -> Result<SharedTextureHandle, GpuError> {
        let id = TextureId(self.next_texture);
        self.next_texture += 1;
        let slot = FrameSlot::new();
        self.textures.insert(
            id,
            CameraTexture {
                slot: slot.clone(),
                gpu: None,
            },
        );
        Ok(SharedTextureHandle::new(id, self.id, slot))
    }

    fn latch(&mut self, texture: &SharedTextureHandle) -> Result<Option<[f32; 16]>, GpuError> {
        self.camera_texture(texture)?;
        let device = self.share.device.clone();
        let queue = self.share.queue.clone();
        let Some(entry) = self.textures.get_mut(&texture.texture()) else {
            return Ok(None);
        };
        let Some(frame) = entry.slot.latch() else {
            return Ok(None);
        };

        let geometry = frame.geometry;
        let reuse = entry
            .gpu
            .as_ref()
            .is_some_and(|uploaded| uploaded.geometry == geometry);
        scoped(&device, "update_tex_image", || {
            if !reuse {
                let gpu_texture = device.create_texture(&wgpu::TextureDescriptor {
                    label: Some("camera texture"),
                    size: extent(geometry.width, geometry.height),
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: CAMERA_FORMAT,
                    usage: wgpu::TextureUsages::TEXTURE_BINDING
                        | wgpu::TextureUsages::COPY_DST
                        | wgpu::TextureUsages::COPY_SRC,
                    view_formats: &[],
                });
                let view = gpu_texture.create_view(&wgpu::TextureViewDescriptor::default());
                entry.gpu = Some(UploadedTexture {
                    texture: gpu_texture,
                    view,
                    geometry,
                });
            }
            if let Some(uploaded) = entry.gpu.as_ref() {
                queue.write_texture(
                    wgpu::TexelCopyTextureInfo {
                        texture: &uploaded.texture,
                        mip_level: 0,
                        origin: wgpu::Origin3d::ZERO,
                        aspect: wgpu::TextureAspect::All,
                    },
                    &frame.pixels,
                    wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(geometry.width * 4),
                        rows_per_image: Some(geometry.height),
                    },
                    extent(geometry.width, geometry.height),
                );
            }
        })?;

        if let Some(uploaded) = entry.gpu.as_ref() {
            self.share
                .textures
                .lock()
                .insert((self.id, texture.texture()), uploaded.texture.clone());
        }
        Ok(Some(frame.transform))
    }

    fn compile_program(&mut self, variant: FilterVariant) -> Result<ProgramId, GpuError> {
        let device = self.share.device.clone();
        let source = fragment_source(variant);
        let (pipeline, buffer) = scoped(&device, "compile_program", || {
            let fragment = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("filter fragment"),
                source: wgpu::ShaderSource::Glsl {
                    shader: Cow::Owned(source),
                    stage: ShaderStage::Fragment,
                    defines: &[],
                },
            });
            let pipeline = create_pipeline(
                &device,
                "filter pipeline",
                &self.filter_layout,
                &self.vertex_module,
                &fragment,
            );
            let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("filter uniforms"),
                size: std::mem::size_of::<FilterUniforms>() as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            });
            (pipeline, buffer)
        })?;

        let program = FilterProgram {
            pipeline,
            uniforms: FilterUniforms::new(),
            buffer,
        };
        self.write_uniforms(&program);

        let id = ProgramId(self.next_program);
        self.next_program += 1;
        self.programs.insert(id, program);
        tracing::debug!(program = id.0, %variant, "compiled filter program");
        Ok(id)
    }

    fn set_kernel(
        &mut self,
        program: ProgramId,
        kernel: &Kernel,
        color_bias: f32,
    ) -> Result<(), GpuError> {
        self.program_mut(program)?
            .uniforms
            .set_kernel(kernel, color_bias);
        Ok(())
    }

    fn set_texture_size(
        &mut self,
        program: ProgramId,
        geometry: PreviewGeometry,
    ) -> Result<(), GpuError> {
        self.program_mut(program)?
            .uniforms
            .set_offsets(&tap_offsets(geometry));
        Ok(())
    }

    fn draw_frame(
        &mut self,
        program: ProgramId,
        texture: &SharedTextureHandle,
        transform: &[f32; 16],
    ) -> Result<(), GpuError> {
        let geometry = self
            .camera_texture(texture)?
            .gpu
            .as_ref()
            .map(|uploaded| uploaded.geometry);
        self.program_mut(program)?.uniforms.set_transform(transform);
        self.ensure_surface(geometry);

        let device = self.share.device.clone();
        let Some(surface) = self.surface.as_ref() else {
            return Ok(());
        };
        let Some(filter) = self.programs.get(&program) else {
            return Err(GpuError::new("use_program", format!("unknown program {}", program.0)));
        };
        let uploaded = self
            .textures
            .get(&texture.texture())
            .and_then(|entry| entry.gpu.as_ref());

        scoped(&device, "draw_frame", || {
            self.write_uniforms(filter);
            let bind_group = uploaded.map(|uploaded| {
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("filter bind group"),
                    layout: &self.bind_layout,
                    entries: &[
                        wgpu::BindGroupEntry {
                            binding: 0,
                            resource: filter.buffer.as_entire_binding(),
                        },
                        wgpu::BindGroupEntry {
                            binding: 1,
                            resource: wgpu::BindingResource::TextureView(&uploaded.view),
                        },
                        wgpu::BindGroupEntry {
                            binding: 2,
                            resource: wgpu::BindingResource::Sampler(&self.sampler),
                        },
                    ],
                })
            });

            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("draw frame"),
            });
            {
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("display pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &surface.view,
                        depth_slice: None,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    occlusion_query_set: None,
                    timestamp_writes: None,
                });
                // Nothing latched yet: the clear is the frame.
                if let Some(bind_group) = bind_group.as_ref() {
                    pass.set_pipeline(&filter.pipeline);
                    pass.set_bind_group(0, bind_group, &[]);
                    pass.draw(0..3, 0..1);
                }
            }
            self.share.queue.submit(std::iter::once(encoder.finish()));
        })
    }

    fn draw_indicator(&mut self, rect: IndicatorRect) -> Result<(), GpuError> {
        let Some(surface) = self.surface.as_ref() else {
            return Ok(());
        };
        let x_end = rect.x.saturating_add(rect.width).min(surface.width);
        let y_end = rect.y.saturating_add(rect.height).min(surface.height);
        if x_end <= rect.x || y_end <= rect.y {
            return Ok(());
        }
        let (width, height) = (x_end - rect.x, y_end - rect.y);
        // GL scissor origin is bottom-left; wgpu's is top-left.
        let top = surface.height - y_end;

        let device = self.share.device.clone();
        scoped(&device, "draw_indicator", || {
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("recording indicator"),
            });
            {
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("indicator pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &surface.view,
                        depth_slice: None,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    occlusion_query_set: None,
                    timestamp_writes: None,
                });
                pass.set_pipeline(&self.indicator_pipeline);
                pass.set_scissor_rect(rect.x, top, width, height);
                pass.draw(0..3, 0..1);
            }
            self.share.queue.submit(std::iter::once(encoder.finish()));
        })
    }

    fn resize_surface(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
        let max = self.share.device.limits().max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(GpuError::new(
                "resize_surface",
                format!("surface {width}x{height} outside 1..={max}"),
            ));
        }
        self.surface_size = Some((width, height));
        self.ensure_surface(None);
        Ok(())
    }

    fn read_surface(&mut self) -> Result<Option<SurfaceImage>, GpuError> {
        let Some(surface) = self.surface.as_ref() else {
            return Ok(None);
        };
        let rgba = read_texture(
            &self.share.device,
            &self.share.queue,
            &surface.texture,
            "read_surface",
        )?;
        Ok(Some(SurfaceImage {
            width: surface.width,
            height: surface.height,
            rgba,
        }))
    }

    fn release_texture(&mut self, texture: &SharedTextureHandle) {
        if let Some(entry) = self.textures.remove(&texture.texture()) {
            entry.slot.release();
            if let Some(uploaded) = entry.gpu {
                uploaded.texture.destroy();
            }
        }
        self.share
            .textures
            .lock()
            .remove(&(self.id, texture.texture()));
    }
}

fn extent(width: u32, height: u32) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: width.max(1),
        height: height.max(1),
        depth_or_array_layers: 1,
    }
}

fn create_surface(device: &wgpu::Device, width: u32, height: u32) -> SurfaceTarget {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("display surface"),
        size: extent(width, height),
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: SURFACE_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    });
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    SurfaceTarget {
        texture,
        view,
        width: width.max(1),
        height: height.max(1),
    }
}

fn create_pipeline(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::PipelineLayout,
    vertex: &wgpu::ShaderModule,
    fragment: &wgpu::ShaderModule,
) -> wgpu::RenderPipeline {
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(layout),
        vertex: wgpu::VertexState {
            module: vertex,
            entry_point: Some("main"),
            buffers: &[],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        },
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        fragment: Some(wgpu::FragmentState {
            module: fragment,
            entry_point: Some("main"),
            targets: &[Some(wgpu::ColorTargetState {
                format: SURFACE_FORMAT,
                blend: None,
                write_mask: wgpu::ColorWrites::ALL,
            })],
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        }),
        multiview: None,
        cache: None,
    })
}

/// Copies an RGBA8 texture into host memory, rows top to bottom.
fn read_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    call: &'static str,
) -> Result<Vec<u8>, GpuError> {
    let (width, height) = (texture.width(), texture.height());
    let row_bytes = width * 4;
    let padded_row_bytes = row_bytes.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
        * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;

    let staging = scoped(device, call, || {
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("texture readback"),
            size: u64::from(padded_row_bytes) * u64::from(height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("texture readback"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &buffer,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row_bytes),
                    rows_per_image: Some(height),
                },
            },
            extent(width, height),
        );
        queue.submit(std::iter::once(encoder.finish()));
        buffer
    })?;

    let slice = staging.slice(..);
    let (tx, rx) = crossbeam_channel::bounded(1);
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    device
        .poll(wgpu::PollType::Wait)
        .map_err(|err| GpuError::new(call, err.to_string()))?;
    rx.recv()
        .map_err(|_| GpuError::new(call, "map callback dropped"))?
        .map_err(|err| GpuError::new(call, err.to_string()))?;

    let mapped = slice.get_mapped_range();
    let rgba: Vec<u8> = mapped
        .chunks_exact(padded_row_bytes as usize)
        .flat_map(|row| &row[..row_bytes as usize])
        .copied()
        .collect();
    drop(mapped);
    staging.unmap();
    Ok(rgba)
}

/// Runs `f` inside validation and out-of-memory error scopes.
fn scoped<T>(
    device: &wgpu::Device,
    call: &'static str,
    f: impl FnOnce() -> T,
) -> Result<T, GpuError> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = f();
    let validation = pollster::block_on(device.pop_error_scope());
    let out_of_memory = pollster::block_on(device.pop_error_scope());
    match validation.or(out_of_memory) {
        Some(err) => Err(GpuError::new(call, err.to_string())),
        None => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_block_matches_std140_layout() {
        assert_eq!(std::mem::size_of::<FilterUniforms>(), 272);
    }

    #[test]
    fn kernel_is_packed_row_major_into_vec4s() {
        let mut uniforms = FilterUniforms::new();
        uniforms.set_kernel(&crate::filter::SHARPEN_KERNEL, 0.25);
        assert_eq!(uniforms.kernel[0], [0.0, -1.0, 0.0, 0.0]);
        assert_eq!(uniforms.kernel[1], [-1.0, 5.0, -1.0, 0.0]);
        assert_eq!(uniforms.kernel[2], [0.0, -1.0, 0.0, 0.0]);
        assert_eq!(uniforms.color_adjust[0], 0.25);
    }

    /// Renders through the real device; skipped on machines without an adapter.
    #[test]
    fn grayscale_frame_reads_back_from_the_surface() {
        let mut ctx = match HardwareContext::new() {
            Ok(ctx) => ctx,
            Err(err) => {
                eprintln!("skipping hardware readback: {err}");
                return;
            }
        };
        let geometry = PreviewGeometry::new(4, 4);
        let texture = ctx.create_external_texture().unwrap();
        let pixels: Vec<u8> = [255u8, 0, 0, 255]
            .iter()
            .copied()
            .cycle()
            .take(geometry.pixel_count() * 4)
            .collect();
        let frame = crate::frame::Frame::new(
            geometry,
            Arc::from(pixels),
            std::time::Duration::ZERO,
        )
        .unwrap();
        texture.slot().publish(frame).unwrap();
        assert!(ctx.latch(&texture).unwrap().is_some());

        ctx.resize_surface(4, 4).unwrap();
        let program = ctx.compile_program(FilterVariant::Grayscale).unwrap();
        ctx.set_texture_size(program, geometry).unwrap();
        ctx.draw_frame(program, &texture, &IDENTITY_TRANSFORM).unwrap();
        ctx.draw_indicator(IndicatorRect {
            x: 0,
            y: 0,
            width: 1,
            height: 1,
        })
        .unwrap();

        let surface = ctx.read_surface().unwrap().expect("hardware readback");
        assert_eq!((surface.width, surface.height), (4, 4));
        assert_eq!(surface.rgba.len(), 4 * 4 * 4);
        let [r, g, b, a] = surface.pixel(2, 1).unwrap();
        assert!((75..=78).contains(&r), "grey level {r}");
        assert_eq!((g, b, a), (r, r, 255));
        // Indicator rows count from the bottom of the surface.
        assert_eq!(surface.pixel(0, 3), Some([255, 0, 0, 255]));
        assert_eq!(surface.pixel(0, 0).map(|px| px[0]), Some(r));
    }

    #[test]
    fn transform_is_stored_column_major() {
        let mut uniforms = FilterUniforms::new();
        let mut flip = IDENTITY_TRANSFORM;
        flip[5] = -1.0;
        flip[13] = 1.0;
        uniforms.set_transform(&flip);
        assert_eq!(uniforms.tex_matrix[1], [0.0, -1.0, 0.0, 0.0]);
        assert_eq!(uniforms.tex_matrix[3], [0.0, 1.0, 0.0, 1.0]);
    }
}
