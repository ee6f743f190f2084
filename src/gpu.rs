//! wgpu backend: the halftone kernel as a fragment shader over a
//! full-screen triangle, rendered offscreen and read back as RGBA8.

use std::sync::mpsc;

use bytemuck::{Pod, Zeroable};
use tracing::{debug, info};

use crate::color::Ink;
use crate::error::HalftoneError;
use crate::params::HalftoneParameters;
use crate::session::RenderBackend;
use crate::target::{RenderTarget, RenderedFrame};
use crate::texture::Texture;

pub const HALFTONE_WGSL: &str = include_str!("../shaders/wgsl/halftone.wgsl");

/// `flags` bit: the shader may use screen-space derivatives.
pub const FLAG_DERIVATIVES: u32 = 1;

/// Uniform block bound at `@group(0) @binding(2)`. Field order and types
/// must match `struct HalftoneUniform` in the WGSL source; see
/// [`UNIFORM_LAYOUT`] and [`verify_shader_interface`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct HalftoneUniform {
    pub resolution: [f32; 2],
    pub texture_size: [f32; 2],
    pub frequency: f32,
    pub dot_size: f32,
    pub roughness: f32,
    pub fuzz: f32,
    pub paper_noise: f32,
    pub ink_noise: f32,
    pub randomness: f32,
    pub contrast: f32,
    pub lightness: f32,
    pub blur: f32,
    pub threshold: f32,
    pub ink_density: f32,
    pub blend_mode: u32,
    pub sample_mode: u32,
    pub roughness_style: u32,
    pub flags: u32,
    pub paper_color: [f32; 4],
    pub ink_colors: [[f32; 4]; 4],
    /// Screen angles in radians, C M Y K.
    pub angles: [f32; 4],
    pub visible: [u32; 4],
}

const _: () = assert!(std::mem::size_of::<HalftoneUniform>() == 192);

/// `(field, WGSL type)` in declaration order.
pub const UNIFORM_LAYOUT: [(&str, &str); 22] = [
    ("resolution", "vec2<f32>"),
    ("texture_size", "vec2<f32>"),
    ("frequency", "f32"),
    ("dot_size", "f32"),
    ("roughness", "f32"),
    ("fuzz", "f32"),
    ("paper_noise", "f32"),
    ("ink_noise", "f32"),
    ("randomness", "f32"),
    ("contrast", "f32"),
    ("lightness", "f32"),
    ("blur", "f32"),
    ("threshold", "f32"),
    ("ink_density", "f32"),
    ("blend_mode", "u32"),
    ("sample_mode", "u32"),
    ("roughness_style", "u32"),
    ("flags", "u32"),
    ("paper_color", "vec4<f32>"),
    ("ink_colors", "array<vec4<f32>, 4>"),
    ("angles", "vec4<f32>"),
    ("visible", "vec4<u32>"),
];

const REQUIRED_DECLARATIONS: [&str; 5] = [
    "@group(0) @binding(0) var source_texture: texture_2d<f32>",
    "@group(0) @binding(1) var source_sampler: sampler",
    "@group(0) @binding(2) var<uniform> params: HalftoneUniform",
    "fn vs_main(",
    "fn fs_main(",
];

impl HalftoneUniform {
    pub fn new(params: &HalftoneParameters, target: RenderTarget, texture: (u32, u32)) -> Self {
        let p = params.sanitized();
        let mut uniform = Self {
            resolution: target.resolution(),
            texture_size: [texture.0.max(1) as f32, texture.1.max(1) as f32],
            frequency: p.frequency,
            dot_size: p.dot_size,
            roughness: p.roughness,
            fuzz: p.fuzz,
            paper_noise: p.paper_noise,
            ink_noise: p.ink_noise,
            randomness: p.randomness,
            contrast: p.contrast,
            lightness: p.lightness,
            blur: p.blur,
            threshold: p.threshold,
            ink_density: p.ink_density,
            blend_mode: p.blend_mode.as_u32(),
            sample_mode: p.sample_mode.as_u32(),
            roughness_style: p.roughness_style.as_u32(),
            flags: if p.anti_alias { FLAG_DERIVATIVES } else { 0 },
            paper_color: [p.paper_color.r, p.paper_color.g, p.paper_color.b, 1.0],
            ink_colors: [[0.0; 4]; 4],
            angles: [0.0; 4],
            visible: [0; 4],
        };
        for ink in Ink::ORDER {
            let i = ink.index();
            let channel = p.ink(ink);
            uniform.ink_colors[i] = channel.color.as_array();
            uniform.angles[i] = p.angle_radians(ink);
            uniform.visible[i] = u32::from(channel.visible);
        }
        uniform
    }
}

/// Check that a WGSL source declares the uniform block exactly as
/// [`HalftoneUniform`] lays it out, plus every binding and entry point the
/// pipeline uses.
pub fn verify_shader_interface(source: &str) -> Result<(), HalftoneError> {
    let interface_error = |diagnostic: String| HalftoneError::ShaderBuild {
        stage: "interface",
        diagnostic,
    };

    for declaration in REQUIRED_DECLARATIONS {
        if !source.contains(declaration) {
            return Err(interface_error(format!("missing `{declaration}`")));
        }
    }

    let start = source
        .find("struct HalftoneUniform {")
        .ok_or_else(|| interface_error("missing `struct HalftoneUniform`".into()))?;
    let body_start = start + "struct HalftoneUniform {".len();
    let body_len = source[body_start..]
        .find('}')
        .ok_or_else(|| interface_error("unterminated `struct HalftoneUniform`".into()))?;

    let declared: Vec<(&str, &str)> = source[body_start..body_start + body_len]
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("//"))
        .filter_map(|line| {
            let (name, ty) = line.split_once(':')?;
            Some((name.trim(), ty.trim().trim_end_matches(',').trim()))
        })
        .collect();

    for (index, expected) in UNIFORM_LAYOUT.iter().enumerate() {
        match declared.get(index) {
            Some(found) if found == expected => {}
            Some((name, ty)) => {
                return Err(interface_error(format!(
                    "uniform field {index} is `{name}: {ty}`, expected `{}: {}`",
                    expected.0, expected.1
                )))
            }
            None => {
                return Err(interface_error(format!(
                    "uniform field `{}: {}` is not declared",
                    expected.0, expected.1
                )))
            }
        }
    }
    if declared.len() != UNIFORM_LAYOUT.len() {
        return Err(interface_error(format!(
            "uniform declares {} fields, expected {}",
            declared.len(),
            UNIFORM_LAYOUT.len()
        )));
    }
    Ok(())
}

struct SourceBinding {
    _texture: wgpu::Texture,
    bind_group: wgpu::BindGroup,
    width: u32,
    height: u32,
}

struct OutputTarget {
    target: RenderTarget,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    readback: wgpu::Buffer,
    unpadded_bytes_per_row: u32,
    padded_bytes_per_row: u32,
}

pub struct GpuRenderer {
    device: wgpu::Device,
    queue: wgpu::Queue,
    pipeline: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
    uniform_buffer: wgpu::Buffer,
    adapter_name: String,
    source: Option<SourceBinding>,
    output: Option<OutputTarget>,
}

impl GpuRenderer {
    pub fn new() -> Result<Self, HalftoneError> {
        Self::with_shader_source(HALFTONE_WGSL)
    }

    /// Build the pipeline from a custom WGSL source implementing the same
    /// interface as [`HALFTONE_WGSL`].
    pub fn with_shader_source(source: &str) -> Result<Self, HalftoneError> {
        verify_shader_interface(source)?;
        pollster::block_on(Self::create(source))
    }

    async fn create(shader_source: &str) -> Result<Self, HalftoneError> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                force_fallback_adapter: false,
                compatible_surface: None,
            })
            .await
            .ok_or_else(|| HalftoneError::Unsupported("no suitable GPU adapter found".into()))?;
        let adapter_name = adapter.get_info().name;

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("halftone-device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::downlevel_defaults()
                        .using_resolution(adapter.limits()),
                },
                None,
            )
            .await
            .map_err(|e| HalftoneError::Unsupported(format!("failed to request wgpu device: {e}")))?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("halftone-shader"),
            source: wgpu::ShaderSource::Wgsl(shader_source.into()),
        });
        if let Some(err) = device.pop_error_scope().await {
            return Err(HalftoneError::ShaderBuild {
                stage: "compile",
                diagnostic: err.to_string(),
            });
        }

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("halftone-bind-group-layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: wgpu::BufferSize::new(
                            std::mem::size_of::<HalftoneUniform>() as u64,
                        ),
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("halftone-pipeline-layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("halftone-pipeline"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &shader,
                entry_point: "vs_main",
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            primitive: wgpu::PrimitiveState::default(),
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &shader,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: wgpu::TextureFormat::Rgba8Unorm,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            multiview: None,
        });
        if let Some(err) = device.pop_error_scope().await {
            return Err(HalftoneError::ShaderBuild {
                stage: "link",
                diagnostic: err.to_string(),
            });
        }

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("halftone-source-sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("halftone-uniforms"),
            size: std::mem::size_of::<HalftoneUniform>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        info!(adapter = %adapter_name, "gpu halftone pipeline ready");
        Ok(Self {
            device,
            queue,
            pipeline,
            bind_group_layout,
            sampler,
            uniform_buffer,
            adapter_name,
            source: None,
            output: None,
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    pub fn max_texture_dimension(&self) -> u32 {
        self.device.limits().max_texture_dimension_2d
    }

    /// Size of the currently allocated render target, if any.
    pub fn allocated_target(&self) -> Option<RenderTarget> {
        self.output.as_ref().map(|o| o.target)
    }

    fn check_extent(&self, width: u32, height: u32) -> Result<(), HalftoneError> {
        let limit = self.max_texture_dimension();
        if width > limit || height > limit {
            return Err(HalftoneError::ResourceExhausted {
                width,
                height,
                limit,
            });
        }
        Ok(())
    }

    fn ensure_output(&mut self, target: RenderTarget) -> Result<(), HalftoneError> {
        if self.output.as_ref().is_some_and(|o| o.target == target) {
            return Ok(());
        }
        self.check_extent(target.width, target.height)?;

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("halftone-render-target"),
            size: wgpu::Extent3d {
                width: target.width,
                height: target.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        let unpadded_bytes_per_row = target.width.checked_mul(4).ok_or_else(|| {
            HalftoneError::Render("frame width overflow when computing row bytes".into())
        })?;
        let padded_bytes_per_row =
            align_to(unpadded_bytes_per_row, wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("halftone-readback"),
            size: u64::from(padded_bytes_per_row) * u64::from(target.height),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        debug!(width = target.width, height = target.height, "allocated gpu render target");
        self.output = Some(OutputTarget {
            target,
            texture,
            view,
            readback,
            unpadded_bytes_per_row,
            padded_bytes_per_row,
        });
        Ok(())
    }

    fn read_output(&self, output: &OutputTarget) -> Result<Vec<u8>, HalftoneError> {
        let slice = output.readback.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);

        receiver
            .recv()
            .map_err(|_| HalftoneError::Render("failed receiving GPU map callback".into()))?
            .map_err(|e| HalftoneError::Render(format!("GPU buffer mapping failed: {e}")))?;

        let row = output.unpadded_bytes_per_row as usize;
        let height = output.target.height as usize;
        let mut frame = vec![0_u8; row * height];
        {
            let mapped = slice.get_mapped_range();
            for (dst, src) in frame
                .chunks_exact_mut(row)
                .zip(mapped.chunks(output.padded_bytes_per_row as usize))
            {
                dst.copy_from_slice(&src[..row]);
            }
        }
        output.readback.unmap();
        Ok(frame)
    }
}

impl RenderBackend for GpuRenderer {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn upload(&mut self, texture: &Texture) -> Result<(), HalftoneError> {
        let (width, height) = texture.dimensions();
        self.check_extent(width, height)?;

        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let gpu_texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("halftone-source"),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &gpu_texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            texture.as_raw(),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            size,
        );

        let view = gpu_texture.create_view(&wgpu::TextureViewDescriptor::default());
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("halftone-bind-group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
            ],
        });

        self.source = Some(SourceBinding {
            _texture: gpu_texture,
            bind_group,
            width,
            height,
        });
        Ok(())
    }

    /// Drops the source texture only. The render target and readback buffer
    /// depend on the output size alone, so they stay for the next upload.
    fn release(&mut self) {
        if let Some(source) = self.source.take() {
            debug!(width = source.width, height = source.height, "released gpu source texture");
        }
    }

    fn render(
        &mut self,
        params: &HalftoneParameters,
        target: RenderTarget,
    ) -> Result<RenderedFrame, HalftoneError> {
        self.ensure_output(target)?;
        let (Some(source), Some(output)) = (self.source.as_ref(), self.output.as_ref()) else {
            return Err(HalftoneError::InvalidState {
                action: "render",
                state: "no texture bound",
            });
        };

        let uniform = HalftoneUniform::new(params, target, (source.width, source.height));
        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniform));

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("halftone-encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("halftone-pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &output.view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::WHITE),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                occlusion_query_set: None,
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.pipeline);
            pass.set_bind_group(0, &source.bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &output.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &output.readback,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(output.padded_bytes_per_row),
                    rows_per_image: Some(target.height),
                },
            },
            wgpu::Extent3d {
                width: target.width,
                height: target.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(HalftoneError::Render(err.to_string()));
        }

        let rgba = self.read_output(output)?;
        Ok(RenderedFrame {
            width: target.width,
            height: target.height,
            rgba,
        })
    }
}

fn align_to(value: u32, alignment: u32) -> u32 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::offset_of;

    #[test]
    fn uniform_layout_matches_wgsl_alignment() {
        assert_eq!(std::mem::size_of::<HalftoneUniform>(), 192);
        assert_eq!(offset_of!(HalftoneUniform, frequency), 16);
        assert_eq!(offset_of!(HalftoneUniform, blend_mode), 64);
        assert_eq!(offset_of!(HalftoneUniform, paper_color), 80);
        assert_eq!(offset_of!(HalftoneUniform, ink_colors), 96);
        assert_eq!(offset_of!(HalftoneUniform, angles), 160);
        assert_eq!(offset_of!(HalftoneUniform, visible), 176);
    }

    #[test]
    fn bundled_shader_declares_the_full_interface() {
        verify_shader_interface(HALFTONE_WGSL).expect("bundled shader interface");
    }

    #[test]
    fn misspelled_uniform_fields_fail_at_startup() {
        let broken = HALFTONE_WGSL.replace("    dot_size: f32,", "    dotsize: f32,");
        let err = verify_shader_interface(&broken).expect_err("typo detected");
        assert_eq!(err.code(), "E_SHADER_BUILD");
        assert!(err.to_string().contains("dot_size"), "{err}");

        let missing = HALFTONE_WGSL.replace("    visible: vec4<u32>,\n", "");
        assert!(verify_shader_interface(&missing).is_err());

        let unbound = HALFTONE_WGSL.replace("@binding(1)", "@binding(3)");
        assert!(verify_shader_interface(&unbound).is_err());
    }

    #[test]
    fn uniform_packs_channels_in_cmyk_order() {
        let mut params = HalftoneParameters::default();
        params.magenta.visible = false;
        params.anti_alias = false;
        let uniform = HalftoneUniform::new(&params, RenderTarget::new(300, 200), (150, 100));
        assert_eq!(uniform.resolution, [300.0, 200.0]);
        assert_eq!(uniform.texture_size, [150.0, 100.0]);
        assert_eq!(uniform.visible, [1, 0, 1, 1]);
        assert_eq!(uniform.flags, 0);
        assert!((uniform.angles[3] - 45f32.to_radians()).abs() < 1e-6);
        assert_eq!(uniform.ink_colors[0], params.cyan.color.as_array());
    }

    #[test]
    fn rows_pad_to_copy_alignment() {
        assert_eq!(align_to(4, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(1204, 256), 1280);
    }
}
