use halftone::color::Ink;
use halftone::gpu::{GpuRenderer, HALFTONE_WGSL};
use halftone::software::SoftwareRenderer;
use halftone::{HalftoneError, HalftoneParameters, RenderBackend, RenderTarget, Texture};

fn gpu_or_skip() -> Option<GpuRenderer> {
    match GpuRenderer::new() {
        Ok(renderer) => Some(renderer),
        Err(HalftoneError::Unsupported(reason)) => {
            eprintln!("skipping GPU smoke test: {reason}");
            None
        }
        Err(other) => panic!("GPU renderer failed to initialize: {other}"),
    }
}

#[test]
fn gpu_renders_an_opaque_frame() {
    let Some(mut gpu) = gpu_or_skip() else {
        return;
    };
    let texture = Texture::solid(64, 48, [128, 90, 40, 255]).expect("texture");
    gpu.upload(&texture).expect("upload should succeed");

    let target = RenderTarget::new(480, 360);
    let frame = gpu
        .render(&HalftoneParameters::default(), target)
        .expect("render should succeed");
    assert_eq!((frame.width, frame.height), (480, 360));
    assert_eq!(Some(frame.rgba.len()), target.byte_len());
    assert!(frame.rgba.chunks_exact(4).all(|px| px[3] == 255));
    assert!(
        frame.rgba.chunks_exact(4).any(|px| px[0] != frame.rgba[0]),
        "halftone output should not be a flat fill"
    );
}

#[test]
fn gpu_and_cpu_agree_on_a_bare_sheet() {
    let Some(mut gpu) = gpu_or_skip() else {
        return;
    };
    let texture = Texture::solid(32, 32, [10, 200, 30, 255]).expect("texture");
    let mut params = HalftoneParameters {
        paper_noise: 0.0,
        ..HalftoneParameters::default()
    };
    for ink in Ink::ORDER {
        params.ink_mut(ink).visible = false;
    }

    let target = RenderTarget::new(400, 400);
    let mut cpu = SoftwareRenderer::new();
    cpu.upload(&texture).expect("cpu upload");
    gpu.upload(&texture).expect("gpu upload");
    let expected = cpu.render(&params, target).expect("cpu render");
    let actual = gpu.render(&params, target).expect("gpu render");

    for (a, b) in actual.rgba.iter().zip(&expected.rgba) {
        assert!(a.abs_diff(*b) <= 1, "gpu {a} vs cpu {b}");
    }
}

#[test]
fn output_target_survives_a_texture_swap() {
    let Some(mut gpu) = gpu_or_skip() else {
        return;
    };
    let target = RenderTarget::new(400, 300);
    let params = HalftoneParameters::default();
    let first = Texture::solid(32, 32, [200, 40, 40, 255]).expect("texture");
    let second = Texture::solid(48, 16, [40, 40, 200, 255]).expect("texture");

    gpu.upload(&first).expect("first upload");
    gpu.render(&params, target).expect("first render");
    assert_eq!(gpu.allocated_target(), Some(target));

    gpu.release();
    assert_eq!(gpu.allocated_target(), Some(target));
    gpu.upload(&second).expect("second upload");
    let frame = gpu.render(&params, target).expect("second render");
    assert_eq!((frame.width, frame.height), (400, 300));
    assert_eq!(gpu.allocated_target(), Some(target));

    let resized = RenderTarget::new(200, 150);
    gpu.render(&params, resized).expect("resized render");
    assert_eq!(gpu.allocated_target(), Some(resized));
}

#[test]
fn gpu_rejects_oversized_sources() {
    let Some(mut gpu) = gpu_or_skip() else {
        return;
    };
    let limit = gpu.max_texture_dimension();
    let Some(width) = limit.checked_add(1) else {
        return;
    };
    let texture = Texture::solid(width, 1, [0, 0, 0, 255]).expect("texture");
    let err = gpu.upload(&texture).expect_err("oversized upload must fail");
    assert_eq!(err.code(), "E_RESOURCE_EXHAUSTED");
    assert!(err.is_recoverable());
}

#[test]
fn shader_with_missing_binding_fails_before_touching_the_gpu() {
    let broken = HALFTONE_WGSL.replace("ink_density", "ink_densty");
    match GpuRenderer::with_shader_source(&broken) {
        Err(err) => {
            assert_eq!(err.code(), "E_SHADER_BUILD");
            assert!(!err.is_recoverable());
        }
        Ok(_) => panic!("a misnamed uniform field must be rejected"),
    }
}
