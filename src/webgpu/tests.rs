use super::*;
use std::sync::Arc;

use crate::input::InputGenerator;
use crate::select::{select, Backend, SelectOptions};
use crate::verify::{reference_indices, verify};

fn engine() -> Option<Arc<WebGpuEngine>> {
    match WebGpuEngine::new() {
        Ok(e) => Some(Arc::new(e)),
        Err(SelError::Unsupported) => None, // skip
        Err(e) => panic!("Unexpected error: {:?}", e),
    }
}

fn options(engine: Arc<WebGpuEngine>, block_size: usize) -> SelectOptions {
    SelectOptions {
        backend: Backend::WebGpu,
        block_size,
        webgpu_engine: Some(engine),
        ..Default::default()
    }
}

#[test]
fn test_decode_i32s_unaligned() {
    let values = [7i32, SENTINEL, 0, i32::MAX];
    let mut raw = vec![0u8];
    for v in values {
        raw.extend_from_slice(&v.to_ne_bytes());
    }
    // Offset by one byte: never 4-byte aligned.
    assert_eq!(decode_i32s(&raw[1..]), values);
    assert!(decode_i32s(&[]).is_empty());
}

#[test]
fn test_params_struct_size() {
    assert_eq!(std::mem::size_of::<SelectParams>(), 16);
}

#[test]
fn test_shader_source_has_block_size() {
    let src = shader_source(256);
    assert!(src.starts_with("const BLOCK_SIZE: u32 = 256u;\n"));
    assert!(src.contains("fn select_them"));
}

#[test]
fn test_missing_engine_is_unsupported() {
    let opts = SelectOptions {
        backend: Backend::WebGpu,
        ..Default::default()
    };
    let err = select(&vec![0.0f32; 512], 0.5, &opts).unwrap_err();
    assert_eq!(err, SelError::Unsupported);
}

#[test]
fn test_two_hits() {
    let Some(engine) = engine() else { return };
    let block_size = 512.min(engine.max_work_group_size());
    if block_size < 8 {
        return;
    }
    let mut input = vec![0.0f32; block_size * 2];
    input[block_size / 4] = 1.0;
    input[block_size + 3] = 1.0;

    let sel = select(&input, 0.5, &options(engine, block_size)).expect("select failed");
    assert_eq!(sel.count, 2);
    assert_eq!(sel.sorted(), reference_indices(&input, 0.5));
    assert!(sel.tail().iter().all(|&v| v == SENTINEL));
}

#[test]
fn test_matches_cpu_backend() {
    let Some(engine) = engine() else { return };
    let input = InputGenerator::new(21).uniform_f32(256 * 64);

    let gpu = select(&input, 0.9, &options(engine, 256)).expect("select failed");
    let cpu = select(
        &input,
        0.9,
        &SelectOptions {
            block_size: 256,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(gpu.count, cpu.count);
    assert_eq!(gpu.sorted(), cpu.sorted());
    verify(&input, 0.9, &gpu).expect("verification failed");
}

#[test]
fn test_tiled_grid() {
    let Some(engine) = engine() else { return };
    // More workgroups than one dispatch dimension holds.
    let blocks = engine.max_workgroups_per_dim as usize + 3;
    let input = InputGenerator::new(4).uniform_f32(blocks);
    let (wx, wy) = engine.tile_workgroups(blocks).unwrap();
    assert!(wy > 1);
    assert!(wx as usize * wy as usize >= blocks);

    let sel = select(&input, 0.99, &options(engine, 1)).expect("select failed");
    assert_eq!(sel.sorted(), reference_indices(&input, 0.99));
}

#[test]
fn test_pipeline_cache() {
    let Some(engine) = engine() else { return };
    let input = InputGenerator::new(2).uniform_f32(1024);
    for block_size in [64, 128, 64] {
        let sel = select(&input, 0.5, &options(engine.clone(), block_size)).expect("select failed");
        assert_eq!(sel.sorted(), reference_indices(&input, 0.5));
    }
    assert_eq!(engine.pipelines.lock().unwrap().len(), 2);
}

#[test]
fn test_profiling_reports_time() {
    let engine = match WebGpuEngine::with_profiling(true) {
        Ok(e) => Arc::new(e),
        Err(SelError::Unsupported) => return,
        Err(e) => panic!("Unexpected error: {:?}", e),
    };
    assert!(engine.profiling());
    let input = InputGenerator::new(8).uniform_f32(256 * 16);
    let sel = select(&input, 0.5, &options(engine, 256)).expect("select failed");
    assert!(sel.stats.elapsed > Duration::ZERO);
}
