use std::time::Duration;

use criterion::measurement::WallTime;
use criterion::{criterion_group, criterion_main, BenchmarkGroup, BenchmarkId, Criterion, Throughput};

use gpusel::input::{InputGenerator, DEFAULT_LIMIT};
use gpusel::{select, ArrivalOrder, Schedule, SelectOptions};

const SIZES: &[usize] = &[65_536, 655_360, 4_194_304];

fn cap(group: &mut BenchmarkGroup<'_, WallTime>) {
    group.warm_up_time(Duration::from_secs(2));
    group.measurement_time(Duration::from_secs(5));
    group.sample_size(10);
}

fn bench_cpu(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_cpu");
    cap(&mut group);
    for &size in SIZES {
        let input = InputGenerator::new(0).uniform_f32(size);
        group.throughput(Throughput::Bytes((size * 4) as u64));

        for (name, schedule) in [
            ("ascending", Schedule::Lockstep(ArrivalOrder::Ascending)),
            ("shuffled", Schedule::Lockstep(ArrivalOrder::Shuffled { seed: 1 })),
        ] {
            let opts = SelectOptions {
                schedule,
                ..Default::default()
            };
            group.bench_with_input(BenchmarkId::new(name, size), &input, |b, input| {
                b.iter(|| select(input, DEFAULT_LIMIT, &opts).unwrap());
            });
        }
    }
    group.finish();
}

fn bench_cpu_threaded(c: &mut Criterion) {
    // One OS thread per logical thread: keep the grid small.
    let mut group = c.benchmark_group("select_cpu_threaded");
    cap(&mut group);
    let size = 64 * 128;
    let input = InputGenerator::new(0).uniform_f32(size);
    group.throughput(Throughput::Bytes((size * 4) as u64));
    let opts = SelectOptions {
        block_size: 128,
        schedule: Schedule::Threaded,
        ..Default::default()
    };
    group.bench_with_input(BenchmarkId::new("threaded", size), &input, |b, input| {
        b.iter(|| select(input, DEFAULT_LIMIT, &opts).unwrap());
    });
    group.finish();
}

#[cfg(feature = "opencl")]
fn bench_opencl(c: &mut Criterion) {
    let Ok(engine) = gpusel::opencl::OpenClEngine::new() else {
        return;
    };
    let opts = SelectOptions {
        backend: gpusel::Backend::OpenCl,
        block_size: 256.min(engine.max_work_group_size()),
        opencl_engine: Some(std::sync::Arc::new(engine)),
        ..Default::default()
    };
    let mut group = c.benchmark_group("select_opencl");
    cap(&mut group);
    for &size in SIZES {
        let input = InputGenerator::new(0).uniform_f32(size);
        group.throughput(Throughput::Bytes((size * 4) as u64));
        group.bench_with_input(BenchmarkId::new("select", size), &input, |b, input| {
            b.iter(|| select(input, DEFAULT_LIMIT, &opts).unwrap());
        });
    }
    group.finish();
}

#[cfg(not(feature = "opencl"))]
fn bench_opencl(_c: &mut Criterion) {}

#[cfg(feature = "webgpu")]
fn bench_webgpu(c: &mut Criterion) {
    let Ok(engine) = gpusel::webgpu::WebGpuEngine::new() else {
        return;
    };
    let opts = SelectOptions {
        backend: gpusel::Backend::WebGpu,
        block_size: 256.min(engine.max_work_group_size()),
        webgpu_engine: Some(std::sync::Arc::new(engine)),
        ..Default::default()
    };
    let mut group = c.benchmark_group("select_webgpu");
    cap(&mut group);
    for &size in SIZES {
        let input = InputGenerator::new(0).uniform_f32(size);
        group.throughput(Throughput::Bytes((size * 4) as u64));
        group.bench_with_input(BenchmarkId::new("select", size), &input, |b, input| {
            b.iter(|| select(input, DEFAULT_LIMIT, &opts).unwrap());
        });
    }
    group.finish();
}

#[cfg(not(feature = "webgpu"))]
fn bench_webgpu(_c: &mut Criterion) {}

criterion_group!(benches, bench_cpu, bench_cpu_threaded, bench_opencl, bench_webgpu);
criterion_main!(benches);
