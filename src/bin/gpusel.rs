/// gpusel – run the selection kernel on random input and check the result.
///
///   gpusel                       → 655360 uniform values, limit 0.9, block 512
///   gpusel -n 1000000 --pad      → pad to a block multiple instead of failing
///   gpusel --schedule threaded   → race real threads on the CPU device
///   gpusel --webgpu --profile    → run on a wgpu adapter with GPU timestamps
use std::env;
use std::process::{self, ExitCode};

use gpusel::input::{pad_to_block, InputGenerator, DEFAULT_AMOUNT, DEFAULT_LIMIT};
use gpusel::verify::verify;
use gpusel::{select, ArrivalOrder, Schedule, SelectOptions, DEFAULT_BLOCK_SIZE};

fn usage() {
    eprintln!("gpusel - GPU stream compaction: select indices with a[i] >= limit");
    eprintln!();
    eprintln!("Usage: gpusel [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -n, --amount N          Number of input elements (default: {DEFAULT_AMOUNT})");
    eprintln!("  -l, --limit X           Selection threshold, inclusive (default: {DEFAULT_LIMIT})");
    eprintln!("  -b, --block-size B      Threads per block (default: {DEFAULT_BLOCK_SIZE})");
    eprintln!("  -e, --el-per-thread E   Elements per thread (only 1 is supported)");
    eprintln!("  -s, --seed S            Seed for the input generator (default: random)");
    eprintln!("  -t, --threads N         CPU block workers (0=auto)");
    eprintln!("  --schedule S            CPU schedule: lockstep, threaded, shuffled");
    eprintln!("  --pad                   Pad the input to a block multiple");
    eprintln!("  --opencl                Run on an OpenCL device");
    eprintln!("  --webgpu                Run on a WebGPU (wgpu) device");
    eprintln!("  --profile               Time the kernel with device timestamps");
    eprintln!("  --list-devices          List available GPU devices and exit");
    eprintln!("  -q, --quiet             Only report errors");
    eprintln!("  -v, --verbose           Debug logging");
    eprintln!("  -h, --help              Show this help");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScheduleArg {
    Lockstep,
    Threaded,
    Shuffled,
}

struct Opts {
    amount: usize,
    limit: f32,
    block_size: usize,
    el_per_thread: usize,
    seed: Option<u64>,
    threads: usize,
    schedule: ScheduleArg,
    pad: bool,
    opencl: bool,
    webgpu: bool,
    profile: bool,
    list_devices: bool,
    quiet: bool,
    verbose: bool,
}

/// Take the value following a flag, or exit.
fn value<T: std::str::FromStr>(args: &[String], i: &mut usize, flag: &str, what: &str) -> T {
    *i += 1;
    let Some(raw) = args.get(*i) else {
        eprintln!("gpusel: missing argument for {flag}");
        process::exit(1);
    };
    match raw.parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            eprintln!("gpusel: invalid {what} '{raw}'");
            process::exit(1);
        }
    }
}

fn parse_args() -> Opts {
    let args: Vec<String> = env::args().skip(1).collect();
    let mut opts = Opts {
        amount: DEFAULT_AMOUNT,
        limit: DEFAULT_LIMIT,
        block_size: DEFAULT_BLOCK_SIZE,
        el_per_thread: 1,
        seed: None,
        threads: 0,
        schedule: ScheduleArg::Lockstep,
        pad: false,
        opencl: false,
        webgpu: false,
        profile: false,
        list_devices: false,
        quiet: false,
        verbose: false,
    };

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "-n" | "--amount" => opts.amount = value(&args, &mut i, arg, "element count"),
            "-l" | "--limit" => opts.limit = value(&args, &mut i, arg, "limit"),
            "-b" | "--block-size" => opts.block_size = value(&args, &mut i, arg, "block size"),
            "-e" | "--el-per-thread" => {
                opts.el_per_thread = value(&args, &mut i, arg, "elements per thread")
            }
            "-s" | "--seed" => opts.seed = Some(value(&args, &mut i, arg, "seed")),
            "-t" | "--threads" => opts.threads = value(&args, &mut i, arg, "thread count"),
            "--schedule" => {
                let name: String = value(&args, &mut i, arg, "schedule");
                opts.schedule = match name.as_str() {
                    "lockstep" => ScheduleArg::Lockstep,
                    "threaded" => ScheduleArg::Threaded,
                    "shuffled" => ScheduleArg::Shuffled,
                    other => {
                        eprintln!("gpusel: unknown schedule '{other}'");
                        process::exit(1);
                    }
                };
            }
            "--pad" => opts.pad = true,
            "--opencl" => opts.opencl = true,
            "--webgpu" => opts.webgpu = true,
            "--profile" => opts.profile = true,
            "--list-devices" => opts.list_devices = true,
            "-q" | "--quiet" => opts.quiet = true,
            "-v" | "--verbose" => opts.verbose = true,
            "-h" | "--help" => {
                usage();
                process::exit(0);
            }
            // Combined short flags like -qv.
            s if s.starts_with('-') && !s.starts_with("--") && s.len() > 2 => {
                for ch in s[1..].chars() {
                    match ch {
                        'q' => opts.quiet = true,
                        'v' => opts.verbose = true,
                        _ => {
                            eprintln!("gpusel: unknown flag '-{ch}'");
                            process::exit(1);
                        }
                    }
                }
            }
            other => {
                eprintln!("gpusel: unexpected argument '{other}'");
                usage();
                process::exit(1);
            }
        }
        i += 1;
    }

    opts
}

fn init_logging(opts: &Opts) {
    let default = if opts.verbose {
        "debug"
    } else if opts.quiet {
        "error"
    } else {
        "warn"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

fn list_devices() {
    #[cfg(feature = "opencl")]
    {
        for d in gpusel::opencl::probe_devices() {
            println!(
                "opencl  {:<40} {:<20} {:<5} max work-group {:>5}  {} MiB",
                d.name,
                d.vendor,
                if d.is_gpu { "gpu" } else { "other" },
                d.max_work_group_size,
                d.global_mem_size >> 20
            );
        }
    }
    #[cfg(feature = "webgpu")]
    {
        for d in gpusel::webgpu::probe_devices() {
            println!(
                "webgpu  {:<40} {:<20} {:<5} max work-group {:>5}",
                d.name,
                d.vendor,
                if d.is_gpu { "gpu" } else { "other" },
                d.max_work_group_size
            );
        }
    }
    #[cfg(not(any(feature = "opencl", feature = "webgpu")))]
    eprintln!("gpusel: no GPU backends compiled in (build with --features opencl or webgpu)");
}

fn build_options(opts: &Opts, seed: u64) -> SelectOptions {
    let schedule = match opts.schedule {
        ScheduleArg::Lockstep => Schedule::Lockstep(ArrivalOrder::Ascending),
        ScheduleArg::Threaded => Schedule::Threaded,
        ScheduleArg::Shuffled => Schedule::Lockstep(ArrivalOrder::Shuffled { seed }),
    };
    let cpu = SelectOptions {
        block_size: opts.block_size,
        elements_per_thread: opts.el_per_thread,
        threads: opts.threads,
        schedule,
        ..Default::default()
    };

    #[cfg(feature = "opencl")]
    {
        if opts.opencl {
            match gpusel::opencl::OpenClEngine::with_profiling(opts.profile) {
                Ok(engine) => {
                    log::info!("using OpenCL device: {}", engine.device_name());
                    return SelectOptions {
                        backend: gpusel::Backend::OpenCl,
                        opencl_engine: Some(std::sync::Arc::new(engine)),
                        ..cpu
                    };
                }
                Err(e) => log::warn!("OpenCL requested but not available ({e}), using CPU"),
            }
        }
    }
    #[cfg(not(feature = "opencl"))]
    {
        if opts.opencl {
            log::warn!("--opencl requires the opencl feature (build with --features opencl)");
        }
    }

    #[cfg(feature = "webgpu")]
    {
        if opts.webgpu {
            match gpusel::webgpu::WebGpuEngine::with_profiling(opts.profile) {
                Ok(engine) => {
                    log::info!("using WebGPU device: {}", engine.device_name());
                    return SelectOptions {
                        backend: gpusel::Backend::WebGpu,
                        webgpu_engine: Some(std::sync::Arc::new(engine)),
                        ..cpu
                    };
                }
                Err(e) => log::warn!("WebGPU requested but not available ({e}), using CPU"),
            }
        }
    }
    #[cfg(not(feature = "webgpu"))]
    {
        if opts.webgpu {
            log::warn!("--webgpu requires the webgpu feature (build with --features webgpu)");
        }
    }

    if opts.profile {
        log::warn!("--profile has no effect on the CPU device");
    }
    cpu
}

fn run() -> Result<(), ()> {
    let opts = parse_args();
    init_logging(&opts);

    if opts.list_devices {
        list_devices();
        return Ok(());
    }

    let seed = opts.seed.unwrap_or_else(rand::random);
    log::debug!("seed {seed}");
    let mut input = InputGenerator::new(seed).uniform_f32(opts.amount);
    if opts.pad {
        input = pad_to_block(&input, opts.block_size);
    }

    let options = build_options(&opts, seed);
    let selection = select(&input, opts.limit, &options).map_err(|e| {
        eprintln!("gpusel: {e}");
    })?;

    match selection.stats.bandwidth_gbps() {
        Some(gbps) => println!("mem bw: {gbps:.3} GB/s"),
        None => println!("mem bw: n/a"),
    }
    if !opts.quiet {
        println!(
            "{} elements, {} blocks x {}, kernel {:.3} ms",
            input.len(),
            selection.config.grid_size,
            selection.config.block_size,
            selection.stats.elapsed.as_secs_f64() * 1000.0
        );
    }

    match verify(&input, opts.limit, &selection) {
        Ok(report) => {
            println!("selected {} expected {}", report.selected, report.expected);
            Ok(())
        }
        Err(e) => {
            eprintln!("gpusel: {e}");
            Err(())
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(()) => ExitCode::FAILURE,
    }
}
