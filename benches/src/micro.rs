/// Interposition-overhead microbenchmarks for leakwatch.
///
/// The agent is linked in directly, so every call below goes through the
/// exported entry points exactly as a preloaded victim's would. Run once
/// normally and once with LEAKWATCH_DISABLE=1 for the passthrough
/// baseline; the delta is the tracking cost per operation.
use std::ffi::c_void;
use std::hint::black_box;
use std::time::Instant;

// Force the linker to pull in leakwatch's rlib object code (its no_mangle
// extern "C" entry points are otherwise never referenced at the Rust level).
use leakwatch as _;

extern "C" {
    fn malloc(size: usize) -> *mut u8;
    fn free(ptr: *mut u8);
    fn calloc(nmemb: usize, size: usize) -> *mut u8;
    fn realloc(ptr: *mut u8, size: usize) -> *mut u8;
    fn update_access(ptr: *mut c_void);
    fn set_staleness_threshold_seconds(seconds: f64);
    fn get_stats(out_allocs: *mut u64, out_frees: *mut u64, out_current: *mut u64);
}

fn mode_name() -> &'static str {
    if std::env::var_os("LEAKWATCH_DISABLE").is_some() {
        "passthrough"
    } else {
        "tracking"
    }
}

/// Measure malloc/free latency for a given size, N iterations.
fn bench_malloc_free(size: usize, iterations: usize) -> f64 {
    // Warmup
    for _ in 0..1000 {
        unsafe {
            let ptr = malloc(black_box(size));
            std::ptr::write_bytes(ptr, 0xAB, size.min(64));
            free(black_box(ptr));
        }
    }
    let start = Instant::now();
    for _ in 0..iterations {
        unsafe {
            let ptr = malloc(black_box(size));
            std::ptr::write_bytes(ptr, 0xAB, size.min(64));
            free(black_box(ptr));
        }
    }
    start.elapsed().as_nanos() as f64 / iterations as f64
}

/// Measure calloc/free latency.
fn bench_calloc_free(size: usize, iterations: usize) -> f64 {
    let start = Instant::now();
    for _ in 0..iterations {
        unsafe {
            let ptr = calloc(black_box(1), black_box(size));
            free(black_box(ptr));
        }
    }
    start.elapsed().as_nanos() as f64 / iterations as f64
}

/// Measure the realloc growing pattern (always a copy in this agent).
fn bench_realloc_grow(iterations: usize) -> f64 {
    let start = Instant::now();
    for _ in 0..iterations {
        unsafe {
            let mut ptr = malloc(black_box(16));
            for &size in black_box(&[32usize, 64, 128, 256, 512, 1024]) {
                ptr = realloc(black_box(ptr), size);
            }
            free(black_box(ptr));
        }
    }
    start.elapsed().as_nanos() as f64 / iterations as f64
}

/// Measure update_access on a live allocation: the access-sampling hot path.
fn bench_update_access(iterations: usize) -> f64 {
    unsafe {
        let ptr = malloc(256);
        let start = Instant::now();
        for _ in 0..iterations {
            update_access(black_box(ptr as *mut c_void));
        }
        let ns = start.elapsed().as_nanos() as f64 / iterations as f64;
        free(ptr);
        ns
    }
}

/// Measure multi-threaded malloc/free throughput.
fn bench_threaded_throughput(num_threads: usize, ops_per_thread: usize, size: usize) -> f64 {
    let start = Instant::now();
    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            std::thread::spawn(move || {
                for _ in 0..ops_per_thread {
                    unsafe {
                        let ptr = malloc(black_box(size));
                        std::ptr::write_bytes(ptr, 0xCD, size.min(16));
                        free(black_box(ptr));
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    let total_ops = num_threads * ops_per_thread;
    total_ops as f64 / start.elapsed().as_secs_f64() // ops/sec
}

fn main() {
    let iterations = 1_000_000;
    let mode = mode_name();

    // Keep the scanner quiet while timing.
    unsafe { set_staleness_threshold_seconds(3600.0) };

    println!("=== leakwatch microbenchmarks ({}) ===\n", mode);

    let mut latencies: Vec<(usize, f64)> = Vec::new();
    let mut key_throughput_1t = 0.0f64;
    let mut key_throughput_4t = 0.0f64;

    println!("--- malloc/free latency (ns/op) ---");
    for &size in &[16, 32, 64, 128, 256, 1024, 4096, 65536] {
        let ns = bench_malloc_free(size, iterations);
        println!("  size={:>8}: {:>8.1} ns", size, ns);
        latencies.push((size, ns));
    }

    println!("\n--- calloc/free latency (ns/op) ---");
    for &size in &[16, 64, 256, 1024, 4096] {
        let ns = bench_calloc_free(size, iterations);
        println!("  size={:>8}: {:>8.1} ns", size, ns);
    }

    println!("\n--- realloc grow pattern (ns/op) ---");
    let ns = bench_realloc_grow(iterations / 10);
    println!("  16->1024: {:.1} ns", ns);

    println!("\n--- update_access latency (ns/op) ---");
    let ns = bench_update_access(iterations);
    println!("  live ptr: {:.1} ns", ns);

    println!("\n--- multi-threaded throughput (Mops/sec) ---");
    for &threads in &[1, 2, 4, 8] {
        let ops_sec = bench_threaded_throughput(threads, iterations / threads, 64);
        let mops = ops_sec / 1_000_000.0;
        println!("  threads={}: {:>6.2} Mops/sec", threads, mops);
        if threads == 1 {
            key_throughput_1t = mops;
        }
        if threads == 4 {
            key_throughput_4t = mops;
        }
    }

    let mut allocs = 0u64;
    let mut frees = 0u64;
    let mut current = 0u64;
    unsafe { get_stats(&mut allocs, &mut frees, &mut current) };
    println!(
        "\n--- agent stats ---\n  allocs={} frees={} current={} bytes",
        allocs, frees, current
    );

    // Machine-parseable summary line for the comparison runner.
    print!("\nSUMMARY|{}", mode);
    for &(size, ns) in &latencies {
        print!("|latency_{}={:.1}", size, ns);
    }
    println!(
        "|throughput_1t={:.2}|throughput_4t={:.2}",
        key_throughput_1t, key_throughput_4t
    );

    println!("\nDone.");
}
