use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Default)]
struct ConfigSection {
    span_size: Option<usize>,
    page_size: Option<usize>,
    small_granularity: Option<usize>,
    small_max: Option<usize>,
    medium_granularity: Option<usize>,
    large_class_count: Option<usize>,
    span_alloc_count: Option<usize>,
    map_alloc_count: Option<usize>,
    cache_limit: Option<usize>,
    large_cache_limit: Option<usize>,
    global_cache_multiplier: Option<usize>,
    large_span_overhead_mul: Option<f64>,
    split_large_spans_to_one: Option<bool>,
    split_large_spans_to_large: Option<bool>,
    recycle_large_spans: Option<bool>,
    shared_arena_batch_size: Option<usize>,
    report_leaks: Option<bool>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
}

struct ResolvedConfig {
    span_size: usize,
    span_header_size: usize,
    page_size: usize,
    small_granularity: usize,
    small_max: usize,
    medium_granularity: usize,
    medium_max: usize,
    large_class_count: usize,
    span_alloc_count: usize,
    map_alloc_count: usize,
    cache_limit: usize,
    large_cache_limit: usize,
    global_cache_multiplier: usize,
    large_span_overhead_mul: f64,
    split_large_spans_to_one: bool,
    split_large_spans_to_large: bool,
    recycle_large_spans: bool,
    shared_arena_batch_size: usize,
    report_leaks: bool,
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let span_size = cfg.span_size.unwrap_or(65536);
    // The span header must hold the Span struct; 128 bytes is asserted
    // against size_of::<Span>() in src/span.rs.
    let span_header_size = 128;
    let page_size = cfg.page_size.unwrap_or(4096);
    let small_granularity = cfg.small_granularity.unwrap_or(16);
    let small_max = cfg.small_max.unwrap_or(2048);
    let medium_granularity = cfg.medium_granularity.unwrap_or(256);
    let large_class_count = cfg.large_class_count.unwrap_or(64);
    let span_alloc_count = cfg.span_alloc_count.unwrap_or(64);
    let map_alloc_count = cfg.map_alloc_count.unwrap_or(64);
    let cache_limit = cfg.cache_limit.unwrap_or(64);
    let large_cache_limit = cfg.large_cache_limit.unwrap_or(64);
    let global_cache_multiplier = cfg.global_cache_multiplier.unwrap_or(8);
    let large_span_overhead_mul = cfg.large_span_overhead_mul.unwrap_or(0.5);
    let shared_arena_batch_size = cfg.shared_arena_batch_size.unwrap_or(8);

    assert!(
        span_size.is_power_of_two() && span_size >= 16384,
        "span_size ({}) must be a power of 2 >= 16384",
        span_size
    );
    assert!(
        page_size.is_power_of_two() && page_size >= 4096 && page_size < span_size,
        "page_size ({}) must be a power of 2 in [4096, span_size)",
        page_size
    );
    assert!(
        small_granularity.is_power_of_two() && small_granularity >= 16,
        "small_granularity ({}) must be a power of 2 >= 16 (one free-list pointer)",
        small_granularity
    );
    assert!(
        small_max.is_power_of_two() && small_max > small_granularity,
        "small_max ({}) must be a power of 2 > small_granularity",
        small_max
    );
    assert!(
        medium_granularity.is_power_of_two() && medium_granularity > small_granularity,
        "medium_granularity ({}) must be a power of 2 > small_granularity",
        medium_granularity
    );
    assert!(
        large_class_count >= 2 && large_class_count <= 256,
        "large_class_count ({}) must be in [2, 256]",
        large_class_count
    );
    assert!(span_alloc_count >= 1, "span_alloc_count must be >= 1");
    assert!(map_alloc_count >= 1, "map_alloc_count must be >= 1");
    assert!(
        cache_limit.is_power_of_two() && cache_limit > 1,
        "cache_limit ({}) must be a power of 2 > 1",
        cache_limit
    );
    assert!(
        large_cache_limit.is_power_of_two() && large_cache_limit > 1,
        "large_cache_limit ({}) must be a power of 2 > 1",
        large_cache_limit
    );
    assert!(
        global_cache_multiplier >= 1 && global_cache_multiplier.is_power_of_two(),
        "global_cache_multiplier ({}) must be a power of 2 >= 1 (global ring \
         capacities must stay powers of 2)",
        global_cache_multiplier
    );
    assert!(
        large_span_overhead_mul >= 0.0,
        "large_span_overhead_mul must be >= 0.0"
    );
    assert!(
        shared_arena_batch_size.is_power_of_two(),
        "shared_arena_batch_size ({}) must be a power of 2",
        shared_arena_batch_size
    );

    // Largest medium class must still fit at least two blocks per span, so
    // medium_max is the half-span point rounded down to the granularity.
    let span_effective = span_size - span_header_size;
    let medium_max = (span_effective / 2) & !(medium_granularity - 1);
    assert!(
        medium_max > small_max,
        "derived medium_max ({}) must exceed small_max ({})",
        medium_max,
        small_max
    );

    ResolvedConfig {
        span_size,
        span_header_size,
        page_size,
        small_granularity,
        small_max,
        medium_granularity,
        medium_max,
        large_class_count,
        span_alloc_count,
        map_alloc_count,
        cache_limit,
        large_cache_limit,
        global_cache_multiplier,
        large_span_overhead_mul,
        split_large_spans_to_one: cfg.split_large_spans_to_one.unwrap_or(true),
        split_large_spans_to_large: cfg.split_large_spans_to_large.unwrap_or(true),
        recycle_large_spans: cfg.recycle_large_spans.unwrap_or(true),
        shared_arena_batch_size,
        report_leaks: cfg.report_leaks.unwrap_or(true),
    }
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/spanalloc.toml", manifest_dir)
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    let small_class_count = cfg.small_max / cfg.small_granularity;
    let medium_class_count = (cfg.medium_max - cfg.small_max) / cfg.medium_granularity;
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const SPAN_SIZE: usize = {};\n\
         pub const SPAN_HEADER_SIZE: usize = {};\n\
         pub const SPAN_EFFECTIVE_SIZE: usize = SPAN_SIZE - SPAN_HEADER_SIZE;\n\
         pub const MOD_SPAN_SIZE: usize = SPAN_SIZE - 1;\n\
         pub const PAGE_SIZE: usize = {};\n\
         pub const PAGE_SHIFT: usize = {};\n\
         pub const SMALL_GRANULARITY: usize = {};\n\
         pub const SMALL_GRANULARITY_SHIFT: usize = {};\n\
         pub const SMALL_MAX: usize = {};\n\
         pub const SMALL_CLASS_COUNT: usize = {};\n\
         pub const MEDIUM_GRANULARITY: usize = {};\n\
         pub const MEDIUM_GRANULARITY_SHIFT: usize = {};\n\
         pub const MEDIUM_MAX: usize = {};\n\
         pub const MEDIUM_CLASS_COUNT: usize = {};\n\
         pub const SIZE_CLASS_COUNT: usize = SMALL_CLASS_COUNT + MEDIUM_CLASS_COUNT;\n\
         pub const SPAN_MAX: usize = SPAN_EFFECTIVE_SIZE;\n\
         pub const LARGE_CLASS_COUNT: usize = {};\n\
         pub const LARGE_MAX: usize = LARGE_CLASS_COUNT * SPAN_SIZE - SPAN_HEADER_SIZE;\n\
         pub const SPAN_ALLOC_COUNT: usize = {};\n\
         pub const MAP_ALLOC_COUNT: usize = {};\n\
         pub const CACHE_LIMIT: usize = {};\n\
         pub const LARGE_CACHE_LIMIT: usize = {};\n\
         pub const GLOBAL_CACHE_MULTIPLIER: usize = {};\n\
         pub const LARGE_SPAN_OVERHEAD_MUL: f64 = {:?};\n\
         pub const SPLIT_LARGE_SPANS_TO_ONE: bool = {};\n\
         pub const SPLIT_LARGE_SPANS_TO_LARGE: bool = {};\n\
         pub const RECYCLE_LARGE_SPANS: bool = {};\n\
         pub const SHARED_ARENA_BATCH_SIZE: usize = {};\n\
         pub const REPORT_LEAKS: bool = {};\n",
        cfg.span_size,
        cfg.span_header_size,
        cfg.page_size,
        cfg.page_size.trailing_zeros(),
        cfg.small_granularity,
        cfg.small_granularity.trailing_zeros(),
        cfg.small_max,
        small_class_count,
        cfg.medium_granularity,
        cfg.medium_granularity.trailing_zeros(),
        cfg.medium_max,
        medium_class_count,
        cfg.large_class_count,
        cfg.span_alloc_count,
        cfg.map_alloc_count,
        cfg.cache_limit,
        cfg.large_cache_limit,
        cfg.global_cache_multiplier,
        cfg.large_span_overhead_mul,
        cfg.split_large_spans_to_one,
        cfg.split_large_spans_to_large,
        cfg.recycle_large_spans,
        cfg.shared_arena_batch_size,
        cfg.report_leaks,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=SPANALLOC_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("SPANALLOC_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);

    // The config file is optional; every option has a default.
    let content = fs::read_to_string(&config_path).unwrap_or_default();
    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let resolved = resolve_config(&config.config);
    generate_config(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
}
