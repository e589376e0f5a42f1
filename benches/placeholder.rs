//! 占位符解析基准测试
//!
//! 测试占位符解析与配置环境查询的性能

use criterion::{criterion_group, criterion_main, Criterion};
use envkit::config::{
    Env, MapPropertySource, PropertyResolver, PropertySource, PropertySources,
    PropertySourcesPropertyResolver, RunInfo, StandardEnvironment,
};
use envkit::placeholder::{self, PlaceholderResolver};
use std::collections::HashMap;
use std::hint::black_box;
use std::sync::Arc;

fn params() -> HashMap<String, String> {
    (0..100)
        .map(|i| (format!("key{i}"), format!("value{i}")))
        .chain([
            ("host".to_string(), "localhost".to_string()),
            ("port".to_string(), "8080".to_string()),
            ("url".to_string(), "http://${host}:${port}".to_string()),
        ])
        .collect()
}

/// 占位符解析基准测试
fn placeholder_benchmark(c: &mut Criterion) {
    let params = params();
    let resolver = PlaceholderResolver::lenient();

    c.bench_function("placeholder_plain_text", |b| {
        b.iter(|| {
            resolver.resolve(black_box("no placeholders in this text"), |key| {
                params.get(key).cloned()
            })
        });
    });

    c.bench_function("placeholder_nested", |b| {
        b.iter(|| {
            resolver.resolve(
                black_box("${url}/api?k=${key42}&d=${missing:${key7}}"),
                |key| params.get(key).cloned(),
            )
        });
    });

    c.bench_function("placeholder_resolve_helper", |b| {
        b.iter(|| placeholder::resolve(black_box("${key1}-${key2}-${key3}"), &params));
    });
}

/// 配置来源查询基准测试
fn resolver_benchmark(c: &mut Criterion) {
    let sources = Arc::new(PropertySources::new());
    for layer in 0..10 {
        let properties: HashMap<String, String> = (0..100)
            .map(|i| (format!("layer{layer}.key{i}"), format!("${{layer0.key{i}}}-{layer}")))
            .collect();
        sources.add_last(Arc::new(MapPropertySource::new(format!("layer{layer}"), properties))
            as Arc<dyn PropertySource>);
    }
    let resolver = PropertySourcesPropertyResolver::new(Arc::clone(&sources), true);

    c.bench_function("resolver_lookup_last_layer", |b| {
        b.iter(|| resolver.get_property(black_box("layer9.key50")));
    });

    let dir = tempfile::TempDir::new().unwrap();
    let environment = StandardEnvironment::builder()
        .config_dir_for_all(dir.path())
        .custom_run_info(RunInfo::new(Env::Dev, "").with_work_dir(dir.path()))
        .system_environment(false)
        .args(["--server.host=localhost", "--server.port=8080"])
        .build()
        .unwrap();

    c.bench_function("environment_properties", |b| {
        b.iter(|| black_box(environment.properties()));
    });
}

criterion_group!(benches, placeholder_benchmark, resolver_benchmark);
criterion_main!(benches);
