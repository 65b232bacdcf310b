//! Compilation benchmarks
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use chainforge::compiler::{compile, CompileOptions};
use chainforge::profile::{ChainBean, Profile, ProfileId, ProxyBean, SocksBean, VmessBean};
use chainforge::rule::{Rule, RuleTarget};
use chainforge::store::MemoryStore;

fn vmess(id: ProfileId) -> Profile {
    Profile {
        id,
        name: format!("vmess-{}", id),
        bean: ProxyBean::Vmess(VmessBean {
            server_address: format!("v{}.example", id),
            server_port: 443,
            uuid: "b831381d-6324-4d53-ad4f-8cda48b30811".to_string(),
            network: "ws".to_string(),
            ..Default::default()
        }),
    }
}

fn bench_compile_simple(c: &mut Criterion) {
    let mut store = MemoryStore::new();
    let root = store.insert(vmess(1));
    let opts = CompileOptions::default();

    let mut group = c.benchmark_group("compile");
    group.throughput(Throughput::Elements(1));
    group.bench_function("single_profile", |b| {
        b.iter(|| black_box(compile(&store, root, &opts).unwrap()))
    });
    group.finish();
}

fn bench_compile_chain(c: &mut Criterion) {
    let mut store = MemoryStore::new();
    for id in 1..=4 {
        store.insert(Profile {
            id,
            name: format!("socks-{}", id),
            bean: ProxyBean::Socks(SocksBean {
                server_address: format!("10.0.0.{}", id),
                server_port: 1080,
                ..Default::default()
            }),
        });
    }
    store.insert(vmess(5));
    let root = store.insert(Profile {
        id: 10,
        name: "chain".to_string(),
        bean: ProxyBean::Chain(ChainBean {
            proxies: vec![1, 2, 3, 4, 5],
        }),
    });
    let opts = CompileOptions::default();

    let mut group = c.benchmark_group("compile");
    group.bench_function("five_hop_chain", |b| {
        b.iter(|| black_box(compile(&store, root, &opts).unwrap()))
    });
    group.finish();
}

fn bench_compile_with_rules(c: &mut Criterion) {
    let mut store = MemoryStore::new();
    let root = store.insert(vmess(1));
    for i in 0..64 {
        store.push_rule(Rule {
            id: i,
            domains: vec![format!("geosite:site-{}", i)],
            target: if i % 2 == 0 {
                RuleTarget::Direct
            } else {
                RuleTarget::Proxy
            },
            ..Default::default()
        });
    }
    let opts = CompileOptions::default();

    let mut group = c.benchmark_group("compile");
    group.throughput(Throughput::Elements(64));
    group.bench_function("sixty_four_rules", |b| {
        b.iter(|| black_box(compile(&store, root, &opts).unwrap()))
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_compile_simple,
    bench_compile_chain,
    bench_compile_with_rules
);
criterion_main!(benches);
