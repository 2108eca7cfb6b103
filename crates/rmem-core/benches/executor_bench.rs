use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use rmem_core::ops::{check_inline, check_read};
use rmem_core::{Client, ClientConfig, RemoteTarget, Server, ServerConfig};
use rmem_transport::{Fabric, SoftFabric};
use std::sync::Arc;

fn connected(port: u16) -> (Server, Client) {
    let fabric = SoftFabric::in_memory();
    let shared: Arc<dyn Fabric> = Arc::new(fabric.clone());
    let server = Server::bind(shared, ServerConfig::default(), port).unwrap();
    let addr = format!("127.0.0.1:{}", server.port()).parse().unwrap();
    let client = Client::connect(&fabric, addr, &ClientConfig::default()).unwrap();
    (server, client)
}

fn bench_bounds_checks(c: &mut Criterion) {
    let target = RemoteTarget {
        addr: 0x7f3a_0000_0000,
        rkey: 0x1000,
        length: 1024 * 1024,
    };

    let mut group = c.benchmark_group("bounds");
    group.bench_function("check_inline", |b| {
        b.iter(|| check_inline(black_box(&target), black_box(4096), 5, 64))
    });
    group.bench_function("check_read", |b| {
        b.iter(|| check_read(black_box(&target), black_box(4096), 4096, 65536))
    });
    group.finish();
}

fn bench_remote_ops(c: &mut Criterion) {
    let (server, client) = connected(51000);
    let payload = vec![0x5a; 4096];

    let mut group = c.benchmark_group("remote_ops");
    group.throughput(Throughput::Bytes(64));
    group.bench_function("write_inline_64", |b| {
        b.iter(|| client.write_inline(black_box(0), b"bench").unwrap())
    });

    group.throughput(Throughput::Bytes(payload.len() as u64));
    group.bench_function("write_4k", |b| {
        b.iter(|| client.write(black_box(0), &payload).unwrap())
    });
    group.bench_function("read_4k", |b| {
        b.iter(|| client.read(black_box(0), 4096).unwrap())
    });
    group.finish();

    client.disconnect().unwrap();
    server.shutdown();
}

criterion_group!(benches, bench_bounds_checks, bench_remote_ops);
criterion_main!(benches);
