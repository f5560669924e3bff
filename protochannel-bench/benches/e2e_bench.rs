//! End-to-end client-host benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use protochannel_client::{Client, ConnectionConfig};
use protochannel_server::demo::{self, DemoSession, Note, Ping, Pong, Upload, UploadReceipt};
use protochannel_server::{HostConfig, ProtoHost};
use std::sync::Arc;
use tokio::runtime::Runtime;

struct TestSetup {
    host: Arc<ProtoHost<DemoSession>>,
    client: Client,
}

impl Drop for TestSetup {
    fn drop(&mut self) {
        self.host.shutdown();
    }
}

fn setup_host_and_client(rt: &Runtime) -> TestSetup {
    rt.block_on(async {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let host = Arc::new(ProtoHost::new(
            HostConfig::new(addr),
            demo::service().unwrap(),
            DemoSession::new,
        ));
        let runner = host.clone();
        tokio::spawn(async move {
            let _ = runner.run_on(listener).await;
        });

        let client = Client::connect(ConnectionConfig::new(addr)).await.unwrap();
        TestSetup { host, client }
    })
}

fn bench_ping_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_host_and_client(&rt);

    let mut group = c.benchmark_group("e2e_ping");
    group.throughput(Throughput::Elements(1));

    let mut seq = 0u32;
    group.bench_function("ping", |b| {
        b.to_async(&rt).iter(|| {
            seq = seq.wrapping_add(1);
            let client = &setup.client;
            let ping = Ping {
                seq,
                text: String::new(),
            };
            async move {
                let pong: Pong = client.request(&ping).await.unwrap();
                black_box(pong)
            }
        });
    });

    group.finish();
}

fn bench_one_way(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_host_and_client(&rt);
    let note = Note {
        text: "bench".to_string(),
    };

    let mut group = c.benchmark_group("e2e_one_way");
    group.throughput(Throughput::Elements(16));

    // Requests are handled in order, so the ping bounds the queue.
    group.bench_function("notes_then_ping", |b| {
        b.to_async(&rt).iter(|| async {
            for _ in 0..15 {
                setup.client.one_way(&note).unwrap();
            }
            let pong: Pong = setup
                .client
                .request(&Ping {
                    seq: 0,
                    text: String::new(),
                })
                .await
                .unwrap();
            black_box(pong)
        });
    });

    group.finish();
}

fn bench_stream_upload(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_host_and_client(&rt);

    let mut group = c.benchmark_group("e2e_upload");
    group.sample_size(20);

    for size in [4 * 1024, 256 * 1024, 4 * 1024 * 1024] {
        let data = vec![0x42u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.to_async(&rt).iter(|| async {
                let client = &setup.client;
                let id = client
                    .send_bytes(data, "bench.bin", "application/octet-stream")
                    .await
                    .unwrap();
                let receipt: UploadReceipt = client
                    .request(&Upload {
                        stream_id: id as u32,
                    })
                    .await
                    .unwrap();
                black_box(receipt)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_ping_latency, bench_one_way, bench_stream_upload);
criterion_main!(benches);
