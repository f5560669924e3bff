//! Ring buffer and package framing benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use protochannel_protocol::{
    read_message, write_message_package, write_stream_package, MessageHeader, MessageKind,
    PackageReader, RingBuffer, StreamHeader, StreamPackageKind, StreamRequest, MESSAGE_HEADER_SIZE,
    STREAM_HEADER_SIZE,
};

fn create_test_message(payload_size: usize) -> StreamRequest {
    StreamRequest {
        length: payload_size as u64,
        stream_name: "x".repeat(payload_size),
        content_type: "application/octet-stream".to_string(),
    }
}

fn bench_ring_write_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_write_read");

    for size in [100, 4096, 65536] {
        let data = vec![0xA5u8; size];
        let mut out = vec![0u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            let mut ring = RingBuffer::new();
            b.iter(|| {
                let start = ring.position();
                ring.write(data);
                ring.set_position(start);
                ring.read(&mut out).unwrap();
                ring.set_head(ring.position());
                black_box(&out);
            });
        });
    }

    group.finish();
}

fn bench_message_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_encode");

    for size in [100, 1000, 10000] {
        let message = create_test_message(size);
        let header = MessageHeader::new(MessageKind::Request, 42, 7);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &message, |b, message| {
            let mut ring = RingBuffer::new();
            b.iter(|| {
                write_message_package(&mut ring, &header, message).unwrap();
                let end = ring.position();
                ring.set_head(end);
            });
        });
    }

    group.finish();
}

fn bench_message_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_decode");

    for size in [100, 1000, 10000] {
        let message = create_test_message(size);
        let header = MessageHeader::new(MessageKind::Request, 42, 7);
        let mut encoded = RingBuffer::new();
        write_message_package(&mut encoded, &header, &message).unwrap();
        let mut bytes = vec![0u8; encoded.length() as usize];
        encoded.set_position(0);
        encoded.read(&mut bytes).unwrap();

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &bytes, |b, bytes| {
            b.iter(|| {
                let mut ring = RingBuffer::new();
                ring.write(bytes);
                ring.set_position(0);
                let package = PackageReader::new().next(&mut ring).unwrap().unwrap();
                let header = MessageHeader::read(&mut ring).unwrap();
                let body_len = package.length as usize - MESSAGE_HEADER_SIZE;
                let decoded: StreamRequest = read_message(&mut ring, body_len).unwrap();
                black_box((header, decoded))
            });
        });
    }

    group.finish();
}

fn bench_stream_packages(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_packages");

    for chunk in [1024, 16 * 1024, 256 * 1024] {
        let data = vec![0x5Au8; chunk];
        let header = StreamHeader::new(StreamPackageKind::Data, 3);

        group.throughput(Throughput::Bytes(chunk as u64));
        group.bench_with_input(BenchmarkId::from_parameter(chunk), &data, |b, data| {
            let mut ring = RingBuffer::new();
            let mut sink = Vec::with_capacity(chunk);
            b.iter(|| {
                let start = ring.position();
                write_stream_package(&mut ring, &header, data).unwrap();
                ring.set_position(start);
                let package = PackageReader::new().next(&mut ring).unwrap().unwrap();
                StreamHeader::read(&mut ring).unwrap();
                sink.clear();
                ring.read_to(&mut sink, package.length as u64 - STREAM_HEADER_SIZE as u64).unwrap();
                ring.set_head(ring.position());
                black_box(sink.len())
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_ring_write_read,
    bench_message_encode,
    bench_message_decode,
    bench_stream_packages,
);
criterion_main!(benches);
