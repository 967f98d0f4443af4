//! Criterion benchmarks for the event path.
//!
//! The poll body pushes one record per reference pulse while a reader drains the
//! buffer; both sides hold the same lock, so these numbers bound the sustainable
//! pulse rate.
//!
//! Run with: cargo bench --bench ring_buffer

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;
use tdc_daq::acquisition::DriverKind;
use tdc_daq::config::TdcConfig;
use tdc_daq::data::event::encode_hits;
use tdc_daq::data::{EventDecoder, EventRecord, EventRingBuffer};
use tdc_daq::hardware::{Hit, MockTdcCard};
use tdc_daq::{TdcDevice, WaitPolicy};

const LOCK: Duration = Duration::from_millis(1);

fn event(hits: usize) -> Vec<Hit> {
    (0..hits)
        .map(|i| Hit {
            channel: (i % 8) as u8,
            delay: (i * 997) as u16,
        })
        .collect()
}

/// Push one record and drain it again, for typical event sizes.
fn ring_buffer_push_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_push_drain");

    for hits in [1usize, 8, 32, 128] {
        let ring = EventRingBuffer::new(0xF_FFFF).unwrap();
        let mut record = Vec::new();
        encode_hits(event(hits), &mut record).unwrap();
        let mut out = vec![0u8; record.len()];

        group.throughput(Throughput::Bytes(record.len() as u64));
        group.bench_with_input(BenchmarkId::new("hits", hits), &record, |b, record| {
            b.iter(|| {
                ring.push_record(black_box(record), LOCK).unwrap();
                black_box(ring.read_into(&mut out));
            });
        });
    }

    group.finish();
}

/// Byte-at-a-time consumer against bulk reads.
fn ring_buffer_pop_vs_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_consume");
    let mut record = Vec::new();
    encode_hits(event(64), &mut record).unwrap();
    group.throughput(Throughput::Bytes(record.len() as u64));

    let ring = EventRingBuffer::new(4096).unwrap();
    group.bench_function("pop_byte", |b| {
        b.iter(|| {
            ring.push_record(&record, LOCK).unwrap();
            while let Ok(byte) = ring.pop_byte() {
                black_box(byte);
            }
        });
    });

    let ring = EventRingBuffer::new(4096).unwrap();
    let mut out = [0u8; 512];
    group.bench_function("read_into", |b| {
        b.iter(|| {
            ring.push_record(&record, LOCK).unwrap();
            while ring.read_into(&mut out) > 0 {}
        });
    });

    group.finish();
}

/// Reassemble events from a stream read in small chunks.
fn event_decode(c: &mut Criterion) {
    let events: Vec<EventRecord> = (0..256)
        .map(|i| EventRecord { hits: event(i % 17) })
        .collect();
    let stream: Vec<u8> = events.iter().flat_map(|e| e.encode().unwrap()).collect();

    let mut group = c.benchmark_group("event_decode");
    group.throughput(Throughput::Bytes(stream.len() as u64));
    group.bench_function("chunks_of_64", |b| {
        b.iter(|| {
            let mut decoder = EventDecoder::new();
            let mut count = 0;
            for chunk in stream.chunks(64) {
                decoder.extend(chunk);
                while let Some(event) = decoder.next_event() {
                    count += event.len();
                }
            }
            black_box(count)
        });
    });
    group.finish();
}

/// One full poll firing against the simulated card: status read, latch, readout,
/// decode, flush and re-arm.
fn poll_firing(c: &mut Criterion) {
    let mut config = TdcConfig::default();
    config.scheduler.driver = DriverKind::Manual;
    let mock = MockTdcCard::new();
    let device = TdcDevice::attach(Box::new(mock.clone()), &config).unwrap();
    let mut reader = device.reader().unwrap();
    device.start(None).unwrap();

    let pulse: Vec<(u8, u16)> = event(16).iter().map(|h| (h.channel, h.delay)).collect();
    let mut out = vec![0u8; 4096];
    c.bench_function("poll_firing_16_hits", |b| {
        b.iter(|| {
            mock.push_pulse(&pulse);
            black_box(device.fire());
            let _ = reader.try_read(&mut out);
        });
    });

    device.stop(WaitPolicy::BLOCK).unwrap();
}

criterion_group!(
    benches,
    ring_buffer_push_drain,
    ring_buffer_pop_vs_read,
    event_decode,
    poll_firing
);
criterion_main!(benches);
