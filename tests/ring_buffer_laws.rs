//! Ring buffer and event framing checked against simple models.

use std::collections::VecDeque;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tdc_daq::data::{EventDecoder, EventRecord, EventRingBuffer};
use tdc_daq::hardware::Hit;
use tdc_daq::TdcError;

const LOCK: Duration = Duration::from_millis(10);

#[test]
fn test_random_operations_match_fifo_model() {
    let mut rng = StdRng::seed_from_u64(0x7dc8);
    for capacity in [2usize, 3, 17, 64, 257] {
        let ring = EventRingBuffer::new(capacity).unwrap();
        let mut model: VecDeque<u8> = VecDeque::new();

        for _ in 0..2000 {
            match rng.gen_range(0..3) {
                0 => {
                    let len = rng.gen_range(1..=capacity);
                    let record: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                    match ring.push_record(&record, LOCK) {
                        Ok(()) => model.extend(&record),
                        Err(TdcError::Overflow { needed, free }) => {
                            assert_eq!(needed, len);
                            assert_eq!(free, capacity - 1 - model.len());
                            assert!(len > free);
                        }
                        Err(e) => panic!("unexpected push error: {}", e),
                    }
                }
                1 => match ring.pop_byte() {
                    Ok(byte) => assert_eq!(Some(byte), model.pop_front()),
                    Err(TdcError::Empty) => assert!(model.is_empty()),
                    Err(e) => panic!("unexpected pop error: {}", e),
                },
                _ => {
                    let mut buf = vec![0u8; rng.gen_range(0..capacity + 2)];
                    let n = ring.read_into(&mut buf);
                    let expected: Vec<u8> = model.drain(..n.min(model.len())).collect();
                    assert_eq!(&buf[..n], &expected[..]);
                }
            }

            assert_eq!(ring.available_bytes(), model.len());
            assert_eq!(ring.available_bytes() + ring.free_bytes(), capacity - 1);
            assert_eq!(ring.is_empty(), model.is_empty());
        }
    }
}

#[test]
fn test_overflow_leaves_contents_untouched() {
    let ring = EventRingBuffer::new(8).unwrap();
    ring.push_record(&[1, 2, 3, 4, 5], LOCK).unwrap();
    let err = ring.push_record(&[6, 7, 8], LOCK).unwrap_err();
    assert!(matches!(err, TdcError::Overflow { needed: 3, free: 2 }));

    let mut buf = [0u8; 8];
    assert_eq!(ring.read_into(&mut buf), 5);
    assert_eq!(&buf[..5], &[1, 2, 3, 4, 5]);
}

#[test]
fn test_event_record_bytes() {
    let event = EventRecord {
        hits: vec![
            Hit { channel: 2, delay: 100 },
            Hit { channel: 5, delay: 40000 },
        ],
    };
    let bytes = event.encode().unwrap();
    assert_eq!(bytes, vec![0x02, 0x02, 0x00, 0x64, 0x05, 0x9C, 0x40]);
    assert_eq!(EventRecord::decode(&bytes), Some((event, 7)));
    assert_eq!(EventRecord::decode(&bytes[..6]), None);
}

#[test]
fn test_decoder_is_independent_of_chunking() {
    let mut rng = StdRng::seed_from_u64(42);
    let events: Vec<EventRecord> = (0..50)
        .map(|_| EventRecord {
            hits: (0..rng.gen_range(0..6))
                .map(|_| Hit {
                    channel: rng.gen_range(0..8),
                    delay: rng.gen(),
                })
                .collect(),
        })
        .collect();
    let stream: Vec<u8> = events
        .iter()
        .flat_map(|e| e.encode().unwrap())
        .collect();

    for _ in 0..10 {
        let mut decoder = EventDecoder::new();
        let mut decoded = Vec::new();
        let mut rest = &stream[..];
        while !rest.is_empty() {
            let take = rng.gen_range(1..=rest.len().min(9));
            decoder.extend(&rest[..take]);
            rest = &rest[take..];
            while let Some(event) = decoder.next_event() {
                decoded.push(event);
            }
        }
        assert_eq!(decoded, events);
        assert_eq!(decoder.pending_bytes(), 0);
    }
}

#[test]
fn test_ring_carries_event_stream_across_wrap() {
    let ring = EventRingBuffer::new(10).unwrap();
    let mut decoder = EventDecoder::new();
    let mut buf = [0u8; 3];
    let mut seen = Vec::new();

    for delay in 0..20u16 {
        let event = EventRecord {
            hits: vec![Hit { channel: 1, delay }],
        };
        ring.push_record(&event.encode().unwrap(), LOCK).unwrap();
        while !ring.is_empty() {
            let n = ring.read_into(&mut buf);
            decoder.extend(&buf[..n]);
        }
        while let Some(event) = decoder.next_event() {
            seen.push(event.hits[0].delay);
        }
    }
    assert_eq!(seen, (0..20).collect::<Vec<u16>>());
}
