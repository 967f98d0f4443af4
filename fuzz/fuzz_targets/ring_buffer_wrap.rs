//! Fuzz target for EventRingBuffer wrap-around behavior.
//!
//! Tests:
//! - Records split across the end of the data region
//! - Overflow rejection without partial writes
//! - Byte order preserved through pop_byte and read_into

#![no_main]

use std::collections::VecDeque;
use std::time::Duration;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tdc_daq::data::EventRingBuffer;
use tdc_daq::TdcError;

#[derive(Debug, Arbitrary)]
struct WrapInput {
    /// Buffer size, kept small so wrap-around happens often
    capacity: u8,
    operations: Vec<WrapOp>,
}

#[derive(Debug, Clone, Arbitrary)]
enum WrapOp {
    Push { data: Vec<u8> },
    Pop,
    Read { max: u8 },
    Reset,
}

fuzz_target!(|input: WrapInput| {
    let capacity = usize::from(input.capacity).max(2);
    let Ok(ring) = EventRingBuffer::new(capacity) else {
        return;
    };
    let mut model: VecDeque<u8> = VecDeque::new();

    for op in input.operations.iter().take(256) {
        match op {
            WrapOp::Push { data } => match ring.push_record(data, Duration::from_millis(1)) {
                Ok(()) => model.extend(data),
                Err(TdcError::Overflow { needed, free }) => {
                    assert_eq!(needed, data.len());
                    assert!(needed > free);
                    assert_eq!(free, capacity - 1 - model.len());
                }
                Err(e) => panic!("unexpected push error: {}", e),
            },
            WrapOp::Pop => match ring.pop_byte() {
                Ok(byte) => assert_eq!(Some(byte), model.pop_front()),
                Err(_) => assert!(model.is_empty()),
            },
            WrapOp::Read { max } => {
                let mut buf = vec![0u8; usize::from(*max)];
                let n = ring.read_into(&mut buf);
                let expected: Vec<u8> = model.drain(..n).collect();
                assert_eq!(&buf[..n], &expected[..]);
            }
            WrapOp::Reset => {
                ring.reset();
                model.clear();
            }
        }
        assert_eq!(ring.available_bytes(), model.len());
        assert_eq!(ring.available_bytes() + ring.free_bytes(), capacity - 1);
    }
});
