//! Fuzz target for event stream reassembly.
//!
//! Arbitrary bytes fed in arbitrary chunks must decode to the same events as one
//! contiguous buffer, and every decoded event must re-encode to the bytes it came
//! from.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tdc_daq::data::{EventDecoder, EventRecord};

#[derive(Debug, Arbitrary)]
struct DecodeInput {
    stream: Vec<u8>,
    chunk_sizes: Vec<u8>,
}

fuzz_target!(|input: DecodeInput| {
    let mut whole = Vec::new();
    let mut rest = &input.stream[..];
    while let Some((event, used)) = EventRecord::decode(rest) {
        assert_eq!(event.encode().ok().as_deref(), Some(&rest[..used]));
        whole.push(event);
        rest = &rest[used..];
    }

    let mut decoder = EventDecoder::new();
    let mut chunked = Vec::new();
    let mut data = &input.stream[..];
    let mut sizes = input.chunk_sizes.iter().cycle();
    while !data.is_empty() {
        let size = sizes.next().map_or(data.len(), |&s| usize::from(s).max(1));
        let take = size.min(data.len());
        decoder.extend(&data[..take]);
        data = &data[take..];
        while let Some(event) = decoder.next_event() {
            chunked.push(event);
        }
    }

    assert_eq!(chunked, whole);
    assert_eq!(decoder.pending_bytes(), rest.len());
});
