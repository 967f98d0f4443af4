//! Event record wire format.
//!
//! ```text
//! +-------+---------+-----------+-----------+---------+-----
//! | count | channel | delay MSB | delay LSB | channel | ...
//! +-------+---------+-----------+-----------+---------+-----
//!   1 B     1 B       1 B         1 B
//! ```
//!
//! One leading byte holds the number of hits, followed by three bytes per hit in
//! channel order: the 0-based channel index and the delay in 0.5 ns units, most
//! significant byte first.

use serde::Serialize;

use crate::error::{Result, TdcError};
use crate::hardware::Hit;

/// Bytes per serialized hit.
pub const HIT_RECORD_LEN: usize = 3;

/// Largest hit count a record can carry.
pub const MAX_EVENT_HITS: usize = u8::MAX as usize;

/// Serialized size of an event with `hits` hits.
pub fn encoded_len(hits: usize) -> usize {
    1 + HIT_RECORD_LEN * hits
}

/// Append the serialized form of `hits` to `out`.
pub fn encode_hits<I>(hits: I, out: &mut Vec<u8>) -> Result<()>
where
    I: IntoIterator<Item = Hit>,
    I::IntoIter: ExactSizeIterator,
{
    let hits = hits.into_iter();
    let count = u8::try_from(hits.len()).map_err(|_| {
        TdcError::invalid(format!(
            "event has {} hits, a record holds at most {}",
            hits.len(),
            MAX_EVENT_HITS
        ))
    })?;
    out.reserve(encoded_len(usize::from(count)));
    out.push(count);
    for hit in hits {
        out.push(hit.channel);
        out.extend_from_slice(&hit.delay.to_be_bytes());
    }
    Ok(())
}

/// One decoded event.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct EventRecord {
    /// Hits in wire order.
    pub hits: Vec<Hit>,
}

impl EventRecord {
    /// Serialize to a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(encoded_len(self.hits.len()));
        encode_hits(self.hits.iter().copied(), &mut out)?;
        Ok(out)
    }

    /// Decode one record from the front of `bytes`.
    ///
    /// Returns the record and the number of bytes it occupied, or `None` if `bytes`
    /// does not yet hold a complete record.
    pub fn decode(bytes: &[u8]) -> Option<(Self, usize)> {
        let (&count, rest) = bytes.split_first()?;
        let body = usize::from(count) * HIT_RECORD_LEN;
        let body = rest.get(..body)?;
        let hits = body
            .chunks_exact(HIT_RECORD_LEN)
            .map(|c| Hit {
                channel: c[0],
                delay: u16::from_be_bytes([c[1], c[2]]),
            })
            .collect();
        Some((Self { hits }, 1 + body.len()))
    }

    /// Number of hits.
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    /// Whether the event carries no hits.
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// Reassembles [`EventRecord`]s from a byte stream delivered in arbitrary chunks.
#[derive(Debug, Default)]
pub struct EventDecoder {
    pending: Vec<u8>,
}

impl EventDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed more bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Take the next complete record, if any.
    pub fn next_event(&mut self) -> Option<EventRecord> {
        let (record, used) = EventRecord::decode(&self.pending)?;
        self.pending.drain(..used);
        Some(record)
    }

    /// Bytes of an incomplete record still waiting for the rest.
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }
}
