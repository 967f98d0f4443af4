//! Per-pulse accumulator of accepted hits.

use crate::hardware::Hit;

/// Hits accepted during one poll cycle, grouped by channel.
///
/// Each channel holds at most `capacity` delays, so the total never exceeds
/// `channel_count * capacity`.
#[derive(Debug, Clone)]
pub struct EventCache {
    channels: Vec<Vec<u16>>,
    capacity: usize,
    total: usize,
}

impl EventCache {
    /// Create an empty cache for `channel_count` channels of `capacity` hits each.
    pub fn new(channel_count: usize, capacity: usize) -> Self {
        Self {
            channels: (0..channel_count)
                .map(|_| Vec::with_capacity(capacity))
                .collect(),
            capacity,
            total: 0,
        }
    }

    /// Change the shape of the cache. Contents are discarded.
    pub fn reconfigure(&mut self, channel_count: usize, capacity: usize) {
        *self = Self::new(channel_count, capacity);
    }

    /// Number of channels.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Hits a channel can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Hits accepted on `channel` so far.
    pub fn accepted(&self, channel: usize) -> usize {
        self.channels.get(channel).map_or(0, Vec::len)
    }

    /// Whether `channel` exists and still has room.
    pub fn has_room(&self, channel: usize) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|hits| hits.len() < self.capacity)
    }

    /// Append a delay to `channel`. Returns false, storing nothing, if the channel is
    /// unknown or full.
    pub fn accept(&mut self, channel: usize, delay: u16) -> bool {
        if !self.has_room(channel) {
            return false;
        }
        self.channels[channel].push(delay);
        self.total += 1;
        true
    }

    /// Total accepted hits across channels.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Whether no hit was accepted.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Accepted hits per channel, in channel order.
    pub fn per_channel(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.channels.iter().map(Vec::len).enumerate()
    }

    /// All accepted hits in channel order.
    pub fn hits(&self) -> CacheHits<'_> {
        CacheHits {
            cache: self,
            channel: 0,
            index: 0,
            remaining: self.total,
        }
    }

    /// Empty every channel.
    pub fn clear(&mut self) {
        for hits in &mut self.channels {
            hits.clear();
        }
        self.total = 0;
    }
}

/// Iterator over the hits of an [`EventCache`] in channel order.
pub struct CacheHits<'a> {
    cache: &'a EventCache,
    channel: usize,
    index: usize,
    remaining: usize,
}

impl Iterator for CacheHits<'_> {
    type Item = Hit;

    fn next(&mut self) -> Option<Hit> {
        while let Some(hits) = self.cache.channels.get(self.channel) {
            if let Some(&delay) = hits.get(self.index) {
                self.index += 1;
                self.remaining -= 1;
                return Some(Hit {
                    channel: self.channel as u8,
                    delay,
                });
            }
            self.channel += 1;
            self.index = 0;
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for CacheHits<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_is_enforced_per_channel() {
        let mut cache = EventCache::new(2, 2);
        assert!(cache.accept(0, 1));
        assert!(cache.accept(0, 2));
        assert!(!cache.accept(0, 3));
        assert!(cache.accept(1, 4));
        assert!(!cache.accept(2, 5));
        assert_eq!(cache.total(), 3);
        assert_eq!(cache.accepted(0), 2);
    }

    #[test]
    fn test_hits_in_channel_order() {
        let mut cache = EventCache::new(8, 16);
        cache.accept(5, 40000);
        cache.accept(2, 100);
        cache.accept(5, 7);

        let hits: Vec<Hit> = cache.hits().collect();
        assert_eq!(cache.hits().len(), 3);
        assert_eq!(
            hits,
            vec![
                Hit { channel: 2, delay: 100 },
                Hit { channel: 5, delay: 40000 },
                Hit { channel: 5, delay: 7 },
            ]
        );
    }

    #[test]
    fn test_clear() {
        let mut cache = EventCache::new(8, 16);
        cache.accept(1, 1);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.hits().count(), 0);
        assert_eq!(cache.channel_count(), 8);
    }
}
