//! Running throughput accounting, used for per-peer and per-torrent
//! statistics and for sizing the request pipeline.

/// A counter of some traffic quantity, tracking the total as well as a
/// smoothed per-second rate.
#[derive(Clone, Debug, Default)]
pub(crate) struct Counter {
    /// The total number of bytes (or other unit) recorded.
    total: u64,
    /// The amount recorded in the current one-second round.
    round: u64,
    /// The exponentially smoothed per-second rate.
    avg: f64,
    /// The largest per-round value seen.
    peak: u64,
}

impl Counter {
    pub fn add(&mut self, amount: u64) {
        self.total += amount;
        self.round += amount;
    }

    /// Closes the current one-second round, folding it into the running
    /// average. Called on the session's tick.
    pub fn tick(&mut self) {
        if self.round > self.peak {
            self.peak = self.round;
        }
        // weigh history roughly 2:1 against the newest round, reacting to
        // rate changes within a few seconds without jitter
        self.avg = self.avg * (2.0 / 3.0) + self.round as f64 / 3.0;
        self.round = 0;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// The smoothed per-second rate.
    pub fn avg(&self) -> u64 {
        self.avg.round() as u64
    }

    pub fn peak(&self) -> u64 {
        self.peak
    }
}

/// Counters for one direction of a channel, split into payload (block
/// bytes) and protocol overhead (everything else).
#[derive(Clone, Debug, Default)]
pub(crate) struct ChannelCounters {
    pub payload: Counter,
    pub protocol: Counter,
}

impl ChannelCounters {
    pub fn tick(&mut self) {
        self.payload.tick();
        self.protocol.tick();
    }

    pub fn total(&self) -> u64 {
        self.payload.total() + self.protocol.total()
    }
}

/// The full set of counters of a peer session or a torrent.
#[derive(Clone, Debug, Default)]
pub(crate) struct ThruputCounters {
    pub down: ChannelCounters,
    pub up: ChannelCounters,
    /// Bytes that failed verification and were thrown away.
    pub waste: Counter,
}

impl ThruputCounters {
    pub fn tick(&mut self) {
        self.down.tick();
        self.up.tick();
        self.waste.tick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_rounds() {
        let mut counter = Counter::default();
        counter.add(300);
        assert_eq!(counter.total(), 300);
        // the rate only appears once the round is closed
        assert_eq!(counter.avg(), 0);
        counter.tick();
        assert_eq!(counter.avg(), 100);
        assert_eq!(counter.peak(), 300);

        counter.add(300);
        counter.tick();
        assert!(counter.avg() > 100);
        assert_eq!(counter.total(), 600);
    }

    #[test]
    fn test_rate_decays() {
        let mut counter = Counter::default();
        counter.add(3000);
        counter.tick();
        let initial = counter.avg();
        for _ in 0..10 {
            counter.tick();
        }
        assert!(counter.avg() < initial / 10);
    }
}
