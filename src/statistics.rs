use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// The type of information passed to the statistics instance.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ReceivedPkts(usize),
    DroppedPkts(usize),
    Redirects(usize),
    Unresolved(usize),
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Count {
    pub fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Process-wide datagram and redirect counters.
#[derive(Default)]
pub struct Counts {
    pub received_pkts: Count,
    pub dropped_pkts: Count,
    pub redirects: Count,
    pub unresolved: Count,
}

/// Shared by the UDP receiver and the HTTP front-end; exposed on
/// `/portal/info`.
///
/// # Example
///
/// ```
/// use house_portal::statistics::{Statistics, Stats};
///
/// let statistics = Statistics::default();
///
/// statistics.add(Stats::ReceivedPkts(1));
/// statistics.add(Stats::ReceivedPkts(1));
/// assert_eq!(statistics.counts().received_pkts.get(), 2);
/// assert_eq!(statistics.counts().redirects.get(), 0);
/// ```
#[derive(Default, Clone)]
pub struct Statistics(Arc<Counts>);

impl Statistics {
    pub fn add(&self, payload: Stats) {
        match payload {
            Stats::ReceivedPkts(value) => self.0.received_pkts.add(value),
            Stats::DroppedPkts(value) => self.0.dropped_pkts.add(value),
            Stats::Redirects(value) => self.0.redirects.add(value),
            Stats::Unresolved(value) => self.0.unresolved.add(value),
        }
    }

    pub fn counts(&self) -> &Counts {
        &self.0
    }
}
