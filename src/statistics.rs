use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ahash::AHashMap;
use parking_lot::RwLock;

/// The type of information passed in the statistics channel.
#[derive(Debug, Clone, Copy)]
pub enum Stats {
    ReceivedBytes(usize),
    SendBytes(usize),
    ReceivedPkts(usize),
    SendPkts(usize),
    ErrorPkts(usize),
    NackPkts(usize),
    PliPkts(usize),
    FirPkts(usize),
}

pub trait Number {
    fn add(&self, value: usize);
    fn get(&self) -> usize;
}

#[derive(Default)]
pub struct Count(AtomicUsize);

impl Number for Count {
    fn add(&self, value: usize) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-connection counters.
pub struct Counts<T> {
    pub received_bytes: T,
    pub send_bytes: T,
    pub received_pkts: T,
    pub send_pkts: T,
    pub error_pkts: T,
    pub nack_pkts: T,
    pub pli_pkts: T,
    pub fir_pkts: T,
}

impl<T: Number> Counts<T> {
    /// # Example
    ///
    /// ```
    /// use sfu_server::statistics::*;
    ///
    /// let counts = Counts {
    ///     received_bytes: Count::default(),
    ///     send_bytes: Count::default(),
    ///     received_pkts: Count::default(),
    ///     send_pkts: Count::default(),
    ///     error_pkts: Count::default(),
    ///     nack_pkts: Count::default(),
    ///     pli_pkts: Count::default(),
    ///     fir_pkts: Count::default(),
    /// };
    ///
    /// counts.add(&Stats::ReceivedBytes(1));
    /// assert_eq!(counts.received_bytes.get(), 1);
    ///
    /// counts.add(&Stats::PliPkts(1));
    /// assert_eq!(counts.pli_pkts.get(), 1);
    /// ```
    pub fn add(&self, payload: &Stats) {
        match payload {
            Stats::ReceivedBytes(v) => self.received_bytes.add(*v),
            Stats::ReceivedPkts(v) => self.received_pkts.add(*v),
            Stats::SendBytes(v) => self.send_bytes.add(*v),
            Stats::SendPkts(v) => self.send_pkts.add(*v),
            Stats::ErrorPkts(v) => self.error_pkts.add(*v),
            Stats::NackPkts(v) => self.nack_pkts.add(*v),
            Stats::PliPkts(v) => self.pli_pkts.add(*v),
            Stats::FirPkts(v) => self.fir_pkts.add(*v),
        }
    }
}

impl Default for Counts<Count> {
    fn default() -> Self {
        Self {
            received_bytes: Count::default(),
            send_bytes: Count::default(),
            received_pkts: Count::default(),
            send_pkts: Count::default(),
            error_pkts: Count::default(),
            nack_pkts: Count::default(),
            pli_pkts: Count::default(),
            fir_pkts: Count::default(),
        }
    }
}

/// Connection statistics registry.
#[derive(Clone, Default)]
pub struct Statistics(Arc<RwLock<AHashMap<String, Counts<Count>>>>);

impl Statistics {
    /// Get a reporter handle the loops can clone freely.
    ///
    /// # Example
    ///
    /// ```
    /// use sfu_server::statistics::*;
    ///
    /// let statistics = Statistics::default();
    /// statistics.register("publisher-1".to_string());
    ///
    /// let reporter = statistics.get_reporter();
    /// reporter.send("publisher-1", &[Stats::ReceivedBytes(100)]);
    ///
    /// assert_eq!(statistics.get("publisher-1").unwrap().received_bytes, 100);
    /// ```
    pub fn get_reporter(&self) -> StatisticsReporter {
        StatisticsReporter {
            table: self.0.clone(),
        }
    }

    /// Add a connection to the watch list.
    pub fn register(&self, id: String) {
        self.0.write().insert(id, Counts::default());
    }

    /// Remove a connection from the watch list.
    pub fn unregister(&self, id: &str) {
        self.0.write().remove(id);
    }

    /// Snapshot one connection's counters.
    pub fn get(&self, id: &str) -> Option<Counts<usize>> {
        self.0.read().get(id).map(|counts| Counts {
            received_bytes: counts.received_bytes.get(),
            received_pkts: counts.received_pkts.get(),
            send_bytes: counts.send_bytes.get(),
            send_pkts: counts.send_pkts.get(),
            error_pkts: counts.error_pkts.get(),
            nack_pkts: counts.nack_pkts.get(),
            pli_pkts: counts.pli_pkts.get(),
            fir_pkts: counts.fir_pkts.get(),
        })
    }
}

/// Statistics reporter.
///
/// It is held by each loop; updates for unregistered connections fall
/// on the floor.
#[derive(Clone)]
pub struct StatisticsReporter {
    table: Arc<RwLock<AHashMap<String, Counts<Count>>>>,
}

impl StatisticsReporter {
    pub fn send(&self, id: &str, reports: &[Stats]) {
        if let Some(counts) = self.table.read().get(id) {
            for item in reports {
                counts.add(item);
            }
        }
    }
}
