// Latest mid price per instrument, shared between feed shards and the engine loop

use crate::types::{Instrument, PriceSample};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

/// Cloneable handle; every clone sees the same samples.
///
/// Samples are replaced whole, so a reader never observes a price from one
/// update paired with the timestamp of another.
#[derive(Debug, Clone, Default)]
pub struct PriceBook {
    samples: Arc<RwLock<HashMap<Instrument, PriceSample>>>,
}

impl PriceBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Instrument, PriceSample>> {
        self.samples.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Instrument, PriceSample>> {
        self.samples.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn publish(&self, sample: PriceSample) {
        self.write().insert(sample.instrument.clone(), sample);
    }

    pub fn get(&self, instrument: &Instrument) -> Option<PriceSample> {
        self.read().get(instrument).cloned()
    }

    pub fn snapshot(&self) -> HashMap<Instrument, PriceSample> {
        self.read().clone()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Instruments with no sample, or one older than `max_age`
    pub fn stale(&self, instruments: &[Instrument], now: DateTime<Utc>, max_age: Duration) -> Vec<Instrument> {
        let max_age_ms = max_age.as_millis() as i64;
        let samples = self.read();
        instruments
            .iter()
            .filter(|instrument| match samples.get(*instrument) {
                Some(sample) => sample.age_ms(now) > max_age_ms,
                None => true,
            })
            .cloned()
            .collect()
    }
}
