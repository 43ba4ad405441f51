// Position ledger: the engine's cached view of exchange positions

use crate::clients::ExchangeApi;
use crate::core::events::EventSink;
use crate::types::{Instrument, Position};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockWriteGuard};
use tracing::debug;

type PositionMap = HashMap<Instrument, Position>;

/// Copy-on-write position map.
///
/// A refresh swaps in a fresh map; readers holding the previous `Arc` keep a
/// consistent view. A failed refresh leaves the previous map in place.
pub struct PositionLedger {
    api: Arc<dyn ExchangeApi>,
    tracked: Vec<Instrument>,
    positions: RwLock<Arc<PositionMap>>,
    paper_flat: Mutex<HashSet<Instrument>>,
    last_refresh: Mutex<Option<DateTime<Utc>>>,
    events: EventSink,
}

impl PositionLedger {
    pub fn new(api: Arc<dyn ExchangeApi>, tracked: Vec<Instrument>, events: EventSink) -> Self {
        Self {
            api,
            tracked,
            positions: RwLock::new(Arc::new(HashMap::new())),
            paper_flat: Mutex::new(HashSet::new()),
            last_refresh: Mutex::new(None),
            events,
        }
    }

    pub fn tracked(&self) -> &[Instrument] {
        &self.tracked
    }

    /// Re-read positions from the exchange. Returns `false` on failure.
    pub async fn refresh(&self) -> bool {
        let mut fresh = match self.api.query_positions(&self.tracked).await {
            Ok(positions) => positions,
            Err(e) => {
                self.events.error(format!("position refresh failed: {}", e));
                return false;
            }
        };

        let open = {
            // Paper closes hold until the exchange itself reports flat.
            // The mask stays locked through the swap so a concurrent paper close is not lost.
            let mut masked = lock(&self.paper_flat);
            masked.retain(|instrument| fresh.get(instrument).map_or(false, |p| !p.is_flat()));
            for instrument in masked.iter() {
                fresh.insert(instrument.clone(), Position::flat(instrument.clone()));
            }
            let open = fresh.values().filter(|p| !p.is_flat()).count();
            *self.write() = Arc::new(fresh);
            open
        };
        *lock(&self.last_refresh) = Some(Utc::now());
        debug!("📒 Ledger refreshed: {} open positions", open);
        true
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arc<PositionMap>> {
        self.positions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached position; flat when the instrument has none
    pub fn position(&self, instrument: &Instrument) -> Position {
        self.snapshot()
            .get(instrument)
            .cloned()
            .unwrap_or_else(|| Position::flat(instrument.clone()))
    }

    pub fn snapshot(&self) -> Arc<PositionMap> {
        let current = self.positions.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&current)
    }

    pub fn open_positions(&self) -> Vec<Position> {
        let mut open: Vec<Position> = self.snapshot().values().filter(|p| !p.is_flat()).cloned().collect();
        open.sort_by(|a, b| a.instrument().cmp(b.instrument()));
        open
    }

    /// Record a simulated close. The instrument reads flat until a refresh
    /// finds the exchange flat too.
    pub fn mark_paper_flat(&self, instrument: &Instrument) {
        let mut masked = lock(&self.paper_flat);
        masked.insert(instrument.clone());
        let mut current = self.write();
        let mut positions = PositionMap::clone(&current);
        positions.insert(instrument.clone(), Position::flat(instrument.clone()));
        *current = Arc::new(positions);
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_refresh)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
