// Close execution: paper and live executors plus the coordinator that
// serialises closes per instrument

use crate::clients::ExchangeApi;
use crate::config::ExecutionConfig;
use crate::core::events::{EventLevel, EventSink, ExecutionContext};
use crate::core::ledger::PositionLedger;
use crate::core::retry::{Attempt, LinearBackoff, RetryError, RetryPolicy};
use crate::core::risk::{ExitReason, RiskEvaluator};
use crate::error::ExchangeError;
use crate::types::{Instrument, Position, TradingMode};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Why a close was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Exit(ExitReason),
    Manual,
    ManualAll,
    Panic,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Exit(reason) => f.write_str(reason.code()),
            CloseReason::Manual => f.write_str("manual"),
            CloseReason::ManualAll => f.write_str("manual_all"),
            CloseReason::Panic => f.write_str("panic"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    /// Nothing to do; the position was already flat
    AlreadyFlat,
    /// Skipped: the instrument is cooling down after a recent attempt
    Suppressed,
    Flattened {
        order_id: Option<String>,
        quantity: f64,
        attempts: u32,
    },
    /// Attempts ran out with exposure left
    Residual { remaining: f64, attempts: u32 },
    Failed { error: String, attempts: u32 },
}

impl CloseOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CloseOutcome::AlreadyFlat | CloseOutcome::Flattened { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloseReport {
    pub instrument: Instrument,
    pub reason: CloseReason,
    pub outcome: CloseOutcome,
}

impl CloseReport {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Turns an open position into a flat one, for real or on paper
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    fn mode(&self) -> TradingMode;

    async fn flatten(&self, position: &Position, reason: CloseReason, ledger: &PositionLedger) -> CloseOutcome;
}

/// Simulated closes: no orders, the ledger is marked flat
pub struct PaperExecutor;

#[async_trait]
impl OrderExecutor for PaperExecutor {
    fn mode(&self) -> TradingMode {
        TradingMode::Paper
    }

    async fn flatten(&self, position: &Position, _reason: CloseReason, ledger: &PositionLedger) -> CloseOutcome {
        ledger.mark_paper_flat(position.instrument());
        CloseOutcome::Flattened {
            order_id: None,
            quantity: position.quantity().abs(),
            attempts: 1,
        }
    }
}

#[derive(Debug, Error)]
enum CloseError {
    #[error("{remaining} still open")]
    Residual { remaining: f64 },

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

struct CloseProgress {
    position: Position,
    order_id: Option<String>,
    attempts: u32,
}

/// Reduce-only market orders, re-reading the position after each one
pub struct LiveExecutor {
    api: Arc<dyn ExchangeApi>,
    retry: RetryPolicy,
    settle: Duration,
    max_retry_after: Duration,
    flat_epsilon: f64,
    events: EventSink,
}

impl LiveExecutor {
    pub fn new(api: Arc<dyn ExchangeApi>, config: &ExecutionConfig, events: EventSink) -> Self {
        Self {
            api,
            retry: RetryPolicy::new(
                config.max_attempts,
                LinearBackoff { step: Duration::from_millis(config.retry_backoff_ms) },
            ),
            settle: config.settle(),
            max_retry_after: config.max_retry_after(),
            flat_epsilon: config.flat_epsilon,
            events,
        }
    }

    async fn attempt_once(
        &self,
        progress: &Mutex<CloseProgress>,
        reason: CloseReason,
        attempt: u32,
        ledger: &PositionLedger,
    ) -> Result<Option<String>, CloseError> {
        let position = {
            let mut progress = lock(progress);
            progress.attempts = attempt;
            progress.position.clone()
        };
        let instrument = position.instrument();
        let Some(side) = position.side().closing_order_side() else {
            return Ok(lock(progress).order_id.clone());
        };

        let rules = self.api.instrument_rules(instrument).await?;
        let quantity = rules.normalize(position.quantity());
        let order = match self.api.place_reduce_only_market_order(instrument, quantity, side).await {
            Ok(order) => order,
            Err(e) => {
                if matches!(e, ExchangeError::Rejected { .. }) {
                    self.api.invalidate_rules(instrument);
                }
                return Err(e.into());
            }
        };
        let reason_code = reason.to_string();
        self.events.emit_execution(
            EventLevel::Info,
            &ExecutionContext {
                instrument,
                qty: quantity,
                reason: &reason_code,
                order_id: Some(&order.client_order_id),
            },
            format!(
                "[REAL] {} {} {} order={} attempt={} reason={}",
                side,
                rules.format_quantity(quantity),
                instrument,
                order.client_order_id,
                attempt,
                reason
            ),
        );
        lock(progress).order_id = Some(order.order_id);

        sleep(self.settle).await;
        ledger.refresh().await;
        let current = ledger.position(instrument);
        let mut progress = lock(progress);
        if current.is_flat_within(self.flat_epsilon) {
            return Ok(progress.order_id.clone());
        }
        let remaining = current.quantity().abs();
        progress.position = current;
        Err(CloseError::Residual { remaining })
    }
}

#[async_trait]
impl OrderExecutor for LiveExecutor {
    fn mode(&self) -> TradingMode {
        TradingMode::Real
    }

    async fn flatten(&self, position: &Position, reason: CloseReason, ledger: &PositionLedger) -> CloseOutcome {
        let progress = Mutex::new(CloseProgress {
            position: position.clone(),
            order_id: None,
            attempts: 0,
        });

        let result = self
            .retry
            .run(|attempt| {
                let progress = &progress;
                async move {
                    match self.attempt_once(progress, reason, attempt, ledger).await {
                        Ok(order_id) => Attempt::Done(order_id),
                        Err(CloseError::Exchange(e)) if !e.is_retryable() => Attempt::Abort(CloseError::Exchange(e)),
                        Err(CloseError::Exchange(e)) => match e.retry_after() {
                            // A ban longer than the cap is left to a later tick
                            Some(hint) if hint > self.max_retry_after => Attempt::Abort(CloseError::Exchange(e)),
                            Some(hint) => Attempt::RetryAfter(CloseError::Exchange(e), hint),
                            None => Attempt::Retry(CloseError::Exchange(e)),
                        },
                        Err(residual) => Attempt::Retry(residual),
                    }
                }
            })
            .await;

        match result {
            Ok(order_id) => CloseOutcome::Flattened {
                order_id,
                quantity: position.quantity().abs(),
                attempts: lock(&progress).attempts,
            },
            Err(RetryError::Exhausted { attempts, last: CloseError::Residual { remaining } }) => {
                CloseOutcome::Residual { remaining, attempts }
            }
            Err(err) => {
                let attempts = err.attempts();
                CloseOutcome::Failed {
                    error: err.into_inner().to_string(),
                    attempts,
                }
            }
        }
    }
}

pub fn executor_for(
    mode: TradingMode,
    api: Arc<dyn ExchangeApi>,
    config: &ExecutionConfig,
    events: EventSink,
) -> Arc<dyn OrderExecutor> {
    match mode {
        TradingMode::Paper => Arc::new(PaperExecutor),
        TradingMode::Real => Arc::new(LiveExecutor::new(api, config, events)),
    }
}

/// Single entry point for every close.
///
/// Holds the per-instrument cooldown so that repeated triggers inside the
/// window place at most one order, and reports every outcome to the event log.
pub struct ExecutionCoordinator {
    ledger: Arc<PositionLedger>,
    executor: Arc<dyn OrderExecutor>,
    evaluator: Arc<RiskEvaluator>,
    cooldown: Duration,
    cooldowns: Mutex<HashMap<Instrument, Instant>>,
    events: EventSink,
}

impl ExecutionCoordinator {
    pub fn new(
        ledger: Arc<PositionLedger>,
        executor: Arc<dyn OrderExecutor>,
        evaluator: Arc<RiskEvaluator>,
        cooldown: Duration,
        events: EventSink,
    ) -> Self {
        Self {
            ledger,
            executor,
            evaluator,
            cooldown,
            cooldowns: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn mode(&self) -> TradingMode {
        self.executor.mode()
    }

    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.ledger
    }

    /// Claim the instrument's cooldown slot; `false` while a previous claim is live
    fn try_claim(&self, instrument: &Instrument) -> bool {
        let now = Instant::now();
        let mut cooldowns = lock(&self.cooldowns);
        match cooldowns.get(instrument) {
            Some(until) if *until > now => false,
            _ => {
                cooldowns.insert(instrument.clone(), now + self.cooldown);
                true
            }
        }
    }

    fn release(&self, instrument: &Instrument) {
        lock(&self.cooldowns).remove(instrument);
    }

    pub fn in_cooldown(&self, instrument: &Instrument) -> bool {
        lock(&self.cooldowns)
            .get(instrument)
            .map_or(false, |until| *until > Instant::now())
    }

    pub async fn close(&self, instrument: &Instrument, reason: CloseReason) -> CloseReport {
        let report = |outcome| CloseReport {
            instrument: instrument.clone(),
            reason,
            outcome,
        };

        if !self.try_claim(instrument) {
            if self.ledger.position(instrument).is_flat() {
                return report(CloseOutcome::AlreadyFlat);
            }
            debug!("⏳ {} close suppressed by cooldown ({})", instrument, reason);
            return report(CloseOutcome::Suppressed);
        }

        // Decide on fresh data; a failed refresh falls back to the cached view
        self.ledger.refresh().await;
        let position = self.ledger.position(instrument);
        if position.is_flat() {
            self.release(instrument);
            self.evaluator.clear(instrument);
            if !matches!(reason, CloseReason::Exit(_)) {
                self.events.info(format!("{} already flat ({})", instrument, reason));
            }
            return report(CloseOutcome::AlreadyFlat);
        }

        let mode = self.executor.mode();
        let outcome = self.executor.flatten(&position, reason, &self.ledger).await;
        let reason_code = reason.to_string();
        let mut context = ExecutionContext {
            instrument,
            qty: position.quantity().abs(),
            reason: &reason_code,
            order_id: None,
        };
        match &outcome {
            CloseOutcome::Flattened { order_id, quantity, .. } => {
                self.evaluator.clear(instrument);
                context.qty = *quantity;
                context.order_id = order_id.as_deref();
                self.events.emit_execution(
                    EventLevel::Close,
                    &context,
                    format!(
                        "[{}] {} {} qty={} reason={}{}",
                        mode,
                        instrument,
                        position.side(),
                        quantity,
                        reason,
                        order_id.as_ref().map(|id| format!(" order={}", id)).unwrap_or_default()
                    ),
                );
            }
            CloseOutcome::Residual { remaining, attempts } => {
                context.qty = *remaining;
                self.events.emit_execution(
                    EventLevel::Warn,
                    &context,
                    format!(
                        "{} still open after {} attempts: {} remaining (reason={})",
                        instrument, attempts, remaining, reason
                    ),
                );
            }
            CloseOutcome::Failed { error, attempts } => {
                self.events.emit_execution(
                    EventLevel::Error,
                    &context,
                    format!("close {} failed after {} attempts: {} (reason={})", instrument, attempts, error, reason),
                );
            }
            CloseOutcome::AlreadyFlat | CloseOutcome::Suppressed => {}
        }
        report(outcome)
    }

    /// Close every tracked instrument in turn. `true` only if all succeeded.
    pub async fn close_all(&self, reason: CloseReason) -> bool {
        let mut all_ok = true;
        for instrument in self.ledger.tracked() {
            let report = self.close(instrument, reason).await;
            all_ok &= report.is_success();
        }
        all_ok
    }

    /// Close every tracked instrument concurrently and wait for all of them
    pub async fn panic(self: &Arc<Self>) -> Vec<CloseReport> {
        let instruments = self.ledger.tracked().to_vec();
        self.events.warn(format!("PANIC: closing {} instruments", instruments.len()));

        let tasks = instruments.iter().cloned().map(|instrument| {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move { coordinator.close(&instrument, CloseReason::Panic).await })
        });
        let results = join_all(tasks).await;

        instruments
            .into_iter()
            .zip(results)
            .map(|(instrument, result)| {
                result.unwrap_or_else(|e| CloseReport {
                    instrument,
                    reason: CloseReason::Panic,
                    outcome: CloseOutcome::Failed {
                        error: format!("close task failed: {}", e),
                        attempts: 0,
                    },
                })
            })
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
