// Engine loop: commands, price fallback, exit evaluation, ledger refresh, telemetry

use crate::config::{LoopConfig, TelemetryConfig};
use crate::core::commands::Command;
use crate::core::events::{EngineEvent, EventSink, EventStream};
use crate::core::execution::{CloseOutcome, CloseReason, ExecutionCoordinator};
use crate::core::feed::FeedManager;
use crate::core::ledger::PositionLedger;
use crate::core::risk::RiskEvaluator;
use crate::core::telemetry::{EngineSnapshot, InstrumentView, TelemetrySink};
use crate::types::Side;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineExit {
    OperatorQuit,
    Interrupted,
}

pub struct EngineParts {
    pub feed: FeedManager,
    pub ledger: Arc<PositionLedger>,
    pub evaluator: Arc<RiskEvaluator>,
    pub coordinator: Arc<ExecutionCoordinator>,
    pub commands: UnboundedReceiver<Command>,
    pub events: EventSink,
    pub event_stream: EventStream,
}

pub struct Engine {
    feed: FeedManager,
    ledger: Arc<PositionLedger>,
    evaluator: Arc<RiskEvaluator>,
    coordinator: Arc<ExecutionCoordinator>,
    commands: UnboundedReceiver<Command>,
    events: EventSink,
    event_stream: EventStream,
    recent_events: VecDeque<EngineEvent>,
    event_history: usize,
    sinks: Vec<Box<dyn TelemetrySink>>,
    tick_every: Duration,
    ledger_every: Duration,
    last_ledger_refresh: Instant,
}

impl Engine {
    pub fn new(parts: EngineParts, loop_config: &LoopConfig, telemetry: &TelemetryConfig) -> Self {
        Self {
            feed: parts.feed,
            ledger: parts.ledger,
            evaluator: parts.evaluator,
            coordinator: parts.coordinator,
            commands: parts.commands,
            events: parts.events,
            event_stream: parts.event_stream,
            recent_events: VecDeque::with_capacity(telemetry.event_history),
            event_history: telemetry.event_history,
            sinks: Vec::new(),
            tick_every: Duration::from_millis(loop_config.tick_ms),
            ledger_every: Duration::from_millis(loop_config.ledger_refresh_ms),
            last_ledger_refresh: Instant::now(),
        }
    }

    pub fn add_sink(&mut self, sink: Box<dyn TelemetrySink>) {
        self.sinks.push(sink);
    }

    pub fn feed(&self) -> &FeedManager {
        &self.feed
    }

    /// Tick until the operator quits or `shutdown` resolves
    pub async fn run<S>(mut self, shutdown: S) -> EngineExit
    where
        S: Future<Output = ()>,
    {
        let mut ticker = interval(self.tick_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            let interrupted = tokio::select! {
                _ = &mut shutdown => true,
                _ = ticker.tick() => false,
            };
            // Shutdown also cuts a tick short, including a close in progress
            let outcome = if interrupted {
                None
            } else {
                tokio::select! {
                    _ = &mut shutdown => None,
                    outcome = self.tick(Utc::now()) => Some(outcome),
                }
            };

            match outcome {
                None => {
                    self.events.info("interrupt received, stopping");
                    self.collect_events();
                    return EngineExit::Interrupted;
                }
                Some(TickOutcome::Quit) => {
                    self.events.info("operator quit");
                    self.collect_events();
                    return EngineExit::OperatorQuit;
                }
                Some(TickOutcome::Continue) => {}
            }
        }
    }

    /// One pass of the loop. At most one queued command runs per tick.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        if let Ok(command) = self.commands.try_recv() {
            if self.execute(command).await == TickOutcome::Quit {
                return TickOutcome::Quit;
            }
        }

        let fallback = self.feed.refresh_stale(now).await;
        if fallback.refreshed + fallback.failed > 0 {
            debug!("REST fallback: {} refreshed, {} failed", fallback.refreshed, fallback.failed);
        }

        self.evaluate_exits().await;

        if self.last_ledger_refresh.elapsed() >= self.ledger_every {
            self.ledger.refresh().await;
            self.last_ledger_refresh = Instant::now();
        }

        self.collect_events();
        let snapshot = self.snapshot(Utc::now());
        for sink in self.sinks.iter_mut() {
            sink.publish(&snapshot);
        }
        TickOutcome::Continue
    }

    pub async fn execute(&self, command: Command) -> TickOutcome {
        match command {
            Command::Close(instrument) => {
                self.events.info(format!("command: close {}", instrument));
                let report = self.coordinator.close(&instrument, CloseReason::Manual).await;
                if report.outcome == CloseOutcome::Suppressed {
                    self.events.info(format!("{} is cooling down, try again shortly", instrument));
                }
            }
            Command::CloseAll => {
                self.events.info("command: closeall");
                let ok = self.coordinator.close_all(CloseReason::ManualAll).await;
                self.events.info(format!("closeall finished: {}", if ok { "all flat" } else { "some positions remain" }));
            }
            Command::Panic => {
                self.events.info("command: panic");
                let reports = self.coordinator.panic().await;
                let failed = reports.iter().filter(|r| !r.is_success()).count();
                if failed == 0 {
                    self.events.info(format!("panic finished: {} instruments flat", reports.len()));
                } else {
                    self.events.warn(format!("panic finished: {} of {} instruments not flat", failed, reports.len()));
                }
            }
            Command::Quit => return TickOutcome::Quit,
        }
        TickOutcome::Continue
    }

    async fn evaluate_exits(&self) {
        for instrument in self.ledger.tracked() {
            let Some(sample) = self.feed.prices().get(instrument) else {
                continue;
            };
            if sample.price <= 0.0 {
                continue;
            }
            let position = self.ledger.position(instrument);
            let decision = self.evaluator.evaluate(&position, sample.price);
            if decision.should_close {
                debug!(
                    "🎯 {} exit {} at {} (return {:?})",
                    instrument, decision.reason, sample.price, decision.ratio
                );
                self.coordinator.close(instrument, CloseReason::Exit(decision.reason)).await;
            }
        }
    }

    fn collect_events(&mut self) {
        for event in self.event_stream.drain() {
            if self.recent_events.len() == self.event_history {
                self.recent_events.pop_front();
            }
            if self.event_history > 0 {
                self.recent_events.push_back(event);
            }
        }
    }

    pub fn recent_events(&self) -> impl Iterator<Item = &EngineEvent> {
        self.recent_events.iter()
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> EngineSnapshot {
        let prices = self.feed.prices().snapshot();
        let positions = self.ledger.snapshot();

        let instruments = self
            .ledger
            .tracked()
            .iter()
            .map(|instrument| {
                let position = positions.get(instrument);
                let sample = prices.get(instrument);
                let price = sample.map(|s| s.price);
                InstrumentView {
                    instrument: instrument.clone(),
                    side: position.map_or(Side::None, |p| p.side()),
                    quantity: position.map_or(0.0, |p| p.quantity()),
                    entry_price: position.map_or(0.0, |p| p.entry_price()),
                    price,
                    price_source: sample.map(|s| s.source),
                    price_age_ms: sample.map(|s| s.age_ms(now)),
                    unrealized_return: position.zip(price).and_then(|(p, px)| p.unrealized_return(px)),
                    trailing_peak: self.evaluator.trailing_peak(instrument),
                    cooling_down: self.coordinator.in_cooldown(instrument),
                }
            })
            .collect();

        EngineSnapshot {
            generated_at: now,
            mode: self.coordinator.mode(),
            shard_count: self.feed.shards().len(),
            ledger_refreshed_at: self.ledger.last_refresh(),
            instruments,
            recent_events: self.recent_events.iter().cloned().collect(),
        }
    }
}
