// Exit rule evaluation: stop-loss, take-profit and trailing stop

use crate::types::{Instrument, Position, Side};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Exit thresholds as positive fractions. `None` disables a rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExitThresholds {
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub trailing: Option<f64>,
}

impl ExitThresholds {
    /// Zero, negative or non-finite values leave the rule unset
    pub fn from_fractions(stop_loss: f64, take_profit: f64, trailing: f64) -> Self {
        let enabled = |value: f64| (value.is_finite() && value > 0.0).then_some(value);
        Self {
            stop_loss: enabled(stop_loss),
            take_profit: enabled(take_profit),
            trailing: enabled(trailing),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stop_loss.is_none() && self.take_profit.is_none() && self.trailing.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExitReason {
    NoPosition,
    StopLoss,
    TakeProfit,
    TrailingArmed,
    TrailingStop,
    Hold,
}

impl ExitReason {
    pub fn code(&self) -> &'static str {
        match self {
            ExitReason::NoPosition => "NO_POS",
            ExitReason::StopLoss => "SL",
            ExitReason::TakeProfit => "TP",
            ExitReason::TrailingArmed => "TR_ARMED",
            ExitReason::TrailingStop => "TR_STOP",
            ExitReason::Hold => "HOLD",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitDecision {
    pub should_close: bool,
    pub reason: ExitReason,
    /// Signed return against entry, when one could be computed
    pub ratio: Option<f64>,
}

impl ExitDecision {
    fn close(reason: ExitReason, ratio: f64) -> Self {
        Self { should_close: true, reason, ratio: Some(ratio) }
    }

    fn keep(reason: ExitReason, ratio: Option<f64>) -> Self {
        Self { should_close: false, reason, ratio }
    }
}

/// Best price seen since take-profit armed the trail
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingState {
    pub peak_price: f64,
}

/// Evaluates exit rules and owns per-instrument trailing state.
///
/// Rule order: stop-loss, then take-profit (which arms the trail instead of
/// closing when a trailing distance is configured), then the trail itself.
#[derive(Debug, Default)]
pub struct RiskEvaluator {
    thresholds: ExitThresholds,
    trailing: Mutex<HashMap<Instrument, TrailingState>>,
}

impl RiskEvaluator {
    pub fn new(thresholds: ExitThresholds) -> Self {
        Self {
            thresholds,
            trailing: Mutex::new(HashMap::new()),
        }
    }

    pub fn thresholds(&self) -> ExitThresholds {
        self.thresholds
    }

    fn trailing(&self) -> MutexGuard<'_, HashMap<Instrument, TrailingState>> {
        self.trailing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn evaluate(&self, position: &Position, price: f64) -> ExitDecision {
        let instrument = position.instrument();
        if position.is_flat() {
            self.clear(instrument);
            return ExitDecision::keep(ExitReason::NoPosition, None);
        }

        let Some(ratio) = position.unrealized_return(price) else {
            return ExitDecision::keep(ExitReason::Hold, None);
        };

        if let Some(stop_loss) = self.thresholds.stop_loss {
            if ratio <= -stop_loss {
                self.clear(instrument);
                return ExitDecision::close(ExitReason::StopLoss, ratio);
            }
        }

        let mut trailing = self.trailing();
        let mut armed_now = false;
        if let Some(take_profit) = self.thresholds.take_profit {
            if ratio >= take_profit {
                if self.thresholds.trailing.is_none() {
                    return ExitDecision::close(ExitReason::TakeProfit, ratio);
                }
                let state = trailing
                    .entry(instrument.clone())
                    .or_insert(TrailingState { peak_price: price });
                state.peak_price = more_favourable(position.side(), state.peak_price, price);
                armed_now = true;
            }
        }

        let peak = trailing.get(instrument).map(|state| state.peak_price);
        if let (Some(distance), Some(peak)) = (self.thresholds.trailing, peak) {
            let retrace = match position.side() {
                Side::Short => (price - peak) / peak,
                _ => (peak - price) / peak,
            };
            if retrace >= distance {
                trailing.remove(instrument);
                return ExitDecision::close(ExitReason::TrailingStop, ratio);
            }
            if armed_now {
                return ExitDecision::keep(ExitReason::TrailingArmed, Some(ratio));
            }
        }

        ExitDecision::keep(ExitReason::Hold, Some(ratio))
    }

    pub fn trailing_peak(&self, instrument: &Instrument) -> Option<f64> {
        self.trailing().get(instrument).map(|state| state.peak_price)
    }

    pub fn clear(&self, instrument: &Instrument) {
        self.trailing().remove(instrument);
    }
}

fn more_favourable(side: Side, current: f64, candidate: f64) -> f64 {
    match side {
        Side::Short => current.min(candidate),
        _ => current.max(candidate),
    }
}
