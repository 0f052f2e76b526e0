use serde::{Deserialize, Serialize};
use serde_json::Value;

use common::{CandleInterval, OrderSide};

use crate::config::{load_state, store_state};
use crate::indicators::Rsi;
use crate::{CandleRequirement, Decision, MarketSnapshot, Params, SignalIntent, Strategy, StrategyError};

/// Mean-reversion on the RSI of closed candles.
///
/// Buys `quantity` when flat and RSI <= `oversold`; sells the whole position
/// when RSI >= `overbought`. Each closed candle is acted on at most once.
///
/// Config keys: `period` (14), `overbought` (70), `oversold` (30),
/// `quantity` (0.001), `interval` ("1h").
#[derive(Debug, Default, Clone, Copy)]
pub struct RsiStrategy;

impl RsiStrategy {
    pub const NAME: &'static str = "rsi";
}

struct RsiParams {
    rsi: Rsi,
    overbought: f64,
    oversold: f64,
    quantity: f64,
    interval: CandleInterval,
}

impl RsiParams {
    fn from_config(config: &Value) -> Result<Self, StrategyError> {
        let p = Params::new(config);
        let period = p.u32("period", 14)? as usize;
        let params = Self {
            rsi: Rsi::new(period)?,
            overbought: p.f64("overbought", 70.0)?,
            oversold: p.f64("oversold", 30.0)?,
            quantity: p.f64("quantity", 0.001)?,
            interval: p
                .string("interval", "1h")?
                .parse()
                .map_err(|e: common::Error| StrategyError::InvalidConfig(e.to_string()))?,
        };
        if params.oversold >= params.overbought {
            return Err(StrategyError::InvalidConfig(
                "oversold must be below overbought".into(),
            ));
        }
        if params.quantity <= 0.0 {
            return Err(StrategyError::InvalidConfig("quantity must be positive".into()));
        }
        Ok(params)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RsiState {
    position_qty: f64,
    /// Close time (ms) of the last candle evaluated.
    last_close_ms: Option<i64>,
}

impl Strategy for RsiStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn candle_requirement(&self, config: &Value) -> Result<Option<CandleRequirement>, StrategyError> {
        let params = RsiParams::from_config(config)?;
        // Extra history lets the Wilder smoothing settle.
        let count = (params.rsi.period() * 3 + 1) as u32;
        Ok(Some(CandleRequirement {
            interval: params.interval,
            count,
        }))
    }

    fn generate_signal(
        &self,
        market: &MarketSnapshot,
        config: &Value,
        prior: &Value,
    ) -> Result<Decision, StrategyError> {
        let params = RsiParams::from_config(config)?;
        let mut state: RsiState = load_state(prior)?;

        let closed: Vec<_> = market.closed_candles().collect();
        let Some(latest) = closed.last() else {
            return Ok(Decision::hold(prior.clone()));
        };
        let latest_ms = latest.close_time.timestamp_millis();
        if state.last_close_ms.is_some_and(|seen| seen >= latest_ms) {
            return Ok(Decision::hold(prior.clone()));
        }

        let closes: Vec<f64> = closed.iter().map(|c| c.close).collect();
        let Some(value) = params.rsi.compute(&closes) else {
            return Ok(Decision::hold(prior.clone()));
        };
        state.last_close_ms = Some(latest_ms);

        if state.position_qty <= 0.0 && value <= params.oversold {
            state.position_qty = params.quantity;
            return Ok(Decision::trade(
                SignalIntent {
                    side: OrderSide::Buy,
                    quantity: params.quantity,
                    price: None,
                    reason: format!("RSI {value:.2} <= oversold {}", params.oversold),
                },
                store_state(&state)?,
            ));
        }

        if state.position_qty > 0.0 && value >= params.overbought {
            let quantity = state.position_qty;
            state.position_qty = 0.0;
            return Ok(Decision::trade(
                SignalIntent {
                    side: OrderSide::Sell,
                    quantity,
                    price: None,
                    reason: format!("RSI {value:.2} >= overbought {}", params.overbought),
                },
                store_state(&state)?,
            ));
        }

        Ok(Decision::hold(store_state(&state)?))
    }
}
