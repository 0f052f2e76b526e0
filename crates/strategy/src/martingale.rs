use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use common::OrderSide;

use crate::config::{load_state, store_state};
use crate::{Decision, MarketSnapshot, Params, SignalIntent, Strategy, StrategyError};

/// Martingale position sizing.
///
/// Every losing tick (price at or below `anchor × (1 − stepPct)`) adds to the
/// position with `baseQuantity × multiplier^level` and moves the anchor down
/// to the fill price. Once the price recovers to `avgEntry × (1 + takeProfitPct)`
/// the whole position is sold and the level resets to 0. At `maxLevels` no
/// further entries are made until that close happens.
///
/// Config keys: `baseQuantity`, `multiplier`, `maxLevels`, `stepPct`,
/// `takeProfitPct`, `maxTickerAgeSecs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MartingaleStrategy;

impl MartingaleStrategy {
    pub const NAME: &'static str = "martingale";
}

#[derive(Debug, Clone, PartialEq)]
pub struct MartingaleParams {
    pub base_quantity: f64,
    pub multiplier: f64,
    pub max_levels: u32,
    pub step_pct: f64,
    pub take_profit_pct: f64,
    pub max_ticker_age: Duration,
}

impl MartingaleParams {
    pub fn from_config(config: &Value) -> Result<Self, StrategyError> {
        let p = Params::new(config);
        let params = Self {
            base_quantity: p.f64("baseQuantity", 0.001)?,
            multiplier: p.f64("multiplier", 2.0)?,
            max_levels: p.u32("maxLevels", 5)?,
            step_pct: p.f64("stepPct", 0.01)?,
            take_profit_pct: p.f64("takeProfitPct", 0.01)?,
            max_ticker_age: Duration::seconds(i64::from(p.u32("maxTickerAgeSecs", 120)?)),
        };

        if params.base_quantity <= 0.0 {
            return Err(StrategyError::InvalidConfig("baseQuantity must be positive".into()));
        }
        if params.multiplier < 1.0 {
            return Err(StrategyError::InvalidConfig("multiplier must be at least 1".into()));
        }
        // A zero step would treat an unchanged price as a losing tick.
        if !(params.step_pct > 0.0 && params.step_pct < 1.0) {
            return Err(StrategyError::InvalidConfig("stepPct must be in (0, 1)".into()));
        }
        if params.take_profit_pct < 0.0 {
            return Err(StrategyError::InvalidConfig("takeProfitPct must not be negative".into()));
        }
        Ok(params)
    }

    /// Order size for an entry at `level`.
    pub fn entry_quantity(&self, level: u32) -> f64 {
        let exponent = i32::try_from(level).unwrap_or(i32::MAX);
        self.base_quantity * self.multiplier.powi(exponent)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MartingaleState {
    pub level: u32,
    pub losing_streak: bool,
    /// Reference price for the next losing-tick test. `None` until the first
    /// usable ticker.
    pub anchor_price: Option<f64>,
    pub position_qty: f64,
    pub position_cost: f64,
}

impl MartingaleState {
    fn average_entry(&self) -> Option<f64> {
        (self.position_qty > 0.0).then(|| self.position_cost / self.position_qty)
    }

    fn close(&mut self, price: f64) {
        self.level = 0;
        self.losing_streak = false;
        self.anchor_price = Some(price);
        self.position_qty = 0.0;
        self.position_cost = 0.0;
    }
}

impl Strategy for MartingaleStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn generate_signal(
        &self,
        market: &MarketSnapshot,
        config: &Value,
        prior: &Value,
    ) -> Result<Decision, StrategyError> {
        let params = MartingaleParams::from_config(config)?;
        let mut state: MartingaleState = load_state(prior)?;

        let price = match market.fresh_ticker(params.max_ticker_age) {
            Some(ticker) if ticker.last_price.is_finite() && ticker.last_price > 0.0 => {
                ticker.last_price
            }
            _ => return Ok(Decision::hold(prior.clone())),
        };

        let Some(anchor) = state.anchor_price else {
            state.anchor_price = Some(price);
            return Ok(Decision::hold(store_state(&state)?));
        };

        if let Some(avg_entry) = state.average_entry() {
            if price >= avg_entry * (1.0 + params.take_profit_pct) {
                let quantity = state.position_qty;
                let reason = format!(
                    "take profit at {price} (avg entry {avg_entry:.8}, level {})",
                    state.level
                );
                state.close(price);
                return Ok(Decision::trade(
                    SignalIntent {
                        side: OrderSide::Sell,
                        quantity,
                        price: None,
                        reason,
                    },
                    store_state(&state)?,
                ));
            }
        }

        if price <= anchor * (1.0 - params.step_pct) {
            state.losing_streak = true;
            if state.level >= params.max_levels {
                // Fail closed: hold the position, wait for the take-profit close.
                return Ok(Decision::hold(store_state(&state)?));
            }

            let quantity = params.entry_quantity(state.level);
            let reason = format!(
                "losing tick {price} <= anchor {anchor}, entering level {}",
                state.level
            );
            state.level += 1;
            state.anchor_price = Some(price);
            state.position_qty += quantity;
            state.position_cost += quantity * price;
            return Ok(Decision::trade(
                SignalIntent {
                    side: OrderSide::Buy,
                    quantity,
                    price: None,
                    reason,
                },
                store_state(&state)?,
            ));
        }

        if price > anchor {
            state.losing_streak = false;
            if state.position_qty <= 0.0 {
                state.anchor_price = Some(price);
            }
        }
        Ok(Decision::hold(store_state(&state)?))
    }
}
