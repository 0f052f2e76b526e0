use std::sync::Arc;

use serde_json::Value;
use tracing::{error, info, warn};

use common::{
    BotDirectory, BotState, ExchangeAdapter, ExchangeError, OrderRef, OrderResult, PendingOrder,
    Result, Signal,
};

/// What happened to a submitted order.
#[derive(Debug)]
pub enum Submission {
    /// Accepted by the exchange; signal executed and proposed state committed.
    Executed(OrderResult),
    /// The exchange answered with a rejected order; prior state kept.
    Rejected(OrderResult),
    /// Definitely not placed; prior state kept.
    Failed(ExchangeError),
    /// Outcome unknown; the pending record stays for the next tick to reconcile.
    Unknown(ExchangeError),
}

/// What a status query said about a pending order.
#[derive(Debug)]
pub enum Reconciliation {
    /// Found and accepted; signal executed and proposed state committed.
    Executed(OrderResult),
    /// Rejected or never reached the book; prior state committed.
    Abandoned(String),
    /// The query itself failed; pending record kept.
    Unresolved(ExchangeError),
}

/// Places orders for one bot and keeps its persisted state consistent with
/// what the exchange saw.
///
/// This is the ONLY component that calls `ExchangeAdapter::place_order`.
/// Every submission is preceded by a write-ahead `PendingOrder` so an
/// interrupted tick can be resolved by a status query instead of a resend.
pub struct OrderExecutor<'a> {
    directory: &'a dyn BotDirectory,
    adapter: Arc<dyn ExchangeAdapter>,
}

impl<'a> OrderExecutor<'a> {
    pub fn new(directory: &'a dyn BotDirectory, adapter: Arc<dyn ExchangeAdapter>) -> Self {
        Self { directory, adapter }
    }

    /// Record `signal`, persist the write-ahead state, then place the order.
    ///
    /// `Err` is a store failure; exchange failures are reported in `Submission`.
    pub async fn submit(&self, prior: &BotState, mut signal: Signal, proposed: Value) -> Result<Submission> {
        let request = signal.order_request();
        self.directory.append_signal(&signal).await?;

        let pending = PendingOrder {
            signal_id: signal.id,
            request: request.clone(),
            proposed: proposed.clone(),
            submitted_at: chrono::Utc::now(),
        };
        let write_ahead = prior.next(prior.document.clone(), Some(pending));
        self.directory.update_bot_state(signal.bot_id, &write_ahead).await?;

        info!(
            bot_id = %signal.bot_id,
            symbol = %request.symbol,
            side = %request.side,
            qty = request.quantity,
            client_order_id = %request.client_order_id,
            "Executing order"
        );

        match self.adapter.place_order(&request).await {
            Ok(result) if !result.status.is_rejected() => {
                info!(
                    bot_id = %signal.bot_id,
                    order_id = %result.order_id,
                    status = %result.status,
                    price = ?result.price,
                    "Order accepted"
                );
                signal.mark_executed(&result)?;
                self.directory.mark_signal_executed(signal.id, result.timestamp).await?;
                self.directory
                    .update_bot_state(signal.bot_id, &write_ahead.next(proposed, None))
                    .await?;
                Ok(Submission::Executed(result))
            }
            Ok(result) => {
                warn!(bot_id = %signal.bot_id, order_id = %result.order_id, "Order rejected");
                self.restore_prior(&write_ahead).await?;
                Ok(Submission::Rejected(result))
            }
            Err(e) if e.is_ambiguous() => {
                error!(
                    bot_id = %signal.bot_id,
                    client_order_id = %request.client_order_id,
                    error = %e,
                    "Order outcome unknown; will reconcile"
                );
                Ok(Submission::Unknown(e))
            }
            Err(e) => {
                error!(bot_id = %signal.bot_id, error = %e, "Order submission failed");
                self.restore_prior(&write_ahead).await?;
                Ok(Submission::Failed(e))
            }
        }
    }

    /// Resolve the pending order in `state` by client order id. Never resubmits.
    pub async fn reconcile(&self, state: &BotState) -> Result<Reconciliation> {
        let Some(pending) = &state.pending else {
            return Ok(Reconciliation::Abandoned("nothing pending".into()));
        };
        let client_id = OrderRef::Client(pending.request.client_order_id.clone());

        match self.adapter.get_order_status(&pending.request.symbol, &client_id).await {
            Ok(result) if !result.status.is_rejected() => {
                info!(
                    bot_id = %state.bot_id,
                    order_id = %result.order_id,
                    status = %result.status,
                    "Pending order confirmed"
                );
                self.directory
                    .mark_signal_executed(pending.signal_id, result.timestamp)
                    .await?;
                self.directory
                    .update_bot_state(state.bot_id, &state.next(pending.proposed.clone(), None))
                    .await?;
                Ok(Reconciliation::Executed(result))
            }
            Ok(result) => {
                warn!(bot_id = %state.bot_id, order_id = %result.order_id, "Pending order was rejected");
                self.restore_prior(state).await?;
                Ok(Reconciliation::Abandoned(format!("order {} rejected", result.order_id)))
            }
            Err(ExchangeError::OrderNotFound(reference)) => {
                warn!(bot_id = %state.bot_id, %reference, "Pending order never reached the exchange");
                self.restore_prior(state).await?;
                Ok(Reconciliation::Abandoned(format!("order {reference} not found")))
            }
            Err(e) => {
                warn!(bot_id = %state.bot_id, error = %e, "Could not reconcile pending order");
                Ok(Reconciliation::Unresolved(e))
            }
        }
    }

    /// Drop the pending record and keep the document as it was.
    async fn restore_prior(&self, state: &BotState) -> Result<()> {
        self.directory
            .update_bot_state(state.bot_id, &state.next(state.document.clone(), None))
            .await
    }
}
