//! Command Handlers
//!
//! Pure request → upstream → response translators. Handlers are stateless
//! apart from the session they receive through the worker; everything they
//! return is serialized into the response `data` field.

use rust_decimal::Decimal;
use serde::Serialize;

use super::Worker;
use crate::audit::{AuditStatusUpdate, NewOrderAudit};
use crate::broker::{OrderSide, OrderTicket};
use crate::error::ResponseError;
use crate::models::{
    CancelResult, Command, CommandRequest, CommandResponse, DealInfo, MarginResult, OrderAction,
    OrderCommand, OrderResult, PositionsResult, ProfitLossResult, QuoteFrame, RecheckResult,
    SettlementsResult, SubscriptionResult, TradesResult, UsageResult,
};
use crate::session::ContractCatalog;

/// Decide the upstream side and quantity for an order intent against the
/// current net position (positive long, negative short).
///
/// Entries against an opposite-sign position grow by the open position so a
/// single order both closes and reverses. Exits close the whole open
/// position; an exit with no matching position yields `None`.
#[must_use]
pub fn order_plan(action: OrderAction, requested: u32, net: i64) -> Option<(OrderSide, u32)> {
    let abs_net = u32::try_from(net.unsigned_abs()).unwrap_or(u32::MAX);
    match action {
        OrderAction::LongEntry => {
            let quantity = if net < 0 {
                requested.saturating_add(abs_net)
            } else {
                requested
            };
            Some((OrderSide::Buy, quantity))
        }
        OrderAction::ShortEntry => {
            let quantity = if net > 0 {
                requested.saturating_add(abs_net)
            } else {
                requested
            };
            Some((OrderSide::Sell, quantity))
        }
        OrderAction::LongExit => (net > 0).then_some((OrderSide::Sell, abs_net)),
        OrderAction::ShortExit => (net < 0).then_some((OrderSide::Buy, abs_net)),
    }
}

fn to_data<T: Serialize>(value: &T) -> Result<serde_json::Value, ResponseError> {
    serde_json::to_value(value)
        .map_err(|err| ResponseError::internal(format!("result serialization failed: {err}")))
}

impl Worker {
    fn catalog(&self) -> Result<std::sync::Arc<ContractCatalog>, ResponseError> {
        self.session
            .catalog()
            .ok_or_else(|| ResponseError::session_not_ready(self.session.state().as_str()))
    }

    /// Route a gated request to its handler.
    pub(super) async fn handle(
        &self,
        request: &CommandRequest,
    ) -> Result<CommandResponse, ResponseError> {
        let id = request.request_id.as_str();
        match &request.command {
            Command::PlaceOrder(order) => self.place_order(id, order).await,
            Command::CancelOrder { order_id } => self.cancel_order(id, *order_id).await,
            Command::RecheckOrder { order_id } => self.recheck_order(id, *order_id).await,
            Command::ListPositions => {
                let records = self.upstream.list_positions().await?;
                Ok(CommandResponse::ok(
                    id,
                    to_data(&PositionsResult::from_records(&records))?,
                ))
            }
            Command::QueryMargin => {
                let report = self.upstream.margin().await?;
                Ok(CommandResponse::ok(id, to_data(&MarginResult::from(&report))?))
            }
            Command::QueryProfitLoss => {
                let report = self.upstream.profit_loss().await?;
                Ok(CommandResponse::ok(
                    id,
                    to_data(&ProfitLossResult::from(&report))?,
                ))
            }
            Command::ListTrades => {
                let records = self.upstream.list_trades().await?;
                Ok(CommandResponse::ok(
                    id,
                    to_data(&TradesResult::from_records(&records))?,
                ))
            }
            Command::ListSettlements => {
                let records = self.upstream.list_settlements().await?;
                Ok(CommandResponse::ok(
                    id,
                    to_data(&SettlementsResult::from_records(&records))?,
                ))
            }
            Command::ListSymbols => {
                // Catalog snapshot; succeeds in ready state without an
                // upstream round trip.
                let catalog = self.catalog()?;
                Ok(CommandResponse::ok(id, to_data(&catalog.grouped())?))
            }
            Command::SymbolInfo { symbol } => {
                let catalog = self.catalog()?;
                let contract = catalog
                    .get(symbol)
                    .ok_or_else(|| ResponseError::not_found(format!("unknown symbol {symbol}")))?;
                Ok(CommandResponse::ok(id, to_data(contract)?))
            }
            Command::SymbolSnapshot { symbol } => {
                let catalog = self.catalog()?;
                let contract = catalog
                    .get(symbol)
                    .ok_or_else(|| ResponseError::not_found(format!("unknown symbol {symbol}")))?
                    .clone();
                let report = self.upstream.snapshot(&contract).await?;
                Ok(CommandResponse::ok(
                    id,
                    to_data(&QuoteFrame::snapshot(symbol, &report))?,
                ))
            }
            Command::QueryUsage => {
                let report = self.upstream.usage().await?;
                Ok(CommandResponse::ok(id, to_data(&UsageResult::from(&report))?))
            }
            Command::SubscribeQuote { symbol } => self.subscribe_quote(id, symbol).await,
            Command::UnsubscribeQuote { symbol } => self.unsubscribe_quote(id, symbol).await,
        }
    }

    async fn net_position(&self, code: &str) -> Result<i64, ResponseError> {
        let positions = self.upstream.list_positions().await?;
        Ok(positions
            .iter()
            .find(|position| position.code == code)
            .map_or(0, |position| {
                let quantity = i64::from(position.quantity);
                match position.direction {
                    OrderSide::Buy => quantity,
                    OrderSide::Sell => -quantity,
                }
            }))
    }

    async fn place_order(
        &self,
        request_id: &str,
        order: &OrderCommand,
    ) -> Result<CommandResponse, ResponseError> {
        order.validate().map_err(ResponseError::validation)?;

        let catalog = self.catalog()?;
        let contract = catalog
            .get(&order.symbol)
            .ok_or_else(|| ResponseError::validation(format!("unknown symbol {}", order.symbol)))?
            .clone();

        let net = self.net_position(&contract.code).await?;
        let Some((side, quantity)) = order_plan(order.action, order.quantity, net) else {
            return Ok(CommandResponse::no_action(
                request_id,
                format!(
                    "no {} position in {} to exit (net {net})",
                    if order.action == OrderAction::LongExit {
                        "long"
                    } else {
                        "short"
                    },
                    order.symbol
                ),
            ));
        };
        if quantity != order.quantity {
            tracing::debug!(
                symbol = %order.symbol,
                requested = order.quantity,
                adjusted = quantity,
                net,
                "quantity adjusted for position reversal"
            );
        }

        let ticket = OrderTicket {
            side,
            quantity,
            price: order.price.unwrap_or(Decimal::ZERO),
            price_type: order.price_type,
            duration: order.order_type,
        };

        match self.upstream.place_order(&contract, ticket).await {
            Ok(ack) => {
                let row = self
                    .audit
                    .insert(NewOrderAudit {
                        mode: self.mode,
                        symbol: order.symbol.clone(),
                        exchange_code: contract.code.clone(),
                        action: order.action,
                        quantity,
                        status: ack.status.internal(),
                        upstream_order_id: Some(ack.order_id.clone()),
                        seqno: Some(ack.seqno.clone()),
                        failure_message: None,
                    })
                    .await
                    .map_err(|err| ResponseError::internal(err.to_string()))?;

                tracing::info!(
                    order_id = row.id,
                    upstream_order_id = %ack.order_id,
                    symbol = %order.symbol,
                    action = %order.action,
                    quantity,
                    "order submitted"
                );

                Ok(CommandResponse::ok(
                    request_id,
                    to_data(&OrderResult {
                        order_id: row.id,
                        upstream_order_id: ack.order_id,
                        status: ack.status.internal(),
                        symbol: order.symbol.clone(),
                        exchange_code: contract.code,
                        action: order.action,
                        quantity,
                    })?,
                ))
            }
            Err(err) => {
                // The refused submission still leaves an audit trail.
                let insert = self
                    .audit
                    .insert(NewOrderAudit {
                        mode: self.mode,
                        symbol: order.symbol.clone(),
                        exchange_code: contract.code.clone(),
                        action: order.action,
                        quantity,
                        status: crate::models::InternalOrderStatus::Failed,
                        upstream_order_id: None,
                        seqno: None,
                        failure_message: Some(err.to_string()),
                    })
                    .await;
                if let Err(audit_err) = insert {
                    tracing::error!(error = %audit_err, "failed to record refused order");
                }
                Err(ResponseError::from(err))
            }
        }
    }

    async fn recheck_order(
        &self,
        request_id: &str,
        order_id: i64,
    ) -> Result<CommandResponse, ResponseError> {
        let row = self
            .audit
            .find(order_id)
            .await
            .map_err(|err| ResponseError::internal(err.to_string()))?
            .ok_or_else(|| ResponseError::not_found(format!("order {order_id} not found")))?;

        let upstream_id = row.upstream_order_id.clone().ok_or_else(|| {
            ResponseError::validation(format!("order {order_id} was never submitted upstream"))
        })?;

        let report = self.upstream.order_status(&upstream_id).await?;
        let previous = row.status;
        let current = report.status.internal();

        self.audit
            .update_status(
                order_id,
                AuditStatusUpdate {
                    status: Some(current),
                    fill_status: Some(report.status),
                    fill_quantity: Some(report.deal_quantity),
                    fill_price: (report.deal_quantity > 0).then_some(report.avg_fill_price),
                    cancel_quantity: Some(report.cancel_quantity),
                    failure_message: (!report.message.is_empty())
                        .then(|| report.message.clone()),
                },
            )
            .await
            .map_err(|err| ResponseError::internal(err.to_string()))?;

        Ok(CommandResponse::ok(
            request_id,
            to_data(&RecheckResult {
                order_id,
                previous_status: previous,
                current_status: current,
                fill_quantity: report.deal_quantity,
                fill_price: (report.deal_quantity > 0).then_some(report.avg_fill_price),
                cancel_quantity: report.cancel_quantity,
                deals: report.deals.iter().map(DealInfo::from).collect(),
            })?,
        ))
    }

    async fn cancel_order(
        &self,
        request_id: &str,
        order_id: i64,
    ) -> Result<CommandResponse, ResponseError> {
        let row = self
            .audit
            .find(order_id)
            .await
            .map_err(|err| ResponseError::internal(err.to_string()))?
            .ok_or_else(|| ResponseError::not_found(format!("order {order_id} not found")))?;

        if row.status.is_terminal() {
            return Ok(CommandResponse::no_action(
                request_id,
                format!("order {order_id} is already {}", row.status),
            ));
        }

        let upstream_id = row.upstream_order_id.clone().ok_or_else(|| {
            ResponseError::validation(format!("order {order_id} was never submitted upstream"))
        })?;

        let report = self.upstream.cancel_order(&upstream_id).await?;
        let current = report.status.internal();

        self.audit
            .update_status(
                order_id,
                AuditStatusUpdate {
                    status: Some(current),
                    fill_status: Some(report.status),
                    cancel_quantity: Some(report.cancel_quantity),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| ResponseError::internal(err.to_string()))?;

        Ok(CommandResponse::ok(
            request_id,
            to_data(&CancelResult {
                order_id,
                status: current,
                cancel_quantity: report.cancel_quantity,
            })?,
        ))
    }

    async fn subscribe_quote(
        &self,
        request_id: &str,
        symbol: &str,
    ) -> Result<CommandResponse, ResponseError> {
        let catalog = self.catalog()?;
        let contract = catalog
            .get(symbol)
            .ok_or_else(|| ResponseError::validation(format!("unknown symbol {symbol}")))?
            .clone();

        let refcount = self.quotes.subscribe(symbol, &contract).await?;
        Ok(CommandResponse::ok(
            request_id,
            to_data(&SubscriptionResult {
                symbol: symbol.to_string(),
                subscribed: true,
                refcount,
            })?,
        ))
    }

    async fn unsubscribe_quote(
        &self,
        request_id: &str,
        symbol: &str,
    ) -> Result<CommandResponse, ResponseError> {
        match self.quotes.unsubscribe(symbol).await {
            Some(refcount) => Ok(CommandResponse::ok(
                request_id,
                to_data(&SubscriptionResult {
                    symbol: symbol.to_string(),
                    subscribed: refcount > 0,
                    refcount,
                })?,
            )),
            None => Ok(CommandResponse::no_action(
                request_id,
                format!("no active subscription for {symbol}"),
            )),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_with_flat_position_keeps_quantity() {
        assert_eq!(
            order_plan(OrderAction::LongEntry, 2, 0),
            Some((OrderSide::Buy, 2))
        );
        assert_eq!(
            order_plan(OrderAction::ShortEntry, 3, 0),
            Some((OrderSide::Sell, 3))
        );
    }

    #[test]
    fn entry_against_opposite_position_reverses() {
        // Short 2, buying 1 means buying 3 to end long 1.
        assert_eq!(
            order_plan(OrderAction::LongEntry, 1, -2),
            Some((OrderSide::Buy, 3))
        );
        // Long 4, selling 2 means selling 6 to end short 2.
        assert_eq!(
            order_plan(OrderAction::ShortEntry, 2, 4),
            Some((OrderSide::Sell, 6))
        );
    }

    #[test]
    fn entry_growing_same_direction_is_unadjusted() {
        assert_eq!(
            order_plan(OrderAction::LongEntry, 1, 5),
            Some((OrderSide::Buy, 1))
        );
        assert_eq!(
            order_plan(OrderAction::ShortEntry, 1, -5),
            Some((OrderSide::Sell, 1))
        );
    }

    #[test]
    fn exit_closes_entire_position() {
        assert_eq!(
            order_plan(OrderAction::LongExit, 1, 3),
            Some((OrderSide::Sell, 3))
        );
        assert_eq!(
            order_plan(OrderAction::ShortExit, 1, -2),
            Some((OrderSide::Buy, 2))
        );
    }

    #[test]
    fn exit_without_matching_position_is_no_action() {
        assert_eq!(order_plan(OrderAction::LongExit, 1, 0), None);
        assert_eq!(order_plan(OrderAction::LongExit, 1, -2), None);
        assert_eq!(order_plan(OrderAction::ShortExit, 2, 0), None);
        assert_eq!(order_plan(OrderAction::ShortExit, 2, 5), None);
    }
}
