//! Simulated Upstream Session
//!
//! The bundled [`UpstreamPort`] adapter: instant market fills against
//! reference prices, a fixed contract catalog, and injectable failures so
//! session healing and error surfacing can be exercised without a real
//! brokerage connection. Serves as the paper-trading backend and as the test
//! double for the worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use super::{
    AccountInfo, BidAskData, ContractInfo, LoginSummary, MarginReport, OrderAck,
    OrderStatusReport, OrderTicket, PositionRecord, ProductKind, ProfitLossReport,
    SettlementRecord, SnapshotReport, TickData, TradeRecord, UpstreamError, UpstreamPort,
    UpstreamQuoteEvent, UsageReport,
};
use crate::broker::OrderSide;
use crate::config::TradingMode;
use crate::models::{QuoteKind, UpstreamOrderStatus};

struct SimOrder {
    quantity: u32,
    price: Decimal,
    status: UpstreamOrderStatus,
    deal_quantity: u32,
    cancel_quantity: u32,
}

#[derive(Default)]
struct SimState {
    logged_in: bool,
    /// Net position per exchange code; positive long, negative short.
    positions: HashMap<String, i64>,
    entry_prices: HashMap<String, Decimal>,
    orders: HashMap<String, SimOrder>,
    subscriptions: Vec<(String, QuoteKind)>,
    trades: Vec<TradeRecord>,
    next_order: u64,
}

/// Simulated upstream session.
pub struct SimUpstream {
    contracts: Vec<ContractInfo>,
    state: Mutex<SimState>,
    quote_sink: Mutex<Option<mpsc::UnboundedSender<UpstreamQuoteEvent>>>,
    login_calls: AtomicU32,
    logout_calls: AtomicU32,
    place_order_calls: AtomicU32,
    subscribe_calls: AtomicU32,
    unsubscribe_calls: AtomicU32,
    fail_logins_remaining: AtomicU32,
    /// Armed fault: `(calls_to_skip, error)`.
    fault: Mutex<Option<(u32, UpstreamError)>>,
}

impl SimUpstream {
    /// Create a session backed by the default catalog.
    #[must_use]
    pub fn new() -> Self {
        Self {
            contracts: default_catalog(),
            state: Mutex::new(SimState::default()),
            quote_sink: Mutex::new(None),
            login_calls: AtomicU32::new(0),
            logout_calls: AtomicU32::new(0),
            place_order_calls: AtomicU32::new(0),
            subscribe_calls: AtomicU32::new(0),
            unsubscribe_calls: AtomicU32::new(0),
            fail_logins_remaining: AtomicU32::new(0),
            fault: Mutex::new(None),
        }
    }

    /// Make the next `n` login attempts fail with a timeout.
    pub fn fail_logins(&self, n: u32) {
        self.fail_logins_remaining.store(n, Ordering::SeqCst);
    }

    /// Make the next non-login call fail with `err`.
    pub fn inject_fault(&self, err: UpstreamError) {
        *self.fault.lock() = Some((0, err));
    }

    /// Let the next `skip` non-login calls succeed, then fail one with `err`.
    pub fn inject_fault_after(&self, skip: u32, err: UpstreamError) {
        *self.fault.lock() = Some((skip, err));
    }

    /// Seed a net position for a contract code (positive long, negative short).
    pub fn set_position(&self, code: &str, net: i64, price: Decimal) {
        let mut state = self.state.lock();
        if net == 0 {
            state.positions.remove(code);
            state.entry_prices.remove(code);
        } else {
            state.positions.insert(code.to_string(), net);
            state.entry_prices.insert(code.to_string(), price);
        }
    }

    /// Net position for a contract code.
    #[must_use]
    pub fn position(&self, code: &str) -> i64 {
        self.state.lock().positions.get(code).copied().unwrap_or(0)
    }

    /// Number of `login` calls.
    #[must_use]
    pub fn login_calls(&self) -> u32 {
        self.login_calls.load(Ordering::SeqCst)
    }

    /// Number of `place_order` calls.
    #[must_use]
    pub fn place_order_calls(&self) -> u32 {
        self.place_order_calls.load(Ordering::SeqCst)
    }

    /// Number of `logout` calls.
    #[must_use]
    pub fn logout_calls(&self) -> u32 {
        self.logout_calls.load(Ordering::SeqCst)
    }

    /// Number of upstream `subscribe_quote` calls (tick and bid/ask counted
    /// separately).
    #[must_use]
    pub fn subscribe_calls(&self) -> u32 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of upstream `unsubscribe_quote` calls.
    #[must_use]
    pub fn unsubscribe_calls(&self) -> u32 {
        self.unsubscribe_calls.load(Ordering::SeqCst)
    }

    /// Active upstream subscriptions as `(code, kind)` pairs.
    #[must_use]
    pub fn active_subscriptions(&self) -> Vec<(String, QuoteKind)> {
        self.state.lock().subscriptions.clone()
    }

    /// Push a trade tick as if the exchange delivered it for `code`.
    pub fn emit_tick(&self, code: &str, tick: TickData) {
        if let Some(sink) = self.quote_sink.lock().as_ref() {
            let _ = sink.send(UpstreamQuoteEvent::Tick {
                code: code.to_string(),
                tick,
            });
        }
    }

    /// Push a bid/ask update as if the exchange delivered it for `code`.
    pub fn emit_bid_ask(&self, code: &str, bid_ask: BidAskData) {
        if let Some(sink) = self.quote_sink.lock().as_ref() {
            let _ = sink.send(UpstreamQuoteEvent::BidAsk {
                code: code.to_string(),
                bid_ask,
            });
        }
    }

    fn check_fault(&self) -> Result<(), UpstreamError> {
        let mut fault = self.fault.lock();
        match fault.take() {
            Some((0, err)) => Err(err),
            Some((skip, err)) => {
                *fault = Some((skip - 1, err));
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn reference_for(&self, code: &str) -> Decimal {
        self.contracts
            .iter()
            .find(|c| c.code == code)
            .map_or(Decimal::ZERO, |c| c.reference)
    }
}

impl Default for SimUpstream {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamPort for SimUpstream {
    async fn login(&self, _mode: TradingMode) -> Result<LoginSummary, UpstreamError> {
        self.login_calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_logins_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_logins_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(UpstreamError::Timeout("login".to_string()));
        }

        self.state.lock().logged_in = true;
        Ok(LoginSummary {
            accounts: vec![AccountInfo {
                account_id: "F0000001".to_string(),
                signed: true,
            }],
            contracts: self.contracts.clone(),
        })
    }

    async fn logout(&self) -> Result<(), UpstreamError> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.logged_in = false;
        state.subscriptions.clear();
        Ok(())
    }

    fn install_quote_sink(&self, sink: mpsc::UnboundedSender<UpstreamQuoteEvent>) {
        *self.quote_sink.lock() = Some(sink);
    }

    async fn subscribe_quote(
        &self,
        contract: &ContractInfo,
        kind: QuoteKind,
    ) -> Result<(), UpstreamError> {
        self.check_fault()?;
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .subscriptions
            .push((contract.code.clone(), kind));
        Ok(())
    }

    async fn unsubscribe_quote(
        &self,
        contract: &ContractInfo,
        kind: QuoteKind,
    ) -> Result<(), UpstreamError> {
        self.check_fault()?;
        self.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .lock()
            .subscriptions
            .retain(|(code, k)| !(code == &contract.code && *k == kind));
        Ok(())
    }

    async fn place_order(
        &self,
        contract: &ContractInfo,
        ticket: OrderTicket,
    ) -> Result<OrderAck, UpstreamError> {
        self.check_fault()?;
        self.place_order_calls.fetch_add(1, Ordering::SeqCst);

        let fill_price = if ticket.price > Decimal::ZERO {
            ticket.price
        } else {
            contract.reference
        };

        let mut state = self.state.lock();
        state.next_order += 1;
        let order_id = format!("o-{:06}", state.next_order);
        let seqno = format!("{:06}", state.next_order);

        let signed = i64::from(ticket.quantity);
        let delta = match ticket.side {
            OrderSide::Buy => signed,
            OrderSide::Sell => -signed,
        };
        let net = state
            .positions
            .get(&contract.code)
            .copied()
            .unwrap_or(0)
            + delta;
        if net == 0 {
            state.positions.remove(&contract.code);
            state.entry_prices.remove(&contract.code);
        } else {
            state.positions.insert(contract.code.clone(), net);
            state
                .entry_prices
                .entry(contract.code.clone())
                .or_insert(fill_price);
        }

        let ts = 1_767_571_200_000;
        state.trades.push(TradeRecord {
            code: contract.code.clone(),
            order_id: order_id.clone(),
            seqno: seqno.clone(),
            price: fill_price,
            quantity: ticket.quantity,
            action: ticket.side,
            ts,
        });
        state.orders.insert(
            order_id.clone(),
            SimOrder {
                quantity: ticket.quantity,
                price: fill_price,
                status: UpstreamOrderStatus::Submitted,
                deal_quantity: 0,
                cancel_quantity: 0,
            },
        );

        Ok(OrderAck {
            order_id,
            seqno,
            status: UpstreamOrderStatus::Submitted,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<OrderStatusReport, UpstreamError> {
        self.check_fault()?;
        let mut state = self.state.lock();
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| UpstreamError::OrderNotFound(order_id.to_string()))?;

        if !order.status.is_terminal() {
            order.status = UpstreamOrderStatus::Cancelled;
            order.cancel_quantity = order.quantity - order.deal_quantity;
        }
        Ok(report_for(order_id, order))
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatusReport, UpstreamError> {
        self.check_fault()?;
        let mut state = self.state.lock();
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| UpstreamError::OrderNotFound(order_id.to_string()))?;

        // Acknowledged market orders have reached the exchange and filled by
        // the time anyone rechecks.
        if order.status == UpstreamOrderStatus::Submitted {
            order.status = UpstreamOrderStatus::Filled;
            order.deal_quantity = order.quantity;
        }
        Ok(report_for(order_id, order))
    }

    async fn list_positions(&self) -> Result<Vec<PositionRecord>, UpstreamError> {
        self.check_fault()?;
        let state = self.state.lock();
        let mut records: Vec<PositionRecord> = state
            .positions
            .iter()
            .map(|(code, net)| {
                let price = state
                    .entry_prices
                    .get(code)
                    .copied()
                    .unwrap_or_else(|| self.reference_for(code));
                PositionRecord {
                    code: code.clone(),
                    direction: if *net > 0 {
                        OrderSide::Buy
                    } else {
                        OrderSide::Sell
                    },
                    quantity: u32::try_from(net.unsigned_abs()).unwrap_or(u32::MAX),
                    price,
                    last_price: self.reference_for(code),
                    pnl: Decimal::ZERO,
                }
            })
            .collect();
        records.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(records)
    }

    async fn margin(&self) -> Result<MarginReport, UpstreamError> {
        self.check_fault()?;
        Ok(MarginReport {
            yesterday_balance: Decimal::new(1_000_000, 0),
            today_balance: Decimal::new(1_000_000, 0),
            available_margin: Decimal::new(800_000, 0),
            initial_margin: Decimal::new(167_000, 0),
            maintenance_margin: Decimal::new(128_000, 0),
            margin_call: Decimal::ZERO,
            equity: Decimal::new(1_000_000, 0),
            risk_indicator: Decimal::new(599, 0),
            fee: Decimal::new(45, 0),
            tax: Decimal::new(10, 0),
        })
    }

    async fn profit_loss(&self) -> Result<ProfitLossReport, UpstreamError> {
        self.check_fault()?;
        Ok(ProfitLossReport::default())
    }

    async fn list_trades(&self) -> Result<Vec<TradeRecord>, UpstreamError> {
        self.check_fault()?;
        Ok(self.state.lock().trades.clone())
    }

    async fn list_settlements(&self) -> Result<Vec<SettlementRecord>, UpstreamError> {
        self.check_fault()?;
        Ok(Vec::new())
    }

    async fn usage(&self) -> Result<UsageReport, UpstreamError> {
        self.check_fault()?;
        Ok(UsageReport {
            connections: 1,
            bytes: 1_048_576,
            limit_bytes: 536_870_912,
        })
    }

    async fn snapshot(&self, contract: &ContractInfo) -> Result<SnapshotReport, UpstreamError> {
        self.check_fault()?;
        let reference = to_f64(contract.reference);
        Ok(SnapshotReport {
            code: contract.code.clone(),
            close: reference,
            open: reference,
            high: reference,
            low: reference,
            buy_price: reference - 1.0,
            sell_price: reference + 1.0,
            buy_volume: 10,
            sell_volume: 10,
            volume: 1,
            total_volume: 1_000,
            change_price: 0.0,
            change_rate: 0.0,
            ts: 1_767_571_200_000,
        })
    }
}

fn report_for(order_id: &str, order: &SimOrder) -> OrderStatusReport {
    let deals = if order.deal_quantity > 0 {
        vec![super::Deal {
            seq: format!("d-{order_id}"),
            price: order.price,
            quantity: order.deal_quantity,
            ts: 1_767_571_200_000,
        }]
    } else {
        Vec::new()
    };
    OrderStatusReport {
        order_id: order_id.to_string(),
        status: order.status,
        order_quantity: order.quantity,
        deal_quantity: order.deal_quantity,
        cancel_quantity: order.cancel_quantity,
        avg_fill_price: if order.deal_quantity > 0 {
            order.price
        } else {
            Decimal::ZERO
        },
        deals,
        message: String::new(),
    }
}

fn to_f64(value: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    value.to_f64().unwrap_or(0.0)
}

fn futures_contract(
    family: &str,
    name: &str,
    month: &str,
    code: &str,
    reference: i64,
) -> ContractInfo {
    ContractInfo {
        symbol: format!("{family}{month}"),
        code: code.to_string(),
        name: format!("{name} {month}"),
        category: family.to_string(),
        delivery_month: month.to_string(),
        product: ProductKind::Futures,
        unit: 1,
        limit_up: Decimal::new(reference + reference / 10, 0),
        limit_down: Decimal::new(reference - reference / 10, 0),
        reference: Decimal::new(reference, 0),
    }
}

fn pseudo_contract(family: &str, name: &str, role: &str, month: &str, reference: i64) -> ContractInfo {
    ContractInfo {
        symbol: format!("{family}{role}"),
        code: format!("{family}{role}"),
        name: format!("{name} ({role})"),
        category: family.to_string(),
        delivery_month: month.to_string(),
        product: ProductKind::Futures,
        unit: 1,
        limit_up: Decimal::new(reference + reference / 10, 0),
        limit_down: Decimal::new(reference - reference / 10, 0),
        reference: Decimal::new(reference, 0),
    }
}

/// The fixed catalog the simulated session serves.
fn default_catalog() -> Vec<ContractInfo> {
    let mut contracts = Vec::new();
    for (family, name, reference) in [
        ("TXF", "TAIEX Futures", 22_000),
        ("MXF", "Mini TAIEX Futures", 21_500),
        ("TMF", "Micro TAIEX Futures", 17_500),
    ] {
        // Exchange month codes: B = February, C = March.
        let code_b = format!("{family}B6");
        let code_c = format!("{family}C6");
        contracts.push(futures_contract(family, name, "202602", &code_b, reference));
        contracts.push(futures_contract(family, name, "202603", &code_c, reference));
        contracts.push(pseudo_contract(family, name, "R1", "202602", reference));
        contracts.push(pseudo_contract(family, name, "R2", "202603", reference));
    }
    contracts.push(ContractInfo {
        symbol: "TXO202602021500C".to_string(),
        code: "TXO21500B6".to_string(),
        name: "TAIEX Options 202602 21500 Call".to_string(),
        category: "TXO".to_string(),
        delivery_month: "202602".to_string(),
        product: ProductKind::Options,
        unit: 1,
        limit_up: Decimal::new(2_000, 0),
        limit_down: Decimal::new(1, 0),
        reference: Decimal::new(250, 0),
    });
    contracts
}

// =============================================================================
// Tests
// =============================================================================
