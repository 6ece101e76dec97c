//! Quote Manager
//!
//! Makes upstream push callbacks look like a stable per-alias stream, even
//! though the upstream keys data by an opaque exchange code that differs
//! from the client alias and can change across contract rolls.
//!
//! - Subscriptions are refcounted per alias: only the 0→1 transition places
//!   the upstream tick + bid/ask pair, only the 1→0 transition removes it.
//! - Callbacks never run user logic: the upstream pushes raw events into a
//!   channel and a dedicated consumer task resolves, normalizes, and
//!   publishes. A single bad event is logged and dropped.
//! - A callback under an unknown exchange code attempts a *dynamic binding*:
//!   the catalog resolves the code to its contract series, and the
//!   subscribed pseudo-symbol of that family whose delivery month matches
//!   adopts it, so future callbacks resolve in O(1). When both roles of a
//!   family are held, each code can only bind to the role covering its own
//!   expiry. A code the catalog does not know binds by family prefix only
//!   while a single unbound role is eligible.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::{ContractInfo, UpstreamError, UpstreamPort, UpstreamQuoteEvent};
use crate::bus::CorrelationBus;
use crate::models::{QuoteFrame, QuoteKind};
use crate::session::{is_pseudo_symbol, pseudo_family, SessionManager};

struct SubscriptionEntry {
    contract: ContractInfo,
    refcount: usize,
}

/// Refcounted subscription table and fan-in pipeline.
pub struct QuoteManager {
    upstream: Arc<dyn UpstreamPort>,
    bus: Arc<CorrelationBus>,
    session: Arc<SessionManager>,
    entries: Mutex<HashMap<String, SubscriptionEntry>>,
    code_to_alias: Mutex<HashMap<String, String>>,
}

impl QuoteManager {
    /// Create a manager with an empty subscription table. The session
    /// provides the contract catalog used to resolve exchange codes.
    #[must_use]
    pub fn new(
        upstream: Arc<dyn UpstreamPort>,
        bus: Arc<CorrelationBus>,
        session: Arc<SessionManager>,
    ) -> Self {
        Self {
            upstream,
            bus,
            session,
            entries: Mutex::new(HashMap::new()),
            code_to_alias: Mutex::new(HashMap::new()),
        }
    }

    /// Join the subscription for `alias`. Places the upstream tick and
    /// bid/ask subscriptions only when the refcount crosses 0→1; partial
    /// upstream failure is rolled back and reported.
    ///
    /// Returns the refcount after the join.
    ///
    /// # Errors
    ///
    /// Propagates the upstream subscription failure; the table is unchanged.
    pub async fn subscribe(
        &self,
        alias: &str,
        contract: &ContractInfo,
    ) -> Result<usize, UpstreamError> {
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get_mut(alias) {
                entry.refcount += 1;
                tracing::debug!(alias, refcount = entry.refcount, "subscription joined");
                return Ok(entry.refcount);
            }
        }

        self.upstream
            .subscribe_quote(contract, QuoteKind::Tick)
            .await?;
        if let Err(err) = self
            .upstream
            .subscribe_quote(contract, QuoteKind::BidAsk)
            .await
        {
            // Partial subscription counts as failure; roll the tick leg back.
            if let Err(rollback) = self
                .upstream
                .unsubscribe_quote(contract, QuoteKind::Tick)
                .await
            {
                tracing::warn!(alias, error = %rollback, "tick rollback failed");
            }
            return Err(err);
        }

        let refcount = {
            let mut entries = self.entries.lock();
            entries.insert(
                alias.to_string(),
                SubscriptionEntry {
                    contract: contract.clone(),
                    refcount: 1,
                },
            );
            self.code_to_alias
                .lock()
                .insert(contract.code.clone(), alias.to_string());
            crate::metrics::set_quote_subscriptions(entries.len());
            1
        };

        tracing::info!(alias, code = %contract.code, "upstream subscription placed");
        Ok(refcount)
    }

    /// Leave the subscription for `alias`. Removes the upstream pair only
    /// when the refcount crosses 1→0.
    ///
    /// Returns the refcount after the leave, or `None` when the alias had no
    /// subscription.
    pub async fn unsubscribe(&self, alias: &str) -> Option<usize> {
        let contract = {
            let mut entries = self.entries.lock();
            let entry = entries.get_mut(alias)?;
            if entry.refcount > 1 {
                entry.refcount -= 1;
                tracing::debug!(alias, refcount = entry.refcount, "subscription left");
                return Some(entry.refcount);
            }

            let entry = entries.remove(alias)?;
            self.code_to_alias.lock().retain(|_, a| a != alias);
            crate::metrics::set_quote_subscriptions(entries.len());
            entry.contract
        };

        for kind in [QuoteKind::Tick, QuoteKind::BidAsk] {
            if let Err(err) = self.upstream.unsubscribe_quote(&contract, kind).await {
                tracing::warn!(alias, error = %err, "upstream unsubscribe failed");
            }
        }

        tracing::info!(alias, code = %contract.code, "upstream subscription removed");
        Some(0)
    }

    /// Refcount for an alias (0 when unknown).
    #[must_use]
    pub fn refcount(&self, alias: &str) -> usize {
        self.entries
            .lock()
            .get(alias)
            .map_or(0, |entry| entry.refcount)
    }

    /// Aliases with an active upstream subscription.
    #[must_use]
    pub fn active_aliases(&self) -> Vec<String> {
        self.entries.lock().keys().cloned().collect()
    }

    /// The alias currently bound to an exchange code.
    #[must_use]
    pub fn alias_for_code(&self, code: &str) -> Option<String> {
        self.code_to_alias.lock().get(code).cloned()
    }

    /// Resolve a callback's exchange code to the client-facing alias,
    /// attempting a dynamic binding for near-month pseudo-symbols on a miss.
    fn resolve_alias(&self, code: &str) -> Option<String> {
        if let Some(alias) = self.code_to_alias.lock().get(code) {
            return Some(alias.clone());
        }

        let alias = self.bind_alias(code)?;
        self.code_to_alias
            .lock()
            .insert(code.to_string(), alias.clone());
        tracing::info!(code, alias = %alias, "bound exchange code to alias");
        Some(alias)
    }

    /// Pick which subscribed pseudo-symbol an unmapped exchange code
    /// belongs to.
    ///
    /// When the catalog knows the code, the code's contract series decides:
    /// only the role whose delivery month equals the series' month may
    /// claim it, so with both roles of a family subscribed each code binds
    /// to its own expiry regardless of arrival order. A code outside the
    /// catalog falls back to a family-prefix match restricted to roles that
    /// hold no binding yet; anything still ambiguous is refused.
    fn bind_alias(&self, code: &str) -> Option<String> {
        let catalog = self.session.catalog();
        let series = catalog
            .as_ref()
            .and_then(|catalog| catalog.by_code(code))
            .map(|contract| (contract.category.clone(), contract.delivery_month.clone()));

        let entries = self.entries.lock();
        if let Some((family, month)) = series {
            return entries
                .iter()
                .find(|(alias, entry)| {
                    is_pseudo_symbol(alias)
                        && entry.contract.category == family
                        && entry.contract.delivery_month == month
                })
                .map(|(alias, _)| alias.clone());
        }

        // The self-mapping recorded at subscribe time (code == alias) does
        // not count as a binding.
        let bound_aliases: HashSet<String> = self
            .code_to_alias
            .lock()
            .iter()
            .filter(|(mapped_code, alias)| mapped_code != alias)
            .map(|(_, alias)| alias.clone())
            .collect();

        let mut candidates = entries.keys().filter(|alias| {
            pseudo_family(alias).is_some_and(|family| code.starts_with(family))
                && !bound_aliases.contains(alias.as_str())
        });
        let candidate = candidates.next()?;
        if candidates.next().is_some() {
            tracing::warn!(code, "multiple pseudo-symbols could claim exchange code");
            return None;
        }
        Some(candidate.clone())
    }

    fn handle_event(&self, event: &UpstreamQuoteEvent) {
        let code = event.code();
        let Some(alias) = self.resolve_alias(code) else {
            tracing::debug!(code, "dropping quote for unmapped exchange code");
            crate::metrics::record_quote_dropped();
            return;
        };

        let frame = match event {
            UpstreamQuoteEvent::Tick { tick, .. } => QuoteFrame::tick(&alias, code, tick),
            UpstreamQuoteEvent::BidAsk { bid_ask, .. } => {
                QuoteFrame::bid_ask(&alias, code, bid_ask)
            }
        };
        crate::metrics::record_quote_published(frame.quote_type);
        self.bus.publish(&alias, frame);
    }

    /// Spawn the consumer task that drains upstream callback events,
    /// normalizes them, and publishes on the bus. One bad event never kills
    /// the task.
    pub fn spawn_consumer(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<UpstreamQuoteEvent>,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        tracing::info!("quote consumer shutting down");
                        break;
                    }
                    maybe = events.recv() => {
                        match maybe {
                            Some(event) => manager.handle_event(&event),
                            None => {
                                tracing::warn!("upstream quote channel closed");
                                break;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Remove every upstream subscription. Called on worker retirement.
    pub async fn cleanup(&self) {
        let contracts: Vec<(String, ContractInfo)> = {
            let mut entries = self.entries.lock();
            self.code_to_alias.lock().clear();
            let drained = entries
                .drain()
                .map(|(alias, entry)| (alias, entry.contract))
                .collect();
            crate::metrics::set_quote_subscriptions(0);
            drained
        };

        for (alias, contract) in contracts {
            for kind in [QuoteKind::Tick, QuoteKind::BidAsk] {
                if let Err(err) = self.upstream.unsubscribe_quote(&contract, kind).await {
                    tracing::warn!(alias = %alias, error = %err, "cleanup unsubscribe failed");
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::sim::SimUpstream;
    use crate::broker::TickData;
    use crate::bus::{BusConfig, CorrelationBus};
    use crate::config::{SessionSettings, TradingMode};

    struct Fixture {
        sim: Arc<SimUpstream>,
        bus: Arc<CorrelationBus>,
        manager: Arc<QuoteManager>,
    }

    async fn fixture() -> Fixture {
        let sim = Arc::new(SimUpstream::new());
        let upstream: Arc<dyn UpstreamPort> = Arc::clone(&sim) as Arc<dyn UpstreamPort>;
        let (bus, _queue) = CorrelationBus::new(BusConfig::default());
        let bus = Arc::new(bus);
        let session = Arc::new(SessionManager::new(
            Arc::clone(&upstream),
            TradingMode::Simulation,
            SessionSettings::default(),
            vec![],
        ));
        assert!(session.establish().await);
        let manager = Arc::new(QuoteManager::new(upstream, Arc::clone(&bus), session));
        Fixture { sim, bus, manager }
    }

    fn contract(symbol: &str, code: &str, family: &str, month: &str) -> ContractInfo {
        use rust_decimal::Decimal;

        use crate::broker::ProductKind;
        ContractInfo {
            symbol: symbol.to_string(),
            code: code.to_string(),
            name: symbol.to_string(),
            category: family.to_string(),
            delivery_month: month.to_string(),
            product: ProductKind::Futures,
            unit: 1,
            limit_up: Decimal::new(1, 0),
            limit_down: Decimal::new(1, 0),
            reference: Decimal::new(1, 0),
        }
    }

    fn tick(ts: i64) -> TickData {
        TickData {
            close: 17_500.0,
            open: 17_480.0,
            high: 17_520.0,
            low: 17_470.0,
            change_price: 20.0,
            change_rate: 0.11,
            volume: 1,
            total_volume: 100,
            ts,
        }
    }

    #[tokio::test]
    async fn refcount_crossings_drive_upstream_calls() {
        let fx = fixture().await;
        let mxfr1 = contract("MXFR1", "MXFR1", "MXF", "202602");

        // 0→1: one tick + one bid/ask subscription.
        assert_eq!(fx.manager.subscribe("MXFR1", &mxfr1).await.unwrap(), 1);
        assert_eq!(fx.sim.subscribe_calls(), 2);

        // 1→2: no upstream call.
        assert_eq!(fx.manager.subscribe("MXFR1", &mxfr1).await.unwrap(), 2);
        assert_eq!(fx.sim.subscribe_calls(), 2);

        // 2→1: no upstream call.
        assert_eq!(fx.manager.unsubscribe("MXFR1").await, Some(1));
        assert_eq!(fx.sim.unsubscribe_calls(), 0);

        // 1→0: the pair is removed.
        assert_eq!(fx.manager.unsubscribe("MXFR1").await, Some(0));
        assert_eq!(fx.sim.unsubscribe_calls(), 2);
        assert_eq!(fx.manager.refcount("MXFR1"), 0);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_alias_is_none() {
        let fx = fixture().await;
        assert_eq!(fx.manager.unsubscribe("TMFR1").await, None);
    }

    #[tokio::test]
    async fn partial_subscription_failure_rolls_back() {
        let fx = fixture().await;
        let tmfr1 = contract("TMFR1", "TMFR1", "TMF", "202602");

        // Tick leg succeeds, bid/ask leg fails.
        fx.sim.inject_fault_after(
            1,
            UpstreamError::SubscriptionRejected {
                code: "TMFR1".to_string(),
                reason: "quota exceeded".to_string(),
            },
        );
        assert!(fx.manager.subscribe("TMFR1", &tmfr1).await.is_err());

        // The tick leg was rolled back and no table entry survived.
        assert_eq!(fx.sim.subscribe_calls(), 1);
        assert_eq!(fx.sim.unsubscribe_calls(), 1);
        assert!(fx.sim.active_subscriptions().is_empty());
        assert_eq!(fx.manager.refcount("TMFR1"), 0);
        assert!(fx.manager.alias_for_code("TMFR1").is_none());
    }

    #[tokio::test]
    async fn tick_leg_failure_reports_without_rollback() {
        let fx = fixture().await;
        let tmfr1 = contract("TMFR1", "TMFR1", "TMF", "202602");

        fx.sim.inject_fault(UpstreamError::SubscriptionRejected {
            code: "TMFR1".to_string(),
            reason: "quota exceeded".to_string(),
        });
        assert!(fx.manager.subscribe("TMFR1", &tmfr1).await.is_err());
        assert_eq!(fx.manager.refcount("TMFR1"), 0);
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_restores_table() {
        let fx = fixture().await;
        let tmfr1 = contract("TMFR1", "TMFR1", "TMF", "202602");

        assert!(fx.manager.active_aliases().is_empty());
        fx.manager.subscribe("TMFR1", &tmfr1).await.unwrap();
        fx.manager.unsubscribe("TMFR1").await;

        assert!(fx.manager.active_aliases().is_empty());
        assert!(fx.manager.alias_for_code("TMFR1").is_none());
        assert!(fx.sim.active_subscriptions().is_empty());
    }

    #[tokio::test]
    async fn dynamic_binding_adopts_exchange_code() {
        let fx = fixture().await;
        let tmfr1 = contract("TMFR1", "TMFR1", "TMF", "202602");
        fx.manager.subscribe("TMFR1", &tmfr1).await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        fx.sim.install_quote_sink(tx);
        let shutdown = CancellationToken::new();
        let consumer = fx.manager.spawn_consumer(rx, shutdown.clone());

        let mut quotes = fx.bus.subscribe_quotes();

        // First tick arrives under the concrete month code, not the alias.
        fx.sim.emit_tick("TMFB6", tick(1));
        let event = quotes.recv().await.unwrap();
        assert_eq!(event.channel, "quote.TMFR1");
        assert_eq!(event.frame.symbol, "TMFR1");
        assert_eq!(event.frame.code, "TMFB6");

        // The binding is recorded for O(1) resolution.
        assert_eq!(fx.manager.alias_for_code("TMFB6").unwrap(), "TMFR1");

        fx.sim.emit_tick("TMFB6", tick(2));
        let event = quotes.recv().await.unwrap();
        assert_eq!(event.frame.symbol, "TMFR1");
        assert_eq!(event.frame.timestamp, 2);

        shutdown.cancel();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn both_roles_bind_to_their_own_series() {
        let fx = fixture().await;
        fx.manager
            .subscribe("TMFR1", &contract("TMFR1", "TMFR1", "TMF", "202602"))
            .await
            .unwrap();
        fx.manager
            .subscribe("TMFR2", &contract("TMFR2", "TMFR2", "TMF", "202603"))
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        fx.sim.install_quote_sink(tx);
        let shutdown = CancellationToken::new();
        let consumer = fx.manager.spawn_consumer(rx, shutdown.clone());

        let mut quotes = fx.bus.subscribe_quotes();

        // The further expiry arrives first; it must not claim the
        // near-month role.
        fx.sim.emit_tick("TMFC6", tick(1));
        let event = quotes.recv().await.unwrap();
        assert_eq!(event.frame.symbol, "TMFR2");
        assert_eq!(event.frame.code, "TMFC6");

        fx.sim.emit_tick("TMFB6", tick(2));
        let event = quotes.recv().await.unwrap();
        assert_eq!(event.frame.symbol, "TMFR1");
        assert_eq!(event.frame.code, "TMFB6");

        assert_eq!(fx.manager.alias_for_code("TMFC6").unwrap(), "TMFR2");
        assert_eq!(fx.manager.alias_for_code("TMFB6").unwrap(), "TMFR1");

        shutdown.cancel();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_series_with_both_roles_is_dropped() {
        let fx = fixture().await;
        fx.manager
            .subscribe("TMFR1", &contract("TMFR1", "TMFR1", "TMF", "202602"))
            .await
            .unwrap();
        fx.manager
            .subscribe("TMFR2", &contract("TMFR2", "TMFR2", "TMF", "202603"))
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        fx.sim.install_quote_sink(tx);
        let shutdown = CancellationToken::new();
        let consumer = fx.manager.spawn_consumer(rx, shutdown.clone());

        let mut quotes = fx.bus.subscribe_quotes();

        // TMFZ9 is outside the catalog and both roles could match the
        // prefix, so no binding is made.
        fx.sim.emit_tick("TMFZ9", tick(1));
        fx.sim.emit_tick("TMFB6", tick(2));

        let event = quotes.recv().await.unwrap();
        assert_eq!(event.frame.symbol, "TMFR1");
        assert_eq!(event.frame.timestamp, 2);
        assert!(fx.manager.alias_for_code("TMFZ9").is_none());

        shutdown.cancel();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_series_binds_the_single_unbound_role() {
        let fx = fixture().await;
        fx.manager
            .subscribe("MXFR1", &contract("MXFR1", "MXFR1", "MXF", "202602"))
            .await
            .unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        fx.sim.install_quote_sink(tx);
        let shutdown = CancellationToken::new();
        let consumer = fx.manager.spawn_consumer(rx, shutdown.clone());

        let mut quotes = fx.bus.subscribe_quotes();

        // MXFZ9 is outside the catalog, but only one unbound role exists.
        fx.sim.emit_tick("MXFZ9", tick(1));
        let event = quotes.recv().await.unwrap();
        assert_eq!(event.frame.symbol, "MXFR1");
        assert_eq!(fx.manager.alias_for_code("MXFZ9").unwrap(), "MXFR1");

        // A second unknown code cannot re-bind to a role that already owns
        // one; it is dropped instead of starving anything.
        fx.sim.emit_tick("MXFZ8", tick(2));
        fx.sim.emit_tick("MXFZ9", tick(3));
        let event = quotes.recv().await.unwrap();
        assert_eq!(event.frame.symbol, "MXFR1");
        assert_eq!(event.frame.timestamp, 3);
        assert!(fx.manager.alias_for_code("MXFZ8").is_none());

        shutdown.cancel();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn unmapped_code_is_dropped_not_published() {
        let fx = fixture().await;
        let mxf = contract("MXF202602", "MXFB6", "MXF", "202602");
        fx.manager.subscribe("MXF202602", &mxf).await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        fx.sim.install_quote_sink(tx);
        let shutdown = CancellationToken::new();
        let consumer = fx.manager.spawn_consumer(rx, shutdown.clone());

        let mut quotes = fx.bus.subscribe_quotes();

        // GDFB6 matches no subscription and no pseudo family.
        fx.sim.emit_tick("GDFB6", tick(1));
        fx.sim.emit_tick("MXFB6", tick(2));

        // Only the mapped tick comes through.
        let event = quotes.recv().await.unwrap();
        assert_eq!(event.frame.symbol, "MXF202602");
        assert_eq!(event.frame.timestamp, 2);

        shutdown.cancel();
        consumer.await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_removes_everything() {
        let fx = fixture().await;
        fx.manager
            .subscribe("TMFR1", &contract("TMFR1", "TMFR1", "TMF", "202602"))
            .await
            .unwrap();
        fx.manager
            .subscribe("MXFR1", &contract("MXFR1", "MXFR1", "MXF", "202602"))
            .await
            .unwrap();

        fx.manager.cleanup().await;
        assert!(fx.manager.active_aliases().is_empty());
        assert!(fx.sim.active_subscriptions().is_empty());
    }
}
