//! `PollerLoop`: the top-level per-cycle algorithm tying every other
//! component together. Fetch a due-item batch, prepare it, dispatch it
//! (synchronously or through the HTTP engine), settle each item's
//! availability and preprocessor submission, requeue, and sleep until the
//! next check or a control event.

mod buffer;
mod executor;

pub use buffer::AvailabilityBatchBuffer;
pub use executor::{Executor, HttpExecutor, PolledCompletion, SyncExecutor};

use poller_availability::{AvailabilityFsm, AvailabilityLogContext};
use poller_cache::{AvailabilityBus, ConfigCache, Preprocessor, Rtc, RtcCommand};
use poller_common::{
    interface_availability_by_item_type, ErrCode, Item, ItemSlot, ItemState, PollerType, Timespec,
};
use poller_macro::MacroExpander;
use poller_prepare::ItemPreparer;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Self-monitoring snapshot of the most recently completed cycle, exposed
/// for the health/metrics surface.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub fetched: usize,
    pub activated: usize,
    pub deactivated: usize,
    pub submissions: usize,
    pub requeues: usize,
}

pub enum CycleOutcome {
    /// Nothing due; caller should sleep for `sleep_secs`.
    Idle { sleep_secs: i64 },
    Processed(CycleStats),
}

pub struct PollerLoop {
    poller_type: PollerType,
    poller_delay_secs: i64,
    fetch_timeout: Duration,
    cache: Arc<dyn ConfigCache>,
    expander: Arc<dyn MacroExpander>,
    preprocessor: Arc<dyn Preprocessor>,
    bus: Arc<dyn AvailabilityBus>,
    rtc: Arc<dyn Rtc>,
    fsm: AvailabilityFsm,
    executor: Box<dyn Executor>,
    last_stats: Arc<parking_lot::RwLock<Option<CycleStats>>>,
}

impl PollerLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        poller_type: PollerType,
        poller_delay_secs: i64,
        fetch_timeout: Duration,
        cache: Arc<dyn ConfigCache>,
        expander: Arc<dyn MacroExpander>,
        preprocessor: Arc<dyn Preprocessor>,
        bus: Arc<dyn AvailabilityBus>,
        rtc: Arc<dyn Rtc>,
        fsm: AvailabilityFsm,
        executor: Box<dyn Executor>,
    ) -> Self {
        Self {
            poller_type,
            poller_delay_secs,
            fetch_timeout,
            cache,
            expander,
            preprocessor,
            bus,
            rtc,
            fsm,
            executor,
            last_stats: Arc::new(parking_lot::RwLock::new(None)),
        }
    }

    pub fn last_cycle_stats(&self) -> Option<CycleStats> {
        self.last_stats.read().clone()
    }

    /// A cheap, independently shareable handle to the running cycle's latest
    /// stats — used by the health surface without needing a lock on the loop
    /// itself (the "process self-monitoring hook").
    pub fn stats_handle(&self) -> Arc<parking_lot::RwLock<Option<CycleStats>>> {
        self.last_stats.clone()
    }

    /// Drives cycles until an RTC `SHUTDOWN` arrives.
    pub async fn run(&mut self) {
        loop {
            let outcome = self.run_cycle().await;
            let sleep_secs = match &outcome {
                CycleOutcome::Idle { sleep_secs } => *sleep_secs,
                CycleOutcome::Processed(stats) => {
                    self.record_metrics(stats);
                    *self.last_stats.write() = Some(stats.clone());
                    0
                }
            };

            match self.rtc.wait(Duration::from_secs(sleep_secs.max(0) as u64)).await {
                Some(RtcCommand::Shutdown) => {
                    info!(poller_type = ?self.poller_type, "shutdown requested, draining in-flight work");
                    let completions = self.executor.shutdown().await;
                    self.settle_completions_with_stats(completions).await;
                    self.preprocessor.flush().await;
                    break;
                }
                Some(RtcCommand::SnmpCacheReload) => {
                    info!("SNMP cache reload requested");
                }
                None => {}
            }
        }
    }

    fn record_metrics(&self, stats: &CycleStats) {
        metrics::gauge!("poller.batch_size").set(stats.fetched as f64);
        metrics::counter!("poller.items.dispatched_total").increment(stats.fetched as u64);
        metrics::counter!("poller.availability.activate_total").increment(stats.activated as u64);
        metrics::counter!("poller.availability.deactivate_total").increment(stats.deactivated as u64);
    }

    /// One full cycle for the non-HTTP poller types driven by `SyncExecutor`.
    /// The HTTP-agent poller type instead uses `run_http_tick`, since
    /// completions there interleave with submission rather than completing
    /// inline.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let (items, n) = self.cache.fetch_due(self.poller_type, self.fetch_timeout).await;
        if n == 0 {
            let next_check = self.cache.next_check(self.poller_type).await;
            let sleep_secs = (next_check - Timespec::now().sec).clamp(0, self.poller_delay_secs);
            return CycleOutcome::Idle { sleep_secs };
        }

        let mut batch: Vec<ItemSlot> = items.into_iter().map(ItemSlot::new).collect();

        let preparer = ItemPreparer::new(self.expander.as_ref());
        preparer.prepare(&mut batch, true).await;

        self.executor.submit(&mut batch).await;

        let ts = Timespec::now();
        let mut buffer = AvailabilityBatchBuffer::new();
        let (activated, deactivated) = self.settle_availability(&batch, ts, &mut buffer).await;

        let mut submissions = 0usize;
        let mut requeues = 0usize;
        let mut ts_cursor = ts;
        for slot in &batch {
            let (emitted, next_cursor) = self.emit_slot(slot, ts_cursor).await;
            submissions += emitted;
            ts_cursor = next_cursor;

            self.cache.requeue(slot.item.itemid, ts_cursor.sec, slot.errcode, self.poller_type).await;
            requeues += 1;
        }

        self.preprocessor.flush().await;

        let itemids: Vec<u64> = batch.iter().map(|slot| slot.item.itemid).collect();
        preparer.clean(&mut batch);
        self.cache.clean_items(&itemids).await;

        buffer.flush_to(self.bus.as_ref()).await;

        CycleOutcome::Processed(CycleStats { fetched: n, activated, deactivated, submissions, requeues })
    }

    /// Drives one admission + drain turn for the HTTP-agent poller type.
    /// `AddItems` submits a freshly fetched batch, then completions already
    /// ready are drained and settled the same way a synchronous batch would
    /// be, one item at a time as they arrive.
    pub async fn run_http_tick(&mut self) -> CycleStats {
        let (items, n) = self.cache.fetch_due(self.poller_type, self.fetch_timeout).await;
        let mut stats = CycleStats::default();
        stats.fetched = n;

        if n > 0 {
            let mut batch: Vec<ItemSlot> = items.into_iter().map(ItemSlot::new).collect();
            let preparer = ItemPreparer::new(self.expander.as_ref());
            preparer.prepare(&mut batch, true).await;

            // Items failing preparation are emitted immediately as
            // NotSupported and requeued rather than submitted.
            let mut to_submit = Vec::new();
            for slot in batch {
                if slot.item.state == ItemState::NotSupported {
                    let ts = Timespec::now();
                    self.emit_slot(&slot, ts).await;
                    self.cache.requeue(slot.item.itemid, ts.sec, ErrCode::ConfigError, self.poller_type).await;
                    stats.requeues += 1;
                } else {
                    to_submit.push(slot);
                }
            }

            let mut submit_batch = to_submit;
            self.executor.submit(&mut submit_batch).await;
            preparer.clean(&mut submit_batch);
        }

        let completions = self.executor.poll().await;
        metrics::gauge!("poller.http.inflight").set(completions.len() as f64);
        metrics::counter!("poller.http.completions_total").increment(completions.len() as u64);
        let (emitted, requeued, activated, deactivated) = self.settle_completions_with_stats(completions).await;
        stats.submissions += emitted;
        stats.requeues += requeued;
        stats.activated += activated;
        stats.deactivated += deactivated;

        stats
    }

    async fn settle_completions_with_stats(
        &mut self,
        completions: Vec<PolledCompletion>,
    ) -> (usize, usize, usize, usize) {
        let mut emitted = 0;
        let mut requeued = 0;
        let mut activated = 0;
        let mut deactivated = 0;

        for completion in completions {
            let item = placeholder_item(&completion);
            let slot = ItemSlot { item, result: completion.result, errcode: completion.errcode };

            let mut buffer = AvailabilityBatchBuffer::new();
            let (a, d) = self.settle_availability(std::slice::from_ref(&slot), completion.ts, &mut buffer).await;
            activated += a;
            deactivated += d;
            buffer.flush_to(self.bus.as_ref()).await;

            let (count, _) = self.emit_slot(&slot, completion.ts).await;
            emitted += count;

            self.cache.requeue(completion.itemid, completion.ts.sec, slot.errcode, self.poller_type).await;
            requeued += 1;
        }

        (emitted, requeued, activated, deactivated)
    }

    /// At most one activate and one deactivate transition per interface per
    /// batch.
    async fn settle_availability(
        &self,
        batch: &[ItemSlot],
        ts: Timespec,
        buffer: &mut AvailabilityBatchBuffer,
    ) -> (usize, usize) {
        let mut seen_true = HashSet::new();
        let mut seen_false = HashSet::new();
        let mut activated = 0;
        let mut deactivated = 0;

        for slot in batch {
            let Some(interfaceid) = slot.item.interfaceid else { continue };
            let Some(interface) = self.cache.interface(interfaceid).await else { continue };
            if !interface_availability_by_item_type(slot.item.itype, interface.itype) {
                continue;
            }

            let ctx = AvailabilityLogContext {
                interface_type: interface_type_label(interface.itype),
                hostname: &slot.item.host.hostname,
                item_key: slot.item.key.as_deref().unwrap_or(slot.item.key_orig.as_str()),
            };

            match slot.errcode {
                ErrCode::Success | ErrCode::NotSupported | ErrCode::AgentError => {
                    if seen_true.insert(interfaceid) {
                        let t = self.fsm.activate(interfaceid, ts, &interface.availability, ctx);
                        if t.changed {
                            activated += 1;
                            self.cache.update_availability(interfaceid, t.out).await;
                        }
                        if let Some(delta) = t.delta {
                            buffer.append_delta(&delta);
                        }
                    }
                }
                ErrCode::NetworkError | ErrCode::GatewayError | ErrCode::TimeoutError => {
                    if seen_false.insert(interfaceid) {
                        let message = slot.result.message.clone().unwrap_or_default();
                        let t = self.fsm.deactivate(interfaceid, ts, &interface.availability, &message, ctx);
                        if t.changed {
                            deactivated += 1;
                            self.cache.update_availability(interfaceid, t.out).await;
                        }
                        if let Some(delta) = t.delta {
                            buffer.append_delta(&delta);
                        }
                    }
                }
                ErrCode::ConfigError | ErrCode::SignalError => {}
            }
        }

        (activated, deactivated)
    }

    /// Emit zero or more preprocessed values for one item, returning how
    /// many were emitted and the timestamp cursor to use for the next item
    /// (advanced past any sub-results emitted here).
    async fn emit_slot(&self, slot: &ItemSlot, ts: Timespec) -> (usize, Timespec) {
        let itemid = slot.item.itemid;
        let hostid = slot.item.host.hostid;
        let value_type = slot.item.value_type;
        let flags = slot.item.flags;

        match slot.errcode {
            ErrCode::Success if slot.result.sub_results.is_empty() => {
                self.preprocessor
                    .submit(itemid, hostid, value_type, flags, slot.result.value.clone(), ts, ItemState::Normal, None)
                    .await;
                (1, ts)
            }
            ErrCode::Success => {
                let mut cursor = ts;
                for sub in &slot.result.sub_results {
                    if let Some(message) = &sub.message {
                        self.preprocessor
                            .submit(itemid, hostid, value_type, flags, None, cursor, ItemState::NotSupported, Some(message.clone()))
                            .await;
                    } else {
                        self.preprocessor
                            .submit(itemid, hostid, value_type, flags, sub.value.clone(), cursor, ItemState::Normal, None)
                            .await;
                    }
                    cursor = cursor.next_subresult();
                }
                (slot.result.sub_results.len(), cursor)
            }
            ErrCode::NotSupported | ErrCode::AgentError | ErrCode::ConfigError => {
                self.preprocessor
                    .submit(itemid, hostid, value_type, flags, None, ts, ItemState::NotSupported, slot.result.message.clone())
                    .await;
                (1, ts)
            }
            ErrCode::NetworkError | ErrCode::GatewayError | ErrCode::TimeoutError | ErrCode::SignalError => {
                debug!(itemid, errcode = ?slot.errcode, "no preprocessor submission for this errcode");
                (0, ts)
            }
        }
    }
}

fn interface_type_label(itype: poller_common::InterfaceType) -> &'static str {
    match itype {
        poller_common::InterfaceType::Agent => "agent",
        poller_common::InterfaceType::Snmp => "SNMP",
        poller_common::InterfaceType::Jmx => "JMX",
        poller_common::InterfaceType::Ipmi => "IPMI",
    }
}

/// `HttpAsyncEngine` completions only carry an `HttpContext`, not the full
/// `Item` — this rebuilds just enough of an `Item` shell to route through
/// the same `emit_slot`/`settle_availability` paths the sync cycle uses.
/// `interfaceid` is left unset because HTTP items are never availability-FSM
/// participants under the current type-compatibility table: HttpAgent has no
/// entry in `{Agent, SNMP, JMX}`.
fn placeholder_item(completion: &PolledCompletion) -> Item {
    Item {
        itemid: completion.itemid,
        itype: poller_common::ItemType::HttpAgent,
        key_orig: String::new(),
        key: None,
        host: poller_common::Host { hostid: completion.hostid, hostname: String::new() },
        interfaceid: None,
        value_type: completion.value_type,
        flags: completion.flags,
        state: completion.state,
        port_orig: String::new(),
        port: None,
        type_fields: poller_common::TypeFields::None,
    }
}
