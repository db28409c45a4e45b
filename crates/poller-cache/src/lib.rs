//! External-interface traits the poller core depends on but does not
//! implement: `ConfigCache`, `Preprocessor`, `AvailabilityBus`, `RTC`.
//! Only in-memory stand-ins live here, usable by tests and the dev binary —
//! production deployments plug in their own implementations backed by the
//! real shared cache, preprocessing pipeline, and IPC buses.

use async_trait::async_trait;
use poller_common::{ErrCode, Interface, InterfaceAvailability, Item, PollerType, ResultValue, Timespec};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// `ConfigCache`: hands out due items and accepts requeues, and owns the
/// interface records `AvailabilityFSM` reads and updates. The only shared
/// mutable state in the system; implementations serialize their own access.
#[async_trait]
pub trait ConfigCache: Send + Sync {
    async fn fetch_due(&self, poller_type: PollerType, timeout: Duration) -> (Vec<Item>, usize);
    async fn next_check(&self, poller_type: PollerType) -> i64;
    async fn requeue(&self, itemid: u64, ts_sec: i64, errcode: ErrCode, poller_type: PollerType) -> i64;
    async fn clean_items(&self, itemids: &[u64]);
    async fn interface(&self, interfaceid: u64) -> Option<Interface>;
    async fn update_availability(&self, interfaceid: u64, availability: InterfaceAvailability);
}

/// `Preprocessor`: the downstream stage that normalizes, throttles, and
/// persists metric values.
#[async_trait]
pub trait Preprocessor: Send + Sync {
    #[allow(clippy::too_many_arguments)]
    async fn submit(
        &self,
        itemid: u64,
        hostid: u64,
        value_type: poller_common::ValueType,
        flags: u32,
        value: Option<ResultValue>,
        ts: Timespec,
        state: poller_common::ItemState,
        err_msg: Option<String>,
    );
    async fn flush(&self);
}

/// `AvailabilityBus`: one-way channel carrying serialized
/// `AvailabilityDelta` blobs to the availability persistence service.
#[async_trait]
pub trait AvailabilityBus: Send + Sync {
    async fn send(&self, bytes: Vec<u8>);
}

/// Runtime-control commands recognized by `PollerLoop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcCommand {
    SnmpCacheReload,
    Shutdown,
}

/// `RTC`: the pub/sub bus carrying operator commands to worker
/// processes.
#[async_trait]
pub trait Rtc: Send + Sync {
    async fn wait(&self, timeout: Duration) -> Option<RtcCommand>;
}

/// In-memory `ConfigCache` backed by a FIFO queue per poller type. Good
/// enough for tests and the dev binary; real deployments fetch from the
/// shared configuration database.
pub struct InMemoryConfigCache {
    queue: Mutex<VecDeque<Item>>,
    interfaces: Mutex<HashMap<u64, Interface>>,
}

impl InMemoryConfigCache {
    pub fn new(items: Vec<Item>) -> Self {
        Self { queue: Mutex::new(items.into()), interfaces: Mutex::new(HashMap::new()) }
    }

    pub fn with_interfaces(items: Vec<Item>, interfaces: Vec<Interface>) -> Self {
        let map = interfaces.into_iter().map(|i| (i.interfaceid, i)).collect();
        Self { queue: Mutex::new(items.into()), interfaces: Mutex::new(map) }
    }

    pub async fn push(&self, item: Item) {
        self.queue.lock().await.push_back(item);
    }
}

#[async_trait]
impl ConfigCache for InMemoryConfigCache {
    async fn fetch_due(&self, _poller_type: PollerType, _timeout: Duration) -> (Vec<Item>, usize) {
        let mut queue = self.queue.lock().await;
        let n = queue.len().min(poller_common::MAX_POLLER_ITEMS);
        let batch: Vec<Item> = queue.drain(..n).collect();
        let len = batch.len();
        (batch, len)
    }

    async fn next_check(&self, _poller_type: PollerType) -> i64 {
        Timespec::now().sec + 1
    }

    async fn requeue(&self, itemid: u64, ts_sec: i64, errcode: ErrCode, _poller_type: PollerType) -> i64 {
        debug!(itemid, ts_sec, ?errcode, "requeue (in-memory, no-op persistence)");
        ts_sec + 1
    }

    async fn clean_items(&self, itemids: &[u64]) {
        debug!(count = itemids.len(), "clean_items (in-memory, no-op)");
    }

    async fn interface(&self, interfaceid: u64) -> Option<Interface> {
        self.interfaces.lock().await.get(&interfaceid).cloned()
    }

    async fn update_availability(&self, interfaceid: u64, availability: InterfaceAvailability) {
        if let Some(interface) = self.interfaces.lock().await.get_mut(&interfaceid) {
            interface.availability = availability;
        }
    }
}

/// In-memory `Preprocessor` that just records submissions, for assertions in
/// tests.
#[derive(Debug, Clone)]
pub struct Submission {
    pub itemid: u64,
    pub hostid: u64,
    pub ts: Timespec,
    pub state: poller_common::ItemState,
    pub value: Option<ResultValue>,
    pub err_msg: Option<String>,
}

#[derive(Default)]
pub struct InMemoryPreprocessor {
    submissions: Mutex<Vec<Submission>>,
}

impl InMemoryPreprocessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().await.clone()
    }
}

#[async_trait]
impl Preprocessor for InMemoryPreprocessor {
    async fn submit(
        &self,
        itemid: u64,
        hostid: u64,
        _value_type: poller_common::ValueType,
        _flags: u32,
        value: Option<ResultValue>,
        ts: Timespec,
        state: poller_common::ItemState,
        err_msg: Option<String>,
    ) {
        self.submissions.lock().await.push(Submission { itemid, hostid, ts, state, value, err_msg });
    }

    async fn flush(&self) {
        debug!("preprocessor flush (in-memory, no backpressure)");
    }
}

/// In-memory `AvailabilityBus` recording every flushed blob.
#[derive(Default)]
pub struct InMemoryAvailabilityBus {
    sent: Mutex<Vec<Vec<u8>>>,
}

impl InMemoryAvailabilityBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl AvailabilityBus for InMemoryAvailabilityBus {
    async fn send(&self, bytes: Vec<u8>) {
        self.sent.lock().await.push(bytes);
    }
}

/// `RTC` channel driven by an `mpsc::Sender<RtcCommand>` held by the test or
/// the process's signal handler.
pub struct ChannelRtc {
    receiver: Mutex<mpsc::Receiver<RtcCommand>>,
}

impl ChannelRtc {
    pub fn new() -> (Self, mpsc::Sender<RtcCommand>) {
        let (tx, rx) = mpsc::channel(16);
        (Self { receiver: Mutex::new(rx) }, tx)
    }
}

#[async_trait]
impl Rtc for ChannelRtc {
    async fn wait(&self, timeout: Duration) -> Option<RtcCommand> {
        let mut receiver = self.receiver.lock().await;
        tokio::time::timeout(timeout, receiver.recv()).await.unwrap_or(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poller_common::{Host, ItemState, ItemType, ValueType};

    fn item(id: u64) -> Item {
        Item {
            itemid: id,
            itype: ItemType::AgentPassive,
            key_orig: "agent.ping".into(),
            key: None,
            host: Host { hostid: 1, hostname: "web01".into() },
            interfaceid: Some(1),
            value_type: ValueType::Numeric,
            flags: 0,
            state: ItemState::Normal,
            port_orig: "10050".into(),
            port: None,
            type_fields: poller_common::TypeFields::None,
        }
    }

    #[tokio::test]
    async fn fetch_due_drains_up_to_max_items() {
        let cache = InMemoryConfigCache::new(vec![item(1), item(2)]);
        let (batch, n) = cache.fetch_due(PollerType::Normal, Duration::from_secs(1)).await;
        assert_eq!(n, 2);
        assert_eq!(batch.len(), 2);

        let (empty, n) = cache.fetch_due(PollerType::Normal, Duration::from_secs(1)).await;
        assert_eq!(n, 0);
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn preprocessor_records_submissions() {
        let pp = InMemoryPreprocessor::new();
        pp.submit(1, 1, ValueType::Numeric, 0, None, Timespec::now(), ItemState::Normal, None).await;
        assert_eq!(pp.submissions().await.len(), 1);
    }

    #[tokio::test]
    async fn rtc_wait_times_out_without_a_command() {
        let (rtc, _tx) = ChannelRtc::new();
        let cmd = rtc.wait(Duration::from_millis(10)).await;
        assert!(cmd.is_none());
    }

    #[tokio::test]
    async fn rtc_delivers_shutdown_command() {
        let (rtc, tx) = ChannelRtc::new();
        tx.send(RtcCommand::Shutdown).await.unwrap();
        let cmd = rtc.wait(Duration::from_secs(1)).await;
        assert_eq!(cmd, Some(RtcCommand::Shutdown));
    }
}
