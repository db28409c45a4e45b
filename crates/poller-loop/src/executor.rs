//! The `Executor` capability: a common `{ submit(batch), poll() }` shape
//! shared by the synchronous `CheckDispatcher` (completes inline, inside
//! `submit`) and the asynchronous `HttpAsyncEngine` (completes across `poll`
//! turns). The loop picks the executor by poller type.

use async_trait::async_trait;
use poller_common::{Batch, CheckResult, ErrCode, ItemState, Timespec, ValueType};
use poller_dispatch::CheckDispatcher;
use poller_http::HttpAsyncEngine;

/// One out-of-band completion delivered through `Executor::poll` — only the
/// async executor ever produces these; the sync executor's `submit` already
/// leaves the batch fully resolved.
pub struct PolledCompletion {
    pub itemid: u64,
    pub hostid: u64,
    pub value_type: ValueType,
    pub flags: u32,
    pub state: ItemState,
    pub result: CheckResult,
    pub errcode: ErrCode,
    pub ts: Timespec,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn submit(&mut self, batch: &mut Batch);
    async fn poll(&mut self) -> Vec<PolledCompletion>;

    /// Drains any remaining in-flight work best-effort and stops admitting
    /// more ("Cancellation / shutdown"). The sync executor has nothing in
    /// flight between cycles, so the default is a no-op.
    async fn shutdown(&mut self) -> Vec<PolledCompletion> {
        Vec::new()
    }
}

/// Wraps `CheckDispatcher` for the non-HTTP poller types. `submit` completes
/// every slot in place; `poll` never has anything to report.
pub struct SyncExecutor {
    dispatcher: CheckDispatcher,
}

impl SyncExecutor {
    pub fn new(dispatcher: CheckDispatcher) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl Executor for SyncExecutor {
    async fn submit(&mut self, batch: &mut Batch) {
        self.dispatcher.run(batch).await;
    }

    async fn poll(&mut self) -> Vec<PolledCompletion> {
        Vec::new()
    }
}

/// Wraps `HttpAsyncEngine` for the dedicated HTTP-agent poller type.
/// `submit` only enqueues requests ("submits each successfully prepared item
/// as a new HttpContext"); completions stream out of `poll` on later turns,
/// out of submission order.
pub struct HttpExecutor {
    engine: HttpAsyncEngine,
}

impl HttpExecutor {
    pub fn new(engine: HttpAsyncEngine) -> Self {
        Self { engine }
    }

    pub fn in_flight(&self) -> usize {
        self.engine.in_flight()
    }
}

#[async_trait]
impl Executor for HttpExecutor {
    async fn submit(&mut self, batch: &mut Batch) {
        for slot in batch.iter() {
            self.engine.submit(&slot.item);
        }
    }

    async fn poll(&mut self) -> Vec<PolledCompletion> {
        self.engine.drain_ready().await.into_iter().map(from_http_completion).collect()
    }

    async fn shutdown(&mut self) -> Vec<PolledCompletion> {
        self.engine.shutdown().await.into_iter().map(from_http_completion).collect()
    }
}

fn from_http_completion(completion: poller_http::Completion) -> PolledCompletion {
    PolledCompletion {
        itemid: completion.context.itemid,
        hostid: completion.context.hostid,
        value_type: completion.context.value_type,
        flags: completion.context.flags,
        state: completion.context.state,
        result: completion.result,
        errcode: completion.errcode,
        ts: completion.ts,
    }
}
