//! `HttpAsyncEngine`: the only asynchronous driver path. Items are admitted
//! in small ticks, driven to completion out of order, and drained in one
//! pass per wake. A `tokio::JoinSet` plays the role of a multiplex handle,
//! with each submitted request its own cooperatively scheduled task rather
//! than a libuv/libcurl callback.

use poller_common::{CheckResult, ErrCode, Item, ItemState, ResultValue, Timespec, TypeFields, ValueType};
use poller_config::HttpPollerConfig;
use reqwest::Client;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Per-inflight identity needed to emit a value after completion, without
/// keeping the whole `Item` (and its resolved twins) alive across the
/// request ("HttpContext").
#[derive(Debug, Clone)]
pub struct HttpContext {
    pub itemid: u64,
    pub hostid: u64,
    pub value_type: ValueType,
    pub flags: u32,
    pub state: ItemState,
    /// Resolved `status_codes` field, checked against the response status
    /// once the transport completes.
    pub status_codes: String,
}

/// One drained completion: the context it belongs to, plus the result of
/// interpreting the transport outcome.
pub struct Completion {
    pub context: HttpContext,
    pub result: CheckResult,
    pub errcode: ErrCode,
    pub ts: Timespec,
}

struct TaskOutcome {
    context: HttpContext,
    outcome: Result<(String, u16), String>,
}

pub struct HttpAsyncEngine {
    client: Client,
    max_in_flight: usize,
    tasks: JoinSet<TaskOutcome>,
    shutting_down: bool,
}

impl HttpAsyncEngine {
    pub fn new(config: &HttpPollerConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(Duration::from_millis(config.request_timeout_ms)).build()?;
        Ok(Self { client, max_in_flight: config.max_in_flight, tasks: JoinSet::new(), shutting_down: false })
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.tasks.len() < self.max_in_flight
    }

    /// Submits a prepared `HttpAgent` item as a new in-flight request. Items
    /// failing preparation never reach here — `PollerLoop` emits them as
    /// `NotSupported` immediately ("Items failing preparation...").
    pub fn submit(&mut self, item: &Item) {
        if self.shutting_down {
            warn!(itemid = item.itemid, "rejecting submission during shutdown drain");
            return;
        }

        let TypeFields::HttpAgent(fields) = &item.type_fields else {
            warn!(itemid = item.itemid, "submit called on a non-HttpAgent item");
            return;
        };

        let context = HttpContext {
            itemid: item.itemid,
            hostid: item.host.hostid,
            value_type: item.value_type,
            flags: item.flags,
            state: item.state,
            status_codes: fields.status_codes.resolved().cloned().unwrap_or_default(),
        };

        let Some(url) = fields.url.resolved().cloned() else {
            self.tasks.spawn(async move {
                TaskOutcome { context, outcome: Err("URL did not resolve during preparation".to_string()) }
            });
            return;
        };

        let body = fields.posts.resolved().cloned().unwrap_or_default();
        let post_type = fields.post_type;
        let headers: Vec<(String, String)> = fields
            .headers
            .iter()
            .filter_map(|(name, value)| value.resolved().map(|v| (name.clone(), v.clone())))
            .collect();

        let client = self.client.clone();
        self.tasks.spawn(async move {
            let outcome = execute_request(&client, &url, &body, post_type, &headers).await;
            TaskOutcome { context, outcome }
        });
    }

    /// "CheckMultiInfo": drains every completion ready *right now* without
    /// blocking for more, stamping all of them with one `Timespec` taken at
    /// drain entry ("Ordering and timestamps").
    pub async fn drain_ready(&mut self) -> Vec<Completion> {
        let ts = Timespec::now();
        let mut completions = Vec::new();

        while let Some(joined) = self.tasks.try_join_next() {
            completions.push(self.to_completion(joined, ts));
        }

        completions
    }

    /// Blocks until at least one completion is ready, then drains everything
    /// else already finished under the same timestamp.
    pub async fn drain_next(&mut self) -> Vec<Completion> {
        let Some(first) = self.tasks.join_next().await else {
            return Vec::new();
        };
        let ts = Timespec::now();
        let mut completions = vec![self.to_completion(first, ts)];

        while let Some(joined) = self.tasks.try_join_next() {
            completions.push(self.to_completion(joined, ts));
        }

        completions
    }

    fn to_completion(
        &self,
        joined: Result<TaskOutcome, tokio::task::JoinError>,
        ts: Timespec,
    ) -> Completion {
        match joined {
            Ok(TaskOutcome { context, outcome: Ok((body, status)) }) => {
                if status_code_matches(&context.status_codes, status) {
                    Completion {
                        context,
                        result: CheckResult::success(ResultValue::Text(body)),
                        errcode: ErrCode::Success,
                        ts,
                    }
                } else {
                    let message = format!("HTTP status {status} did not match allowed codes {:?}", context.status_codes);
                    Completion { context, result: CheckResult::error(message), errcode: ErrCode::NotSupported, ts }
                }
            }
            Ok(TaskOutcome { context, outcome: Err(message) }) => {
                Completion { context, result: CheckResult::error(message), errcode: ErrCode::NotSupported, ts }
            }
            Err(join_error) => {
                // A cancelled/panicked task has no context to report through;
                // this can only happen during the hard half of shutdown.
                debug!(%join_error, "HTTP task join failed during drain");
                Completion {
                    context: HttpContext {
                        itemid: 0,
                        hostid: 0,
                        value_type: ValueType::Text,
                        flags: 0,
                        state: ItemState::NotSupported,
                        status_codes: String::new(),
                    },
                    result: CheckResult::error(format!("task join failed: {join_error}")),
                    errcode: ErrCode::SignalError,
                    ts,
                }
            }
        }
    }

    /// "Cancellation / shutdown": stop admitting new items, let in-flight
    /// contexts complete best-effort, then release the client.
    pub async fn shutdown(&mut self) -> Vec<Completion> {
        self.shutting_down = true;
        let ts = Timespec::now();
        let mut completions = Vec::new();

        while let Some(joined) = self.tasks.join_next().await {
            completions.push(self.to_completion(joined, ts));
        }

        completions
    }
}

async fn execute_request(
    client: &Client,
    url: &str,
    body: &str,
    post_type: poller_common::PostType,
    headers: &[(String, String)],
) -> Result<(String, u16), String> {
    let mut request = if body.is_empty() {
        client.get(url)
    } else {
        let content_type = match post_type {
            poller_common::PostType::Json => "application/json",
            poller_common::PostType::Xml => "application/xml",
            poller_common::PostType::Raw => "text/plain",
        };
        client.post(url).header("Content-Type", content_type).body(body.to_string())
    };

    for (name, value) in headers {
        request = request.header(name, value);
    }

    let response = request.send().await.map_err(|e| format!("transport error: {e}"))?;
    let status = response.status().as_u16();
    let text = response.text().await.map_err(|e| format!("failed to read response body: {e}"))?;
    Ok((text, status))
}

/// "Open question — status-code filtering": treated as required, mirroring
/// the synchronous driver's behavior. `spec` is a comma-separated list of
/// single codes or `lo-hi` ranges, e.g. `"200-299,304"`.
pub fn status_code_matches(spec: &str, status: u16) -> bool {
    if spec.trim().is_empty() {
        return (200..300).contains(&status);
    }

    spec.split(',').any(|part| {
        let part = part.trim();
        match part.split_once('-') {
            Some((lo, hi)) => match (lo.trim().parse::<u16>(), hi.trim().parse::<u16>()) {
                (Ok(lo), Ok(hi)) => (lo..=hi).contains(&status),
                _ => false,
            },
            None => part.parse::<u16>().map(|code| code == status).unwrap_or(false),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_code_matches_single_range() {
        assert!(status_code_matches("200-299", 204));
        assert!(!status_code_matches("200-299", 404));
    }

    #[test]
    fn status_code_matches_mixed_list() {
        assert!(status_code_matches("200-299,304,404", 404));
        assert!(status_code_matches("200-299,304,404", 304));
        assert!(!status_code_matches("200-299,304,404", 500));
    }

    #[test]
    fn empty_spec_defaults_to_2xx() {
        assert!(status_code_matches("", 200));
        assert!(!status_code_matches("", 301));
    }

    #[tokio::test]
    async fn engine_reports_in_flight_count() {
        let config = HttpPollerConfig::default();
        let engine = HttpAsyncEngine::new(&config).unwrap();
        assert_eq!(engine.in_flight(), 0);
        assert!(engine.has_capacity());
    }

    fn test_context(status_codes: &str) -> HttpContext {
        HttpContext {
            itemid: 1,
            hostid: 42,
            value_type: ValueType::Text,
            flags: 0,
            state: ItemState::Normal,
            status_codes: status_codes.to_string(),
        }
    }

    #[tokio::test]
    async fn completion_with_matching_status_is_success() {
        let config = HttpPollerConfig::default();
        let engine = HttpAsyncEngine::new(&config).unwrap();
        let outcome = TaskOutcome { context: test_context("200-299"), outcome: Ok(("body".to_string(), 204)) };
        let completion = engine.to_completion(Ok(outcome), Timespec::now());
        assert_eq!(completion.errcode, ErrCode::Success);
        assert_eq!(completion.context.hostid, 42);
    }

    #[tokio::test]
    async fn completion_with_non_matching_status_is_not_supported() {
        let config = HttpPollerConfig::default();
        let engine = HttpAsyncEngine::new(&config).unwrap();
        let outcome = TaskOutcome { context: test_context("200-299"), outcome: Ok(("body".to_string(), 500)) };
        let completion = engine.to_completion(Ok(outcome), Timespec::now());
        assert_eq!(completion.errcode, ErrCode::NotSupported);
    }
}
