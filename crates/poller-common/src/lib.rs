//! Shared types for the metric poller worker: plain data types with no
//! behavior beyond small helpers, used by every other crate in the
//! workspace.

pub mod logging;

use serde::{Deserialize, Serialize};

/// Upper bound on the number of items fetched in a single `ConfigCache::fetch_due` call.
pub const MAX_POLLER_ITEMS: usize = 1000;

/// Wall-clock timestamp with second and nanosecond components, matching the
/// `zbx_timespec_t` used throughout the poller control loop. A plain
/// `chrono::DateTime` does not expose the nanosecond wraparound the
/// sub-result emission logic in `PollerLoop` needs, so this is a small
/// dedicated type instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    pub fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    pub fn now() -> Self {
        let now = chrono::Utc::now();
        Self {
            sec: now.timestamp(),
            nsec: now.timestamp_subsec_nanos() as i64,
        }
    }

    /// Advance `nsec` by one, wrapping into `sec` at 1e9 per the Open
    /// Question: the second only ever advances by one regardless of how
    /// many sub-results wrap past 1e9 within a single batch.
    pub fn next_subresult(self) -> Self {
        let nsec = self.nsec + 1;
        if nsec >= 1_000_000_000 {
            Self { sec: self.sec + 1, nsec: nsec - 1_000_000_000 }
        } else {
            Self { sec: self.sec, nsec }
        }
    }
}

/// Outcome alphabet shared by every driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrCode {
    Success,
    NotSupported,
    AgentError,
    NetworkError,
    GatewayError,
    TimeoutError,
    ConfigError,
    SignalError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Numeric,
    Text,
    Log,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemType {
    AgentPassive,
    Snmp,
    Simple,
    Internal,
    ExternalCommand,
    DbMonitor,
    Ssh,
    Telnet,
    Calculated,
    HttpAgent,
    Script,
    Jmx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterfaceType {
    Agent,
    Snmp,
    Jmx,
    Ipmi,
}

/// Whether `item_type` participates in the availability FSM for
/// `interface_type` ("Availability transitions apply only when item.type is
/// *type-compatible* with interface.type"). Any other combination is a no-op.
pub fn interface_availability_by_item_type(item_type: ItemType, interface_type: InterfaceType) -> bool {
    // IPMI has no corresponding ItemType in this poller's type list, so it
    // never matches; the interface variant exists only for the Interface enum.
    matches!(
        (item_type, interface_type),
        (ItemType::AgentPassive, InterfaceType::Agent)
            | (ItemType::Snmp, InterfaceType::Snmp)
            | (ItemType::Jmx, InterfaceType::Jmx)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemState {
    Normal,
    NotSupported,
}

/// Routing label partitioning items across worker pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PollerType {
    Normal,
    Unreachable,
    History,
    /// The dedicated HTTP-agent poller type, always driven by `HttpAsyncEngine`
    /// rather than the synchronous `CheckDispatcher`.
    HttpAgent,
}

/// `available ∈ {Unknown=0, True=1, False=2}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AvailabilityState {
    Unknown = 0,
    True = 1,
    False = 2,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceAvailability {
    pub available: AvailabilityState,
    pub error: String,
    pub errors_from: i64,
    pub disable_until: i64,
}

impl Default for InterfaceAvailability {
    fn default() -> Self {
        Self {
            available: AvailabilityState::Unknown,
            error: String::new(),
            errors_from: 0,
            disable_until: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    pub interfaceid: u64,
    pub itype: InterfaceType,
    pub addr: String,
    pub port_orig: String,
    pub port: Option<u16>,
    pub availability: InterfaceAvailability,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub hostid: u64,
    pub hostname: String,
}

/// A field that may carry `{HOST.*}`/`{$USERMACRO}` tokens. `orig` is the
/// unresolved source borrowed unchanged from `ConfigCache`; `resolved` is the
/// twin produced by `ItemPreparer::prepare` and released by `Clean` (no
/// field aliasing between originals and twins).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Expanded<T> {
    pub orig: String,
    pub resolved: Option<T>,
}

impl<T> Expanded<T> {
    pub fn new(orig: impl Into<String>) -> Self {
        Self { orig: orig.into(), resolved: None }
    }

    pub fn resolved(&self) -> Option<&T> {
        self.resolved.as_ref()
    }

    pub fn clean(&mut self) {
        self.resolved = None;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnmpFields {
    pub version: SnmpVersion,
    pub community: Expanded<String>,
    pub oid: Expanded<String>,
    pub securityname: Expanded<String>,
    pub authpassphrase: Expanded<String>,
    pub privpassphrase: Expanded<String>,
    pub contextname: Expanded<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnmpVersion {
    #[default]
    V2c,
    V3,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptFields {
    pub timeout: Expanded<u64>,
    pub params: Expanded<String>,
    pub script_params: Expanded<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshFields {
    pub publickey: Expanded<String>,
    pub privatekey: Expanded<String>,
    pub params: Expanded<String>,
    pub username: Expanded<String>,
    pub password: Expanded<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelnetOrDbFields {
    pub params: Expanded<String>,
    pub username: Expanded<String>,
    pub password: Expanded<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialFields {
    pub username: Expanded<String>,
    pub password: Expanded<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JmxFields {
    pub username: Expanded<String>,
    pub password: Expanded<String>,
    pub jmx_endpoint: Expanded<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PostType {
    #[default]
    Raw,
    Json,
    Xml,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpAgentFields {
    pub timeout: Expanded<u64>,
    pub url: Expanded<String>,
    pub query_fields_raw: String,
    pub query_fields: Vec<(String, String)>,
    pub status_codes: Expanded<String>,
    pub http_proxy: Expanded<String>,
    pub ssl_cert_file: Expanded<String>,
    pub ssl_key_file: Expanded<String>,
    pub ssl_key_password: Expanded<String>,
    pub username: Expanded<String>,
    pub password: Expanded<String>,
    pub headers: Vec<(String, Expanded<String>)>,
    pub post_type: PostType,
    pub posts: Expanded<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum TypeFields {
    #[default]
    None,
    Snmp(SnmpFields),
    Script(ScriptFields),
    Ssh(SshFields),
    TelnetOrDb(TelnetOrDbFields),
    Credentials(CredentialFields),
    Jmx(JmxFields),
    HttpAgent(HttpAgentFields),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub itemid: u64,
    pub itype: ItemType,
    pub key_orig: String,
    pub key: Option<String>,
    pub host: Host,
    pub interfaceid: Option<u64>,
    pub value_type: ValueType,
    pub flags: u32,
    pub state: ItemState,
    pub port_orig: String,
    pub port: Option<u16>,
    pub type_fields: TypeFields,
}

impl Item {
    /// Marks the item `NotSupported` and returns the `{result, errcode}` pair
    /// a caller should store on the owning `ItemSlot` — a preparation
    /// failure must surface as `ErrCode::ConfigError`, not the slot's
    /// initial `Success`.
    pub fn mark_config_error(&mut self, message: impl Into<String>) -> (CheckResult, ErrCode) {
        self.state = ItemState::NotSupported;
        (CheckResult { value: None, message: Some(message.into()), sub_results: Vec::new() }, ErrCode::ConfigError)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResultValue {
    Numeric(f64),
    Text(String),
    Log(Vec<String>),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckResult {
    pub value: Option<ResultValue>,
    pub message: Option<String>,
    /// Sub-results for multi-value items (e.g. event-log streams).
    pub sub_results: Vec<SubResult>,
}

impl CheckResult {
    pub fn success(value: ResultValue) -> Self {
        Self { value: Some(value), message: None, sub_results: Vec::new() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self { value: None, message: Some(message.into()), sub_results: Vec::new() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubResult {
    pub value: Option<ResultValue>,
    pub message: Option<String>,
}

/// One `{item, result, errcode}` triple, replacing raw parallel arrays keyed
/// by index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemSlot {
    pub item: Item,
    pub result: CheckResult,
    pub errcode: ErrCode,
}

impl ItemSlot {
    pub fn new(item: Item) -> Self {
        Self { item, result: CheckResult::default(), errcode: ErrCode::Success }
    }
}

pub type Batch = Vec<ItemSlot>;

/// Flags indicating which fields of an `AvailabilityDelta` actually changed,
/// mirroring the `ZBX_FLAGS_AGENT_STATUS_*` bitmap of the original.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityDeltaFlags {
    pub available: bool,
    pub error: bool,
    pub errors_from: bool,
    pub disable_until: bool,
}

impl AvailabilityDeltaFlags {
    pub fn any(&self) -> bool {
        self.available || self.error || self.errors_from || self.disable_until
    }
}

/// A serialized record describing a change to an interface's availability
/// fields ("a length-prefixed record per interface containing interfaceid,
/// flag bitmap, and the flagged fields in a fixed order").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityDelta {
    pub interfaceid: u64,
    pub flags: AvailabilityDeltaFlags,
    pub available: AvailabilityState,
    pub error: String,
    pub errors_from: i64,
    pub disable_until: i64,
}

impl AvailabilityDelta {
    /// Length-prefixed wire encoding: `[u32 len][interfaceid][flags u8][fields...]`.
    /// Only flagged fields are written, in the fixed order available, error,
    /// errors_from, disable_until.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.interfaceid.to_le_bytes());

        let flag_byte = (self.flags.available as u8)
            | ((self.flags.error as u8) << 1)
            | ((self.flags.errors_from as u8) << 2)
            | ((self.flags.disable_until as u8) << 3);
        body.push(flag_byte);

        if self.flags.available {
            body.push(self.available as u8);
        }
        if self.flags.error {
            let bytes = self.error.as_bytes();
            body.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            body.extend_from_slice(bytes);
        }
        if self.flags.errors_from {
            body.extend_from_slice(&self.errors_from.to_le_bytes());
        }
        if self.flags.disable_until {
            body.extend_from_slice(&self.disable_until.to_le_bytes());
        }

        let mut out = Vec::with_capacity(body.len() + 4);
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timespec_wraps_nanoseconds_into_seconds() {
        let ts = Timespec::new(1000, 999_999_999);
        let next = ts.next_subresult();
        assert_eq!(next.sec, 1001);
        assert_eq!(next.nsec, 0);
    }

    #[test]
    fn availability_delta_encodes_only_flagged_fields() {
        let delta = AvailabilityDelta {
            interfaceid: 7,
            flags: AvailabilityDeltaFlags { available: true, error: false, errors_from: true, disable_until: false },
            available: AvailabilityState::True,
            error: String::new(),
            errors_from: 1234,
            disable_until: 0,
        };
        let encoded = delta.encode();
        // len(4) + interfaceid(8) + flags(1) + available(1) + errors_from(8)
        assert_eq!(encoded.len(), 4 + 8 + 1 + 1 + 8);
    }

    #[test]
    fn type_compatibility_table_is_correct() {
        assert!(interface_availability_by_item_type(ItemType::AgentPassive, InterfaceType::Agent));
        assert!(interface_availability_by_item_type(ItemType::Snmp, InterfaceType::Snmp));
        assert!(interface_availability_by_item_type(ItemType::Jmx, InterfaceType::Jmx));
        assert!(!interface_availability_by_item_type(ItemType::Calculated, InterfaceType::Agent));
        assert!(!interface_availability_by_item_type(ItemType::Snmp, InterfaceType::Agent));
    }
}
