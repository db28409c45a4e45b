//! `CheckDispatcher`: routes a prepared batch to the correct synchronous
//! driver, depending on item type, enforcing the "batched only for SNMP/JMX,
//! single otherwise" contract.

use async_trait::async_trait;
use poller_common::{Batch, CheckResult, ErrCode, Item, ItemType};
use tracing::error;

/// A single-item protocol driver ("single-item type→driver mapping").
#[async_trait]
pub trait CheckDriver: Send + Sync {
    async fn check(&self, item: &Item) -> (CheckResult, ErrCode);
}

/// A whole-batch protocol driver, used only for SNMP and JMX.
#[async_trait]
pub trait BatchCheckDriver: Send + Sync {
    async fn check_batch(&self, items: &[Item]) -> Vec<(CheckResult, ErrCode)>;
}

/// Registry of drivers available to this dispatcher instance. Protocols with
/// no registered driver fall back to a compile-time "not supported"
/// `ConfigError`, matching "if SNMP support is present... if absent, set
/// every item's result to a compile-time not supported config error".
#[derive(Default)]
pub struct DriverRegistry {
    pub snmp: Option<Box<dyn BatchCheckDriver>>,
    pub jmx: Option<Box<dyn BatchCheckDriver>>,
    pub agent: Option<Box<dyn CheckDriver>>,
    pub simple: Option<Box<dyn CheckDriver>>,
    pub internal: Option<Box<dyn CheckDriver>>,
    pub db: Option<Box<dyn CheckDriver>>,
    pub external: Option<Box<dyn CheckDriver>>,
    pub ssh: Option<Box<dyn CheckDriver>>,
    pub telnet: Option<Box<dyn CheckDriver>>,
    pub calc: Option<Box<dyn CheckDriver>>,
    pub http: Option<Box<dyn CheckDriver>>,
    pub script: Option<Box<dyn CheckDriver>>,
}

fn not_supported(message: &str) -> (CheckResult, ErrCode) {
    (CheckResult::error(message), ErrCode::ConfigError)
}

pub struct CheckDispatcher {
    drivers: DriverRegistry,
}

impl CheckDispatcher {
    pub fn new(drivers: DriverRegistry) -> Self {
        Self { drivers }
    }

    /// The batch must be homogeneous for SNMP/JMX (driven once as a whole)
    /// or contain exactly one item otherwise; any other shape is a
    /// programming error upstream in `PollerLoop`.
    pub async fn run(&self, batch: &mut Batch) {
        let Some(first_type) = batch.first().map(|slot| slot.item.itype) else {
            return;
        };

        match first_type {
            ItemType::Snmp => self.run_batch(batch, "SNMP").await,
            ItemType::Jmx => self.run_batch(batch, "JMX").await,
            _ => {
                if batch.len() != 1 {
                    error!(len = batch.len(), ?first_type, "non-batched item type submitted with batch size != 1");
                }
                for slot in batch.iter_mut() {
                    // A slot already failed preparation (e.g. macro expansion):
                    // don't let the driver overwrite its config-error result.
                    if slot.errcode != ErrCode::Success {
                        continue;
                    }
                    let (result, errcode) = self.run_single(&slot.item).await;
                    slot.result = ensure_message(result, errcode);
                    slot.errcode = errcode;
                }
            }
        }
    }

    async fn run_batch(&self, batch: &mut Batch, label: &str) {
        let driver = match label {
            "SNMP" => self.drivers.snmp.as_deref(),
            _ => self.drivers.jmx.as_deref(),
        };

        // Slots that already failed preparation keep their config-error
        // result and are excluded from the driver call entirely, but the
        // remaining slots still go out as one batch, keyed back by index.
        let pending: Vec<usize> =
            batch.iter().enumerate().filter(|(_, slot)| slot.errcode == ErrCode::Success).map(|(i, _)| i).collect();
        if pending.is_empty() {
            return;
        }

        match driver {
            Some(driver) => {
                let items: Vec<Item> = pending.iter().map(|&i| batch[i].item.clone()).collect();
                let outcomes = driver.check_batch(&items).await;
                for (i, (result, errcode)) in pending.into_iter().zip(outcomes) {
                    batch[i].result = ensure_message(result, errcode);
                    batch[i].errcode = errcode;
                }
            }
            None => {
                for i in pending {
                    let (result, errcode) = not_supported(&format!("{} support not compiled in", label));
                    batch[i].result = result;
                    batch[i].errcode = errcode;
                }
            }
        }
    }

    async fn run_single(&self, item: &Item) -> (CheckResult, ErrCode) {
        match item.itype {
            ItemType::AgentPassive => self.call_or_not_supported(&self.drivers.agent, item).await,
            ItemType::Simple => self.call_or_not_supported(&self.drivers.simple, item).await,
            ItemType::Internal => self.call_or_not_supported(&self.drivers.internal, item).await,
            ItemType::DbMonitor => self.call_or_not_supported(&self.drivers.db, item).await,
            ItemType::ExternalCommand => self.call_or_not_supported(&self.drivers.external, item).await,
            ItemType::Ssh => self.call_or_not_supported(&self.drivers.ssh, item).await,
            ItemType::Telnet => self.call_or_not_supported(&self.drivers.telnet, item).await,
            ItemType::Calculated => self.call_or_not_supported(&self.drivers.calc, item).await,
            ItemType::HttpAgent => self.call_or_not_supported(&self.drivers.http, item).await,
            ItemType::Script => self.call_or_not_supported(&self.drivers.script, item).await,
            ItemType::Snmp | ItemType::Jmx => not_supported("batched type dispatched as single item"),
        }
    }

    async fn call_or_not_supported(&self, driver: &Option<Box<dyn CheckDriver>>, item: &Item) -> (CheckResult, ErrCode) {
        match driver {
            Some(driver) => driver.check(item).await,
            None => not_supported("driver not compiled in"),
        }
    }
}

/// "On any non-success the dispatcher ensures the result carries a message
/// (falling back to a generic not supported string...)".
fn ensure_message(mut result: CheckResult, errcode: ErrCode) -> CheckResult {
    if errcode != ErrCode::Success && result.message.is_none() && result.value.is_none() {
        result.message = Some("not supported".to_string());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use poller_common::{Host, ItemSlot, ItemState, ValueType};

    fn item(itype: ItemType) -> Item {
        Item {
            itemid: 1,
            itype,
            key_orig: "agent.ping".into(),
            key: Some("agent.ping".into()),
            host: Host { hostid: 1, hostname: "web01".into() },
            interfaceid: Some(1),
            value_type: ValueType::Numeric,
            flags: 0,
            state: ItemState::Normal,
            port_orig: "10050".into(),
            port: Some(10050),
            type_fields: poller_common::TypeFields::None,
        }
    }

    #[tokio::test]
    async fn missing_driver_marks_config_error_with_message() {
        let dispatcher = CheckDispatcher::new(DriverRegistry::default());
        let mut batch = vec![ItemSlot::new(item(ItemType::AgentPassive))];
        dispatcher.run(&mut batch).await;

        assert_eq!(batch[0].errcode, ErrCode::ConfigError);
        assert!(batch[0].result.message.is_some());
    }

    struct AlwaysSuccess;

    #[async_trait]
    impl CheckDriver for AlwaysSuccess {
        async fn check(&self, _item: &Item) -> (CheckResult, ErrCode) {
            (CheckResult::success(poller_common::ResultValue::Numeric(1.0)), ErrCode::Success)
        }
    }

    #[tokio::test]
    async fn single_item_routes_to_registered_driver() {
        let mut drivers = DriverRegistry::default();
        drivers.agent = Some(Box::new(AlwaysSuccess));
        let dispatcher = CheckDispatcher::new(drivers);

        let mut batch = vec![ItemSlot::new(item(ItemType::AgentPassive))];
        dispatcher.run(&mut batch).await;

        assert_eq!(batch[0].errcode, ErrCode::Success);
    }

    struct BatchEcho;

    #[async_trait]
    impl BatchCheckDriver for BatchEcho {
        async fn check_batch(&self, items: &[Item]) -> Vec<(CheckResult, ErrCode)> {
            items
                .iter()
                .map(|_| (CheckResult::success(poller_common::ResultValue::Numeric(2.0)), ErrCode::Success))
                .collect()
        }
    }

    #[tokio::test]
    async fn snmp_batch_is_dispatched_once_for_whole_batch() {
        let mut drivers = DriverRegistry::default();
        drivers.snmp = Some(Box::new(BatchEcho));
        let dispatcher = CheckDispatcher::new(drivers);

        let mut batch = vec![ItemSlot::new(item(ItemType::Snmp)), ItemSlot::new(item(ItemType::Snmp))];
        dispatcher.run(&mut batch).await;

        assert!(batch.iter().all(|slot| slot.errcode == ErrCode::Success));
    }
}
