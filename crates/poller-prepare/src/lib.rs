//! `ItemPreparer`: materializes a fetched batch into one with all
//! macro-bearing fields resolved, ready for dispatch.

use poller_common::{
    Batch, CheckResult, ErrCode, InterfaceType, Item, ItemType, PostType, TypeFields,
};
use poller_macro::{MacroExpander, MacroMode, MacroScope};
use tracing::debug;
use url::Url;

pub struct ItemPreparer<'a, M: MacroExpander + ?Sized> {
    expander: &'a M,
}

impl<'a, M: MacroExpander + ?Sized> ItemPreparer<'a, M> {
    pub fn new(expander: &'a M) -> Self {
        Self { expander }
    }

    /// `Prepare`. Per-item failures mark that item `ConfigError` and the
    /// batch continues; this method itself cannot fail.
    pub async fn prepare(&self, batch: &mut Batch, expand_macros: bool) {
        for slot in batch.iter_mut() {
            self.prepare_item(&mut slot.item, &mut slot.result, &mut slot.errcode, expand_macros).await;
        }
    }

    /// `Clean`: release every resolved twin, leaving `_orig` fields (and
    /// hence the cache's originals, which these only ever borrowed from)
    /// untouched.
    pub fn clean(&self, batch: &mut Batch) {
        for slot in batch.iter_mut() {
            clean_item(&mut slot.item);
        }
    }

    async fn prepare_item(&self, item: &mut Item, result: &mut CheckResult, errcode: &mut ErrCode, expand_macros: bool) {
        let host = item.host.clone();

        item.key = Some(item.key_orig.clone());
        if expand_macros {
            match self.expander.expand(&item.key_orig, &host, MacroScope::ItemKey, MacroMode::Unmasked).await {
                Ok(expanded) => item.key = Some(expanded),
                Err(e) => {
                    let (r, c) = item.mark_config_error(format!("key macro expansion failed: {}", e.0));
                    *result = r;
                    *errcode = c;
                    return;
                }
            }
        }

        if matches!(item.itype, ItemType::AgentPassive | ItemType::Snmp | ItemType::Jmx) {
            if let Err(message) = self.resolve_port(item).await {
                let (r, c) = item.mark_config_error(message);
                *result = r;
                *errcode = c;
                return;
            }
        }

        let outcome = match item.itype {
            ItemType::Snmp => self.resolve_snmp(item).await,
            ItemType::Script => self.resolve_script(item).await,
            ItemType::Ssh => self.resolve_ssh(item).await,
            ItemType::Telnet | ItemType::DbMonitor => self.resolve_telnet_or_db(item).await,
            ItemType::Simple => self.resolve_credentials_only(item).await,
            ItemType::Jmx => self.resolve_jmx(item).await,
            ItemType::HttpAgent => self.resolve_http_agent(item).await,
            ItemType::AgentPassive | ItemType::Internal | ItemType::ExternalCommand | ItemType::Calculated => {
                Ok(())
            }
        };

        if let Err(message) = outcome {
            let (r, c) = item.mark_config_error(message);
            *result = r;
            *errcode = c;
        }
    }

    async fn resolve_port(&self, item: &mut Item) -> Result<(), String> {
        let host = item.host.clone();
        let raw = self
            .expander
            .expand(&item.port_orig, &host, MacroScope::Common, MacroMode::Unmasked)
            .await
            .map_err(|e| format!("port macro expansion failed: {}", e.0))?;
        let port: u16 = raw.trim().parse().map_err(|_| format!("invalid port {:?}", raw))?;
        item.port = Some(port);
        Ok(())
    }

    async fn resolve_snmp(&self, item: &mut Item) -> Result<(), String> {
        let host = item.host.clone();
        let TypeFields::Snmp(fields) = &mut item.type_fields else {
            return Err("item marked SNMP type without SNMP fields".into());
        };

        fields.community.resolved = Some(
            self.expander
                .expand(&fields.community.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("community macro expansion failed: {}", e.0))?,
        );
        fields.oid.resolved = Some(
            self.expander
                .expand(&fields.oid.orig, &host, MacroScope::SnmpOid, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("OID macro expansion failed: {}", e.0))?,
        );

        if fields.version == poller_common::SnmpVersion::V3 {
            fields.securityname.resolved = Some(
                self.expander
                    .expand(&fields.securityname.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                    .await
                    .map_err(|e| format!("security name macro expansion failed: {}", e.0))?,
            );
            fields.authpassphrase.resolved = Some(
                self.expander
                    .expand(&fields.authpassphrase.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                    .await
                    .map_err(|e| format!("auth passphrase macro expansion failed: {}", e.0))?,
            );
            fields.privpassphrase.resolved = Some(
                self.expander
                    .expand(&fields.privpassphrase.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                    .await
                    .map_err(|e| format!("priv passphrase macro expansion failed: {}", e.0))?,
            );
            fields.contextname.resolved = Some(
                self.expander
                    .expand(&fields.contextname.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                    .await
                    .map_err(|e| format!("context name macro expansion failed: {}", e.0))?,
            );
        }

        Ok(())
    }

    async fn resolve_script(&self, item: &mut Item) -> Result<(), String> {
        let host = item.host.clone();
        let TypeFields::Script(fields) = &mut item.type_fields else {
            return Err("item marked Script type without script fields".into());
        };

        let timeout_raw = self
            .expander
            .expand(&fields.timeout.orig, &host, MacroScope::Common, MacroMode::Unmasked)
            .await
            .map_err(|e| format!("timeout macro expansion failed: {}", e.0))?;
        fields.timeout.resolved =
            Some(timeout_raw.trim().parse().map_err(|_| format!("invalid timeout {:?}", timeout_raw))?);

        fields.script_params.resolved = Some(
            self.expander
                .expand(&fields.script_params.orig, &host, MacroScope::ScriptParamsField, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("script params macro expansion failed: {}", e.0))?,
        );
        fields.params.resolved = Some(
            self.expander
                .expand(&fields.params.orig, &host, MacroScope::ParamsField, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("params macro expansion failed: {}", e.0))?,
        );

        Ok(())
    }

    async fn resolve_ssh(&self, item: &mut Item) -> Result<(), String> {
        let host = item.host.clone();
        let TypeFields::Ssh(fields) = &mut item.type_fields else {
            return Err("item marked SSH type without SSH fields".into());
        };

        fields.publickey.resolved = Some(
            self.expander
                .expand(&fields.publickey.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("public key macro expansion failed: {}", e.0))?,
        );
        fields.privatekey.resolved = Some(
            self.expander
                .expand(&fields.privatekey.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("private key macro expansion failed: {}", e.0))?,
        );
        fields.params.resolved = Some(
            self.expander
                .expand(&fields.params.orig, &host, MacroScope::ParamsField, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("params macro expansion failed: {}", e.0))?,
        );
        fields.username.resolved = Some(
            self.expander
                .expand(&fields.username.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("username macro expansion failed: {}", e.0))?,
        );
        fields.password.resolved = Some(
            self.expander
                .expand(&fields.password.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("password macro expansion failed: {}", e.0))?,
        );

        Ok(())
    }

    async fn resolve_telnet_or_db(&self, item: &mut Item) -> Result<(), String> {
        let host = item.host.clone();
        let TypeFields::TelnetOrDb(fields) = &mut item.type_fields else {
            return Err("item marked Telnet/DbMonitor type without matching fields".into());
        };

        fields.params.resolved = Some(
            self.expander
                .expand(&fields.params.orig, &host, MacroScope::ParamsField, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("params macro expansion failed: {}", e.0))?,
        );
        fields.username.resolved = Some(
            self.expander
                .expand(&fields.username.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("username macro expansion failed: {}", e.0))?,
        );
        fields.password.resolved = Some(
            self.expander
                .expand(&fields.password.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("password macro expansion failed: {}", e.0))?,
        );

        Ok(())
    }

    async fn resolve_credentials_only(&self, item: &mut Item) -> Result<(), String> {
        let host = item.host.clone();
        let TypeFields::Credentials(fields) = &mut item.type_fields else {
            return Err("item marked Simple type without credential fields".into());
        };

        fields.username.resolved = Some(
            self.expander
                .expand(&fields.username.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("username macro expansion failed: {}", e.0))?,
        );
        fields.password.resolved = Some(
            self.expander
                .expand(&fields.password.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("password macro expansion failed: {}", e.0))?,
        );

        Ok(())
    }

    async fn resolve_jmx(&self, item: &mut Item) -> Result<(), String> {
        let host = item.host.clone();
        let TypeFields::Jmx(fields) = &mut item.type_fields else {
            return Err("item marked JMX type without JMX fields".into());
        };

        fields.username.resolved = Some(
            self.expander
                .expand(&fields.username.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("username macro expansion failed: {}", e.0))?,
        );
        fields.password.resolved = Some(
            self.expander
                .expand(&fields.password.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("password macro expansion failed: {}", e.0))?,
        );
        fields.jmx_endpoint.resolved = Some(
            self.expander
                .expand(&fields.jmx_endpoint.orig, &host, MacroScope::JmxEndpoint, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("JMX endpoint macro expansion failed: {}", e.0))?,
        );

        Ok(())
    }

    async fn resolve_http_agent(&self, item: &mut Item) -> Result<(), String> {
        let host = item.host.clone();
        let TypeFields::HttpAgent(fields) = &mut item.type_fields else {
            return Err("item marked HttpAgent type without HTTP fields".into());
        };

        let timeout_raw = self
            .expander
            .expand(&fields.timeout.orig, &host, MacroScope::Common, MacroMode::Unmasked)
            .await
            .map_err(|e| format!("timeout macro expansion failed: {}", e.0))?;
        fields.timeout.resolved =
            Some(timeout_raw.trim().parse().map_err(|_| format!("invalid timeout {:?}", timeout_raw))?);

        let url_raw = self
            .expander
            .expand(&fields.url.orig, &host, MacroScope::HttpRaw, MacroMode::Unmasked)
            .await
            .map_err(|e| format!("URL macro expansion failed: {}", e.0))?;
        fields.status_codes.resolved = Some(
            self.expander
                .expand(&fields.status_codes.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("status codes macro expansion failed: {}", e.0))?,
        );
        fields.http_proxy.resolved = Some(
            self.expander
                .expand(&fields.http_proxy.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("proxy macro expansion failed: {}", e.0))?,
        );
        fields.ssl_cert_file.resolved = Some(
            self.expander
                .expand(&fields.ssl_cert_file.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("ssl cert file macro expansion failed: {}", e.0))?,
        );
        fields.ssl_key_file.resolved = Some(
            self.expander
                .expand(&fields.ssl_key_file.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("ssl key file macro expansion failed: {}", e.0))?,
        );
        fields.ssl_key_password.resolved = Some(
            self.expander
                .expand(&fields.ssl_key_password.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("ssl key password macro expansion failed: {}", e.0))?,
        );
        fields.username.resolved = Some(
            self.expander
                .expand(&fields.username.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("username macro expansion failed: {}", e.0))?,
        );
        fields.password.resolved = Some(
            self.expander
                .expand(&fields.password.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("password macro expansion failed: {}", e.0))?,
        );

        for (_name, value) in fields.headers.iter_mut() {
            value.resolved = Some(
                self.expander
                    .expand(&value.orig, &host, MacroScope::Common, MacroMode::Unmasked)
                    .await
                    .map_err(|e| format!("header macro expansion failed: {}", e.0))?,
            );
        }

        let post_scope = match fields.post_type {
            PostType::Xml => MacroScope::XmlMasked,
            PostType::Json => MacroScope::HttpJson,
            PostType::Raw => MacroScope::HttpRaw,
        };
        fields.posts.resolved = Some(
            self.expander
                .expand(&fields.posts.orig, &host, post_scope, MacroMode::Unmasked)
                .await
                .map_err(|e| format!("post body macro expansion failed: {}", e.0))?,
        );

        let resolved_url = build_url(&url_raw, &fields.query_fields_raw)?;
        fields.query_fields = parse_query_fields(&fields.query_fields_raw)?;
        fields.url.resolved = Some(resolved_url);

        Ok(())
    }
}

/// Round-trips `raw` through IDN/punycode encoding and appends each
/// `query_fields` pair as `percent-encode(name)=percent-encode(value)`.
fn build_url(raw: &str, query_fields_raw: &str) -> Result<String, String> {
    let mut url = Url::parse(raw).map_err(|e| format!("invalid URL {:?}: {}", raw, e))?;

    for (name, value) in parse_query_fields(query_fields_raw)? {
        url.query_pairs_mut().append_pair(&name, &value);
    }

    Ok(url.to_string())
}

/// Accepts either a JSON array of single-key objects (the on-wire shape) or
/// an empty string.
fn parse_query_fields(raw: &str) -> Result<Vec<(String, String)>, String> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }

    let parsed: Vec<serde_json::Map<String, serde_json::Value>> =
        serde_json::from_str(raw).map_err(|e| format!("invalid query_fields {:?}: {}", raw, e))?;

    let mut out = Vec::with_capacity(parsed.len());
    for object in parsed {
        for (name, value) in object {
            let value = value.as_str().map(str::to_string).unwrap_or_else(|| value.to_string());
            out.push((name, value));
        }
    }
    Ok(out)
}

fn clean_item(item: &mut Item) {
    match &mut item.type_fields {
        TypeFields::None => {}
        TypeFields::Snmp(f) => {
            f.community.clean();
            f.oid.clean();
            f.securityname.clean();
            f.authpassphrase.clean();
            f.privpassphrase.clean();
            f.contextname.clean();
        }
        TypeFields::Script(f) => {
            f.timeout.clean();
            f.params.clean();
            f.script_params.clean();
        }
        TypeFields::Ssh(f) => {
            f.publickey.clean();
            f.privatekey.clean();
            f.params.clean();
            f.username.clean();
            f.password.clean();
        }
        TypeFields::TelnetOrDb(f) => {
            f.params.clean();
            f.username.clean();
            f.password.clean();
        }
        TypeFields::Credentials(f) => {
            f.username.clean();
            f.password.clean();
        }
        TypeFields::Jmx(f) => {
            f.username.clean();
            f.password.clean();
            f.jmx_endpoint.clean();
        }
        TypeFields::HttpAgent(f) => {
            f.timeout.clean();
            f.url.clean();
            f.status_codes.clean();
            f.http_proxy.clean();
            f.ssl_cert_file.clean();
            f.ssl_key_file.clean();
            f.ssl_key_password.clean();
            f.username.clean();
            f.password.clean();
            for (_, value) in f.headers.iter_mut() {
                value.clean();
            }
            f.posts.clean();
            f.query_fields.clear();
        }
    }
    item.key = None;
    debug!(itemid = item.itemid, "cleaned resolved twins");
}

/// Interfaces whose items carry macro-bearing port fields.
pub fn requires_port_resolution(interface_type: InterfaceType) -> bool {
    matches!(interface_type, InterfaceType::Agent | InterfaceType::Snmp | InterfaceType::Jmx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use poller_common::{Host, ItemState, SnmpFields, TypeFields, ValueType};
    use poller_macro::StaticMacroExpander;

    fn item(itype: ItemType, type_fields: TypeFields) -> Item {
        Item {
            itemid: 1,
            itype,
            key_orig: "agent.ping".into(),
            key: None,
            host: Host { hostid: 1, hostname: "web01".into() },
            interfaceid: Some(1),
            value_type: ValueType::Numeric,
            flags: 0,
            state: ItemState::Normal,
            port_orig: "10050".into(),
            port: None,
            type_fields,
        }
    }

    #[tokio::test]
    async fn resolves_snmp_v2c_fields() {
        let expander = StaticMacroExpander::new();
        let preparer = ItemPreparer::new(&expander);
        let mut batch = vec![poller_common::ItemSlot::new(item(
            ItemType::Snmp,
            TypeFields::Snmp(SnmpFields {
                version: poller_common::SnmpVersion::V2c,
                community: poller_common::Expanded::new("public"),
                oid: poller_common::Expanded::new("1.3.6.1.2.1.1.1.0"),
                ..Default::default()
            }),
        ))];

        preparer.prepare(&mut batch, true).await;

        let TypeFields::Snmp(fields) = &batch[0].item.type_fields else { panic!("expected snmp fields") };
        assert_eq!(fields.community.resolved(), Some(&"public".to_string()));
        assert_eq!(batch[0].item.state, ItemState::Normal);
    }

    #[tokio::test]
    async fn clean_releases_resolved_twins_without_touching_orig() {
        let expander = StaticMacroExpander::new();
        let preparer = ItemPreparer::new(&expander);
        let mut batch = vec![poller_common::ItemSlot::new(item(
            ItemType::Snmp,
            TypeFields::Snmp(SnmpFields {
                version: poller_common::SnmpVersion::V2c,
                community: poller_common::Expanded::new("public"),
                oid: poller_common::Expanded::new("1.3.6.1.2.1.1.1.0"),
                ..Default::default()
            }),
        ))];

        preparer.prepare(&mut batch, true).await;
        preparer.clean(&mut batch);

        let TypeFields::Snmp(fields) = &batch[0].item.type_fields else { panic!("expected snmp fields") };
        assert!(fields.community.resolved().is_none());
        assert_eq!(fields.community.orig, "public");
        assert!(batch[0].item.key.is_none());
    }

    #[tokio::test]
    async fn macro_failure_marks_config_error_without_aborting_batch() {
        let expander = StaticMacroExpander::new();
        let preparer = ItemPreparer::new(&expander);
        let mut bad = item(ItemType::AgentPassive, TypeFields::None);
        bad.key_orig = "agent.ping[{$UNKNOWN}]".into();
        let good = item(ItemType::AgentPassive, TypeFields::None);

        let mut batch = vec![poller_common::ItemSlot::new(bad), poller_common::ItemSlot::new(good)];
        preparer.prepare(&mut batch, true).await;

        assert_eq!(batch[0].item.state, ItemState::NotSupported);
        assert_eq!(batch[0].errcode, poller_common::ErrCode::ConfigError);
        assert_eq!(batch[1].item.state, ItemState::Normal);
        assert_eq!(batch[1].errcode, poller_common::ErrCode::Success);
    }

    /// parsing and re-emitting an already-normalized URL is idempotent.
    #[test]
    fn query_field_parsing_is_idempotent() {
        let raw = r#"[{"name":"value"}]"#;
        let once = build_url("https://example.com/path", raw).unwrap();
        let twice = build_url(&once, "").unwrap();
        assert_eq!(once, twice);
    }
}
