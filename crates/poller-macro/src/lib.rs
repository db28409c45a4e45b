//! `MacroExpander`: the interface `ItemPreparer` uses to resolve `{HOST.*}` /
//! `{$USERMACRO}` tokens in item fields (an external interface).
//!
//! The expansion engine itself (macro storage, inheritance across host
//! templates) is out of scope for this worker; this crate only defines the
//! contract and a couple of in-memory implementations usable by tests and the
//! dev binary.

use async_trait::async_trait;
use poller_common::Host;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

fn user_macro_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\$[A-Z0-9_.:]+\}").unwrap())
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("macro expansion failed: {0}")]
pub struct MacroError(pub String);

/// Whether secrets embedded in the expanded text should be rendered as-is or
/// replaced with `****` (masked vs. unmasked).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroMode {
    Masked,
    Unmasked,
}

/// The field context a macro expansion runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroScope {
    ItemKey,
    SnmpOid,
    Common,
    HttpRaw,
    HttpJson,
    XmlMasked,
    ScriptParamsField,
    ParamsField,
    JmxEndpoint,
}

/// External collaborator resolving macro tokens against a host's context.
/// Implementations are supplied by the configuration cache layer; the poller
/// core only ever calls through this trait.
#[async_trait]
pub trait MacroExpander: Send + Sync {
    async fn expand(
        &self,
        text: &str,
        host: &Host,
        scope: MacroScope,
        mode: MacroMode,
    ) -> Result<String, MacroError>;
}

/// In-memory expander substituting `{HOST.HOST}`/`{HOST.NAME}`/`{HOST.IP}`
/// plus arbitrary `{$NAME}` user macros from a fixed map. Sufficient for
/// tests and the dev binary; production deployments supply their own
/// `MacroExpander` backed by the real template/inheritance engine.
#[derive(Debug, Clone, Default)]
pub struct StaticMacroExpander {
    pub user_macros: std::collections::HashMap<String, String>,
    pub secret_macros: std::collections::HashMap<String, String>,
}

impl StaticMacroExpander {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_macro(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_macros.insert(name.into(), value.into());
        self
    }

    pub fn with_secret_macro(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secret_macros.insert(name.into(), value.into());
        self
    }
}

#[async_trait]
impl MacroExpander for StaticMacroExpander {
    async fn expand(
        &self,
        text: &str,
        host: &Host,
        _scope: MacroScope,
        mode: MacroMode,
    ) -> Result<String, MacroError> {
        let mut out = text
            .replace("{HOST.HOST}", &host.hostname)
            .replace("{HOST.NAME}", &host.hostname);

        for (name, value) in &self.user_macros {
            out = out.replace(name, value);
        }

        for (name, value) in &self.secret_macros {
            let rendered = match mode {
                MacroMode::Unmasked => value.as_str(),
                MacroMode::Masked => "****",
            };
            out = out.replace(name, rendered);
        }

        if let Some(m) = user_macro_pattern().find(&out) {
            return Err(MacroError(format!("unresolved macro token {:?} in {:?}", m.as_str(), out)));
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> Host {
        Host { hostid: 1, hostname: "web01".into() }
    }

    #[tokio::test]
    async fn expands_host_tokens() {
        let expander = StaticMacroExpander::new();
        let out = expander
            .expand("ping[{HOST.HOST}]", &host(), MacroScope::ItemKey, MacroMode::Unmasked)
            .await
            .unwrap();
        assert_eq!(out, "ping[web01]");
    }

    #[tokio::test]
    async fn masks_secrets_in_masked_mode() {
        let expander = StaticMacroExpander::new().with_secret_macro("{$PASSWORD}", "hunter2");
        let masked = expander
            .expand("{$PASSWORD}", &host(), MacroScope::Common, MacroMode::Masked)
            .await
            .unwrap();
        assert_eq!(masked, "****");

        let unmasked = expander
            .expand("{$PASSWORD}", &host(), MacroScope::Common, MacroMode::Unmasked)
            .await
            .unwrap();
        assert_eq!(unmasked, "hunter2");
    }

    #[tokio::test]
    async fn unresolved_macro_is_an_error() {
        let expander = StaticMacroExpander::new();
        let result = expander
            .expand("{$UNKNOWN}", &host(), MacroScope::Common, MacroMode::Unmasked)
            .await;
        assert!(result.is_err());
    }
}
