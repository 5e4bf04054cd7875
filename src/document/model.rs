//! Typed model of a node's proxy configuration document.
//!
//! Only the fields the control plane reads or writes are typed; every other
//! key is carried through a flattened map so hand edits survive a
//! read-modify-write cycle.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::registry::Node;

/// Tag shared by the api section, the api inbound and its routing rule.
pub const API_TAG: &str = "api";

const API_SERVICES: [&str; 2] = ["HandlerService", "StatsService"];

/// Service level assigned to provisioned credentials.
pub const DEFAULT_LEVEL: u32 = 0;

/// The document cannot be mutated without guessing at its structure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct MalformedDocument(pub String);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub log: LogSection,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiSection>,
    #[serde(default)]
    pub stats: Map<String, Value>,
    #[serde(default)]
    pub policy: PolicySection,
    pub inbounds: Vec<Inbound>,
    #[serde(default)]
    pub outbounds: Vec<Outbound>,
    #[serde(default)]
    pub routing: RoutingSection,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_loglevel() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiSection {
    pub tag: String,
    #[serde(default)]
    pub services: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            tag: API_TAG.to_string(),
            services: API_SERVICES.iter().map(|s| s.to_string()).collect(),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicySection {
    #[serde(default)]
    pub levels: BTreeMap<String, LevelPolicy>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-level policy. User counters only exist when these flags are on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelPolicy {
    #[serde(default)]
    pub stats_user_uplink: bool,
    #[serde(default)]
    pub stats_user_downlink: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub port: u16,
    pub protocol: String,
    #[serde(default)]
    pub settings: InboundSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Inbound {
    fn is_api(&self) -> bool {
        self.tag.as_deref() == Some(API_TAG)
    }

    fn api(api_port: u16) -> Self {
        let mut settings = Map::new();
        settings.insert("address".to_string(), Value::from("127.0.0.1"));
        Self {
            tag: Some(API_TAG.to_string()),
            port: api_port,
            protocol: "dokodemo-door".to_string(),
            settings: InboundSettings {
                clients: None,
                extra: settings,
            },
            stream_settings: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients: Option<Vec<ClientEntry>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One provisioned credential.
///
/// The engine keys per-user counters by `email`, so it always mirrors the
/// credential id: counters are named `user>>>{credential}>>>traffic>>>uplink`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEntry {
    pub id: String,
    #[serde(default)]
    pub level: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClientEntry {
    pub fn new(credential: &str) -> Self {
        Self {
            id: credential.to_string(),
            level: DEFAULT_LEVEL,
            email: Some(credential.to_string()),
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingSection {
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    #[serde(rename = "type", default = "default_rule_type")]
    pub rule_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inbound_tag: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_tag: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_rule_type() -> String {
    "field".to_string()
}

impl RoutingRule {
    fn api() -> Self {
        Self {
            rule_type: default_rule_type(),
            inbound_tag: vec![API_TAG.to_string()],
            outbound_tag: Some(API_TAG.to_string()),
            extra: Map::new(),
        }
    }

    fn is_api(&self) -> bool {
        self.outbound_tag.as_deref() == Some(API_TAG)
            && self.inbound_tag.iter().any(|tag| tag == API_TAG)
    }
}

impl ConfigDocument {
    /// Build the initial document for `node` with an empty client list.
    pub fn generate(node: &Node, access_log: &Path) -> Self {
        let mut traffic_settings = InboundSettings {
            clients: Some(Vec::new()),
            extra: Map::new(),
        };
        apply_protocol_defaults(&node.protocol, &mut traffic_settings);

        let mut doc = Self {
            log: LogSection {
                loglevel: default_loglevel(),
                access: Some(access_log.display().to_string()),
                extra: Map::new(),
            },
            api: Some(ApiSection::default()),
            stats: Map::new(),
            policy: PolicySection::default(),
            inbounds: vec![
                Inbound {
                    tag: None,
                    port: node.port,
                    protocol: node.protocol.clone(),
                    settings: traffic_settings,
                    stream_settings: Some(serde_json::json!({ "network": "tcp" })),
                    extra: Map::new(),
                },
                Inbound::api(node.api_port),
            ],
            outbounds: vec![Outbound {
                protocol: "freedom".to_string(),
                tag: None,
                extra: Map::new(),
            }],
            routing: RoutingSection {
                rules: vec![RoutingRule::api()],
                extra: Map::new(),
            },
            extra: Map::new(),
        };
        doc.ensure_api_wiring(node.api_port);
        doc
    }

    /// The first inbound carries the mutable client list.
    pub fn traffic_inbound(&self) -> Result<&Inbound, MalformedDocument> {
        match self.inbounds.first() {
            Some(inbound) if inbound.is_api() => Err(first_is_api()),
            Some(inbound) => Ok(inbound),
            None => Err(MalformedDocument("document has no inbounds".to_string())),
        }
    }

    fn traffic_inbound_mut(&mut self) -> Result<&mut Inbound, MalformedDocument> {
        match self.inbounds.first_mut() {
            Some(inbound) if inbound.is_api() => Err(first_is_api()),
            Some(inbound) => Ok(inbound),
            None => Err(MalformedDocument("document has no inbounds".to_string())),
        }
    }

    fn clients_mut(&mut self) -> Result<&mut Vec<ClientEntry>, MalformedDocument> {
        Ok(self
            .traffic_inbound_mut()?
            .settings
            .clients
            .get_or_insert_with(Vec::new))
    }

    pub fn clients(&self) -> &[ClientEntry] {
        self.traffic_inbound()
            .ok()
            .and_then(|inbound| inbound.settings.clients.as_deref())
            .unwrap_or(&[])
    }

    pub fn client_ids(&self) -> BTreeSet<String> {
        self.clients().iter().map(|c| c.id.clone()).collect()
    }

    pub fn contains_client(&self, credential: &str) -> bool {
        self.clients().iter().any(|c| c.id == credential)
    }

    /// Add `credential` unless an entry with the same id exists.
    pub fn insert_client(&mut self, credential: &str) -> Result<bool, MalformedDocument> {
        let clients = self.clients_mut()?;
        if clients.iter().any(|c| c.id == credential) {
            return Ok(false);
        }
        clients.push(ClientEntry::new(credential));
        Ok(true)
    }

    /// Drop every entry whose id equals `credential`.
    pub fn remove_client(&mut self, credential: &str) -> Result<bool, MalformedDocument> {
        let clients = self.clients_mut()?;
        let before = clients.len();
        clients.retain(|c| c.id != credential);
        Ok(clients.len() != before)
    }

    /// Make the client list contain exactly `desired`, keeping the order and
    /// extra attributes of entries that stay.
    pub fn retain_clients(&mut self, desired: &BTreeSet<String>) -> Result<bool, MalformedDocument> {
        let clients = self.clients_mut()?;
        let before = clients.clone();

        let mut seen = BTreeSet::new();
        clients.retain(|c| desired.contains(&c.id) && seen.insert(c.id.clone()));
        for credential in desired {
            if !seen.contains(credential) {
                clients.push(ClientEntry::new(credential));
            }
        }
        Ok(*clients != before)
    }

    /// Rewrite ports and protocol after the node record changed.
    pub fn retarget(&mut self, node: &Node) -> Result<bool, MalformedDocument> {
        let before = self.clone();

        let traffic = self.traffic_inbound_mut()?;
        traffic.port = node.port;
        traffic.protocol = node.protocol.clone();
        apply_protocol_defaults(&node.protocol, &mut traffic.settings);

        for inbound in self.inbounds.iter_mut().filter(|i| i.is_api()) {
            inbound.port = node.api_port;
        }
        self.ensure_api_wiring(node.api_port);

        Ok(*self != before)
    }

    /// Re-add the stats API declaration, its inbound, its routing rule and
    /// per-user counters if any of them went missing.
    pub fn ensure_api_wiring(&mut self, api_port: u16) -> bool {
        let before = self.clone();

        let api = self.api.get_or_insert_with(ApiSection::default);
        api.tag = API_TAG.to_string();
        for service in API_SERVICES {
            if !api.services.iter().any(|s| s == service) {
                api.services.push(service.to_string());
            }
        }

        if !self.inbounds.iter().any(Inbound::is_api) {
            self.inbounds.push(Inbound::api(api_port));
        }

        if !self.routing.rules.iter().any(RoutingRule::is_api) {
            self.routing.rules.insert(0, RoutingRule::api());
        }

        let level = self
            .policy
            .levels
            .entry(DEFAULT_LEVEL.to_string())
            .or_default();
        level.stats_user_uplink = true;
        level.stats_user_downlink = true;

        *self != before
    }
}

fn first_is_api() -> MalformedDocument {
    MalformedDocument("first inbound is the stats API inbound".to_string())
}

fn apply_protocol_defaults(protocol: &str, settings: &mut InboundSettings) {
    if protocol == "vless" && !settings.extra.contains_key("decryption") {
        settings
            .extra
            .insert("decryption".to_string(), Value::from("none"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn node() -> Node {
        Node {
            id: 3,
            name: "edge-3".to_string(),
            address: "203.0.113.7".to_string(),
            port: 12345,
            protocol: "vless".to_string(),
            api_port: 54321,
            is_connected: false,
            last_checked: None,
        }
    }

    fn document() -> ConfigDocument {
        ConfigDocument::generate(&node(), &PathBuf::from("/var/log/xray/access_3.log"))
    }

    #[test]
    fn test_generated_document_shape() {
        let doc = document();
        let json = serde_json::to_value(&doc).unwrap();

        assert_eq!(json["log"]["access"], "/var/log/xray/access_3.log");
        assert_eq!(json["api"]["tag"], "api");
        assert_eq!(json["inbounds"][0]["port"], 12345);
        assert_eq!(json["inbounds"][0]["protocol"], "vless");
        assert_eq!(json["inbounds"][0]["settings"]["clients"], serde_json::json!([]));
        assert_eq!(json["inbounds"][0]["settings"]["decryption"], "none");
        assert_eq!(json["inbounds"][1]["tag"], "api");
        assert_eq!(json["inbounds"][1]["port"], 54321);
        assert_eq!(json["inbounds"][1]["protocol"], "dokodemo-door");
        assert_eq!(json["routing"]["rules"][0]["inboundTag"], serde_json::json!(["api"]));
        assert_eq!(json["routing"]["rules"][0]["outboundTag"], "api");
        assert_eq!(json["policy"]["levels"]["0"]["statsUserUplink"], true);
        assert_eq!(json["stats"], serde_json::json!({}));
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut doc = document();
        assert!(doc.insert_client("abc").unwrap());
        assert!(!doc.insert_client("abc").unwrap());

        assert_eq!(doc.clients().len(), 1);
        assert_eq!(doc.clients()[0].email.as_deref(), Some("abc"));
        assert_eq!(doc.clients()[0].level, DEFAULT_LEVEL);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut doc = document();
        doc.insert_client("abc").unwrap();
        assert!(!doc.remove_client("zzz").unwrap());
        assert!(doc.remove_client("abc").unwrap());
        assert!(!doc.contains_client("abc"));
    }

    #[test]
    fn test_retain_clients_is_exact() {
        let mut doc = document();
        doc.insert_client("a").unwrap();
        doc.insert_client("b").unwrap();
        doc.insert_client("b").unwrap();

        let desired: BTreeSet<String> = ["b", "c"].iter().map(|s| s.to_string()).collect();
        assert!(doc.retain_clients(&desired).unwrap());
        assert_eq!(doc.client_ids(), desired);
        assert!(!doc.retain_clients(&desired).unwrap());
    }

    #[test]
    fn test_api_first_inbound_is_malformed() {
        let mut doc = document();
        doc.inbounds.swap(0, 1);
        assert!(doc.insert_client("abc").is_err());
        assert!(doc.clients().is_empty());
    }

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let raw = serde_json::json!({
            "log": { "loglevel": "warning", "error": "/var/log/xray/error.log" },
            "inbounds": [{
                "port": 443,
                "protocol": "vmess",
                "sniffing": { "enabled": true },
                "settings": { "clients": [{ "id": "abc", "level": 1, "alterId": 0 }] }
            }],
            "dns": { "servers": ["1.1.1.1"] }
        });

        let mut doc: ConfigDocument = serde_json::from_value(raw).unwrap();
        assert!(doc.ensure_api_wiring(10085));
        let out = serde_json::to_value(&doc).unwrap();

        assert_eq!(out["log"]["error"], "/var/log/xray/error.log");
        assert_eq!(out["dns"]["servers"][0], "1.1.1.1");
        assert_eq!(out["inbounds"][0]["sniffing"]["enabled"], true);
        assert_eq!(out["inbounds"][0]["settings"]["clients"][0]["alterId"], 0);
        assert_eq!(out["inbounds"][1]["port"], 10085);
        assert_eq!(out["routing"]["rules"][0]["outboundTag"], "api");
    }

    #[test]
    fn test_retarget_moves_ports() {
        let mut doc = document();
        doc.insert_client("abc").unwrap();

        let mut moved = node();
        moved.port = 8443;
        moved.api_port = 10085;
        moved.protocol = "vmess".to_string();
        assert!(doc.retarget(&moved).unwrap());

        let traffic = doc.traffic_inbound().unwrap();
        assert_eq!(traffic.port, 8443);
        assert_eq!(traffic.protocol, "vmess");
        assert_eq!(doc.inbounds[1].port, 10085);
        assert!(doc.contains_client("abc"));
        assert!(!doc.retarget(&moved).unwrap());
    }
}
