//! Units of work: the host pairs the dissector re-examines.
//!
//! Every unit knows how to derive the equality key that locates its pair
//! summary record, and how to recover itself from such a record.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::aggregate::{resolve_path, Document, Filter};

/// A host inside a named network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UniqueIp {
    pub ip: IpAddr,
    pub network_uuid: Uuid,
    #[serde(default)]
    pub network_name: String,
}

impl UniqueIp {
    pub fn new(ip: IpAddr, network_uuid: Uuid, network_name: impl Into<String>) -> Self {
        Self {
            ip,
            network_uuid,
            network_name: network_name.into(),
        }
    }

    /// Reads `{prefix}`, `{prefix}_network_uuid` and `{prefix}_network_name`
    /// from a flat summary record.
    fn from_flat(doc: &Document, prefix: &str) -> Option<Self> {
        let ip = doc.get(prefix)?.as_str()?.parse().ok()?;
        let network_uuid = doc
            .get(&format!("{prefix}_network_uuid"))?
            .as_str()?
            .parse()
            .ok()?;
        let network_name = doc
            .get(&format!("{prefix}_network_name"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        Some(Self::new(ip, network_uuid, network_name))
    }

    fn key_into(&self, filter: Filter, prefix: &str) -> Filter {
        filter
            .eq(prefix, self.ip.to_string())
            .eq(format!("{prefix}_network_uuid"), self.network_uuid.to_string())
    }
}

impl fmt::Display for UniqueIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.network_name.is_empty() {
            write!(f, "{}", self.ip)
        } else {
            write!(f, "{}@{}", self.ip, self.network_name)
        }
    }
}

/// Anything the dissector can look up and re-aggregate.
pub trait UnitOfWork: fmt::Debug + fmt::Display + Clone + Send + Sync + 'static {
    /// Equality filter locating this unit's pair summary record.
    fn query_key(&self) -> Filter;

    /// Recovers a unit from a pair summary record.
    fn from_summary(doc: &Document) -> Option<Self>;

    /// Descriptive fields stored alongside the key on result records.
    fn record_fields(&self) -> Document;
}

/// A source host talking to a named destination (SNI variant).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SrcFqdnPair {
    pub src: UniqueIp,
    pub fqdn: String,
}

impl SrcFqdnPair {
    pub fn new(src: UniqueIp, fqdn: impl Into<String>) -> Self {
        Self {
            src,
            fqdn: fqdn.into(),
        }
    }
}

impl fmt::Display for SrcFqdnPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.fqdn)
    }
}

impl UnitOfWork for SrcFqdnPair {
    fn query_key(&self) -> Filter {
        self.src.key_into(Filter::new(), "src").eq("fqdn", self.fqdn.clone())
    }

    fn from_summary(doc: &Document) -> Option<Self> {
        let src = UniqueIp::from_flat(doc, "src")?;
        let fqdn = doc.get("fqdn")?.as_str()?;
        Some(Self::new(src, fqdn))
    }

    fn record_fields(&self) -> Document {
        let mut fields = Document::new();
        fields.insert("src_network_name".into(), self.src.network_name.clone().into());
        fields
    }
}

/// A source host reaching a named destination through a proxy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyPair {
    pub hosts: SrcFqdnPair,
    pub proxy: UniqueIp,
}

impl fmt::Display for ProxyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.hosts, self.proxy)
    }
}

impl UnitOfWork for ProxyPair {
    fn query_key(&self) -> Filter {
        self.hosts.query_key()
    }

    fn from_summary(doc: &Document) -> Option<Self> {
        let hosts = SrcFqdnPair::from_summary(doc)?;
        let proxy = serde_json::from_value(resolve_path(doc, "proxy")?).ok()?;
        Some(Self { hosts, proxy })
    }

    fn record_fields(&self) -> Document {
        let mut fields = self.hosts.record_fields();
        fields.insert(
            "proxy".into(),
            serde_json::json!({
                "ip": self.proxy.ip.to_string(),
                "network_uuid": self.proxy.network_uuid.to_string(),
                "network_name": self.proxy.network_name,
            }),
        );
        fields
    }
}

/// A source host talking to a destination host (general variant).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpPair {
    pub src: UniqueIp,
    pub dst: UniqueIp,
}

impl fmt::Display for IpPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

impl UnitOfWork for IpPair {
    fn query_key(&self) -> Filter {
        let filter = self.src.key_into(Filter::new(), "src");
        self.dst.key_into(filter, "dst")
    }

    fn from_summary(doc: &Document) -> Option<Self> {
        Some(Self {
            src: UniqueIp::from_flat(doc, "src")?,
            dst: UniqueIp::from_flat(doc, "dst")?,
        })
    }

    fn record_fields(&self) -> Document {
        let mut fields = Document::new();
        fields.insert("src_network_name".into(), self.src.network_name.clone().into());
        fields.insert("dst_network_name".into(), self.dst.network_name.clone().into());
        fields
    }
}
