//! V2Ray-core configuration document schema
//!
//! Serialized field names and nesting here are an external contract: the
//! engine rejects or silently misbehaves on structurally invalid documents.
//! Everything optional is skipped when absent so the emitted JSON carries
//! only what a given compile actually produced.

use serde::Serialize;
use std::collections::BTreeMap;

/// Root configuration document handed to the engine loader.
#[derive(Debug, Clone, Default, Serialize)]
pub struct V2rayConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log: Option<LogObject>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsObject>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyObject>,

    pub inbounds: Vec<InboundObject>,
    pub outbounds: Vec<OutboundObject>,
    pub routing: RoutingObject,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reverse: Option<ReverseObject>,

    /// Presence (even empty) enables the stats subsystem
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogObject {
    pub loglevel: String,
}

// ---------------------------------------------------------------------------
// DNS

#[derive(Debug, Clone, Default, Serialize)]
pub struct DnsObject {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub hosts: BTreeMap<String, String>,

    pub servers: Vec<DnsServer>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fakedns: Vec<FakeDnsObject>,

    #[serde(rename = "queryStrategy", skip_serializing_if = "Option::is_none")]
    pub query_strategy: Option<String>,

    #[serde(rename = "disableFallbackIfMatch", skip_serializing_if = "std::ops::Not::not")]
    pub disable_fallback_if_match: bool,
}

/// A DNS upstream: either a bare address string or a full server object.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum DnsServer {
    Plain(String),
    Object(DnsServerObject),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DnsServerObject {
    pub address: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,

    #[serde(rename = "skipFallback", skip_serializing_if = "std::ops::Not::not")]
    pub skip_fallback: bool,

    #[serde(rename = "uidList", skip_serializing_if = "Vec::is_empty")]
    pub uid_list: Vec<u32>,

    #[serde(rename = "queryStrategy", skip_serializing_if = "Option::is_none")]
    pub query_strategy: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FakeDnsObject {
    #[serde(rename = "ipPool")]
    pub ip_pool: String,
    #[serde(rename = "poolSize")]
    pub pool_size: u32,
}

// ---------------------------------------------------------------------------
// Policy

#[derive(Debug, Clone, Default, Serialize)]
pub struct PolicyObject {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub levels: BTreeMap<String, LevelPolicyObject>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPolicyObject>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LevelPolicyObject {
    #[serde(rename = "connIdle", skip_serializing_if = "Option::is_none")]
    pub conn_idle: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemPolicyObject {
    #[serde(rename = "statsOutboundUplink")]
    pub stats_outbound_uplink: bool,
    #[serde(rename = "statsOutboundDownlink")]
    pub stats_outbound_downlink: bool,
}

// ---------------------------------------------------------------------------
// Inbounds

#[derive(Debug, Clone, Default, Serialize)]
pub struct InboundObject {
    pub tag: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,

    pub port: u16,
    pub protocol: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<InboundSettings>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sniffing: Option<SniffingObject>,

    #[serde(rename = "streamSettings", skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettingsObject>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum InboundSettings {
    Socks(SocksInboundSettings),
    Http(HttpInboundSettings),
    Dokodemo(DokodemoInboundSettings),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SocksInboundSettings {
    pub auth: String,
    pub udp: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpInboundSettings {
    #[serde(rename = "allowTransparent")]
    pub allow_transparent: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DokodemoInboundSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    pub network: String,

    #[serde(rename = "followRedirect", skip_serializing_if = "std::ops::Not::not")]
    pub follow_redirect: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SniffingObject {
    pub enabled: bool,

    #[serde(rename = "destOverride")]
    pub dest_override: Vec<String>,

    #[serde(rename = "metadataOnly")]
    pub metadata_only: bool,

    #[serde(rename = "routeOnly")]
    pub route_only: bool,
}

// ---------------------------------------------------------------------------
// Outbounds

#[derive(Debug, Clone, Default, Serialize)]
pub struct OutboundObject {
    pub tag: String,
    pub protocol: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<OutboundSettings>,

    #[serde(rename = "streamSettings", skip_serializing_if = "Option::is_none")]
    pub stream_settings: Option<StreamSettingsObject>,

    #[serde(rename = "proxySettings", skip_serializing_if = "Option::is_none")]
    pub proxy_settings: Option<ProxySettingsObject>,

    #[serde(rename = "domainStrategy", skip_serializing_if = "Option::is_none")]
    pub domain_strategy: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mux: Option<MuxObject>,
}

/// In-engine forwarding: this outbound dials through another outbound.
#[derive(Debug, Clone, Serialize)]
pub struct ProxySettingsObject {
    pub tag: String,
    #[serde(rename = "transportLayer")]
    pub transport_layer: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MuxObject {
    pub enabled: bool,
    pub concurrency: u16,
    #[serde(rename = "packetEncoding", skip_serializing_if = "Option::is_none")]
    pub packet_encoding: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundSettings {
    Socks(SocksOutboundSettings),
    Http(HttpOutboundSettings),
    Vmess(VmessOutboundSettings),
    Shadowsocks(ShadowsocksOutboundSettings),
    Trojan(TrojanOutboundSettings),
    WireGuard(WireGuardOutboundSettings),
    Ssh(SshOutboundSettings),
    Freedom(FreedomOutboundSettings),
    Dns(DnsOutboundSettings),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SocksUser {
    pub user: String,
    pub pass: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SocksServerObject {
    pub address: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<SocksUser>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SocksOutboundSettings {
    pub servers: Vec<SocksServerObject>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpOutboundSettings {
    pub servers: Vec<SocksServerObject>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VmessUserObject {
    pub id: String,
    #[serde(rename = "alterId")]
    pub alter_id: u16,
    pub security: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VmessServerObject {
    pub address: String,
    pub port: u16,
    pub users: Vec<VmessUserObject>,
    #[serde(rename = "packetEncoding", skip_serializing_if = "Option::is_none")]
    pub packet_encoding: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VmessOutboundSettings {
    pub vnext: Vec<VmessServerObject>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShadowsocksServerObject {
    pub address: String,
    pub port: u16,
    pub method: String,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShadowsocksOutboundSettings {
    pub servers: Vec<ShadowsocksServerObject>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,

    #[serde(rename = "pluginOpts", skip_serializing_if = "Option::is_none")]
    pub plugin_opts: Option<String>,

    #[serde(rename = "pluginArgs", skip_serializing_if = "Vec::is_empty")]
    pub plugin_args: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrojanServerObject {
    pub address: String,
    pub port: u16,
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TrojanOutboundSettings {
    pub servers: Vec<TrojanServerObject>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WireGuardOutboundSettings {
    pub address: String,
    pub port: u16,
    pub network: String,
    #[serde(rename = "localAddresses")]
    pub local_addresses: Vec<String>,
    #[serde(rename = "privateKey")]
    pub private_key: String,
    #[serde(rename = "peerPublicKey")]
    pub peer_public_key: String,
    #[serde(rename = "preSharedKey", skip_serializing_if = "String::is_empty")]
    pub pre_shared_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SshOutboundSettings {
    pub address: String,
    pub port: u16,
    pub user: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(rename = "privateKey", skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    #[serde(rename = "publicKey", skip_serializing_if = "String::is_empty")]
    pub public_key: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FreedomOutboundSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DnsOutboundSettings {
    #[serde(rename = "userLevel")]
    pub user_level: u8,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

// ---------------------------------------------------------------------------
// Stream settings

#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamSettingsObject {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,

    #[serde(rename = "tlsSettings", skip_serializing_if = "Option::is_none")]
    pub tls_settings: Option<TlsObject>,

    #[serde(rename = "tcpSettings", skip_serializing_if = "Option::is_none")]
    pub tcp_settings: Option<TcpObject>,

    #[serde(rename = "kcpSettings", skip_serializing_if = "Option::is_none")]
    pub kcp_settings: Option<KcpObject>,

    #[serde(rename = "wsSettings", skip_serializing_if = "Option::is_none")]
    pub ws_settings: Option<WebSocketObject>,

    #[serde(rename = "httpSettings", skip_serializing_if = "Option::is_none")]
    pub http_settings: Option<HttpTransportObject>,

    #[serde(rename = "quicSettings", skip_serializing_if = "Option::is_none")]
    pub quic_settings: Option<QuicObject>,

    #[serde(rename = "grpcSettings", skip_serializing_if = "Option::is_none")]
    pub grpc_settings: Option<GrpcObject>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sockopt: Option<SockoptObject>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TlsObject {
    #[serde(rename = "serverName", skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,

    #[serde(rename = "allowInsecure", skip_serializing_if = "std::ops::Not::not")]
    pub allow_insecure: bool,

    #[serde(rename = "disableSystemRoot", skip_serializing_if = "std::ops::Not::not")]
    pub disable_system_root: bool,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub certificates: Vec<CertificateObject>,

    #[serde(
        rename = "pinnedPeerCertificateChainSha256",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub pinned_peer_certificate_chain_sha256: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CertificateObject {
    pub usage: String,
    pub certificate: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TcpObject {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<TcpHeaderObject>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TcpHeaderObject {
    #[serde(rename = "type")]
    pub header_type: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<HttpRequestObject>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpRequestObject {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, Vec<String>>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KcpObject {
    pub mtu: u32,
    pub tti: u32,
    #[serde(rename = "uplinkCapacity")]
    pub uplink_capacity: u32,
    #[serde(rename = "downlinkCapacity")]
    pub downlink_capacity: u32,
    pub congestion: bool,
    #[serde(rename = "readBufferSize")]
    pub read_buffer_size: u32,
    #[serde(rename = "writeBufferSize")]
    pub write_buffer_size: u32,
    pub header: KcpHeaderObject,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct KcpHeaderObject {
    #[serde(rename = "type")]
    pub header_type: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WebSocketObject {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    pub path: String,

    #[serde(rename = "maxEarlyData", skip_serializing_if = "Option::is_none")]
    pub max_early_data: Option<u32>,

    #[serde(rename = "earlyDataHeaderName", skip_serializing_if = "Option::is_none")]
    pub early_data_header_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpTransportObject {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub host: Vec<String>,
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QuicObject {
    pub security: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key: String,
    pub header: KcpHeaderObject,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GrpcObject {
    #[serde(rename = "serviceName")]
    pub service_name: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SockoptObject {
    #[serde(rename = "tcpKeepAliveInterval", skip_serializing_if = "Option::is_none")]
    pub tcp_keep_alive_interval: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tproxy: Option<String>,
}

// ---------------------------------------------------------------------------
// Routing

#[derive(Debug, Clone, Default, Serialize)]
pub struct RoutingObject {
    #[serde(rename = "domainStrategy")]
    pub domain_strategy: String,

    pub rules: Vec<RoutingRuleObject>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RoutingRuleObject {
    #[serde(rename = "type")]
    pub rule_type: String,

    #[serde(rename = "inboundTag", skip_serializing_if = "Vec::is_empty")]
    pub inbound_tag: Vec<String>,

    #[serde(rename = "outboundTag", skip_serializing_if = "Option::is_none")]
    pub outbound_tag: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub domain: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ip: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,

    #[serde(rename = "sourcePort", skip_serializing_if = "Option::is_none")]
    pub source_port: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub source: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub protocol: Vec<String>,

    #[serde(rename = "uidList", skip_serializing_if = "Vec::is_empty")]
    pub uid_list: Vec<u32>,
}

impl RoutingRuleObject {
    /// A bare field rule forwarding to `outbound_tag`.
    pub fn field(outbound_tag: impl Into<String>) -> Self {
        RoutingRuleObject {
            rule_type: "field".to_string(),
            outbound_tag: Some(outbound_tag.into()),
            ..Default::default()
        }
    }

    /// Rule keyed on an inbound tag.
    pub fn inbound_forward(inbound: impl Into<String>, outbound: impl Into<String>) -> Self {
        RoutingRuleObject {
            rule_type: "field".to_string(),
            inbound_tag: vec![inbound.into()],
            outbound_tag: Some(outbound.into()),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Reverse proxy

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReverseObject {
    pub bridges: Vec<BridgeObject>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BridgeObject {
    pub tag: String,
    pub domain: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_field_names() {
        let ob = OutboundObject {
            tag: "proxy".to_string(),
            protocol: "vmess".to_string(),
            settings: Some(OutboundSettings::Vmess(VmessOutboundSettings {
                vnext: vec![VmessServerObject {
                    address: "a".to_string(),
                    port: 443,
                    users: vec![VmessUserObject {
                        id: "u".to_string(),
                        alter_id: 0,
                        security: "auto".to_string(),
                        experimental: None,
                    }],
                    packet_encoding: None,
                }],
            })),
            stream_settings: Some(StreamSettingsObject {
                network: Some("ws".to_string()),
                ..Default::default()
            }),
            proxy_settings: Some(ProxySettingsObject {
                tag: "next".to_string(),
                transport_layer: true,
            }),
            domain_strategy: Some("AsIs".to_string()),
            mux: None,
        };
        let v = serde_json::to_value(&ob).unwrap();
        assert!(v.get("streamSettings").is_some());
        assert!(v.get("proxySettings").is_some());
        assert_eq!(v["proxySettings"]["transportLayer"], true);
        assert_eq!(v["settings"]["vnext"][0]["users"][0]["alterId"], 0);
        assert_eq!(v["domainStrategy"], "AsIs");
    }

    #[test]
    fn test_absent_fields_omitted() {
        let rule = RoutingRuleObject::field("direct");
        let v = serde_json::to_value(&rule).unwrap();
        assert_eq!(v["type"], "field");
        assert!(v.get("inboundTag").is_none());
        assert!(v.get("domain").is_none());
        assert!(v.get("uidList").is_none());
    }

    #[test]
    fn test_dns_server_untagged() {
        let servers = vec![
            DnsServer::Plain("fakedns".to_string()),
            DnsServer::Object(DnsServerObject {
                address: "1.1.1.1".to_string(),
                skip_fallback: true,
                ..Default::default()
            }),
        ];
        let v = serde_json::to_value(&servers).unwrap();
        assert_eq!(v[0], "fakedns");
        assert_eq!(v[1]["address"], "1.1.1.1");
        assert_eq!(v[1]["skipFallback"], true);
    }
}
