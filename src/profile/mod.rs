//! Proxy profile model
//!
//! A [`Profile`] is one stored proxy server definition. The protocol-specific
//! parameters live in [`ProxyBean`], a closed sum type over every protocol
//! kind the compiler understands — adding a protocol is an exhaustiveness
//! error in the synthesizer, not a silently ignored `else` branch.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable profile identity as assigned by the store.
pub type ProfileId = i64;

/// One stored proxy profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Unique, stable identity
    pub id: ProfileId,

    /// User-visible name
    #[serde(default)]
    pub name: String,

    /// Protocol-specific parameters
    #[serde(flatten)]
    pub bean: ProxyBean,
}

impl Profile {
    pub fn kind(&self) -> ProtocolKind {
        self.bean.kind()
    }

    /// Display name falling back to the server endpoint.
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        match self.bean.server_endpoint() {
            Some((addr, port)) => format!("{}:{}", addr, port),
            None => format!("#{}", self.id),
        }
    }
}

/// Closed enum of protocol kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    Socks,
    Http,
    Shadowsocks,
    ShadowsocksR,
    Vmess,
    Trojan,
    TrojanGo,
    Naive,
    Hysteria,
    Ssh,
    WireGuard,
    Chain,
    External,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProtocolKind::Socks => "SOCKS",
            ProtocolKind::Http => "HTTP",
            ProtocolKind::Shadowsocks => "Shadowsocks",
            ProtocolKind::ShadowsocksR => "ShadowsocksR",
            ProtocolKind::Vmess => "VMess",
            ProtocolKind::Trojan => "Trojan",
            ProtocolKind::TrojanGo => "Trojan-Go",
            ProtocolKind::Naive => "Naive",
            ProtocolKind::Hysteria => "Hysteria",
            ProtocolKind::Ssh => "SSH",
            ProtocolKind::WireGuard => "WireGuard",
            ProtocolKind::Chain => "Chain",
            ProtocolKind::External => "External",
        };
        write!(f, "{}", s)
    }
}

/// Protocol-specific parameter bag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProxyBean {
    Socks(SocksBean),
    Http(HttpBean),
    #[serde(rename = "ss")]
    Shadowsocks(ShadowsocksBean),
    #[serde(rename = "ssr")]
    ShadowsocksR(ShadowsocksRBean),
    Vmess(VmessBean),
    Trojan(TrojanBean),
    TrojanGo(TrojanGoBean),
    Naive(NaiveBean),
    Hysteria(HysteriaBean),
    Ssh(SshBean),
    Wireguard(WireGuardBean),
    Chain(ChainBean),
    External(ExternalBean),
}

impl ProxyBean {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            ProxyBean::Socks(_) => ProtocolKind::Socks,
            ProxyBean::Http(_) => ProtocolKind::Http,
            ProxyBean::Shadowsocks(_) => ProtocolKind::Shadowsocks,
            ProxyBean::ShadowsocksR(_) => ProtocolKind::ShadowsocksR,
            ProxyBean::Vmess(_) => ProtocolKind::Vmess,
            ProxyBean::Trojan(_) => ProtocolKind::Trojan,
            ProxyBean::TrojanGo(_) => ProtocolKind::TrojanGo,
            ProxyBean::Naive(_) => ProtocolKind::Naive,
            ProxyBean::Hysteria(_) => ProtocolKind::Hysteria,
            ProxyBean::Ssh(_) => ProtocolKind::Ssh,
            ProxyBean::Wireguard(_) => ProtocolKind::WireGuard,
            ProxyBean::Chain(_) => ProtocolKind::Chain,
            ProxyBean::External(_) => ProtocolKind::External,
        }
    }

    pub fn is_chain(&self) -> bool {
        matches!(self, ProxyBean::Chain(_))
    }

    /// Server endpoint of the hop, if the kind has one (chains do not).
    pub fn server_endpoint(&self) -> Option<(&str, u16)> {
        match self {
            ProxyBean::Socks(b) => Some((&b.server_address, b.server_port)),
            ProxyBean::Http(b) => Some((&b.server_address, b.server_port)),
            ProxyBean::Shadowsocks(b) => Some((&b.server_address, b.server_port)),
            ProxyBean::ShadowsocksR(b) => Some((&b.server_address, b.server_port)),
            ProxyBean::Vmess(b) => Some((&b.server_address, b.server_port)),
            ProxyBean::Trojan(b) => Some((&b.server_address, b.server_port)),
            ProxyBean::TrojanGo(b) => Some((&b.server_address, b.server_port)),
            ProxyBean::Naive(b) => Some((&b.server_address, b.server_port)),
            ProxyBean::Hysteria(b) => Some((&b.server_address, b.server_port)),
            ProxyBean::Ssh(b) => Some((&b.server_address, b.server_port)),
            ProxyBean::Wireguard(b) => Some((&b.server_address, b.server_port)),
            ProxyBean::Chain(_) => None,
            ProxyBean::External(b) => Some((&b.server_address, b.server_port)),
        }
    }

    /// Whether the routing engine implements this protocol natively.
    ///
    /// Everything else is run as an external plugin process and bridged over
    /// a loopback port.
    pub fn is_native(&self) -> bool {
        matches!(
            self,
            ProxyBean::Socks(_)
                | ProxyBean::Http(_)
                | ProxyBean::Shadowsocks(_)
                | ProxyBean::ShadowsocksR(_)
                | ProxyBean::Vmess(_)
                | ProxyBean::Trojan(_)
                | ProxyBean::Ssh(_)
                | ProxyBean::Wireguard(_)
                | ProxyBean::Chain(_)
        )
    }

    /// Whether a bridged hop's upstream connection can be redirected back
    /// through the engine via a dokodemo-door mapping inbound.
    pub fn can_mapping(&self) -> bool {
        match self.server_endpoint() {
            Some((addr, _)) => !addr.is_empty(),
            None => false,
        }
    }

    /// Whether the engine can multiplex streams over this hop's transport.
    ///
    /// Trojan-Go does mux inside its own plugin process, never in the engine.
    pub fn supports_mux(&self) -> bool {
        match self {
            ProxyBean::Vmess(b) => matches!(b.network.as_str(), "tcp" | "ws" | "http"),
            ProxyBean::Trojan(_) => true,
            _ => false,
        }
    }

    /// Lowercase protocol name used to key the global mux-enabled policy set.
    pub fn protocol_name(&self) -> &'static str {
        match self {
            ProxyBean::Socks(_) => "socks",
            ProxyBean::Http(_) => "http",
            ProxyBean::Shadowsocks(_) => "ss",
            ProxyBean::ShadowsocksR(_) => "ssr",
            ProxyBean::Vmess(_) => "vmess",
            ProxyBean::Trojan(_) => "trojan",
            ProxyBean::TrojanGo(_) => "trojan-go",
            ProxyBean::Naive(_) => "naive",
            ProxyBean::Hysteria(_) => "hysteria",
            ProxyBean::Ssh(_) => "ssh",
            ProxyBean::Wireguard(_) => "wireguard",
            ProxyBean::Chain(_) => "chain",
            ProxyBean::External(_) => "external",
        }
    }

    /// Network the plugin process talks to its server over ("tcp", "udp"
    /// or "tcp,udp"), used by the mapping inbound.
    pub fn mapping_network(&self) -> &'static str {
        match self {
            ProxyBean::Hysteria(_) => "udp",
            ProxyBean::Wireguard(_) => "udp",
            _ => "tcp",
        }
    }
}

/// SOCKS outbound parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SocksBean {
    pub server_address: String,
    pub server_port: u16,
    /// 4, "4a" handled as 4; 5 is the default
    pub protocol_version: Option<u8>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl SocksBean {
    pub fn version_name(&self) -> &'static str {
        match self.protocol_version {
            Some(4) => "4",
            _ => "5",
        }
    }
}

/// HTTP(S) CONNECT proxy parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpBean {
    pub server_address: String,
    pub server_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    pub sni: Option<String>,
}

/// Shadowsocks parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowsocksBean {
    pub server_address: String,
    pub server_port: u16,
    pub method: String,
    pub password: String,
    /// SIP003 plugin spec, e.g. "obfs-local;obfs=http"
    pub plugin: Option<String>,
}

/// ShadowsocksR parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowsocksRBean {
    pub server_address: String,
    pub server_port: u16,
    pub method: String,
    pub password: String,
    pub obfs: String,
    pub obfs_param: String,
    pub protocol: String,
    pub protocol_param: String,
}

/// UDP packet encoding for VMess
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PacketEncoding {
    #[default]
    None,
    Packet,
    Xudp,
}

/// VMess parameters, including the shared V2Ray transport surface
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmessBean {
    pub server_address: String,
    pub server_port: u16,
    pub uuid: String,
    pub alter_id: u16,
    /// Cipher, "auto" when blank
    pub encryption: String,
    pub packet_encoding: PacketEncoding,
    pub experimental_authenticated_length: bool,
    pub experimental_no_termination_signal: bool,

    // transport
    /// One of tcp, kcp, ws, http, quic, grpc
    pub network: String,
    /// "" or "tls"
    pub security: String,
    pub sni: String,
    /// Newline separated
    pub alpn: String,
    /// PEM lines, newline separated; non-empty disables system roots
    pub certificates: String,
    /// Newline separated sha256 pins
    pub pinned_peer_certificate_chain_sha256: String,
    pub allow_insecure: bool,
    /// tcp: "http" for header obfuscation; kcp/quic: packet header type
    pub header_type: String,
    /// Host header(s), comma separated for tcp/http transports
    pub host: String,
    /// Request path(s)
    pub path: String,
    pub kcp_seed: String,
    pub quic_security: String,
    pub quic_key: String,
    pub grpc_service_name: String,
    pub ws_max_early_data: u32,
    pub early_data_header_name: String,
}

impl Default for VmessBean {
    fn default() -> Self {
        VmessBean {
            server_address: String::new(),
            server_port: 0,
            uuid: String::new(),
            alter_id: 0,
            encryption: String::new(),
            packet_encoding: PacketEncoding::None,
            experimental_authenticated_length: false,
            experimental_no_termination_signal: false,
            network: "tcp".to_string(),
            security: String::new(),
            sni: String::new(),
            alpn: String::new(),
            certificates: String::new(),
            pinned_peer_certificate_chain_sha256: String::new(),
            allow_insecure: false,
            header_type: String::new(),
            host: String::new(),
            path: String::new(),
            kcp_seed: String::new(),
            quic_security: String::new(),
            quic_key: String::new(),
            grpc_service_name: String::new(),
            ws_max_early_data: 0,
            early_data_header_name: String::new(),
        }
    }
}

/// Trojan parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrojanBean {
    pub server_address: String,
    pub server_port: u16,
    pub password: String,
    pub sni: String,
    /// Newline separated
    pub alpn: String,
    pub allow_insecure: bool,
}

/// Trojan-Go parameters (external plugin)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrojanGoBean {
    pub server_address: String,
    pub server_port: u16,
    pub password: String,
    pub sni: String,
    /// "original" or "ws"
    pub network: String,
    pub host: String,
    pub path: String,
    /// Shadowsocks layer: "ss;method:password" or empty
    pub encryption: String,
    pub allow_insecure: bool,
}

/// NaiveProxy parameters (external plugin)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NaiveBean {
    pub server_address: String,
    pub server_port: u16,
    pub username: String,
    pub password: String,
    /// "https" or "quic"
    pub proto: String,
    pub sni: String,
    /// Extra request headers, newline separated "Name: value" lines
    pub extra_headers: String,
    pub insecure_concurrency: u32,
}

impl NaiveBean {
    pub fn proto_or_default(&self) -> &str {
        if self.proto.is_empty() {
            "https"
        } else {
            &self.proto
        }
    }
}

/// Hysteria parameters (external plugin)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HysteriaBean {
    pub server_address: String,
    pub server_port: u16,
    /// "udp", "faketcp" or "wechat-video"
    pub protocol: String,
    pub auth_payload: String,
    pub obfuscation: String,
    pub upload_mbps: u32,
    pub download_mbps: u32,
    pub sni: String,
    pub alpn: String,
    pub ca_text: String,
    pub allow_insecure: bool,
    pub stream_receive_window: u64,
    pub connection_receive_window: u64,
    pub disable_mtu_discovery: bool,
}

/// SSH authentication method
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "method")]
pub enum SshAuth {
    #[default]
    None,
    Password {
        password: String,
    },
    PrivateKey {
        private_key: String,
        #[serde(default)]
        passphrase: String,
    },
}

/// SSH tunnel parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SshBean {
    pub server_address: String,
    pub server_port: u16,
    pub username: String,
    pub auth: SshAuth,
    /// Expected host key, for verification
    pub public_key: String,
}

/// WireGuard parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WireGuardBean {
    pub server_address: String,
    pub server_port: u16,
    /// Interface addresses, newline separated CIDRs
    pub local_address: String,
    pub private_key: String,
    pub peer_public_key: String,
    pub peer_pre_shared_key: String,
    pub mtu: u32,
}

/// Ordered chain of member profile ids, declared entry-first
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChainBean {
    pub proxies: Vec<ProfileId>,
}

/// Generic external plugin profile
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalBean {
    pub server_address: String,
    pub server_port: u16,
    /// Plugin binary identity for the process supervisor
    pub plugin_id: String,
    /// Raw config template; `%local_port%`, `%server_address%` and
    /// `%server_port%` placeholders are substituted at compile time
    pub config_template: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vmess() -> Profile {
        Profile {
            id: 1,
            name: "jp-1".to_string(),
            bean: ProxyBean::Vmess(VmessBean {
                server_address: "example.org".to_string(),
                server_port: 443,
                uuid: "b831381d-6324-4d53-ad4f-8cda48b30811".to_string(),
                network: "ws".to_string(),
                security: "tls".to_string(),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_native_split() {
        assert!(vmess().bean.is_native());
        assert!(!ProxyBean::Hysteria(HysteriaBean::default()).is_native());
        assert!(!ProxyBean::Naive(NaiveBean::default()).is_native());
        assert!(ProxyBean::Wireguard(WireGuardBean::default()).is_native());
    }

    #[test]
    fn test_mux_support() {
        assert!(vmess().bean.supports_mux());
        let mut b = VmessBean::default();
        b.network = "quic".to_string();
        assert!(!ProxyBean::Vmess(b).supports_mux());
        assert!(ProxyBean::Trojan(TrojanBean::default()).supports_mux());
        assert!(!ProxyBean::TrojanGo(TrojanGoBean::default()).supports_mux());
    }

    #[test]
    fn test_yaml_round_trip_tagged() {
        let yaml = r#"
id: 5
name: chain
type: chain
proxies: [1, 2, 3]
"#;
        let p: Profile = serde_yaml::from_str(yaml).unwrap();
        assert!(p.bean.is_chain());
        match &p.bean {
            ProxyBean::Chain(c) => assert_eq!(c.proxies, vec![1, 2, 3]),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_mapping_network() {
        assert_eq!(ProxyBean::Hysteria(HysteriaBean::default()).mapping_network(), "udp");
        assert_eq!(ProxyBean::TrojanGo(TrojanGoBean::default()).mapping_network(), "tcp");
    }
}
