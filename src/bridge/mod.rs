//! External process bridging
//!
//! Protocols the engine does not speak natively are run as separate plugin
//! processes. For such a hop the chain-internal outbound becomes a trivial
//! loopback SOCKS descriptor pointing at the plugin's listen port, and the
//! plugin's own configuration is generated here as an opaque payload for the
//! process supervisor.
//!
//! When the plugin's upstream connection must itself go through the engine
//! (so it can use the engine's protected sockets inside a VPN capture loop),
//! a dokodemo-door mapping inbound redirects the plugin's expected server
//! endpoint back to loopback; the compiler attaches a direct-bypass rule to
//! that inbound for entry hops so the plugin's own traffic never re-enters
//! chain routing.

use crate::alloc::Allocator;
use crate::common::{is_ip_address, LOCALHOST};
use crate::compiler::{CompileOptions, Ipv6Mode};
use crate::document::*;
use crate::profile::{Profile, ProxyBean};
use crate::{Error, Result};
use serde_json::json;

/// Plugin process payload for the supervisor.
#[derive(Debug, Clone)]
pub struct PluginPayload {
    /// Which plugin binary to launch
    pub plugin_id: String,
    /// Profile this payload was generated from
    pub profile_id: i64,
    /// Config file content, plugin-specific format
    pub content: String,
}

/// Everything emitted for one bridged hop.
#[derive(Debug)]
pub struct BridgedHop {
    /// Loopback SOCKS outbound standing in for the hop inside the engine
    pub outbound: OutboundObject,
    /// Port the plugin process listens on
    pub local_port: u16,
    /// Mapping inbound redirecting the plugin's upstream back into the
    /// engine, when the hop has a concrete server endpoint
    pub mapping: Option<InboundObject>,
    pub payload: PluginPayload,
}

/// Builds loopback bridges and plugin payloads.
pub struct ExternalProcessBridge<'a> {
    opts: &'a CompileOptions,
}

impl<'a> ExternalProcessBridge<'a> {
    pub fn new(opts: &'a CompileOptions) -> Self {
        ExternalProcessBridge { opts }
    }

    /// Bridge one externally-implemented hop.
    ///
    /// Entry-hop dedup is the caller's job: it must not call this twice for
    /// the same deduplicated entry profile.
    pub fn bridge(
        &self,
        profile: &Profile,
        chain_tag: &str,
        alloc: &mut Allocator,
    ) -> Result<BridgedHop> {
        let local_port = alloc.next_port()?;

        let outbound = OutboundObject {
            protocol: "socks".to_string(),
            settings: Some(OutboundSettings::Socks(SocksOutboundSettings {
                servers: vec![SocksServerObject {
                    address: LOCALHOST.to_string(),
                    port: local_port,
                    users: vec![],
                }],
                version: None,
            })),
            ..Default::default()
        };

        // Redirect the plugin's upstream through the engine where possible;
        // the payload then dials loopback instead of the real server.
        let (mapping, final_address, final_port) = if profile.bean.can_mapping() {
            let (server_address, server_port) = profile
                .bean
                .server_endpoint()
                .ok_or_else(|| Error::missing(profile.id, "server_address"))?;
            let mapping_port = alloc.next_port()?;
            let inbound = InboundObject {
                tag: alloc.mapping_tag(chain_tag, profile.id),
                listen: Some(LOCALHOST.to_string()),
                port: mapping_port,
                protocol: "dokodemo-door".to_string(),
                settings: Some(InboundSettings::Dokodemo(DokodemoInboundSettings {
                    address: Some(server_address.to_string()),
                    port: Some(server_port),
                    network: profile.bean.mapping_network().to_string(),
                    follow_redirect: false,
                })),
                sniffing: None,
                stream_settings: None,
            };
            (Some(inbound), LOCALHOST.to_string(), mapping_port)
        } else {
            let (addr, port) = profile.bean.server_endpoint().unwrap_or(("", 0));
            (None, addr.to_string(), port)
        };

        let payload = self.payload(profile, local_port, &final_address, final_port)?;

        Ok(BridgedHop {
            outbound,
            local_port,
            mapping,
            payload,
        })
    }

    fn payload(
        &self,
        profile: &Profile,
        local_port: u16,
        final_address: &str,
        final_port: u16,
    ) -> Result<PluginPayload> {
        let id = profile.id;
        match &profile.bean {
            ProxyBean::TrojanGo(b) => {
                if b.password.is_empty() {
                    return Err(Error::missing(id, "password"));
                }
                let mut doc = json!({
                    "run_type": "client",
                    "local_addr": LOCALHOST,
                    "local_port": local_port,
                    "remote_addr": final_address,
                    "remote_port": final_port,
                    "password": [b.password],
                    "log_level": if self.opts.enable_log { 0 } else { 2 },
                    "tcp": {
                        "prefer_ipv4": matches!(
                            self.opts.ipv6_mode,
                            Ipv6Mode::Disable | Ipv6Mode::Enable
                        ),
                    },
                    "ssl": {
                        "verify": !b.allow_insecure,
                    },
                });
                // the mapping inbound rewrites the remote to loopback; the
                // TLS hostname must stay the real server name
                let mut sni = b.sni.as_str();
                if sni.is_empty()
                    && final_address == LOCALHOST
                    && !is_ip_address(&b.server_address)
                {
                    sni = &b.server_address;
                }
                if !sni.is_empty() {
                    doc["ssl"]["sni"] = json!(sni);
                }
                if self.opts.enable_mux && self.opts.mux_protocols.contains("trojan-go") {
                    doc["mux"] = json!({
                        "enabled": true,
                        "concurrency": self.opts.mux_concurrency,
                    });
                }
                if b.network == "ws" {
                    doc["websocket"] = json!({
                        "enabled": true,
                        "host": b.host,
                        "path": b.path,
                    });
                }
                if let Some(rest) = b.encryption.strip_prefix("ss;") {
                    let (method, password) = rest.split_once(':').unwrap_or((rest, ""));
                    doc["shadowsocks"] = json!({
                        "enabled": true,
                        "method": method,
                        "password": password,
                    });
                }
                Ok(PluginPayload {
                    plugin_id: "trojan-go-plugin".to_string(),
                    profile_id: id,
                    content: serde_json::to_string_pretty(&doc)?,
                })
            }

            ProxyBean::Naive(b) => {
                if b.username.is_empty() || b.password.is_empty() {
                    return Err(Error::missing(id, "username"));
                }
                let proxy_url = format!(
                    "{}://{}:{}@{}:{}",
                    b.proto_or_default(),
                    b.username,
                    b.password,
                    final_address,
                    final_port
                );
                let mut doc = json!({
                    "listen": format!("socks://{}:{}", LOCALHOST, local_port),
                    "proxy": proxy_url,
                });
                if !b.extra_headers.is_empty() {
                    doc["extra-headers"] = json!(b.extra_headers.replace('\n', "\r\n"));
                }
                if !b.sni.is_empty() {
                    doc["host-resolver-rules"] =
                        json!(format!("MAP {} {}", b.sni, final_address));
                }
                if b.insecure_concurrency > 0 {
                    doc["insecure-concurrency"] = json!(b.insecure_concurrency);
                }
                if self.opts.enable_log {
                    doc["log"] = json!("");
                }
                Ok(PluginPayload {
                    plugin_id: "naive-plugin".to_string(),
                    profile_id: id,
                    content: serde_json::to_string_pretty(&doc)?,
                })
            }

            ProxyBean::Hysteria(b) => {
                let mut doc = json!({
                    "server": format!("{}:{}", final_address, final_port),
                    "up_mbps": b.upload_mbps.max(10),
                    "down_mbps": b.download_mbps.max(50),
                    "socks5": {
                        "listen": format!("{}:{}", LOCALHOST, local_port),
                    },
                    "retry": 3,
                    "fast_open": true,
                    "insecure": b.allow_insecure,
                });
                if !b.protocol.is_empty() {
                    doc["protocol"] = json!(b.protocol);
                }
                if !b.auth_payload.is_empty() {
                    doc["auth_str"] = json!(b.auth_payload);
                }
                if !b.obfuscation.is_empty() {
                    doc["obfs"] = json!(b.obfuscation);
                }
                if !b.sni.is_empty() {
                    doc["server_name"] = json!(b.sni);
                }
                if !b.alpn.is_empty() {
                    doc["alpn"] = json!(b.alpn);
                }
                if !b.ca_text.is_empty() {
                    doc["ca"] = json!(b.ca_text);
                }
                if b.stream_receive_window > 0 {
                    doc["recv_window_conn"] = json!(b.stream_receive_window);
                }
                if b.connection_receive_window > 0 {
                    doc["recv_window"] = json!(b.connection_receive_window);
                }
                if b.disable_mtu_discovery {
                    doc["disable_mtu_discovery"] = json!(true);
                }
                Ok(PluginPayload {
                    plugin_id: "hysteria-plugin".to_string(),
                    profile_id: id,
                    content: serde_json::to_string_pretty(&doc)?,
                })
            }

            ProxyBean::External(b) => {
                if b.plugin_id.is_empty() {
                    return Err(Error::missing(id, "plugin_id"));
                }
                let content = b
                    .config_template
                    .replace("%local_port%", &local_port.to_string())
                    .replace("%server_address%", final_address)
                    .replace("%server_port%", &final_port.to_string());
                Ok(PluginPayload {
                    plugin_id: b.plugin_id.clone(),
                    profile_id: id,
                    content,
                })
            }

            _ => Err(Error::UnsupportedProtocol {
                id,
                kind: profile.kind().to_string(),
            }),
        }
    }
}
