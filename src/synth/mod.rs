//! Hop synthesis
//!
//! Converts one concrete profile into the engine's outbound descriptor:
//! protocol settings, transport/TLS stream settings, and (for the one
//! elected hop per chain) the mux block. Only natively supported kinds come
//! through here; bridged kinds go to [`crate::bridge`].

use crate::compiler::CompileOptions;
use crate::document::*;
use crate::profile::{PacketEncoding, Profile, ProxyBean, SshAuth, VmessBean};
use crate::{Error, Result};

/// Intervals the engine already applies by default; emitting a sockopt for
/// them would be redundant.
const DEFAULT_KEEPALIVE: [u32; 2] = [0, 15];

fn split_lines(s: &str) -> Vec<String> {
    s.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

fn split_commas(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Builds native outbound descriptors.
pub struct HopSynthesizer<'a> {
    opts: &'a CompileOptions,
}

impl<'a> HopSynthesizer<'a> {
    pub fn new(opts: &'a CompileOptions) -> Self {
        HopSynthesizer { opts }
    }

    fn keepalive_sockopt(&self) -> Option<SockoptObject> {
        let interval = self.opts.tcp_keep_alive_interval;
        if DEFAULT_KEEPALIVE.contains(&interval) {
            return None;
        }
        Some(SockoptObject {
            tcp_keep_alive_interval: Some(interval),
            tproxy: None,
        })
    }

    fn stream_with_keepalive(&self) -> Option<StreamSettingsObject> {
        self.keepalive_sockopt().map(|sockopt| StreamSettingsObject {
            sockopt: Some(sockopt),
            ..Default::default()
        })
    }

    /// Build the outbound descriptor for a natively supported profile.
    ///
    /// The caller assigns tag and domain strategy afterwards; a missing
    /// mandatory field or a kind the engine cannot speak aborts the compile.
    pub fn synthesize(&self, profile: &Profile) -> Result<OutboundObject> {
        let id = profile.id;
        let mut outbound = OutboundObject::default();

        match &profile.bean {
            ProxyBean::Socks(b) => {
                outbound.protocol = "socks".to_string();
                let users = match (&b.username, &b.password) {
                    (Some(user), _) if !user.is_empty() => vec![SocksUser {
                        user: user.clone(),
                        pass: b.password.clone().unwrap_or_default(),
                    }],
                    _ => vec![],
                };
                outbound.settings = Some(OutboundSettings::Socks(SocksOutboundSettings {
                    servers: vec![SocksServerObject {
                        address: b.server_address.clone(),
                        port: b.server_port,
                        users,
                    }],
                    version: Some(b.version_name().to_string()),
                }));
                outbound.stream_settings = self.stream_with_keepalive();
            }

            ProxyBean::Http(b) => {
                outbound.protocol = "http".to_string();
                let users = match (&b.username, &b.password) {
                    (Some(user), _) if !user.is_empty() => vec![SocksUser {
                        user: user.clone(),
                        pass: b.password.clone().unwrap_or_default(),
                    }],
                    _ => vec![],
                };
                outbound.settings = Some(OutboundSettings::Http(HttpOutboundSettings {
                    servers: vec![SocksServerObject {
                        address: b.server_address.clone(),
                        port: b.server_port,
                        users,
                    }],
                }));
                if b.tls {
                    outbound.stream_settings = Some(StreamSettingsObject {
                        network: Some("tcp".to_string()),
                        security: Some("tls".to_string()),
                        tls_settings: Some(TlsObject {
                            server_name: b.sni.clone().filter(|s| !s.is_empty()),
                            ..Default::default()
                        }),
                        sockopt: self.keepalive_sockopt(),
                        ..Default::default()
                    });
                } else {
                    outbound.stream_settings = self.stream_with_keepalive();
                }
            }

            ProxyBean::Shadowsocks(b) => {
                if b.method.is_empty() {
                    return Err(Error::missing(id, "method"));
                }
                if b.password.is_empty() {
                    return Err(Error::missing(id, "password"));
                }
                outbound.protocol = "shadowsocks".to_string();
                let mut settings = ShadowsocksOutboundSettings {
                    servers: vec![ShadowsocksServerObject {
                        address: b.server_address.clone(),
                        port: b.server_port,
                        method: b.method.clone(),
                        password: b.password.clone(),
                    }],
                    ..Default::default()
                };
                if let Some(plugin) = b.plugin.as_ref().filter(|p| !p.is_empty()) {
                    let (name, opts) = plugin.split_once(';').unwrap_or((plugin.as_str(), ""));
                    settings.plugin = Some(name.to_string());
                    if !opts.is_empty() {
                        settings.plugin_opts = Some(opts.to_string());
                    }
                }
                outbound.settings = Some(OutboundSettings::Shadowsocks(settings));
                outbound.stream_settings = self.stream_with_keepalive();
            }

            ProxyBean::ShadowsocksR(b) => {
                if b.method.is_empty() {
                    return Err(Error::missing(id, "method"));
                }
                outbound.protocol = "shadowsocks".to_string();
                outbound.settings = Some(OutboundSettings::Shadowsocks(ShadowsocksOutboundSettings {
                    servers: vec![ShadowsocksServerObject {
                        address: b.server_address.clone(),
                        port: b.server_port,
                        method: b.method.clone(),
                        password: b.password.clone(),
                    }],
                    plugin: Some("shadowsocksr".to_string()),
                    plugin_opts: None,
                    plugin_args: vec![
                        format!("--obfs={}", b.obfs),
                        format!("--obfs-param={}", b.obfs_param),
                        format!("--protocol={}", b.protocol),
                        format!("--protocol-param={}", b.protocol_param),
                    ],
                }));
                outbound.stream_settings = self.stream_with_keepalive();
            }

            ProxyBean::Vmess(b) => {
                if b.uuid.is_empty() {
                    return Err(Error::missing(id, "uuid"));
                }
                outbound.protocol = "vmess".to_string();

                let mut experimental = String::new();
                if b.experimental_authenticated_length {
                    experimental.push_str("AuthenticatedLength");
                }
                if b.experimental_no_termination_signal {
                    experimental.push_str("NoTerminationSignal");
                }

                outbound.settings = Some(OutboundSettings::Vmess(VmessOutboundSettings {
                    vnext: vec![VmessServerObject {
                        address: b.server_address.clone(),
                        port: b.server_port,
                        users: vec![VmessUserObject {
                            id: normalize_uuid(&b.uuid),
                            alter_id: b.alter_id,
                            security: if b.encryption.is_empty() {
                                "auto".to_string()
                            } else {
                                b.encryption.clone()
                            },
                            experimental: Some(experimental).filter(|e| !e.is_empty()),
                        }],
                        packet_encoding: match b.packet_encoding {
                            PacketEncoding::None => None,
                            PacketEncoding::Packet => Some("packet".to_string()),
                            PacketEncoding::Xudp => Some("xudp".to_string()),
                        },
                    }],
                }));
                outbound.stream_settings = Some(self.v2ray_stream_settings(b));
            }

            ProxyBean::Trojan(b) => {
                if b.password.is_empty() {
                    return Err(Error::missing(id, "password"));
                }
                outbound.protocol = "trojan".to_string();
                outbound.settings = Some(OutboundSettings::Trojan(TrojanOutboundSettings {
                    servers: vec![TrojanServerObject {
                        address: b.server_address.clone(),
                        port: b.server_port,
                        password: b.password.clone(),
                    }],
                }));
                outbound.stream_settings = Some(StreamSettingsObject {
                    network: Some("tcp".to_string()),
                    security: Some("tls".to_string()),
                    tls_settings: Some(TlsObject {
                        server_name: Some(b.sni.clone()).filter(|s| !s.is_empty()),
                        alpn: split_lines(&b.alpn),
                        allow_insecure: b.allow_insecure,
                        ..Default::default()
                    }),
                    sockopt: self.keepalive_sockopt(),
                    ..Default::default()
                });
            }

            ProxyBean::Ssh(b) => {
                if b.username.is_empty() {
                    return Err(Error::missing(id, "username"));
                }
                outbound.protocol = "ssh".to_string();
                let mut settings = SshOutboundSettings {
                    address: b.server_address.clone(),
                    port: b.server_port,
                    user: b.username.clone(),
                    public_key: b.public_key.clone(),
                    ..Default::default()
                };
                match &b.auth {
                    SshAuth::None => {}
                    SshAuth::Password { password } => settings.password = Some(password.clone()),
                    SshAuth::PrivateKey { private_key, passphrase } => {
                        settings.private_key = Some(private_key.clone());
                        if !passphrase.is_empty() {
                            settings.password = Some(passphrase.clone());
                        }
                    }
                }
                outbound.settings = Some(OutboundSettings::Ssh(settings));
                outbound.stream_settings = self.stream_with_keepalive();
            }

            ProxyBean::Wireguard(b) => {
                if b.private_key.is_empty() {
                    return Err(Error::missing(id, "private_key"));
                }
                if b.peer_public_key.is_empty() {
                    return Err(Error::missing(id, "peer_public_key"));
                }
                outbound.protocol = "wireguard".to_string();
                outbound.settings = Some(OutboundSettings::WireGuard(WireGuardOutboundSettings {
                    address: b.server_address.clone(),
                    port: b.server_port,
                    network: "udp".to_string(),
                    local_addresses: split_lines(&b.local_address),
                    private_key: b.private_key.clone(),
                    peer_public_key: b.peer_public_key.clone(),
                    pre_shared_key: b.peer_pre_shared_key.clone(),
                    mtu: Some(b.mtu).filter(|m| *m != 0),
                }));
                outbound.stream_settings = self.stream_with_keepalive();
            }

            // Bridged kinds must not reach the synthesizer.
            ProxyBean::TrojanGo(_)
            | ProxyBean::Naive(_)
            | ProxyBean::Hysteria(_)
            | ProxyBean::External(_)
            | ProxyBean::Chain(_) => {
                return Err(Error::UnsupportedProtocol {
                    id,
                    kind: profile.kind().to_string(),
                });
            }
        }

        Ok(outbound)
    }

    /// Attach the mux block to an already-synthesized outbound.
    pub fn apply_mux(&self, outbound: &mut OutboundObject, bean: &ProxyBean) {
        let packet_encoding = match bean {
            ProxyBean::Vmess(b) => match b.packet_encoding {
                PacketEncoding::None => None,
                PacketEncoding::Packet => Some("packet".to_string()),
                PacketEncoding::Xudp => Some("xudp".to_string()),
            },
            _ => None,
        };
        outbound.mux = Some(MuxObject {
            enabled: true,
            concurrency: self.opts.mux_concurrency,
            packet_encoding,
        });
    }

    fn v2ray_stream_settings(&self, b: &VmessBean) -> StreamSettingsObject {
        let mut stream = StreamSettingsObject {
            network: Some(b.network.clone()),
            sockopt: self.keepalive_sockopt(),
            ..Default::default()
        };

        if !b.security.is_empty() {
            stream.security = Some(b.security.clone());
        }
        if stream.security.as_deref() == Some("tls") {
            let mut tls = TlsObject {
                server_name: Some(b.sni.clone()).filter(|s| !s.is_empty()),
                alpn: split_lines(&b.alpn),
                allow_insecure: b.allow_insecure,
                ..Default::default()
            };
            let certs = split_lines(&b.certificates);
            if !certs.is_empty() {
                tls.disable_system_root = true;
                tls.certificates = vec![CertificateObject {
                    usage: "verify".to_string(),
                    certificate: certs,
                }];
            }
            tls.pinned_peer_certificate_chain_sha256 =
                split_lines(&b.pinned_peer_certificate_chain_sha256);
            stream.tls_settings = Some(tls);
        }

        match b.network.as_str() {
            "tcp" => {
                if b.header_type == "http" {
                    let mut request = HttpRequestObject::default();
                    if !b.host.is_empty() {
                        request.headers.insert("Host".to_string(), split_commas(&b.host));
                    }
                    if !b.path.is_empty() {
                        request.path = split_commas(&b.path);
                    }
                    let request = Some(request)
                        .filter(|r| !r.headers.is_empty() || !r.path.is_empty());
                    stream.tcp_settings = Some(TcpObject {
                        header: Some(TcpHeaderObject {
                            header_type: "http".to_string(),
                            request,
                        }),
                    });
                }
            }
            "kcp" => {
                stream.kcp_settings = Some(KcpObject {
                    mtu: 1350,
                    tti: 50,
                    uplink_capacity: 12,
                    downlink_capacity: 100,
                    congestion: false,
                    read_buffer_size: 1,
                    write_buffer_size: 1,
                    header: KcpHeaderObject {
                        header_type: if b.header_type.is_empty() {
                            "none".to_string()
                        } else {
                            b.header_type.clone()
                        },
                    },
                    seed: Some(b.kcp_seed.clone()).filter(|s| !s.is_empty()),
                });
            }
            "ws" => {
                let mut ws = WebSocketObject {
                    path: if b.path.is_empty() { "/".to_string() } else { b.path.clone() },
                    ..Default::default()
                };
                if !b.host.is_empty() {
                    ws.headers.insert("Host".to_string(), b.host.clone());
                }
                if b.ws_max_early_data > 0 {
                    ws.max_early_data = Some(b.ws_max_early_data);
                }
                if !b.early_data_header_name.is_empty() {
                    ws.early_data_header_name = Some(b.early_data_header_name.clone());
                }
                stream.ws_settings = Some(ws);
            }
            "http" => {
                stream.http_settings = Some(HttpTransportObject {
                    host: split_commas(&b.host),
                    path: if b.path.is_empty() { "/".to_string() } else { b.path.clone() },
                });
            }
            "quic" => {
                stream.quic_settings = Some(QuicObject {
                    security: if b.quic_security.is_empty() {
                        "none".to_string()
                    } else {
                        b.quic_security.clone()
                    },
                    key: b.quic_key.clone(),
                    header: KcpHeaderObject {
                        header_type: if b.header_type.is_empty() {
                            "none".to_string()
                        } else {
                            b.header_type.clone()
                        },
                    },
                });
            }
            "grpc" => {
                stream.grpc_settings = Some(GrpcObject {
                    service_name: b.grpc_service_name.clone(),
                });
            }
            _ => {}
        }

        stream
    }
}

/// Accept uuids with or without dashes; anything else is mapped through
/// uuid v5 so arbitrary user strings still produce a valid id, matching the
/// upstream client's tolerant behavior.
fn normalize_uuid(raw: &str) -> String {
    if let Ok(parsed) = uuid::Uuid::parse_str(raw) {
        return parsed.to_string();
    }
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, raw.as_bytes()).to_string()
}
