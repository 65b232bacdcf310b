//! Profile-to-configuration compilation
//!
//! One [`compile`] call turns a root profile, the enabled rule set and the
//! effective options into a complete engine configuration document plus the
//! side tables the service layer needs: which local port belongs to which
//! plugin process, the plugin payloads themselves, and user-facing alerts
//! for rules that had to be dropped.

use crate::alloc::{
    Allocator, GlobalTag, TAG_BLOCK, TAG_BYPASS, TAG_DIRECT, TAG_DNS_IN, TAG_DNS_OUT,
    TAG_HTTP_IN, TAG_SOCKS_IN, TAG_TRANS_IN,
};
use crate::bridge::{ExternalProcessBridge, PluginPayload};
use crate::chain::{ChainResolver, ResolvedChain};
use crate::common::{is_ip_address, split_host_port, LOCALHOST};
use crate::document::*;
use crate::policy::{PolicyContext, PolicyOutput, RoutingAndDnsBuilder};
use crate::profile::{PacketEncoding, Profile, ProfileId, ProxyBean};
use crate::store::ProfileStore;
use crate::synth::HopSynthesizer;
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};
use url::Url;

/// IPv6 handling for resolution and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Ipv6Mode {
    #[default]
    Disable,
    Enable,
    Prefer,
    Only,
}

/// Address families a DNS server list may answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DnsFamilies {
    #[default]
    Auto,
    Ipv4Only,
    Ipv6Only,
}

/// How the transparent-proxy inbound captures traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransproxyMode {
    #[default]
    Redirect,
    Tproxy,
}

/// Everything outside the profile database that influences a compile.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Connectivity-test mode: no inbounds, no rules, no DNS hijack
    pub for_test: bool,
    /// Listen on all interfaces instead of loopback only
    pub allow_access: bool,

    pub socks_port: u16,
    pub require_http: bool,
    pub http_port: u16,
    pub require_transproxy: bool,
    pub transproxy_port: u16,
    pub transproxy_mode: TransproxyMode,
    pub local_dns_port: u16,

    pub remote_dns: Vec<String>,
    pub direct_dns: Vec<String>,
    pub direct_dns_use_system: bool,
    pub remote_dns_families: DnsFamilies,
    pub direct_dns_families: DnsFamilies,
    pub enable_dns_routing: bool,
    pub enable_fake_dns: bool,
    pub hosts: BTreeMap<String, String>,

    pub ipv6_mode: Ipv6Mode,
    /// Resolve destination domains inside the engine before dialing
    pub resolve_destination: bool,
    /// Strategy for the routing matcher itself, not for outbound dialing
    pub routing_domain_strategy: String,
    pub bypass_lan: bool,

    pub traffic_sniffing: bool,
    /// Rewrite the destination to the sniffed domain instead of only using
    /// it for routing
    pub destination_override: bool,

    pub enable_log: bool,
    pub traffic_statistics: bool,
    pub tcp_keep_alive_interval: u32,

    pub enable_mux: bool,
    pub mux_concurrency: u16,
    /// Lowercase protocol names mux may be applied to
    pub mux_protocols: HashSet<String>,

    /// Whether the capture layer can attribute connections to apps; when
    /// false, per-app rules are dropped with an alert
    pub app_routable: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            for_test: false,
            allow_access: false,
            socks_port: 2080,
            require_http: false,
            http_port: 2081,
            require_transproxy: false,
            transproxy_port: 2082,
            transproxy_mode: TransproxyMode::default(),
            local_dns_port: 6450,
            remote_dns: vec!["https://1.1.1.1/dns-query".to_string()],
            direct_dns: vec!["223.5.5.5".to_string()],
            direct_dns_use_system: false,
            remote_dns_families: DnsFamilies::default(),
            direct_dns_families: DnsFamilies::default(),
            enable_dns_routing: true,
            enable_fake_dns: false,
            hosts: BTreeMap::new(),
            ipv6_mode: Ipv6Mode::default(),
            resolve_destination: false,
            routing_domain_strategy: "AsIs".to_string(),
            bypass_lan: false,
            traffic_sniffing: true,
            destination_override: false,
            enable_log: false,
            traffic_statistics: false,
            tcp_keep_alive_interval: 15,
            enable_mux: false,
            mux_concurrency: 8,
            mux_protocols: ["vmess".to_string()].into_iter().collect(),
            app_routable: true,
        }
    }
}

impl CompileOptions {
    /// Connectivity tests always run dual-stack regardless of the setting.
    fn effective_ipv6(&self) -> Ipv6Mode {
        if self.for_test {
            Ipv6Mode::Enable
        } else {
            self.ipv6_mode
        }
    }

    fn bind_address(&self) -> &'static str {
        if self.allow_access {
            "0.0.0.0"
        } else {
            LOCALHOST
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertCode {
    /// A per-app rule was dropped because the capture layer cannot route
    /// by app
    AppRuleNotSupported,
}

/// Non-fatal degradation surfaced to the user after a compile.
#[derive(Debug, Clone)]
pub struct Alert {
    pub code: AlertCode,
    pub message: String,
}

/// Output of one compile pass.
#[derive(Debug)]
pub struct CompileResult {
    pub document: V2rayConfig,
    /// Serialized document, ready to hand to the engine loader
    pub config_json: String,
    /// Per-chain map from allocated local port to the bridged profile
    /// listening behind it, in chain build order (root first)
    pub chain_index: Vec<BTreeMap<u16, Profile>>,
    pub plugin_payloads: Vec<PluginPayload>,
    /// Exit tag of every compiled chain, root first
    pub outbound_tags: Vec<String>,
    /// Exit tag of the root chain only
    pub outbound_tags_current: Vec<String>,
    /// Every hop tag mapped to its profile
    pub outbound_tags_all: HashMap<String, Profile>,
    pub bypass_tag: String,
    /// Whether any emitted rule matches by uid
    pub dump_uid: bool,
    pub alerts: Vec<Alert>,
}

/// Compile the given root profile against the store and options.
pub fn compile<S: ProfileStore + ?Sized>(
    store: &S,
    root_id: ProfileId,
    opts: &CompileOptions,
) -> Result<CompileResult> {
    let root = store
        .get_by_id(root_id)?
        .ok_or(Error::ProfileNotFound(root_id))?;

    let rules = if opts.for_test {
        vec![]
    } else {
        store.enabled_rules()?
    };

    let mut pass = CompilePass::new(opts);

    let resolver = ChainResolver::new(store);
    let root_chain = resolver.resolve(&root)?;
    let root_tag = pass.build_chain(&root_chain, None)?;

    // auxiliary chains: one per distinct profile a rule routes to
    let mut aux_tags: HashMap<ProfileId, String> = HashMap::new();
    for rule in &rules {
        let Some(aux_id) = rule.target.aux_profile() else {
            continue;
        };
        if aux_id == root_id || aux_tags.contains_key(&aux_id) {
            continue;
        }
        let aux_root = store.get_by_id(aux_id)?.ok_or(Error::UnresolvedRuleTarget {
            rule: rule.id,
            target: aux_id,
        })?;
        let aux_chain = resolver.resolve(&aux_root)?;
        let tag = pass.build_chain(&aux_chain, Some(aux_id))?;
        aux_tags.insert(aux_id, tag);
    }

    let ctx = PolicyContext {
        root_tag: &root_tag,
        root_id,
        aux_tags: &aux_tags,
        entry_lookup_domains: pass.entry_lookup_domains.clone(),
    };
    let policy = RoutingAndDnsBuilder::new(opts).build(&rules, &ctx)?;

    let result = pass.assemble(&root_tag, policy)?;
    info!(
        profile = %root.display_name(),
        outbounds = result.document.outbounds.len(),
        rules = result.document.routing.rules.len(),
        payloads = result.plugin_payloads.len(),
        "configuration compiled"
    );
    Ok(result)
}

/// Mutable state threaded through one compile call.
struct CompilePass<'a> {
    opts: &'a CompileOptions,
    alloc: Allocator,
    synth: HopSynthesizer<'a>,
    bridge: ExternalProcessBridge<'a>,

    outbounds: Vec<OutboundObject>,
    inbounds: Vec<InboundObject>,
    /// Chain-internal rules (mapping bypasses and bridged-hop forwards),
    /// emitted between the system prepends and the user rules
    chain_rules: Vec<RoutingRuleObject>,

    chain_index: Vec<BTreeMap<u16, Profile>>,
    payloads: Vec<PluginPayload>,
    outbound_tags: Vec<String>,
    outbound_tags_all: HashMap<String, Profile>,
    entry_lookup_domains: Vec<String>,
}

/// What the next hop links back to: the previous (exit-ward) hop is either
/// a native outbound that takes proxySettings, or a bridged hop whose
/// mapping inbound gets a forwarding rule.
enum PrevHop {
    None,
    Native(usize),
    Bridged(String),
}

impl<'a> CompilePass<'a> {
    fn new(opts: &'a CompileOptions) -> Self {
        CompilePass {
            opts,
            alloc: Allocator::new(),
            synth: HopSynthesizer::new(opts),
            bridge: ExternalProcessBridge::new(opts),
            outbounds: Vec::new(),
            inbounds: Vec::new(),
            chain_rules: Vec::new(),
            chain_index: Vec::new(),
            payloads: Vec::new(),
            outbound_tags: Vec::new(),
            outbound_tags_all: HashMap::new(),
            entry_lookup_domains: Vec::new(),
        }
    }

    /// Emit one resolved chain into the document; returns its exit tag.
    fn build_chain(
        &mut self,
        chain: &ResolvedChain,
        aux_root: Option<ProfileId>,
    ) -> Result<String> {
        let chain_tag = self.alloc.chain_tag(aux_root);
        let strategy = self.chain_domain_strategy(chain);
        let mux_index = self.elect_mux_hop(chain);

        let mut chain_map: BTreeMap<u16, Profile> = BTreeMap::new();
        let mut prev = PrevHop::None;

        for hop in &chain.hops {
            let profile = &hop.profile;

            let tag = if hop.is_exit() {
                chain_tag.clone()
            } else if hop.is_entry() {
                match self.alloc.global_tag(profile.id) {
                    GlobalTag::Fresh(t) => t,
                    GlobalTag::Reused(t) => {
                        // already instantiated by an earlier chain; just
                        // link our previous hop to it
                        self.link_previous(&prev, &t);
                        prev = PrevHop::None;
                        continue;
                    }
                }
            } else {
                self.alloc.hop_tag(&chain_tag, profile.id, hop.index)
            };

            if hop.is_entry() {
                if let Some((addr, _)) = profile.bean.server_endpoint() {
                    if !addr.is_empty() && !is_ip_address(addr) {
                        self.entry_lookup_domains.push(format!("full:{}", addr));
                    }
                }
            }

            let next_prev;
            let mut outbound;
            if profile.bean.is_native() {
                outbound = self.synth.synthesize(profile)?;
                if mux_index == Some(hop.index) {
                    self.synth.apply_mux(&mut outbound, &profile.bean);
                }
                outbound.domain_strategy = Some(strategy.clone());
                next_prev = PrevHop::Native(self.outbounds.len());
            } else {
                let bridged = self.bridge.bridge(profile, &chain_tag, &mut self.alloc)?;
                chain_map.insert(bridged.local_port, profile.clone());
                self.payloads.push(bridged.payload);
                outbound = bridged.outbound;
                next_prev = match bridged.mapping {
                    Some(inbound) => {
                        if hop.is_entry() {
                            // the plugin's own upstream must leave directly,
                            // not re-enter chain routing
                            self.chain_rules.push(RoutingRuleObject::inbound_forward(
                                inbound.tag.clone(),
                                TAG_DIRECT,
                            ));
                        }
                        let mapping_tag = inbound.tag.clone();
                        self.inbounds.push(inbound);
                        PrevHop::Bridged(mapping_tag)
                    }
                    None => PrevHop::None,
                };
            }
            outbound.tag = tag.clone();

            self.link_previous(&prev, &tag);
            prev = next_prev;

            self.outbound_tags_all.insert(tag.clone(), profile.clone());
            self.outbounds.push(outbound);

            debug!(chain = %chain_tag, hop = hop.index, tag = %tag, "hop emitted");
        }

        self.chain_index.push(chain_map);
        self.outbound_tags.push(chain_tag.clone());
        Ok(chain_tag)
    }

    /// Route the previous (exit-ward) hop's traffic through `tag`.
    fn link_previous(&mut self, prev: &PrevHop, tag: &str) {
        match prev {
            PrevHop::None => {}
            PrevHop::Native(index) => {
                self.outbounds[*index].proxy_settings = Some(ProxySettingsObject {
                    tag: tag.to_string(),
                    transport_layer: true,
                });
            }
            PrevHop::Bridged(mapping_tag) => {
                self.chain_rules.push(RoutingRuleObject::inbound_forward(
                    mapping_tag.clone(),
                    tag.to_string(),
                ));
            }
        }
    }

    /// Outbound dialing strategy shared by every hop of one chain.
    fn chain_domain_strategy(&self, chain: &ResolvedChain) -> String {
        let base = if !self.opts.resolve_destination {
            "AsIs"
        } else {
            match self.opts.effective_ipv6() {
                Ipv6Mode::Disable => "UseIPv4",
                Ipv6Mode::Enable => "PreferIPv4",
                Ipv6Mode::Prefer => "PreferIPv6",
                Ipv6Mode::Only => "UseIPv6",
            }
        };
        // packet-addressed UDP cannot carry unresolved domains
        if base == "AsIs" && chain.hops.iter().any(|h| is_packet_vmess(&h.profile.bean)) {
            return "UseIP".to_string();
        }
        base.to_string()
    }

    /// At most one hop per chain gets mux, scanning from the entry side.
    fn elect_mux_hop(&self, chain: &ResolvedChain) -> Option<usize> {
        if !self.opts.enable_mux {
            return None;
        }
        chain
            .hops
            .iter()
            .rev()
            .find(|h| {
                h.profile.bean.supports_mux()
                    && self.opts.mux_protocols.contains(h.profile.bean.protocol_name())
            })
            .map(|h| h.index)
    }

    fn sniffing(&self) -> Option<SniffingObject> {
        let fake = self.opts.enable_fake_dns;
        let sniff = self.opts.traffic_sniffing;
        if !fake && !sniff {
            return None;
        }
        let dest_override = if fake && !sniff {
            vec!["fakedns".to_string()]
        } else if fake {
            ["fakedns", "http", "tls"].map(String::from).to_vec()
        } else {
            ["http", "tls"].map(String::from).to_vec()
        };
        Some(SniffingObject {
            enabled: true,
            dest_override,
            // fakedns-only capture never needs packet content
            metadata_only: fake && !sniff,
            route_only: !self.opts.destination_override,
        })
    }

    fn build_inbounds(&mut self) {
        if self.opts.for_test {
            return;
        }
        let bind = self.opts.bind_address().to_string();

        self.inbounds.insert(
            0,
            InboundObject {
                tag: TAG_SOCKS_IN.to_string(),
                listen: Some(bind.clone()),
                port: self.opts.socks_port,
                protocol: "socks".to_string(),
                settings: Some(InboundSettings::Socks(SocksInboundSettings {
                    auth: "noauth".to_string(),
                    udp: true,
                })),
                sniffing: self.sniffing(),
                stream_settings: None,
            },
        );

        if self.opts.require_http {
            self.inbounds.push(InboundObject {
                tag: TAG_HTTP_IN.to_string(),
                listen: Some(bind.clone()),
                port: self.opts.http_port,
                protocol: "http".to_string(),
                settings: Some(InboundSettings::Http(HttpInboundSettings {
                    allow_transparent: true,
                })),
                sniffing: self.sniffing(),
                stream_settings: None,
            });
        }

        if self.opts.require_transproxy {
            let stream_settings = match self.opts.transproxy_mode {
                TransproxyMode::Tproxy => Some(StreamSettingsObject {
                    sockopt: Some(SockoptObject {
                        tcp_keep_alive_interval: None,
                        tproxy: Some("tproxy".to_string()),
                    }),
                    ..Default::default()
                }),
                TransproxyMode::Redirect => None,
            };
            self.inbounds.push(InboundObject {
                tag: TAG_TRANS_IN.to_string(),
                listen: Some(bind.clone()),
                port: self.opts.transproxy_port,
                protocol: "dokodemo-door".to_string(),
                settings: Some(InboundSettings::Dokodemo(DokodemoInboundSettings {
                    address: None,
                    port: None,
                    network: "tcp,udp".to_string(),
                    follow_redirect: true,
                })),
                sniffing: self.sniffing(),
                stream_settings,
            });
        }

        // hijack inbound for the capture layer's DNS requests
        self.inbounds.push(InboundObject {
            tag: TAG_DNS_IN.to_string(),
            listen: Some(bind),
            port: self.opts.local_dns_port,
            protocol: "dokodemo-door".to_string(),
            settings: Some(InboundSettings::Dokodemo(DokodemoInboundSettings {
                address: Some("1.0.0.1".to_string()),
                port: Some(53),
                network: "tcp,udp".to_string(),
                follow_redirect: false,
            })),
            sniffing: None,
            stream_settings: None,
        });
    }

    /// dns-out: the internal resolver outbound that the dns-in hijack rule
    /// forwards to. Its dial target mirrors the first remote upstream.
    fn dns_outbound(&self) -> OutboundObject {
        let first = self.opts.remote_dns.first().map(String::as_str).unwrap_or("");
        let mut settings = DnsOutboundSettings {
            user_level: 1,
            ..Default::default()
        };
        if first.contains("://") {
            settings.network = Some("tcp".to_string());
            let host = Url::parse(first)
                .ok()
                .and_then(|u| u.host_str().map(str::to_string));
            settings.address = match host {
                Some(h) if is_ip_address(&h) => Some(h),
                // non-IP upstream: park the fallback on a stable anycast
                // resolver so plain queries still complete
                _ => Some("1.0.0.1".to_string()),
            };
            settings.port = Some(53);
        } else if !first.is_empty() {
            let (host, port) = split_host_port(first);
            settings.address = if is_ip_address(host) {
                Some(host.to_string())
            } else {
                Some("1.0.0.1".to_string())
            };
            settings.port = Some(port.unwrap_or(53));
        }
        OutboundObject {
            tag: TAG_DNS_OUT.to_string(),
            protocol: "dns".to_string(),
            settings: Some(OutboundSettings::Dns(settings)),
            ..Default::default()
        }
    }

    fn assemble(mut self, root_tag: &str, policy: PolicyOutput) -> Result<CompileResult> {
        self.build_inbounds();

        // terminal outbounds after every chain hop
        self.outbounds.push(OutboundObject {
            tag: TAG_DIRECT.to_string(),
            protocol: "freedom".to_string(),
            ..Default::default()
        });
        self.outbounds.push(OutboundObject {
            tag: TAG_BYPASS.to_string(),
            protocol: "freedom".to_string(),
            ..Default::default()
        });
        self.outbounds.push(OutboundObject {
            tag: TAG_BLOCK.to_string(),
            protocol: "blackhole".to_string(),
            ..Default::default()
        });
        if !self.opts.for_test {
            let dns_out = self.dns_outbound();
            self.outbounds.push(dns_out);
        }
        self.outbounds.extend(policy.reverse_outbounds);

        let mut rules = policy.prepend_rules;
        rules.extend(self.chain_rules);
        rules.extend(policy.user_rules);
        rules.extend(policy.append_rules);

        let mut document = V2rayConfig {
            log: Some(LogObject {
                loglevel: if self.opts.enable_log { "debug" } else { "error" }.to_string(),
            }),
            dns: Some(policy.dns),
            // level 1 is the dns-out outbound's userLevel
            policy: Some(PolicyObject {
                levels: [(
                    "1".to_string(),
                    LevelPolicyObject {
                        conn_idle: Some(30),
                    },
                )]
                .into_iter()
                .collect(),
                system: None,
            }),
            inbounds: self.inbounds,
            outbounds: self.outbounds,
            routing: RoutingObject {
                domain_strategy: self.opts.routing_domain_strategy.clone(),
                rules,
            },
            reverse: policy.reverse,
            stats: None,
        };

        if self.opts.traffic_statistics {
            document.stats = Some(BTreeMap::new());
            if let Some(p) = document.policy.as_mut() {
                p.system = Some(SystemPolicyObject {
                    stats_outbound_uplink: true,
                    stats_outbound_downlink: true,
                });
            }
        }

        let config_json = serde_json::to_string_pretty(&document)?;

        Ok(CompileResult {
            document,
            config_json,
            chain_index: self.chain_index,
            plugin_payloads: self.payloads,
            outbound_tags: self.outbound_tags,
            outbound_tags_current: vec![root_tag.to_string()],
            outbound_tags_all: self.outbound_tags_all,
            bypass_tag: TAG_BYPASS.to_string(),
            dump_uid: policy.dump_uid,
            alerts: policy.alerts,
        })
    }
}

fn is_packet_vmess(bean: &ProxyBean) -> bool {
    matches!(bean, ProxyBean::Vmess(b) if b.packet_encoding == PacketEncoding::Packet)
}
