//! Routing and DNS policy
//!
//! Translates user rules into the engine's rule list (order preserved,
//! first match wins) while accumulating the DNS side effects each rule
//! implies, then assembles the split-DNS block: bypassed traffic resolves
//! via direct servers, everything else via remote servers.

use crate::alloc::{TAG_BLOCK, TAG_BYPASS, TAG_DIRECT, TAG_DNS_IN, TAG_DNS_OUT};
use crate::common::{is_ip_address, split_host_port};
use crate::compiler::{Alert, AlertCode, CompileOptions, DnsFamilies, Ipv6Mode};
use crate::document::*;
use crate::profile::ProfileId;
use crate::rule::{Rule, RuleTarget};
use crate::{Error, Result};
use ipnet::{Ipv4Net, Ipv6Net};
use once_cell::sync::Lazy;
use std::collections::{BTreeSet, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::{debug, warn};
use url::Url;

/// Synthetic address pools handed to the engine's fake-DNS resolver.
static FAKEDNS_POOL4: Lazy<Ipv4Net> =
    Lazy::new(|| Ipv4Net::new(Ipv4Addr::new(198, 18, 0, 0), 15).expect("static pool"));
static FAKEDNS_POOL6: Lazy<Ipv6Net> =
    Lazy::new(|| Ipv6Net::new(Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 18).expect("static pool"));

const FAKEDNS_POOL_SIZE: u32 = 65535;

/// Inputs the policy builder needs from chain compilation.
pub struct PolicyContext<'a> {
    /// Exit tag of the root chain (the well-known primary outbound)
    pub root_tag: &'a str,
    /// Root profile id, so a rule targeting it maps to the root tag
    pub root_id: ProfileId,
    /// Exit tag per auxiliary chain root profile id
    pub aux_tags: &'a HashMap<ProfileId, String>,
    /// `full:` domain matchers for entry-hop server names that must resolve
    /// directly (the chain cannot bootstrap through itself)
    pub entry_lookup_domains: Vec<String>,
}

/// Everything the policy builder emits.
#[derive(Debug, Default)]
pub struct PolicyOutput {
    /// System-forced rules that go ahead of chain and user rules
    pub prepend_rules: Vec<RoutingRuleObject>,
    /// User rules (plus reverse forwards), declared order preserved
    pub user_rules: Vec<RoutingRuleObject>,
    /// Rules appended after everything else
    pub append_rules: Vec<RoutingRuleObject>,
    pub reverse: Option<ReverseObject>,
    pub reverse_outbounds: Vec<OutboundObject>,
    pub dns: DnsObject,
    pub alerts: Vec<Alert>,
    /// Whether any emitted rule matches by uid (the capture layer must then
    /// report uids with each connection)
    pub dump_uid: bool,
}

fn family_strategy(families: DnsFamilies) -> Option<String> {
    match families {
        DnsFamilies::Auto => None,
        DnsFamilies::Ipv4Only => Some("UseIPv4".to_string()),
        DnsFamilies::Ipv6Only => Some("UseIPv6".to_string()),
    }
}

/// Builds the user rule list and the DNS block for one compile pass.
pub struct RoutingAndDnsBuilder<'a> {
    opts: &'a CompileOptions,
}

impl<'a> RoutingAndDnsBuilder<'a> {
    pub fn new(opts: &'a CompileOptions) -> Self {
        RoutingAndDnsBuilder { opts }
    }

    pub fn build(&self, rules: &[Rule], ctx: &PolicyContext<'_>) -> Result<PolicyOutput> {
        let mut out = PolicyOutput::default();

        // DNS side effects accumulated while iterating the user rules
        let mut uids_remote: BTreeSet<u32> = BTreeSet::new();
        let mut uids_direct: BTreeSet<u32> = BTreeSet::new();
        let mut domains_remote: BTreeSet<String> = BTreeSet::new();
        let mut domains_direct: BTreeSet<String> = BTreeSet::new();

        for rule in rules {
            if rule.is_per_app() {
                out.dump_uid = true;
                if !self.opts.app_routable {
                    warn!(rule = rule.id, "per-app rule dropped: capture mode cannot route by app");
                    out.alerts.push(Alert {
                        code: AlertCode::AppRuleNotSupported,
                        message: rule.display_name(),
                    });
                    continue;
                }
            }

            let outbound_tag = match rule.target {
                RuleTarget::Proxy => ctx.root_tag.to_string(),
                RuleTarget::Direct => TAG_BYPASS.to_string(),
                RuleTarget::Block => TAG_BLOCK.to_string(),
                RuleTarget::Profile(id) if id == ctx.root_id => ctx.root_tag.to_string(),
                RuleTarget::Profile(id) => ctx
                    .aux_tags
                    .get(&id)
                    .cloned()
                    .ok_or(Error::UnresolvedRuleTarget { rule: rule.id, target: id })?,
            };

            // resolution must follow routing intent: bypassed traffic looks
            // up directly, proxied traffic looks up remotely
            match rule.target {
                RuleTarget::Direct => {
                    uids_direct.extend(rule.uids.iter().copied());
                    domains_direct.extend(rule.domains.iter().cloned());
                }
                RuleTarget::Proxy => {
                    uids_remote.extend(rule.uids.iter().copied());
                    domains_remote.extend(rule.domains.iter().cloned());
                }
                _ => {}
            }

            let mut emitted = RoutingRuleObject {
                rule_type: "field".to_string(),
                outbound_tag: Some(outbound_tag),
                domain: rule.domains.clone(),
                ip: rule.ips.clone(),
                port: Some(rule.port.clone()).filter(|p| !p.is_empty()),
                source_port: Some(rule.source_port.clone()).filter(|p| !p.is_empty()),
                network: Some(rule.network.clone()).filter(|n| !n.is_empty()),
                source: rule.source.clone(),
                protocol: rule.protocols.clone(),
                uid_list: rule.uids.clone(),
                ..Default::default()
            };
            if rule.reverse {
                emitted.inbound_tag = vec![rule.reverse_tag()];
            }
            out.user_rules.push(emitted);

            if rule.reverse {
                self.emit_reverse(rule, &mut out);
            }
        }

        out.dns = self.build_dns(
            ctx,
            &uids_remote,
            &uids_direct,
            &domains_remote,
            &domains_direct,
        );

        self.build_system_rules(ctx, &mut out);

        debug!(
            user_rules = out.user_rules.len(),
            prepended = out.prepend_rules.len(),
            alerts = out.alerts.len(),
            "policy built"
        );
        Ok(out)
    }

    /// Reverse rules pair a bridge with a freedom outbound that redirects to
    /// the fixed destination; appended, never reordered.
    fn emit_reverse(&self, rule: &Rule, out: &mut PolicyOutput) {
        out.reverse_outbounds.push(OutboundObject {
            tag: rule.reverse_out_tag(),
            protocol: "freedom".to_string(),
            settings: Some(OutboundSettings::Freedom(FreedomOutboundSettings {
                redirect: Some(rule.redirect.clone()),
            })),
            ..Default::default()
        });
        let bridges = &mut out.reverse.get_or_insert_with(ReverseObject::default).bridges;
        bridges.push(BridgeObject {
            tag: rule.reverse_tag(),
            domain: rule
                .domains
                .first()
                .map(|d| d.strip_prefix("full:").unwrap_or(d).to_string())
                .unwrap_or_default(),
        });
        out.user_rules.push(RoutingRuleObject::inbound_forward(
            rule.reverse_tag(),
            rule.reverse_out_tag(),
        ));
    }

    /// System-forced rules prepended ahead of chain and user rules: more
    /// specific system invariants must win in a first-match-wins list.
    fn build_system_rules(&self, ctx: &PolicyContext<'_>, out: &mut PolicyOutput) {
        if self.opts.for_test {
            return;
        }

        // final order: dns-in hijack, DNS server IPs, bypass LAN
        out.prepend_rules
            .push(RoutingRuleObject::inbound_forward(TAG_DNS_IN, TAG_DNS_OUT));

        for dns in self.direct_dns() {
            let (host, _) = split_host_port(&dns);
            if is_ip_address(host) {
                let mut rule = RoutingRuleObject::field(TAG_DIRECT);
                rule.ip = vec![host.to_string()];
                out.prepend_rules.push(rule);
            }
        }

        for dns in &self.opts.remote_dns {
            let (host, _) = split_host_port(dns);
            if is_ip_address(host) {
                let mut rule = RoutingRuleObject::field(ctx.root_tag);
                rule.ip = vec![host.to_string()];
                out.prepend_rules.push(rule);
            }
        }

        if self.opts.bypass_lan {
            let mut rule = RoutingRuleObject::field(TAG_BYPASS);
            rule.ip = vec!["geoip:private".to_string()];
            out.prepend_rules.push(rule);
        }

        if self.opts.allow_access {
            // listening on all interfaces leaks broadcast traffic into the
            // tunnel; drop it
            let mut rule = RoutingRuleObject::field(TAG_BLOCK);
            rule.ip = vec!["255.255.255.255".to_string()];
            out.append_rules.push(rule);
        }
    }

    fn direct_dns(&self) -> Vec<String> {
        if self.opts.direct_dns_use_system {
            vec!["localhost".to_string()]
        } else {
            self.opts.direct_dns.clone()
        }
    }

    fn build_dns(
        &self,
        ctx: &PolicyContext<'_>,
        uids_remote: &BTreeSet<u32>,
        uids_direct: &BTreeSet<u32>,
        domains_remote: &BTreeSet<String>,
        domains_direct: &BTreeSet<String>,
    ) -> DnsObject {
        let mut dns = DnsObject {
            hosts: self.opts.hosts.clone(),
            disable_fallback_if_match: true,
            ..Default::default()
        };

        match self.opts.ipv6_mode {
            Ipv6Mode::Disable => dns.query_strategy = Some("UseIPv4".to_string()),
            Ipv6Mode::Only => dns.query_strategy = Some("UseIPv6".to_string()),
            _ => {}
        }

        // remote servers first; the first one carries the remote allow-sets
        for (i, address) in self.opts.remote_dns.iter().enumerate() {
            let mut server = DnsServerObject {
                address: address.clone(),
                query_strategy: family_strategy(self.opts.remote_dns_families),
                ..Default::default()
            };
            if i == 0 && self.opts.enable_dns_routing {
                server.uid_list = uids_remote.iter().copied().collect();
                server.domains = domains_remote.iter().cloned().collect();
            }
            dns.servers.push(DnsServer::Object(server));
        }

        // domains that must never resolve through the chain: entry-hop
        // server names and the remote DNS servers' own hostnames
        let mut direct_lookup: BTreeSet<String> = ctx.entry_lookup_domains.iter().cloned().collect();
        for address in &self.opts.remote_dns {
            if let Some(host) = url_host(address) {
                if !is_ip_address(&host) {
                    direct_lookup.insert(format!("full:{}", host));
                }
            }
        }
        if self.opts.enable_dns_routing {
            direct_lookup.extend(domains_direct.iter().cloned());
        }

        for address in self.direct_dns() {
            dns.servers.push(DnsServer::Object(DnsServerObject {
                address,
                domains: direct_lookup.iter().cloned().collect(),
                skip_fallback: true,
                uid_list: uids_direct.iter().copied().collect(),
                query_strategy: family_strategy(self.opts.direct_dns_families),
                ..Default::default()
            }));
        }

        if self.opts.enable_fake_dns {
            dns.servers.insert(0, DnsServer::Plain("fakedns".to_string()));
            dns.fakedns.push(FakeDnsObject {
                ip_pool: FAKEDNS_POOL4.to_string(),
                pool_size: FAKEDNS_POOL_SIZE,
            });
            if self.opts.ipv6_mode != Ipv6Mode::Disable {
                dns.fakedns.push(FakeDnsObject {
                    ip_pool: FAKEDNS_POOL6.to_string(),
                    pool_size: FAKEDNS_POOL_SIZE,
                });
            }
        }

        dns
    }
}

/// Hostname of a DNS server address in either bare or URL form.
fn url_host(address: &str) -> Option<String> {
    if address.contains("://") {
        return Url::parse(address).ok()?.host_str().map(str::to_string);
    }
    let (host, _) = split_host_port(address);
    Some(host.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(aux: &'a HashMap<ProfileId, String>) -> PolicyContext<'a> {
        PolicyContext {
            root_tag: "proxy",
            root_id: 1,
            aux_tags: aux,
            entry_lookup_domains: vec!["full:front.example".to_string()],
        }
    }

    fn opts() -> CompileOptions {
        CompileOptions::default()
    }

    #[test]
    fn test_rule_order_preserved() {
        let aux = HashMap::new();
        let o = opts();
        let builder = RoutingAndDnsBuilder::new(&o);
        let rules = vec![
            Rule {
                id: 1,
                domains: vec!["geosite:cn".to_string()],
                target: RuleTarget::Direct,
                ..Default::default()
            },
            Rule {
                id: 2,
                domains: vec!["full:ads.example".to_string()],
                target: RuleTarget::Block,
                ..Default::default()
            },
            Rule {
                id: 3,
                ips: vec!["8.8.8.8".to_string()],
                target: RuleTarget::Proxy,
                ..Default::default()
            },
        ];
        let out = builder.build(&rules, &ctx(&aux)).unwrap();
        let tags: Vec<_> = out
            .user_rules
            .iter()
            .map(|r| r.outbound_tag.clone().unwrap())
            .collect();
        assert_eq!(tags, vec!["bypass", "block", "proxy"]);

        // determinism: building again yields the same order
        let again = builder.build(&rules, &ctx(&aux)).unwrap();
        let tags2: Vec<_> = again
            .user_rules
            .iter()
            .map(|r| r.outbound_tag.clone().unwrap())
            .collect();
        assert_eq!(tags, tags2);
    }

    #[test]
    fn test_dns_allow_sets_accumulate() {
        let aux = HashMap::new();
        let mut o = opts();
        o.enable_dns_routing = true;
        let builder = RoutingAndDnsBuilder::new(&o);
        let rules = vec![
            Rule {
                id: 1,
                domains: vec!["geosite:cn".to_string()],
                uids: vec![],
                target: RuleTarget::Direct,
                ..Default::default()
            },
            Rule {
                id: 2,
                domains: vec!["geosite:google".to_string()],
                target: RuleTarget::Proxy,
                ..Default::default()
            },
        ];
        let out = builder.build(&rules, &ctx(&aux)).unwrap();

        let DnsServer::Object(remote) = &out.dns.servers[0] else { panic!() };
        assert!(remote.domains.contains(&"geosite:google".to_string()));

        let DnsServer::Object(direct) = out.dns.servers.last().unwrap() else { panic!() };
        assert!(direct.domains.contains(&"geosite:cn".to_string()));
        assert!(direct.domains.contains(&"full:front.example".to_string()));
        assert!(direct.skip_fallback);
    }

    #[test]
    fn test_per_app_rule_dropped_with_alert() {
        let aux = HashMap::new();
        let mut o = opts();
        o.app_routable = false;
        let builder = RoutingAndDnsBuilder::new(&o);
        let rules = vec![Rule {
            id: 7,
            uids: vec![10234],
            target: RuleTarget::Proxy,
            ..Default::default()
        }];
        let out = builder.build(&rules, &ctx(&aux)).unwrap();
        assert!(out.user_rules.is_empty());
        assert_eq!(out.alerts.len(), 1);
        assert_eq!(out.alerts[0].code, AlertCode::AppRuleNotSupported);
        assert!(out.dump_uid);
    }

    #[test]
    fn test_unresolved_aux_target_fatal() {
        let aux = HashMap::new();
        let o = opts();
        let builder = RoutingAndDnsBuilder::new(&o);
        let rules = vec![Rule {
            id: 4,
            target: RuleTarget::Profile(55),
            ..Default::default()
        }];
        let err = builder.build(&rules, &ctx(&aux)).unwrap_err();
        assert!(matches!(err, Error::UnresolvedRuleTarget { rule: 4, target: 55 }));
    }

    #[test]
    fn test_reverse_rule_emits_bridge_pair() {
        let aux = HashMap::new();
        let o = opts();
        let builder = RoutingAndDnsBuilder::new(&o);
        let rules = vec![Rule {
            id: 9,
            domains: vec!["full:bridge.example".to_string()],
            reverse: true,
            redirect: "127.0.0.1:8080".to_string(),
            target: RuleTarget::Proxy,
            ..Default::default()
        }];
        let out = builder.build(&rules, &ctx(&aux)).unwrap();
        let reverse = out.reverse.unwrap();
        assert_eq!(reverse.bridges[0].tag, "reverse-9");
        assert_eq!(reverse.bridges[0].domain, "bridge.example");
        assert_eq!(out.reverse_outbounds[0].tag, "reverse-out-9");
        // the forward rule follows the user rule, never reordered
        assert_eq!(out.user_rules.len(), 2);
        assert_eq!(out.user_rules[1].inbound_tag, vec!["reverse-9".to_string()]);
        assert_eq!(out.user_rules[1].outbound_tag.as_deref(), Some("reverse-out-9"));
    }

    #[test]
    fn test_fake_dns_pools_follow_ipv6_mode() {
        let aux = HashMap::new();
        let mut o = opts();
        o.enable_fake_dns = true;
        o.ipv6_mode = Ipv6Mode::Disable;
        let builder = RoutingAndDnsBuilder::new(&o);
        let out = builder.build(&[], &ctx(&aux)).unwrap();
        assert_eq!(out.dns.fakedns.len(), 1);
        assert_eq!(out.dns.fakedns[0].ip_pool, "198.18.0.0/15");
        assert!(matches!(&out.dns.servers[0], DnsServer::Plain(s) if s == "fakedns"));

        o.ipv6_mode = Ipv6Mode::Enable;
        let builder = RoutingAndDnsBuilder::new(&o);
        let out = builder.build(&[], &ctx(&aux)).unwrap();
        assert_eq!(out.dns.fakedns.len(), 2);
    }

    #[test]
    fn test_system_rules_prepend_order() {
        let aux = HashMap::new();
        let mut o = opts();
        o.bypass_lan = true;
        o.remote_dns = vec!["1.1.1.1".to_string()];
        o.direct_dns = vec!["223.5.5.5".to_string()];
        let builder = RoutingAndDnsBuilder::new(&o);
        let out = builder.build(&[], &ctx(&aux)).unwrap();
        // dns hijack first, then server IPs, then bypass LAN
        assert_eq!(out.prepend_rules[0].inbound_tag, vec!["dns-in".to_string()]);
        assert_eq!(out.prepend_rules[1].ip, vec!["223.5.5.5".to_string()]);
        assert_eq!(out.prepend_rules[2].ip, vec!["1.1.1.1".to_string()]);
        assert_eq!(out.prepend_rules[3].ip, vec!["geoip:private".to_string()]);
    }

    #[test]
    fn test_remote_dns_hostname_resolves_directly() {
        let aux = HashMap::new();
        let mut o = opts();
        o.remote_dns = vec!["https://dns.google/dns-query".to_string()];
        let builder = RoutingAndDnsBuilder::new(&o);
        let out = builder.build(&[], &ctx(&aux)).unwrap();
        let DnsServer::Object(direct) = out.dns.servers.last().unwrap() else { panic!() };
        assert!(direct.domains.contains(&"full:dns.google".to_string()));
    }
}
