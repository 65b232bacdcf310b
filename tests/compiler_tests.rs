//! End-to-end compilation tests
//!
//! Each test compiles a small profile store into a full configuration
//! document and checks the emitted structure: chain wiring, tag and port
//! assignment, plugin bridging, rule ordering and the DNS block.

use chainforge::compiler::{compile, AlertCode, CompileOptions};
use chainforge::document::{DnsServer, OutboundObject, V2rayConfig};
use chainforge::profile::{
    ChainBean, HysteriaBean, Profile, ProfileId, ProxyBean, SocksBean, TrojanBean, VmessBean,
};
use chainforge::rule::{Rule, RuleTarget};
use chainforge::store::MemoryStore;

fn vmess(id: ProfileId) -> Profile {
    Profile {
        id,
        name: format!("vmess-{}", id),
        bean: ProxyBean::Vmess(VmessBean {
            server_address: format!("v{}.example", id),
            server_port: 443,
            uuid: "b831381d-6324-4d53-ad4f-8cda48b30811".to_string(),
            network: "ws".to_string(),
            ..Default::default()
        }),
    }
}

fn socks(id: ProfileId) -> Profile {
    Profile {
        id,
        name: format!("socks-{}", id),
        bean: ProxyBean::Socks(SocksBean {
            server_address: format!("10.0.0.{}", id),
            server_port: 1080,
            ..Default::default()
        }),
    }
}

fn hysteria(id: ProfileId) -> Profile {
    Profile {
        id,
        name: format!("hy-{}", id),
        bean: ProxyBean::Hysteria(HysteriaBean {
            server_address: format!("hy{}.example", id),
            server_port: 4443,
            auth_payload: "secret".to_string(),
            ..Default::default()
        }),
    }
}

fn chain(id: ProfileId, members: Vec<ProfileId>) -> Profile {
    Profile {
        id,
        name: format!("chain-{}", id),
        bean: ProxyBean::Chain(ChainBean { proxies: members }),
    }
}

fn outbound<'a>(doc: &'a V2rayConfig, tag: &str) -> &'a OutboundObject {
    doc.outbounds
        .iter()
        .find(|o| o.tag == tag)
        .unwrap_or_else(|| panic!("no outbound tagged {}", tag))
}

#[test]
fn test_simple_profile_produces_primary_outbound() {
    let mut store = MemoryStore::new();
    let id = store.insert(vmess(1));
    let result = compile(&store, id, &CompileOptions::default()).unwrap();

    let proxy = outbound(&result.document, "proxy");
    assert_eq!(proxy.protocol, "vmess");
    assert!(proxy.proxy_settings.is_none());

    assert_eq!(result.outbound_tags, vec!["proxy".to_string()]);
    assert_eq!(result.chain_index.len(), 1);
    assert!(result.chain_index[0].is_empty());
    assert!(result.plugin_payloads.is_empty());
    assert!(result.alerts.is_empty());
}

#[test]
fn test_bridged_entry_hop_chain_wiring() {
    // declared entry-first: traffic enters at the hysteria hop, exits at
    // the vmess hop
    let mut store = MemoryStore::new();
    store.insert(hysteria(2));
    store.insert(vmess(3));
    let root = store.insert(chain(10, vec![2, 3]));

    let result = compile(&store, root, &CompileOptions::default()).unwrap();
    let doc = &result.document;

    // exit hop keeps the primary tag and dials through the bridged entry
    let exit = outbound(doc, "proxy");
    assert_eq!(exit.protocol, "vmess");
    let link = exit.proxy_settings.as_ref().unwrap();
    assert_eq!(link.tag, "proxy-global-2");
    assert!(link.transport_layer);

    // the bridged entry is a loopback socks stand-in
    let entry = outbound(doc, "proxy-global-2");
    assert_eq!(entry.protocol, "socks");

    // its mapping inbound redirects the plugin's upstream, and gets a
    // direct rule so the plugin traffic never re-enters chain routing
    let mapping = doc
        .inbounds
        .iter()
        .find(|i| i.tag == "proxy-mapping-2")
        .unwrap();
    assert_eq!(mapping.protocol, "dokodemo-door");
    assert!(doc.routing.rules.iter().any(|r| {
        r.inbound_tag == vec!["proxy-mapping-2".to_string()]
            && r.outbound_tag.as_deref() == Some("direct")
    }));

    assert_eq!(result.plugin_payloads.len(), 1);
    assert_eq!(result.plugin_payloads[0].plugin_id, "hysteria-plugin");
    assert_eq!(result.chain_index[0].len(), 1);
    let (&port, bridged) = result.chain_index[0].iter().next().unwrap();
    assert!((20000..60000).contains(&port));
    assert_eq!(bridged.id, 2);
}

#[test]
fn test_bridged_middle_hop_links_by_inbound_rule() {
    // entry-first [socks, hysteria, vmess]: the bridged hop sits in the
    // middle, so its mapping inbound forwards to the entry hop's tag
    let mut store = MemoryStore::new();
    store.insert(socks(1));
    store.insert(hysteria(2));
    store.insert(vmess(3));
    let root = store.insert(chain(10, vec![1, 2, 3]));

    let result = compile(&store, root, &CompileOptions::default()).unwrap();
    let doc = &result.document;

    // exit (vmess) -> bridged hysteria via proxySettings
    let exit = outbound(doc, "proxy");
    assert_eq!(exit.proxy_settings.as_ref().unwrap().tag, "proxy-2");

    // bridged hysteria -> entry socks via inbound-tag rule
    assert!(doc.routing.rules.iter().any(|r| {
        r.inbound_tag == vec!["proxy-mapping-2".to_string()]
            && r.outbound_tag.as_deref() == Some("proxy-global-1")
    }));
}

#[test]
fn test_dangling_chain_member_dropped() {
    let mut store = MemoryStore::new();
    store.insert(vmess(1));
    let root = store.insert(chain(10, vec![1, 999]));

    let result = compile(&store, root, &CompileOptions::default()).unwrap();
    let proxy = outbound(&result.document, "proxy");
    assert_eq!(proxy.protocol, "vmess");
    assert!(proxy.proxy_settings.is_none());
}

#[test]
fn test_empty_chain_is_fatal() {
    let mut store = MemoryStore::new();
    let root = store.insert(chain(10, vec![998, 999]));
    assert!(compile(&store, root, &CompileOptions::default()).is_err());
}

#[test]
fn test_aux_chain_from_rule_target() {
    let mut store = MemoryStore::new();
    let root = store.insert(vmess(1));
    let aux = store.insert(vmess(2));
    store.push_rule(Rule {
        id: 1,
        domains: vec!["geosite:netflix".to_string()],
        target: RuleTarget::Profile(aux),
        ..Default::default()
    });

    let result = compile(&store, root, &CompileOptions::default()).unwrap();

    assert_eq!(
        result.outbound_tags,
        vec!["proxy".to_string(), format!("proxy-{}", aux)]
    );
    assert_eq!(result.outbound_tags_current, vec!["proxy".to_string()]);
    let rule = result
        .document
        .routing
        .rules
        .iter()
        .find(|r| r.domain == vec!["geosite:netflix".to_string()])
        .unwrap();
    assert_eq!(rule.outbound_tag.as_deref(), Some(format!("proxy-{}", aux).as_str()));
    // one chain index entry per chain, root first
    assert_eq!(result.chain_index.len(), 2);
}

#[test]
fn test_rule_targeting_unknown_profile_fatal() {
    let mut store = MemoryStore::new();
    let root = store.insert(vmess(1));
    store.push_rule(Rule {
        id: 1,
        domains: vec!["geosite:x".to_string()],
        target: RuleTarget::Profile(777),
        ..Default::default()
    });
    assert!(compile(&store, root, &CompileOptions::default()).is_err());
}

#[test]
fn test_shared_entry_hop_collapses_across_chains() {
    let mut store = MemoryStore::new();
    store.insert(socks(5)); // shared front proxy
    store.insert(vmess(1));
    store.insert(vmess(2));
    let root = store.insert(chain(10, vec![5, 1]));
    let aux = store.insert(chain(11, vec![5, 2]));
    store.push_rule(Rule {
        id: 1,
        domains: vec!["geosite:x".to_string()],
        target: RuleTarget::Profile(aux),
        ..Default::default()
    });

    let result = compile(&store, root, &CompileOptions::default()).unwrap();
    let doc = &result.document;

    let shared: Vec<_> = doc
        .outbounds
        .iter()
        .filter(|o| o.tag == "proxy-global-5")
        .collect();
    assert_eq!(shared.len(), 1, "shared entry must be instantiated once");

    // both exits dial through the shared entry
    assert_eq!(
        outbound(doc, "proxy").proxy_settings.as_ref().unwrap().tag,
        "proxy-global-5"
    );
    assert_eq!(
        outbound(doc, &format!("proxy-{}", aux))
            .proxy_settings
            .as_ref()
            .unwrap()
            .tag,
        "proxy-global-5"
    );
}

#[test]
fn test_all_tags_unique() {
    let mut store = MemoryStore::new();
    store.insert(socks(1));
    store.insert(hysteria(2));
    store.insert(vmess(3));
    store.insert(vmess(4));
    let root = store.insert(chain(10, vec![1, 2, 3]));
    let aux = store.insert(chain(11, vec![1, 4]));
    store.push_rule(Rule {
        id: 1,
        domains: vec!["geosite:x".to_string()],
        target: RuleTarget::Profile(aux),
        ..Default::default()
    });

    let result = compile(&store, root, &CompileOptions::default()).unwrap();
    let mut seen = std::collections::HashSet::new();
    for ob in &result.document.outbounds {
        assert!(seen.insert(ob.tag.clone()), "duplicate tag {}", ob.tag);
    }
    let mut inbound_seen = std::collections::HashSet::new();
    for ib in &result.document.inbounds {
        assert!(inbound_seen.insert(ib.tag.clone()), "duplicate inbound {}", ib.tag);
    }
}

#[test]
fn test_ports_unique_across_chains() {
    let mut store = MemoryStore::new();
    store.insert(hysteria(1));
    store.insert(hysteria(2));
    store.insert(vmess(3));
    let root = store.insert(chain(10, vec![1, 3]));
    let aux = store.insert(chain(11, vec![2, 3]));
    store.push_rule(Rule {
        id: 1,
        domains: vec!["geosite:x".to_string()],
        target: RuleTarget::Profile(aux),
        ..Default::default()
    });

    let result = compile(&store, root, &CompileOptions::default()).unwrap();
    let mut ports = std::collections::HashSet::new();
    for entry in &result.chain_index {
        for &port in entry.keys() {
            assert!(ports.insert(port), "port {} reused across chains", port);
        }
    }
}

#[test]
fn test_mux_applied_to_single_entry_side_hop() {
    let mut store = MemoryStore::new();
    store.insert(vmess(1));
    store.insert(Profile {
        id: 2,
        name: "t".to_string(),
        bean: ProxyBean::Trojan(TrojanBean {
            server_address: "t.example".to_string(),
            server_port: 443,
            password: "pw".to_string(),
            ..Default::default()
        }),
    });
    let root = store.insert(chain(10, vec![1, 2]));

    let mut opts = CompileOptions::default();
    opts.enable_mux = true;
    opts.mux_protocols = ["vmess".to_string(), "trojan".to_string()]
        .into_iter()
        .collect();
    let result = compile(&store, root, &opts).unwrap();
    let doc = &result.document;

    // vmess(1) is the entry hop; it and only it carries the mux block
    let muxed: Vec<_> = doc.outbounds.iter().filter(|o| o.mux.is_some()).collect();
    assert_eq!(muxed.len(), 1);
    assert_eq!(muxed[0].tag, "proxy-global-1");
    assert!(muxed[0].mux.as_ref().unwrap().enabled);
}

#[test]
fn test_per_app_rule_dropped_with_alert_in_capture_mode() {
    let mut store = MemoryStore::new();
    let root = store.insert(vmess(1));
    store.push_rule(Rule {
        id: 1,
        name: "game traffic".to_string(),
        uids: vec![10234],
        target: RuleTarget::Direct,
        ..Default::default()
    });

    let mut opts = CompileOptions::default();
    opts.app_routable = false;
    let result = compile(&store, root, &opts).unwrap();

    assert_eq!(result.alerts.len(), 1);
    assert_eq!(result.alerts[0].code, AlertCode::AppRuleNotSupported);
    assert!(result
        .document
        .routing
        .rules
        .iter()
        .all(|r| r.uid_list.is_empty()));
    assert!(result.dump_uid);
}

#[test]
fn test_rule_order_stable_across_compiles() {
    let mut store = MemoryStore::new();
    let root = store.insert(vmess(1));
    for (i, domain) in ["geosite:cn", "geosite:google", "geosite:category-ads"]
        .iter()
        .enumerate()
    {
        store.push_rule(Rule {
            id: i as i64 + 1,
            domains: vec![domain.to_string()],
            target: if i == 0 { RuleTarget::Direct } else { RuleTarget::Proxy },
            ..Default::default()
        });
    }

    let opts = CompileOptions::default();
    let a = compile(&store, root, &opts).unwrap();
    let b = compile(&store, root, &opts).unwrap();
    let order = |r: &chainforge::compiler::CompileResult| -> Vec<(Vec<String>, Option<String>)> {
        r.document
            .routing
            .rules
            .iter()
            .map(|x| (x.domain.clone(), x.outbound_tag.clone()))
            .collect()
    };
    assert_eq!(order(&a), order(&b));
}

#[test]
fn test_entry_server_domain_resolves_directly() {
    let mut store = MemoryStore::new();
    let root = store.insert(vmess(1));
    let result = compile(&store, root, &CompileOptions::default()).unwrap();

    let dns = result.document.dns.as_ref().unwrap();
    let direct = dns
        .servers
        .iter()
        .filter_map(|s| match s {
            DnsServer::Object(o) if o.skip_fallback => Some(o),
            _ => None,
        })
        .next()
        .unwrap();
    assert!(direct.domains.contains(&"full:v1.example".to_string()));
}

#[test]
fn test_serialized_document_uses_engine_field_names() {
    let mut store = MemoryStore::new();
    store.insert(hysteria(2));
    store.insert(vmess(3));
    let root = store.insert(chain(10, vec![2, 3]));

    let mut opts = CompileOptions::default();
    opts.resolve_destination = true;
    let result = compile(&store, root, &opts).unwrap();
    let v: serde_json::Value = serde_json::from_str(&result.config_json).unwrap();

    let proxy = v["outbounds"]
        .as_array()
        .unwrap()
        .iter()
        .find(|o| o["tag"] == "proxy")
        .unwrap();
    assert!(proxy.get("streamSettings").is_some());
    assert_eq!(proxy["proxySettings"]["transportLayer"], true);
    assert_eq!(proxy["domainStrategy"], "UseIPv4");

    let rules = v["routing"]["rules"].as_array().unwrap();
    assert!(rules
        .iter()
        .any(|r| r.get("inboundTag").map(|t| t[0] == "dns-in").unwrap_or(false)));
}

#[test]
fn test_for_test_mode_is_minimal() {
    let mut store = MemoryStore::new();
    let root = store.insert(vmess(1));
    store.push_rule(Rule {
        id: 1,
        domains: vec!["geosite:cn".to_string()],
        target: RuleTarget::Direct,
        ..Default::default()
    });

    let mut opts = CompileOptions::default();
    opts.for_test = true;
    let result = compile(&store, root, &opts).unwrap();

    assert!(result.document.inbounds.is_empty());
    // user rules are not emitted in test mode
    assert!(result
        .document
        .routing
        .rules
        .iter()
        .all(|r| r.domain.is_empty()));
}
