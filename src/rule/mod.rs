//! User routing rules
//!
//! Rules are evaluated by the engine in declared order, first match wins.
//! The compiler never reorders them; it only translates each one into the
//! engine's rule schema (or drops it with an alert when the execution
//! context cannot honor it).

use crate::profile::ProfileId;
use serde::{Deserialize, Serialize};

/// Where a matched connection should go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleTarget {
    /// The root chain currently being compiled
    #[default]
    Proxy,
    /// Bypass the proxy, connect directly
    Direct,
    /// Drop the connection
    Block,
    /// A named auxiliary chain, compiled alongside the root chain
    Profile(ProfileId),
}

impl RuleTarget {
    pub fn aux_profile(&self) -> Option<ProfileId> {
        match self {
            RuleTarget::Profile(id) => Some(*id),
            _ => None,
        }
    }
}

/// One routing rule as stored by the rule store.
///
/// Match fields are all optional; empty means "don't constrain". App
/// identities arrive pre-resolved to kernel uids — package-name resolution
/// belongs to the surrounding application, not the compiler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Rule {
    pub id: i64,
    pub name: String,

    pub domains: Vec<String>,
    pub ips: Vec<String>,
    /// Port or port range expression, e.g. "443" or "1000-2000"
    pub port: String,
    pub source_port: String,
    /// "tcp", "udp" or empty
    pub network: String,
    pub source: Vec<String>,
    /// Sniffed protocols, e.g. "tls", "http", "bittorrent"
    pub protocols: Vec<String>,
    /// App uids this rule applies to (per-app routing)
    pub uids: Vec<u32>,

    /// Reverse proxy: listen on a bridge inbound, forward to `redirect`
    pub reverse: bool,
    /// Destination for reverse rules, "host:port"
    pub redirect: String,

    pub target: RuleTarget,
}

impl Rule {
    /// Human identity for alerts and errors.
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        format!("rule-{}", self.id)
    }

    /// True when the rule matches by app identity.
    pub fn is_per_app(&self) -> bool {
        !self.uids.is_empty()
    }

    /// Tag of the bridge inbound a reverse rule listens on.
    pub fn reverse_tag(&self) -> String {
        format!("reverse-{}", self.id)
    }

    /// Tag of the freedom outbound a reverse rule forwards to.
    pub fn reverse_out_tag(&self) -> String {
        format!("reverse-out-{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_yaml_forms() {
        let r: Rule = serde_yaml::from_str("{id: 1, target: direct}").unwrap();
        assert_eq!(r.target, RuleTarget::Direct);
        let r: Rule = serde_yaml::from_str("{id: 2, target: !profile 9}").unwrap();
        assert_eq!(r.target.aux_profile(), Some(9));
    }

    #[test]
    fn test_per_app_detection() {
        let mut r = Rule::default();
        assert!(!r.is_per_app());
        r.uids.push(10086);
        assert!(r.is_per_app());
    }
}
