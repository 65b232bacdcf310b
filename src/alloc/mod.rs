//! Runtime identifier allocation
//!
//! One [`Allocator`] lives for exactly one compile pass. It hands out local
//! ports that are never reused within the pass (even across independent
//! chains) and tag strings that are unique across the root chain and every
//! auxiliary chain compiled alongside it.

use crate::profile::ProfileId;
use crate::{Error, Result};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::TcpListener;

/// Well-known primary outbound tag: the exit hop of the root chain.
pub const TAG_PROXY: &str = "proxy";
pub const TAG_DIRECT: &str = "direct";
pub const TAG_BYPASS: &str = "bypass";
pub const TAG_BLOCK: &str = "block";

pub const TAG_SOCKS_IN: &str = "socks";
pub const TAG_HTTP_IN: &str = "http";
pub const TAG_TRANS_IN: &str = "trans";
pub const TAG_DNS_IN: &str = "dns-in";
pub const TAG_DNS_OUT: &str = "dns-out";

const PORT_RANGE: std::ops::Range<u16> = 20000..60000;
const MAX_PORT_ATTEMPTS: u32 = 64;

/// Outcome of a global (entry-hop) tag request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobalTag {
    /// First sighting of this profile as an entry hop; emit its descriptors.
    Fresh(String),
    /// Already instantiated by an earlier chain in this pass; reuse the tag
    /// and whatever port/mapping was allocated for it.
    Reused(String),
}

impl GlobalTag {
    pub fn tag(&self) -> &str {
        match self {
            GlobalTag::Fresh(t) | GlobalTag::Reused(t) => t,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, GlobalTag::Fresh(_))
    }
}

/// Port ledger + tag namespace, scoped to one compile call.
#[derive(Debug, Default)]
pub struct Allocator {
    claimed_ports: HashSet<u16>,
    used_tags: HashSet<String>,
    global_entries: HashMap<ProfileId, String>,
}

impl Allocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a free ephemeral TCP port.
    ///
    /// Samples the ephemeral range, skips ports already claimed in this
    /// pass, and confirms with a loopback bind probe before claiming.
    pub fn next_port(&mut self) -> Result<u16> {
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_PORT_ATTEMPTS {
            let candidate = rng.gen_range(PORT_RANGE);
            if self.claimed_ports.contains(&candidate) {
                continue;
            }
            if TcpListener::bind(("127.0.0.1", candidate)).is_ok() {
                self.claimed_ports.insert(candidate);
                return Ok(candidate);
            }
        }
        Err(Error::PortExhausted(MAX_PORT_ATTEMPTS))
    }

    /// Ports claimed so far (test hook).
    pub fn claimed_ports(&self) -> &HashSet<u16> {
        &self.claimed_ports
    }

    /// Tag for a chain's exit hop. The root chain gets the engine's
    /// conventional primary outbound name; auxiliary chains are namespaced
    /// by their root profile id.
    pub fn chain_tag(&mut self, aux_root: Option<ProfileId>) -> String {
        let tag = match aux_root {
            None => TAG_PROXY.to_string(),
            Some(id) => format!("{}-{}", TAG_PROXY, id),
        };
        self.claim_tag(tag, 0)
    }

    /// Tag for an entry hop, deduplicated by profile id across every chain
    /// in this pass: connecting to the same front proxy twice must not
    /// instantiate it twice.
    pub fn global_tag(&mut self, profile_id: ProfileId) -> GlobalTag {
        if let Some(existing) = self.global_entries.get(&profile_id) {
            return GlobalTag::Reused(existing.clone());
        }
        let tag = self.claim_tag(format!("{}-global-{}", TAG_PROXY, profile_id), 0);
        self.global_entries.insert(profile_id, tag.clone());
        GlobalTag::Fresh(tag)
    }

    /// Tag for a middle hop of a chain.
    pub fn hop_tag(&mut self, chain_tag: &str, profile_id: ProfileId, position: usize) -> String {
        self.claim_tag(format!("{}-{}", chain_tag, profile_id), position)
    }

    /// Tag for the dokodemo mapping inbound of a bridged hop.
    pub fn mapping_tag(&mut self, chain_tag: &str, profile_id: ProfileId) -> String {
        self.claim_tag(format!("{}-mapping-{}", chain_tag, profile_id), 0)
    }

    // Claims `preferred`, disambiguating with the hop position when the same
    // profile occurs twice in one chain.
    fn claim_tag(&mut self, preferred: String, position: usize) -> String {
        if self.used_tags.insert(preferred.clone()) {
            return preferred;
        }
        let mut n = position.max(1);
        loop {
            let candidate = format!("{}-{}", preferred, n);
            if self.used_tags.insert(candidate.clone()) {
                return candidate;
            }
            n += 1;
        }
    }
}
