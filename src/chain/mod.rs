//! Chain resolution
//!
//! Expands a profile reference into a linear, ordered hop list. Chains are
//! declared entry-first in the UI; the resolved list is exit-first, so
//! position 0 is the hop that dials the destination and position N-1 is the
//! hop that first receives captured traffic.

use crate::profile::{Profile, ProfileId, ProxyBean};
use crate::store::ProfileStore;
use crate::{Error, Result};
use std::collections::HashSet;
use tracing::warn;

/// One concrete (non-chain) hop in a resolved chain.
#[derive(Debug, Clone)]
pub struct ResolvedHop {
    pub profile: Profile,
    /// 0 = exit side, len-1 = entry side
    pub index: usize,
    /// Total hops in the owning chain
    pub len: usize,
}

impl ResolvedHop {
    pub fn is_exit(&self) -> bool {
        self.index == 0
    }

    pub fn is_entry(&self) -> bool {
        self.index + 1 == self.len
    }
}

/// A fully resolved chain for one root profile reference.
#[derive(Debug, Clone)]
pub struct ResolvedChain {
    pub root_id: ProfileId,
    pub hops: Vec<ResolvedHop>,
}

impl ResolvedChain {
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }
}

/// Expands chain profiles against a store.
pub struct ChainResolver<'a, S: ProfileStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: ProfileStore + ?Sized> ChainResolver<'a, S> {
    pub fn new(store: &'a S) -> Self {
        ChainResolver { store }
    }

    /// Resolve a root profile into an exit-first hop list.
    ///
    /// Dangling member references are dropped with a warning; a chain whose
    /// full expansion is empty, or one that loops back into an ancestor
    /// chain, is fatal.
    pub fn resolve(&self, root: &Profile) -> Result<ResolvedChain> {
        let mut visiting = HashSet::new();
        let mut flat = self.flatten(root, &mut visiting)?;
        // declared order is entry-first; runtime order is exit-first
        flat.reverse();

        if flat.is_empty() {
            return Err(Error::EmptyChain(root.id));
        }

        let len = flat.len();
        let hops = flat
            .into_iter()
            .enumerate()
            .map(|(index, profile)| ResolvedHop { profile, index, len })
            .collect();

        Ok(ResolvedChain { root_id: root.id, hops })
    }

    fn flatten(&self, profile: &Profile, visiting: &mut HashSet<ProfileId>) -> Result<Vec<Profile>> {
        let members = match &profile.bean {
            ProxyBean::Chain(chain) => &chain.proxies,
            _ => return Ok(vec![profile.clone()]),
        };

        if !visiting.insert(profile.id) {
            return Err(Error::ChainCycle(profile.id));
        }

        let mut out = Vec::with_capacity(members.len());
        for &member_id in members {
            match self.store.get_by_id(member_id)? {
                Some(member) => out.extend(self.flatten(&member, visiting)?),
                None => {
                    warn!(chain = profile.id, member = member_id, "dropping dangling chain member");
                }
            }
        }

        visiting.remove(&profile.id);
        Ok(out)
    }
}
