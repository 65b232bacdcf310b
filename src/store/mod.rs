//! Profile and rule store read contract
//!
//! The compiler only ever reads: point lookups by id plus the ordered list
//! of enabled rules. Persistence lives in the surrounding application; the
//! in-memory implementation here backs the CLI and the tests.

use crate::profile::{Profile, ProfileId};
use crate::rule::Rule;
use crate::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Read contract the compiler depends on.
///
/// A `None` from [`get_by_id`](ProfileStore::get_by_id) means the profile
/// does not exist (tolerable inside a chain, fatal for a root or rule
/// target); an `Err` means the store itself is unavailable and the whole
/// compile aborts.
pub trait ProfileStore {
    fn get_by_id(&self, id: ProfileId) -> Result<Option<Profile>>;

    fn get_by_ids(&self, ids: &[ProfileId]) -> Result<Vec<Profile>> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            if let Some(p) = self.get_by_id(id)? {
                out.push(p);
            }
        }
        Ok(out)
    }

    /// Active rules in fixed priority order.
    fn enabled_rules(&self) -> Result<Vec<Rule>>;
}

/// In-memory store, loadable from a YAML document.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    profiles: HashMap<ProfileId, Profile>,
    rules: Vec<Rule>,
}

/// YAML file shape consumed by [`MemoryStore::load`].
#[derive(Debug, Deserialize)]
struct StoreFile {
    #[serde(default)]
    profiles: Vec<Profile>,
    #[serde(default)]
    rules: Vec<Rule>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load profiles and rules from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::store(e.to_string()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let file: StoreFile = serde_yaml::from_str(content)?;
        let mut store = MemoryStore::new();
        for profile in file.profiles {
            store.insert(profile);
        }
        store.rules = file.rules;
        Ok(store)
    }

    pub fn insert(&mut self, profile: Profile) -> ProfileId {
        let id = profile.id;
        self.profiles.insert(id, profile);
        id
    }

    pub fn push_rule(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

impl ProfileStore for MemoryStore {
    fn get_by_id(&self, id: ProfileId) -> Result<Option<Profile>> {
        Ok(self.profiles.get(&id).cloned())
    }

    fn enabled_rules(&self) -> Result<Vec<Rule>> {
        Ok(self.rules.clone())
    }
}
