//! Ad-hoc shares outside the tree.
//!
//! A temp share exposes a single file by content hash, optionally
//! restricted to one user. An empty key means the entry is public to
//! the hub that created it.

use std::collections::HashMap;

use skiff_types::{Cid, Tth};

/// One ad-hoc entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempShareInfo {
    /// Base32 CID of the allowed user; empty for hub-wide shares.
    pub key: String,
    pub path: String,
    pub size: i64,
}

/// The temp-share table, keyed by hash.
#[derive(Debug, Default)]
pub struct TempShares {
    entries: HashMap<Tth, Vec<TempShareInfo>>,
}

impl TempShares {
    /// Register an ad-hoc share. Returns false when the hub does not
    /// support uploads by hash (non-ADC), true otherwise, including
    /// when an identical entry already exists.
    pub fn add(&mut self, key: &str, tth: Tth, path: &str, size: i64, adc_hub: bool) -> bool {
        if !adc_hub {
            return false;
        }
        let entries = self.entries.entry(tth).or_default();
        if entries.iter().any(|e| e.key == key) {
            return true;
        }
        entries.push(TempShareInfo {
            key: key.to_string(),
            path: path.to_string(),
            size,
        });
        true
    }

    /// Remove the entry added under `key`.
    pub fn remove(&mut self, key: &str, tth: &Tth) {
        if let Some(entries) = self.entries.get_mut(tth) {
            if let Some(pos) = entries.iter().position(|e| e.key == key) {
                entries.remove(pos);
            }
            if entries.is_empty() {
                self.entries.remove(tth);
            }
        }
    }

    /// First entry visible to `user`: public, or keyed to them.
    pub fn find(&self, tth: &Tth, user: Option<&Cid>) -> Option<&TempShareInfo> {
        self.find_all(tth, user).into_iter().next()
    }

    /// Every entry visible to `user`.
    pub fn find_all(&self, tth: &Tth, user: Option<&Cid>) -> Vec<&TempShareInfo> {
        let user_key = user.map(|c| c.to_base32());
        self.entries
            .get(tth)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| {
                        e.key.is_empty() || user_key.as_deref().is_some_and(|k| e.key == k)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
