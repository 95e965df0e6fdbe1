// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Constraints: mutual-exclusion groups over nodes (e.g. "every node on
//! this card" or "every node sharing this physical port"), consulted by
//! the routing engine to avoid activating two members of the same group
//! at once.
//!
//! No single file maps onto this directly — the concept is folded into
//! card/port bookkeeping elsewhere. Built in the surrounding modules'
//! style: string-keyed tables the [`crate::node::NodeGraph`] owner
//! mutates, the same shape `Router`/`Multiplex` already use.

use std::collections::HashMap;

use tracing::debug;

use crate::node::NodeKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    /// Every node backed by the same sound card — e.g. a card that only
    /// has one hardware profile active at a time.
    Card,
    /// Every node sharing a physical port (built-in speaker vs. headphone
    /// jack that share one socket).
    Port,
}

pub struct ConstraintDef {
    pub name: String,
    pub kind: ConstraintKind,
    pub key: String,
    members: Vec<NodeKey>,
}

#[derive(Default)]
pub struct Constraints {
    defs: HashMap<String, ConstraintDef>,
    /// Reverse index: node -> constraint def name, for O(1) removal on
    /// node destroy without scanning every group.
    by_node: HashMap<NodeKey, Vec<String>>,
}

impl Constraints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, name: &str, kind: ConstraintKind, key: &str) -> bool {
        if self.defs.contains_key(name) {
            debug!("constraint '{name}' already exists");
            return false;
        }
        self.defs.insert(
            name.to_string(),
            ConstraintDef {
                name: name.to_string(),
                kind,
                key: key.to_string(),
                members: Vec::new(),
            },
        );
        true
    }

    pub fn destroy(&mut self, name: &str) {
        if let Some(def) = self.defs.remove(name) {
            for member in &def.members {
                if let Some(names) = self.by_node.get_mut(member) {
                    names.retain(|n| n != name);
                }
            }
        }
    }

    pub fn add_node(&mut self, name: &str, node: NodeKey) -> bool {
        let Some(def) = self.defs.get_mut(name) else {
            debug!("can't add node to unknown constraint '{name}'");
            return false;
        };
        if !def.members.contains(&node) {
            def.members.push(node.clone());
        }
        self.by_node.entry(node).or_default().push(name.to_string());
        true
    }

    pub fn remove_node(&mut self, node: &NodeKey) {
        if let Some(names) = self.by_node.remove(node) {
            for name in names {
                if let Some(def) = self.defs.get_mut(&name) {
                    def.members.retain(|m| m != node);
                }
            }
        }
    }

    /// Every other member of every group `node` belongs to, i.e. the set
    /// that must be deactivated before `node` is activated under a
    /// mutual-exclusion (as opposed to shared-resource) constraint.
    pub fn co_members(&self, node: &NodeKey) -> Vec<NodeKey> {
        let Some(names) = self.by_node.get(node) else { return Vec::new() };
        let mut out = Vec::new();
        for name in names {
            if let Some(def) = self.defs.get(name) {
                for m in &def.members {
                    if m != node && !out.contains(m) {
                        out.push(m.clone());
                    }
                }
            }
        }
        out
    }

    pub fn members(&self, name: &str) -> &[NodeKey] {
        self.defs.get(name).map(|d| d.members.as_slice()).unwrap_or(&[])
    }

    pub fn kind_of(&self, name: &str) -> Option<ConstraintKind> {
        self.defs.get(name).map(|d| d.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn co_members_excludes_self_and_respects_group_boundaries() {
        let mut c = Constraints::new();
        c.create("card.0", ConstraintKind::Card, "card.0");
        c.add_node("card.0", NodeKey("spk".into()));
        c.add_node("card.0", NodeKey("hp".into()));

        let co = c.co_members(&NodeKey("spk".into()));
        assert_eq!(co, vec![NodeKey("hp".into())]);
    }

    #[test]
    fn remove_node_clears_both_indices() {
        let mut c = Constraints::new();
        c.create("card.0", ConstraintKind::Card, "card.0");
        c.add_node("card.0", NodeKey("spk".into()));
        c.remove_node(&NodeKey("spk".into()));
        assert!(c.members("card.0").is_empty());
        assert!(c.co_members(&NodeKey("spk".into())).is_empty());
    }

    #[test]
    fn destroy_removes_group_and_reverse_links() {
        let mut c = Constraints::new();
        c.create("card.0", ConstraintKind::Card, "card.0");
        c.add_node("card.0", NodeKey("spk".into()));
        c.destroy("card.0");
        assert!(c.kind_of("card.0").is_none());
        assert!(c.co_members(&NodeKey("spk".into())).is_empty());
    }

    #[test]
    fn duplicate_create_is_refused() {
        let mut c = Constraints::new();
        assert!(c.create("card.0", ConstraintKind::Card, "card.0"));
        assert!(!c.create("card.0", ConstraintKind::Port, "card.0"));
    }
}
