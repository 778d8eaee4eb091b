//! Deployment State Engine.
//!
//! A [`DeploymentState`] is one host's fully rendered set of orchestrator
//! resources; [`DeploymentState::delta`] computes the minimal create/update/
//! delete set against the previous tick's state for the same host.

pub mod apply;
pub mod render;

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde_json::Value;

/// `(apiVersion, kind, name, namespace)`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ItemId {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
}

/// Priority class used to order items before apply.
fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Secret" => 0,
        "ConfigMap" => 1,
        "Deployment" => 2,
        _ => 3,
    }
}

fn item_order(a: &ItemId, b: &ItemId) -> Ordering {
    kind_priority(&a.kind).cmp(&kind_priority(&b.kind))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Update,
    Delete,
}

/// One host's rendered resource set.
#[derive(Clone, Debug, Default)]
pub struct DeploymentState {
    items: BTreeMap<ItemId, Value>,
    insertion_order: Vec<ItemId>,
}

impl DeploymentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a rendered document under its identity. A duplicate id within
    /// one state is logged as a warning; the later insertion wins.
    pub fn insert(&mut self, id: ItemId, body: Value) {
        if self.items.contains_key(&id) {
            tracing::warn!(?id, "duplicate item in rendered deployment state");
        } else {
            self.insertion_order.push(id.clone());
        }
        self.items.insert(id, body);
    }

    pub fn get(&self, id: &ItemId) -> Option<&Value> {
        self.items.get(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items ordered by kind priority, then insertion order within a class.
    pub fn ordered_items(&self) -> Vec<(&ItemId, &Value)> {
        let mut ordered: Vec<&ItemId> = self.insertion_order.iter().collect();
        ordered.sort_by(|a, b| item_order(a, b));
        ordered
            .into_iter()
            .map(|id| (id, self.items.get(id).expect("id came from insertion_order")))
            .collect()
    }

    /// Minimal delta transforming `self` (the previously applied state) into
    /// `next`.
    pub fn delta(&self, next: &DeploymentState) -> Delta {
        let mut delta = Delta::default();

        for (id, body) in &next.items {
            match self.items.get(id) {
                None => {
                    delta.items.push((id.clone(), body.clone()));
                }
                Some(previous_body) if previous_body != body => {
                    delta.items.push((id.clone(), body.clone()));
                    delta.actions.insert(id.clone(), Action::Update);
                }
                Some(_) => {}
            }
        }
        for id in self.items.keys() {
            if !next.items.contains_key(id) {
                delta.actions.insert(id.clone(), Action::Delete);
            }
        }

        delta.items.sort_by(|(a, _), (b, _)| item_order(a, b));
        delta
    }
}

/// The minimal create/update/delete set between two [`DeploymentState`]s.
#[derive(Clone, Debug, Default)]
pub struct Delta {
    items: Vec<(ItemId, Value)>,
    actions: BTreeMap<ItemId, Action>,
}

impl Delta {
    /// Items to create or update, ordered by kind priority.
    pub fn items(&self) -> &[(ItemId, Value)] {
        &self.items
    }

    pub fn action_of(&self, id: &ItemId) -> Option<Action> {
        self.actions.get(id).copied()
    }

    pub fn deletes(&self) -> impl Iterator<Item = &ItemId> {
        self.actions
            .iter()
            .filter(|(_, action)| **action == Action::Delete)
            .map(|(id, _)| id)
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty() && self.actions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn id(kind: &str, name: &str) -> ItemId {
        ItemId {
            api_version: "v1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: "openstack".to_string(),
        }
    }

    #[test]
    fn orders_secrets_before_configmaps_before_deployments_before_other() {
        let mut state = DeploymentState::new();
        state.insert(id("Deployment", "a"), Value::Null);
        state.insert(id("ConfigMap", "b"), Value::Null);
        state.insert(id("Secret", "c"), Value::Null);
        state.insert(id("Secret", "d"), Value::Null);

        let kinds: Vec<&str> = state
            .ordered_items()
            .into_iter()
            .map(|(id, _)| id.kind.as_str())
            .collect();
        assert_eq!(kinds, ["Secret", "Secret", "ConfigMap", "Deployment"]);
    }

    #[rstest]
    fn delta_computes_create_update_delete() {
        let mut previous = DeploymentState::new();
        previous.insert(id("ConfigMap", "keep"), serde_json::json!({"v": 1}));
        previous.insert(id("ConfigMap", "change"), serde_json::json!({"v": 1}));
        previous.insert(id("ConfigMap", "remove"), serde_json::json!({"v": 1}));

        let mut next = DeploymentState::new();
        next.insert(id("ConfigMap", "keep"), serde_json::json!({"v": 1}));
        next.insert(id("ConfigMap", "change"), serde_json::json!({"v": 2}));
        next.insert(id("ConfigMap", "add"), serde_json::json!({"v": 1}));

        let delta = previous.delta(&next);
        let created_or_updated: Vec<&str> = delta.items().iter().map(|(id, _)| id.name.as_str()).collect();
        assert!(created_or_updated.contains(&"change"));
        assert!(created_or_updated.contains(&"add"));
        assert!(!created_or_updated.contains(&"keep"));

        assert_eq!(delta.action_of(&id("ConfigMap", "change")), Some(Action::Update));
        assert_eq!(delta.action_of(&id("ConfigMap", "remove")), Some(Action::Delete));
        assert_eq!(delta.action_of(&id("ConfigMap", "keep")), None);
    }

    #[test]
    fn unchanged_inputs_produce_an_empty_delta() {
        let mut state = DeploymentState::new();
        state.insert(id("ConfigMap", "a"), serde_json::json!({"v": 1}));
        let delta = state.delta(&state.clone());
        assert!(delta.is_empty());
    }
}
