use std::collections::HashMap;

use k8s_openapi::api::core::v1::NodeCondition;

/// Node conditions keyed by type.
///
/// Holds exactly one condition per type and keeps the order types were
/// first seen, so it converts back to the list form the API expects.
#[derive(Debug, Clone, Default)]
pub struct ConditionSet {
    order: Vec<String>,
    by_type: HashMap<String, NodeCondition>,
}

impl ConditionSet {
    /// Build from an API list. A later entry for the same type replaces an
    /// earlier one.
    pub fn from_list(conditions: Vec<NodeCondition>) -> Self {
        let mut set = ConditionSet::default();
        for c in conditions {
            set.upsert(c);
        }
        set
    }

    pub fn upsert(&mut self, condition: NodeCondition) {
        if !self.by_type.contains_key(&condition.type_) {
            self.order.push(condition.type_.clone());
        }
        self.by_type.insert(condition.type_.clone(), condition);
    }

    pub fn get(&self, type_: &str) -> Option<&NodeCondition> {
        self.by_type.get(type_)
    }

    pub fn get_mut(&mut self, type_: &str) -> Option<&mut NodeCondition> {
        self.by_type.get_mut(type_)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NodeCondition> {
        self.by_type.values_mut()
    }

    pub fn to_list(&self) -> Vec<NodeCondition> {
        self.order
            .iter()
            .filter_map(|t| self.by_type.get(t).cloned())
            .collect()
    }
}
