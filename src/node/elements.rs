//! Elements and models reported by composition data, with their
//! application-key bindings and subscriptions.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{Missing, NodeError};
use crate::types::{ModelId, UnicastAddress};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeshModel {
    pub id: ModelId,
    /// Index into the node's application keys; at most one per model.
    pub bound_app_key: Option<u16>,
    pub subscriptions: BTreeSet<u16>,
}

impl MeshModel {
    pub fn new(id: ModelId) -> Self {
        Self {
            id,
            bound_app_key: None,
            subscriptions: BTreeSet::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Element {
    pub address: UnicastAddress,
    /// GATT namespace location descriptor
    pub location: u16,
    pub models: BTreeMap<ModelId, MeshModel>,
}

impl Element {
    pub fn new(address: UnicastAddress, location: u16, models: impl IntoIterator<Item = ModelId>) -> Self {
        Self {
            address,
            location,
            models: models.into_iter().map(|id| (id, MeshModel::new(id))).collect(),
        }
    }

    pub fn model(&self, id: ModelId) -> Option<&MeshModel> {
        self.models.get(&id)
    }
}

/// Elements keyed by unicast address.
///
/// Storage is unordered; callers always get ascending-address order from
/// [`ElementRegistry::ordered_elements`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ElementRegistry {
    elements: HashMap<u16, Element>,
}

impl ElementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `elements` by address. Existing entries are overwritten, none removed.
    pub fn apply_composition_data(&mut self, elements: impl IntoIterator<Item = Element>) {
        for element in elements {
            let address = element.address.value();
            if self.elements.insert(address, element).is_some() {
                tracing::debug!("Element {:#06x} replaced by new composition data", address);
            }
        }
    }

    pub fn ordered_elements(&self) -> Vec<&Element> {
        let mut ordered: Vec<&Element> = self.elements.values().collect();
        ordered.sort_by_key(|e| e.address);
        ordered
    }

    pub fn lookup(&self, address: u16) -> Option<&Element> {
        self.elements.get(&address)
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub(crate) fn model_mut(&mut self, address: u16, model: ModelId) -> Result<&mut MeshModel, NodeError> {
        let element = self
            .elements
            .get_mut(&address)
            .ok_or(NodeError::NotFound(Missing::Element(address)))?;
        element
            .models
            .get_mut(&model)
            .ok_or(NodeError::NotFound(Missing::Model {
                element: address,
                model,
            }))
    }

    /// Clears every binding that references `app_key_index`; returns how many were cleared.
    pub(crate) fn clear_bindings_to(&mut self, app_key_index: u16) -> usize {
        let mut cleared = 0;
        for model in self.elements.values_mut().flat_map(|e| e.models.values_mut()) {
            if model.bound_app_key == Some(app_key_index) {
                model.bound_app_key = None;
                cleared += 1;
            }
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(address: u16) -> Element {
        Element::new(
            UnicastAddress::new(address).unwrap(),
            0,
            [ModelId::Sig(0x0000), ModelId::Sig(0x1000)],
        )
    }

    #[test]
    fn test_ordered_regardless_of_insert_order() {
        let mut registry = ElementRegistry::new();
        registry.apply_composition_data([element(0x0003), element(0x0001), element(0x0002)]);

        for _ in 0..3 {
            let addresses: Vec<u16> = registry
                .ordered_elements()
                .iter()
                .map(|e| e.address.value())
                .collect();
            assert_eq!(addresses, vec![0x0001, 0x0002, 0x0003]);
        }
    }

    #[test]
    fn test_merge_overwrites_without_removing() {
        let mut registry = ElementRegistry::new();
        registry.apply_composition_data([element(0x0001), element(0x0002)]);

        let replacement = Element::new(UnicastAddress::new(0x0002).unwrap(), 7, [ModelId::Sig(0x1001)]);
        registry.apply_composition_data([replacement]);

        assert_eq!(registry.len(), 2);
        let updated = registry.lookup(0x0002).unwrap();
        assert_eq!(updated.location, 7);
        assert!(updated.model(ModelId::Sig(0x1001)).is_some());
        assert!(updated.model(ModelId::Sig(0x1000)).is_none());
        assert!(registry.lookup(0x0001).is_some());
    }

    #[test]
    fn test_model_lookup_errors() {
        let mut registry = ElementRegistry::new();
        registry.apply_composition_data([element(0x0001)]);

        assert_eq!(
            registry.model_mut(0x0009, ModelId::Sig(0x1000)).unwrap_err(),
            NodeError::NotFound(Missing::Element(0x0009))
        );
        assert_eq!(
            registry.model_mut(0x0001, ModelId::Sig(0x1300)).unwrap_err(),
            NodeError::NotFound(Missing::Model {
                element: 0x0001,
                model: ModelId::Sig(0x1300)
            })
        );
    }

    #[test]
    fn test_clear_bindings() {
        let mut registry = ElementRegistry::new();
        registry.apply_composition_data([element(0x0001), element(0x0002)]);
        registry.model_mut(0x0001, ModelId::Sig(0x1000)).unwrap().bound_app_key = Some(4);
        registry.model_mut(0x0002, ModelId::Sig(0x1000)).unwrap().bound_app_key = Some(4);
        registry.model_mut(0x0002, ModelId::Sig(0x0000)).unwrap().bound_app_key = Some(5);

        assert_eq!(registry.clear_bindings_to(4), 2);
        assert_eq!(
            registry.lookup(0x0002).unwrap().model(ModelId::Sig(0x0000)).unwrap().bound_app_key,
            Some(5)
        );
    }
}
