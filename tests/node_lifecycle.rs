//! Provisioned node lifecycle
//!
//! Provision, apply composition data, manage keys and bindings, check replay
//! protection, then persist and restore.
//!
//! Success Criteria:
//! - Elements always come back in ascending address order
//! - Replayed or stale seq-auth values are rejected
//! - Bindings only ever reference existing application keys
//! - A restored node equals the one that was saved

#[cfg(test)]
mod tests {
    use meshnode::node::{
        CompositionData, Element, ElementComposition, ElementRegistry, ModelAppOp,
        ModelAppStatus, ProvisioningResult, ReplayProtectionTable,
    };
    use meshnode::storage::{InMemoryNodeStore, NodeStore};
    use meshnode::{
        Key128, MeshNetwork, Missing, ModelId, NodeError, NodeSnapshot, ProvisionedNode,
        UnicastAddress,
    };
    use std::sync::Arc;
    use uuid::Uuid;

    const NETWORK: Uuid = Uuid::from_bytes([0x42; 16]);
    const ONOFF_SERVER: ModelId = ModelId::Sig(0x1000);
    const CONFIG_SERVER: ModelId = ModelId::Sig(0x0000);

    fn provisioning(device: u8, unicast: u16, element_count: u8) -> ProvisioningResult {
        ProvisioningResult {
            device_uuid: Uuid::from_bytes([device; 16]),
            node_name: format!("node-{}", device),
            network_key: Key128::from_hex("7dd7364cd842ad18c17c2b820c84c3d6").unwrap(),
            net_key_index: 0,
            device_key: Key128::from_bytes([device; 16]),
            unicast_address: unicast,
            element_count,
            ttl: 5,
            flags: 0,
            timestamp: 1_650_000_000_000,
            configuration_src: Some(0x0001),
        }
    }

    fn composition(element_count: usize) -> CompositionData {
        CompositionData {
            company_identifier: 0x0059,
            product_identifier: 0x0001,
            version_identifier: 0x0001,
            crpl: 16,
            features: 0x0001,
            elements: (0..element_count)
                .map(|i| ElementComposition {
                    location: i as u16,
                    models: vec![CONFIG_SERVER, ONOFF_SERVER],
                })
                .collect(),
        }
    }

    fn configured_node() -> ProvisionedNode {
        let mut node = ProvisionedNode::new(NETWORK, provisioning(1, 0x0010, 3)).unwrap();
        node.apply_composition_data(&composition(3)).unwrap();
        node.add_application_key(0, Key128::from_bytes([0xA0; 16]))
            .unwrap();
        node
    }

    #[test]
    fn test_elements_listed_in_address_order() {
        let mut registry = ElementRegistry::new();
        registry.apply_composition_data([3u16, 1, 2].into_iter().map(|address| {
            Element::new(UnicastAddress::new(address).unwrap(), 0, [ONOFF_SERVER])
        }));

        let addresses: Vec<u16> = registry
            .ordered_elements()
            .iter()
            .map(|e| e.address.value())
            .collect();
        assert_eq!(addresses, vec![1, 2, 3]);
    }

    #[test]
    fn test_composition_elements_follow_base_address() {
        let node = configured_node();
        let addresses: Vec<u16> = node
            .ordered_elements()
            .iter()
            .map(|e| e.address.value())
            .collect();
        assert_eq!(addresses, vec![0x0010, 0x0011, 0x0012]);

        let info = node.composition().unwrap();
        assert_eq!(info.crpl, 16);
        assert!(info.features.relay);
        assert!(!info.features.proxy);
    }

    #[test]
    fn test_replay_same_value_rejected() {
        let table = ReplayProtectionTable::new();
        assert!(table.accept_if_newer(0x0001, 5));
        assert!(!table.accept_if_newer(0x0001, 5));
        assert!(table.accept_if_newer(0x0001, 6));
        assert!(!table.accept_if_newer(0x0001, 4));
        assert_eq!(table.last_accepted(0x0001), Some(6));
    }

    #[test]
    fn test_replay_concurrent_senders_get_one_winner() {
        let table = Arc::new(ReplayProtectionTable::new());
        let accepted: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let table = Arc::clone(&table);
                    scope.spawn(move || table.accept_if_newer(0x0002, 100) as usize)
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(accepted, 1);
    }

    #[test]
    fn test_bind_unknown_app_key_is_not_found() {
        let mut node = configured_node();
        let err = node
            .bind_application_key(0x0010, ONOFF_SERVER, 99)
            .unwrap_err();
        assert_eq!(err, NodeError::NotFound(Missing::ApplicationKey(99)));
        assert!(err.is_recoverable());
        assert_eq!(
            node.element(0x0010)
                .unwrap()
                .model(ONOFF_SERVER)
                .unwrap()
                .bound_app_key,
            None
        );
    }

    #[test]
    fn test_bind_before_composition_is_invalid_state() {
        let mut node = ProvisionedNode::new(NETWORK, provisioning(2, 0x0020, 1)).unwrap();
        node.add_application_key(0, Key128::from_bytes([0xA0; 16]))
            .unwrap();
        assert!(matches!(
            node.bind_application_key(0x0020, ONOFF_SERVER, 0),
            Err(NodeError::InvalidState(_))
        ));
    }

    #[test]
    fn test_model_app_status_flow() {
        let mut node = configured_node();
        let status = ModelAppStatus {
            success: true,
            element_address: 0x0011,
            model: ONOFF_SERVER,
            app_key_index: 0,
        };

        node.apply_model_app_status(&status, ModelAppOp::Bind)
            .unwrap();
        let bound = |node: &ProvisionedNode| {
            node.element(0x0011)
                .unwrap()
                .model(ONOFF_SERVER)
                .unwrap()
                .bound_app_key
        };
        assert_eq!(bound(&node), Some(0));

        let failed = ModelAppStatus {
            success: false,
            ..status
        };
        node.apply_model_app_status(&failed, ModelAppOp::Unbind)
            .unwrap();
        assert_eq!(bound(&node), Some(0));

        node.apply_model_app_status(&status, ModelAppOp::Unbind)
            .unwrap();
        assert_eq!(bound(&node), None);
    }

    #[test]
    fn test_removing_app_key_clears_bindings() {
        let mut node = configured_node();
        node.bind_application_key(0x0010, ONOFF_SERVER, 0).unwrap();
        node.bind_application_key(0x0012, ONOFF_SERVER, 0).unwrap();

        node.remove_application_key(0).unwrap();
        for element in node.ordered_elements() {
            assert_eq!(element.model(ONOFF_SERVER).unwrap().bound_app_key, None);
        }
    }

    #[test]
    fn test_network_key_with_bound_app_key_cannot_be_removed() {
        let mut node = configured_node();
        assert!(matches!(
            node.remove_network_key(0),
            Err(NodeError::InvalidState(_))
        ));
        assert!(matches!(
            node.remove_network_key(7),
            Err(NodeError::NotFound(Missing::NetworkKey(7)))
        ));
    }

    #[test]
    fn test_full_round_trip() {
        let mut node = configured_node();
        node.add_network_key(1, Key128::from_bytes([0x55; 16]))
            .unwrap();
        node.add_application_key(5, Key128::from_bytes([0xA5; 16]))
            .unwrap();
        node.bind_application_key(0x0011, ONOFF_SERVER, 5).unwrap();
        node.add_subscription(0x0012, ONOFF_SERVER, 0xC001).unwrap();
        node.set_configured(true);
        node.set_received_sequence_number(0x0042).unwrap();
        node.replay().record_unconditional(0xC000, 0x05);
        assert!(node.replay().accept_if_newer(0x0001, 0x10));
        assert!(node.replay().accept_if_newer(0x0002, 0x20));

        let json = node.snapshot().to_json().unwrap();
        let restored = NodeSnapshot::from_json(&json).unwrap().restore().unwrap();
        assert_eq!(restored, node);
        assert_eq!(restored.keys().network_keys().len(), 2);
        assert_eq!(restored.ordered_elements().len(), 3);
        assert_eq!(restored.replay().len(), 2);
        assert_eq!(restored.received_sequence_number(), 0x0042);
        assert!(restored.identity_key().is_some());
        assert_eq!(restored.identity_key(), node.identity_key());
        assert_eq!(
            restored.transport_keys_for(1),
            node.transport_keys_for(1)
        );

        let bytes = node.snapshot().to_bytes().unwrap();
        let restored = NodeSnapshot::from_bytes(&bytes).unwrap().restore().unwrap();
        assert_eq!(restored, node);
    }

    #[test]
    fn test_network_rejects_overlapping_ranges() {
        let mut network = MeshNetwork::new(NETWORK, "lab");
        network.add_node(configured_node()).unwrap();

        let overlapping = ProvisionedNode::new(NETWORK, provisioning(2, 0x0012, 2)).unwrap();
        assert!(matches!(
            network.add_node(overlapping),
            Err(NodeError::InvalidState(_))
        ));

        let next = network.next_available_unicast(2).unwrap();
        assert_eq!(next.value(), 0x0001);
        assert_eq!(
            network.node_by_address(0x0011).unwrap().name(),
            "node-1"
        );
    }

    #[tokio::test]
    async fn test_store_round_trip() {
        let store = InMemoryNodeStore::new();
        let node = configured_node();

        store.save(&node).await.unwrap();
        let loaded = store.load(&node.key()).await.unwrap().unwrap();
        assert_eq!(loaded, node);
        assert_eq!(store.list().await.unwrap(), vec![node.key()]);
    }
}
