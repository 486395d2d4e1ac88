//! Forwards system events to one WebSocket observer.

use std::sync::Arc;

use tokio::sync::broadcast;

use herald_core::events::SystemEvent;

use crate::client::{ClientId, ClientRegistry};

pub fn serialize_event(event: &SystemEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::warn!(event_type = event.event_type(), error = %e, "failed to serialize event");
            None
        }
    }
}

/// Queue `snapshot` for the client, then forward every live event from `rx`
/// until the client goes away or the channel closes.
///
/// `rx` must have been subscribed before `snapshot` was taken.
pub fn attach(
    registry: Arc<ClientRegistry>,
    client_id: ClientId,
    snapshot: SystemEvent,
    mut rx: broadcast::Receiver<SystemEvent>,
) -> Option<tokio::task::JoinHandle<()>> {
    let client = registry.get(&client_id)?;
    if let Some(json) = serialize_event(&snapshot) {
        registry.send_to(&client_id, json);
    }

    Some(tokio::spawn(async move {
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(event) => {
                        if let Some(json) = serialize_event(&event) {
                            if !registry.send_to(&client_id, json)
                                && !registry.is_registered(&client_id)
                            {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(client_id = %client_id, skipped = n, "observer lagged, dropped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!(client_id = %client_id, "event channel closed");
                        break;
                    }
                },
                () = client.tx.closed() => break,
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_core::events::StateSnapshot;
    use herald_core::ids::InstanceId;
    use std::time::Duration;

    fn registry() -> Arc<ClientRegistry> {
        Arc::new(ClientRegistry::new(32, Duration::from_secs(90)))
    }

    fn ready(id: &str) -> SystemEvent {
        SystemEvent::Ready {
            instance_id: InstanceId::from_raw(id),
        }
    }

    #[test]
    fn serialize_uses_type_and_payload() {
        let json = serialize_event(&ready("inst_1")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "READY");
        assert_eq!(value["payload"]["instanceId"], "inst_1");
    }

    #[tokio::test]
    async fn snapshot_arrives_before_live_events() {
        let registry = registry();
        let (tx, _) = broadcast::channel(16);
        let (client_id, mut client_rx) = registry.register();

        let rx = tx.subscribe();
        let snapshot = SystemEvent::ConnectionState(StateSnapshot::default());
        let _ = tx.send(ready("inst_1"));
        let handle = attach(Arc::clone(&registry), client_id, snapshot, rx).unwrap();

        let first = client_rx.recv().await.unwrap();
        assert!(first.contains("CONNECTION_STATE"));
        let second = client_rx.recv().await.unwrap();
        assert!(second.contains("READY"));

        handle.abort();
    }

    #[tokio::test]
    async fn every_observer_gets_every_event() {
        let registry = registry();
        let (tx, _) = broadcast::channel(16);
        let (a, mut a_rx) = registry.register();
        let (b, mut b_rx) = registry.register();
        let snapshot = SystemEvent::ConnectionState(StateSnapshot::default());
        let _ha = attach(Arc::clone(&registry), a, snapshot.clone(), tx.subscribe()).unwrap();
        let _hb = attach(Arc::clone(&registry), b, snapshot, tx.subscribe()).unwrap();

        let _ = tx.send(ready("inst_2"));

        for rx in [&mut a_rx, &mut b_rx] {
            assert!(rx.recv().await.unwrap().contains("CONNECTION_STATE"));
            assert!(rx.recv().await.unwrap().contains("inst_2"));
        }
    }

    #[tokio::test]
    async fn forwarder_stops_when_client_leaves() {
        let registry = registry();
        let (tx, _) = broadcast::channel(16);
        let (client_id, client_rx) = registry.register();
        let handle = attach(
            Arc::clone(&registry),
            client_id.clone(),
            SystemEvent::ConnectionState(StateSnapshot::default()),
            tx.subscribe(),
        )
        .unwrap();

        registry.unregister(&client_id);
        drop(client_rx);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_client_is_not_attached() {
        let registry = registry();
        let (tx, _) = broadcast::channel::<SystemEvent>(4);
        assert!(attach(
            registry,
            ClientId::new(),
            SystemEvent::ConnectionState(StateSnapshot::default()),
            tx.subscribe(),
        )
        .is_none());
    }
}
