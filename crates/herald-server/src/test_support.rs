//! Service fixtures for the server's unit tests.

use std::sync::Arc;
use std::time::Duration;

use herald_core::clock::SystemClock;
use herald_core::ids::InstanceId;
use herald_core::rate_limit::RateLimitConfig;
use herald_core::transport::TransportEvent;
use herald_dispatch::mock::{MockBehavior, MockTransportFactory};
use herald_dispatch::{next_event, MessagingService, ServiceConfig, ServiceDeps};
use herald_store::{Database, InstanceRepo, MessageRepo};

pub(crate) struct TestService {
    pub service: Arc<MessagingService>,
    pub factory: Arc<MockTransportFactory>,
}

/// Service over an in-memory database and mock transport, with pacing off.
pub(crate) fn test_service() -> TestService {
    let db = Database::in_memory().unwrap();
    let factory = Arc::new(MockTransportFactory::new(MockBehavior::default()));
    let service = MessagingService::new(
        ServiceDeps {
            instances: Arc::new(InstanceRepo::new(db.clone())),
            messages: Arc::new(MessageRepo::new(db)),
            transport: factory.clone(),
            clock: Arc::new(SystemClock),
        },
        ServiceConfig {
            rate_limit: RateLimitConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        },
    );
    TestService {
        service: Arc::new(service),
        factory,
    }
}

/// Register an instance and drive it to ready.
pub(crate) async fn connected(t: &TestService) -> InstanceId {
    let instance = t.service.register_instance("+15550001", "Front desk").unwrap();
    let (_, mut rx) = t.service.observe();
    t.service.initialize_instance(&instance.id).await.unwrap();
    let driver = t.factory.driver(&instance.id).unwrap();
    assert!(driver.emit(TransportEvent::Ready).await);

    tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = next_event(&mut rx).await {
            if event.event_type() == "READY" {
                return;
            }
        }
        panic!("event channel closed");
    })
    .await
    .unwrap();
    instance.id
}
