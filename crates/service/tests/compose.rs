//! Building and running whole instances.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use bilicore_authn::{AuthError, context::ROLE_CLAIM};
use bilicore_gateway::GatewayError;
use bilicore_service::{Service, ServiceConfig, ServiceError};
use bilicore_storage::MemoryBackend;
use bilicore_store::{AuthoritativeStore, EntityId, RelationalStore, StoreKind};
use bytes::Bytes;

const SEED: &str = "BwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwcHBwc";

fn config(extra: &str) -> ServiceConfig {
    ServiceConfig::from_toml_str(&format!(
        "[signing_key]\nkid = \"k1\"\nseed = \"{SEED}\"\n\n\
         [[jobs]]\nname = \"user-sync\"\nstore = \"relational\"\ninterval = \"10s\"\n{extra}"
    ))
    .unwrap()
}

fn token(service: &Service<MemoryBackend>) -> String {
    let claims = BTreeMap::from([(ROLE_CLAIM.to_owned(), "ORDINARY_USER".to_owned())]);
    service
        .gateway()
        .codec()
        .issue("USR000000000000000042", claims, Duration::from_secs(3600))
        .unwrap()
        .into_string()
}

#[tokio::test(start_paused = true)]
async fn scheduled_reconciliation_repairs_out_of_band_writes() {
    let store = RelationalStore::new();
    let mut service =
        Service::build(&config(""), MemoryBackend::new(), vec![Arc::new(store.clone())]).unwrap();
    let token = token(&service);
    let id = EntityId::from("u1");

    service.gateway().write(&token, StoreKind::Relational, &id, Bytes::from("v1")).await.unwrap();
    service.gateway().read(&token, StoreKind::Relational, &id).await.unwrap();

    // A writer that bypasses the gateway leaves the cache stale.
    let revision = store.write(&id, Bytes::from("v2")).await.unwrap();
    let stale = service.gateway().read(&token, StoreKind::Relational, &id).await.unwrap();
    assert_eq!(stale.payload, Bytes::from("v1"));

    service.start();
    assert!(service.is_running());
    tokio::time::sleep(Duration::from_secs(1)).await;

    let fresh = service.gateway().read(&token, StoreKind::Relational, &id).await.unwrap();
    assert_eq!(fresh.revision, revision);
    let status = service.engine().status("user-sync").unwrap();
    assert!(status.last_report.unwrap().invalidated >= 1);

    service.shutdown().await;
}

#[tokio::test]
async fn instances_share_keys_and_revocations() {
    let backend = MemoryBackend::new();
    let store: Arc<dyn AuthoritativeStore> = Arc::new(RelationalStore::new());
    let a = Service::build(&config(""), backend.clone(), vec![Arc::clone(&store)]).unwrap();
    let b = Service::build(&config(""), backend, vec![store]).unwrap();

    let session = a
        .gateway()
        .codec()
        .issue(
            "USR000000000000000042",
            BTreeMap::from([(ROLE_CLAIM.to_owned(), "VIP".to_owned())]),
            Duration::from_secs(3600),
        )
        .unwrap();
    assert!(b.gateway().authenticate(session.as_str()).await.unwrap().is_logged_in());

    a.gateway().codec().revoke_token(&session).await.unwrap();
    let err = b.gateway().authenticate(session.as_str()).await.unwrap_err();
    assert!(matches!(err, GatewayError::Auth(AuthError::TokenRevoked)));
}

#[tokio::test]
async fn job_without_its_store_is_rejected() {
    let config = config("\n[[jobs]]\nname = \"video-sync\"\nstore = \"document\"\n");
    let err = Service::build(&config, MemoryBackend::new(), vec![Arc::new(RelationalStore::new())])
        .unwrap_err();
    assert!(matches!(err, ServiceError::Job(_)));
}

#[tokio::test]
async fn malformed_seed_is_rejected() {
    let config = ServiceConfig::from_toml_str("[signing_key]\nseed = \"!!\"").unwrap();
    let err = Service::build(&config, MemoryBackend::new(), Vec::new()).unwrap_err();
    assert!(matches!(err, ServiceError::SigningKey(_)));
}
