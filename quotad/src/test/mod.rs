//! End-to-end runs against a mocked PostgREST endpoint.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_json, body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::config::{Config, StoreConfig};
use crate::reconciler::{Reconciler, WriteAction};
use crate::store::{InMemoryStore, PostgrestStore, StoreError};
use crate::types::{CANDIDATE_COLUMNS, SubscriptionTier, UserId, UserQuotaRecord};
use crate::Application;

const KEY: &str = "service-role-test-key";

fn config_for(server: &MockServer) -> Config {
    Config {
        store: StoreConfig {
            url: Some(Url::parse(&server.uri()).unwrap()),
            service_role_key: Some(KEY.to_string()),
            timeout: Duration::from_secs(5),
            ..StoreConfig::default()
        },
        ..Config::default()
    }
}

async fn mount_candidates(server: &MockServer, rows: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/rest/v1/profiles"))
        .and(query_param("select", CANDIDATE_COLUMNS))
        .and(query_param("auto_scraper_enabled", "eq.true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rows))
        .expect(1)
        .mount(server)
        .await;
}

fn patch_for(id: &str) -> wiremock::MockBuilder {
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/profiles"))
        .and(query_param("id", format!("eq.{id}").as_str()))
}

#[test_log::test(tokio::test)]
async fn test_run_against_postgrest_with_partial_failure() {
    let server = MockServer::start().await;
    let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();

    mount_candidates(
        &server,
        json!([
            {
                "id": "at-limit",
                "email": "free@example.com",
                "subscription_tier": "free",
                "today_applications_count": 5,
                "last_application_date": "2025-03-01T09:00:00+00:00",
                "application_count": 40
            },
            {
                "id": "yesterday",
                "email": "pro@example.com",
                "subscription_tier": "pro",
                "today_applications_count": 25,
                "last_application_date": "2025-02-28 23:59:00+00",
                "application_count": 900
            },
            {
                "id": "flaky",
                "email": "premium@example.com",
                "subscription_tier": "premium",
                "today_applications_count": 3,
                "last_application_date": "2025-03-01T11:57:00Z",
                "application_count": 10
            }
        ]),
    )
    .await;

    patch_for("at-limit")
        .and(body_json(json!({ "auto_scraper_enabled": false })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "at-limit" }])))
        .expect(1)
        .mount(&server)
        .await;

    patch_for("yesterday")
        .and(body_partial_json(json!({
            "today_applications_count": 1,
            "application_count": 901
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "yesterday" }])))
        .expect(1)
        .mount(&server)
        .await;

    patch_for("flaky")
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({ "message": "canceling statement due to statement timeout" })))
        .expect(1)
        .mount(&server)
        .await;

    let store = PostgrestStore::from_config(&config_for(&server).store).unwrap();
    let result = Reconciler::new(Arc::new(store)).reconcile(now).await.unwrap();

    assert_eq!(result.disabled, 1);
    assert_eq!(result.incremented, 1);
    assert_eq!(result.failed_ids(), vec![&UserId::from("flaky")]);

    let failure = &result.failures[0];
    assert_eq!(failure.action, WriteAction::Increment);
    assert_eq!(failure.email.as_deref(), Some("premium@example.com"));
    assert!(matches!(
        &failure.error,
        StoreError::Rejected { status: 500, message } if message.contains("statement timeout")
    ));
}

#[test_log::test(tokio::test)]
async fn test_run_once_with_no_candidates_writes_nothing() {
    let server = MockServer::start().await;
    mount_candidates(&server, json!([])).await;

    Mock::given(method("PATCH"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    let app = Application::new(config_for(&server)).unwrap();
    let result = app.run_once().await.unwrap();

    assert_eq!(result.total(), 0);
}

#[test_log::test(tokio::test)]
async fn test_run_once_fails_when_store_rejects_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({ "message": "Invalid API key" })))
        .mount(&server)
        .await;

    let app = Application::new(config_for(&server)).unwrap();
    let err = app.run_once().await.unwrap_err();

    assert!(matches!(err, crate::Error::Fetch(StoreError::Rejected { status: 401, .. })));
    assert!(!err.is_fatal());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_serve_runs_on_startup_and_stops_on_shutdown() {
    let store = InMemoryStore::new();
    store.insert(
        UserQuotaRecord {
            id: UserId::from("user-1"),
            email: None,
            subscription_tier: SubscriptionTier::Free,
            today_applications_count: 0,
            last_application_date: None,
            application_count: 7,
        },
        true,
    );

    let mut config = Config::default();
    config.schedule.run_on_startup = true;
    config.schedule.align_to_wall_clock = false;

    let app = Application::with_store(config, Arc::new(store.clone())).unwrap();
    app.serve(tokio::time::sleep(Duration::from_secs(1))).await.unwrap();

    assert_eq!(store.fetch_count(), 1);
    let profile = store.profile(&UserId::from("user-1")).unwrap();
    assert_eq!(profile.record.today_applications_count, 1);
    assert_eq!(profile.record.application_count, 8);
    assert!(profile.auto_scraper_enabled);
}
