mod common;

use chrono::Duration;
use reqwest::StatusCode;
use serde_json::{Value, json};

use common::{TestOptions, TestServer};
use railyard::auth::API_KEY_HEADER;
use railyard::config::RateLimitConfig;
use railyard::types::{AccessLevel, Role, Tenant};

/// Uploads an artifact through the proxy route and records it as `build_id`.
async fn publish(server: &TestServer, key: &str, tenant: &Tenant, build_id: &str, channel: &str) {
    let grant: Value = server
        .client
        .post(server.url("/api/v1/builds/presign"))
        .header(API_KEY_HEADER, key)
        .json(&json!({ "packId": tenant.id }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let resp = server
        .client
        .put(grant["uploadUrl"].as_str().unwrap())
        .body(format!("artifact {build_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = server
        .client
        .post(server.url("/api/v1/builds"))
        .header(API_KEY_HEADER, key)
        .json(&json!({
            "packId": tenant.id,
            "buildId": build_id,
            "artifactKey": grant["artifactKey"],
            "version": format!("1.0.0+{build_id}"),
            "channel": channel
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

async fn resolve(server: &TestServer, token: &str, tenant: &Tenant, query: &[(&str, &str)]) -> reqwest::Response {
    server
        .client
        .get(server.url(&format!("/api/v1/tenants/{}/resolve", tenant.id)))
        .bearer_auth(token)
        .query(query)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::start().await;
    let resp = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_channel_fallback_and_promote() {
    let server = TestServer::start().await;
    let tenant = server.create_tenant("my-pack", None, false);
    let key = server.deploy_key(&tenant);
    let beta_token = server.member_token(&tenant, "tester", Role::Player, AccessLevel::Beta);

    publish(&server, &key, &tenant, "b1", "production").await;

    // Nothing on beta yet: a beta reader falls back to production.
    let resolved: Value = resolve(&server, &beta_token, &tenant, &[]).await.json().await.unwrap();
    assert_eq!(resolved["channel"], "production");
    assert_eq!(resolved["buildId"], "b1");

    publish(&server, &key, &tenant, "b2", "dev").await;
    let resp = server
        .client
        .post(server.url(&format!("/api/v1/tenants/{}/channels/beta/promote", tenant.id)))
        .header(API_KEY_HEADER, &key)
        .json(&json!({ "buildId": "b2" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let channel: Value = resp.json().await.unwrap();
    assert_eq!(channel["buildId"], "b2");

    let resolved: Value = resolve(&server, &beta_token, &tenant, &[]).await.json().await.unwrap();
    assert_eq!(resolved["channel"], "beta");
    assert_eq!(resolved["buildId"], "b2");

    // Dev is outside a beta reader's grant, so the request is ignored.
    let resolved: Value = resolve(&server, &beta_token, &tenant, &[("channel", "dev")])
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(resolved["channel"], "beta");

    // Readers cannot move channels.
    let resp = server
        .client
        .post(server.url(&format!("/api/v1/tenants/{}/channels/production/promote", tenant.id)))
        .bearer_auth(&beta_token)
        .json(&json!({ "buildId": "b2" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = server
        .client
        .post(server.url(&format!("/api/v1/tenants/{}/channels/production/promote", tenant.id)))
        .header(API_KEY_HEADER, &key)
        .json(&json!({ "buildId": "missing" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_requires_full_reinstall() {
    let server = TestServer::start().await;
    let tenant = server.create_tenant("my-pack", None, false);
    let key = server.deploy_key(&tenant);
    let token = server.member_token(&tenant, "dev", Role::Member, AccessLevel::Dev);

    publish(&server, &key, &tenant, "b1", "dev").await;
    server.clock.advance(Duration::seconds(1));
    publish(&server, &key, &tenant, "b2", "dev").await;
    server.clock.advance(Duration::seconds(1));
    publish(&server, &key, &tenant, "b3", "dev").await;

    let resp = server
        .client
        .put(server.url(&format!("/api/v1/tenants/{}/builds/b2/force-reinstall", tenant.id)))
        .header(API_KEY_HEADER, &key)
        .json(&json!({ "forceReinstall": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let build: Value = resp.json().await.unwrap();
    assert_eq!(build["forceReinstall"], true);

    let check = |current: &'static str| {
        let server = &server;
        let tenant = &tenant;
        let token = token.clone();
        async move {
            let resolved: Value = resolve(server, &token, tenant, &[("currentBuildId", current)])
                .await
                .json()
                .await
                .unwrap();
            assert_eq!(resolved["buildId"], "b3");
            resolved["requiresFullReinstall"].as_bool().unwrap()
        }
    };

    assert!(check("b1").await);
    assert!(!check("b2").await);
    assert!(!check("b3").await);
    assert!(!check("unknown-build").await);
}

#[tokio::test]
async fn test_expired_download_link() {
    let server = TestServer::start().await;
    let tenant = server.create_tenant("my-pack", None, false);
    let key = server.deploy_key(&tenant);
    let token = server.member_token(&tenant, "player", Role::Player, AccessLevel::Production);

    publish(&server, &key, &tenant, "b1", "production").await;
    let resolved: Value = resolve(&server, &token, &tenant, &[]).await.json().await.unwrap();
    let url = resolved["downloadUrl"].as_str().unwrap().to_string();

    server.clock.advance(Duration::seconds(901));
    let resp = server.client.get(&url).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::GONE);

    let tampered = url.replace("token=", "token=x");
    let resp = server.client.get(&tampered).send().await.unwrap();
    assert_ne!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_runner_exchange() {
    let server = TestServer::start().await;
    let tenant = server.create_tenant("my-pack", None, false);
    let key = server.deploy_key(&tenant);
    publish(&server, &key, &tenant, "b1", "dev").await;

    let runner = server.runner_token(&tenant);
    let resp = server
        .client
        .post(server.url("/api/v1/runner/token"))
        .bearer_auth(&runner)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let exchanged: Value = resp.json().await.unwrap();
    assert_eq!(exchanged["tokenType"], "Bearer");
    assert_eq!(exchanged["expiresIn"], 3600);
    let access = exchanged["accessToken"].as_str().unwrap();

    // Runners see every channel of their own pack.
    let resolved: Value = resolve(&server, access, &tenant, &[("channel", "dev")])
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(resolved["buildId"], "b1");

    let other = server.create_tenant("other-pack", None, false);
    let resp = resolve(&server, access, &other, &[]).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let resp = server
        .client
        .post(server.url("/api/v1/runner/token"))
        .bearer_auth("ryrt_not-a-real-token-value")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // Access tokens stop working once their lifetime passes.
    server.clock.advance(Duration::seconds(3601));
    let resp = resolve(&server, access, &tenant, &[]).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_public_latest() {
    let server = TestServer::start_with(TestOptions {
        rate_limit: two_per_minute(),
        ..TestOptions::default()
    })
    .await;
    let public = server.create_tenant("open-pack", None, true);
    let private = server.create_tenant("closed-pack", None, false);
    let key = server.deploy_key(&public);
    publish(&server, &key, &public, "b1", "production").await;

    let resp = server
        .client
        .get(server.url(&format!("/api/v1/public/{}/latest", public.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let latest: Value = resp.json().await.unwrap();
    assert_eq!(latest["buildId"], "b1");
    assert_eq!(latest["requiresFullReinstall"], false);

    let resp = server
        .client
        .get(server.url(&format!("/api/v1/public/{}/latest", private.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = server
        .client
        .get(server.url(&format!("/api/v1/public/{}/latest", public.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = resp.headers()["retry-after"].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));

    server.clock.advance(Duration::seconds(61));
    let resp = server
        .client
        .get(server.url(&format!("/api/v1/public/{}/latest", public.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

async fn latest_from(server: &TestServer, tenant: &Tenant, forwarded_for: &str) -> StatusCode {
    server
        .client
        .get(server.url(&format!("/api/v1/public/{}/latest", tenant.id)))
        .header("x-forwarded-for", forwarded_for)
        .send()
        .await
        .unwrap()
        .status()
}

fn two_per_minute() -> RateLimitConfig {
    RateLimitConfig {
        requests: 2,
        window_secs: 60,
        max_tracked_keys: 100,
    }
}

#[tokio::test]
async fn test_spoofed_forwarded_for_shares_one_bucket() {
    let server = TestServer::start_with(TestOptions {
        rate_limit: two_per_minute(),
        ..TestOptions::default()
    })
    .await;
    let public = server.create_tenant("open-pack", None, true);
    let key = server.deploy_key(&public);
    publish(&server, &key, &public, "b1", "production").await;

    assert_eq!(latest_from(&server, &public, "10.0.0.1").await, StatusCode::OK);
    assert_eq!(latest_from(&server, &public, "10.0.0.2").await, StatusCode::OK);
    assert_eq!(
        latest_from(&server, &public, "10.0.0.3").await,
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_trusted_proxy_keys_on_forwarded_for() {
    let server = TestServer::start_with(TestOptions {
        rate_limit: two_per_minute(),
        trust_forwarded_for: true,
        ..TestOptions::default()
    })
    .await;
    let public = server.create_tenant("open-pack", None, true);
    let key = server.deploy_key(&public);
    publish(&server, &key, &public, "b1", "production").await;

    for _ in 0..2 {
        assert_eq!(latest_from(&server, &public, "203.0.113.1").await, StatusCode::OK);
    }
    assert_eq!(
        latest_from(&server, &public, "203.0.113.1").await,
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(latest_from(&server, &public, "203.0.113.2").await, StatusCode::OK);
}

#[tokio::test]
async fn test_unauthenticated_resolve() {
    let server = TestServer::start().await;
    let tenant = server.create_tenant("my-pack", None, false);

    let resp = server
        .client
        .get(server.url(&format!("/api/v1/tenants/{}/resolve", tenant.id)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = resolve(&server, "not-a-token", &tenant, &[]).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}
