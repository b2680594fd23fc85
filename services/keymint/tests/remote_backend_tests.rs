//! Remote backends against mocked HTTP endpoints.

mod common;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::{caller, decode, t0, AUDIENCE, EMAIL};
use keymint::jwt::SigningAlgorithm;
use keymint::signer::{CloudKmsSigner, KmsConfig};
use keymint::source::{
    AccessBoundaryRule, DownscopeConfig, DownscopedTokenSource, ImpersonatedTokenSource,
    ImpersonationConfig, SigningSourceConfig, SigningTokenSource, VaultConfig, VaultTokenSource,
};
use keymint::{ErrorClass, FixedClock, StaticTokenSource, Token, TokenError, TokenSource};
use secrecy::SecretString;
use std::sync::Arc;
use wiremock::matchers::{body_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KMS_KEY: &str =
    "projects/keymint-test/locations/global/keyRings/minting/cryptoKeys/jwt/cryptoKeyVersions/3";
const TARGET: &str = "target@keymint-test.iam.gserviceaccount.com";
const DELEGATE: &str = "hop@keymint-test.iam.gserviceaccount.com";
const SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const BUCKET: &str = "//storage.googleapis.com/projects/_/buckets/reports";

// Cloud KMS

#[tokio::test]
async fn kms_backed_source_embeds_kms_signature() {
    let server = MockServer::start().await;
    let signature = vec![0x5a_u8; 256];

    Mock::given(method("POST"))
        .and(path(format!("/v1/{KMS_KEY}:asymmetricSign")))
        .and(header("authorization", "Bearer ya29.caller"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "signature": STANDARD.encode(&signature),
        })))
        .expect(2)
        .mount(&server)
        .await;

    let signer = CloudKmsSigner::new(
        KmsConfig::new(KMS_KEY).with_endpoint(server.uri()),
        caller("ya29.caller"),
    )
    .unwrap();
    let source = SigningTokenSource::new(
        SigningSourceConfig::new(EMAIL, AUDIENCE).with_key_id("kms-key-3"),
        signer,
    )
    .unwrap()
    .with_clock(Arc::new(FixedClock(t0())));

    let token = source.token().await.unwrap();
    let decoded = decode(token.access_token());
    assert_eq!(decoded.signature, signature);
    assert_eq!(decoded.header.kid.as_deref(), Some("kms-key-3"));
    assert_eq!(token.access_token().rsplit('.').next(), Some(URL_SAFE_NO_PAD.encode(&signature).as_str()));

    // Same claims, same digest: the second call must send the same request.
    let again = source.token().await.unwrap();
    assert_eq!(again, token);
}

#[tokio::test]
async fn kms_es256_header_matches_key_type() {
    let server = MockServer::start().await;
    let mut der = vec![0x30, 0x44, 0x02, 0x20];
    der.extend_from_slice(&[0x11; 32]);
    der.extend_from_slice(&[0x02, 0x20]);
    der.extend_from_slice(&[0x22; 32]);

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "signature": STANDARD.encode(&der),
        })))
        .mount(&server)
        .await;

    let signer = CloudKmsSigner::new(
        KmsConfig::new(KMS_KEY)
            .with_algorithm(SigningAlgorithm::ES256)
            .with_endpoint(server.uri()),
        caller("ya29.caller"),
    )
    .unwrap();
    let source = SigningTokenSource::new(SigningSourceConfig::new(EMAIL, AUDIENCE), signer).unwrap();

    let decoded = decode(source.token().await.unwrap().access_token());
    assert_eq!(decoded.header.alg, SigningAlgorithm::ES256);
    assert_eq!(decoded.signature.len(), 64);
}

#[tokio::test]
async fn kms_permission_denied_is_not_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
            "error": {
                "code": 403,
                "message": "Permission 'cloudkms.cryptoKeyVersions.useToSign' denied",
                "status": "PERMISSION_DENIED",
            }
        })))
        .mount(&server)
        .await;

    let signer = CloudKmsSigner::new(
        KmsConfig::new(KMS_KEY).with_endpoint(server.uri()),
        caller("ya29.caller"),
    )
    .unwrap();
    let source = SigningTokenSource::new(SigningSourceConfig::new(EMAIL, AUDIENCE), signer).unwrap();

    let err = source.token().await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::PermissionDenied);
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("useToSign"));
}

// Vault

fn vault_source(server: &MockServer) -> VaultTokenSource {
    let config = VaultConfig::new(
        server.uri(),
        "gcp/roleset/minter/token",
        SecretString::from("s.vault-token"),
    );
    VaultTokenSource::new(config)
        .unwrap()
        .with_clock(Arc::new(FixedClock(t0())))
}

#[tokio::test]
async fn vault_returns_server_issued_token() {
    let server = MockServer::start().await;
    let expires_at = t0().timestamp() + 3599;

    Mock::given(method("GET"))
        .and(path("/v1/gcp/roleset/minter/token"))
        .and(header("X-Vault-Token", "s.vault-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "request_id": "2d8e4b1a",
            "lease_duration": 0,
            "renewable": false,
            "data": {
                "token": "ya29.from-vault",
                "expires_at_seconds": expires_at,
                "token_ttl": 3599,
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let token = vault_source(&server).token().await.unwrap();
    assert_eq!(token.access_token(), "ya29.from-vault");
    assert_eq!(token.expiry(), DateTime::from_timestamp(expires_at, 0).unwrap());
}

#[tokio::test]
async fn vault_ttl_used_when_absolute_expiry_missing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": { "token": "ya29.from-vault", "token_ttl": 1800 }
        })))
        .mount(&server)
        .await;

    let token = vault_source(&server).token().await.unwrap();
    assert_eq!(token.expiry(), t0() + ChronoDuration::seconds(1800));
}

#[tokio::test]
async fn vault_non_success_is_upstream_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403).set_body_string(r#"{"errors":["permission denied"]}"#))
        .mount(&server)
        .await;

    match vault_source(&server).token().await {
        Err(TokenError::UpstreamRejected { service, status, body }) => {
            assert_eq!(service, "vault");
            assert_eq!(status, 403);
            assert!(body.contains("permission denied"));
        }
        other => panic!("expected UpstreamRejected, got {other:?}"),
    }
}

#[tokio::test]
async fn vault_missing_token_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": { "expires_at_seconds": 1_900_000_000 }
        })))
        .mount(&server)
        .await;

    let err = vault_source(&server).token().await.unwrap_err();
    assert!(matches!(err, TokenError::MalformedResponse { service: "vault", .. }));
}

#[tokio::test]
async fn vault_unusable_lifetime_is_malformed() {
    let bodies = [
        serde_json::json!({ "data": { "token": "ya29.x", "token_ttl": i64::MAX } }),
        serde_json::json!({ "data": { "token": "ya29.x", "token_ttl": 0 } }),
        serde_json::json!({ "data": { "token": "ya29.x", "token_ttl": -60 } }),
        serde_json::json!({ "data": { "token": "ya29.x", "expires_at_seconds": t0().timestamp() - 1 } }),
    ];

    for body in bodies {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&body))
            .mount(&server)
            .await;

        let err = vault_source(&server).token().await.unwrap_err();
        assert!(
            matches!(err, TokenError::MalformedResponse { service: "vault", .. }),
            "{body} should be rejected, got {err:?}"
        );
    }
}

// Impersonation

fn impersonation(server: &MockServer) -> ImpersonationConfig {
    ImpersonationConfig::new(TARGET, vec![SCOPE.to_string()])
        .with_delegates(vec![DELEGATE.to_string()])
        .with_iam_endpoint(server.uri())
        .with_token_url(format!("{}/token", server.uri()))
}

#[tokio::test]
async fn impersonation_generates_access_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/v1/projects/-/serviceAccounts/{TARGET}:generateAccessToken")))
        .and(header("authorization", "Bearer ya29.caller"))
        .and(body_json(serde_json::json!({
            "delegates": [format!("projects/-/serviceAccounts/{DELEGATE}")],
            "scope": [SCOPE],
            "lifetime": "3600s",
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "accessToken": "ya29.impersonated",
            "expireTime": "2024-06-01T13:00:00Z",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let source = ImpersonatedTokenSource::new(impersonation(&server), caller("ya29.caller")).unwrap();
    let token = source.token().await.unwrap();

    assert_eq!(token.access_token(), "ya29.impersonated");
    assert_eq!(token.expiry(), t0() + ChronoDuration::hours(1));
}

#[tokio::test]
async fn unauthorized_delegate_yields_invalid_delegation_chain() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
            "error": {
                "code": 403,
                "message": format!("Permission 'iam.serviceAccounts.getAccessToken' denied on resource (or it may not exist) for {DELEGATE}"),
                "status": "PERMISSION_DENIED",
            }
        })))
        .mount(&server)
        .await;

    let source = ImpersonatedTokenSource::new(impersonation(&server), caller("ya29.caller")).unwrap();
    let result: Result<Token, TokenError> = source.token().await;

    match result {
        Err(TokenError::InvalidDelegationChain { delegate, .. }) => assert_eq!(delegate, DELEGATE),
        other => panic!("expected InvalidDelegationChain, got {other:?}"),
    }
}

#[tokio::test]
async fn caller_without_rights_yields_insufficient_permission() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
            "error": {
                "code": 403,
                "message": "The caller does not have permission",
                "status": "PERMISSION_DENIED",
            }
        })))
        .mount(&server)
        .await;

    let source = ImpersonatedTokenSource::new(impersonation(&server), caller("ya29.caller")).unwrap();
    let err = source.token().await.unwrap_err();

    assert!(matches!(err, TokenError::InsufficientPermission { ref principal, .. } if principal == TARGET));
    assert_eq!(err.class(), ErrorClass::PermissionDenied);
}

#[tokio::test]
async fn domain_wide_delegation_signs_and_exchanges() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/v1/projects/-/serviceAccounts/{TARGET}:signJwt")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "keyId": "8f2a",
            "signedJwt": "eyJhbGciOiJSUzI1NiJ9.eyJpc3MiOiJ0In0.c2ln",
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("assertion=eyJhbGciOiJSUzI1NiJ9.eyJpc3MiOiJ0In0.c2ln"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "ya29.as-user",
            "expires_in": 3600,
            "token_type": "Bearer",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = impersonation(&server).with_subject("user@example.com");
    let source = ImpersonatedTokenSource::new(config, caller("ya29.caller"))
        .unwrap()
        .with_clock(Arc::new(FixedClock(t0())));

    let token = source.token().await.unwrap();
    assert_eq!(token.access_token(), "ya29.as-user");

    let requests = server.received_requests().await.unwrap();
    let sign_request: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    let payload: serde_json::Value =
        serde_json::from_str(sign_request["payload"].as_str().unwrap()).unwrap();
    assert_eq!(payload["iss"], TARGET);
    assert_eq!(payload["sub"], "user@example.com");
    assert_eq!(payload["scope"], SCOPE);
    assert_eq!(payload["aud"], format!("{}/token", server.uri()));
    assert_eq!(payload["iat"], t0().timestamp());
}

// Downscoping

fn downscoped(server: &MockServer, root: Arc<dyn TokenSource>) -> DownscopedTokenSource {
    let rule = AccessBoundaryRule::new(BUCKET, vec!["inRole:roles/storage.objectViewer".to_string()]);
    let config = DownscopeConfig::new(vec![rule]).with_sts_endpoint(format!("{}/v1/token", server.uri()));
    DownscopedTokenSource::new(config, root)
        .unwrap()
        .with_clock(Arc::new(FixedClock(t0())))
}

#[tokio::test]
async fn downscope_exchanges_root_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/token"))
        .and(body_string_contains(
            "grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Atoken-exchange",
        ))
        .and(body_string_contains("subject_token=ya29.root"))
        .and(body_string_contains("options="))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "ya29.downscoped",
            "issued_token_type": "urn:ietf:params:oauth:token-type:access_token",
            "token_type": "Bearer",
            "expires_in": 1200,
        })))
        .expect(1)
        .mount(&server)
        .await;

    let token = downscoped(&server, caller("ya29.root")).token().await.unwrap();
    assert_eq!(token.access_token(), "ya29.downscoped");
    assert_eq!(token.expiry(), t0() + ChronoDuration::seconds(1200));
}

#[tokio::test]
async fn downscope_inherits_root_expiry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "ya29.downscoped",
            "token_type": "Bearer",
        })))
        .mount(&server)
        .await;

    let root_expiry = Utc::now() + ChronoDuration::minutes(17);
    let root: Arc<dyn TokenSource> = Arc::new(StaticTokenSource::new(Token::bearer("ya29.root", root_expiry)));

    let token = downscoped(&server, root).token().await.unwrap();
    assert_eq!(token.expiry(), root_expiry);
}

#[tokio::test]
async fn downscope_rejection_surfaces_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_request",
            "error_description": "Invalid access boundary rule",
        })))
        .mount(&server)
        .await;

    let err = downscoped(&server, caller("ya29.root")).token().await.unwrap_err();
    assert!(matches!(err, TokenError::UpstreamRejected { service: "sts", status: 400, .. }));
}

#[tokio::test]
async fn downscope_out_of_range_lifetime_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "ya29.downscoped",
            "token_type": "Bearer",
            "expires_in": i64::MAX,
        })))
        .mount(&server)
        .await;

    let err = downscoped(&server, caller("ya29.root")).token().await.unwrap_err();
    assert!(matches!(err, TokenError::MalformedResponse { service: "sts", .. }));
}

#[tokio::test]
async fn downscope_unreachable_is_retryable() {
    let rule = AccessBoundaryRule::new(BUCKET, vec!["inRole:roles/storage.objectViewer".to_string()]);
    let config = DownscopeConfig::new(vec![rule]).with_sts_endpoint("http://127.0.0.1:1/v1/token");
    let source = DownscopedTokenSource::new(config, caller("ya29.root")).unwrap();

    let err = source.token().await.unwrap_err();
    assert!(err.is_retryable());
}
