//! Shared helpers for keymint integration tests.

#![allow(dead_code)]

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Duration, TimeZone, Utc};
use keymint::jwt::{ClaimSet, Header};
use keymint::signer::SoftwareModule;
use keymint::{StaticTokenSource, TokenSource};
use std::sync::Arc;

pub const TEST_KEY: &str = include_str!("../fixtures/test_rsa_key.pem");
pub const HANDLE: u32 = 0x8100_8001;
pub const EMAIL: &str = "minter@keymint-test.iam.gserviceaccount.com";
pub const AUDIENCE: &str = "https://pubsub.googleapis.com/";

pub fn software_module() -> SoftwareModule {
    SoftwareModule::new().with_pem(HANDLE, TEST_KEY).unwrap()
}

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn caller(token: &str) -> Arc<dyn TokenSource> {
    Arc::new(StaticTokenSource::from_bearer(token, Utc::now() + Duration::hours(1)).unwrap())
}

/// A decoded compact JWT.
pub struct Decoded {
    pub header: Header,
    pub claims: ClaimSet,
    pub signing_input: String,
    pub signature: Vec<u8>,
}

pub fn decode(jwt: &str) -> Decoded {
    let parts: Vec<&str> = jwt.split('.').collect();
    assert_eq!(parts.len(), 3, "compact JWT must have three segments");

    let header = URL_SAFE.decode(parts[0]).expect("header is URL-safe base64");
    let claims = URL_SAFE.decode(parts[1]).expect("claims are URL-safe base64");
    let signature = URL_SAFE_NO_PAD
        .decode(parts[2])
        .expect("signature is unpadded URL-safe base64");

    Decoded {
        header: serde_json::from_slice(&header).expect("header JSON"),
        claims: serde_json::from_slice(&claims).expect("claims JSON"),
        signing_input: format!("{}.{}", parts[0], parts[1]),
        signature,
    }
}
