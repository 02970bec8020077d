//! Unit tests for authentication middleware
//!
//! Tests cover:
//! - JWT issue/verify round trips and tampering
//! - Role claims surviving the round trip
//! - Constant-time scheduler token verification

use uuid::Uuid;

use super::jwt::JwtManager;
use super::middleware::verify_cron_token;
use crate::error::ApiError;

#[test]
fn jwt_round_trip_preserves_claims() {
    let manager = JwtManager::new("test-secret-at-least-32-bytes-long", 24);
    let user_id = Uuid::new_v4();

    let token = manager
        .generate_token(user_id, "owner@example.com", "owner")
        .unwrap();
    let claims = manager.verify_token(&token).unwrap();

    assert_eq!(claims.sub, user_id);
    assert_eq!(claims.email, "owner@example.com");
    assert_eq!(claims.role, "owner");
    assert!(claims.exp > claims.iat);
}

#[test]
fn tampered_token_is_rejected() {
    let manager = JwtManager::new("test-secret-at-least-32-bytes-long", 24);
    let token = manager
        .generate_token(Uuid::new_v4(), "owner@example.com", "owner")
        .unwrap();

    // Flip a character in the signature segment.
    let mut tampered = token.clone();
    let last = tampered.pop().unwrap();
    tampered.push(if last == 'A' { 'B' } else { 'A' });

    assert!(matches!(
        manager.verify_token(&tampered),
        Err(ApiError::Unauthorized)
    ));
}

#[test]
fn token_from_different_secret_is_rejected() {
    let issuer = JwtManager::new("secret-one-at-least-32-bytes-long!", 24);
    let verifier = JwtManager::new("secret-two-at-least-32-bytes-long!", 24);

    let token = issuer
        .generate_token(Uuid::new_v4(), "owner@example.com", "admin")
        .unwrap();

    assert!(verifier.verify_token(&token).is_err());
}

#[test]
fn admin_role_survives_round_trip() {
    let manager = JwtManager::new("test-secret-at-least-32-bytes-long", 24);
    let token = manager
        .generate_token(Uuid::new_v4(), "staff@matchday.app", "admin")
        .unwrap();

    let claims = manager.verify_token(&token).unwrap();
    assert_eq!(claims.role, "admin");
}

#[test]
fn cron_token_exact_match_passes() {
    assert!(verify_cron_token("scheduler-secret", "scheduler-secret").is_ok());
}

#[test]
fn cron_token_mismatch_fails() {
    assert!(matches!(
        verify_cron_token("wrong", "scheduler-secret"),
        Err(ApiError::Unauthorized)
    ));
    // Prefix of the real token is still a mismatch.
    assert!(verify_cron_token("scheduler-secre", "scheduler-secret").is_err());
}

#[test]
fn empty_configured_secret_disables_the_route() {
    assert!(matches!(
        verify_cron_token("anything", ""),
        Err(ApiError::ServiceUnavailable)
    ));
}
