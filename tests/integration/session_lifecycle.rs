//! Session lifecycle integration tests
//!
//! The session table is authoritative; these tests check that the packet
//! filter follows it through expiry, activity, duplicate logins and
//! concurrent traffic.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use captive_portal::enforcer::EnforcerCall;
use captive_portal::error::{LoginError, SessionError};
use captive_portal::portal::Sweeper;
use captive_portal::session::{AuthorityConfig, DuplicateLoginPolicy, MacAddr};

use super::support::{portal, portal_with_users, PASSWORD, USERNAME};

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

// ============================================================================
// Expiry
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_idle_session_is_swept_exactly_once() {
    let (portal, enforcer, _) = portal(AuthorityConfig::default());
    let client = ip("10.1.0.10");

    let (tx, rx) = oneshot::channel();
    let sweeper = Sweeper::new(Arc::clone(&portal), Duration::from_secs(60));
    let sweeper = tokio::spawn(sweeper.run_until_shutdown(rx));

    let token = portal.login(client, USERNAME, PASSWORD).await.unwrap();
    assert!(enforcer.is_allowed(client));

    // The paused clock jumps from one sweep tick to the next
    tokio::time::sleep(Duration::from_secs(59 * 60)).await;
    assert!(enforcer.is_allowed(client));

    tokio::time::sleep(Duration::from_secs(3 * 60)).await;
    assert!(!enforcer.is_allowed(client));
    assert_eq!(
        enforcer.calls(),
        vec![EnforcerCall::Allow(client), EnforcerCall::Block(client)]
    );

    // Later sweeps find nothing
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert_eq!(enforcer.count(EnforcerCall::Block(client)), 1);
    assert!(portal.check(client, Some(token.as_str())).await.is_err());

    tx.send(()).unwrap();
    sweeper.await.unwrap();
    assert_eq!(portal.stats().snapshot().blocks, 1);
}

#[tokio::test(start_paused = true)]
async fn test_activity_keeps_session_alive() {
    let (portal, enforcer, _) = portal(AuthorityConfig::default());
    let client = ip("10.1.0.11");
    let token = portal.login(client, USERNAME, PASSWORD).await.unwrap();

    for _ in 0..4 {
        tokio::time::advance(Duration::from_secs(45 * 60)).await;
        portal.check(client, Some(token.as_str())).await.unwrap();
        assert!(portal.sweep().await.is_empty());
    }

    assert!(enforcer.is_allowed(client));
    assert_eq!(enforcer.count(EnforcerCall::Block(client)), 0);
}

// ============================================================================
// Duplicate Logins
// ============================================================================

#[tokio::test]
async fn test_replace_policy_invalidates_previous_token() {
    let (portal, enforcer, _) = portal(AuthorityConfig::default());
    let client = ip("10.1.0.12");

    let first = portal.login(client, USERNAME, PASSWORD).await.unwrap();
    let second = portal.login(client, USERNAME, PASSWORD).await.unwrap();
    assert_ne!(first, second);

    assert!(portal.check(client, Some(first.as_str())).await.is_err());
    assert!(portal.check(client, Some(second.as_str())).await.is_ok());

    // The identity never lost forwarding in between
    assert!(enforcer.is_allowed(client));
    assert_eq!(enforcer.count(EnforcerCall::Block(client)), 0);
    assert_eq!(portal.authority().len(), 1);
}

#[tokio::test]
async fn test_reject_policy_keeps_first_session() {
    let (portal, _, _) = portal(AuthorityConfig {
        duplicate_login: DuplicateLoginPolicy::Reject,
        ..AuthorityConfig::default()
    });
    let client = ip("10.1.0.13");

    let first = portal.login(client, USERNAME, PASSWORD).await.unwrap();
    let err = portal.login(client, USERNAME, PASSWORD).await.unwrap_err();
    assert!(matches!(
        err,
        LoginError::Session(SessionError::AlreadyAuthorized { .. })
    ));
    assert!(portal.check(client, Some(first.as_str())).await.is_ok());
}

// ============================================================================
// Corroboration
// ============================================================================

#[tokio::test]
async fn test_token_replayed_from_other_host_blocks_both() {
    let (portal, enforcer, macs) = portal(AuthorityConfig::default());
    let victim = ip("10.1.0.20");
    let attacker = ip("10.1.0.21");
    macs.set(victim, MacAddr([0x02, 0, 0, 0, 0, 0x20]));
    macs.set(attacker, MacAddr([0x02, 0, 0, 0, 0, 0x21]));

    let token = portal.login(victim, USERNAME, PASSWORD).await.unwrap();
    let err = portal.check(attacker, Some(token.as_str())).await.unwrap_err();

    assert!(matches!(err, SessionError::IdentityMismatch { .. }));
    assert!(!enforcer.is_allowed(victim));
    assert!(!enforcer.is_allowed(attacker));
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_logins_map_one_rule_per_identity() {
    let (portal, enforcer, _) = portal(AuthorityConfig::default());

    let mut tasks = Vec::new();
    for host in 1..=32u8 {
        let portal = Arc::clone(&portal);
        tasks.push(tokio::spawn(async move {
            let client: IpAddr = format!("10.2.0.{host}").parse().unwrap();
            portal.login(client, USERNAME, PASSWORD).await.map(|_| client)
        }));
    }

    for task in tasks {
        let client = task.await.unwrap().unwrap();
        assert_eq!(enforcer.count(EnforcerCall::Allow(client)), 1);
    }
    assert_eq!(portal.authority().len(), 32);

    let revoked = portal.revoke_all().await;
    assert_eq!(revoked.len(), 32);
    assert!(revoked.iter().all(|client| !enforcer.is_allowed(*client)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_logins_same_identity_leave_one_session() {
    let (portal, enforcer, _) = portal_with_users(
        AuthorityConfig::default(),
        &[("alice", "wonderland"), ("bob", "builder")],
    );
    let client = ip("10.2.1.1");

    let alice = tokio::spawn({
        let portal = Arc::clone(&portal);
        async move { portal.login(client, "alice", "wonderland").await.unwrap() }
    });
    let bob = tokio::spawn({
        let portal = Arc::clone(&portal);
        async move { portal.login(client, "bob", "builder").await.unwrap() }
    });
    let tokens = [alice.await.unwrap(), bob.await.unwrap()];

    assert_eq!(portal.authority().len(), 1);
    let mut working = 0;
    for token in &tokens {
        if portal.check(client, Some(token.as_str())).await.is_ok() {
            working += 1;
        }
    }
    assert_eq!(working, 1);
    assert!(enforcer.is_allowed(client));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_login_logout_race_converges() {
    let (portal, enforcer, _) = portal(AuthorityConfig::default());
    let client = ip("10.3.0.1");

    let mut tasks = Vec::new();
    for round in 0..50 {
        let portal = Arc::clone(&portal);
        tasks.push(tokio::spawn(async move {
            if round % 2 == 0 {
                let _ = portal.login(client, USERNAME, PASSWORD).await;
            } else {
                portal.logout(client).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Whatever order won, the filter agrees with the session table
    let live = portal.authority().is_live(client, tokio::time::Instant::now());
    assert_eq!(enforcer.is_allowed(client), live);
}
