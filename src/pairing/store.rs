//! One-time pairing code storage.
//!
//! Codes are keyed by the code itself, so one identity may hold several live
//! codes at once. Verification has to match both the code and the identity,
//! and a successful verification removes the entry so it cannot be replayed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::error::PairingError;
use crate::pairing::identity::Identity;

/// Default lifetime of an issued code in minutes.
pub const DEFAULT_CODE_TTL_MINUTES: i64 = 10;

/// Inclusive range codes are drawn from; every code is exactly 6 digits.
pub const CODE_RANGE: std::ops::RangeInclusive<u32> = 100_000..=999_999;

/// Generation attempts before sweeping expired entries and trying once more.
const MAX_ISSUE_ATTEMPTS: usize = 64;

/// A one-time pairing code.
#[derive(Debug, Clone, Serialize)]
pub struct PairingCode {
    /// Six-digit numeric code.
    pub code: String,
    /// Identity the code was issued to.
    pub owner: Identity,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Set on the copy returned by a successful verification.
    pub consumed: bool,
}

impl PairingCode {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

type CodeGenerator = Box<dyn Fn() -> String + Send + Sync>;

/// Concurrency-safe store of pending pairing codes.
///
/// Every read-modify-write runs under one async mutex, so an HTTP handler
/// and a chat command racing on the same code see a consistent outcome.
pub struct CredentialStore {
    codes: Mutex<HashMap<String, PairingCode>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    generate: CodeGenerator,
}

impl CredentialStore {
    /// Create a store issuing random 6-digit codes with the given lifetime.
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self::with_generator(clock, ttl, generate_code)
    }

    /// Create a store with a custom code generator.
    pub fn with_generator<G>(clock: Arc<dyn Clock>, ttl: Duration, generate: G) -> Self
    where
        G: Fn() -> String + Send + Sync + 'static,
    {
        Self {
            codes: Mutex::new(HashMap::new()),
            clock,
            ttl,
            generate: Box::new(generate),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Issue a new code for `owner`.
    ///
    /// Retries generation while the candidate collides with a live entry.
    /// An expired entry holding the same code is simply replaced.
    pub async fn issue(&self, owner: &Identity) -> Result<PairingCode, PairingError> {
        let now = self.clock.now();
        let mut codes = self.codes.lock().await;

        let mut candidate = None;
        for _ in 0..MAX_ISSUE_ATTEMPTS {
            let code = (self.generate)();
            if !is_live(&codes, &code, now) {
                candidate = Some(code);
                break;
            }
        }

        if candidate.is_none() {
            let before = codes.len();
            codes.retain(|_, entry| !entry.is_expired_at(now));
            tracing::warn!(
                swept = before - codes.len(),
                live = codes.len(),
                "Pairing code collisions exhausted attempts; swept expired codes"
            );
            let code = (self.generate)();
            if !is_live(&codes, &code, now) {
                candidate = Some(code);
            }
        }

        let code = candidate.ok_or(PairingError::CodeSpaceExhausted)?;
        let entry = self.record(&mut codes, code, owner, now);

        tracing::debug!(owner = %owner, expires_at = %entry.expires_at, "Issued pairing code");
        Ok(entry)
    }

    /// Record a code chosen elsewhere (an upstream issuer) for `owner`.
    ///
    /// The code must be well formed and must not collide with a live entry;
    /// an expired entry holding it is replaced.
    pub async fn issue_with_code(
        &self,
        code: &str,
        owner: &Identity,
    ) -> Result<PairingCode, PairingError> {
        if !is_well_formed_code(code) {
            return Err(PairingError::MalformedCode(code.to_string()));
        }

        let now = self.clock.now();
        let mut codes = self.codes.lock().await;
        if is_live(&codes, code, now) {
            return Err(PairingError::CodeInUse);
        }
        let entry = self.record(&mut codes, code.to_string(), owner, now);

        tracing::debug!(owner = %owner, expires_at = %entry.expires_at, "Recorded external pairing code");
        Ok(entry)
    }

    fn record(
        &self,
        codes: &mut HashMap<String, PairingCode>,
        code: String,
        owner: &Identity,
        now: DateTime<Utc>,
    ) -> PairingCode {
        let entry = PairingCode {
            code: code.clone(),
            owner: owner.clone(),
            issued_at: now,
            expires_at: now + self.ttl,
            consumed: false,
        };
        codes.insert(code, entry.clone());
        entry
    }

    /// Verify and consume `code` for `owner`.
    ///
    /// Expiry is checked before identity, so an expired code fails
    /// `CodeExpired` for any caller. A mismatched identity leaves the code
    /// usable by its real owner.
    pub async fn verify(&self, code: &str, owner: &Identity) -> Result<PairingCode, PairingError> {
        let now = self.clock.now();
        let mut codes = self.codes.lock().await;

        let entry = codes.get(code).ok_or(PairingError::CodeNotFound)?;

        if entry.is_expired_at(now) {
            codes.remove(code);
            return Err(PairingError::CodeExpired);
        }

        if &entry.owner != owner {
            return Err(PairingError::IdentityMismatch);
        }

        let mut consumed = codes.remove(code).ok_or(PairingError::CodeNotFound)?;
        consumed.consumed = true;
        Ok(consumed)
    }

    /// Drop every expired entry. Returns the number removed.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut codes = self.codes.lock().await;
        let before = codes.len();
        codes.retain(|_, entry| !entry.is_expired_at(now));
        before - codes.len()
    }

    /// Number of unexpired codes.
    pub async fn live_count(&self) -> usize {
        let now = self.clock.now();
        self.codes
            .lock()
            .await
            .values()
            .filter(|entry| !entry.is_expired_at(now))
            .count()
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn is_live(codes: &HashMap<String, PairingCode>, code: &str, now: DateTime<Utc>) -> bool {
    codes.get(code).is_some_and(|entry| !entry.is_expired_at(now))
}

/// Whether `code` is six ASCII digits inside [`CODE_RANGE`].
pub fn is_well_formed_code(code: &str) -> bool {
    code.len() == 6
        && code.bytes().all(|b| b.is_ascii_digit())
        && code.parse::<u32>().is_ok_and(|n| CODE_RANGE.contains(&n))
}

/// Generate a random 6-digit code.
pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    let code: u32 = rng.gen_range(CODE_RANGE);
    code.to_string()
}

/// Periodically sweep expired codes so abandoned requests don't pile up.
pub fn spawn_sweeper(store: Arc<CredentialStore>, interval: StdDuration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = store.sweep_expired().await;
            if removed > 0 {
                tracing::debug!(removed, "Swept expired pairing codes");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::clock::ManualClock;

    fn setup() -> (Arc<ManualClock>, CredentialStore) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = CredentialStore::new(
            clock.clone(),
            Duration::minutes(DEFAULT_CODE_TTL_MINUTES),
        );
        (clock, store)
    }

    fn id(raw: &str) -> Identity {
        Identity::parse(raw).unwrap()
    }

    #[tokio::test]
    async fn test_issue_produces_six_digit_code() {
        let (_clock, store) = setup();
        let issued = store.issue(&id("15551234567")).await.unwrap();

        assert_eq!(issued.code.len(), 6);
        let num: u32 = issued.code.parse().unwrap();
        assert!(CODE_RANGE.contains(&num));
        assert_eq!(issued.expires_at - issued.issued_at, Duration::minutes(10));
        assert!(!issued.consumed);
    }

    #[test]
    fn test_generated_codes_stay_in_range() {
        for _ in 0..1000 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
            assert!(CODE_RANGE.contains(&code.parse::<u32>().unwrap()));
        }
    }

    #[tokio::test]
    async fn test_verify_succeeds_exactly_once() {
        let (_clock, store) = setup();
        let owner = id("15551234567");
        let issued = store.issue(&owner).await.unwrap();

        let consumed = store.verify(&issued.code, &owner).await.unwrap();
        assert!(consumed.consumed);

        let err = store.verify(&issued.code, &owner).await.unwrap_err();
        assert_eq!(err, PairingError::CodeNotFound);
    }

    #[tokio::test]
    async fn test_verify_wrong_identity_keeps_code() {
        let (_clock, store) = setup();
        let owner = id("15551234567");
        let issued = store.issue(&owner).await.unwrap();

        let err = store
            .verify(&issued.code, &id("15559876543"))
            .await
            .unwrap_err();
        assert_eq!(err, PairingError::IdentityMismatch);

        store.verify(&issued.code, &owner).await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_after_expiry_fails_for_any_identity() {
        let (clock, store) = setup();
        let owner = id("15551234567");
        let first = store.issue(&owner).await.unwrap();
        let second = store.issue(&owner).await.unwrap();

        clock.advance(Duration::minutes(10) + Duration::seconds(1));

        assert_eq!(
            store.verify(&first.code, &owner).await.unwrap_err(),
            PairingError::CodeExpired
        );
        assert_eq!(
            store.verify(&second.code, &id("15559876543")).await.unwrap_err(),
            PairingError::CodeExpired
        );
        // Expired entries are deleted on the failed verify.
        assert_eq!(
            store.verify(&first.code, &owner).await.unwrap_err(),
            PairingError::CodeNotFound
        );
    }

    #[tokio::test]
    async fn test_verify_at_exact_expiry_still_succeeds() {
        let (clock, store) = setup();
        let owner = id("15551234567");
        let issued = store.issue(&owner).await.unwrap();

        clock.advance(Duration::minutes(10));
        store.verify(&issued.code, &owner).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_code_not_found() {
        let (_clock, store) = setup();
        assert_eq!(
            store.verify("123456", &id("15551234567")).await.unwrap_err(),
            PairingError::CodeNotFound
        );
    }

    #[tokio::test]
    async fn test_reissue_keeps_both_codes_live() {
        let (_clock, store) = setup();
        let owner = id("15551234567");
        let first = store.issue(&owner).await.unwrap();
        let second = store.issue(&owner).await.unwrap();

        assert_ne!(first.code, second.code);
        assert_eq!(store.live_count().await, 2);
        store.verify(&first.code, &owner).await.unwrap();
        store.verify(&second.code, &owner).await.unwrap();
    }

    #[tokio::test]
    async fn test_issue_retries_on_collision() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let calls = AtomicUsize::new(0);
        let store = CredentialStore::with_generator(clock, Duration::minutes(10), move || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            let code = if n < 3 { "111111" } else { "222222" };
            code.to_string()
        });

        let first = store.issue(&id("15551234567")).await.unwrap();
        let second = store.issue(&id("15551234567")).await.unwrap();

        assert_eq!(first.code, "111111");
        assert_eq!(second.code, "222222");
    }

    #[tokio::test]
    async fn test_issue_reuses_expired_code() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store =
            CredentialStore::with_generator(clock.clone(), Duration::minutes(10), || {
                "333333".to_string()
            });
        let owner = id("15551234567");
        store.issue(&owner).await.unwrap();

        assert_eq!(
            store.issue(&owner).await.unwrap_err(),
            PairingError::CodeSpaceExhausted
        );

        clock.advance(Duration::minutes(11));
        let reissued = store.issue(&owner).await.unwrap();
        assert_eq!(reissued.code, "333333");
        store.verify("333333", &owner).await.unwrap();
    }

    #[tokio::test]
    async fn test_issue_with_code_is_verifiable() {
        let (_clock, store) = setup();
        let owner = id("15551234567");
        let recorded = store.issue_with_code("424242", &owner).await.unwrap();
        assert_eq!(recorded.code, "424242");
        assert_eq!(recorded.expires_at - recorded.issued_at, Duration::minutes(10));

        store.verify("424242", &owner).await.unwrap();
    }

    #[tokio::test]
    async fn test_issue_with_code_rejects_malformed() {
        let (_clock, store) = setup();
        for bad in ["Failed", "", "12345", "1234567", "012345", "12a456"] {
            assert_eq!(
                store.issue_with_code(bad, &id("15551234567")).await.unwrap_err(),
                PairingError::MalformedCode(bad.to_string())
            );
        }
        assert_eq!(store.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_issue_with_code_honours_live_collision() {
        let (clock, store) = setup();
        store
            .issue_with_code("424242", &id("15551234567"))
            .await
            .unwrap();

        assert_eq!(
            store
                .issue_with_code("424242", &id("15559876543"))
                .await
                .unwrap_err(),
            PairingError::CodeInUse
        );

        clock.advance(Duration::minutes(11));
        store
            .issue_with_code("424242", &id("15559876543"))
            .await
            .unwrap();
        store.verify("424242", &id("15559876543")).await.unwrap();
    }

    #[tokio::test]
    async fn test_live_codes_are_unique() {
        let (_clock, store) = setup();
        let mut seen = HashSet::new();
        for n in 0..500 {
            let owner = id(&format!("1555000{:04}", n));
            let issued = store.issue(&owner).await.unwrap();
            assert!(seen.insert(issued.code), "duplicate live code issued");
        }
        assert_eq!(store.live_count().await, 500);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired() {
        let (clock, store) = setup();
        store.issue(&id("15551234567")).await.unwrap();
        clock.advance(Duration::minutes(6));
        store.issue(&id("15559876543")).await.unwrap();
        clock.advance(Duration::minutes(5));

        assert_eq!(store.sweep_expired().await, 1);
        assert_eq!(store.live_count().await, 1);
        assert_eq!(store.sweep_expired().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_issue_and_verify() {
        let (_clock, store) = setup();
        let store = Arc::new(store);
        let owner = id("15551234567");
        let issued = store.issue(&owner).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let owner = owner.clone();
            let code = issued.code.clone();
            handles.push(tokio::spawn(async move {
                store.verify(&code, &owner).await.is_ok()
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }
}
