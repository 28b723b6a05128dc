//! Passcode guard
//!
//! Owns the attempt/lockout state machine on top of a [`SettingsStore`] and
//! a [`TrustedTimeProvider`]. Every read-modify-write of the settings record
//! runs under one async mutex, so concurrent attempts cannot interleave
//! their counter updates.

use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use chrono::{DateTime, Utc};
use passlock_core::{
    derive_credential, minutes_between, AttemptOutcome, CredentialHash, GuardState, LockoutPolicy,
    SecuritySettings,
};

use crate::device::DeviceIdentity;
use crate::error::{GuardError, Result};
use crate::store::SettingsStore;
use crate::time_source::TrustedTimeProvider;

/// Passcode guard
pub struct PasscodeGuard {
    /// Security settings persistence
    store: Arc<dyn SettingsStore>,

    /// Trusted time source
    clock: Arc<dyn TrustedTimeProvider>,

    /// Key material binding credentials to this install
    device: DeviceIdentity,

    /// Attempt threshold and cooldown
    policy: LockoutPolicy,

    /// Serializes read-modify-write cycles on the settings record
    op_lock: Mutex<()>,
}

impl PasscodeGuard {
    /// Create a guard with the default lockout policy
    pub fn new(
        store: Arc<dyn SettingsStore>,
        clock: Arc<dyn TrustedTimeProvider>,
        device: DeviceIdentity,
    ) -> Self {
        Self {
            store,
            clock,
            device,
            policy: LockoutPolicy::default(),
            op_lock: Mutex::new(()),
        }
    }

    /// Replace the lockout policy
    pub fn with_policy(mut self, policy: LockoutPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &LockoutPolicy {
        &self.policy
    }

    /// Derive and store a new credential, keeping the other settings.
    ///
    /// Returns the credential so callers can cache it, e.g. for biometric
    /// unlock.
    pub async fn set_passcode(&self, passcode: &str) -> Result<CredentialHash> {
        let credential = derive_credential(passcode, self.device.as_str())?;

        let _op = self.op_lock.lock().await;
        self.store
            .update(Box::new(move |s: &mut SecuritySettings| s.credential_hash = Some(credential)))
            .await?;

        info!("Passcode credential updated");
        Ok(credential)
    }

    /// Check a passcode attempt.
    ///
    /// Fails without touching the record when trusted time is unavailable,
    /// when no passcode is set, or while a lockout cooldown is running.
    /// Counter changes are persisted before a failure is returned.
    pub async fn verify(&self, passcode: &str) -> Result<CredentialHash> {
        let _op = self.op_lock.lock().await;

        let now = self.trusted_now().await?;
        let mut settings = self.store.read().await?.unwrap_or_default();

        let candidate = derive_credential(passcode, self.device.as_str())?;
        let outcome = self.policy.evaluate(&mut settings, &candidate, now);

        if outcome.mutates_settings() {
            self.persist_attempt(&settings).await?;
        }

        match outcome {
            AttemptOutcome::Accepted => {
                info!("Passcode verified");
                Ok(candidate)
            }
            AttemptOutcome::Rejected { attempts_remaining } => {
                warn!(
                    "Invalid passcode ({} attempts remaining)",
                    attempts_remaining
                );
                Err(GuardError::InvalidPasscode { attempts_remaining })
            }
            AttemptOutcome::Exhausted => {
                warn!(
                    "Passcode attempts exceeded, locked for {} minutes",
                    self.policy.cooldown_minutes
                );
                Err(GuardError::PasscodeAttemptsExceeded)
            }
            AttemptOutcome::LockedOut {
                retry_after_minutes,
            } => {
                warn!(
                    "Passcode attempt refused during lockout ({} minutes left)",
                    retry_after_minutes
                );
                Err(GuardError::LockedOut {
                    retry_after_minutes,
                })
            }
            AttemptOutcome::NoPasscode => Err(GuardError::PasscodeNotSet),
        }
    }

    /// Whole minutes since the last successful unlock.
    ///
    /// A record that was never unlocked is stamped with the current trusted
    /// time and reports 0. The result is negative if the stored time lies
    /// ahead of trusted time.
    pub async fn time_since_last_unlock(&self) -> Result<i64> {
        let _op = self.op_lock.lock().await;

        let now = self.trusted_now().await?;
        let settings = self.store.read().await?.unwrap_or_default();

        match settings.last_unlocked_at {
            Some(last_unlocked_at) => Ok(minutes_between(last_unlocked_at, now)),
            None => {
                self.store
                    .update(Box::new(move |s: &mut SecuritySettings| {
                        s.last_unlocked_at = Some(now);
                    }))
                    .await?;
                debug!("Initialized last unlock time");
                Ok(0)
            }
        }
    }

    /// Best-effort stamp of the last unlock time.
    ///
    /// An unreachable time source leaves the record as is and is not an
    /// error; store failures still are.
    pub async fn touch_last_unlocked(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;

        let now = match self.clock.now().await {
            Ok(now) => now,
            Err(e) => {
                warn!("Skipping last unlock update: {}", e);
                return Ok(());
            }
        };

        self.store
            .update(Box::new(move |s: &mut SecuritySettings| s.last_unlocked_at = Some(now)))
            .await?;
        Ok(())
    }

    /// Current guard state at trusted time, without changing anything
    pub async fn state(&self) -> Result<GuardState> {
        let now = self.trusted_now().await?;
        let settings = self.store.read().await?.unwrap_or_default();
        Ok(self.policy.state(&settings, now))
    }

    /// Current settings record, if one has been written
    pub async fn settings(&self) -> Result<Option<SecuritySettings>> {
        self.store.read().await
    }

    pub async fn has_passcode(&self) -> Result<bool> {
        Ok(self
            .store
            .read()
            .await?
            .map(|s| s.has_passcode())
            .unwrap_or(false))
    }

    /// Receive a snapshot after each settings write
    pub fn subscribe(&self) -> broadcast::Receiver<SecuritySettings> {
        self.store.subscribe()
    }

    async fn trusted_now(&self) -> Result<DateTime<Utc>> {
        self.clock.now().await.map_err(|e| {
            warn!("Trusted time unavailable: {}", e);
            GuardError::from(e)
        })
    }

    /// Write back the lockout fields of an evaluated record
    async fn persist_attempt(&self, settings: &SecuritySettings) -> Result<()> {
        let failed_attempts = settings.failed_attempts;
        let locked_at = settings.locked_at;
        let last_unlocked_at = settings.last_unlocked_at;

        self.store
            .update(Box::new(move |s: &mut SecuritySettings| {
                s.failed_attempts = failed_attempts;
                s.locked_at = locked_at;
                s.last_unlocked_at = last_unlocked_at;
            }))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySettingsStore;
    use crate::time_source::TimeError;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    const PASSCODE: &str = "135790";
    const WRONG: &str = "000000";

    /// Trusted clock driven by the test; `None` means offline
    struct ManualClock {
        now: std::sync::Mutex<Option<DateTime<Utc>>>,
    }

    impl ManualClock {
        fn at(time: DateTime<Utc>) -> Arc<Self> {
            Arc::new(Self {
                now: std::sync::Mutex::new(Some(time)),
            })
        }

        fn advance(&self, by: Duration) {
            let mut now = self.now.lock().unwrap();
            *now = now.map(|t| t + by);
        }

        fn set_now(&self, time: Option<DateTime<Utc>>) {
            *self.now.lock().unwrap() = time;
        }
    }

    #[async_trait]
    impl TrustedTimeProvider for ManualClock {
        async fn now(&self) -> std::result::Result<DateTime<Utc>, TimeError> {
            self.now
                .lock()
                .unwrap()
                .ok_or_else(|| TimeError::Unreachable("offline".to_string()))
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 29, 8, 0, 0).unwrap()
    }

    fn setup() -> (PasscodeGuard, Arc<MemorySettingsStore>, Arc<ManualClock>) {
        let store = Arc::new(MemorySettingsStore::new());
        let clock = ManualClock::at(t0());
        let guard = PasscodeGuard::new(
            store.clone(),
            clock.clone(),
            DeviceIdentity::new("test-device").unwrap(),
        );
        (guard, store, clock)
    }

    /// Fail attempts until the next wrong passcode triggers the lockout
    async fn lock_out(guard: &PasscodeGuard) {
        while let GuardState::Unlocked { attempts_remaining } = guard.state().await.unwrap() {
            if attempts_remaining <= 1 {
                break;
            }
            match guard.verify(WRONG).await {
                Err(GuardError::InvalidPasscode {
                    attempts_remaining: left,
                }) => assert_eq!(left, attempts_remaining - 1),
                other => panic!("unexpected result: {:?}", other),
            }
        }
        assert!(matches!(
            guard.verify(WRONG).await,
            Err(GuardError::PasscodeAttemptsExceeded)
        ));
    }

    #[tokio::test]
    async fn test_set_then_verify() {
        let (guard, store, _) = setup();

        let credential = guard.set_passcode(PASSCODE).await.unwrap();
        let verified = guard.verify(PASSCODE).await.unwrap();
        assert_eq!(credential, verified);

        let settings = store.read().await.unwrap().unwrap();
        assert_eq!(settings.failed_attempts, 0);
        assert_eq!(settings.last_unlocked_at, Some(t0()));
    }

    #[tokio::test]
    async fn test_set_passcode_preserves_other_fields() {
        let (guard, store, _) = setup();
        store
            .update(Box::new(|s: &mut SecuritySettings| s.last_unlocked_at = Some(t0())))
            .await
            .unwrap();

        guard.set_passcode(PASSCODE).await.unwrap();

        let settings = store.read().await.unwrap().unwrap();
        assert!(settings.has_passcode());
        assert_eq!(settings.last_unlocked_at, Some(t0()));
    }

    #[tokio::test]
    async fn test_set_passcode_notifies() {
        let (guard, _, _) = setup();
        let mut rx = guard.subscribe();

        let credential = guard.set_passcode(PASSCODE).await.unwrap();
        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.credential_hash, Some(credential));
    }

    #[tokio::test]
    async fn test_wrong_attempts_count_down_and_lock() {
        let (guard, store, _) = setup();
        guard.set_passcode(PASSCODE).await.unwrap();

        for expected in [4, 3, 2, 1] {
            match guard.verify(WRONG).await {
                Err(GuardError::InvalidPasscode { attempts_remaining }) => {
                    assert_eq!(attempts_remaining, expected)
                }
                other => panic!("unexpected result: {:?}", other),
            }
        }
        assert!(matches!(
            guard.verify(WRONG).await,
            Err(GuardError::PasscodeAttemptsExceeded)
        ));

        let settings = store.read().await.unwrap().unwrap();
        assert_eq!(settings.failed_attempts, 5);
        assert_eq!(settings.locked_at, Some(t0()));
    }

    #[tokio::test]
    async fn test_lockout_refuses_correct_passcode() {
        let (guard, store, _) = setup();
        guard.set_passcode(PASSCODE).await.unwrap();
        lock_out(&guard).await;

        assert!(matches!(
            guard.verify(PASSCODE).await,
            Err(GuardError::LockedOut {
                retry_after_minutes: 3
            })
        ));
        assert_eq!(store.read().await.unwrap().unwrap().failed_attempts, 5);
    }

    #[tokio::test]
    async fn test_lockout_boundary() {
        let (guard, store, clock) = setup();
        guard.set_passcode(PASSCODE).await.unwrap();
        lock_out(&guard).await;

        clock.advance(Duration::minutes(3));
        assert!(matches!(
            guard.verify(PASSCODE).await,
            Err(GuardError::LockedOut {
                retry_after_minutes: 0
            })
        ));

        clock.advance(Duration::minutes(1));
        guard.verify(PASSCODE).await.unwrap();

        let settings = store.read().await.unwrap().unwrap();
        assert_eq!(settings.failed_attempts, 0);
        assert!(settings.locked_at.is_none());
    }

    #[tokio::test]
    async fn test_time_unavailable_leaves_state() {
        let (guard, store, clock) = setup();
        guard.set_passcode(PASSCODE).await.unwrap();
        let _ = guard.verify(WRONG).await;
        let before = store.read().await.unwrap();

        clock.set_now(None);
        assert!(matches!(
            guard.verify(WRONG).await,
            Err(GuardError::TimeUnavailable(_))
        ));
        assert!(matches!(
            guard.time_since_last_unlock().await,
            Err(GuardError::TimeUnavailable(_))
        ));
        assert_eq!(store.read().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_locked_attempt_is_not_written() {
        let (guard, store, _) = setup();
        guard.set_passcode(PASSCODE).await.unwrap();
        lock_out(&guard).await;

        let mut rx = guard.subscribe();
        assert!(matches!(
            guard.verify(WRONG).await,
            Err(GuardError::LockedOut { .. })
        ));
        assert!(rx.try_recv().is_err());
        assert_eq!(store.read().await.unwrap().unwrap().failed_attempts, 5);
    }

    #[tokio::test]
    async fn test_verify_without_passcode() {
        let (guard, store, _) = setup();

        assert!(matches!(
            guard.verify(PASSCODE).await,
            Err(GuardError::PasscodeNotSet)
        ));
        assert!(store.read().await.unwrap().is_none());
        assert!(!guard.has_passcode().await.unwrap());
    }

    #[tokio::test]
    async fn test_time_since_last_unlock_bootstraps() {
        let (guard, store, clock) = setup();

        assert_eq!(guard.time_since_last_unlock().await.unwrap(), 0);
        assert_eq!(
            store.read().await.unwrap().unwrap().last_unlocked_at,
            Some(t0())
        );

        clock.advance(Duration::seconds(7 * 60 + 30));
        assert_eq!(guard.time_since_last_unlock().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_touch_last_unlocked_is_best_effort() {
        let (guard, store, clock) = setup();

        clock.set_now(None);
        guard.touch_last_unlocked().await.unwrap();
        assert!(store.read().await.unwrap().is_none());

        clock.set_now(Some(t0()));
        guard.touch_last_unlocked().await.unwrap();
        assert_eq!(
            store.read().await.unwrap().unwrap().last_unlocked_at,
            Some(t0())
        );
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (guard, store, clock) = setup();
        assert_eq!(guard.state().await.unwrap(), GuardState::NoPasscode);

        guard.set_passcode(PASSCODE).await.unwrap();
        assert!(matches!(
            guard.verify(WRONG).await,
            Err(GuardError::InvalidPasscode {
                attempts_remaining: 4
            })
        ));
        assert_eq!(
            guard.state().await.unwrap(),
            GuardState::Unlocked {
                attempts_remaining: 4
            }
        );

        // Continues from the existing counter
        lock_out(&guard).await;
        assert_eq!(store.read().await.unwrap().unwrap().failed_attempts, 5);
        assert_eq!(
            guard.state().await.unwrap(),
            GuardState::Locked {
                retry_after_minutes: 3
            }
        );

        clock.advance(Duration::minutes(5));
        assert_eq!(
            guard.state().await.unwrap(),
            GuardState::Unlocked {
                attempts_remaining: 5
            }
        );
    }

    #[tokio::test]
    async fn test_concurrent_wrong_attempts_serialize() {
        let (guard, store, _) = setup();
        guard.set_passcode(PASSCODE).await.unwrap();
        let guard = Arc::new(guard);

        let mut handles = Vec::new();
        for _ in 0..10 {
            let guard = Arc::clone(&guard);
            handles.push(tokio::spawn(async move { guard.verify(WRONG).await }));
        }

        let mut invalid = 0;
        let mut exceeded = 0;
        let mut locked = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Err(GuardError::InvalidPasscode { .. }) => invalid += 1,
                Err(GuardError::PasscodeAttemptsExceeded) => exceeded += 1,
                Err(GuardError::LockedOut { .. }) => locked += 1,
                other => panic!("unexpected result: {:?}", other),
            }
        }

        assert_eq!((invalid, exceeded, locked), (4, 1, 5));
        assert_eq!(store.read().await.unwrap().unwrap().failed_attempts, 5);
    }

    #[tokio::test]
    async fn test_custom_policy() {
        let (guard, _, _) = setup();
        let guard = guard.with_policy(LockoutPolicy::new(2, 1).unwrap());
        guard.set_passcode(PASSCODE).await.unwrap();

        assert!(matches!(
            guard.verify(WRONG).await,
            Err(GuardError::InvalidPasscode {
                attempts_remaining: 1
            })
        ));
        assert!(matches!(
            guard.verify(WRONG).await,
            Err(GuardError::PasscodeAttemptsExceeded)
        ));
        assert!(matches!(
            guard.verify(PASSCODE).await,
            Err(GuardError::LockedOut {
                retry_after_minutes: 1
            })
        ));
    }
}
