//! Attempt counting and lockout policy
//!
//! The guard's state machine lives here as pure functions over a
//! [`SecuritySettings`] record and a trusted timestamp. Expiry of a lockout
//! is evaluated lazily whenever the record is next examined; there is no
//! timer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::credential::CredentialHash;
use crate::error::{Error, Result};
use crate::settings::SecuritySettings;
use crate::{LOCKOUT_COOLDOWN_MINUTES, LOCKOUT_THRESHOLD};

/// Whole minutes from `earlier` to `later`, truncated toward zero.
///
/// Negative when `later` precedes `earlier`.
pub fn minutes_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
    (later - earlier).num_minutes()
}

/// Result of checking the lockout window before an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCheck {
    /// Below the attempt threshold
    Open,
    /// Threshold reached but the cooldown has elapsed
    Expired,
    /// Cooldown still running
    Locked { retry_after_minutes: u32 },
}

/// Outcome of a single passcode attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Credential matched; counter cleared and unlock time recorded
    Accepted,
    /// Wrong passcode, attempts remain
    Rejected { attempts_remaining: u32 },
    /// Wrong passcode and this attempt triggered the lockout
    Exhausted,
    /// Refused without checking the credential
    LockedOut { retry_after_minutes: u32 },
    /// No credential stored
    NoPasscode,
}

impl AttemptOutcome {
    /// Whether the attempt changed the settings record and must be persisted
    pub fn mutates_settings(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::Accepted
                | AttemptOutcome::Rejected { .. }
                | AttemptOutcome::Exhausted
        )
    }
}

/// Observable guard state at a point in trusted time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    NoPasscode,
    Unlocked { attempts_remaining: u32 },
    Locked { retry_after_minutes: u32 },
}

impl std::fmt::Display for GuardState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardState::NoPasscode => write!(f, "no passcode set"),
            GuardState::Unlocked { attempts_remaining } => {
                write!(f, "unlocked ({} attempts remaining)", attempts_remaining)
            }
            GuardState::Locked {
                retry_after_minutes,
            } => write!(f, "locked (retry in {} minutes)", retry_after_minutes),
        }
    }
}

/// Attempt threshold and cooldown window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutPolicy {
    /// Consecutive failures that trigger a lockout
    pub threshold: u32,

    /// Cooldown in minutes; inclusive, so the lock clears strictly after it
    pub cooldown_minutes: i64,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            threshold: LOCKOUT_THRESHOLD,
            cooldown_minutes: LOCKOUT_COOLDOWN_MINUTES,
        }
    }
}

impl LockoutPolicy {
    /// Create a custom policy
    pub fn new(threshold: u32, cooldown_minutes: i64) -> Result<Self> {
        if threshold == 0 {
            return Err(Error::InvalidPolicy(
                "threshold must be at least 1".to_string(),
            ));
        }
        if cooldown_minutes < 0 {
            return Err(Error::InvalidPolicy(format!(
                "cooldown must not be negative (got {})",
                cooldown_minutes
            )));
        }
        Ok(Self {
            threshold,
            cooldown_minutes,
        })
    }

    /// Check the lockout window at `now`
    pub fn check_lock(&self, settings: &SecuritySettings, now: DateTime<Utc>) -> LockCheck {
        if settings.failed_attempts < self.threshold {
            return LockCheck::Open;
        }

        // A saturated counter without a lock time cannot be timed; let it expire
        let Some(locked_at) = settings.locked_at else {
            return LockCheck::Expired;
        };

        let elapsed = minutes_between(locked_at, now);
        if elapsed <= self.cooldown_minutes {
            let retry = self.cooldown_minutes - elapsed;
            LockCheck::Locked {
                retry_after_minutes: u32::try_from(retry).unwrap_or(u32::MAX),
            }
        } else {
            LockCheck::Expired
        }
    }

    /// Attempts left before the next lockout
    pub fn attempts_remaining(&self, settings: &SecuritySettings) -> u32 {
        self.threshold.saturating_sub(settings.failed_attempts)
    }

    /// Reset the counter after a successful verification
    pub fn record_success(&self, settings: &mut SecuritySettings, now: DateTime<Utc>) {
        settings.failed_attempts = 0;
        settings.locked_at = None;
        settings.last_unlocked_at = Some(now);
    }

    /// Count a failed verification, locking when the threshold is reached
    pub fn record_failure(
        &self,
        settings: &mut SecuritySettings,
        now: DateTime<Utc>,
    ) -> AttemptOutcome {
        settings.failed_attempts = settings.failed_attempts.saturating_add(1);

        if settings.failed_attempts >= self.threshold {
            settings.locked_at = Some(now);
            AttemptOutcome::Exhausted
        } else {
            AttemptOutcome::Rejected {
                attempts_remaining: self.attempts_remaining(settings),
            }
        }
    }

    /// Run one verification attempt against `settings`.
    ///
    /// The lockout window is checked before the candidate is compared, so an
    /// attempt made during the cooldown is neither verified nor counted. An
    /// expired lockout is cleared in `settings` before the comparison. The
    /// caller persists `settings` when [`AttemptOutcome::mutates_settings`]
    /// is true.
    pub fn evaluate(
        &self,
        settings: &mut SecuritySettings,
        candidate: &CredentialHash,
        now: DateTime<Utc>,
    ) -> AttemptOutcome {
        let Some(stored) = settings.credential_hash else {
            return AttemptOutcome::NoPasscode;
        };

        match self.check_lock(settings, now) {
            LockCheck::Locked {
                retry_after_minutes,
            } => {
                return AttemptOutcome::LockedOut {
                    retry_after_minutes,
                }
            }
            LockCheck::Expired => {
                settings.failed_attempts = 0;
                settings.locked_at = None;
            }
            LockCheck::Open => {}
        }

        if stored.matches(candidate) {
            self.record_success(settings, now);
            AttemptOutcome::Accepted
        } else {
            self.record_failure(settings, now)
        }
    }

    /// Evaluate the observable state without mutating anything
    pub fn state(&self, settings: &SecuritySettings, now: DateTime<Utc>) -> GuardState {
        if !settings.has_passcode() {
            return GuardState::NoPasscode;
        }

        match self.check_lock(settings, now) {
            LockCheck::Locked {
                retry_after_minutes,
            } => GuardState::Locked {
                retry_after_minutes,
            },
            LockCheck::Expired => GuardState::Unlocked {
                attempts_remaining: self.threshold,
            },
            LockCheck::Open => GuardState::Unlocked {
                attempts_remaining: self.attempts_remaining(settings),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
    }

    fn good() -> CredentialHash {
        CredentialHash::new([7u8; 32])
    }

    fn bad() -> CredentialHash {
        CredentialHash::new([8u8; 32])
    }

    fn locked_settings(at: DateTime<Utc>) -> SecuritySettings {
        SecuritySettings {
            credential_hash: Some(good()),
            failed_attempts: LOCKOUT_THRESHOLD,
            locked_at: Some(at),
            last_unlocked_at: None,
        }
    }

    #[test]
    fn test_minutes_truncate() {
        assert_eq!(minutes_between(t0(), t0() + Duration::seconds(179)), 2);
        assert_eq!(minutes_between(t0(), t0() + Duration::seconds(180)), 3);
        assert_eq!(minutes_between(t0(), t0() - Duration::seconds(61)), -1);
    }

    #[test]
    fn test_failures_count_down_then_lock() {
        let policy = LockoutPolicy::default();
        let mut settings = SecuritySettings::with_credential(good());

        for expected in [4, 3, 2, 1] {
            let outcome = policy.evaluate(&mut settings, &bad(), t0());
            assert_eq!(
                outcome,
                AttemptOutcome::Rejected {
                    attempts_remaining: expected
                }
            );
            assert!(settings.locked_at.is_none());
        }

        let outcome = policy.evaluate(&mut settings, &bad(), t0());
        assert_eq!(outcome, AttemptOutcome::Exhausted);
        assert_eq!(settings.failed_attempts, 5);
        assert_eq!(settings.locked_at, Some(t0()));
    }

    #[test]
    fn test_locked_refuses_correct_passcode() {
        let policy = LockoutPolicy::default();
        let mut settings = locked_settings(t0());
        let before = settings.clone();

        let outcome = policy.evaluate(&mut settings, &good(), t0());
        assert_eq!(
            outcome,
            AttemptOutcome::LockedOut {
                retry_after_minutes: 3
            }
        );
        assert!(!outcome.mutates_settings());
        assert_eq!(settings, before);
    }

    #[test]
    fn test_cooldown_boundary_is_inclusive() {
        let policy = LockoutPolicy::default();
        let mut settings = locked_settings(t0());

        let at_three = t0() + Duration::minutes(3);
        assert_eq!(
            policy.evaluate(&mut settings, &good(), at_three),
            AttemptOutcome::LockedOut {
                retry_after_minutes: 0
            }
        );

        // 3m59s still truncates to 3 whole minutes
        let just_before_four = t0() + Duration::seconds(239);
        assert!(matches!(
            policy.check_lock(&settings, just_before_four),
            LockCheck::Locked { .. }
        ));

        let at_four = t0() + Duration::minutes(4);
        assert_eq!(
            policy.evaluate(&mut settings, &good(), at_four),
            AttemptOutcome::Accepted
        );
        assert_eq!(settings.failed_attempts, 0);
        assert!(settings.locked_at.is_none());
        assert_eq!(settings.last_unlocked_at, Some(at_four));
    }

    #[test]
    fn test_expired_lock_restarts_count() {
        let policy = LockoutPolicy::default();
        let mut settings = locked_settings(t0());

        let outcome = policy.evaluate(&mut settings, &bad(), t0() + Duration::minutes(10));
        assert_eq!(
            outcome,
            AttemptOutcome::Rejected {
                attempts_remaining: 4
            }
        );
        assert_eq!(settings.failed_attempts, 1);
        assert!(settings.locked_at.is_none());
    }

    #[test]
    fn test_lock_time_in_future_stays_locked() {
        let policy = LockoutPolicy::default();
        let settings = locked_settings(t0() + Duration::minutes(2));

        assert_eq!(
            policy.check_lock(&settings, t0()),
            LockCheck::Locked {
                retry_after_minutes: 5
            }
        );
    }

    #[test]
    fn test_saturated_counter_without_lock_time_expires() {
        let policy = LockoutPolicy::default();
        let mut settings = locked_settings(t0());
        settings.locked_at = None;

        assert_eq!(policy.check_lock(&settings, t0()), LockCheck::Expired);
        assert_eq!(
            policy.evaluate(&mut settings, &good(), t0()),
            AttemptOutcome::Accepted
        );
    }

    #[test]
    fn test_no_passcode() {
        let policy = LockoutPolicy::default();
        let mut settings = SecuritySettings::default();

        let outcome = policy.evaluate(&mut settings, &good(), t0());
        assert_eq!(outcome, AttemptOutcome::NoPasscode);
        assert!(!outcome.mutates_settings());
        assert_eq!(settings.failed_attempts, 0);
        assert_eq!(policy.state(&settings, t0()), GuardState::NoPasscode);
    }

    #[test]
    fn test_success_resets_partial_count() {
        let policy = LockoutPolicy::default();
        let mut settings = SecuritySettings::with_credential(good());
        settings.failed_attempts = 3;

        assert_eq!(
            policy.evaluate(&mut settings, &good(), t0()),
            AttemptOutcome::Accepted
        );
        assert_eq!(settings.failed_attempts, 0);
    }

    #[test]
    fn test_state_reporting() {
        let policy = LockoutPolicy::default();
        let mut settings = SecuritySettings::with_credential(good());
        settings.failed_attempts = 2;
        assert_eq!(
            policy.state(&settings, t0()),
            GuardState::Unlocked {
                attempts_remaining: 3
            }
        );

        let locked = locked_settings(t0());
        assert_eq!(
            policy.state(&locked, t0() + Duration::minutes(1)),
            GuardState::Locked {
                retry_after_minutes: 2
            }
        );
        assert_eq!(
            policy.state(&locked, t0() + Duration::minutes(4)),
            GuardState::Unlocked {
                attempts_remaining: 5
            }
        );
    }

    #[test]
    fn test_custom_policy_validation() {
        assert!(LockoutPolicy::new(0, 3).is_err());
        assert!(LockoutPolicy::new(3, -1).is_err());

        let policy = LockoutPolicy::new(2, 0).unwrap();
        let mut settings = SecuritySettings::with_credential(good());
        assert_eq!(
            policy.evaluate(&mut settings, &bad(), t0()),
            AttemptOutcome::Rejected {
                attempts_remaining: 1
            }
        );
        assert_eq!(
            policy.evaluate(&mut settings, &bad(), t0()),
            AttemptOutcome::Exhausted
        );
        // Zero cooldown still refuses within the same minute
        assert_eq!(
            policy.check_lock(&settings, t0() + Duration::seconds(59)),
            LockCheck::Locked {
                retry_after_minutes: 0
            }
        );
        assert_eq!(
            policy.check_lock(&settings, t0() + Duration::minutes(1)),
            LockCheck::Expired
        );
    }
}
