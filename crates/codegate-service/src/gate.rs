//! Quota gate: runs an action's ordered checks against both ledgers.
//!
//! Checks are evaluated in declaration order and the first failure
//! short-circuits. A volatile check consumes as it evaluates (the increment
//! is the check), and a durable check consumes through its conditional
//! update, so a passing check has already been charged by the time the next
//! one runs. Consumption from earlier checks is not rolled back when a later
//! check rejects: there is no atomicity across the set.

use std::sync::Arc;

use serde::Serialize;

use crate::clock::Clock;
use crate::ledger::{DurableLedger, LedgerError, VolatileLedger, reset_if_expired, volatile_key};
use crate::policy::{Action, LedgerKind, QuotaCheck, ResourceClass, WindowPolicy};
use crate::principal::Principal;

/// One passed check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub ledger: LedgerKind,
    pub resource_class: ResourceClass,
    pub remaining: u64,
    pub reset_in_secs: u64,
}

/// Outcome of running an action's checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted { grants: Vec<Grant> },
    Rejected {
        ledger: LedgerKind,
        resource_class: ResourceClass,
        retry_after_secs: u64,
    },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }

    /// The tightest grant: least remaining, ties broken by earliest reset.
    pub fn tightest(&self) -> Option<&Grant> {
        match self {
            Self::Admitted { grants } => grants
                .iter()
                .min_by_key(|g| (g.remaining, g.reset_in_secs)),
            Self::Rejected { .. } => None,
        }
    }
}

/// Usage of one (ledger, class) pair, read without consuming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub resource_class: ResourceClass,
    pub ledger: LedgerKind,
    pub limit: u64,
    pub window_seconds: u64,
    pub used: u64,
    pub remaining: u64,
    pub reset_in_secs: u64,
}

/// Orchestrates quota checks for actions.
///
/// Holds shared ledger handles; cloning is cheap.
#[derive(Clone)]
pub struct QuotaGate {
    policy: Arc<WindowPolicy>,
    volatile: Arc<dyn VolatileLedger>,
    durable: Arc<dyn DurableLedger>,
    clock: Arc<dyn Clock>,
}

impl QuotaGate {
    pub fn new(
        policy: Arc<WindowPolicy>,
        volatile: Arc<dyn VolatileLedger>,
        durable: Arc<dyn DurableLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy,
            volatile,
            durable,
            clock,
        }
    }

    pub fn policy(&self) -> &WindowPolicy {
        &self.policy
    }

    pub fn volatile(&self) -> &Arc<dyn VolatileLedger> {
        &self.volatile
    }

    pub fn durable(&self) -> &Arc<dyn DurableLedger> {
        &self.durable
    }

    /// Runs every check `action` declares for `principal`'s class.
    pub async fn admit(
        &self,
        principal: &Principal,
        action: Action,
    ) -> Result<Admission, LedgerError> {
        let checks = self.policy.checks_for(action, principal.class);
        self.evaluate(principal, &checks).await
    }

    /// Runs `checks` in order, stopping at the first rejection.
    pub async fn evaluate(
        &self,
        principal: &Principal,
        checks: &[QuotaCheck],
    ) -> Result<Admission, LedgerError> {
        let mut grants = Vec::with_capacity(checks.len());
        for check in checks {
            match self.run_check(principal, check).await? {
                Ok(grant) => grants.push(grant),
                Err(retry_after_secs) => {
                    tracing::info!(
                        principal = %principal.id,
                        class = %check.resource_class,
                        ledger = ?check.ledger,
                        retry_after_secs,
                        "Quota exceeded"
                    );
                    return Ok(Admission::Rejected {
                        ledger: check.ledger,
                        resource_class: check.resource_class,
                        retry_after_secs,
                    });
                }
            }
        }
        tracing::debug!(principal = %principal.id, checks = grants.len(), "Admitted");
        Ok(Admission::Admitted { grants })
    }

    /// `Ok(Err(retry_after))` is a rejection.
    async fn run_check(
        &self,
        principal: &Principal,
        check: &QuotaCheck,
    ) -> Result<Result<Grant, u64>, LedgerError> {
        match check.ledger {
            LedgerKind::Volatile => {
                let key = volatile_key(&principal.id, check.resource_class);
                let decision = self
                    .volatile
                    .check_and_consume(&key, check.limit, check.window_secs)
                    .await?;
                if !decision.allowed {
                    return Ok(Err(decision.reset_in_secs.max(1)));
                }
                Ok(Ok(Grant {
                    ledger: LedgerKind::Volatile,
                    resource_class: check.resource_class,
                    remaining: decision.remaining,
                    reset_in_secs: decision.reset_in_secs,
                }))
            }
            LedgerKind::Durable => {
                let now = self.clock.now_secs();
                let stored = self
                    .durable
                    .fetch_or_create(
                        &principal.id,
                        check.resource_class,
                        check.limit,
                        check.window_secs,
                        now,
                    )
                    .await?;
                let current = reset_if_expired(&stored, now, check.window_secs);
                let current = if current == stored {
                    current
                } else {
                    self.durable.store_reset(&current).await?
                };

                let outcome = self.durable.try_consume(&current).await?;
                // Another caller may have rolled the period since `now`.
                let reset_in_secs = outcome.record.reset_in_secs(self.clock.now_secs());
                if !outcome.admitted {
                    return Ok(Err(reset_in_secs.max(1)));
                }
                Ok(Ok(Grant {
                    ledger: LedgerKind::Durable,
                    resource_class: check.resource_class,
                    remaining: outcome.record.remaining(),
                    reset_in_secs,
                }))
            }
        }
    }

    /// Read-only snapshot of every (ledger, class) pair any action checks.
    pub async fn usage(&self, principal: &Principal) -> Result<Vec<QuotaUsage>, LedgerError> {
        let now = self.clock.now_secs();
        let mut pairs: Vec<(LedgerKind, ResourceClass)> = Vec::new();
        for action in Action::ALL {
            for pair in action.declared_checks() {
                if !pairs.contains(pair) {
                    pairs.push(*pair);
                }
            }
        }

        let mut usage = Vec::with_capacity(pairs.len());
        for (ledger, resource_class) in pairs {
            let window = self.policy.lookup(resource_class, principal.class);
            let (limit, used, reset_in_secs) = match ledger {
                LedgerKind::Volatile => {
                    let key = volatile_key(&principal.id, resource_class);
                    match self.volatile.peek(&key).await? {
                        Some(u) => (window.limit, u.count, u.reset_in_secs),
                        None => (window.limit, 0, window.window_seconds),
                    }
                }
                LedgerKind::Durable => {
                    match self.durable.fetch(&principal.id, resource_class).await? {
                        Some(r) if !r.is_expired(now) => (r.limit, r.count, r.reset_in_secs(now)),
                        Some(r) => (r.limit, 0, window.window_seconds),
                        None => (window.limit, 0, window.window_seconds),
                    }
                }
            };
            usage.push(QuotaUsage {
                resource_class,
                ledger,
                limit,
                window_seconds: window.window_seconds,
                used: used.min(limit),
                remaining: limit.saturating_sub(used),
                reset_in_secs,
            });
        }
        Ok(usage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::{MemoryDurableLedger, MemoryVolatileLedger};
    use crate::policy::{ClassWindows, Window};
    use crate::principal::PrincipalClass;

    const DAY: u64 = 86_400;

    struct Fixture {
        gate: QuotaGate,
        clock: ManualClock,
    }

    fn fixture(overrides: Vec<(ResourceClass, ClassWindows)>) -> Fixture {
        let clock = ManualClock::new(0);
        let policy = WindowPolicy::with_overrides(overrides).unwrap();
        let gate = QuotaGate::new(
            Arc::new(policy),
            Arc::new(MemoryVolatileLedger::new(Arc::new(clock.clone()))),
            Arc::new(MemoryDurableLedger::new()),
            Arc::new(clock.clone()),
        );
        Fixture { gate, clock }
    }

    fn two_per_day(class: ResourceClass) -> (ResourceClass, ClassWindows) {
        (
            class,
            ClassWindows {
                authenticated: Window::new(2, DAY),
                guest: Window::new(0, DAY),
            },
        )
    }

    fn alice() -> Principal {
        Principal::authenticated("alice")
    }

    fn remaining(admission: &Admission) -> u64 {
        admission.tightest().unwrap().remaining
    }

    #[tokio::test]
    async fn durable_daily_timeline() {
        let f = fixture(vec![two_per_day(ResourceClass::FileCreation)]);
        let p = alice();

        let a = f.gate.admit(&p, Action::FileCreation).await.unwrap();
        assert_eq!(remaining(&a), 1);

        f.clock.set(10);
        let a = f.gate.admit(&p, Action::FileCreation).await.unwrap();
        assert_eq!(remaining(&a), 0);

        f.clock.set(20);
        let a = f.gate.admit(&p, Action::FileCreation).await.unwrap();
        assert_eq!(
            a,
            Admission::Rejected {
                ledger: LedgerKind::Durable,
                resource_class: ResourceClass::FileCreation,
                retry_after_secs: 86_380,
            }
        );

        f.clock.set(86_401);
        let a = f.gate.admit(&p, Action::FileCreation).await.unwrap();
        assert!(a.is_admitted());
        assert_eq!(remaining(&a), 1);
    }

    #[tokio::test]
    async fn volatile_daily_timeline() {
        let f = fixture(vec![two_per_day(ResourceClass::CodeSuggestion)]);
        let p = alice();

        for (t, left) in [(0, 1), (10, 0)] {
            f.clock.set(t);
            let a = f.gate.admit(&p, Action::CodeSuggestion).await.unwrap();
            assert_eq!(remaining(&a), left);
        }

        f.clock.set(20);
        let a = f.gate.admit(&p, Action::CodeSuggestion).await.unwrap();
        assert!(matches!(
            a,
            Admission::Rejected {
                retry_after_secs: 86_380,
                ..
            }
        ));

        f.clock.set(86_401);
        let a = f.gate.admit(&p, Action::CodeSuggestion).await.unwrap();
        assert_eq!(remaining(&a), 1);
    }

    #[tokio::test]
    async fn limit_plus_one_is_rejected() {
        let f = fixture(vec![]);
        let p = alice();
        for _ in 0..5 {
            assert!(f.gate.admit(&p, Action::CodeConversion).await.unwrap().is_admitted());
        }
        let a = f.gate.admit(&p, Action::CodeConversion).await.unwrap();
        assert!(matches!(
            a,
            Admission::Rejected {
                resource_class: ResourceClass::CodeConversion,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn first_failure_short_circuits_later_checks() {
        let f = fixture(vec![]);
        let p = alice();
        for _ in 0..10 {
            f.gate.admit(&p, Action::AiAssistant).await.unwrap();
        }
        let a = f.gate.admit(&p, Action::AiAssistant).await.unwrap();
        assert!(matches!(
            a,
            Admission::Rejected {
                resource_class: ResourceClass::AiAssistant,
                ..
            }
        ));

        // The daily counter saw the ten admitted calls only.
        let daily = f
            .gate
            .volatile()
            .peek(&volatile_key("alice", ResourceClass::AiDaily))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(daily.count, 10);
    }

    #[tokio::test]
    async fn daily_quota_governs_when_hourly_windows_roll() {
        let f = fixture(vec![]);
        let p = alice();
        let mut admitted = 0;
        for hour in 0..5 {
            f.clock.set(hour * 3_601);
            for _ in 0..10 {
                if f.gate.admit(&p, Action::AiAssistant).await.unwrap().is_admitted() {
                    admitted += 1;
                }
            }
        }
        assert_eq!(admitted, 30);
    }

    #[tokio::test]
    async fn stricter_ledger_governs_conversion() {
        let f = fixture(vec![(
            ResourceClass::CodeConversion,
            ClassWindows {
                authenticated: Window::new(2, DAY),
                guest: Window::new(0, DAY),
            },
        )]);
        let p = alice();
        f.gate.admit(&p, Action::CodeConversion).await.unwrap();
        f.gate.admit(&p, Action::CodeConversion).await.unwrap();

        // At t=DAY the volatile counter has expired but the durable period,
        // whose end instant is inclusive, has not.
        f.clock.set(DAY);
        let a = f.gate.admit(&p, Action::CodeConversion).await.unwrap();
        assert!(matches!(
            a,
            Admission::Rejected {
                ledger: LedgerKind::Durable,
                ..
            }
        ));
    }

    /// Spawns `racers` concurrent file-creation admissions for alice and
    /// returns how many were admitted.
    async fn race_file_creation(gate: &QuotaGate, racers: usize) -> usize {
        let tasks: Vec<_> = (0..racers)
            .map(|_| {
                let gate = gate.clone();
                tokio::spawn(async move { gate.admit(&alice(), Action::FileCreation).await })
            })
            .collect();
        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap().unwrap().is_admitted() {
                admitted += 1;
            }
        }
        admitted
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admissions_at_last_slot_admit_one() {
        let f = fixture(vec![]);
        let p = alice();
        for _ in 0..4 {
            assert!(f.gate.admit(&p, Action::FileCreation).await.unwrap().is_admitted());
        }

        assert_eq!(race_file_creation(&f.gate, 32).await, 1);

        let stored = f
            .gate
            .durable()
            .fetch("alice", ResourceClass::FileCreation)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.count, stored.limit);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admissions_across_expired_period_reset_once() {
        let f = fixture(vec![two_per_day(ResourceClass::FileCreation)]);
        let p = alice();
        f.gate.admit(&p, Action::FileCreation).await.unwrap();
        f.gate.admit(&p, Action::FileCreation).await.unwrap();

        // Every racer sees the exhausted, expired period and tries to reset it.
        f.clock.set(DAY + 1);
        assert_eq!(race_file_creation(&f.gate, 32).await, 2);

        let stored = f
            .gate
            .durable()
            .fetch("alice", ResourceClass::FileCreation)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.count, 2);
        assert_eq!(stored.period_start, DAY + 1);
    }

    #[tokio::test]
    async fn retry_after_follows_the_clock_at_rejection() {
        let f = fixture(vec![two_per_day(ResourceClass::FileCreation)]);
        let p = alice();
        f.gate.admit(&p, Action::FileCreation).await.unwrap();
        f.gate.admit(&p, Action::FileCreation).await.unwrap();

        f.clock.set(DAY - 5);
        let a = f.gate.admit(&p, Action::FileCreation).await.unwrap();
        assert!(matches!(
            a,
            Admission::Rejected {
                retry_after_secs: 5,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn guest_limits_are_below_authenticated() {
        let f = fixture(vec![]);
        let guest = Principal::guest(Some("192.0.2.1".parse().unwrap()));
        let user = alice();

        let mut guest_admits = 0;
        let mut user_admits = 0;
        for _ in 0..100 {
            if f.gate.admit(&guest, Action::CodeSuggestion).await.unwrap().is_admitted() {
                guest_admits += 1;
            }
            if f.gate.admit(&user, Action::CodeSuggestion).await.unwrap().is_admitted() {
                user_admits += 1;
            }
        }
        assert_eq!(guest_admits, 20);
        assert_eq!(user_admits, 60);
        assert!(guest_admits < user_admits);
    }

    #[tokio::test]
    async fn usage_reports_without_consuming() {
        let f = fixture(vec![]);
        let p = alice();
        f.gate.admit(&p, Action::CodeConversion).await.unwrap();

        let first = f.gate.usage(&p).await.unwrap();
        let second = f.gate.usage(&p).await.unwrap();
        assert_eq!(first, second);

        let durable = first
            .iter()
            .find(|u| {
                u.ledger == LedgerKind::Durable && u.resource_class == ResourceClass::CodeConversion
            })
            .unwrap();
        assert_eq!(durable.used, 1);
        assert_eq!(durable.remaining, 4);

        let files = first
            .iter()
            .find(|u| u.resource_class == ResourceClass::FileCreation)
            .unwrap();
        assert_eq!(files.used, 0);
        assert_eq!(files.limit, 5);
    }

    #[tokio::test]
    async fn guest_usage_uses_guest_windows() {
        let f = fixture(vec![]);
        let guest = Principal::guest(None);
        assert_eq!(guest.class, PrincipalClass::Guest);
        let usage = f.gate.usage(&guest).await.unwrap();
        let suggestion = usage
            .iter()
            .find(|u| u.resource_class == ResourceClass::CodeSuggestion)
            .unwrap();
        assert_eq!(suggestion.limit, 20);
    }
}
