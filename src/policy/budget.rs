//! Daily spend ledger
//!
//! Per-tenant and per-route counters in micro-dollars behind one mutex. A
//! reservation checks both caps and commits to both counters under the same
//! lock, so concurrent reservations are serialized and never over-commit.
//! The ledger represents a single UTC day and clears itself when the first
//! operation of a new day arrives.

use crate::domain::{MicroUsd, RouteName, TenantName};
use crate::telemetry::TelemetryEvent;
use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// A committed reservation; settle it with [`BudgetLedger::finalize`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub day: NaiveDate,
    pub amount: MicroUsd,
    pub tenant_before: MicroUsd,
    pub route_before: MicroUsd,
}

/// Both spend values at the moment a reservation was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetRejection {
    pub tenant_before: MicroUsd,
    pub route_before: MicroUsd,
}

#[derive(Debug)]
struct LedgerState {
    day: NaiveDate,
    tenants: HashMap<TenantName, MicroUsd>,
    routes: HashMap<RouteName, MicroUsd>,
}

impl LedgerState {
    fn new(day: NaiveDate) -> Self {
        Self {
            day,
            tenants: HashMap::new(),
            routes: HashMap::new(),
        }
    }

    fn roll_to(&mut self, day: NaiveDate) {
        if self.day != day {
            info!(from = %self.day, to = %day, "Budget ledger rolled over to a new day");
            *self = Self::new(day);
        }
    }

    fn tenant(&self, tenant: &TenantName) -> MicroUsd {
        self.tenants.get(tenant).copied().unwrap_or_default()
    }

    fn route(&self, route: &RouteName) -> MicroUsd {
        self.routes.get(route).copied().unwrap_or_default()
    }

    fn add(&mut self, tenant: &TenantName, route: &RouteName, amount: MicroUsd) {
        let spent = self.tenants.entry(tenant.clone()).or_default();
        *spent = spent.saturating_add(amount);
        let spent = self.routes.entry(route.clone()).or_default();
        *spent = spent.saturating_add(amount);
    }

    fn apply_delta(&mut self, tenant: &TenantName, route: &RouteName, delta: i128) {
        let spent = self.tenants.entry(tenant.clone()).or_default();
        *spent = spent.apply_delta(delta);
        let spent = self.routes.entry(route.clone()).or_default();
        *spent = spent.apply_delta(delta);
    }
}

#[derive(Debug)]
pub struct BudgetLedger {
    state: Mutex<LedgerState>,
}

impl Default for BudgetLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

impl BudgetLedger {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::new(today())),
        }
    }

    pub fn tenant_spend(&self, tenant: &TenantName) -> MicroUsd {
        let mut state = self.state.lock();
        state.roll_to(today());
        state.tenant(tenant)
    }

    pub fn route_spend(&self, route: &RouteName) -> MicroUsd {
        let mut state = self.state.lock();
        state.roll_to(today());
        state.route(route)
    }

    /// Reserve `estimate` against both caps, or change nothing.
    ///
    /// A route without its own cap is only bounded by the tenant cap.
    pub fn check_and_reserve(
        &self,
        tenant: &TenantName,
        route: &RouteName,
        estimate: MicroUsd,
        route_cap: Option<MicroUsd>,
        tenant_cap: MicroUsd,
    ) -> Result<Reservation, BudgetRejection> {
        let mut state = self.state.lock();
        state.roll_to(today());

        let tenant_before = state.tenant(tenant);
        let route_before = state.route(route);
        let tenant_after = tenant_before.saturating_add(estimate);
        let route_after = route_before.saturating_add(estimate);

        let within_tenant = tenant_after <= tenant_cap;
        let within_route = !matches!(route_cap, Some(cap) if route_after > cap);
        if !(within_tenant && within_route) {
            debug!(
                tenant = %tenant,
                route = %route,
                estimate = %estimate,
                tenant_before = %tenant_before,
                route_before = %route_before,
                "Budget reservation rejected"
            );
            return Err(BudgetRejection {
                tenant_before,
                route_before,
            });
        }

        state.add(tenant, route, estimate);
        Ok(Reservation {
            day: state.day,
            amount: estimate,
            tenant_before,
            route_before,
        })
    }

    /// Settle a reservation at the realized cost; never rejected.
    ///
    /// A reservation made on a previous day was cleared by the rollover, so
    /// the realized cost is recorded in full against the current day.
    pub fn finalize(
        &self,
        tenant: &TenantName,
        route: &RouteName,
        reservation: &Reservation,
        final_cost: MicroUsd,
    ) {
        let mut state = self.state.lock();
        state.roll_to(today());
        if reservation.day == state.day {
            state.apply_delta(tenant, route, final_cost.delta_from(reservation.amount));
        } else {
            state.add(tenant, route, final_cost);
        }
    }

    /// Add spend that was never reserved (routes without a policy)
    pub fn record(&self, tenant: &TenantName, route: &RouteName, amount: MicroUsd) {
        let mut state = self.state.lock();
        state.roll_to(today());
        state.add(tenant, route, amount);
    }

    /// Clear both maps and replay today's persisted events.
    ///
    /// Each event counts at its realized cost, or at its estimate when it
    /// never settled. Duplicate event ids are counted once.
    pub fn rebuild_from_rows(&self, events: &[TelemetryEvent]) {
        self.rebuild_for_day(today(), events);
    }

    fn rebuild_for_day(&self, day: NaiveDate, events: &[TelemetryEvent]) {
        let mut fresh = LedgerState::new(day);
        let mut seen = HashSet::new();
        let mut replayed = 0usize;

        for event in events {
            if event.timestamp.date_naive() != day || !seen.insert(event.id) {
                continue;
            }
            let (Some(tenant), Some(route)) = (&event.tenant, &event.route) else {
                continue;
            };
            fresh.add(tenant, route, event.replay_cost());
            replayed += 1;
        }

        *self.state.lock() = fresh;
        info!(events = replayed, %day, "Budget ledger rebuilt from telemetry");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{TelemetryEvent, TelemetryOutcome};
    use chrono::Duration;

    fn tenant() -> TenantName {
        TenantName::try_new("acme".to_string()).unwrap()
    }

    fn route(name: &str) -> RouteName {
        RouteName::try_new(name.to_string()).unwrap()
    }

    fn usd(amount: f64) -> MicroUsd {
        MicroUsd::from_usd(amount)
    }

    fn settled_event(route_name: &str, est: f64, final_cost: Option<f64>) -> TelemetryEvent {
        let mut event = TelemetryEvent::new(TelemetryOutcome::Success);
        event.tenant = Some(tenant());
        event.route = Some(route(route_name));
        event.allowed = true;
        event.est_cost_usd = est;
        event.final_cost_usd = final_cost;
        event
    }

    #[test]
    fn second_reservation_over_the_tenant_cap_is_rejected() {
        let ledger = BudgetLedger::new();
        let first = ledger
            .check_and_reserve(&tenant(), &route("chat"), usd(6.0), Some(usd(10.0)), usd(10.0))
            .unwrap();
        assert_eq!(first.tenant_before, MicroUsd::ZERO);

        let rejected = ledger
            .check_and_reserve(&tenant(), &route("chat"), usd(5.0), Some(usd(10.0)), usd(10.0))
            .unwrap_err();
        assert_eq!(rejected.tenant_before, usd(6.0));
        assert_eq!(rejected.route_before, usd(6.0));
        assert_eq!(ledger.tenant_spend(&tenant()), usd(6.0));
    }

    #[test]
    fn concurrent_reservations_never_overcommit() {
        const THREADS: u64 = 16;
        const ATTEMPTS: u64 = 500;
        let ledger = BudgetLedger::new();
        let cap = MicroUsd::from_micros(10_000);
        let step = MicroUsd::from_micros(7);

        let committed: u64 = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..THREADS)
                .map(|worker| {
                    let ledger = &ledger;
                    let route = route(if worker % 2 == 0 { "chat" } else { "embed" });
                    scope.spawn(move || {
                        (0..ATTEMPTS)
                            .filter(|_| {
                                ledger
                                    .check_and_reserve(&tenant(), &route, step, Some(cap), cap)
                                    .is_ok()
                            })
                            .count() as u64
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).sum()
        });

        let spend = ledger.tenant_spend(&tenant());
        assert!(spend <= cap);
        assert_eq!(spend, MicroUsd::from_micros(7 * committed));
        assert_eq!(committed, 10_000 / 7);
        assert_eq!(
            ledger
                .route_spend(&route("chat"))
                .saturating_add(ledger.route_spend(&route("embed"))),
            spend
        );
    }

    #[test]
    fn route_cap_rejection_leaves_tenant_untouched() {
        let ledger = BudgetLedger::new();
        assert!(ledger
            .check_and_reserve(&tenant(), &route("chat"), usd(2.0), Some(usd(1.0)), usd(10.0))
            .is_err());
        assert_eq!(ledger.tenant_spend(&tenant()), MicroUsd::ZERO);
        assert_eq!(ledger.route_spend(&route("chat")), MicroUsd::ZERO);
    }

    #[test]
    fn zero_tenant_cap_admits_only_free_requests() {
        let ledger = BudgetLedger::new();
        assert!(ledger
            .check_and_reserve(&tenant(), &route("chat"), MicroUsd::ZERO, None, MicroUsd::ZERO)
            .is_ok());
        assert!(ledger
            .check_and_reserve(&tenant(), &route("chat"), MicroUsd::from_micros(1), None, MicroUsd::ZERO)
            .is_err());
    }

    #[test]
    fn finalize_applies_signed_delta() {
        let ledger = BudgetLedger::new();
        let reservation = ledger
            .check_and_reserve(&tenant(), &route("chat"), usd(2.0), None, usd(10.0))
            .unwrap();
        ledger.finalize(&tenant(), &route("chat"), &reservation, usd(0.5));
        assert_eq!(ledger.tenant_spend(&tenant()), usd(0.5));

        let reservation = ledger
            .check_and_reserve(&tenant(), &route("chat"), usd(1.0), None, usd(10.0))
            .unwrap();
        ledger.finalize(&tenant(), &route("chat"), &reservation, usd(3.0));
        assert_eq!(ledger.tenant_spend(&tenant()), usd(3.5));
        assert_eq!(ledger.route_spend(&route("chat")), usd(3.5));
    }

    #[test]
    fn rebuild_counts_final_or_estimate_for_today_only() {
        let ledger = BudgetLedger::new();
        ledger.record(&tenant(), &route("stale"), usd(99.0));

        let mut yesterday = settled_event("chat", 4.0, Some(4.0));
        yesterday.timestamp -= Duration::days(1);
        let events = vec![
            settled_event("chat", 2.0, Some(1.5)),
            settled_event("embed", 0.25, None),
            yesterday,
        ];
        ledger.rebuild_from_rows(&events);

        assert_eq!(ledger.tenant_spend(&tenant()), usd(1.75));
        assert_eq!(ledger.route_spend(&route("chat")), usd(1.5));
        assert_eq!(ledger.route_spend(&route("embed")), usd(0.25));
        assert_eq!(ledger.route_spend(&route("stale")), MicroUsd::ZERO);
    }

    #[test]
    fn replaying_twice_matches_replaying_once() {
        let events = vec![
            settled_event("chat", 2.0, Some(1.5)),
            settled_event("chat", 0.5, None),
        ];
        let once = BudgetLedger::new();
        once.rebuild_from_rows(&events);

        let twice = BudgetLedger::new();
        twice.rebuild_from_rows(&events);
        twice.rebuild_from_rows(&events);

        let doubled: Vec<TelemetryEvent> = events.iter().chain(events.iter()).cloned().collect();
        let duplicated = BudgetLedger::new();
        duplicated.rebuild_from_rows(&doubled);

        let expected = once.tenant_spend(&tenant());
        assert_eq!(twice.tenant_spend(&tenant()), expected);
        assert_eq!(duplicated.tenant_spend(&tenant()), expected);
    }

    #[test]
    fn stale_ledger_resets_on_new_day() {
        let ledger = BudgetLedger::new();
        ledger.record(&tenant(), &route("chat"), usd(5.0));
        ledger.state.lock().day -= Duration::days(1);
        assert_eq!(ledger.tenant_spend(&tenant()), MicroUsd::ZERO);
    }

    #[test]
    fn reservation_from_previous_day_settles_in_full() {
        let ledger = BudgetLedger::new();
        let mut reservation = ledger
            .check_and_reserve(&tenant(), &route("chat"), usd(2.0), None, usd(10.0))
            .unwrap();
        reservation.day -= Duration::days(1);
        ledger.state.lock().day -= Duration::days(1);

        ledger.finalize(&tenant(), &route("chat"), &reservation, usd(1.0));
        assert_eq!(ledger.tenant_spend(&tenant()), usd(1.0));
    }
}
