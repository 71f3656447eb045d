//! Rolling per-user and global transfer ceilings
//!
//! A reservation counts against both windows the moment it is taken. The
//! caller then confirms it (the relay accepted the lock) or releases it (the
//! submission failed), so a rejected transfer never burns headroom.
//!
//! Lock order is always user window, then global window. A user's window is
//! dropped once every entry in it has aged out, so the map only holds users
//! with activity inside the current period.

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::{LimitScope, TransferError};
use crate::metrics;

/// Sweep idle user windows after this many reservations
const EVICT_EVERY: u64 = 256;

#[derive(Debug, Clone)]
pub struct LimitConfig {
    /// Base units per user per period
    pub user_ceiling: U256,
    /// Base units across all users per period
    pub global_ceiling: U256,
    pub period: Duration,
}

#[derive(Debug, Clone)]
struct Entry {
    id: u64,
    amount: U256,
    at: DateTime<Utc>,
    confirmed: bool,
}

#[derive(Debug, Default)]
struct Window {
    entries: VecDeque<Entry>,
    total: U256,
}

impl Window {
    fn prune(&mut self, now: DateTime<Utc>, period: Duration) {
        while let Some(front) = self.entries.front() {
            if now - front.at < period {
                break;
            }
            self.total = self.total.saturating_sub(front.amount);
            self.entries.pop_front();
        }
    }

    fn headroom(&self, ceiling: U256) -> U256 {
        ceiling.saturating_sub(self.total)
    }

    fn push(&mut self, entry: Entry) {
        self.total = self.total.saturating_add(entry.amount);
        self.entries.push_back(entry);
    }

    fn remove(&mut self, id: u64) -> bool {
        match self.entries.iter().position(|e| e.id == id) {
            Some(index) => {
                if let Some(entry) = self.entries.remove(index) {
                    self.total = self.total.saturating_sub(entry.amount);
                }
                true
            }
            None => false,
        }
    }

    fn confirm(&mut self, id: u64) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) {
            entry.confirmed = true;
        }
    }

    fn provisional(&self) -> usize {
        self.entries.iter().filter(|e| !e.confirmed).count()
    }
}

fn lock(window: &Mutex<Window>) -> MutexGuard<'_, Window> {
    window.lock().unwrap_or_else(|p| p.into_inner())
}

/// Provisional hold on limit headroom. Hand it back to [`LimitGuard::confirm`]
/// or [`LimitGuard::release`].
#[derive(Debug, PartialEq, Eq)]
pub struct LimitReservation {
    pub id: u64,
    pub user: Address,
    pub amount: U256,
    pub at: DateTime<Utc>,
}

/// Remaining headroom, in base units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimitHeadroom {
    pub user: U256,
    pub global: U256,
}

pub struct LimitGuard {
    config: LimitConfig,
    users: Mutex<HashMap<Address, Arc<Mutex<Window>>>>,
    global: Mutex<Window>,
    next_id: AtomicU64,
    reservations: AtomicU64,
}

impl LimitGuard {
    pub fn new(config: LimitConfig) -> Self {
        Self {
            config,
            users: Mutex::new(HashMap::new()),
            global: Mutex::new(Window::default()),
            next_id: AtomicU64::new(1),
            reservations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &LimitConfig {
        &self.config
    }

    fn users(&self) -> MutexGuard<'_, HashMap<Address, Arc<Mutex<Window>>>> {
        self.users.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn user_window(&self, user: Address) -> Arc<Mutex<Window>> {
        self.users().entry(user).or_default().clone()
    }

    fn existing_window(&self, user: Address) -> Option<Arc<Mutex<Window>>> {
        self.users().get(&user).cloned()
    }

    pub fn check_and_reserve(
        &self,
        user: Address,
        amount: U256,
    ) -> Result<LimitReservation, TransferError> {
        self.check_and_reserve_at(user, amount, Utc::now())
    }

    /// Reserve `amount` against both windows as of `now`.
    pub fn check_and_reserve_at(
        &self,
        user: Address,
        amount: U256,
        now: DateTime<Utc>,
    ) -> Result<LimitReservation, TransferError> {
        let period = self.config.period;
        let user_window = self.user_window(user);
        let mut user_guard = lock(&user_window);
        user_guard.prune(now, period);

        let user_headroom = user_guard.headroom(self.config.user_ceiling);
        if amount > user_headroom {
            metrics::LIMIT_DENIALS.with_label_values(&["user"]).inc();
            info!(user = %user, %amount, remaining = %user_headroom, "User limit exceeded");
            return Err(TransferError::LimitExceeded {
                scope: LimitScope::User,
                remaining: user_headroom,
            });
        }

        let mut global_guard = lock(&self.global);
        global_guard.prune(now, period);

        let global_headroom = global_guard.headroom(self.config.global_ceiling);
        if amount > global_headroom {
            metrics::LIMIT_DENIALS.with_label_values(&["global"]).inc();
            info!(user = %user, %amount, remaining = %global_headroom, "Global limit exceeded");
            return Err(TransferError::LimitExceeded {
                scope: LimitScope::Global,
                remaining: global_headroom,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            id,
            amount,
            at: now,
            confirmed: false,
        };
        global_guard.push(entry.clone());
        user_guard.push(entry);
        drop(global_guard);
        drop(user_guard);
        let taken = self.reservations.fetch_add(1, Ordering::Relaxed) + 1;

        debug!(user = %user, %amount, reservation = id, "Limit headroom reserved");
        if taken % EVICT_EVERY == 0 {
            self.evict_idle(now);
        }
        Ok(LimitReservation {
            id,
            user,
            amount,
            at: now,
        })
    }

    /// The submission went through; the amount stays counted until it ages out.
    pub fn confirm(&self, reservation: LimitReservation) {
        if let Some(user_window) = self.existing_window(reservation.user) {
            lock(&user_window).confirm(reservation.id);
        }
        lock(&self.global).confirm(reservation.id);
    }

    /// The submission failed; give the headroom back.
    pub fn release(&self, reservation: LimitReservation) {
        let removed = match self.existing_window(reservation.user) {
            Some(user_window) => lock(&user_window).remove(reservation.id),
            None => false,
        };
        lock(&self.global).remove(reservation.id);
        if removed {
            debug!(
                user = %reservation.user,
                amount = %reservation.amount,
                reservation = reservation.id,
                "Limit reservation released"
            );
        }
    }

    pub fn remaining(&self, user: Address) -> LimitHeadroom {
        self.remaining_at(user, Utc::now())
    }

    /// Read-only: asking about a user never seen leaves no state behind.
    pub fn remaining_at(&self, user: Address, now: DateTime<Utc>) -> LimitHeadroom {
        let period = self.config.period;
        let user = match self.existing_window(user) {
            Some(user_window) => {
                let mut user_guard = lock(&user_window);
                user_guard.prune(now, period);
                user_guard.headroom(self.config.user_ceiling)
            }
            None => self.config.user_ceiling,
        };
        let mut global_guard = lock(&self.global);
        global_guard.prune(now, period);

        LimitHeadroom {
            user,
            global: global_guard.headroom(self.config.global_ceiling),
        }
    }

    /// Drop user windows with nothing left inside the period. Returns how many
    /// were dropped.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let period = self.config.period;
        let mut users = self.users();
        let before = users.len();
        users.retain(|_, window| {
            // Someone between lookup and lock still holds a clone
            if Arc::strong_count(window) > 1 {
                return true;
            }
            let mut guard = lock(window);
            guard.prune(now, period);
            !guard.entries.is_empty()
        });
        let evicted = before - users.len();
        if evicted > 0 {
            debug!(evicted, remaining = users.len(), "Idle limit windows evicted");
        }
        evicted
    }

    /// Users with a live window
    pub fn tracked_users(&self) -> usize {
        self.users().len()
    }

    /// Reservations ever taken
    pub fn reservation_count(&self) -> u64 {
        self.reservations.load(Ordering::Relaxed)
    }

    /// Reservations neither confirmed nor released
    pub fn provisional_count(&self) -> usize {
        lock(&self.global).provisional()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse_token_amount;

    fn units(raw: &str) -> U256 {
        parse_token_amount(raw, 18).unwrap()
    }

    fn guard() -> LimitGuard {
        LimitGuard::new(LimitConfig {
            user_ceiling: units("100"),
            global_ceiling: units("1000"),
            period: Duration::hours(24),
        })
    }

    fn alice() -> Address {
        Address::repeat_byte(0xa1)
    }

    #[test]
    fn test_reserve_reduces_headroom() {
        let limits = guard();
        let reservation = limits.check_and_reserve(alice(), units("0.1")).unwrap();
        limits.confirm(reservation);

        let headroom = limits.remaining(alice());
        assert_eq!(headroom.user, units("99.9"));
        assert_eq!(headroom.global, units("999.9"));
        assert_eq!(limits.reservation_count(), 1);
        assert_eq!(limits.provisional_count(), 0);
    }

    #[test]
    fn test_user_ceiling_enforced() {
        let limits = guard();
        let r = limits.check_and_reserve(alice(), units("60")).unwrap();
        limits.confirm(r);

        match limits.check_and_reserve(alice(), units("50")) {
            Err(TransferError::LimitExceeded { scope, remaining }) => {
                assert_eq!(scope, LimitScope::User);
                assert_eq!(remaining, units("40"));
            }
            other => panic!("expected user limit, got {:?}", other),
        }
        assert_eq!(limits.reservation_count(), 1);
    }

    #[test]
    fn test_global_ceiling_enforced() {
        let limits = LimitGuard::new(LimitConfig {
            user_ceiling: units("100"),
            global_ceiling: units("150"),
            period: Duration::hours(24),
        });
        limits
            .check_and_reserve(Address::repeat_byte(1), units("100"))
            .unwrap();

        let result = limits.check_and_reserve(Address::repeat_byte(2), units("60"));
        assert!(matches!(
            result,
            Err(TransferError::LimitExceeded { scope: LimitScope::Global, .. })
        ));
    }

    #[test]
    fn test_release_restores_headroom() {
        let limits = guard();
        let r = limits.check_and_reserve(alice(), units("100")).unwrap();
        assert_eq!(limits.remaining(alice()).user, U256::ZERO);
        assert_eq!(limits.provisional_count(), 1);

        limits.release(r);
        assert_eq!(limits.remaining(alice()).user, units("100"));
        assert_eq!(limits.remaining(alice()).global, units("1000"));
        assert_eq!(limits.provisional_count(), 0);
    }

    #[test]
    fn test_window_rolls() {
        let limits = guard();
        let t0 = Utc::now();
        let r = limits.check_and_reserve_at(alice(), units("100"), t0).unwrap();
        limits.confirm(r);

        assert!(limits
            .check_and_reserve_at(alice(), units("1"), t0 + Duration::hours(23))
            .is_err());
        assert!(limits
            .check_and_reserve_at(alice(), units("1"), t0 + Duration::hours(24))
            .is_ok());
    }

    #[test]
    fn test_concurrent_reservations_respect_global_ceiling() {
        let limits = Arc::new(LimitGuard::new(LimitConfig {
            user_ceiling: units("10"),
            global_ceiling: units("50"),
            period: Duration::hours(24),
        }));

        let handles: Vec<_> = (0..100u8)
            .map(|i| {
                let limits = limits.clone();
                std::thread::spawn(move || {
                    limits
                        .check_and_reserve(Address::repeat_byte(i), units("1"))
                        .is_ok()
                })
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 50);
        assert_eq!(limits.remaining(Address::repeat_byte(200)).global, U256::ZERO);
    }

    #[test]
    fn test_headroom_query_leaves_no_window() {
        let limits = guard();
        for i in 0..=255u8 {
            assert_eq!(limits.remaining(Address::repeat_byte(i)).user, units("100"));
        }
        assert_eq!(limits.tracked_users(), 0);
    }

    #[test]
    fn test_aged_out_windows_evicted() {
        let limits = guard();
        let t0 = Utc::now();
        for i in 0..10u8 {
            let r = limits
                .check_and_reserve_at(Address::repeat_byte(i), units("1"), t0)
                .unwrap();
            limits.confirm(r);
        }
        let recent = limits
            .check_and_reserve_at(alice(), units("1"), t0 + Duration::hours(20))
            .unwrap();
        assert_eq!(limits.tracked_users(), 11);

        // Still inside the period: nothing goes
        assert_eq!(limits.evict_idle(t0 + Duration::hours(1)), 0);

        assert_eq!(limits.evict_idle(t0 + Duration::hours(25)), 10);
        assert_eq!(limits.tracked_users(), 1);
        assert_eq!(
            limits.remaining_at(alice(), t0 + Duration::hours(25)).user,
            units("99")
        );

        // Releasing a reservation whose window survived still restores headroom
        limits.release(recent);
        assert_eq!(limits.remaining_at(alice(), t0 + Duration::hours(25)).user, units("100"));
    }

    #[test]
    fn test_released_windows_swept_periodically() {
        let limits = guard();
        let now = Utc::now();
        for i in 0..EVICT_EVERY {
            let mut raw = [0u8; 20];
            raw[12..].copy_from_slice(&i.to_be_bytes());
            let r = limits
                .check_and_reserve_at(Address::from(raw), units("1"), now)
                .unwrap();
            limits.release(r);
        }
        // The sweep ran while the last reservation was still held
        assert_eq!(limits.tracked_users(), 1);
    }
}
