//! Per-channel invite guard
//!
//! A channel may carry at most one outbound INVITE at a time. The guard is a
//! tri-state held in a single atomic; every transition is a compare-and-set,
//! except `reset`, which any teardown path uses unconditionally.

use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};

const IDLE: u8 = 0;
const INVITE_SENT: u8 = 1;
const ACTIVE: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InviteState {
    Idle,
    InviteSent,
    Active,
}

#[derive(Debug)]
pub struct InviteGuard {
    state: AtomicU8,
}

impl InviteGuard {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
        }
    }

    /// Idle -> InviteSent. Returns false if another invite already holds the guard.
    pub fn try_begin(&self) -> bool {
        self.state
            .compare_exchange(IDLE, INVITE_SENT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// InviteSent -> Active, after a 200 to the INVITE.
    pub fn complete(&self) -> bool {
        self.state
            .compare_exchange(INVITE_SENT, ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// InviteSent -> Idle, after a failed INVITE.
    pub fn rollback(&self) -> bool {
        self.state
            .compare_exchange(INVITE_SENT, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Any state -> Idle. Used by BYE paths.
    pub fn reset(&self) {
        self.state.store(IDLE, Ordering::Release);
    }

    pub fn state(&self) -> InviteState {
        match self.state.load(Ordering::Acquire) {
            INVITE_SENT => InviteState::InviteSent,
            ACTIVE => InviteState::Active,
            _ => InviteState::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state() == InviteState::Idle
    }
}

impl Default for InviteGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_lifecycle() {
        let guard = InviteGuard::new();
        assert!(guard.try_begin());
        assert_eq!(guard.state(), InviteState::InviteSent);
        assert!(!guard.try_begin());
        assert!(guard.complete());
        assert_eq!(guard.state(), InviteState::Active);
        assert!(!guard.rollback());
        guard.reset();
        assert!(guard.is_idle());
    }

    #[test]
    fn test_rollback_allows_next_invite() {
        let guard = InviteGuard::new();
        assert!(guard.try_begin());
        assert!(guard.rollback());
        assert!(guard.try_begin());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_winner_under_contention() {
        let guard = Arc::new(InviteGuard::new());
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let guard = guard.clone();
            tasks.push(tokio::spawn(async move { guard.try_begin() }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
