//! Idle manager
//!
//! Arbitrates which quiescent tunnels may stop. A tunnel that has seen the
//! server idle for long enough asks to transition its slot to Wait; the
//! manager agrees only while more than `min_idle` slots are running. Waiting
//! slots are parked in their supervisors until woken.

use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Running,
    Wait,
}

pub struct IdleManager {
    min_idle: usize,
    states: Mutex<Vec<SlotState>>,
    wake: Notify,
}

impl IdleManager {
    pub fn new(connections: usize, min_idle: usize) -> Self {
        Self {
            min_idle,
            states: Mutex::new(vec![SlotState::Running; connections]),
            wake: Notify::new(),
        }
    }

    pub fn running_count(&self) -> usize {
        self.states
            .lock()
            .iter()
            .filter(|s| **s == SlotState::Running)
            .count()
    }

    pub fn is_waiting(&self, conn_id: usize) -> bool {
        self.states
            .lock()
            .get(conn_id)
            .map_or(false, |s| *s == SlotState::Wait)
    }

    pub fn set_running(&self, conn_id: usize) {
        if let Some(slot) = self.states.lock().get_mut(conn_id) {
            *slot = SlotState::Running;
        }
    }

    /// Grant the transition to Wait while enough other slots keep running.
    pub fn change_to_wait(&self, conn_id: usize) -> bool {
        let mut states = self.states.lock();
        let running = states
            .iter()
            .filter(|s| **s == SlotState::Running)
            .count();
        match states.get_mut(conn_id) {
            Some(slot) if *slot == SlotState::Running && running > self.min_idle => {
                *slot = SlotState::Wait;
                true
            }
            _ => false,
        }
    }

    /// Move one waiting slot back to Running and wake parked supervisors.
    /// Returns false when nothing was waiting.
    pub fn wake_waiting(&self) -> bool {
        let mut states = self.states.lock();
        if let Some(slot) = states.iter_mut().find(|s| **s == SlotState::Wait) {
            *slot = SlotState::Running;
            drop(states);
            self.wake.notify_waiters();
            return true;
        }
        false
    }

    /// Wake every parked supervisor, e.g. for shutdown.
    pub fn wake_all(&self) {
        self.wake.notify_waiters();
    }

    /// Park until this slot leaves the Wait state.
    pub async fn wait_for_wake(&self, conn_id: usize) {
        while self.is_waiting(conn_id) {
            self.wake.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_wait_only_above_min_idle() {
        let idle = IdleManager::new(3, 1);
        assert!(idle.change_to_wait(0));
        assert!(idle.change_to_wait(1));
        // Only one running slot left; the floor holds.
        assert!(!idle.change_to_wait(2));
        assert_eq!(idle.running_count(), 1);
    }

    #[test]
    fn waiting_slot_cannot_wait_again() {
        let idle = IdleManager::new(2, 0);
        assert!(idle.change_to_wait(0));
        assert!(!idle.change_to_wait(0));
    }

    #[test]
    fn wake_returns_a_slot_to_running() {
        let idle = IdleManager::new(2, 0);
        assert!(idle.change_to_wait(0));
        assert!(idle.is_waiting(0));
        assert!(idle.wake_waiting());
        assert!(!idle.is_waiting(0));
        assert!(!idle.wake_waiting());
    }

    #[tokio::test]
    async fn wait_for_wake_parks_until_woken() {
        let idle = std::sync::Arc::new(IdleManager::new(1, 0));
        assert!(idle.change_to_wait(0));

        let waiter = {
            let idle = idle.clone();
            tokio::spawn(async move { idle.wait_for_wake(0).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        // Retried until the waiter has registered with the notifier.
        loop {
            idle.wake_waiting();
            idle.wake_all();
            if waiter.is_finished() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}
