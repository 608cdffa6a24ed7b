//! Connectivity state machine
//!
//! Tracks the WiFi association and DHCP lease that the uplink tasks depend on.
//! The firmware feeds events in and executes the actions returned by
//! [`ConnectivityStateMachine::update`]. Measurement never waits on this.

use log::{info, warn};

/// Connectivity states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    SystemInit,

    WiFiConnecting,
    DHCPRequesting,
    Online,

    WiFiError,
    DHCPError,

    Reconnecting,
}

/// Connectivity events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemEvent {
    SystemStarted,

    WiFiConnected,
    WiFiConnectionFailed,
    WiFiDisconnected,
    DHCPSuccess,
    DHCPFailed,

    RecoveryRequested,
    StateTimeout,
}

/// Result of feeding one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTransition {
    /// Keep the current state
    Stay,
    /// Move to a new state
    Transition(SystemState),
    /// Move to a new state and clear the retry counter
    TransitionWithReset(SystemState),
}

/// Work the firmware has to do for the current state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    StartWiFiConnection,
    StartDHCPRequest,
    MonitorConnection,
    SystemRecover,
    LogError(SystemState),
}

pub struct ConnectivityStateMachine {
    current_state: SystemState,
    previous_state: Option<SystemState>,
    clock_ms: u64,
    state_entry_ms: u64,
    retry_count: u32,
    recovery_count: u32,
    max_retries: u32,
}

impl Default for ConnectivityStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityStateMachine {
    pub fn new() -> Self {
        Self::with_max_retries(3)
    }

    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            current_state: SystemState::SystemInit,
            previous_state: None,
            clock_ms: 0,
            state_entry_ms: 0,
            retry_count: 0,
            recovery_count: 0,
            max_retries,
        }
    }

    pub fn get_current_state(&self) -> SystemState {
        self.current_state
    }

    pub fn get_previous_state(&self) -> Option<SystemState> {
        self.previous_state
    }

    pub fn get_retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Feed an event and apply the resulting transition
    pub fn handle_event(&mut self, event: SystemEvent) -> StateTransition {
        match event {
            SystemEvent::WiFiConnectionFailed | SystemEvent::DHCPFailed => {
                self.retry_count = self.retry_count.saturating_add(1);
            }
            SystemEvent::RecoveryRequested => {
                self.recovery_count = self.recovery_count.saturating_add(1);
            }
            _ => {}
        }

        let transition = self.get_state_transition(self.current_state, event);

        match transition {
            StateTransition::Transition(new_state) => {
                self.transition_to_state(new_state);
            }
            StateTransition::TransitionWithReset(new_state) => {
                self.retry_count = 0;
                self.transition_to_state(new_state);
            }
            StateTransition::Stay => {}
        }

        transition
    }

    /// Advance the clock and raise [`SystemEvent::StateTimeout`] once the
    /// current state has lasted `timeout_ms`
    pub fn tick(&mut self, now_ms: u64, timeout_ms: u64) -> Option<StateTransition> {
        self.clock_ms = now_ms;
        if self.time_in_state() < timeout_ms {
            return None;
        }

        let transition = self.handle_event(SystemEvent::StateTimeout);
        if transition == StateTransition::Stay {
            None
        } else {
            Some(transition)
        }
    }

    /// Milliseconds spent in the current state, as of the last tick
    pub fn time_in_state(&self) -> u64 {
        self.clock_ms.saturating_sub(self.state_entry_ms)
    }

    /// Actions required by the current state
    pub fn update(&mut self) -> alloc::vec::Vec<Action> {
        let mut actions = alloc::vec::Vec::new();

        match self.current_state {
            SystemState::SystemInit => {}

            SystemState::WiFiConnecting | SystemState::Reconnecting => {
                actions.push(Action::StartWiFiConnection);
            }

            SystemState::DHCPRequesting => {
                actions.push(Action::StartDHCPRequest);
            }

            SystemState::Online => {
                actions.push(Action::MonitorConnection);
            }

            SystemState::WiFiError | SystemState::DHCPError => {
                actions.push(Action::LogError(self.current_state));
                if self.should_recover() {
                    actions.push(Action::SystemRecover);
                }
            }
        }

        actions
    }

    fn transition_to_state(&mut self, new_state: SystemState) {
        if new_state == self.current_state {
            return;
        }

        match new_state {
            SystemState::Online => {
                info!("[STATE] Network online");
                self.recovery_count = 0;
            }
            SystemState::WiFiError | SystemState::DHCPError => {
                warn!("[STATE] Error state: {:?}", new_state);
            }
            SystemState::Reconnecting => {
                info!("[STATE] Reconnecting");
                self.recovery_count = 0;
            }
            _ => {}
        }

        self.previous_state = Some(self.current_state);
        self.current_state = new_state;
        self.state_entry_ms = self.clock_ms;
    }

    fn get_state_transition(
        &self,
        current_state: SystemState,
        event: SystemEvent,
    ) -> StateTransition {
        match (current_state, event) {
            (SystemState::SystemInit, SystemEvent::SystemStarted) => {
                StateTransition::Transition(SystemState::WiFiConnecting)
            }

            (SystemState::WiFiConnecting | SystemState::Reconnecting, SystemEvent::WiFiConnected) => {
                StateTransition::TransitionWithReset(SystemState::DHCPRequesting)
            }
            (
                SystemState::WiFiConnecting | SystemState::Reconnecting,
                SystemEvent::WiFiConnectionFailed,
            ) => {
                if self.should_retry() {
                    StateTransition::Stay
                } else {
                    StateTransition::Transition(SystemState::WiFiError)
                }
            }
            (
                SystemState::WiFiConnecting | SystemState::Reconnecting,
                SystemEvent::StateTimeout,
            ) => StateTransition::Transition(SystemState::WiFiError),

            (SystemState::DHCPRequesting, SystemEvent::DHCPSuccess) => {
                StateTransition::TransitionWithReset(SystemState::Online)
            }
            (SystemState::DHCPRequesting, SystemEvent::DHCPFailed) => {
                if self.should_retry() {
                    StateTransition::Stay
                } else {
                    StateTransition::Transition(SystemState::DHCPError)
                }
            }
            (SystemState::DHCPRequesting, SystemEvent::StateTimeout) => {
                StateTransition::Transition(SystemState::DHCPError)
            }

            (SystemState::SystemInit, SystemEvent::WiFiDisconnected) => StateTransition::Stay,
            (SystemState::Reconnecting, SystemEvent::WiFiDisconnected) => StateTransition::Stay,
            (_, SystemEvent::WiFiDisconnected) => {
                StateTransition::TransitionWithReset(SystemState::Reconnecting)
            }

            (SystemState::WiFiError, SystemEvent::RecoveryRequested) => {
                StateTransition::TransitionWithReset(SystemState::WiFiConnecting)
            }
            (SystemState::DHCPError, SystemEvent::RecoveryRequested) => {
                StateTransition::TransitionWithReset(SystemState::DHCPRequesting)
            }

            // Recovery budget spent: back off, then start over from scratch
            (SystemState::WiFiError | SystemState::DHCPError, SystemEvent::StateTimeout) => {
                StateTransition::TransitionWithReset(SystemState::Reconnecting)
            }

            _ => StateTransition::Stay,
        }
    }

    pub fn should_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    fn should_recover(&self) -> bool {
        self.recovery_count < self.max_retries
    }

    pub fn is_error_state(&self) -> bool {
        matches!(
            self.current_state,
            SystemState::WiFiError | SystemState::DHCPError
        )
    }

    /// Uplinks may only be attempted while this holds
    pub fn is_online(&self) -> bool {
        self.current_state == SystemState::Online
    }

    /// Jump straight to `new_state`, clearing all counters
    pub fn force_transition(&mut self, new_state: SystemState) {
        self.transition_to_state(new_state);
        self.retry_count = 0;
        self.recovery_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn online() -> ConnectivityStateMachine {
        let mut sm = ConnectivityStateMachine::new();
        sm.handle_event(SystemEvent::SystemStarted);
        sm.handle_event(SystemEvent::WiFiConnected);
        sm.handle_event(SystemEvent::DHCPSuccess);
        sm
    }

    #[test]
    fn starts_in_init_without_actions() {
        let mut sm = ConnectivityStateMachine::new();
        assert_eq!(sm.get_current_state(), SystemState::SystemInit);
        assert!(sm.update().is_empty());
        assert!(!sm.is_online());
    }

    #[test]
    fn boot_sequence_reaches_online() {
        let mut sm = ConnectivityStateMachine::new();

        sm.handle_event(SystemEvent::SystemStarted);
        assert_eq!(sm.get_current_state(), SystemState::WiFiConnecting);
        assert_eq!(sm.update(), [Action::StartWiFiConnection]);

        sm.handle_event(SystemEvent::WiFiConnected);
        assert_eq!(sm.get_current_state(), SystemState::DHCPRequesting);
        assert_eq!(sm.update(), [Action::StartDHCPRequest]);

        let transition = sm.handle_event(SystemEvent::DHCPSuccess);
        assert_eq!(
            transition,
            StateTransition::TransitionWithReset(SystemState::Online)
        );
        assert!(sm.is_online());
        assert_eq!(sm.update(), [Action::MonitorConnection]);
        assert_eq!(sm.get_previous_state(), Some(SystemState::DHCPRequesting));
    }

    #[test]
    fn wifi_failures_retry_before_error() {
        let mut sm = ConnectivityStateMachine::new();
        sm.handle_event(SystemEvent::SystemStarted);

        assert_eq!(
            sm.handle_event(SystemEvent::WiFiConnectionFailed),
            StateTransition::Stay
        );
        assert_eq!(
            sm.handle_event(SystemEvent::WiFiConnectionFailed),
            StateTransition::Stay
        );
        assert_eq!(sm.get_current_state(), SystemState::WiFiConnecting);

        sm.handle_event(SystemEvent::WiFiConnectionFailed);
        assert_eq!(sm.get_current_state(), SystemState::WiFiError);
        assert!(sm.is_error_state());
        assert_eq!(
            sm.update(),
            [
                Action::LogError(SystemState::WiFiError),
                Action::SystemRecover
            ]
        );
    }

    #[test]
    fn recovery_resets_retries() {
        let mut sm = ConnectivityStateMachine::new();
        sm.handle_event(SystemEvent::SystemStarted);
        for _ in 0..3 {
            sm.handle_event(SystemEvent::WiFiConnectionFailed);
        }

        sm.handle_event(SystemEvent::RecoveryRequested);
        assert_eq!(sm.get_current_state(), SystemState::WiFiConnecting);
        assert_eq!(sm.get_retry_count(), 0);
    }

    #[test]
    fn dhcp_error_recovers_into_dhcp() {
        let mut sm = ConnectivityStateMachine::new();
        sm.handle_event(SystemEvent::SystemStarted);
        sm.handle_event(SystemEvent::WiFiConnected);
        for _ in 0..3 {
            sm.handle_event(SystemEvent::DHCPFailed);
        }
        assert_eq!(sm.get_current_state(), SystemState::DHCPError);

        sm.handle_event(SystemEvent::RecoveryRequested);
        assert_eq!(sm.get_current_state(), SystemState::DHCPRequesting);
    }

    #[test]
    fn recovery_budget_is_bounded() {
        let mut sm = ConnectivityStateMachine::new();
        sm.handle_event(SystemEvent::SystemStarted);

        for _ in 0..3 {
            for _ in 0..3 {
                sm.handle_event(SystemEvent::WiFiConnectionFailed);
            }
            assert!(sm.update().contains(&Action::SystemRecover));
            sm.handle_event(SystemEvent::RecoveryRequested);
        }
        for _ in 0..3 {
            sm.handle_event(SystemEvent::WiFiConnectionFailed);
        }

        assert_eq!(sm.get_current_state(), SystemState::WiFiError);
        assert_eq!(sm.update(), [Action::LogError(SystemState::WiFiError)]);
    }

    #[test]
    fn error_timeout_starts_reconnect() {
        let mut sm = ConnectivityStateMachine::new();
        sm.handle_event(SystemEvent::SystemStarted);
        assert_eq!(sm.tick(1_000, 10_000), None);
        assert_eq!(
            sm.tick(10_000, 10_000),
            Some(StateTransition::Transition(SystemState::WiFiError))
        );

        assert_eq!(sm.tick(12_000, 5_000), None);
        assert_eq!(
            sm.tick(15_000, 5_000),
            Some(StateTransition::TransitionWithReset(
                SystemState::Reconnecting
            ))
        );
        assert_eq!(sm.update(), [Action::StartWiFiConnection]);
        assert_eq!(sm.time_in_state(), 0);
    }

    #[test]
    fn reconnect_after_backoff_restores_recovery_budget() {
        let mut sm = ConnectivityStateMachine::new();
        sm.handle_event(SystemEvent::SystemStarted);
        for _ in 0..3 {
            for _ in 0..3 {
                sm.handle_event(SystemEvent::WiFiConnectionFailed);
            }
            sm.handle_event(SystemEvent::RecoveryRequested);
        }
        for _ in 0..3 {
            sm.handle_event(SystemEvent::WiFiConnectionFailed);
        }
        assert!(!sm.update().contains(&Action::SystemRecover));

        sm.tick(5_000, 5_000);
        assert_eq!(sm.get_current_state(), SystemState::Reconnecting);

        for _ in 0..3 {
            sm.handle_event(SystemEvent::WiFiConnectionFailed);
        }
        assert_eq!(sm.get_current_state(), SystemState::WiFiError);
        assert!(sm.update().contains(&Action::SystemRecover));
    }

    #[test]
    fn disconnect_from_online_reconnects() {
        let mut sm = online();
        sm.handle_event(SystemEvent::WiFiDisconnected);
        assert_eq!(sm.get_current_state(), SystemState::Reconnecting);
        assert!(!sm.is_online());

        sm.handle_event(SystemEvent::WiFiConnected);
        assert_eq!(sm.get_current_state(), SystemState::DHCPRequesting);
        sm.handle_event(SystemEvent::DHCPSuccess);
        assert!(sm.is_online());
    }

    #[test]
    fn online_ignores_repeated_connected_events() {
        let mut sm = online();
        assert_eq!(
            sm.handle_event(SystemEvent::WiFiConnected),
            StateTransition::Stay
        );
        assert_eq!(
            sm.handle_event(SystemEvent::StateTimeout),
            StateTransition::Stay
        );
        assert!(sm.is_online());
    }

    #[test]
    fn disconnect_before_start_is_ignored() {
        let mut sm = ConnectivityStateMachine::new();
        sm.handle_event(SystemEvent::WiFiDisconnected);
        assert_eq!(sm.get_current_state(), SystemState::SystemInit);
    }

    #[test]
    fn force_transition_clears_counters() {
        let mut sm = ConnectivityStateMachine::new();
        sm.handle_event(SystemEvent::SystemStarted);
        sm.handle_event(SystemEvent::WiFiConnectionFailed);
        sm.force_transition(SystemState::Online);
        assert!(sm.is_online());
        assert_eq!(sm.get_retry_count(), 0);
    }
}
