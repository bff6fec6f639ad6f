//! State bookkeeping for the receiver.

use wpsim_common::{PhyState, SimTime};

/// Tracks the PHY's current state and when its busy periods end.
///
/// `CcaBusy` is not stored: it is reported while the base state is `Idle`
/// and the medium-busy period has not elapsed.
#[derive(Debug, Clone)]
pub struct StateHelper {
    base: PhyState,
    rx_start: SimTime,
    end_tx: SimTime,
    end_rx: SimTime,
    end_switching: SimTime,
    end_cca_busy: SimTime,
}

impl Default for StateHelper {
    fn default() -> Self {
        StateHelper {
            base: PhyState::Idle,
            rx_start: SimTime::ZERO,
            end_tx: SimTime::ZERO,
            end_rx: SimTime::ZERO,
            end_switching: SimTime::ZERO,
            end_cca_busy: SimTime::ZERO,
        }
    }
}

impl StateHelper {
    /// State at `now`.
    pub fn current(&self, now: SimTime) -> PhyState {
        match self.base {
            PhyState::Idle if self.end_cca_busy > now => PhyState::CcaBusy,
            state => state,
        }
    }

    /// Time left in the current TX, RX or switching period.
    pub fn delay_until_idle(&self, now: SimTime) -> SimTime {
        match self.base {
            PhyState::Tx => self.end_tx - now,
            PhyState::Rx => self.end_rx - now,
            PhyState::Switching => self.end_switching - now,
            _ => SimTime::ZERO,
        }
    }

    /// When the medium-busy period ends.
    pub fn end_cca_busy(&self) -> SimTime {
        self.end_cca_busy
    }

    /// Start of the current reception.
    pub fn rx_start(&self) -> SimTime {
        self.rx_start
    }

    /// End of the current reception.
    pub fn end_rx(&self) -> SimTime {
        self.end_rx
    }

    /// Medium reported busy until at least `now + duration`.
    pub fn notify_cca_busy(&mut self, now: SimTime, duration: SimTime) {
        self.end_cca_busy = self.end_cca_busy.max(now + duration);
    }

    /// Begin transmitting for `duration`.
    pub fn switch_to_tx(&mut self, now: SimTime, duration: SimTime) {
        self.base = PhyState::Tx;
        self.end_tx = now + duration;
    }

    /// Begin receiving for `duration`.
    pub fn switch_to_rx(&mut self, now: SimTime, duration: SimTime) {
        self.base = PhyState::Rx;
        self.rx_start = now;
        self.end_rx = now + duration;
    }

    /// Begin retuning for `duration`. Any medium-busy period is forgotten.
    pub fn switch_to_switching(&mut self, now: SimTime, duration: SimTime) {
        self.base = PhyState::Switching;
        self.end_switching = now + duration;
        self.end_cca_busy = now;
    }

    /// Reception finished or was abandoned.
    pub fn switch_from_rx(&mut self, now: SimTime) {
        self.base = PhyState::Idle;
        self.end_rx = now;
    }

    /// Transmission finished.
    pub fn switch_from_tx(&mut self, now: SimTime) {
        self.base = PhyState::Idle;
        self.end_tx = now;
    }

    /// Retuning finished.
    pub fn switch_from_switching(&mut self, now: SimTime) {
        self.base = PhyState::Idle;
        self.end_switching = now;
    }

    /// Enter sleep.
    pub fn switch_to_sleep(&mut self, now: SimTime) {
        self.base = PhyState::Sleep;
        self.end_cca_busy = now;
    }

    /// Leave sleep or off.
    pub fn switch_to_idle(&mut self) {
        self.base = PhyState::Idle;
    }

    /// Power off, abandoning every busy period.
    pub fn switch_to_off(&mut self, now: SimTime) {
        self.base = PhyState::Off;
        self.end_tx = now;
        self.end_rx = now;
        self.end_switching = now;
        self.end_cca_busy = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn us(v: u64) -> SimTime {
        SimTime::from_micros(v)
    }

    #[test]
    fn test_cca_busy_derived_from_idle() {
        let mut state = StateHelper::default();
        state.notify_cca_busy(us(0), us(50));
        assert_eq!(state.current(us(10)), PhyState::CcaBusy);
        assert_eq!(state.current(us(50)), PhyState::Idle);
        // not reported while receiving
        state.switch_to_rx(us(10), us(20));
        assert_eq!(state.current(us(15)), PhyState::Rx);
        state.switch_from_rx(us(30));
        assert_eq!(state.current(us(30)), PhyState::CcaBusy);
    }

    #[test]
    fn test_delay_until_idle() {
        let mut state = StateHelper::default();
        assert_eq!(state.delay_until_idle(us(5)), SimTime::ZERO);
        state.switch_to_tx(us(0), us(100));
        assert_eq!(state.delay_until_idle(us(40)), us(60));
        state.switch_from_tx(us(100));
        state.switch_to_switching(us(100), us(250));
        assert_eq!(state.delay_until_idle(us(100)), us(250));
    }

    #[test]
    fn test_busy_period_only_extends() {
        let mut state = StateHelper::default();
        state.notify_cca_busy(us(0), us(100));
        state.notify_cca_busy(us(10), us(20));
        assert_eq!(state.end_cca_busy(), us(100));
    }
}
