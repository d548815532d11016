//! AIMD congestion control for the uTP send path.

use std::time::Duration;

use crate::constants::{UTP_BASE_TIMEOUT, UTP_INIT_CWND, UTP_MAX_CWND, UTP_MSS};

/// Additive-increase / multiplicative-decrease congestion window.
///
/// Growth is per acknowledged byte: `cwnd += MSS * bytes_acked / cwnd`,
/// which works out to one MSS per round trip when a full window is
/// acked. A retransmission timeout halves the window. The window stays
/// inside `[MSS, 1 MiB]`.
#[derive(Debug)]
pub(crate) struct Congestion {
    cwnd: u32,
    /// Smoothed round-trip estimate, microseconds.
    rtt_us: u64,
    rtt_var_us: u64,
}

impl Congestion {
    pub fn new() -> Self {
        Self {
            cwnd: UTP_INIT_CWND,
            rtt_us: 100_000,
            rtt_var_us: 0,
        }
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn rtt(&self) -> Duration {
        Duration::from_micros(self.rtt_us)
    }

    /// Bytes this end may put in flight right now.
    pub fn send_budget(&self, bytes_in_flight: u32, remote_wnd: u32) -> u32 {
        self.cwnd.saturating_sub(bytes_in_flight).min(remote_wnd)
    }

    pub fn on_ack(&mut self, bytes_acked: u32) {
        if bytes_acked == 0 {
            return;
        }
        let gain = (UTP_MSS as u64 * bytes_acked as u64 / self.cwnd.max(1) as u64) as u32;
        self.cwnd = (self.cwnd + gain).clamp(UTP_MSS, UTP_MAX_CWND);
    }

    pub fn on_timeout(&mut self) {
        self.cwnd = (self.cwnd / 2).clamp(UTP_MSS, UTP_MAX_CWND);
    }

    /// Folds a fresh RTT sample into the smoothed estimate
    /// (RFC 6298 coefficients).
    pub fn on_rtt_sample(&mut self, sample: Duration) {
        let sample = sample.as_micros() as u64;
        if self.rtt_var_us == 0 && self.rtt_us == 100_000 {
            self.rtt_us = sample;
            self.rtt_var_us = sample / 2;
            return;
        }
        let delta = self.rtt_us.abs_diff(sample);
        self.rtt_var_us = (3 * self.rtt_var_us + delta) / 4;
        self.rtt_us = (7 * self.rtt_us + sample) / 8;
    }

    /// The retransmit timeout for the `n`-th transmission: the fixed
    /// base doubled per attempt (1, 2, 4, 8, 16 s).
    pub fn retransmit_timeout(num_transmissions: u32) -> Duration {
        UTP_BASE_TIMEOUT * 2u32.pow(num_transmissions.saturating_sub(1).min(4))
    }
}
