//! Slow-start / congestion-avoidance / fast-retransmit-and-recovery.
//!
//! `cwnd` counts datagrams, not bytes. The effective send budget is
//! `min(cwnd, awnd)`; `awnd` follows the receiver's advertised window on
//! every ACK.

use log::debug;

/// Initial congestion window, in datagrams.
pub const CC_IWND: u16 = 1;

/// What the ACK handler asks of the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct AckOutcome {
    /// Third duplicate ACK: retransmit the head of the sender window now.
    pub fast_retransmit: bool,
}

#[derive(Debug)]
pub struct CongestionController {
    /// Previous cumulative ACK value.
    last_ack: u32,
    /// Consecutive duplicate ACKs.
    dup_count: u32,
    fast_recovery: bool,
    /// Receiver-advertised window.
    awnd: u16,
    iwnd: u16,
    /// Configured ceiling for cwnd.
    mwnd: u16,
    cwnd: u16,
    ssthresh: u16,
    /// Good-ACK credit accumulated toward the next linear cwnd increment.
    ca_count: u16,
}

impl CongestionController {
    pub fn new(advertised_wnd: u16, max_wnd: u16) -> Self {
        let controller = Self {
            last_ack: 1,
            dup_count: 0,
            fast_recovery: false,
            awnd: advertised_wnd,
            iwnd: CC_IWND,
            mwnd: max_wnd,
            cwnd: CC_IWND,
            ssthresh: advertised_wnd.max(1),
            ca_count: 0,
        };
        debug!(
            "cc init: awnd={} mwnd={} iwnd={} cwnd={} ssthresh={}",
            controller.awnd, controller.mwnd, controller.iwnd, controller.cwnd, controller.ssthresh
        );
        controller
    }

    /// Number of datagrams that may be in flight right now.
    pub fn window(&self) -> u16 {
        self.cwnd.min(self.awnd)
    }

    pub fn cwnd(&self) -> u16 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u16 {
        self.ssthresh
    }

    pub fn in_fast_recovery(&self) -> bool {
        self.fast_recovery
    }

    /// Processes one ACK `(ack, wnd, window_update)`.
    pub fn on_ack(&mut self, ack: u32, wnd: u16, window_update: bool) -> AckOutcome {
        self.awnd = wnd;
        if ack == self.last_ack {
            self.dup_count += 1;
        } else {
            self.dup_count = 0;
        }
        if window_update {
            self.dup_count = 0;
        }

        let mut outcome = AckOutcome::default();
        if self.dup_count > 3 && self.fast_recovery {
            // Keep transmitting while the retransmission is in flight.
            self.cwnd = self.cwnd.saturating_add(1).min(self.mwnd);
            debug!(
                "cc fast recovery: duplicate ack #{ack}, cwnd={} ssthresh={}",
                self.cwnd, self.ssthresh
            );
        } else if self.dup_count == 3 {
            self.ssthresh = (self.cwnd >> 1).max(1);
            self.fast_recovery = true;
            outcome.fast_retransmit = true;
            debug!(
                "cc fast retransmit triggered by ack #{ack}, cwnd={} ssthresh={}",
                self.cwnd, self.ssthresh
            );
        } else if self.dup_count == 0 && self.fast_recovery {
            self.cwnd = self.ssthresh.min(self.mwnd);
            self.fast_recovery = false;
            self.ca_count = 0;
            debug!(
                "cc fast recovery ends at ack #{ack}, cwnd={} ssthresh={}",
                self.cwnd, self.ssthresh
            );
        } else if self.dup_count == 0 {
            let credit = ack
                .saturating_sub(self.last_ack)
                .min(u32::from(self.mwnd)) as u16;
            if self.cwnd < self.ssthresh {
                self.slow_start(credit);
            } else {
                self.congestion_avoidance(credit);
            }
        }

        self.last_ack = ack;
        outcome
    }

    /// Exponential growth: cwnd grows by the number of newly acknowledged
    /// datagrams. A credit that would cross ssthresh is split, the remainder
    /// continuing in congestion avoidance.
    fn slow_start(&mut self, credit: u16) {
        if self.cwnd as u32 + credit as u32 > self.ssthresh as u32 {
            let remainder = (self.cwnd as u32 + credit as u32 - self.ssthresh as u32)
                .min(u16::MAX as u32) as u16;
            self.cwnd = self.ssthresh.min(self.mwnd);
            self.ca_count = 0;
            debug!(
                "cc slow start reaches ssthresh, cwnd={} ssthresh={} (split)",
                self.cwnd, self.ssthresh
            );
            self.congestion_avoidance(remainder);
        } else {
            self.cwnd = (self.cwnd + credit).min(self.mwnd);
            debug!(
                "cc slow start, cwnd={} ssthresh={}",
                self.cwnd, self.ssthresh
            );
        }
    }

    /// Linear growth: one extra datagram per cwnd good ACKs.
    fn congestion_avoidance(&mut self, credit: u16) {
        self.ca_count = self.ca_count.saturating_add(credit);
        while self.ca_count >= self.cwnd {
            self.ca_count -= self.cwnd;
            if self.cwnd < self.mwnd {
                self.cwnd += 1;
            }
        }
        debug!(
            "cc congestion avoidance, cwnd={} ssthresh={} ca_count={}",
            self.cwnd, self.ssthresh, self.ca_count
        );
    }

    /// Retransmission timeout: collapse to the initial window.
    pub fn on_timeout(&mut self) {
        self.ssthresh = (self.cwnd >> 1).max(1);
        self.cwnd = self.iwnd;
        self.dup_count = 0;
        self.ca_count = 0;
        debug!(
            "cc timeout, cwnd={} ssthresh={}",
            self.cwnd, self.ssthresh
        );
    }
}
