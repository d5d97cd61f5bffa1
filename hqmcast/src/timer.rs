//! Timer driver.
//!
//! Two engine deadlines are tracked: loss detection and ACK delay. After
//! every packet read or stream write the session queries the engine and
//! reconciles each deadline with the host's timer surface. A deadline of
//! `u64::MAX` cancels, a deadline at or before now fires inline, anything
//! else is (re)armed for `deadline - now`. Nothing is scheduled until the
//! handshake completes, and a host without `set_timer` support runs the
//! session purely reactively.

use tracing::trace;

use crate::callbacks::{SessionCallbacks, TimerId, TimerKind};
use crate::error::{Error, Result};
use crate::session::Session;
use crate::transport::NO_DEADLINE;

/// One armed host timer and the deadline it was armed for.
#[derive(Debug, Default)]
pub(crate) struct TimerSlot {
    pub(crate) id: Option<TimerId>,
    pub(crate) deadline: Option<u64>,
}

const NANOS_PER_SEC: f64 = 1e9;

/// Arm, re-arm or cancel one slot against the host surface.
fn arm_or_cancel(
    callbacks: &mut dyn SessionCallbacks,
    slot: &mut TimerSlot,
    kind: TimerKind,
    deadline: u64,
    now: u64,
) {
    if deadline == NO_DEADLINE {
        if let Some(id) = slot.id.take() {
            callbacks.cancel_timer(id);
        }
        slot.deadline = None;
        return;
    }
    if slot.deadline == Some(deadline) {
        return; // already armed for this instant
    }
    let seconds = deadline.saturating_sub(now) as f64 / NANOS_PER_SEC;
    match slot.id {
        Some(id) => callbacks.reset_timer(id, seconds),
        None => slot.id = callbacks.set_timer(seconds, kind),
    }
    if slot.id.is_some() {
        slot.deadline = Some(deadline);
    }
    trace!(?kind, deadline, "timer reconciled");
}

impl Session {
    /// Reconcile both engine deadlines with the host timer surface,
    /// running any deadline that is already due.
    pub(crate) fn reconcile_timers(&mut self, now: u64) -> Result<()> {
        if !self.handshake_complete {
            return Ok(());
        }

        let due = self.engine.loss_detection_deadline();
        if due != NO_DEADLINE && due <= now {
            self.fire_loss_detection(now)?;
        }
        let deadline = self.engine.loss_detection_deadline();
        arm_or_cancel(
            self.callbacks.as_mut(),
            &mut self.loss_timer,
            TimerKind::LossDetection,
            deadline,
            now,
        );

        let due = self.engine.ack_delay_deadline();
        if due != NO_DEADLINE && due <= now {
            self.fire_ack_delay()?;
        }
        let deadline = self.engine.ack_delay_deadline();
        arm_or_cancel(
            self.callbacks.as_mut(),
            &mut self.ack_timer,
            TimerKind::AckDelay,
            deadline,
            now,
        );
        Ok(())
    }

    /// Entry point for a fired host timer.
    pub fn handle_timer(&mut self, kind: TimerKind, now: u64) -> Result<()> {
        match kind {
            TimerKind::LossDetection => {
                self.loss_timer.id = None;
                self.loss_timer.deadline = None;
                self.fire_loss_detection(now)?;
            }
            TimerKind::AckDelay => {
                self.ack_timer.id = None;
                self.ack_timer.deadline = None;
                self.fire_ack_delay()?;
            }
        }
        self.reconcile_timers(now)
    }

    /// Run the engine's loss-detection routine and push out anything it
    /// wants retransmitted.
    fn fire_loss_detection(&mut self, now: u64) -> Result<()> {
        self.engine
            .on_loss_detection_timer(now)
            .map_err(Error::from)?;
        match self.scheduler_run() {
            Ok(_) | Err(Error::SessionBlocked) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Ask the engine for the delayed-ACK packet and send it.
    fn fire_ack_delay(&mut self) -> Result<()> {
        let mut pkt = Vec::new();
        let n = self.engine.write_pkt(&mut pkt).map_err(Error::from)?;
        if n > 0 {
            self.emit_packet(pkt)?;
        }
        match self.flush_pending_packets() {
            Ok(()) | Err(Error::SessionBlocked) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
