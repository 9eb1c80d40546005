//! Client-side prediction with delayed authoritative correction
//!
//! A locally controlled property is predicted immediately. Authoritative
//! state from the server for the same property is held back until the
//! player has stopped changing it for `correction_delay` seconds, so the
//! correction does not fight the player's input. Only the newest correction
//! is kept; older and duplicate sequence ids are ignored.

use std::any::Any;

use tracing::{debug, warn};

use crate::game::constants::sim::CORRECTION_DELAY;
use crate::net::codec::{self, EncodeError, WireRecord};
use crate::net::sequence::SequenceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileState {
    Predicting,
    CorrectionPending,
    /// Transient while a correction is decoded and applied
    Applying,
}

/// Result of feeding a correction or advancing the timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Idle,
    /// Older than, or equal to, a correction already seen
    Ignored,
    Buffered,
    Waiting,
    Applied,
    /// Correction payload failed to decode
    Dropped,
}

/// Buffered authoritative payload
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCorrection {
    pub payload: Vec<u8>,
    pub sequence: SequenceId,
    /// Sender timestamp, seconds
    pub sent_at: f64,
}

/// Anything the simulation step advances once per tick
pub trait Reconcilable: Any + Send {
    fn update(&mut self, dt: f32) -> ReconcileOutcome;
    fn discard_pending(&mut self);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

pub struct ReconciliationBuffer<T: WireRecord> {
    value: T,
    correction_delay: f32,
    timer: f32,
    state: ReconcileState,
    pending: Option<PendingCorrection>,
    last_applied: Option<SequenceId>,
    unsent: bool,
    hold: bool,
}

impl<T: WireRecord> ReconciliationBuffer<T> {
    pub fn new(initial: T) -> Self {
        Self::with_delay(initial, CORRECTION_DELAY)
    }

    pub fn with_delay(initial: T, correction_delay: f32) -> Self {
        Self {
            value: initial,
            correction_delay: correction_delay.max(0.0),
            timer: 0.0,
            state: ReconcileState::Predicting,
            pending: None,
            last_applied: None,
            unsent: false,
            hold: false,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn state(&self) -> ReconcileState {
        self.state
    }

    /// Seconds left before a buffered correction may apply
    pub fn timer(&self) -> f32 {
        self.timer
    }

    pub fn correction_delay(&self) -> f32 {
        self.correction_delay
    }

    pub fn set_correction_delay(&mut self, delay: f32) {
        self.correction_delay = delay.max(0.0);
    }

    pub fn pending(&self) -> Option<&PendingCorrection> {
        self.pending.as_ref()
    }

    pub fn last_applied(&self) -> Option<SequenceId> {
        self.last_applied
    }

    pub fn has_unsent(&self) -> bool {
        self.unsent
    }

    /// Apply a local change and restart the correction countdown
    pub fn predict(&mut self, value: T) {
        self.value = value;
        self.timer = self.correction_delay;
        self.unsent = true;
    }

    /// Feed an authoritative payload. It is only buffered here; the next
    /// [`update`](Self::update) with the countdown at zero applies it.
    pub fn receive(&mut self, payload: Vec<u8>, sequence: SequenceId, sent_at: f64) -> ReconcileOutcome {
        let newest_seen = self
            .pending
            .as_ref()
            .map(|p| p.sequence)
            .or(self.last_applied);
        if let Some(newest) = newest_seen {
            if !SequenceId::is_newer(sequence, newest) {
                debug!(%sequence, %newest, "Ignoring stale correction");
                return ReconcileOutcome::Ignored;
            }
        }

        self.pending = Some(PendingCorrection {
            payload,
            sequence,
            sent_at,
        });
        self.state = ReconcileState::CorrectionPending;
        ReconcileOutcome::Buffered
    }

    /// Advance the countdown and apply the newest buffered correction once
    /// it reaches zero
    pub fn update(&mut self, dt: f32) -> ReconcileOutcome {
        if self.timer > 0.0 {
            self.timer = (self.timer - dt).max(0.0);
        }
        if self.timer > 0.0 || self.hold {
            return if self.pending.is_some() {
                ReconcileOutcome::Waiting
            } else {
                ReconcileOutcome::Idle
            };
        }
        match self.pending.take() {
            Some(correction) => self.apply(correction),
            None => ReconcileOutcome::Idle,
        }
    }

    /// Keep corrections buffered while a resync is in progress
    pub fn hold_until_synced(&mut self, hold: bool) {
        self.hold = hold;
    }

    pub fn discard_pending(&mut self) {
        if self.pending.take().is_some() {
            debug!("Discarded buffered correction");
        }
        self.state = ReconcileState::Predicting;
    }

    /// Encoded local value if it changed since the last call
    pub fn take_unsent(&mut self) -> Result<Option<Vec<u8>>, EncodeError> {
        if !self.unsent {
            return Ok(None);
        }
        let bytes = codec::encode(&self.value)?;
        self.unsent = false;
        Ok(Some(bytes))
    }

    fn apply(&mut self, correction: PendingCorrection) -> ReconcileOutcome {
        self.state = ReconcileState::Applying;
        let outcome = match codec::decode::<T>(&correction.payload) {
            Ok(value) => {
                self.value = value;
                self.last_applied = Some(correction.sequence);
                self.unsent = false;
                ReconcileOutcome::Applied
            }
            Err(e) => {
                warn!(sequence = %correction.sequence, error = %e, "Dropping undecodable correction");
                ReconcileOutcome::Dropped
            }
        };
        self.state = ReconcileState::Predicting;
        outcome
    }
}

impl<T: WireRecord + Send> Reconcilable for ReconciliationBuffer<T> {
    fn update(&mut self, dt: f32) -> ReconcileOutcome {
        ReconciliationBuffer::update(self, dt)
    }

    fn discard_pending(&mut self) {
        ReconciliationBuffer::discard_pending(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire_record;

    wire_record! {
        #[derive(Debug, Clone, PartialEq)]
        struct Steering {
            #[wire(min = -1.0, max = 1.0, bits = 16)]
            throttle: f32,
            ballast: bool,
        }
    }

    fn steering(throttle: f32) -> Steering {
        Steering {
            throttle,
            ballast: false,
        }
    }

    fn payload(throttle: f32) -> Vec<u8> {
        codec::encode(&steering(throttle)).unwrap()
    }

    #[test]
    fn test_idle_correction_waits_for_next_update() {
        let mut buffer = ReconciliationBuffer::with_delay(steering(0.0), 0.5);
        let outcome = buffer.receive(payload(1.0), SequenceId(1), 0.0);
        assert_eq!(outcome, ReconcileOutcome::Buffered);
        assert_eq!(buffer.value().throttle, 0.0);
        assert_eq!(buffer.state(), ReconcileState::CorrectionPending);

        assert_eq!(buffer.update(0.0), ReconcileOutcome::Applied);
        assert_eq!(buffer.value().throttle, 1.0);
        assert_eq!(buffer.state(), ReconcileState::Predicting);
    }

    #[test]
    fn test_prediction_converges_after_delay() {
        let mut buffer = ReconciliationBuffer::with_delay(steering(0.0), 0.5);
        buffer.predict(steering(0.5));
        assert_eq!(buffer.timer(), 0.5);

        assert_eq!(buffer.receive(payload(-1.0), SequenceId(7), 1.0), ReconcileOutcome::Buffered);
        assert_eq!(buffer.state(), ReconcileState::CorrectionPending);
        assert_eq!(buffer.value().throttle, 0.5);

        assert_eq!(buffer.update(0.25), ReconcileOutcome::Waiting);
        assert_eq!(buffer.value().throttle, 0.5);

        assert_eq!(buffer.update(0.3), ReconcileOutcome::Applied);
        assert_eq!(buffer.value().throttle, -1.0);
        assert_eq!(buffer.last_applied(), Some(SequenceId(7)));
        assert_eq!(buffer.state(), ReconcileState::Predicting);
    }

    #[test]
    fn test_no_corrections_keeps_prediction() {
        let mut buffer = ReconciliationBuffer::with_delay(steering(0.0), 0.1);
        buffer.predict(steering(0.25));
        for _ in 0..100 {
            assert_eq!(buffer.update(1.0 / 60.0), ReconcileOutcome::Idle);
        }
        assert_eq!(buffer.value().throttle, 0.25);
    }

    #[test]
    fn test_newest_buffered_correction_wins() {
        let mut buffer = ReconciliationBuffer::with_delay(steering(0.0), 1.0);
        buffer.predict(steering(0.1));
        assert_eq!(buffer.receive(payload(0.5), SequenceId(10), 0.0), ReconcileOutcome::Buffered);
        assert_eq!(buffer.receive(payload(0.75), SequenceId(12), 0.0), ReconcileOutcome::Buffered);
        assert_eq!(buffer.receive(payload(-0.5), SequenceId(11), 0.0), ReconcileOutcome::Ignored);
        assert_eq!(buffer.pending().unwrap().sequence, SequenceId(12));

        assert_eq!(buffer.update(2.0), ReconcileOutcome::Applied);
        assert!((buffer.value().throttle - 0.75).abs() < 1e-3);
    }

    #[test]
    fn test_stale_and_duplicate_ignored_across_wrap() {
        let mut buffer = ReconciliationBuffer::with_delay(steering(0.0), 0.0);
        assert_eq!(buffer.receive(payload(0.5), SequenceId(65530), 0.0), ReconcileOutcome::Buffered);
        assert_eq!(buffer.update(0.0), ReconcileOutcome::Applied);
        assert_eq!(buffer.receive(payload(0.1), SequenceId(65530), 0.0), ReconcileOutcome::Ignored);
        assert_eq!(buffer.receive(payload(0.1), SequenceId(65000), 0.0), ReconcileOutcome::Ignored);
        assert_eq!(buffer.receive(payload(-0.5), SequenceId(3), 0.0), ReconcileOutcome::Buffered);
        assert_eq!(buffer.update(0.0), ReconcileOutcome::Applied);
        assert!((buffer.value().throttle + 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_undecodable_correction_dropped() {
        let mut buffer = ReconciliationBuffer::with_delay(steering(0.0), 0.2);
        buffer.predict(steering(0.3));
        buffer.receive(Vec::new(), SequenceId(1), 0.0);
        assert_eq!(buffer.update(1.0), ReconcileOutcome::Dropped);
        assert_eq!(buffer.value().throttle, 0.3);
        assert_eq!(buffer.last_applied(), None);
        assert!(buffer.pending().is_none());
    }

    #[test]
    fn test_hold_until_synced() {
        let mut buffer = ReconciliationBuffer::with_delay(steering(0.0), 0.0);
        buffer.hold_until_synced(true);
        assert_eq!(buffer.receive(payload(1.0), SequenceId(1), 0.0), ReconcileOutcome::Buffered);
        assert_eq!(buffer.update(5.0), ReconcileOutcome::Waiting);

        buffer.hold_until_synced(false);
        assert_eq!(buffer.update(0.0), ReconcileOutcome::Applied);
        assert_eq!(buffer.value().throttle, 1.0);
    }

    #[test]
    fn test_discard_pending() {
        let mut buffer = ReconciliationBuffer::with_delay(steering(0.0), 1.0);
        buffer.predict(steering(0.2));
        buffer.receive(payload(1.0), SequenceId(1), 0.0);
        buffer.discard_pending();
        assert_eq!(buffer.state(), ReconcileState::Predicting);
        assert_eq!(buffer.update(5.0), ReconcileOutcome::Idle);
        assert_eq!(buffer.value().throttle, 0.2);
    }

    #[test]
    fn test_take_unsent() {
        let mut buffer = ReconciliationBuffer::new(steering(0.0));
        assert_eq!(buffer.take_unsent().unwrap(), None);

        buffer.predict(steering(-0.25));
        let bytes = buffer.take_unsent().unwrap().unwrap();
        let sent: Steering = codec::decode(&bytes).unwrap();
        assert!((sent.throttle + 0.25).abs() < 1e-3);
        assert!(!buffer.has_unsent());
        assert_eq!(buffer.take_unsent().unwrap(), None);
    }

    #[test]
    fn test_dyn_reconcilable_downcast() {
        let mut boxed: Box<dyn Reconcilable> =
            Box::new(ReconciliationBuffer::with_delay(steering(0.0), 0.0));
        boxed
            .as_any_mut()
            .downcast_mut::<ReconciliationBuffer<Steering>>()
            .unwrap()
            .predict(steering(0.5));
        assert_eq!(boxed.update(0.1), ReconcileOutcome::Idle);
        let buffer = boxed.as_any().downcast_ref::<ReconciliationBuffer<Steering>>().unwrap();
        assert_eq!(buffer.value().throttle, 0.5);
    }
}
