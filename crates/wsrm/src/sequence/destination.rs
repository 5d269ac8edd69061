// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inbound sequence state.
//!
//! A [`DestinationSequence`] records which numbers arrived, decides whether a
//! message may be handed to the application ([`apply_delivery_assurance`]),
//! and drives the acknowledgement and inactivity timers.
//!
//! Two locks are involved and never nested:
//! - `inner` guards the acknowledgement ranges and the rate monitor
//! - `delivery` guards in-order progress; in-order callers park on
//!   `delivery_cond` while holding only this lock
//!
//! [`apply_delivery_assurance`]: DestinationSequence::apply_delivery_assurance

use crate::ack_range::{AckRangeSet, SequenceAcknowledgement};
use crate::config::{ProtocolVariation, RmConfiguration};
use crate::error::{Result, RmError, SequenceFault};
use crate::identifier::Identifier;
use crate::message::{EndpointReference, StoredMessage};
use crate::monitor::SequenceMonitor;
use crate::store::{self, DestinationSequenceRecord, RmStore};
use crate::timer::{TimerHandle, TimerService};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

/// Lifecycle of a [`DestinationSequence`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DestinationState {
    Active,
    /// Inactivity timeout passed; in-flight deliveries may still complete.
    Terminating,
    Terminated,
}

/// Registry that owns destination sequences and acts for their timers.
///
/// Timer tasks hold a `Weak` reference to the owner plus a sequence id and
/// resolve the sequence again each time they fire.
pub trait DestinationOwner: Send + Sync {
    fn destination_sequence(&self, id: &Identifier) -> Option<Arc<DestinationSequence>>;

    /// Dispatch an out-of-band acknowledgement for `sequence`.
    fn send_acknowledgement(&self, sequence: &DestinationSequence);

    /// Most recent application or control message seen by the endpoint.
    fn last_activity(&self) -> Option<Instant>;

    /// Remove a sequence whose inactivity timeout elapsed.
    fn terminate_inactive(&self, sequence: &DestinationSequence);
}

struct Binding {
    timer: Arc<TimerService>,
    owner: Weak<dyn DestinationOwner>,
    store: Option<Arc<dyn RmStore>>,
}

#[derive(Default)]
struct SequenceTimers {
    deferred: Option<TimerHandle>,
    fallback: Option<TimerHandle>,
    termination: Option<TimerHandle>,
    max_inactivity: Duration,
}

struct DestinationInner {
    acknowledged: AckRangeSet,
    /// Numbers admitted to the application under a duplicate-rejecting
    /// assurance.
    admitted: AckRangeSet,
    last_message_number: u64,
    /// `CloseSequence` received; `last_message_number` is the bound even
    /// when it is 0.
    closed: bool,
    state: DestinationState,
    monitor: SequenceMonitor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryClosed {
    Terminated,
    Shutdown,
}

#[derive(Default)]
struct DeliveryState {
    in_process: Option<u64>,
    highest_completed: u64,
    closed: Option<DeliveryClosed>,
    /// Handed to the application, stored copy not yet purged.
    delivered: AckRangeSet,
}

/// Result of recording a received message number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckOutcome {
    /// The number was not acknowledged before.
    pub newly_acknowledged: bool,
    /// The range set has gaps after this acknowledgement.
    pub has_gaps: bool,
}

/// Receiving side of a sequence.
pub struct DestinationSequence {
    identifier: Identifier,
    protocol: ProtocolVariation,
    acks_to: EndpointReference,
    correlation_id: Option<String>,
    config: RmConfiguration,
    created: Instant,
    inner: Mutex<DestinationInner>,
    delivery: Mutex<DeliveryState>,
    delivery_cond: Condvar,
    ack_pending: AtomicBool,
    timers: Mutex<SequenceTimers>,
    binding: OnceLock<Binding>,
}

impl DestinationSequence {
    pub fn new(
        identifier: Identifier,
        acks_to: EndpointReference,
        config: RmConfiguration,
    ) -> Self {
        Self {
            identifier,
            protocol: config.protocol,
            acks_to,
            correlation_id: None,
            config,
            created: Instant::now(),
            inner: Mutex::new(DestinationInner {
                acknowledged: AckRangeSet::new(),
                admitted: AckRangeSet::new(),
                last_message_number: 0,
                closed: false,
                state: DestinationState::Active,
                monitor: SequenceMonitor::new(),
            }),
            delivery: Mutex::new(DeliveryState::default()),
            delivery_cond: Condvar::new(),
            ack_pending: AtomicBool::new(false),
            timers: Mutex::new(SequenceTimers::default()),
            binding: OnceLock::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_monitor_interval(self, interval: Duration) -> Self {
        self.inner.lock().monitor = SequenceMonitor::with_interval(interval);
        self
    }

    /// Rebuild from a persisted record.
    ///
    /// Every recorded number counts as delivered; in-order delivery resumes
    /// after the contiguous prefix.
    pub fn from_record(record: &DestinationSequenceRecord, mut config: RmConfiguration) -> Self {
        config.protocol = record.protocol;
        let seq = Self::new(record.identifier.clone(), record.acks_to.clone(), config);
        let mut ranges = record.acknowledged.clone();
        ranges.merge();
        seq.delivery.lock().highest_completed = ranges.contiguous_prefix();
        {
            let mut inner = seq.inner.lock();
            inner.admitted = ranges.clone();
            inner.acknowledged = ranges;
            inner.last_message_number = record.last_message_number;
            inner.closed = record.closed;
            if record.terminated {
                inner.state = DestinationState::Terminated;
            }
        }
        seq
    }

    pub fn to_record(&self, endpoint: &str) -> DestinationSequenceRecord {
        let inner = self.inner.lock();
        DestinationSequenceRecord {
            identifier: self.identifier.clone(),
            endpoint: endpoint.to_string(),
            protocol: self.protocol,
            acks_to: self.acks_to.clone(),
            last_message_number: inner.last_message_number,
            acknowledged: inner.acknowledged.clone(),
            closed: inner.closed,
            terminated: inner.state == DestinationState::Terminated,
        }
    }

    /// Connect the sequence to its timer service, owner and store.
    ///
    /// Until bound, scheduling calls only update the pending flag.
    pub fn bind(
        &self,
        timer: Arc<TimerService>,
        owner: Weak<dyn DestinationOwner>,
        store: Option<Arc<dyn RmStore>>,
    ) {
        let _ = self.binding.set(Binding {
            timer,
            owner,
            store,
        });
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn protocol(&self) -> ProtocolVariation {
        self.protocol
    }

    pub fn acks_to(&self) -> &EndpointReference {
        &self.acks_to
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn config(&self) -> &RmConfiguration {
        &self.config
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn state(&self) -> DestinationState {
        self.inner.lock().state
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == DestinationState::Terminated
    }

    pub fn last_message_number(&self) -> u64 {
        self.inner.lock().last_message_number
    }

    /// Declare the final number of the sequence. The first declaration wins.
    pub fn set_last_message_number(&self, number: u64) {
        let mut inner = self.inner.lock();
        if inner.last_message_number == 0 && !inner.closed {
            inner.last_message_number = number;
        }
    }

    /// Stop accepting numbers above the highest received, including a
    /// sequence that received nothing.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        if inner.last_message_number == 0 {
            inner.last_message_number = inner.acknowledged.highest().unwrap_or(0);
        }
        inner.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn acknowledged_ranges(&self) -> AckRangeSet {
        self.inner.lock().acknowledged.clone()
    }

    pub fn acknowledgement(&self) -> SequenceAcknowledgement {
        SequenceAcknowledgement::new(self.identifier.clone(), self.acknowledged_ranges())
    }

    pub fn is_acknowledged(&self, number: u64) -> bool {
        self.inner.lock().acknowledged.contains(number)
    }

    /// Last message number declared and every number up to it received.
    pub fn all_received(&self) -> bool {
        let inner = self.inner.lock();
        inner.last_message_number > 0 && inner.acknowledged.covers(1, inner.last_message_number)
    }

    /// Record a received message number and mark an acknowledgement pending.
    pub fn acknowledge(&self, number: u64) -> Result<AckOutcome> {
        if number == 0 {
            return Err(RmError::Protocol(format!(
                "message number 0 on sequence {}",
                self.identifier
            )));
        }

        let outcome = {
            let mut inner = self.inner.lock();
            if inner.state == DestinationState::Terminated {
                return Err(SequenceFault::terminated(self.identifier.clone()).into());
            }
            let bounded = inner.closed || inner.last_message_number > 0;
            if bounded && number > inner.last_message_number {
                return Err(SequenceFault::last_message_number_exceeded(self.identifier.clone()).into());
            }
            let newly_acknowledged = inner.acknowledged.acknowledge(number);
            inner.monitor.acknowledge_message(Instant::now());
            AckOutcome {
                newly_acknowledged,
                has_gaps: inner.acknowledged.len() > 1,
            }
        };

        self.ack_pending.store(true, Ordering::Release);
        Ok(outcome)
    }

    /// Messages per minute observed on this sequence.
    pub fn message_rate(&self) -> u32 {
        self.inner.lock().monitor.messages_per_minute(Instant::now())
    }

    /// Decide whether message `number` may be delivered to the application.
    ///
    /// Under at-most-once and exactly-once a number already admitted once is
    /// rejected with [`RmError::DuplicateMessage`]. At-least-once admits it
    /// again unless delivery is in order.
    ///
    /// With in-order delivery the call blocks until every lower number has
    /// completed, and a number already completed or in process is a duplicate
    /// under every assurance. The returned permit marks completion when
    /// dropped.
    pub fn apply_delivery_assurance(&self, number: u64) -> Result<DeliveryPermit<'_>> {
        let assurance = self.config.delivery_assurance;

        if self.config.in_order {
            // the in-order gate rejects anything already completed or in process
            self.wait_in_queue(number, assurance.can_skip())?;
            if assurance.rejects_duplicates() {
                self.inner.lock().admitted.acknowledge(number);
            }
            return Ok(DeliveryPermit {
                sequence: self,
                number,
                ordered: true,
            });
        }

        if assurance.rejects_duplicates() && !self.inner.lock().admitted.acknowledge(number) {
            return Err(self.duplicate(number));
        }
        Ok(DeliveryPermit {
            sequence: self,
            number,
            ordered: false,
        })
    }

    fn wait_in_queue(&self, number: u64, can_skip: bool) -> Result<()> {
        let deadline = self
            .config
            .in_order_wait_timeout()
            .map(|t| Instant::now() + t);

        let mut delivery = self.delivery.lock();
        loop {
            match delivery.closed {
                Some(DeliveryClosed::Terminated) => {
                    return Err(SequenceFault::terminated(self.identifier.clone()).into());
                }
                Some(DeliveryClosed::Shutdown) => {
                    return Err(RmError::InvalidState(format!(
                        "endpoint of sequence {} shut down",
                        self.identifier
                    )));
                }
                None => {}
            }
            if number <= delivery.highest_completed || delivery.in_process == Some(number) {
                return Err(self.duplicate(number));
            }
            if delivery.in_process.is_none() {
                let next = delivery.highest_completed + 1;
                if number == next || can_skip {
                    delivery.in_process = Some(number);
                    return Ok(());
                }
            }
            match deadline {
                Some(d) => {
                    if self.delivery_cond.wait_until(&mut delivery, d).timed_out() {
                        return Err(RmError::DeliveryTimeout {
                            sequence: self.identifier.clone(),
                            number,
                        });
                    }
                }
                None => self.delivery_cond.wait(&mut delivery),
            }
        }
    }

    fn processing_complete(&self, number: u64) {
        let mut delivery = self.delivery.lock();
        if delivery.in_process == Some(number) {
            delivery.in_process = None;
        }
        if number > delivery.highest_completed {
            delivery.highest_completed = number;
        }
        drop(delivery);
        self.delivery_cond.notify_all();
    }

    /// Highest number whose in-order delivery completed.
    pub fn highest_completed(&self) -> u64 {
        self.delivery.lock().highest_completed
    }

    fn duplicate(&self, number: u64) -> RmError {
        RmError::DuplicateMessage {
            sequence: self.identifier.clone(),
            number,
        }
    }

    /// Whether an acknowledgement is due.
    pub fn send_acknowledgement(&self) -> bool {
        self.ack_pending.load(Ordering::Acquire)
    }

    /// Clear the pending flag after an acknowledgement went out.
    pub fn acknowledgment_sent(&self) {
        self.ack_pending.store(false, Ordering::Release);
    }

    /// Acks can ride on the back-channel only when acks-to is anonymous.
    pub fn can_piggyback_ack_on_partial_response(&self) -> bool {
        self.acks_to.is_anonymous()
    }

    /// Pick immediate or deferred acknowledgement from the observed rate.
    pub fn schedule_acknowledgement(&self, interval: Duration) {
        let threshold = self.config.destination_policy.acks.intra_message_threshold;
        if !interval.is_zero() && self.message_rate() >= threshold {
            self.schedule_deferred_acknowledgement(interval);
        } else {
            self.schedule_immediate_acknowledgement();
        }
    }

    /// Mark an ack due now, with an out-of-band fallback if nothing sends it.
    pub fn schedule_immediate_acknowledgement(&self) {
        self.ack_pending.store(true, Ordering::Release);

        let Some(binding) = self.binding.get() else {
            return;
        };
        let mut timers = self.timers.lock();
        if timers.fallback.as_ref().is_some_and(TimerHandle::is_pending) {
            return;
        }
        let task = AckTask {
            owner: binding.owner.clone(),
            sequence: self.identifier.clone(),
            kind: AckTaskKind::Fallback,
        };
        timers.fallback = Some(
            binding
                .timer
                .schedule(self.config.immediate_acks_timeout(), move || task.run()),
        );
    }

    /// Arm the deferred acknowledgement timer. No-op while one is pending.
    pub fn schedule_deferred_acknowledgement(&self, delay: Duration) {
        let Some(binding) = self.binding.get() else {
            self.ack_pending.store(true, Ordering::Release);
            return;
        };
        let mut timers = self.timers.lock();
        if timers.deferred.as_ref().is_some_and(TimerHandle::is_pending) {
            return;
        }
        let task = AckTask {
            owner: binding.owner.clone(),
            sequence: self.identifier.clone(),
            kind: AckTaskKind::Deferred,
        };
        log::debug!(
            "[destination] deferred ack for {} in {:?}",
            self.identifier,
            delay
        );
        timers.deferred = Some(binding.timer.schedule(delay, move || task.run()));
    }

    /// 1 while a deferred acknowledgement is scheduled, else 0.
    pub fn deferred_acknowledgement_count(&self) -> usize {
        usize::from(
            self.timers
                .lock()
                .deferred
                .as_ref()
                .is_some_and(TimerHandle::is_pending),
        )
    }

    pub fn cancel_deferred_acknowledgments(&self) {
        let mut timers = self.timers.lock();
        for handle in [timers.deferred.take(), timers.fallback.take()]
            .into_iter()
            .flatten()
        {
            handle.cancel();
        }
    }

    /// Start inactivity supervision. Zero disables it.
    pub fn schedule_sequence_termination(&self, inactivity: Duration) {
        if inactivity.is_zero() {
            return;
        }
        let mut timers = self.timers.lock();
        if inactivity > timers.max_inactivity {
            timers.max_inactivity = inactivity;
        }
        if timers.termination.as_ref().is_some_and(TimerHandle::is_pending) {
            return;
        }
        let delay = timers.max_inactivity;
        self.arm_termination(&mut timers, delay);
    }

    fn arm_termination(&self, timers: &mut SequenceTimers, delay: Duration) {
        let Some(binding) = self.binding.get() else {
            return;
        };
        let task = TerminationTask {
            owner: binding.owner.clone(),
            sequence: self.identifier.clone(),
        };
        timers.termination = Some(binding.timer.schedule(delay, move || task.run()));
    }

    pub fn cancel_termination(&self) {
        if let Some(handle) = self.timers.lock().termination.take() {
            handle.cancel();
        }
    }

    pub fn has_termination_scheduled(&self) -> bool {
        self.timers
            .lock()
            .termination
            .as_ref()
            .is_some_and(TimerHandle::is_pending)
    }

    /// Time left before inactivity termination, or `None` if it is due.
    ///
    /// The clock restarts at the later of the endpoint's last activity and
    /// this sequence's creation.
    pub fn termination_remaining(
        &self,
        last_activity: Option<Instant>,
        inactivity: Duration,
        now: Instant,
    ) -> Option<Duration> {
        let since = last_activity.map_or(self.created, |t| t.max(self.created));
        let deadline = since + inactivity;
        if now >= deadline {
            None
        } else {
            Some(deadline - now)
        }
    }

    /// Mark the sequence terminated, cancel its timers and release waiters.
    pub fn terminate(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.state == DestinationState::Terminated {
                return;
            }
            inner.state = DestinationState::Terminated;
        }
        self.cancel_deferred_acknowledgments();
        self.cancel_termination();
        self.close_delivery(DeliveryClosed::Terminated);
        log::info!("[destination] sequence {} terminated", self.identifier);
    }

    /// Cancel timers and fail every caller parked for in-order delivery.
    pub fn shutdown(&self) {
        self.cancel_deferred_acknowledgments();
        self.cancel_termination();
        self.close_delivery(DeliveryClosed::Shutdown);
    }

    fn close_delivery(&self, reason: DeliveryClosed) {
        let mut delivery = self.delivery.lock();
        if delivery.closed.is_none() {
            delivery.closed = Some(reason);
        }
        drop(delivery);
        self.delivery_cond.notify_all();
    }

    /// Record that `number` reached the application.
    pub fn mark_delivered(&self, number: u64) {
        if !self.is_acknowledged(number) {
            return;
        }
        self.delivery.lock().delivered.acknowledge(number);
    }

    /// Drop stored copies of delivered messages numbered `below` or lower.
    ///
    /// Messages still waiting for (re)delivery keep their copies. Returns
    /// the purged numbers.
    pub fn purge_acknowledged(&self, below: u64) -> Vec<u64> {
        let purged: Vec<u64> = {
            let mut delivery = self.delivery.lock();
            let purged = delivery
                .delivered
                .ranges()
                .iter()
                .take_while(|r| r.lower <= below)
                .flat_map(|r| r.lower..=r.upper.min(below))
                .collect();
            delivery.delivered.purge(below);
            purged
        };
        if purged.is_empty() {
            return purged;
        }
        if let Some(store) = self.binding.get().and_then(|b| b.store.as_ref()) {
            store::log_failure(
                "purge_acknowledged",
                store.remove_messages(&self.identifier, &purged, false),
            );
        }
        purged
    }

    /// Write the sequence state and an optional message copy to the store.
    pub fn persist_incoming(&self, endpoint: &str, message: Option<&StoredMessage>) {
        if let Some(store) = self.binding.get().and_then(|b| b.store.as_ref()) {
            store::log_failure(
                "persist_incoming",
                store.persist_incoming(&self.to_record(endpoint), message),
            );
        }
    }

    fn mark_terminating(&self) {
        let mut inner = self.inner.lock();
        if inner.state == DestinationState::Active {
            inner.state = DestinationState::Terminating;
        }
    }
}

impl std::fmt::Debug for DestinationSequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationSequence")
            .field("identifier", &self.identifier)
            .field("acks_to", &self.acks_to.address)
            .field("state", &self.state())
            .finish()
    }
}

/// Marks in-order completion of a delivered message when dropped.
#[must_use = "dropping the permit immediately marks the message as delivered"]
pub struct DeliveryPermit<'a> {
    sequence: &'a DestinationSequence,
    number: u64,
    ordered: bool,
}

impl std::fmt::Debug for DeliveryPermit<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryPermit")
            .field("sequence", &self.sequence.identifier)
            .field("number", &self.number)
            .field("ordered", &self.ordered)
            .finish()
    }
}

impl DeliveryPermit<'_> {
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Explicitly mark delivery as finished.
    pub fn complete(self) {}
}

impl Drop for DeliveryPermit<'_> {
    fn drop(&mut self) {
        if self.ordered {
            self.sequence.processing_complete(self.number);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum AckTaskKind {
    Deferred,
    Fallback,
}

struct AckTask {
    owner: Weak<dyn DestinationOwner>,
    sequence: Identifier,
    kind: AckTaskKind,
}

impl AckTask {
    fn run(self) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        let Some(seq) = owner.destination_sequence(&self.sequence) else {
            return;
        };
        {
            let mut timers = seq.timers.lock();
            match self.kind {
                AckTaskKind::Deferred => timers.deferred = None,
                AckTaskKind::Fallback => timers.fallback = None,
            }
        }
        match self.kind {
            AckTaskKind::Deferred => {
                seq.ack_pending.store(true, Ordering::Release);
                owner.send_acknowledgement(&seq);
            }
            AckTaskKind::Fallback => {
                if seq.send_acknowledgement() {
                    owner.send_acknowledgement(&seq);
                }
            }
        }
    }
}

struct TerminationTask {
    owner: Weak<dyn DestinationOwner>,
    sequence: Identifier,
}

impl TerminationTask {
    fn run(self) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        let Some(seq) = owner.destination_sequence(&self.sequence) else {
            return;
        };

        let mut timers = seq.timers.lock();
        timers.termination = None;
        let inactivity = timers.max_inactivity;
        match seq.termination_remaining(owner.last_activity(), inactivity, Instant::now()) {
            Some(remaining) => seq.arm_termination(&mut timers, remaining),
            None => {
                drop(timers);
                log::warn!(
                    "[destination] sequence {} inactive for {:?}, terminating",
                    seq.identifier,
                    inactivity
                );
                seq.mark_terminating();
                owner.terminate_inactive(&seq);
            }
        }
    }
}
