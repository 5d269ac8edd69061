// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reliable endpoint: the per-service owner of source and destination
//! sequences.
//!
//! # Outbound
//! [`RmEndpoint::send_application_message`] obtains (or creates through the
//! [`Proxy`]) the current source sequence, assigns the next number, stores a
//! copy and queues it for retransmission. Acknowledgements from the peer go
//! through [`RmEndpoint::process_acknowledgements`].
//!
//! # Inbound
//! [`RmEndpoint::receive`] records the message number and arranges the
//! acknowledgement; [`RmEndpoint::deliver`] additionally applies the delivery
//! assurance and hands the message to the application, queueing it for
//! redelivery if that fails.

pub mod destination;
pub mod source;

pub use destination::Destination;
pub use source::Source;

use crate::ack_range::SequenceAcknowledgement;
use crate::config::RmConfiguration;
use crate::error::{Result, RmError, SequenceFault};
use crate::identifier::{Identifier, IdentifierGenerator};
use crate::message::{EndpointReference, MessageContext, RmMessage, SequenceHeader};
use crate::metrics::RmMetrics;
use crate::monitor::MessageCallback;
use crate::proxy::{CreateSequenceRequest, CreateSequenceResponse, Offer, Proxy};
use crate::redelivery::RedeliveryQueue;
use crate::retransmission::RetransmissionQueue;
use crate::sequence::destination::{DestinationOwner, DestinationSequence};
use crate::sequence::source::SourceSequence;
use crate::store::{log_failure, RmStore};
use crate::timer::TimerService;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Facilities an endpoint shares with the rest of its manager.
#[derive(Clone)]
pub(crate) struct EndpointServices {
    pub(crate) timer: Arc<TimerService>,
    pub(crate) retransmission: Arc<RetransmissionQueue>,
    pub(crate) redelivery: Arc<RedeliveryQueue>,
    pub(crate) store: Option<Arc<dyn RmStore>>,
    pub(crate) id_generator: Arc<dyn IdentifierGenerator>,
    pub(crate) metrics: Arc<RmMetrics>,
}

#[derive(Debug, Default)]
struct Activity {
    last_application: Option<Instant>,
    last_control: Option<Instant>,
    application_messages: u64,
    control_messages: u64,
}

/// Message counters of an endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EndpointActivity {
    pub application_messages: u64,
    pub control_messages: u64,
    /// Time since the last application message.
    pub since_application: Option<Duration>,
    /// Time since the last control message.
    pub since_control: Option<Duration>,
}

pub struct RmEndpoint {
    name: String,
    config: RmConfiguration,
    proxy: Arc<dyn Proxy>,
    services: EndpointServices,
    source: Source,
    destination: Destination,
    activity: Mutex<Activity>,
    callback: RwLock<Option<Arc<dyn MessageCallback>>>,
    shut_down: AtomicBool,
    this: Weak<RmEndpoint>,
}

impl RmEndpoint {
    pub(crate) fn new(
        name: impl Into<String>,
        config: RmConfiguration,
        proxy: Arc<dyn Proxy>,
        services: EndpointServices,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|this| Self {
            source: Source::new(name.clone(), services.store.clone()),
            destination: Destination::new(
                name.clone(),
                services.store.clone(),
                Arc::clone(&services.metrics),
            ),
            name,
            config,
            proxy,
            services,
            activity: Mutex::new(Activity::default()),
            callback: RwLock::new(None),
            shut_down: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RmConfiguration {
        &self.config
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn metrics(&self) -> &Arc<RmMetrics> {
        &self.services.metrics
    }

    pub fn retransmission_queue(&self) -> &Arc<RetransmissionQueue> {
        &self.services.retransmission
    }

    pub fn redelivery_queue(&self) -> &Arc<RedeliveryQueue> {
        &self.services.redelivery
    }

    pub fn set_message_callback(&self, callback: Option<Arc<dyn MessageCallback>>) {
        *self.callback.write() = callback;
    }

    fn callback(&self) -> Option<Arc<dyn MessageCallback>> {
        self.callback.read().clone()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shut_down() {
            return Err(RmError::InvalidState(format!(
                "endpoint {} is shut down",
                self.name
            )));
        }
        Ok(())
    }

    fn record_activity(&self, application: bool) {
        let now = Instant::now();
        let mut activity = self.activity.lock();
        if application {
            activity.last_application = Some(now);
            activity.application_messages += 1;
        } else {
            activity.last_control = Some(now);
            activity.control_messages += 1;
        }
    }

    pub fn activity(&self) -> EndpointActivity {
        let activity = self.activity.lock();
        EndpointActivity {
            application_messages: activity.application_messages,
            control_messages: activity.control_messages,
            since_application: activity.last_application.map(|t| t.elapsed()),
            since_control: activity.last_control.map(|t| t.elapsed()),
        }
    }

    fn owner(&self) -> Weak<dyn DestinationOwner> {
        self.this.clone()
    }

    /// Bind and register a destination sequence.
    pub(crate) fn register_destination(
        &self,
        seq: DestinationSequence,
        persist: bool,
    ) -> Arc<DestinationSequence> {
        seq.bind(
            Arc::clone(&self.services.timer),
            self.owner(),
            self.services.store.clone(),
        );
        let seq = Arc::new(seq);
        self.destination.add_sequence(Arc::clone(&seq), persist);
        seq
    }

    /// Attach the retransmission queue and register a source sequence.
    pub(crate) fn register_source(
        &self,
        seq: SourceSequence,
        persist: bool,
    ) -> Arc<SourceSequence> {
        let seq = Arc::new(seq);
        seq.attach_retransmission_queue(Arc::clone(&self.services.retransmission));
        self.source.add_sequence(Arc::clone(&seq), persist);
        seq
    }

    /// Create a source sequence with the peer at `target`.
    ///
    /// With `include_offer`, a reciprocal inbound sequence is offered and
    /// registered if the peer accepts it.
    pub fn create_source_sequence(
        &self,
        target: &EndpointReference,
    ) -> Result<Arc<SourceSequence>> {
        self.ensure_running()?;
        let protocol = self.config.protocol;
        let policy = &self.config.source_policy;
        let offer = policy.include_offer.then(|| Offer {
            identifier: self.services.id_generator.generate(),
            expires: policy.offered_sequence_expiration_ms.map(Duration::from_millis),
        });
        let request = CreateSequenceRequest {
            acks_to: EndpointReference::anonymous_for(protocol.addressing_namespace()),
            expires: self.config.sequence_expiration(),
            offer: offer.clone(),
        };

        let response = self.proxy.create_sequence(target, &request)?;
        self.record_activity(false);

        let mut seq = SourceSequence::new(response.identifier.clone(), protocol)
            .with_target(target.clone())
            .with_termination_policy(self.config.termination_policy().clone());
        if let Some(expires) = response.expires {
            seq = seq.with_lifetime(expires);
        }
        let seq = self.register_source(seq, true);
        self.services.metrics.increment_sequences_created();
        log::info!(
            "[endpoint:{}] created source sequence {} to {}",
            self.name,
            seq.identifier(),
            target.address
        );

        if let (Some(offer), true) = (offer, response.offer_accepted) {
            let dest =
                DestinationSequence::new(offer.identifier, target.clone(), self.config.clone());
            let dest = self.register_destination(dest, true);
            self.services.metrics.increment_sequences_created();
            log::debug!(
                "[endpoint:{}] peer accepted offered sequence {}",
                self.name,
                dest.identifier()
            );
        }
        Ok(seq)
    }

    /// Handle a `CreateSequence` request from a peer.
    pub fn create_sequence(
        &self,
        request: &CreateSequenceRequest,
    ) -> Result<CreateSequenceResponse> {
        self.ensure_running()?;
        self.record_activity(false);

        let id = self.services.id_generator.generate();
        let dest =
            DestinationSequence::new(id.clone(), request.acks_to.clone(), self.config.clone());
        self.register_destination(dest, true);
        self.services.metrics.increment_sequences_created();

        let mut offer_accepted = false;
        if let Some(offer) = &request.offer {
            let mut seq = SourceSequence::new(offer.identifier.clone(), self.config.protocol)
                .with_offering_id(id.clone())
                .with_target(request.acks_to.clone())
                .with_termination_policy(self.config.termination_policy().clone());
            if let Some(expires) = offer.expires {
                seq = seq.with_lifetime(expires);
            }
            let seq = self.register_source(seq, true);
            self.source.set_current(Some(&id), seq);
            self.services.metrics.increment_sequences_created();
            offer_accepted = true;
        }

        log::info!(
            "[endpoint:{}] created destination sequence {} (offer accepted: {})",
            self.name,
            id,
            offer_accepted
        );
        Ok(CreateSequenceResponse {
            identifier: id,
            expires: request.expires,
            offer_accepted,
        })
    }

    /// Number `message` on the current sequence and queue it for
    /// retransmission. Returns the message to put on the wire.
    ///
    /// `in_seq` is the inbound sequence this message responds to, if any.
    pub fn send_application_message(
        &self,
        message: RmMessage,
        target: &EndpointReference,
        in_seq: Option<&Identifier>,
    ) -> Result<RmMessage> {
        self.send_numbered(message, target, in_seq, false)
    }

    /// Like [`send_application_message`](Self::send_application_message) but
    /// closes the sequence with this message.
    pub fn send_last_application_message(
        &self,
        message: RmMessage,
        target: &EndpointReference,
        in_seq: Option<&Identifier>,
    ) -> Result<RmMessage> {
        self.send_numbered(message, target, in_seq, true)
    }

    fn send_numbered(
        &self,
        mut message: RmMessage,
        target: &EndpointReference,
        in_seq: Option<&Identifier>,
        last: bool,
    ) -> Result<RmMessage> {
        self.ensure_running()?;
        let seq = self
            .source
            .sequence_for(in_seq, || self.create_source_sequence(target))?;

        let number = if last {
            seq.next_last_message_number()?
        } else {
            seq.next_message_number()?
        };
        let is_last = seq.is_last_message();
        message.rm.sequence = Some(SequenceHeader {
            identifier: seq.identifier().clone(),
            message_number: number,
            last_message: is_last && seq.protocol().uses_last_message_header(),
        });
        if message.addressing.to.is_none() {
            message.addressing.to = Some(target.address.clone());
        }
        self.add_acknowledgements(&mut message, target);

        if let Some(store) = &self.services.store {
            log_failure(
                "persist_outgoing",
                store.persist_outgoing(&seq.to_record(&self.name), message.to_stored().as_ref()),
            );
        }
        self.services
            .retransmission
            .add_unacknowledged(message.clone(), &self.config)?;
        self.services.metrics.increment_sent();
        self.record_activity(true);
        if let Some(cb) = self.callback() {
            cb.message_accepted(seq.identifier(), number);
        }

        if is_last {
            self.close_source_sequence(&seq, true);
        }
        Ok(message)
    }

    /// Attach pending acknowledgements that may travel with a message to
    /// `target`.
    pub fn add_acknowledgements(&self, message: &mut RmMessage, target: &EndpointReference) {
        for seq in self.destination.all_sequences() {
            if !seq.send_acknowledgement() {
                continue;
            }
            if seq.acks_to() != target && !seq.can_piggyback_ack_on_partial_response() {
                continue;
            }
            message.rm.acknowledgements.push(seq.acknowledgement());
            seq.cancel_deferred_acknowledgments();
            seq.acknowledgment_sent();
        }
    }

    /// Tell the peer no more messages follow on `seq`.
    ///
    /// `header_sent` is set when the final application message already
    /// carried the RM 1.0 `LastMessage` marker.
    pub(crate) fn close_source_sequence(&self, seq: &SourceSequence, header_sent: bool) {
        let result = if !seq.protocol().uses_last_message_header() {
            self.proxy.close_sequence(seq)
        } else if !header_sent {
            self.proxy.last_message(seq)
        } else {
            Ok(())
        };
        if let Err(e) = result {
            log::warn!(
                "[endpoint:{}] close of {} failed: {}",
                self.name,
                seq.identifier(),
                e
            );
        }
        seq.mark_closing();
    }

    /// Apply the `SequenceAcknowledgement` headers of an inbound message.
    pub fn process_acknowledgements(&self, message: &dyn MessageContext) -> Result<()> {
        let acknowledgements = &message.rm_properties().acknowledgements;
        if acknowledgements.is_empty() {
            return Ok(());
        }
        if message.rm_properties().is_control() {
            self.record_activity(false);
        }
        for ack in acknowledgements {
            self.apply_acknowledgement(ack)?;
        }
        Ok(())
    }

    fn apply_acknowledgement(&self, ack: &SequenceAcknowledgement) -> Result<()> {
        let seq = self
            .source
            .get_sequence(&ack.identifier)
            .ok_or_else(|| SequenceFault::unknown_sequence(ack.identifier.clone()))?;
        let purged = seq.set_acknowledged(&ack.ranges)?;
        if let Some(cb) = self.callback() {
            for n in &purged {
                cb.message_acknowledged(seq.identifier(), *n);
            }
        }
        if seq.all_acknowledged() {
            self.terminate_source_sequence(&seq);
        }
        Ok(())
    }

    /// Send `TerminateSequence` for a completed source sequence and drop it.
    pub(crate) fn terminate_source_sequence(&self, seq: &SourceSequence) {
        if let Err(e) = self.proxy.terminate(seq) {
            log::warn!(
                "[endpoint:{}] terminate of {} failed: {}",
                self.name,
                seq.identifier(),
                e
            );
        }
        self.discard_source_sequence(seq, false);
    }

    pub(crate) fn discard_source_sequence(&self, seq: &SourceSequence, inactive: bool) {
        seq.terminate();
        self.services.retransmission.stop(seq.identifier());
        self.source.remove_sequence(seq.identifier());
        self.services.metrics.increment_sequences_terminated(inactive);
        log::info!(
            "[endpoint:{}] source sequence {} terminated",
            self.name,
            seq.identifier()
        );
    }

    /// Record an inbound application message.
    ///
    /// Piggybacked acknowledgements and ack requests are processed too.
    /// Returns the destination sequence the message belongs to.
    pub fn receive(&self, message: &dyn MessageContext) -> Result<Arc<DestinationSequence>> {
        self.ensure_running()?;
        self.record_activity(true);
        self.process_acknowledgements(message)?;

        let (seq, _) = self.destination.acknowledge(message)?;
        if let Some(id) = &message.rm_properties().close_sequence {
            if id == seq.identifier() {
                self.close_sequence(id)?;
            }
        }
        for id in &message.rm_properties().acks_requested {
            self.ack_requested(id)?;
        }
        Ok(seq)
    }

    /// Receive `message` and hand it to `deliver` under the configured
    /// delivery assurance.
    ///
    /// Duplicates come back as [`RmError::DuplicateMessage`]. If `deliver`
    /// fails the message is queued for redelivery and the error returned.
    pub fn deliver<F>(&self, message: &dyn MessageContext, deliver: F) -> Result<()>
    where
        F: FnOnce(&dyn MessageContext) -> Result<()>,
    {
        let seq = self.receive(message)?;
        let number = message.message_number().unwrap_or_default();
        let permit = match seq.apply_delivery_assurance(number) {
            Ok(permit) => permit,
            Err(e) => {
                if e.is_duplicate() {
                    self.services.metrics.increment_duplicates();
                }
                return Err(e);
            }
        };

        match deliver(message) {
            Ok(()) => {
                drop(permit);
                seq.mark_delivered(number);
                seq.purge_acknowledged(number);
                Ok(())
            }
            Err(e) => {
                log::warn!(
                    "[endpoint:{}] delivery of {}#{} failed: {}",
                    self.name,
                    seq.identifier(),
                    number,
                    e
                );
                let queued = self.services.redelivery.add_undelivered(
                    RmMessage::from_context(message),
                    &self.config.destination_policy.retry,
                );
                drop(permit);
                queued?;
                Err(e)
            }
        }
    }

    /// Handle `AckRequested` for inbound sequence `id`.
    pub fn ack_requested(&self, id: &Identifier) -> Result<()> {
        let seq = self.destination.require(id)?;
        self.record_activity(false);
        self.dispatch_acknowledgement(&seq)
    }

    /// Handle `CloseSequence` for inbound sequence `id`.
    ///
    /// No numbers above the highest received are accepted afterwards.
    /// Returns the final acknowledgement.
    pub fn close_sequence(&self, id: &Identifier) -> Result<SequenceAcknowledgement> {
        let seq = self.destination.require(id)?;
        self.record_activity(false);
        seq.close();
        seq.persist_incoming(&self.name, None);
        seq.cancel_deferred_acknowledgments();
        seq.acknowledgment_sent();
        Ok(seq.acknowledgement())
    }

    /// Handle `TerminateSequence` for inbound sequence `id`.
    pub fn terminate_sequence(&self, id: &Identifier) -> Result<()> {
        let seq = self.destination.require(id)?;
        self.record_activity(false);
        self.discard_destination_sequence(&seq, false);
        Ok(())
    }

    pub(crate) fn discard_destination_sequence(
        &self,
        seq: &DestinationSequence,
        inactive: bool,
    ) {
        seq.terminate();
        self.services.redelivery.stop(seq.identifier());
        self.destination.remove_sequence(seq.identifier());
        self.services.metrics.increment_sequences_terminated(inactive);
    }

    /// Send a standalone acknowledgement through the proxy.
    pub fn dispatch_acknowledgement(&self, seq: &DestinationSequence) -> Result<()> {
        let result = self.proxy.acknowledge(seq);
        self.services.metrics.record_ack(result.is_ok());
        match &result {
            Ok(()) => seq.acknowledgment_sent(),
            Err(e) => log::warn!(
                "[endpoint:{}] acknowledgement for {} failed: {}",
                self.name,
                seq.identifier(),
                e
            ),
        }
        result
    }

    /// Cancel timers and stop queues for every sequence of this endpoint.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        for seq in self.destination.all_sequences() {
            seq.shutdown();
            self.services.redelivery.stop(seq.identifier());
        }

        let terminate = self.config.termination_policy().terminate_on_shutdown;
        for seq in self.source.all_sequences() {
            let open = !seq.is_terminated() && !seq.is_last_message();
            if terminate && open && !seq.all_acknowledged() {
                match self.proxy.last_message(&seq) {
                    Ok(()) => seq.mark_closing(),
                    Err(e) => log::warn!(
                        "[endpoint:{}] last message for {} failed: {}",
                        self.name,
                        seq.identifier(),
                        e
                    ),
                }
            }
            self.services.retransmission.stop(seq.identifier());
        }
        log::info!("[endpoint:{}] shut down", self.name);
    }
}

impl DestinationOwner for RmEndpoint {
    fn destination_sequence(&self, id: &Identifier) -> Option<Arc<DestinationSequence>> {
        self.destination.get_sequence(id)
    }

    fn send_acknowledgement(&self, sequence: &DestinationSequence) {
        let _ = self.dispatch_acknowledgement(sequence);
    }

    fn last_activity(&self) -> Option<Instant> {
        let activity = self.activity.lock();
        activity.last_application.max(activity.last_control)
    }

    fn terminate_inactive(&self, sequence: &DestinationSequence) {
        self.discard_destination_sequence(sequence, true);
        for src in self.source.all_sequences() {
            if src.offered_by(sequence.identifier()) {
                self.discard_source_sequence(&src, true);
            }
        }
    }
}

impl std::fmt::Debug for RmEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RmEndpoint")
            .field("name", &self.name)
            .field("sources", &self.source.len())
            .field("destinations", &self.destination.len())
            .finish()
    }
}
