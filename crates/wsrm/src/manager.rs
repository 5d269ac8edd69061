// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registry of reliable endpoints and the services they share.
//!
//! One manager owns one timer thread, one retransmission queue and one
//! redelivery queue. Endpoints are looked up by name; there is no global
//! instance.

use crate::config::RmConfiguration;
use crate::endpoint::{EndpointServices, RmEndpoint};
use crate::error::Result;
use crate::identifier::{IdentifierGenerator, UuidIdentifierGenerator};
use crate::management::ManagedEndpoint;
use crate::message::RmMessage;
use crate::metrics::RmMetrics;
use crate::proxy::Proxy;
use crate::redelivery::{RedeliveryQueue, Redeliverer};
use crate::retransmission::{Resender, RetransmissionQueue};
use crate::sequence::destination::DestinationSequence;
use crate::sequence::source::SourceSequence;
use crate::store::RmStore;
use crate::timer::TimerService;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Builder for [`RmManager`].
pub struct RmManagerBuilder {
    config: RmConfiguration,
    store: Option<Arc<dyn RmStore>>,
    id_generator: Option<Arc<dyn IdentifierGenerator>>,
    metrics: Option<Arc<RmMetrics>>,
}

impl RmManagerBuilder {
    pub fn store(mut self, store: Arc<dyn RmStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn id_generator(mut self, generator: Arc<dyn IdentifierGenerator>) -> Self {
        self.id_generator = Some(generator);
        self
    }

    pub fn metrics(mut self, metrics: Arc<RmMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Validate the configuration and start the timer thread.
    pub fn build(self) -> Result<RmManager> {
        self.config.validate()?;
        let metrics = self.metrics.unwrap_or_default();
        let services = EndpointServices {
            timer: Arc::new(TimerService::new()?),
            retransmission: Arc::new(RetransmissionQueue::new(
                Arc::clone(&metrics),
                self.store.clone(),
            )),
            redelivery: Arc::new(RedeliveryQueue::new(
                Arc::clone(&metrics),
                self.store.clone(),
            )),
            store: self.store,
            id_generator: self
                .id_generator
                .unwrap_or_else(|| Arc::new(UuidIdentifierGenerator)),
            metrics,
        };
        Ok(RmManager {
            config: self.config,
            services,
            endpoints: RwLock::new(HashMap::new()),
        })
    }
}

pub struct RmManager {
    config: RmConfiguration,
    services: EndpointServices,
    endpoints: RwLock<HashMap<String, Arc<RmEndpoint>>>,
}

impl RmManager {
    pub fn builder(config: RmConfiguration) -> RmManagerBuilder {
        RmManagerBuilder {
            config,
            store: None,
            id_generator: None,
            metrics: None,
        }
    }

    /// In-memory manager with default identifiers and metrics.
    pub fn new(config: RmConfiguration) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &RmConfiguration {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<RmMetrics> {
        &self.services.metrics
    }

    pub fn store(&self) -> Option<&Arc<dyn RmStore>> {
        self.services.store.as_ref()
    }

    pub fn retransmission_queue(&self) -> &Arc<RetransmissionQueue> {
        &self.services.retransmission
    }

    pub fn redelivery_queue(&self) -> &Arc<RedeliveryQueue> {
        &self.services.redelivery
    }

    /// Start the resend and redelivery workers.
    pub fn start(&self, resender: Arc<dyn Resender>, redeliverer: Arc<dyn Redeliverer>) -> Result<()> {
        self.services.retransmission.start(resender)?;
        self.services.redelivery.start(redeliverer)?;
        log::info!("[manager] retransmission and redelivery workers started");
        Ok(())
    }

    /// Endpoint `name`, created with the manager configuration if absent.
    pub fn reliable_endpoint(&self, name: &str, proxy: Arc<dyn Proxy>) -> Arc<RmEndpoint> {
        self.reliable_endpoint_with_config(name, self.config.clone(), proxy)
    }

    /// Endpoint `name`, created with `config` if absent. An existing
    /// endpoint keeps its original configuration.
    pub fn reliable_endpoint_with_config(
        &self,
        name: &str,
        config: RmConfiguration,
        proxy: Arc<dyn Proxy>,
    ) -> Arc<RmEndpoint> {
        if let Some(existing) = self.endpoints.read().get(name) {
            return Arc::clone(existing);
        }
        let mut endpoints = self.endpoints.write();
        Arc::clone(endpoints.entry(name.to_string()).or_insert_with(|| {
            log::debug!("[manager] creating endpoint {}", name);
            RmEndpoint::new(name, config, proxy, self.services.clone())
        }))
    }

    pub fn endpoint(&self, name: &str) -> Option<Arc<RmEndpoint>> {
        self.endpoints.read().get(name).cloned()
    }

    pub fn endpoints(&self) -> Vec<Arc<RmEndpoint>> {
        let mut all: Vec<_> = self.endpoints.read().values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn managed_endpoint(&self, name: &str) -> Option<ManagedEndpoint> {
        self.endpoint(name).map(ManagedEndpoint::new)
    }

    /// Rebuild endpoint `name` from the store.
    ///
    /// Source sequences come back with their unacknowledged messages queued
    /// for retransmission; destination sequences with their undelivered
    /// messages queued for redelivery and inactivity supervision re-armed.
    /// Without a store this is [`reliable_endpoint`](Self::reliable_endpoint).
    pub fn recover_endpoint(&self, name: &str, proxy: Arc<dyn Proxy>) -> Result<Arc<RmEndpoint>> {
        let endpoint = self.reliable_endpoint(name, proxy);
        let Some(store) = self.services.store.clone() else {
            return Ok(endpoint);
        };
        let config = endpoint.config().clone();

        let sources = store.get_source_sequences(name)?;
        let mut requeued = 0;
        for record in &sources {
            let seq = SourceSequence::from_record(record, config.termination_policy().clone());
            let seq = endpoint.register_source(seq, false);
            for stored in store.get_messages(&record.identifier, true)? {
                let message = RmMessage::from_stored(record.identifier.clone(), &stored);
                self.services
                    .retransmission
                    .add_unacknowledged(message, &config)?;
                requeued += 1;
            }
            if seq.offering_id().is_none() && !seq.is_last_message() && !seq.is_expired() {
                endpoint.source().set_current(None, seq);
            }
        }

        let destinations = store.get_destination_sequences(name)?;
        let mut undelivered = 0;
        for record in &destinations {
            let seq = DestinationSequence::from_record(record, config.clone());
            let seq = endpoint.register_destination(seq, false);
            for stored in store.get_messages(&record.identifier, false)? {
                let message = RmMessage::from_stored(record.identifier.clone(), &stored);
                self.services
                    .redelivery
                    .add_undelivered(message, &config.destination_policy.retry)?;
                undelivered += 1;
            }
            if !seq.is_terminated() {
                seq.schedule_sequence_termination(config.inactivity_timeout());
            }
        }

        log::info!(
            "[manager] recovered endpoint {}: {} source / {} destination sequence(s), {} unacknowledged, {} undelivered",
            name,
            sources.len(),
            destinations.len(),
            requeued,
            undelivered
        );
        Ok(endpoint)
    }

    /// Shut down and forget endpoint `name`. Returns `false` if unknown.
    pub fn shutdown_endpoint(&self, name: &str) -> bool {
        let removed = self.endpoints.write().remove(name);
        match removed {
            Some(endpoint) => {
                endpoint.shutdown();
                true
            }
            None => false,
        }
    }

    /// Shut down every endpoint, then the workers and the timer.
    pub fn shutdown(&self) {
        let endpoints: Vec<_> = self.endpoints.write().drain().map(|(_, e)| e).collect();
        for endpoint in endpoints {
            endpoint.shutdown();
        }
        self.services.retransmission.shutdown();
        self.services.redelivery.shutdown();
        self.services.timer.shutdown();
    }
}

impl Drop for RmManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RmError;
    use crate::message::EndpointReference;
    use crate::proxy::{CreateSequenceRequest, CreateSequenceResponse};
    use crate::identifier::Identifier;

    struct NullProxy;

    impl Proxy for NullProxy {
        fn acknowledge(&self, _sequence: &DestinationSequence) -> Result<()> {
            Ok(())
        }

        fn last_message(&self, _sequence: &SourceSequence) -> Result<()> {
            Ok(())
        }

        fn terminate(&self, _sequence: &SourceSequence) -> Result<()> {
            Ok(())
        }

        fn create_sequence(
            &self,
            _target: &EndpointReference,
            _request: &CreateSequenceRequest,
        ) -> Result<CreateSequenceResponse> {
            Ok(CreateSequenceResponse {
                identifier: Identifier::new("created"),
                expires: None,
                offer_accepted: false,
            })
        }
    }

    #[test]
    fn test_endpoint_is_created_once() {
        let manager = RmManager::new(RmConfiguration::default()).unwrap();
        let a = manager.reliable_endpoint("svc", Arc::new(NullProxy));
        let b = manager.reliable_endpoint("svc", Arc::new(NullProxy));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.endpoints().len(), 1);
        assert!(manager.endpoint("other").is_none());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = RmConfiguration {
            base_retransmission_interval_ms: 0,
            ..RmConfiguration::default()
        };
        assert!(matches!(RmManager::new(config), Err(RmError::Config(_))));
    }

    #[test]
    fn test_shutdown_endpoint_rejects_further_sends() {
        let manager = RmManager::new(RmConfiguration::default()).unwrap();
        let endpoint = manager.reliable_endpoint("svc", Arc::new(NullProxy));
        assert!(manager.shutdown_endpoint("svc"));
        assert!(!manager.shutdown_endpoint("svc"));
        let err = endpoint
            .send_application_message(
                RmMessage::new(Default::default(), Vec::new()),
                &EndpointReference::new("http://peer/rm"),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, RmError::InvalidState(_)));
    }
}
