//! Inbound mapping
//!
//! Messages the remote broker sends on a bridge's remote subscriptions are
//! mapped through the same forwarding policy as outbound ones (hop limit,
//! destination template, QoS ceiling, retain policy, custom properties) and
//! handed to the gateway.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::config::BridgeConfig;
use crate::forwarder::{ForwardPolicy, TemplateError};
use crate::message::QoS;
use crate::metrics::BridgeMetrics;
use crate::remote::{InboundCallback, RemotePublish, RemoteSubscriptionRequest};
use crate::topic::topic_matches_filter;

/// A remote message mapped for local delivery
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Bridge the message arrived on
    pub bridge_id: String,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    pub user_properties: Vec<(String, String)>,
}

/// Gateway side receiving messages from remote brokers
pub trait InboundHandler: Send + Sync {
    fn handle(&self, message: InboundMessage);
}

impl<F> InboundHandler for F
where
    F: Fn(InboundMessage) + Send + Sync,
{
    fn handle(&self, message: InboundMessage) {
        self(message)
    }
}

struct Route {
    filters: Vec<String>,
    max_qos: QoS,
    policy: ForwardPolicy,
}

/// Maps messages received on a bridge's remote subscriptions
pub(crate) struct InboundMapper {
    bridge_id: String,
    routes: Vec<Route>,
}

impl InboundMapper {
    pub fn new(config: &BridgeConfig, max_hops: u32) -> Result<Self, TemplateError> {
        let routes = config
            .remote_subscriptions
            .iter()
            .map(|sub| {
                Ok(Route {
                    filters: sub.filters.clone(),
                    max_qos: sub.max_qos(),
                    policy: ForwardPolicy::inbound(&config.id, sub, max_hops)?,
                })
            })
            .collect::<Result<Vec<_>, TemplateError>>()?;

        Ok(Self {
            bridge_id: config.id.clone(),
            routes,
        })
    }

    /// Subscriptions to place on the remote broker
    ///
    /// `no_local` keeps the bridge from receiving its own outbound publishes.
    pub fn subscriptions(&self) -> Vec<RemoteSubscriptionRequest> {
        self.routes
            .iter()
            .flat_map(|route| {
                route.filters.iter().map(|filter| RemoteSubscriptionRequest {
                    filter: filter.clone(),
                    qos: route.max_qos,
                    no_local: true,
                })
            })
            .collect()
    }

    /// Map a remote message, or explain why it stays on the remote side
    pub fn map(&self, publish: RemotePublish, metrics: &BridgeMetrics) -> Option<InboundMessage> {
        let Some(route) = self.routes.iter().find(|route| {
            route
                .filters
                .iter()
                .any(|filter| topic_matches_filter(&publish.topic, filter))
        }) else {
            trace!(
                "Bridge '{}': no remote subscription matches '{}'",
                self.bridge_id,
                publish.topic
            );
            return None;
        };

        match route.policy.apply(
            &publish.topic,
            publish.payload,
            publish.qos,
            publish.retain,
            &publish.user_properties,
        ) {
            Ok(mapped) => Some(InboundMessage {
                bridge_id: self.bridge_id.clone(),
                topic: mapped.topic,
                payload: mapped.payload,
                qos: mapped.qos,
                retain: mapped.retain,
                user_properties: mapped.user_properties,
            }),
            Err(reason) => {
                debug!(
                    "Bridge '{}': dropping inbound message on '{}' ({})",
                    self.bridge_id, publish.topic, reason
                );
                metrics.message_dropped(&self.bridge_id, reason.as_str());
                None
            }
        }
    }

    /// Callback handed to the remote connection
    pub fn into_callback(
        self,
        handler: Arc<dyn InboundHandler>,
        metrics: Arc<BridgeMetrics>,
    ) -> InboundCallback {
        Arc::new(move |publish: RemotePublish| {
            if let Some(message) = self.map(publish, &metrics) {
                handler.handle(message);
            }
        })
    }
}
