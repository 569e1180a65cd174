//! Forwarders
//!
//! A forwarder pumps the messages of one local subscription of a bridge to
//! the remote broker. The dispatch engine feeds it messages read from its
//! queues and learns about every outcome through [`ForwarderHooks`]:
//!
//! - `after_forward` fires exactly once per message handed to
//!   [`Forwarder::on_message`], whatever happens to it
//! - `reset_inflight_marker` makes one message deliverable again and is
//!   always awaited before a `Failed` outcome is reported
//! - `reset_all_inflight_markers` runs for every owned queue after a reconnect
//! - `on_reconnect` tells the engine polling can resume

mod remote;
mod transform;


pub use remote::RemoteForwarder;
pub use transform::{ForwardPolicy, TemplateError, TopicTemplate};

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::message::{MessageId, QoS, QueuedMessage};
use crate::queue::QueueError;

/// Prefix of the shared group every forwarder's queues live in
pub const FORWARDER_GROUP_PREFIX: &str = "forwarder#";

/// Forwarder id for the `index`-th local subscription of a bridge
pub fn forwarder_id(bridge_id: &str, index: usize) -> String {
    format!("{}-{}", bridge_id, index)
}

/// Shared subscription group holding a forwarder's queues
pub fn shared_group(forwarder_id: &str) -> String {
    format!("{}{}", FORWARDER_GROUP_PREFIX, forwarder_id)
}

/// Queue id for one topic filter of a forwarder: `forwarder#<id>/<topic>`
pub fn queue_id(forwarder_id: &str, topic: &str) -> String {
    format!("{}{}/{}", FORWARDER_GROUP_PREFIX, forwarder_id, topic)
}

/// Why a message was not forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The message already crossed the maximum number of bridges
    HopLimit,
    /// The topic matched an exclusion filter
    Excluded,
}

impl DropReason {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::HopLimit => "loop",
            DropReason::Excluded => "excluded",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a message handed to a forwarder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The remote broker acknowledged the publish
    Delivered,
    /// Policy refused the message; it is never retried
    Dropped(DropReason),
    /// The message was not delivered and has been made redeliverable
    Failed,
}

/// Outcome report passed to `after_forward`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardResult {
    /// QoS the message was stored with
    pub qos: QoS,
    pub message_id: MessageId,
    pub forwarder_id: String,
    pub queue_id: String,
    pub outcome: ForwardOutcome,
}

impl ForwardResult {
    /// Whether the queue should forget the message for good
    pub fn settles_delivery(&self) -> bool {
        self.qos.is_acknowledged() && self.outcome != ForwardOutcome::Failed
    }
}

pub type AfterForwardFn = Arc<dyn Fn(ForwardResult) + Send + Sync>;
pub type ResetInflightMarkerFn = Arc<dyn Fn(String, MessageId) -> BoxFuture<'static, ()> + Send + Sync>;
pub type ResetAllInflightMarkersFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<(), QueueError>> + Send + Sync>;
pub type OnReconnectFn = Arc<dyn Fn() + Send + Sync>;

/// Completion contract between a forwarder and the dispatch engine
#[derive(Clone)]
pub struct ForwarderHooks {
    pub after_forward: AfterForwardFn,
    /// `(queue_id, message_id)`
    pub reset_inflight_marker: ResetInflightMarkerFn,
    /// `queue_id`
    pub reset_all_inflight_markers: ResetAllInflightMarkersFn,
    pub on_reconnect: OnReconnectFn,
}

impl fmt::Debug for ForwarderHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwarderHooks").finish_non_exhaustive()
    }
}

/// Message pump for one local subscription
///
/// `start`, `stop` and `on_message` may spawn tokio tasks, so they must be
/// called from within a tokio runtime.
pub trait Forwarder: Send + Sync {
    fn id(&self) -> &str;

    fn bridge_id(&self) -> &str;

    /// Topic filters this forwarder serves, one queue each
    fn topics(&self) -> &[String];

    /// Maximum messages kept per queue
    fn queue_limit(&self) -> Option<usize>;

    /// Begin operating with the engine's hooks
    fn start(&self, hooks: ForwarderHooks);

    /// Stop operating; later messages are released without publishing
    fn stop(&self);

    /// Handle a message read from `queue_id`
    fn on_message(&self, message: QueuedMessage, queue_id: &str);

    /// Messages received whose outcome is not reported yet (network + buffered)
    fn inflight_count(&self) -> usize;

    /// Publishes awaiting an acknowledgement from the remote broker
    fn network_inflight_count(&self) -> usize;

    /// Messages held locally while the connection is unavailable
    fn buffered_count(&self) -> usize;

    fn is_buffer_full(&self) -> bool;

    /// Whether the engine should hold off reading for this forwarder
    ///
    /// True while disconnected, while resuming after a reconnect and after stop.
    fn is_paused(&self) -> bool;

    /// Send every buffered message, in receive order
    fn drain_queue(&self);
}
