//! Handlers for inbound messages the session does not interpret itself.

use async_trait::async_trait;
use switchboard_core::Bus;
use switchboard_protocol::{codec, Envelope};
use tracing::trace;

/// The session an inbound message came from.
#[derive(Debug, Clone, Copy)]
pub struct Origin<'a> {
    /// Session ID.
    pub session: &'a str,
    /// Authenticated principal, if any.
    pub principal: Option<&'a str>,
}

/// Receives envelopes whose type is not a session control message.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    /// Handle one envelope. Errors are logged; the session stays open.
    async fn handle(&self, origin: Origin<'_>, envelope: Envelope) -> anyhow::Result<()>;
}

/// Republishes inbound envelopes on the bus.
///
/// The topic is the envelope's `type`; the payload is the encoded envelope.
#[derive(Clone)]
pub struct BusForwarder {
    bus: Bus,
}

impl BusForwarder {
    /// Create a forwarder publishing to `bus`.
    #[must_use]
    pub fn new(bus: Bus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl InboundHandler for BusForwarder {
    async fn handle(&self, origin: Origin<'_>, envelope: Envelope) -> anyhow::Result<()> {
        let payload = codec::encode(&envelope)?;
        let delivered = self.bus.publish(&envelope.kind, payload);
        trace!(
            session = %origin.session,
            topic = %envelope.kind,
            delivered,
            "Forwarded message to bus"
        );
        Ok(())
    }
}
