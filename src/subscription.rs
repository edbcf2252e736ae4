//! The single topic subscription and message dispatch.

use crate::error::Error;
use crate::frame::{Command, Frame};
use crate::handler::SubscriptionHandler;
use crate::stomp::StompSession;
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use std::panic::AssertUnwindSafe;

/// Subscription id used on the wire
pub const SUBSCRIPTION_ID: &str = "sub-0";

/// A decoded MESSAGE
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage<M> {
    /// Destination the broker delivered on
    pub destination: String,
    /// Broker-assigned `message-id`, when present
    pub message_id: Option<String>,
    pub payload: M,
}

/// Outcome of [`TopicSubscription::dispatch`]
#[derive(Debug)]
pub enum Dispatch {
    /// Handler ran to completion
    Delivered,
    /// Frame was not for this subscription
    Ignored,
    /// Body could not be decoded; handler not called
    DecodeFailed(Error),
    /// Handler panicked
    HandlerPanicked,
}

/// Subscription to one topic, re-registered on every session
#[derive(Debug, Clone)]
pub struct TopicSubscription {
    id: String,
    destination: String,
    registered: bool,
}

impl TopicSubscription {
    pub fn new(id: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            destination: destination.into(),
            registered: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Whether SUBSCRIBE went out on the current session
    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// SUBSCRIBE on the session
    pub async fn register(&mut self, session: &mut StompSession) -> Result<(), Error> {
        session.subscribe(&self.id, &self.destination).await?;
        self.registered = true;
        Ok(())
    }

    /// UNSUBSCRIBE, if registered. A no-op otherwise.
    pub async fn unregister(&mut self, session: &mut StompSession) -> Result<(), Error> {
        if !self.registered {
            return Ok(());
        }
        self.registered = false;
        session.unsubscribe(&self.id).await
    }

    /// Forget the registration after the session is gone
    pub fn reset(&mut self) {
        self.registered = false;
    }

    /// Whether a MESSAGE belongs to this subscription.
    ///
    /// Matches on the `subscription` header, falling back to the destination
    /// for brokers that omit it.
    pub fn matches(&self, frame: &Frame) -> bool {
        if frame.command != Command::Message {
            return false;
        }
        match frame.header("subscription") {
            Some(id) => id == self.id,
            None => frame.header("destination") == Some(self.destination.as_str()),
        }
    }

    /// Decode a MESSAGE body as JSON
    pub fn decode<M: DeserializeOwned>(&self, frame: &Frame) -> Result<InboundMessage<M>, Error> {
        let payload = serde_json::from_str(&frame.body)?;
        Ok(InboundMessage {
            destination: frame
                .header("destination")
                .unwrap_or(&self.destination)
                .to_string(),
            message_id: frame.header("message-id").map(str::to_string),
            payload,
        })
    }

    /// Decode a frame and hand it to the handler, isolating failures.
    pub async fn dispatch<H: SubscriptionHandler>(&self, frame: &Frame, handler: &H) -> Dispatch {
        if !self.matches(frame) {
            return Dispatch::Ignored;
        }

        let message = match self.decode::<H::Message>(frame) {
            Ok(message) => message,
            Err(e) => return Dispatch::DecodeFailed(e),
        };

        match AssertUnwindSafe(handler.on_message(message))
            .catch_unwind()
            .await
        {
            Ok(()) => Dispatch::Delivered,
            Err(_) => Dispatch::HandlerPanicked,
        }
    }
}
