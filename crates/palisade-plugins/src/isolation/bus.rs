//! Host-mediated message bus
//!
//! Plugins never hold references to each other. A publish goes through the
//! broker, which delivers copies into the bounded mailboxes of subscribers (or
//! one named recipient). A full mailbox drops the message.

use std::collections::{BTreeSet, HashMap};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::protocol::{BusMessage, Envelope, Inbound};

#[derive(Debug)]
struct Mailbox {
    sender: mpsc::Sender<Envelope<Inbound>>,
    can_receive: bool,
}

#[derive(Debug, Default)]
struct BusState {
    mailboxes: HashMap<String, Mailbox>,
    topics: HashMap<String, BTreeSet<String>>,
}

#[derive(Debug, Default)]
pub struct MessageBus {
    state: RwLock<BusState>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a plugin's inbound channel; only `can_receive` plugins get mail
    pub fn register(
        &self,
        plugin_id: &str,
        sender: mpsc::Sender<Envelope<Inbound>>,
        can_receive: bool,
    ) {
        self.state.write().mailboxes.insert(
            plugin_id.to_string(),
            Mailbox {
                sender,
                can_receive,
            },
        );
    }

    /// Detach a plugin and drop its subscriptions
    ///
    /// Only the registration made with `sender` is removed, so tearing down a
    /// stale context never detaches its replacement.
    pub fn unregister(&self, plugin_id: &str, sender: &mpsc::Sender<Envelope<Inbound>>) {
        let mut state = self.state.write();
        let current = state
            .mailboxes
            .get(plugin_id)
            .is_some_and(|m| m.sender.same_channel(sender));
        if !current {
            return;
        }
        state.mailboxes.remove(plugin_id);
        state.topics.retain(|_, subscribers| {
            subscribers.remove(plugin_id);
            !subscribers.is_empty()
        });
    }

    pub fn subscribe(&self, plugin_id: &str, topic: &str) {
        self.state
            .write()
            .topics
            .entry(topic.to_string())
            .or_default()
            .insert(plugin_id.to_string());
        debug!(plugin_id = %plugin_id, topic = %topic, "Subscribed");
    }

    pub fn subscribers(&self, topic: &str) -> Vec<String> {
        self.state
            .read()
            .topics
            .get(topic)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Deliver `message` to `to`, or to every subscriber of its topic
    ///
    /// Returns the number of mailboxes that accepted it. The sender never
    /// receives its own message.
    pub fn publish(&self, message: BusMessage, to: Option<&str>) -> usize {
        let state = self.state.read();
        let recipients: Vec<&String> = match to {
            Some(target) => state
                .mailboxes
                .get_key_value(target)
                .map(|(id, _)| vec![id])
                .unwrap_or_default(),
            None => state
                .topics
                .get(&message.topic)
                .map(|s| s.iter().collect())
                .unwrap_or_default(),
        };

        let mut delivered = 0;
        for recipient in recipients {
            if *recipient == message.from {
                continue;
            }
            let Some(mailbox) = state.mailboxes.get(recipient) else {
                continue;
            };
            if !mailbox.can_receive {
                debug!(recipient = %recipient, "Recipient lacks messaging permission");
                continue;
            }

            let envelope = Envelope::new(0, Inbound::Deliver(message.clone()));
            match mailbox.sender.try_send(envelope) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        from = %message.from,
                        recipient = %recipient,
                        topic = %message.topic,
                        "Mailbox full, message dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(recipient = %recipient, "Mailbox closed");
                }
            }
        }
        delivered
    }
}
