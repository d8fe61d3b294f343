//! Causal tracing across hops.
//!
//! Every process owns a [`VectorLog`]. Before dispatching a chain it packs a
//! small message together with its vector clock into the chain's opaque `log`
//! bytes; the receiving hop unpacks them and merges the sender's clock into its
//! own. The chain engine never looks inside those bytes.

use std::{
    collections::BTreeMap,
    sync::{Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, trace};

use crate::chain::RpcChain;

/// Maps process names to logical timestamps. Merging takes the per-process
/// maximum.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments `process`'s own counter and returns the new value.
    pub fn tick(&mut self, process: &str) -> u64 {
        let counter = self.0.entry(process.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn get(&self, process: &str) -> u64 {
        self.0.get(process).copied().unwrap_or_default()
    }

    pub fn merge(&mut self, other: &VectorClock) {
        for (process, counter) in &other.0 {
            let entry = self.0.entry(process.clone()).or_insert(0);
            *entry = (*entry).max(*counter);
        }
    }

    /// True if every component of `self` is `<=` the matching one in `other`
    /// and at least one is strictly smaller.
    pub fn happened_before(&self, other: &VectorClock) -> bool {
        let dominated = self.0.iter().all(|(process, counter)| *counter <= other.get(process));
        dominated && self != other && other.0.iter().any(|(process, counter)| self.get(process) < *counter)
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    process: String,
    label: String,
    clock: VectorClock,
    message: T,
}

/// The message a hop attaches to a chain it is about to dispatch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub content: String,
    /// Wall-clock seconds at the sender.
    pub real_timestamp: u64,
}

impl LogMessage {
    pub fn new(content: impl Into<String>) -> Self {
        let real_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self {
            content: content.into(),
            real_timestamp,
        }
    }
}

/// Per-process vector-clock log.
#[derive(Debug)]
pub struct VectorLog {
    process: String,
    clock: Mutex<VectorClock>,
}

impl VectorLog {
    pub fn new(process: impl Into<String>) -> Self {
        Self {
            process: process.into(),
            clock: Mutex::new(VectorClock::new()),
        }
    }

    pub fn process(&self) -> &str {
        &self.process
    }

    pub fn clock(&self) -> VectorClock {
        self.clock.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Ticks the local clock and encodes `message` with it.
    pub fn pack_send<T: Serialize>(&self, label: &str, message: &T) -> Vec<u8> {
        let clock = {
            let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
            clock.tick(&self.process);
            clock.clone()
        };
        trace!(process = %self.process, label, "send");

        let envelope = Envelope {
            process: self.process.clone(),
            label: label.to_string(),
            clock,
            message,
        };
        serde_json::to_vec(&envelope).unwrap_or_default()
    }

    /// Decodes bytes produced by [`VectorLog::pack_send`], merging the sender's
    /// clock into ours.
    pub fn unpack_receive<T: DeserializeOwned>(&self, label: &str, bytes: &[u8]) -> Result<T, serde_json::Error> {
        let envelope: Envelope<T> = serde_json::from_slice(bytes)?;

        let mut clock = self.clock.lock().unwrap_or_else(PoisonError::into_inner);
        clock.merge(&envelope.clock);
        clock.tick(&self.process);
        trace!(process = %self.process, from = %envelope.process, label, sender_label = %envelope.label, "receive");

        Ok(envelope.message)
    }

    /// Stamps `chain` before it leaves this process.
    pub fn stamp(&self, chain: &mut RpcChain, label: &str) {
        let bytes = self.pack_send(label, &LogMessage::new(format!("{label} {}", chain.id)));
        chain.attach_log(bytes);
    }

    /// Merges whatever clock `chain` carries. Undecodable logs are ignored.
    pub fn observe(&self, chain: &RpcChain, label: &str) {
        if chain.log.is_empty() {
            return;
        }
        if let Err(err) = self.unpack_receive::<LogMessage>(label, &chain.log) {
            debug!(chain = %chain.id, "dropping unreadable trace log: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_takes_component_maximum() {
        let mut a = VectorClock::new();
        a.tick("client");
        a.tick("client");
        let mut b = VectorClock::new();
        b.tick("client");
        b.tick("frontend");

        a.merge(&b);
        assert_eq!(a.get("client"), 2);
        assert_eq!(a.get("frontend"), 1);
        assert_eq!(a.get("metadata"), 0);
    }

    #[test]
    fn receive_orders_after_send() {
        let client = VectorLog::new("client");
        let frontend = VectorLog::new("frontend");

        let bytes = client.pack_send("store", &LogMessage::new("hello"));
        let sent = client.clock();
        let message: LogMessage = frontend.unpack_receive("store", &bytes).unwrap();

        assert_eq!(message.content, "hello");
        assert!(sent.happened_before(&frontend.clock()));
        assert!(!frontend.clock().happened_before(&sent));
    }

    #[test]
    fn chain_stamp_survives_the_trip() {
        let origin = VectorLog::new("client");
        let hop = VectorLog::new("metadata");
        let mut chain = RpcChain::new();

        origin.stamp(&mut chain, "FStore");
        assert!(!chain.log.is_empty());
        hop.observe(&chain, "MDStore");
        assert_eq!(hop.clock().get("client"), 1);
        assert_eq!(hop.clock().get("metadata"), 1);
    }

    #[test]
    fn garbage_is_rejected() {
        let log = VectorLog::new("auth");
        assert!(log.unpack_receive::<LogMessage>("x", b"not json").is_err());

        let mut chain = RpcChain::new();
        chain.attach_log(b"{".to_vec());
        log.observe(&chain, "AStore");
        assert_eq!(log.clock().get("auth"), 0);
    }
}
