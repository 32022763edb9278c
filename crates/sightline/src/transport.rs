//! In-process publish/subscribe transport for pipeline results.
//!
//! Every subscription keeps only the *latest* message per topic: a subscriber that falls behind
//! skips stale results instead of queueing them. Payloads are JSON documents.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Select, Sender, TrySendError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{Error, Result};

/// Well-known topic names.
pub mod topics {
    pub const FACE_BOX: &str = "face_box";
    pub const FACE_LANDMARK: &str = "face_landmark";
    pub const FACE_RESET: &str = "face_reset";
    pub const PALM_BOX: &str = "palm_box";
    pub const PALM_RESET: &str = "palm_reset";
    pub const HAND_LANDMARK: &str = "hand_landmark";
    pub const EYE_LANDMARK: &str = "eye_landmark";
    pub const IRIS_LANDMARK: &str = "iris_landmark";
    pub const EYE_ASPECT_RATIO: &str = "eye_aspect_ratio";
    pub const MOUTH_ASPECT_RATIO: &str = "mouth_aspect_ratio";
    pub const GAZE: &str = "gaze";
    pub const ROTATION: &str = "rotation";
    pub const HAND_GESTURE: &str = "hand_gesture";
}

/// A message published on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    payload: Vec<u8>,
}

impl Message {
    pub fn new<T: Serialize + ?Sized>(topic: &str, value: &T) -> Result<Self> {
        Ok(Self {
            topic: topic.to_string(),
            payload: serde_json::to_vec(value)?,
        })
    }

    /// A message without payload, signalling that the subject was lost.
    pub fn reset(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            payload: Vec::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn is_reset(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Publishing rates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum messages per second and topic.
    pub default_rate: u32,
    /// Per-topic overrides of `default_rate`.
    pub rates: HashMap<String, u32>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            default_rate: 30,
            rates: HashMap::new(),
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.default_rate == 0 {
            return Err(Error::InvalidConfig("default publishing rate must be non-zero".into()));
        }
        if let Some((topic, _)) = self.rates.iter().find(|(_, rate)| **rate == 0) {
            return Err(Error::InvalidConfig(format!(
                "publishing rate of topic '{topic}' must be non-zero"
            )));
        }
        Ok(())
    }
}

/// Per-topic rate limiter.
#[derive(Debug)]
pub struct Throttle {
    config: TransportConfig,
    next: HashMap<String, Instant>,
}

impl Throttle {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            next: HashMap::new(),
        }
    }

    fn interval(&self, topic: &str) -> Duration {
        let rate = self
            .config
            .rates
            .get(topic)
            .copied()
            .unwrap_or(self.config.default_rate)
            .max(1);
        Duration::from_secs(1) / rate
    }

    /// Returns whether a message on `topic` may be sent at `now`, and if so, schedules the next
    /// permitted time.
    pub fn allow(&mut self, topic: &str, now: Instant) -> bool {
        if let Some(&next) = self.next.get(topic) {
            if now < next {
                return false;
            }
        }
        let next = now + self.interval(topic);
        self.next.insert(topic.to_string(), next);
        true
    }
}

struct Slot {
    topic: String,
    sender: Sender<Message>,
    /// Second handle on the subscriber's queue, used to evict the stale message.
    evict: Receiver<Message>,
    /// Dead once the owning [`Subscription`] is dropped.
    alive: Weak<()>,
}

impl Slot {
    fn is_alive(&self) -> bool {
        self.alive.strong_count() > 0
    }
}

/// A cloneable handle to an in-process message bus.
#[derive(Clone, Default)]
pub struct Bus {
    slots: Arc<Mutex<Vec<Slot>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribes to `topics`.
    ///
    /// Dropping the returned [`Subscription`] unsubscribes.
    pub fn subscribe<'a, I: IntoIterator<Item = &'a str>>(&self, topics: I) -> Subscription {
        let token = Arc::new(());
        let mut slots = self.slots();
        slots.retain(Slot::is_alive);
        let receivers = topics
            .into_iter()
            .map(|topic| {
                let (sender, receiver) = crossbeam_channel::bounded(1);
                slots.push(Slot {
                    topic: topic.to_string(),
                    sender,
                    evict: receiver.clone(),
                    alive: Arc::downgrade(&token),
                });
                receiver
            })
            .collect();
        Subscription {
            receivers,
            _token: token,
        }
    }

    /// Delivers `message` to every subscriber of its topic, replacing any message the subscriber
    /// has not received yet.
    pub fn send(&self, message: Message) {
        let mut slots = self.slots();
        slots.retain(|slot| {
            if !slot.is_alive() {
                return false;
            }
            if slot.topic != message.topic {
                return true;
            }
            let mut msg = message.clone();
            loop {
                match slot.sender.try_send(msg) {
                    Ok(()) => return true,
                    Err(TrySendError::Full(m)) => {
                        let _stale = slot.evict.try_recv();
                        msg = m;
                    }
                    Err(TrySendError::Disconnected(_)) => return false,
                }
            }
        });
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.slots()
            .iter()
            .filter(|s| s.topic == topic && s.is_alive())
            .count()
    }
}

/// Publishes rate-limited messages onto a [`Bus`].
pub struct Publisher {
    bus: Bus,
    throttle: Throttle,
}

impl Publisher {
    pub fn new(bus: Bus, config: TransportConfig) -> Self {
        Self {
            bus,
            throttle: Throttle::new(config),
        }
    }

    /// Publishes `value` on `topic` unless the topic's rate limit was reached.
    ///
    /// Returns whether the message was sent.
    pub fn publish<T: Serialize + ?Sized>(&mut self, topic: &str, value: &T) -> Result<bool> {
        if !self.throttle.allow(topic, Instant::now()) {
            return Ok(false);
        }
        self.bus.send(Message::new(topic, value)?);
        Ok(true)
    }

    /// Publishes a reset message on `topic`.
    ///
    /// Resets are not rate limited.
    pub fn publish_reset(&mut self, topic: &str) {
        self.bus.send(Message::reset(topic));
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }
}

/// Receiving end of a [`Bus`] subscription.
pub struct Subscription {
    receivers: Vec<Receiver<Message>>,
    _token: Arc<()>,
}

impl Subscription {
    /// Returns a pending message without blocking.
    pub fn try_recv(&self) -> Option<Message> {
        self.receivers.iter().find_map(|r| r.try_recv().ok())
    }

    /// Blocks until a message arrives on any subscribed topic.
    ///
    /// Returns `None` once the bus has been dropped.
    pub fn recv(&self) -> Option<Message> {
        self.recv_impl(None)
    }

    /// Like [`Subscription::recv`], but gives up after `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Message> {
        self.recv_impl(Some(Instant::now() + timeout))
    }

    fn recv_impl(&self, deadline: Option<Instant>) -> Option<Message> {
        let mut select = Select::new();
        for receiver in &self.receivers {
            select.recv(receiver);
        }
        let mut open = self.receivers.len();
        while open > 0 {
            let op = match deadline {
                Some(deadline) => select.select_deadline(deadline).ok()?,
                None => select.select(),
            };
            let index = op.index();
            match op.recv(&self.receivers[index]) {
                Ok(msg) => return Some(msg),
                Err(_) => {
                    select.remove(index);
                    open -= 1;
                }
            }
        }
        None
    }
}
