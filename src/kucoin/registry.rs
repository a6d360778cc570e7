//! Subscription registry: what should be subscribed, independent of any connection

use tracing::debug;
use uuid::Uuid;

/// One requested topic subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub topic: String,
    pub private: bool,
    /// The subscribe frame asks the server for an ack
    pub response: bool,
    /// Acknowledged by the server on the current connection
    pub confirmed: bool,
}

impl Subscription {
    fn new(topic: &str, private: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            private,
            response: true,
            confirmed: false,
        }
    }
}

/// Insertion-ordered set of subscriptions keyed by (topic, private)
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription; returns the existing entry and `false` for a known pair
    pub fn add(&mut self, topic: &str, private: bool) -> (Subscription, bool) {
        if let Some(existing) = self.find(topic, private) {
            debug!("Topic {} (private={}) is already registered", topic, private);
            return (existing.clone(), false);
        }

        let subscription = Subscription::new(topic, private);
        self.entries.push(subscription.clone());
        (subscription, true)
    }

    /// Remove a subscription; absent pairs are ignored
    pub fn remove(&mut self, topic: &str, private: bool) -> Option<Subscription> {
        let index = self
            .entries
            .iter()
            .position(|s| s.topic == topic && s.private == private)?;
        Some(self.entries.remove(index))
    }

    /// Remove by id, used to roll back a subscribe that never got acked
    pub fn remove_id(&mut self, id: &str) -> Option<Subscription> {
        let index = self.entries.iter().position(|s| s.id == id)?;
        Some(self.entries.remove(index))
    }

    /// Current subscriptions in insertion order
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.entries.clone()
    }

    pub fn find(&self, topic: &str, private: bool) -> Option<&Subscription> {
        self.entries
            .iter()
            .find(|s| s.topic == topic && s.private == private)
    }

    pub fn get(&self, id: &str) -> Option<&Subscription> {
        self.entries.iter().find(|s| s.id == id)
    }

    /// Mark a subscription acknowledged; returns false if it is gone
    pub fn confirm(&mut self, id: &str) -> bool {
        match self.entries.iter_mut().find(|s| s.id == id) {
            Some(subscription) => {
                subscription.confirmed = true;
                true
            }
            None => false,
        }
    }

    pub fn is_confirmed(&self, id: &str) -> bool {
        self.get(id).is_some_and(|s| s.confirmed)
    }

    /// Acks belong to a connection; a fresh connection starts unconfirmed
    pub fn reset_confirmations(&mut self) {
        for subscription in &mut self.entries {
            subscription.confirmed = false;
        }
    }

    /// Drop every entry; only done when the session closes
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether an inbound message topic belongs to a live subscription.
    ///
    /// Exact topic match first. The server echoes a single symbol for topics
    /// subscribed as a comma-joined list (`/market/ticker:BTC-USDT,ETH-USDT`
    /// delivers `/market/ticker:BTC-USDT`), and `:all` covers every symbol.
    pub fn matches(&self, topic: &str) -> bool {
        if self.entries.iter().any(|s| s.topic == topic) {
            return true;
        }

        let Some((prefix, symbol)) = topic.split_once(':') else {
            return false;
        };

        self.entries.iter().any(|s| match s.topic.split_once(':') {
            Some((sub_prefix, symbols)) if sub_prefix == prefix => {
                symbols == "all" || symbols.split(',').any(|sym| sym.trim() == symbol)
            }
            _ => false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_is_idempotent() {
        let mut registry = SubscriptionRegistry::new();
        let (first, created) = registry.add("/market/ticker:BTC-USDT", false);
        assert!(created);

        let (second, created) = registry.add("/market/ticker:BTC-USDT", false);
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_private_flag_is_part_of_the_key() {
        let mut registry = SubscriptionRegistry::new();
        let (public, _) = registry.add("/spotMarket/tradeOrders", false);
        let (private, created) = registry.add("/spotMarket/tradeOrders", true);
        assert!(created);
        assert_ne!(public.id, private.id);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.remove("/market/ticker:BTC-USDT", false).is_none());

        registry.add("/market/ticker:BTC-USDT", false);
        assert!(registry.remove("/market/ticker:BTC-USDT", true).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_keeps_insertion_order() {
        let mut registry = SubscriptionRegistry::new();
        registry.add("/market/ticker:ETH-USDT", false);
        registry.add("/market/ticker:BTC-USDT", false);
        registry.add("/market/match:KCS-USDT", false);
        registry.remove("/market/ticker:BTC-USDT", false);
        registry.add("/market/ticker:BTC-USDT", false);

        let topics: Vec<String> = registry.snapshot().into_iter().map(|s| s.topic).collect();
        assert_eq!(
            topics,
            vec![
                "/market/ticker:ETH-USDT",
                "/market/match:KCS-USDT",
                "/market/ticker:BTC-USDT"
            ]
        );
    }

    #[test]
    fn test_confirmation_lifecycle() {
        let mut registry = SubscriptionRegistry::new();
        let (sub, _) = registry.add("/market/ticker:BTC-USDT", false);
        assert!(!registry.is_confirmed(&sub.id));

        assert!(registry.confirm(&sub.id));
        assert!(registry.is_confirmed(&sub.id));

        registry.reset_confirmations();
        assert!(!registry.is_confirmed(&sub.id));
        assert!(!registry.confirm("missing"));
    }

    #[test]
    fn test_clear_removes_everything() {
        let mut registry = SubscriptionRegistry::new();
        let (sub, _) = registry.add("/market/ticker:BTC-USDT", false);
        registry.add("/market/match:BTC-USDT", true);

        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.get(&sub.id).is_none());
        assert!(!registry.matches("/market/ticker:BTC-USDT"));

        // a cleared pair can be registered again
        let (_, created) = registry.add("/market/ticker:BTC-USDT", false);
        assert!(created);
    }

    #[test]
    fn test_matches_multi_symbol_topics() {
        let mut registry = SubscriptionRegistry::new();
        registry.add("/market/ticker:BTC-USDT,ETH-USDT", false);
        registry.add("/market/snapshot:all", false);

        assert!(registry.matches("/market/ticker:BTC-USDT,ETH-USDT"));
        assert!(registry.matches("/market/ticker:ETH-USDT"));
        assert!(!registry.matches("/market/ticker:KCS-USDT"));
        assert!(registry.matches("/market/snapshot:KCS-USDT"));
        assert!(!registry.matches("/market/match:BTC-USDT"));
    }
}
