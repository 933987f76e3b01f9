use std::collections::BTreeSet;

use rustc_hash::FxHashMap;

use crate::protocol::envelope::OperationId;
use crate::protocol::filter_hash::FilterHash;

/// Index from a filter's hash to the subscriptions interested in it. Several local subscriptions
///  can share a filter, deliveries are fanned out to all of them. Empty buckets are pruned.
#[derive(Default, Debug)]
pub struct SubscriptionRegistry {
    buckets: FxHashMap<FilterHash, BTreeSet<OperationId>>,
}

impl SubscriptionRegistry {
    pub fn new() -> SubscriptionRegistry {
        Default::default()
    }

    pub fn add(&mut self, hash: FilterHash, subscription: OperationId) {
        self.buckets.entry(hash)
            .or_default()
            .insert(subscription);
    }

    pub fn remove(&mut self, hash: FilterHash, subscription: &OperationId) -> bool {
        let Some(bucket) = self.buckets.get_mut(&hash) else {
            return false;
        };
        let removed = bucket.remove(subscription);
        if bucket.is_empty() {
            self.buckets.remove(&hash);
        }
        removed
    }

    pub fn migrate(&mut self, subscription: OperationId, old_hash: FilterHash, new_hash: FilterHash) {
        self.remove(old_hash, &subscription);
        self.add(new_hash, subscription);
    }

    /// snapshot of the subscriptions for a hash, in creation order
    pub fn members(&self, hash: FilterHash) -> Vec<OperationId> {
        self.buckets.get(&hash)
            .map(|bucket| bucket.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, hash: FilterHash, subscription: &OperationId) -> bool {
        self.buckets.get(&hash)
            .is_some_and(|bucket| bucket.contains(subscription))
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::op_code::OpCode;
    use super::*;

    fn sub(counter: u64) -> OperationId {
        OperationId::new(OpCode::Subscribe, counter)
    }

    #[test]
    fn test_fan_out_members() {
        let mut registry = SubscriptionRegistry::new();
        registry.add(FilterHash(5), sub(3));
        registry.add(FilterHash(5), sub(1));
        registry.add(FilterHash(6), sub(2));

        assert_eq!(registry.members(FilterHash(5)), vec![sub(1), sub(3)]);
        assert_eq!(registry.members(FilterHash(6)), vec![sub(2)]);
        assert!(registry.members(FilterHash(7)).is_empty());
    }

    #[test]
    fn test_remove_prunes_empty_bucket() {
        let mut registry = SubscriptionRegistry::new();
        registry.add(FilterHash(5), sub(1));
        registry.add(FilterHash(5), sub(2));

        assert!(registry.remove(FilterHash(5), &sub(1)));
        assert_eq!(registry.num_buckets(), 1);
        assert!(registry.remove(FilterHash(5), &sub(2)));
        assert_eq!(registry.num_buckets(), 0);
        assert!(!registry.remove(FilterHash(5), &sub(2)));
    }

    #[test]
    fn test_migrate() {
        let mut registry = SubscriptionRegistry::new();
        registry.add(FilterHash(5), sub(1));
        registry.migrate(sub(1), FilterHash(5), FilterHash(8));

        assert!(registry.contains(FilterHash(8), &sub(1)));
        assert!(!registry.contains(FilterHash(5), &sub(1)));
        assert_eq!(registry.num_buckets(), 1);
    }
}
