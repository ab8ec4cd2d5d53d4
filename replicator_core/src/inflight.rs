//! In-process claims on keys. A claim is released when it is dropped, so a
//! run whose future is cancelled or times out does not leave its key taken.

use dashmap::DashSet;
use std::hash::Hash;

pub(crate) struct InFlight<K: Eq + Hash + Clone> {
    keys: DashSet<K>,
}

impl<K: Eq + Hash + Clone> InFlight<K> {
    pub(crate) fn new() -> Self {
        Self {
            keys: DashSet::new(),
        }
    }

    /// `None` when the key is already claimed.
    pub(crate) fn claim(&self, key: K) -> Option<Claim<'_, K>> {
        if self.keys.insert(key.clone()) {
            Some(Claim {
                keys: &self.keys,
                key,
            })
        } else {
            None
        }
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.keys.contains(key)
    }
}

pub(crate) struct Claim<'a, K: Eq + Hash + Clone> {
    keys: &'a DashSet<K>,
    key: K,
}

impl<K: Eq + Hash + Clone> Drop for Claim<'_, K> {
    fn drop(&mut self) {
        self.keys.remove(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn second_claim_is_refused_until_the_first_drops() {
        let inflight = InFlight::new();
        let first = inflight.claim("t");
        assert!(first.is_some());
        assert!(inflight.claim("t").is_none());
        assert!(inflight.claim("u").is_some());
        drop(first);
        assert!(!inflight.contains(&"t"));
        assert!(inflight.claim("t").is_some());
    }

    #[tokio::test]
    async fn cancelled_holder_releases_its_claim() {
        let inflight = InFlight::new();
        let held = async {
            let _claim = inflight.claim(7u32);
            tokio::time::sleep(Duration::from_secs(60)).await;
        };
        assert!(
            tokio::time::timeout(Duration::from_millis(10), held)
                .await
                .is_err()
        );
        assert!(inflight.claim(7).is_some());
    }
}
