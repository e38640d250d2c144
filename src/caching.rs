use std::{collections::HashMap, net::Ipv4Addr, time::Duration};

use parking_lot::Mutex;
use pnet::util::MacAddr;
use timedmap::TimedMap;
use tokio::sync::oneshot;

/// Link addresses learned from ARP replies, each kept for `timeout`.
#[derive(Debug)]
pub(super) struct LinkCache {
    timeout: Duration,
    entries: TimedMap<Ipv4Addr, MacAddr>,
    waiters: Mutex<HashMap<Ipv4Addr, Vec<oneshot::Sender<MacAddr>>>>,
}

impl LinkCache {
    pub(super) fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            entries: TimedMap::new(),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Stores the mapping and wakes everyone waiting on `ip`.
    pub(super) fn insert(&self, ip: Ipv4Addr, mac: MacAddr) {
        self.entries.insert(ip, mac, self.timeout);
        if let Some(waiters) = self.waiters.lock().remove(&ip) {
            for waiter in waiters {
                let _ = waiter.send(mac);
            }
        }
    }

    pub(super) fn get(&self, ip: &Ipv4Addr) -> Option<MacAddr> {
        self.entries.get(ip)
    }

    /// Returns a receiver completed by the next [`LinkCache::insert`] for `ip`.
    ///
    /// Entries whose receivers have all been dropped are discarded on the way.
    pub(super) fn subscribe(&self, ip: Ipv4Addr) -> oneshot::Receiver<MacAddr> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock();
        waiters.retain(|_, pending| {
            pending.retain(|waiter| !waiter.is_closed());
            !pending.is_empty()
        });
        waiters.entry(ip).or_default().push(tx);
        rx
    }

    /// Drops the waiters for `ip` whose receivers are gone.
    pub(super) fn prune(&self, ip: &Ipv4Addr) {
        let mut waiters = self.waiters.lock();
        if let Some(pending) = waiters.get_mut(ip) {
            pending.retain(|waiter| !waiter.is_closed());
            if pending.is_empty() {
                waiters.remove(ip);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP: Ipv4Addr = Ipv4Addr::new(10, 1, 1, 1);
    const MAC: MacAddr = MacAddr(0x00, 0x1A, 0x2B, 0x3C, 0x4D, 0x5E);

    #[test]
    fn test_insert_and_get() {
        let cache = LinkCache::new(Duration::from_secs(60));
        assert_eq!(cache.get(&IP), None);
        cache.insert(IP, MAC);
        assert_eq!(cache.get(&IP), Some(MAC));
        assert_eq!(cache.get(&Ipv4Addr::new(10, 1, 1, 2)), None);
    }

    #[test]
    fn test_entries_expire() {
        let cache = LinkCache::new(Duration::from_millis(10));
        cache.insert(IP, MAC);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.get(&IP), None);
    }

    #[tokio::test]
    async fn test_subscribers_are_woken() {
        let cache = LinkCache::new(Duration::from_secs(60));
        let first = cache.subscribe(IP);
        let second = cache.subscribe(IP);
        let other = cache.subscribe(Ipv4Addr::new(10, 1, 1, 2));
        cache.insert(IP, MAC);

        assert_eq!(first.await.unwrap(), MAC);
        assert_eq!(second.await.unwrap(), MAC);
        assert_eq!(cache.waiters.lock().len(), 1);

        drop(other);
        let _next = cache.subscribe(IP);
        let waiters = cache.waiters.lock();
        assert_eq!(waiters.len(), 1);
        assert!(waiters.contains_key(&IP));
    }

    #[test]
    fn test_abandoned_waiters_are_pruned() {
        let cache = LinkCache::new(Duration::from_secs(60));
        let abandoned = cache.subscribe(IP);
        let live = cache.subscribe(IP);
        drop(abandoned);
        cache.prune(&IP);
        assert_eq!(cache.waiters.lock()[&IP].len(), 1);

        drop(live);
        cache.prune(&IP);
        cache.prune(&Ipv4Addr::new(10, 1, 1, 2));
        assert!(cache.waiters.lock().is_empty());
    }
}
