use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

const SHARD_COUNT: usize = 16;

/// Per-key guard: at most one worker may hold a given key at a time;
/// others block until the holder drops its [`FlightGuard`].
///
/// Used to serialize sha256 insertion so only one worker inserts a given
/// content row while the rest fall through to a lookup and a path insert.
pub struct SingleFlight {
    shards: Vec<(Mutex<HashSet<String>>, Condvar)>,
}

impl Default for SingleFlight {
    fn default() -> Self {
        SingleFlight {
            shards: (0..SHARD_COUNT)
                .map(|_| (Mutex::new(HashSet::new()), Condvar::new()))
                .collect(),
        }
    }
}

impl SingleFlight {
    fn shard(&self, key: &str) -> &(Mutex<HashSet<String>>, Condvar) {
        // sha256 keys are hex, so the first byte spreads well
        let index = key.as_bytes().first().copied().unwrap_or(0) as usize % SHARD_COUNT;
        &self.shards[index]
    }

    /// Blocks while another worker holds `key`, then claims it.
    pub fn acquire(&self, key: &str) -> FlightGuard<'_> {
        let (lock, condvar) = self.shard(key);
        let mut held = lock.lock().unwrap_or_else(|e| e.into_inner());
        while held.contains(key) {
            held = condvar.wait(held).unwrap_or_else(|e| e.into_inner());
        }
        held.insert(key.to_string());
        FlightGuard {
            flight: self,
            key: key.to_string(),
        }
    }
}

pub struct FlightGuard<'a> {
    flight: &'a SingleFlight,
    key: String,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        let (lock, condvar) = self.flight.shard(&self.key);
        let mut held = lock.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.key);
        condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn same_key_is_serialized() {
        let flight = Arc::new(SingleFlight::default());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let flight = Arc::clone(&flight);
                let concurrent = Arc::clone(&concurrent);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    let _guard = flight.acquire("abc123");
                    let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    concurrent.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn different_keys_do_not_block_each_other() {
        let flight = SingleFlight::default();
        let _a = flight.acquire("aaaa");
        let _b = flight.acquire("bbbb");
    }
}
