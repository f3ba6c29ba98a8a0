// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use serde_json::Value;
use uuid::Uuid;

use crate::connection::ConnId;
use crate::expose::ItemStream;
use crate::prelude::*;

struct StreamEntry {
    client: Option<ConnId>,
    created: Instant,
    linger_started: Option<Instant>,
    stream: ItemStream,
}

/// Live iterators kept between follow-up fetches, keyed by stream id. The
/// single mutex here doubles as the housekeeper mutex: `sweep` holds it for
/// the whole pass, everything else holds it briefly. Iterators are advanced
/// with the entry taken out of the map, so user iterator code never runs
/// under the lock.
pub struct StreamRegistry {
    entries: Mutex<HashMap<String, StreamEntry>>,
    closed: AtomicBool,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Park an iterator result and hand back the fresh stream id the client
    /// will fetch items with.
    pub fn register(&self, stream: ItemStream, client: ConnId) -> Result<String> {
        if self.closed.load(Ordering::Acquire) {
            bail!(PyroError::Protocol("daemon is shutting down".into()));
        }
        let stream_id = Uuid::new_v4().to_string();
        let entry = StreamEntry {
            client: Some(client),
            created: Instant::now(),
            linger_started: None,
            stream,
        };
        self.lock().insert(stream_id.clone(), entry);
        Ok(stream_id)
    }

    /// Advance a stream. A lingering entry is re-bound to the calling
    /// connection. Exhaustion and iterator errors remove the entry and
    /// surface as errors; an unknown id means the stream was already
    /// terminated.
    pub fn next_item(&self, stream_id: &str, caller: ConnId) -> Result<Value> {
        let mut entry = self
            .lock()
            .remove(stream_id)
            .ok_or_else(|| anyhow!(PyroError::Generic("item stream terminated".into())))?;
        if entry.client.is_none() {
            entry.client = Some(caller);
            entry.linger_started = None;
        }
        match entry.stream.next() {
            Some(Ok(item)) => {
                if self.closed.load(Ordering::Acquire) {
                    bail!(PyroError::Protocol("daemon is shutting down".into()));
                }
                self.lock().insert(stream_id.to_owned(), entry);
                Ok(item)
            },
            Some(Err(err)) => Err(err),
            None => bail!(PyroError::StreamExhausted),
        }
    }

    pub fn close(&self, stream_id: &str) {
        self.lock().remove(stream_id);
    }

    /// The originating client went away: start the linger grace period when
    /// one is configured, drop its streams outright otherwise.
    pub fn disconnect(&self, client: ConnId, linger: Duration, now: Instant) {
        let mut entries = self.lock();
        if linger > Duration::ZERO {
            for entry in entries.values_mut() {
                if entry.client == Some(client) {
                    entry.client = None;
                    entry.linger_started = Some(now);
                }
            }
        } else {
            entries.retain(|_, entry| entry.client != Some(client));
        }
    }

    /// Drop entries past their lifetime, and lingering entries past the
    /// linger period. Zero durations disable the respective expiry.
    pub fn sweep(&self, now: Instant, lifetime: Duration, linger: Duration) {
        let mut entries = self.lock();
        if lifetime > Duration::ZERO {
            entries.retain(|_, entry| now.duration_since(entry.created) <= lifetime);
        }
        if linger > Duration::ZERO {
            entries.retain(|_, entry| {
                entry
                    .linger_started
                    .is_none_or(|started| now.duration_since(started) <= linger)
            });
        }
    }

    /// Drop everything and refuse further registrations. Called at daemon
    /// shutdown.
    pub fn clear(&self) {
        self.closed.store(true, Ordering::Release);
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StreamEntry>> {
        self.entries.lock().expect("stream registry lock")
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn number_stream(n: i64) -> ItemStream {
        Box::new((0..n).map(|i| Ok(json!(i))))
    }

    const CLIENT_A: ConnId = ConnId(1);
    const CLIENT_B: ConnId = ConnId(2);

    #[test]
    fn items_come_back_in_order_then_the_stream_ends() {
        let registry = StreamRegistry::new();
        let sid = registry.register(number_stream(3), CLIENT_A).unwrap();
        for i in 0..3 {
            assert_eq!(registry.next_item(&sid, CLIENT_A).unwrap(), json!(i));
        }
        let err = registry.next_item(&sid, CLIENT_A).unwrap_err();
        assert_eq!(crate::errors::wire_kind(&err), "StopIteration");
        // The entry is gone now, so one more fetch reports termination.
        let err = registry.next_item(&sid, CLIENT_A).unwrap_err();
        assert_eq!(err.to_string(), "item stream terminated");
    }

    #[test]
    fn iterator_errors_terminate_the_stream() {
        let registry = StreamRegistry::new();
        let stream: ItemStream = Box::new(
            vec![Ok(json!(1)), Err(anyhow!(PyroError::Generic("broken".into())))].into_iter(),
        );
        let sid = registry.register(stream, CLIENT_A).unwrap();
        assert_eq!(registry.next_item(&sid, CLIENT_A).unwrap(), json!(1));
        assert!(registry.next_item(&sid, CLIENT_A).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn close_is_a_silent_noop_on_unknown_ids() {
        let registry = StreamRegistry::new();
        registry.close("no-such-stream");
        let sid = registry.register(number_stream(1), CLIENT_A).unwrap();
        registry.close(&sid);
        assert!(registry.is_empty());
    }

    #[test]
    fn disconnect_without_linger_drops_only_the_clients_streams() {
        let registry = StreamRegistry::new();
        let _a = registry.register(number_stream(5), CLIENT_A).unwrap();
        let b = registry.register(number_stream(5), CLIENT_B).unwrap();
        registry.disconnect(CLIENT_A, Duration::ZERO, Instant::now());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.next_item(&b, CLIENT_B).unwrap(), json!(0));
    }

    #[test]
    fn lingering_streams_rebind_to_the_next_caller() {
        let registry = StreamRegistry::new();
        let sid = registry.register(number_stream(5), CLIENT_A).unwrap();
        assert_eq!(registry.next_item(&sid, CLIENT_A).unwrap(), json!(0));

        registry.disconnect(CLIENT_A, Duration::from_secs(2), Instant::now());
        assert_eq!(registry.len(), 1);

        // A reconnecting client resumes where the old one stopped.
        assert_eq!(registry.next_item(&sid, CLIENT_B).unwrap(), json!(1));

        // The re-bind cleared the linger stamp: a later sweep must not
        // reap the stream on linger grounds.
        registry.sweep(
            Instant::now() + Duration::from_secs(10),
            Duration::ZERO,
            Duration::from_secs(2),
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn sweep_enforces_lifetime_and_linger() {
        let registry = StreamRegistry::new();
        let now = Instant::now();
        let lifetime = Duration::from_secs(60);
        let linger = Duration::from_secs(2);

        let _fresh = registry.register(number_stream(5), CLIENT_A).unwrap();
        let lingering = registry.register(number_stream(5), CLIENT_B).unwrap();
        registry.disconnect(CLIENT_B, linger, now);

        // No time passed: sweeping changes nothing, twice over.
        registry.sweep(now, lifetime, linger);
        registry.sweep(now, lifetime, linger);
        assert_eq!(registry.len(), 2);

        // Past the linger period the disconnected client's stream goes.
        registry.sweep(now + Duration::from_secs(3), lifetime, linger);
        assert_eq!(registry.len(), 1);
        assert!(registry.next_item(&lingering, CLIENT_B).is_err());

        // Past the lifetime everything goes.
        registry.sweep(now + Duration::from_secs(61), lifetime, linger);
        assert!(registry.is_empty());
    }

    #[test]
    fn zero_durations_disable_expiry() {
        let registry = StreamRegistry::new();
        registry.register(number_stream(1), CLIENT_A).unwrap();
        registry.sweep(
            Instant::now() + Duration::from_secs(3600),
            Duration::ZERO,
            Duration::ZERO,
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn clear_empties_and_refuses_new_registrations() {
        let registry = StreamRegistry::new();
        registry.register(number_stream(3), CLIENT_A).unwrap();
        registry.clear();
        assert!(registry.is_empty());
        assert!(registry.register(number_stream(3), CLIENT_A).is_err());
    }
}
