//! Job-side state: the authoritative copy of a running component.
//!
//! A job owns its [`JobState`]; the manager attaches an observer and
//! proxies the interesting keys up into the component's state. Feed
//! components additionally keep per-feeder and per-eater sub-states
//! with cumulative transfer counters.
//!
//! Counter folding: each feeder client tracks a *current* counter for
//! the live connection and a running *total*. On disconnect the
//! current value is folded into the total and reset; the total itself
//! is maintained as `total = folded + current` on every stats update,
//! so folding is just zeroing the current counter. A reconnect can be
//! seen before the old connection's disconnect; `connected` folds the
//! stale connection first so nothing is counted twice.

use std::sync::Arc;

use nimbus_core::{now_secs, ComponentMessage, Mood};

use crate::error::{StateError, StateResult};
use crate::registry::{KeyDecl, ReplicaTag, StateHandle, StateRegistry};
use crate::value::StateValue;

/// Per-connection discontinuity keys, reset whenever the eater
/// reconnects. Running totals live on the eater itself and survive.
const CONNECTION_KEYS: &[(&str, StateValue)] = &[
    ("feed-id", StateValue::Null),
    ("count-timestamp-discont", StateValue::Int(0)),
    ("time-timestamp-discont", StateValue::Null),
    ("timestamp-timestamp-discont", StateValue::Float(0.0)),
    ("last-timestamp-discont", StateValue::Float(0.0)),
    ("total-timestamp-discont", StateValue::Float(0.0)),
    ("count-offset-discont", StateValue::Int(0)),
    ("time-offset-discont", StateValue::Null),
    ("offset-offset-discont", StateValue::Int(0)),
    ("last-offset-discont", StateValue::Int(0)),
    ("total-offset-discont", StateValue::Int(0)),
];

/// Authoritative state of one job process.
#[derive(Clone)]
pub struct JobState {
    registry: Arc<StateRegistry>,
    handle: StateHandle,
}

impl JobState {
    pub fn create(registry: Arc<StateRegistry>, worker_name: &str, pid: i64) -> Self {
        let handle = registry.create_object(
            "job",
            ReplicaTag::Local,
            &[
                KeyDecl::scalar("mood", Mood::Waking.ordinal() as i64),
                KeyDecl::scalar("manager-ip", StateValue::Null),
                KeyDecl::scalar("pid", pid),
                KeyDecl::scalar("workerName", worker_name),
                KeyDecl::list("messages"),
                KeyDecl::dict("feeders"),
                KeyDecl::dict("eaters"),
            ],
        );
        Self { registry, handle }
    }

    pub fn wrap(registry: Arc<StateRegistry>, handle: StateHandle) -> Self {
        Self { registry, handle }
    }

    pub fn handle(&self) -> StateHandle {
        self.handle
    }

    pub fn registry(&self) -> &Arc<StateRegistry> {
        &self.registry
    }

    pub fn mood(&self) -> StateResult<Option<Mood>> {
        Ok(self
            .registry
            .get(self.handle, "mood")?
            .as_int()
            .and_then(|i| u8::try_from(i).ok())
            .and_then(Mood::from_ordinal))
    }

    pub async fn set_mood(&self, mood: Mood) -> StateResult<()> {
        self.registry
            .set(self.handle, "mood", mood.ordinal() as i64)
            .await
    }

    pub async fn set_manager_ip(&self, ip: &str) -> StateResult<()> {
        self.registry.set(self.handle, "manager-ip", ip).await
    }

    pub async fn post_message(&self, message: &ComponentMessage) -> StateResult<()> {
        let encoded = serde_json::to_string(message)
            .map_err(|e| StateError::BadSnapshot(e.to_string()))?;
        self.registry.append(self.handle, "messages", encoded).await
    }

    pub fn messages(&self) -> StateResult<Vec<ComponentMessage>> {
        let mut out = Vec::new();
        for value in self.registry.get_list(self.handle, "messages")? {
            if let Some(json) = value.as_str() {
                if let Ok(message) = serde_json::from_str(json) {
                    out.push(message);
                }
            }
        }
        Ok(out)
    }

    /// Register a feeder; returns the existing one on a repeat call.
    pub async fn ensure_feeder(&self, feeder_name: &str) -> StateResult<FeederState> {
        if let Some(value) = self.registry.get_item(self.handle, "feeders", feeder_name)? {
            if let Some(handle) = value.as_ref_handle() {
                return Ok(FeederState {
                    registry: self.registry.clone(),
                    handle,
                });
            }
        }
        let handle = self.registry.create_object(
            "feeder",
            ReplicaTag::Local,
            &[
                KeyDecl::scalar("feederName", feeder_name),
                KeyDecl::dict("clients"),
            ],
        );
        self.registry
            .setitem(self.handle, "feeders", feeder_name, handle)
            .await?;
        Ok(FeederState {
            registry: self.registry.clone(),
            handle,
        })
    }

    pub fn feeder(&self, feeder_name: &str) -> StateResult<Option<FeederState>> {
        Ok(self
            .registry
            .get_item(self.handle, "feeders", feeder_name)?
            .and_then(|v| v.as_ref_handle())
            .map(|handle| FeederState {
                registry: self.registry.clone(),
                handle,
            }))
    }

    /// Register an eater; returns the existing one on a repeat call.
    pub async fn ensure_eater(&self, alias: &str, eater_name: &str) -> StateResult<EaterState> {
        if let Some(value) = self.registry.get_item(self.handle, "eaters", alias)? {
            if let Some(handle) = value.as_ref_handle() {
                return Ok(EaterState {
                    registry: self.registry.clone(),
                    handle,
                });
            }
        }
        let keys = vec![
            KeyDecl::scalar("eater-alias", alias),
            KeyDecl::scalar("eater-name", eater_name),
            KeyDecl::scalar("fd", StateValue::Null),
            KeyDecl::scalar("last-connect", 0i64),
            KeyDecl::scalar("last-disconnect", 0i64),
            KeyDecl::scalar("total-connections", 0i64),
            KeyDecl::scalar("count-timestamp-discont", 0i64),
            KeyDecl::scalar("count-offset-discont", 0i64),
            KeyDecl::scalar("total-timestamp-discont", 0.0),
            KeyDecl::scalar("total-offset-discont", 0.0),
            KeyDecl::dict("connection"),
        ];
        let handle = self.registry.create_object("eater", ReplicaTag::Local, &keys);
        for (key, initial) in CONNECTION_KEYS {
            self.registry
                .setitem(handle, "connection", key, initial.clone())
                .await?;
        }
        self.registry
            .setitem(self.handle, "eaters", alias, handle)
            .await?;
        Ok(EaterState {
            registry: self.registry.clone(),
            handle,
        })
    }

    pub fn eater(&self, alias: &str) -> StateResult<Option<EaterState>> {
        Ok(self
            .registry
            .get_item(self.handle, "eaters", alias)?
            .and_then(|v| v.as_ref_handle())
            .map(|handle| EaterState {
                registry: self.registry.clone(),
                handle,
            }))
    }
}

/// One feeder of a feed component and the clients it has ever seen.
///
/// Client objects are never removed on disconnect so counters can
/// track a client across reconnects.
#[derive(Clone)]
pub struct FeederState {
    registry: Arc<StateRegistry>,
    handle: StateHandle,
}

impl FeederState {
    pub fn handle(&self) -> StateHandle {
        self.handle
    }

    pub fn feeder_name(&self) -> StateResult<String> {
        self.registry
            .get(self.handle, "feederName")?
            .as_str()
            .map(str::to_string)
            .ok_or(StateError::WrongShape {
                key: "feederName".to_string(),
                expected: "scalar",
            })
    }

    pub async fn ensure_client(&self, client_id: &str) -> StateResult<FeederClientState> {
        if let Some(existing) = self.client(client_id)? {
            return Ok(existing);
        }
        let handle = self.registry.create_object(
            "feeder-client",
            ReplicaTag::Local,
            &[
                KeyDecl::scalar("client-id", client_id),
                KeyDecl::scalar("fd", StateValue::Null),
                KeyDecl::scalar("bytes-read-current", 0i64),
                KeyDecl::scalar("bytes-read-total", 0i64),
                KeyDecl::scalar("reconnects", 0i64),
                KeyDecl::scalar("last-connect", 0.0),
                KeyDecl::scalar("last-disconnect", 0.0),
                KeyDecl::scalar("last-activity", 0.0),
                // Unknown until the sink reports drop counts.
                KeyDecl::scalar("buffers-dropped-current", StateValue::Null),
                KeyDecl::scalar("buffers-dropped-total", StateValue::Null),
            ],
        );
        self.registry
            .setitem(self.handle, "clients", client_id, handle)
            .await?;
        Ok(FeederClientState {
            registry: self.registry.clone(),
            handle,
        })
    }

    pub fn client(&self, client_id: &str) -> StateResult<Option<FeederClientState>> {
        Ok(self
            .registry
            .get_item(self.handle, "clients", client_id)?
            .and_then(|v| v.as_ref_handle())
            .map(|handle| FeederClientState {
                registry: self.registry.clone(),
                handle,
            }))
    }

    pub fn clients(&self) -> StateResult<Vec<FeederClientState>> {
        Ok(self
            .registry
            .get_dict(self.handle, "clients")?
            .into_values()
            .filter_map(|v| v.as_ref_handle())
            .map(|handle| FeederClientState {
                registry: self.registry.clone(),
                handle,
            })
            .collect())
    }
}

/// Cumulative transfer counters for one client of a feeder.
#[derive(Clone)]
pub struct FeederClientState {
    registry: Arc<StateRegistry>,
    handle: StateHandle,
}

impl FeederClientState {
    pub fn handle(&self) -> StateHandle {
        self.handle
    }

    pub fn fd(&self) -> StateResult<Option<i64>> {
        Ok(self.registry.get(self.handle, "fd")?.as_int())
    }

    pub fn bytes_read_current(&self) -> StateResult<i64> {
        Ok(self
            .registry
            .get(self.handle, "bytes-read-current")?
            .as_int()
            .unwrap_or(0))
    }

    pub fn bytes_read_total(&self) -> StateResult<i64> {
        Ok(self
            .registry
            .get(self.handle, "bytes-read-total")?
            .as_int()
            .unwrap_or(0))
    }

    pub fn buffers_dropped_total(&self) -> StateResult<Option<i64>> {
        Ok(self
            .registry
            .get(self.handle, "buffers-dropped-total")?
            .as_int())
    }

    pub fn reconnects(&self) -> StateResult<i64> {
        Ok(self
            .registry
            .get(self.handle, "reconnects")?
            .as_int()
            .unwrap_or(0))
    }

    /// Sink statistics for the live connection.
    ///
    /// `bytes_sent` and `buffers_dropped` are per-connection values;
    /// the running totals are maintained here by adding them to what
    /// was folded away on earlier disconnects.
    pub async fn set_stats(
        &self,
        bytes_sent: i64,
        last_activity: f64,
        buffers_dropped: Option<i64>,
    ) -> StateResult<()> {
        let bytes_before = self.bytes_read_total()? - self.bytes_read_current()?;
        self.registry
            .set(self.handle, "bytes-read-current", bytes_sent)
            .await?;
        self.registry
            .set(self.handle, "bytes-read-total", bytes_before + bytes_sent)
            .await?;
        self.registry
            .set(self.handle, "last-activity", last_activity)
            .await?;
        if let Some(dropped) = buffers_dropped {
            let dropped_before = self.buffers_dropped_total()?.unwrap_or(0)
                - self
                    .registry
                    .get(self.handle, "buffers-dropped-current")?
                    .as_int()
                    .unwrap_or(0);
            self.registry
                .set(self.handle, "buffers-dropped-current", dropped)
                .await?;
            self.registry
                .set(self.handle, "buffers-dropped-total", dropped_before + dropped)
                .await?;
        }
        Ok(())
    }

    /// The client connected on `fd`.
    ///
    /// A reconnect is often seen before the old connection's
    /// disconnect; if an fd is still recorded, the old connection is
    /// folded first so its bytes are not counted twice.
    pub async fn connected(&self, fd: i64, when: Option<f64>) -> StateResult<()> {
        let when = when.unwrap_or_else(now_secs);
        if let Some(stale) = self.fd()? {
            self.fold_disconnect(stale, when).await?;
        }
        self.registry.set(self.handle, "fd", fd).await?;
        self.registry.set(self.handle, "last-connect", when).await?;
        let reconnects = self.reconnects()?;
        self.registry
            .set(self.handle, "reconnects", reconnects + 1)
            .await
    }

    /// The client on `fd` disconnected. Ignored when `fd` is not the
    /// recorded one, because `connected` already folded it.
    pub async fn disconnected(&self, fd: i64, when: Option<f64>) -> StateResult<()> {
        if self.fd()? != Some(fd) {
            return Ok(());
        }
        let when = when.unwrap_or_else(now_secs);
        self.fold_disconnect(fd, when).await
    }

    async fn fold_disconnect(&self, fd: i64, when: f64) -> StateResult<()> {
        if self.fd()? == Some(fd) {
            self.registry.set(self.handle, "fd", StateValue::Null).await?;
        }
        self.registry
            .set(self.handle, "last-disconnect", when)
            .await?;
        // Totals already include the current counters; folding is
        // just resetting the per-connection values.
        self.registry
            .set(self.handle, "bytes-read-current", 0i64)
            .await?;
        if self
            .registry
            .get(self.handle, "buffers-dropped-current")?
            .as_int()
            .is_some()
        {
            self.registry
                .set(self.handle, "buffers-dropped-current", 0i64)
                .await?;
        }
        Ok(())
    }
}

/// One eater of a feed component.
#[derive(Clone)]
pub struct EaterState {
    registry: Arc<StateRegistry>,
    handle: StateHandle,
}

impl EaterState {
    pub fn handle(&self) -> StateHandle {
        self.handle
    }

    pub fn alias(&self) -> StateResult<String> {
        self.registry
            .get(self.handle, "eater-alias")?
            .as_str()
            .map(str::to_string)
            .ok_or(StateError::WrongShape {
                key: "eater-alias".to_string(),
                expected: "scalar",
            })
    }

    pub fn fd(&self) -> StateResult<Option<i64>> {
        Ok(self.registry.get(self.handle, "fd")?.as_int())
    }

    pub fn total_connections(&self) -> StateResult<i64> {
        Ok(self
            .registry
            .get(self.handle, "total-connections")?
            .as_int()
            .unwrap_or(0))
    }

    fn counter(&self, key: &str) -> StateResult<i64> {
        Ok(self.registry.get(self.handle, key)?.as_int().unwrap_or(0))
    }

    fn counter_f(&self, key: &str) -> StateResult<f64> {
        Ok(self
            .registry
            .get(self.handle, key)?
            .as_float()
            .unwrap_or(0.0))
    }

    fn conn_counter(&self, key: &str) -> StateResult<i64> {
        Ok(self
            .registry
            .get_item(self.handle, "connection", key)?
            .and_then(|v| v.as_int())
            .unwrap_or(0))
    }

    fn conn_counter_f(&self, key: &str) -> StateResult<f64> {
        Ok(self
            .registry
            .get_item(self.handle, "connection", key)?
            .and_then(|v| v.as_float())
            .unwrap_or(0.0))
    }

    /// A new upstream connection. Resets the per-connection
    /// discontinuity counters; running totals are untouched.
    pub async fn connected(&self, fd: i64, feed_id: &str, when: Option<f64>) -> StateResult<()> {
        let when = when.unwrap_or_else(now_secs);
        self.registry.set(self.handle, "last-connect", when).await?;
        self.registry.set(self.handle, "fd", fd).await?;
        let connections = self.total_connections()?;
        self.registry
            .set(self.handle, "total-connections", connections + 1)
            .await?;

        for (key, initial) in CONNECTION_KEYS {
            self.registry
                .setitem(self.handle, "connection", key, initial.clone())
                .await?;
        }
        self.registry
            .setitem(self.handle, "connection", "feed-id", feed_id)
            .await
    }

    pub async fn disconnected(&self, when: Option<f64>) -> StateResult<()> {
        let when = when.unwrap_or_else(now_secs);
        self.registry
            .set(self.handle, "last-disconnect", when)
            .await?;
        self.registry.set(self.handle, "fd", StateValue::Null).await
    }

    /// Record a timestamp discontinuity of `seconds`, where
    /// `timestamp` is the stream time of the buffer after the gap.
    pub async fn timestamp_discont(&self, seconds: f64, timestamp: f64) -> StateResult<()> {
        let conn_count = self.conn_counter("count-timestamp-discont")?;
        self.registry
            .setitem(self.handle, "connection", "count-timestamp-discont", conn_count + 1)
            .await?;
        let count = self.counter("count-timestamp-discont")?;
        self.registry
            .set(self.handle, "count-timestamp-discont", count + 1)
            .await?;

        self.registry
            .setitem(self.handle, "connection", "time-timestamp-discont", now_secs())
            .await?;
        self.registry
            .setitem(
                self.handle,
                "connection",
                "timestamp-timestamp-discont",
                timestamp,
            )
            .await?;
        self.registry
            .setitem(self.handle, "connection", "last-timestamp-discont", seconds)
            .await?;
        let conn_total = self.conn_counter_f("total-timestamp-discont")?;
        self.registry
            .setitem(
                self.handle,
                "connection",
                "total-timestamp-discont",
                conn_total + seconds,
            )
            .await?;
        let total = self.counter_f("total-timestamp-discont")?;
        self.registry
            .set(self.handle, "total-timestamp-discont", total + seconds)
            .await
    }

    /// Record an offset discontinuity of `units`, where `offset` is
    /// the offset of the buffer after the gap.
    pub async fn offset_discont(&self, units: i64, offset: i64) -> StateResult<()> {
        let conn_count = self.conn_counter("count-offset-discont")?;
        self.registry
            .setitem(self.handle, "connection", "count-offset-discont", conn_count + 1)
            .await?;
        let count = self.counter("count-offset-discont")?;
        self.registry
            .set(self.handle, "count-offset-discont", count + 1)
            .await?;

        self.registry
            .setitem(self.handle, "connection", "time-offset-discont", now_secs())
            .await?;
        self.registry
            .setitem(self.handle, "connection", "offset-offset-discont", offset)
            .await?;
        self.registry
            .setitem(self.handle, "connection", "last-offset-discont", units)
            .await?;
        let conn_total = self.conn_counter("total-offset-discont")?;
        self.registry
            .setitem(
                self.handle,
                "connection",
                "total-offset-discont",
                conn_total + units,
            )
            .await?;
        let total = self.counter("total-offset-discont")?;
        self.registry
            .set(self.handle, "total-offset-discont", total + units)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobState {
        JobState::create(Arc::new(StateRegistry::new()), "general", 4242)
    }

    #[tokio::test]
    async fn job_starts_waking() {
        let job = job();
        assert_eq!(job.mood().unwrap(), Some(Mood::Waking));
        job.set_mood(Mood::Happy).await.unwrap();
        assert_eq!(job.mood().unwrap(), Some(Mood::Happy));
    }

    #[tokio::test]
    async fn feeder_client_totals_survive_reconnects() {
        let job = job();
        let feeder = job.ensure_feeder("default").await.unwrap();
        let client = feeder.ensure_client("/other/comp:default").await.unwrap();

        client.connected(7, Some(100.0)).await.unwrap();
        client.set_stats(1000, 105.0, Some(3)).await.unwrap();
        client.disconnected(7, Some(110.0)).await.unwrap();

        assert_eq!(client.bytes_read_current().unwrap(), 0);
        assert_eq!(client.bytes_read_total().unwrap(), 1000);

        client.connected(9, Some(120.0)).await.unwrap();
        client.set_stats(500, 125.0, Some(1)).await.unwrap();

        assert_eq!(client.bytes_read_current().unwrap(), 500);
        assert_eq!(client.bytes_read_total().unwrap(), 1500);
        assert_eq!(client.buffers_dropped_total().unwrap(), Some(4));
        assert_eq!(client.reconnects().unwrap(), 2);
    }

    #[tokio::test]
    async fn reconnect_before_disconnect_folds_once() {
        let job = job();
        let feeder = job.ensure_feeder("default").await.unwrap();
        let client = feeder.ensure_client("/other/comp:default").await.unwrap();

        client.connected(7, Some(100.0)).await.unwrap();
        client.set_stats(1000, 105.0, None).await.unwrap();

        // New connection arrives before the old disconnect is seen.
        client.connected(9, Some(110.0)).await.unwrap();
        assert_eq!(client.bytes_read_current().unwrap(), 0);
        assert_eq!(client.bytes_read_total().unwrap(), 1000);
        assert_eq!(client.fd().unwrap(), Some(9));

        // The late disconnect for the old fd must not fold again.
        client.set_stats(200, 115.0, None).await.unwrap();
        client.disconnected(7, Some(116.0)).await.unwrap();
        assert_eq!(client.bytes_read_current().unwrap(), 200);
        assert_eq!(client.bytes_read_total().unwrap(), 1200);
        assert_eq!(client.fd().unwrap(), Some(9));
    }

    #[tokio::test]
    async fn feeder_tracks_clients_by_id() {
        let job = job();
        let feeder = job.ensure_feeder("default").await.unwrap();
        let a = feeder.ensure_client("a").await.unwrap();
        let same = feeder.ensure_client("a").await.unwrap();
        assert_eq!(a.handle(), same.handle());
        feeder.ensure_client("b").await.unwrap();
        assert_eq!(feeder.clients().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn eater_connection_counters_reset_on_reconnect() {
        let job = job();
        let eater = job.ensure_eater("default", "default").await.unwrap();

        eater.connected(5, "/flow/producer:video", Some(10.0)).await.unwrap();
        eater.timestamp_discont(2.5, 42.0).await.unwrap();
        eater.timestamp_discont(1.5, 50.0).await.unwrap();
        eater.offset_discont(10, 1000).await.unwrap();

        assert_eq!(eater.conn_counter("count-timestamp-discont").unwrap(), 2);
        assert_eq!(eater.counter_f("total-timestamp-discont").unwrap(), 4.0);

        eater.disconnected(Some(20.0)).await.unwrap();
        eater.connected(6, "/flow/producer:video", Some(30.0)).await.unwrap();

        // Per-connection counters reset, running totals survive.
        assert_eq!(eater.conn_counter("count-timestamp-discont").unwrap(), 0);
        assert_eq!(eater.conn_counter_f("total-timestamp-discont").unwrap(), 0.0);
        assert_eq!(eater.counter("count-timestamp-discont").unwrap(), 2);
        assert_eq!(eater.counter_f("total-timestamp-discont").unwrap(), 4.0);
        assert_eq!(eater.counter("total-offset-discont").unwrap(), 10);
        assert_eq!(eater.total_connections().unwrap(), 2);
    }
}
