//! Location Poller Module
//!
//! Polls a bus's last reported location on a fixed interval and keeps the
//! newest sample for the passenger view. A failed poll never clears the
//! sample: the passenger keeps seeing the last known position, marked stale
//! after a failed poll or once no refresh has landed within one interval plus
//! the request timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::{ApiClient, BusLocationResponse, Coordinates, RequestError};
use crate::config::{POLL_INTERVAL, REQUEST_TIMEOUT};

/// Most recent observed position of a bus
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub longitude: f64,
    pub latitude: f64,
    pub observed_at: DateTime<Utc>,
}

impl LocationSample {
    /// Build a sample from a location response. `None` when the bus has not
    /// reported a position yet.
    pub fn from_response(response: &BusLocationResponse) -> Option<Self> {
        let Coordinates { longitude, latitude } = response.coordinates()?;
        Some(Self {
            longitude,
            latitude,
            // Servers that omit the timestamp get the receive time.
            observed_at: response.last_updated.unwrap_or_else(Utc::now),
        })
    }
}

/// Poll bookkeeping exposed to the consumer
#[derive(Debug, Clone, Default)]
pub struct PollerStatus {
    pub bus_id: Option<String>,
    pub active: bool,
    pub polls: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<RequestError>,
    pub last_success: Option<Instant>,
}

/// What the passenger screen should show
#[derive(Debug, Clone, PartialEq)]
pub enum LocationView {
    Waiting,
    Fresh { bus_id: String, sample: LocationSample },
    Stale { bus_id: String, sample: LocationSample, age: Duration },
}

impl LocationView {
    pub fn sample(&self) -> Option<&LocationSample> {
        match self {
            LocationView::Waiting => None,
            LocationView::Fresh { sample, .. } | LocationView::Stale { sample, .. } => Some(sample),
        }
    }
}

impl std::fmt::Display for LocationView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (bus_id, sample, stale) = match self {
            LocationView::Waiting => return write!(f, "Waiting for location..."),
            LocationView::Fresh { bus_id, sample } => (bus_id, sample, false),
            LocationView::Stale { bus_id, sample, .. } => (bus_id, sample, true),
        };

        writeln!(f, "Bus: {}", bus_id)?;
        writeln!(f, "Lat: {}", sample.latitude)?;
        writeln!(f, "Lng: {}", sample.longitude)?;
        write!(f, "Last Updated: {}", sample.observed_at.format("%Y-%m-%d %H:%M:%S UTC"))?;
        if stale {
            write!(f, " (stale)")?;
        }
        Ok(())
    }
}

struct Slot {
    generation: u64,
    applied_seq: u64,
    sample: Option<LocationSample>,
    status: PollerStatus,
}

struct Shared {
    slot: Mutex<Slot>,
    tx: watch::Sender<Option<LocationSample>>,
    next_seq: AtomicU64,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply one poll result. Results from a cancelled activation, or older
    /// than the last applied sample, are dropped.
    fn apply(&self, generation: u64, seq: u64, result: Result<BusLocationResponse, RequestError>) {
        let mut slot = self.slot();

        if slot.generation != generation {
            debug!("Discarding location result from cancelled poll");
            return;
        }
        slot.status.polls += 1;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "Location poll failed for bus {}: {}",
                    slot.status.bus_id.as_deref().unwrap_or("?"),
                    e
                );
                slot.status.consecutive_failures += 1;
                slot.status.last_error = Some(e);
                return;
            }
        };

        slot.status.consecutive_failures = 0;
        slot.status.last_error = None;

        let Some(sample) = LocationSample::from_response(&response) else {
            debug!("No location reported yet");
            return;
        };

        if seq <= slot.applied_seq {
            debug!("Ignoring out-of-order location result {} <= {}", seq, slot.applied_seq);
            return;
        }

        slot.applied_seq = seq;
        slot.sample = Some(sample);
        slot.status.last_success = Some(Instant::now());
        self.tx.send_replace(Some(sample));
    }
}

/// Repeating, cancellable fetch of one bus's location
pub struct LocationPoller {
    api: Arc<ApiClient>,
    period: Duration,
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl LocationPoller {
    pub fn new(api: Arc<ApiClient>) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            api,
            period: POLL_INTERVAL,
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    generation: 0,
                    applied_seq: 0,
                    sample: None,
                    status: PollerStatus::default(),
                }),
                tx,
                next_seq: AtomicU64::new(0),
            }),
            task: None,
        }
    }

    /// Start polling `bus_id`. The first fetch is issued immediately.
    ///
    /// Any running poll is stopped first. Switching to a different bus
    /// drops the previous bus's sample. Must be called from within a tokio
    /// runtime.
    pub fn activate(&mut self, bus_id: impl Into<String>) {
        let bus_id = bus_id.into();
        self.deactivate();

        let generation = {
            let mut slot = self.shared.slot();
            if slot.status.bus_id.as_deref() != Some(bus_id.as_str()) {
                slot.sample = None;
                slot.status = PollerStatus {
                    bus_id: Some(bus_id.clone()),
                    ..PollerStatus::default()
                };
                self.shared.tx.send_replace(None);
            }
            slot.status.active = true;
            slot.generation
        };

        info!("Tracking bus {} every {:?}", bus_id, self.period);

        self.task = Some(tokio::spawn(run(
            self.api.clone(),
            self.shared.clone(),
            bus_id,
            generation,
            self.period,
        )));
    }

    /// Stop polling. Future ticks are cancelled and any in-flight result is
    /// discarded; the last sample is kept.
    pub fn deactivate(&mut self) {
        {
            let mut slot = self.shared.slot();
            slot.generation += 1;
            slot.status.active = false;
        }

        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Location polling stopped");
        }
    }

    /// Stop polling and forget the sample
    pub fn teardown(&mut self) {
        self.deactivate();

        let mut slot = self.shared.slot();
        slot.sample = None;
        slot.status = PollerStatus::default();
        self.shared.tx.send_replace(None);
    }

    pub fn is_active(&self) -> bool {
        self.task.is_some()
    }

    /// Latest sample, if any poll has succeeded
    pub fn latest(&self) -> Option<LocationSample> {
        self.shared.slot().sample
    }

    /// Receive every replacement of the latest sample
    pub fn subscribe(&self) -> watch::Receiver<Option<LocationSample>> {
        self.shared.tx.subscribe()
    }

    pub fn status(&self) -> PollerStatus {
        self.shared.slot().status.clone()
    }

    /// Current sample, stale after a failure or when the last successful
    /// refresh is older than a poll that could still be in flight
    pub fn view(&self) -> LocationView {
        let slot = self.shared.slot();

        let (Some(sample), Some(bus_id)) = (slot.sample, slot.status.bus_id.clone()) else {
            return LocationView::Waiting;
        };

        let age = slot
            .status
            .last_success
            .map(|at| at.elapsed())
            .unwrap_or_default();

        if slot.status.consecutive_failures > 0 || age > self.period + REQUEST_TIMEOUT {
            LocationView::Stale { bus_id, sample, age }
        } else {
            LocationView::Fresh { bus_id, sample }
        }
    }
}

impl Drop for LocationPoller {
    fn drop(&mut self) {
        self.teardown();
    }
}

async fn run(
    api: Arc<ApiClient>,
    shared: Arc<Shared>,
    bus_id: String,
    generation: u64,
    period: Duration,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let seq = shared.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let result = api.bus_location(&bus_id).await;
        shared.apply(generation, seq, result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TransportError;
    use crate::auth::Session;
    use crate::mock::{MockReply, MockTransport};
    use crate::storage::MemoryTokenStore;
    use chrono::TimeZone;
    use reqwest::Method;
    use serde_json::json;
    use tokio::sync::Notify;
    use tokio::time::sleep;

    const BUS12: &str = "/api/passenger/bus/BUS12";

    fn poller() -> (LocationPoller, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::new());
        let session = Session::new(Arc::new(MemoryTokenStore::new()));
        let api = ApiClient::with_transport("http://api.test", session, transport.clone());
        let api = Arc::new(api);
        (LocationPoller::new(api), transport)
    }

    fn location(lng: f64, lat: f64, updated: &str) -> MockReply {
        MockReply::json(
            200,
            json!({
                "location": {"type": "Point", "coordinates": [lng, lat]},
                "lastUpdated": updated,
            }),
        )
    }

    fn at(rfc3339: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(rfc3339).unwrap().with_timezone(&Utc)
    }

    /// Let spawned tasks run without crossing the next poll
    async fn settle() {
        sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_poll_is_immediate() {
        let (mut poller, transport) = poller();
        transport.reply(Method::GET, BUS12, location(77.1, 28.6, "2026-10-19T08:30:00Z"));

        poller.activate("BUS12");
        settle().await;

        assert_eq!(
            poller.latest(),
            Some(LocationSample {
                longitude: 77.1,
                latitude: 28.6,
                observed_at: at("2026-10-19T08:30:00Z"),
            })
        );
        assert_eq!(transport.request_count(), 1);
        assert!(matches!(poller.view(), LocationView::Fresh { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriber_sees_update() {
        let (mut poller, transport) = poller();
        transport.reply(Method::GET, BUS12, location(77.1, 28.6, "2026-10-19T08:30:00Z"));
        let mut rx = poller.subscribe();

        poller.activate("BUS12");
        let sample = *rx.wait_for(|sample| sample.is_some()).await.unwrap();
        let sample = sample.expect("sample published");
        assert_eq!(sample.longitude, 77.1);
        assert_eq!(sample.latitude, 28.6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_every_interval() {
        let (mut poller, transport) = poller();
        transport.reply(Method::GET, BUS12, location(77.1, 28.6, "2026-10-19T08:30:00Z"));

        poller.activate("BUS12");
        sleep(POLL_INTERVAL * 3).await;
        settle().await;

        assert_eq!(transport.request_count(), 4);
        assert_eq!(poller.status().polls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_last_sample() {
        let (mut poller, transport) = poller();
        transport.reply(Method::GET, BUS12, location(77.1, 28.6, "2026-10-19T08:30:00Z"));
        transport.reply(Method::GET, BUS12, MockReply::json(503, json!({"error": "down"})));

        poller.activate("BUS12");
        settle().await;
        let first = poller.latest();
        assert!(first.is_some());

        sleep(POLL_INTERVAL).await;
        settle().await;

        assert_eq!(poller.latest(), first);
        let status = poller.status();
        assert_eq!(status.consecutive_failures, 1);
        assert_eq!(status.last_error.unwrap().status, Some(503));
        assert!(matches!(poller.view(), LocationView::Stale { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_poll_stays_fresh() {
        let (mut poller, transport) = poller();
        let gate = Arc::new(Notify::new());
        transport.reply(Method::GET, BUS12, location(77.1, 28.6, "2026-10-19T08:30:00Z"));
        transport.reply(
            Method::GET,
            BUS12,
            location(77.2, 28.7, "2026-10-19T08:30:05Z").gated(gate.clone()),
        );

        poller.activate("BUS12");
        settle().await;

        // Second poll is held by the server past one interval.
        sleep(POLL_INTERVAL + Duration::from_millis(300)).await;
        assert_eq!(transport.request_count(), 2);
        assert_eq!(poller.status().consecutive_failures, 0);
        assert!(matches!(poller.view(), LocationView::Fresh { .. }));

        gate.notify_one();
        settle().await;
        assert_eq!(poller.latest().unwrap().longitude, 77.2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_server_goes_stale() {
        let (mut poller, transport) = poller();
        let gate = Arc::new(Notify::new());
        transport.reply(Method::GET, BUS12, location(77.1, 28.6, "2026-10-19T08:30:00Z"));
        transport.reply(
            Method::GET,
            BUS12,
            location(77.2, 28.7, "2026-10-19T08:30:05Z").gated(gate),
        );

        poller.activate("BUS12");
        settle().await;
        sleep(POLL_INTERVAL + REQUEST_TIMEOUT + Duration::from_secs(1)).await;

        assert_eq!(poller.status().consecutive_failures, 0);
        assert!(matches!(poller.view(), LocationView::Stale { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unparsable_timestamp_uses_receive_time() {
        let (mut poller, transport) = poller();
        transport.reply(Method::GET, BUS12, location(77.1, 28.6, "soon"));

        let before = Utc::now();
        poller.activate("BUS12");
        settle().await;

        let sample = poller.latest().unwrap();
        assert_eq!(sample.longitude, 77.1);
        assert!(sample.observed_at >= before);
        assert!(sample.observed_at <= Utc::now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_backoff_after_failures() {
        let (mut poller, transport) = poller();
        transport.reply(Method::GET, BUS12, MockReply::fail(TransportError::Timeout));

        poller.activate("BUS12");
        sleep(POLL_INTERVAL * 4).await;
        settle().await;

        // Same cadence as the success path: one request per interval.
        assert_eq!(transport.request_count(), 5);
        assert_eq!(poller.status().consecutive_failures, 5);
        assert!(poller.is_active());
        assert_eq!(poller.view(), LocationView::Waiting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_resets_failure_count() {
        let (mut poller, transport) = poller();
        transport.reply(Method::GET, BUS12, MockReply::fail(TransportError::Timeout));
        transport.reply(Method::GET, BUS12, location(77.2, 28.7, "2026-10-19T08:35:00Z"));

        poller.activate("BUS12");
        sleep(POLL_INTERVAL).await;
        settle().await;

        let status = poller.status();
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.is_none());
        assert_eq!(poller.latest().unwrap().longitude, 77.2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_coordinates_is_waiting() {
        let (mut poller, transport) = poller();
        transport.reply(Method::GET, BUS12, MockReply::json(200, json!({"location": null})));

        poller.activate("BUS12");
        settle().await;

        assert_eq!(poller.latest(), None);
        assert_eq!(poller.status().consecutive_failures, 0);
        assert_eq!(poller.view().to_string(), "Waiting for location...");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_discards_in_flight_result() {
        let (mut poller, transport) = poller();
        let gate = Arc::new(Notify::new());
        transport.reply(Method::GET, BUS12, location(77.1, 28.6, "2026-10-19T08:30:00Z"));
        transport.reply(
            Method::GET,
            BUS12,
            location(80.0, 30.0, "2026-10-19T08:31:00Z").gated(gate.clone()),
        );

        poller.activate("BUS12");
        settle().await;
        let before = poller.latest();

        // Second poll is now waiting on the gate.
        sleep(POLL_INTERVAL).await;
        assert_eq!(transport.request_count(), 2);

        poller.deactivate();
        gate.notify_one();
        sleep(POLL_INTERVAL * 2).await;

        assert_eq!(poller.latest(), before);
        assert_eq!(transport.request_count(), 2);
        assert!(!poller.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reactivate_switches_bus() {
        let (mut poller, transport) = poller();
        transport.reply(Method::GET, BUS12, location(77.1, 28.6, "2026-10-19T08:30:00Z"));
        transport.reply(
            Method::GET,
            "/api/passenger/bus/BUS13",
            MockReply::fail(TransportError::Connect("refused".into())),
        );

        poller.activate("BUS12");
        settle().await;
        assert!(poller.latest().is_some());

        poller.activate("BUS13");
        sleep(POLL_INTERVAL * 2).await;
        settle().await;

        let paths: Vec<String> = transport
            .requests()
            .iter()
            .map(|r| r.url.trim_start_matches("http://api.test").to_string())
            .collect();
        assert_eq!(paths.iter().filter(|p| p.as_str() == BUS12).count(), 1);
        assert_eq!(paths.iter().filter(|p| p.ends_with("BUS13")).count(), 3);
        assert_eq!(poller.latest(), None);
        assert_eq!(poller.status().bus_id.as_deref(), Some("BUS13"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_clears_sample() {
        let (mut poller, transport) = poller();
        transport.reply(Method::GET, BUS12, location(77.1, 28.6, "2026-10-19T08:30:00Z"));
        let rx = poller.subscribe();

        poller.activate("BUS12");
        settle().await;
        poller.teardown();

        assert_eq!(poller.latest(), None);
        assert_eq!(*rx.borrow(), None);
        assert_eq!(poller.view(), LocationView::Waiting);
    }

    #[test]
    fn test_stale_generation_is_ignored() {
        let (poller, _transport) = poller();
        poller.shared.slot().generation = 3;

        let response: BusLocationResponse = serde_json::from_value(json!({
            "location": {"coordinates": [1.0, 2.0]},
            "lastUpdated": "2026-10-19T08:30:00Z",
        }))
        .unwrap();
        poller.shared.apply(2, 1, Ok(response));

        assert_eq!(poller.latest(), None);
        assert_eq!(poller.status().polls, 0);
    }

    #[test]
    fn test_older_sequence_is_ignored() {
        let (poller, _transport) = poller();
        let response = |lng: f64| -> BusLocationResponse {
            serde_json::from_value(json!({
                "location": {"coordinates": [lng, 2.0]},
                "lastUpdated": "2026-10-19T08:30:00Z",
            }))
            .unwrap()
        };

        poller.shared.apply(0, 2, Ok(response(10.0)));
        poller.shared.apply(0, 1, Ok(response(20.0)));

        assert_eq!(poller.latest().unwrap().longitude, 10.0);
    }

    #[test]
    fn test_view_renders_passenger_text() {
        let sample = LocationSample {
            longitude: 77.1,
            latitude: 28.6,
            observed_at: Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0).unwrap(),
        };
        let view = LocationView::Stale {
            bus_id: "BUS12".into(),
            sample,
            age: Duration::from_secs(12),
        };

        assert_eq!(
            view.to_string(),
            "Bus: BUS12\nLat: 28.6\nLng: 77.1\nLast Updated: 2026-10-19 08:30:00 UTC (stale)"
        );
    }
}
