// ── Color camera ──
//
// Frames are reported as metadata only: the image itself stays on the
// host and is referenced by path.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reachlink_api::{CommandSink, DeviceDataRecord, DeviceKey};

use crate::config::RequesterConfig;
use crate::error::CoreError;
use crate::host::DeviceHandle;
use crate::request::Expect;
use crate::requester::{MessageParser, Requester};
use crate::status::Status;
use crate::subscription::{FinishedCallback, UpdateSubscription};

/// `data_type` of color frame records.
pub const COLOR: &str = "color";

const DEFAULT_STREAM_PERIOD: Duration = Duration::from_millis(100);
const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// One color frame as announced by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorFrame {
    pub time: DateTime<Utc>,
    pub sequence: i64,
    pub device_type: String,
    pub device_name: String,
    /// Host-side path of the encoded image, if the record named one.
    pub color_image: Option<String>,
}

impl ColorFrame {
    pub fn from_record(record: &DeviceDataRecord) -> Self {
        Self {
            time: record.timestamp(),
            sequence: record.seq,
            device_type: record.device_type.clone(),
            device_name: record.device_name.clone(),
            color_image: record
                .extra
                .get("colorImage")
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned),
        }
    }
}

/// Parses `color` records of one identity into [`ColorFrame`]s.
#[derive(Debug, Clone)]
pub struct ColorFrameParser {
    key: DeviceKey,
}

impl ColorFrameParser {
    pub fn new(key: DeviceKey) -> Self {
        Self { key }
    }
}

impl MessageParser for ColorFrameParser {
    type Supplement = ColorFrame;

    fn get_message_supplement(&self, record: &DeviceDataRecord) -> Option<ColorFrame> {
        (self.key.matches(&record.device_type, &record.device_name) && record.data_type == COLOR)
            .then(|| ColorFrame::from_record(record))
    }
}

/// Facade over a color camera.
#[derive(Debug, Clone)]
pub struct ColorCamera {
    requester: Requester<ColorFrameParser>,
    key: DeviceKey,
}

impl ColorCamera {
    pub fn new(
        sink: Arc<dyn CommandSink>,
        config: RequesterConfig,
        device_type: &str,
        device_name: &str,
    ) -> (Arc<dyn DeviceHandle>, Self) {
        let key = DeviceKey::new(device_type, device_name);
        let requester = Requester::new(
            key.to_string(),
            sink,
            ColorFrameParser::new(key.clone()),
            config,
        );
        let handle: Arc<dyn DeviceHandle> = Arc::new(requester.clone());
        (handle, Self { requester, key })
    }

    pub fn device_key(&self) -> &DeviceKey {
        &self.key
    }

    pub fn requester(&self) -> &Requester<ColorFrameParser> {
        &self.requester
    }

    /// Request a frame every `period` (default 100ms) until stopped.
    pub fn start_streaming(&self, period: Option<Duration>) -> Result<(), CoreError> {
        self.requester.set_untagged_request_period(
            &self.key,
            COLOR,
            Some(period.unwrap_or(DEFAULT_STREAM_PERIOD)),
        )
    }

    pub fn stop_streaming(&self) {
        // Removing a period never fails.
        let _ = self
            .requester
            .set_untagged_request_period(&self.key, COLOR, None);
    }

    /// The most recent frame, if any arrived.
    pub fn image(&self) -> Option<Arc<ColorFrame>> {
        self.requester.get_cached(&self.key)
    }

    /// Request one frame. `None` if nothing arrived in time (default 15s).
    pub async fn fetch_image(&self, timeout: Option<Duration>) -> Option<Arc<ColorFrame>> {
        let queue = self.requester.request_tagged(
            &self.key,
            Some(timeout.unwrap_or(DEFAULT_FETCH_TIMEOUT)),
            Expect::messages(1),
        );
        queue
            .drain()
            .await
            .into_iter()
            .find_map(|(_, frame)| frame)
    }

    /// Request one frame and report it through a callback.
    pub fn async_fetch_image<C, E>(&self, callback: C, error_callback: E, timeout: Option<Duration>)
    where
        C: FnOnce(Arc<ColorFrame>) + Send + 'static,
        E: FnOnce(Status) + Send + 'static,
    {
        let queue = self.requester.request_tagged(
            &self.key,
            Some(timeout.unwrap_or(DEFAULT_FETCH_TIMEOUT)),
            Expect::messages(1),
        );
        self.requester
            .queue_to_error_callback(queue, callback, error_callback);
    }

    /// Call `callback` for every new frame until it returns `true`.
    pub fn add_update_callback<F>(
        &self,
        callback: F,
        finished: Option<FinishedCallback>,
    ) -> UpdateSubscription
    where
        F: FnMut(&ColorFrame) -> bool + Send + 'static,
    {
        self.requester.add_update_callback(callback, finished)
    }
}
