// ── VNC ──
//
// A remote desktop seen as a color camera that also accepts pointer
// events. Coordinates are normalized to [0, 1].

use std::sync::Arc;
use std::time::Duration;

use reachlink_api::{CommandRecord, CommandSink};
use strum::{AsRefStr, Display, EnumString};

use super::color_camera::{ColorCamera, ColorFrame};
use crate::config::RequesterConfig;
use crate::host::DeviceHandle;
use crate::queue::ResponseQueue;
use crate::request::Expect;
use crate::status::Status;

/// `data_type` of pointer event commands.
pub const POINTER_EVENT: &str = "pointer-event";

const DEFAULT_POINTER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum PointerEventType {
    SendClick,
    SendLeftMouseDown,
    SendLeftMouseUp,
}

/// Facade over a VNC device.
#[derive(Debug, Clone)]
pub struct Vnc {
    camera: ColorCamera,
}

impl Vnc {
    pub fn new(
        sink: Arc<dyn CommandSink>,
        config: RequesterConfig,
        device_type: &str,
        device_name: &str,
    ) -> (Arc<dyn DeviceHandle>, Self) {
        let (handle, camera) = ColorCamera::new(sink, config, device_type, device_name);
        (handle, Self { camera })
    }

    /// The screen, as a color camera.
    pub fn camera(&self) -> &ColorCamera {
        &self.camera
    }

    /// Send a pointer event and wait for its final status.
    ///
    /// Out-of-range coordinates are rejected locally with `bad-input`;
    /// no answer within `timeout` (default 30s) yields [`Status::timeout`].
    pub async fn send_pointer_event(
        &self,
        x: f64,
        y: f64,
        event_type: PointerEventType,
        timeout: Option<Duration>,
    ) -> Status {
        let mut queue = match self.pointer_event_queue(x, y, event_type, timeout) {
            Ok(queue) => queue,
            Err(status) => return status,
        };
        while let Some((record, _)) = queue.recv().await {
            if record.is_cmd_status() {
                let status = Status::from_record(&record);
                if status.is_last_status() {
                    return status;
                }
            }
        }
        Status::timeout()
    }

    /// Send a pointer event and report its final status through `callback`.
    pub fn async_send_pointer_event<C>(
        &self,
        x: f64,
        y: f64,
        event_type: PointerEventType,
        callback: C,
        timeout: Option<Duration>,
    ) where
        C: Fn(Status) + Send + Sync + 'static,
    {
        let queue = match self.pointer_event_queue(x, y, event_type, timeout) {
            Ok(queue) => queue,
            Err(status) => {
                self.camera.requester().run(async move { callback(status) });
                return;
            }
        };
        let callback = Arc::new(callback);
        let error_callback = Arc::clone(&callback);
        self.camera.requester().queue_to_error_callback_transform(
            queue,
            move |status| callback(status),
            move |status| error_callback(status),
            |record, _| {
                let status = record.is_cmd_status().then(|| Status::from_record(record))?;
                status.is_last_status().then_some(status)
            },
        );
    }

    fn pointer_event_queue(
        &self,
        x: f64,
        y: f64,
        event_type: PointerEventType,
        timeout: Option<Duration>,
    ) -> Result<ResponseQueue<ColorFrame>, Status> {
        check_unit("x", x)?;
        check_unit("y", y)?;
        let key = self.camera.device_key();
        let cmd = CommandRecord::new(key.device_type.clone(), key.device_name.clone(), POINTER_EVENT)
            .with_extra("cmd", serde_json::json!(event_type.as_ref()))
            .with_extra("x", serde_json::json!(x))
            .with_extra("y", serde_json::json!(y));
        self.camera
            .requester()
            .send_tagged_request(
                cmd,
                Some(timeout.unwrap_or(DEFAULT_POINTER_TIMEOUT)),
                Expect::terminal(),
            )
            .map_err(|e| {
                tracing::warn!(device = %key, error = %e, "pointer event not sent");
                Status::rejected(e.to_string())
            })
    }
}

fn check_unit(axis: &str, value: f64) -> Result<(), Status> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        let mut status = Status::rejected("bad-input");
        status.message = format!("{axis} must be between 0 and 1");
        Err(status)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use reachlink_api::CommandStatus;

    #[test]
    fn pointer_event_names() {
        assert_eq!(PointerEventType::SendClick.as_ref(), "send-click");
        assert_eq!(PointerEventType::SendLeftMouseUp.to_string(), "send-left-mouse-up");
    }

    #[test]
    fn out_of_range_is_bad_input() {
        let status = check_unit("x", 1.5).unwrap_err();
        assert_eq!(status.status, Some(CommandStatus::Rejected));
        assert_eq!(status.error, "bad-input");
        assert_eq!(status.message, "x must be between 0 and 1");

        assert!(check_unit("y", 0.0).is_ok());
        assert!(check_unit("y", 1.0).is_ok());
        assert!(check_unit("y", f64::NAN).is_err());
    }
}
