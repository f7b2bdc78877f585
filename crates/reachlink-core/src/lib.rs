// reachlink-core: request correlation, update dispatch and device facades
// on top of the reachlink-api wire layer.

pub mod config;
pub mod device;
pub mod devices;
pub mod error;
pub mod host;
pub mod queue;
pub mod request;
pub mod requester;
pub mod status;
pub mod subscription;
pub mod tag;

mod cache;
mod executor;
mod pending;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{HostConfig, RequesterConfig};
pub use device::{DeviceBase, KeyValueKey};
pub use devices::{ColorCamera, ColorFrame, PointerEventType, Vnc};
pub use error::CoreError;
pub use host::{DeviceHandle, Host};
pub use queue::{Response, ResponseQueue, ResponseStream};
pub use request::Expect;
pub use requester::{MessageParser, Requester};
pub use status::Status;
pub use subscription::{FinishedCallback, UpdateCallback, UpdateSubscription};
pub use tag::generate_tag;

// Wire types callers need alongside the engine.
pub use reachlink_api::{CommandRecord, CommandStatus, DeviceDataRecord, DeviceKey};
