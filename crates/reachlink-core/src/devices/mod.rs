//! User-facing device facades built on [`Requester`](crate::Requester).
//!
//! Each facade constructor returns the handle the host drives plus the
//! facade callers use: `(Arc<dyn DeviceHandle>, Facade)`.

mod color_camera;
mod vnc;

pub use color_camera::{COLOR, ColorCamera, ColorFrame, ColorFrameParser};
pub use vnc::{POINTER_EVENT, PointerEventType, Vnc};
