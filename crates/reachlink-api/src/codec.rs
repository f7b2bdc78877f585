//! JSON-lines framing: one record per `\n`-terminated line.

use tokio_util::codec::LinesCodec;

use crate::error::Error;
use crate::record::{CommandRecord, DeviceDataRecord};

/// Upper bound on a single framed line. Image payloads travel by path,
/// so anything beyond this is a protocol error.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Build the line codec used on both directions of a host connection.
pub fn line_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_LINE_LENGTH)
}

/// Serialize a command into a single line (without the trailing newline).
pub fn encode_command(cmd: &CommandRecord) -> Result<String, Error> {
    Ok(serde_json::to_string(cmd)?)
}

/// Parse one received line into a device-data record.
pub fn decode_device_data(line: &str) -> Result<DeviceDataRecord, Error> {
    Ok(serde_json::from_str(line.trim_end_matches('\r'))?)
}
