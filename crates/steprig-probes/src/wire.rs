//! STEP wire framing.
//!
//! A frame is an 8-byte header of two big-endian `u32`s (JSON length, binary
//! length), followed by the UTF-8 JSON document and the raw binary payload.
//! Requests and responses share the envelope fields `operation`, `type`,
//! `direction`, and `token`; operation-specific fields ride alongside them.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const OP_LOGIN: &str = "LOGIN";
pub const OP_SAVE: &str = "SAVE";
pub const OP_UPLOAD: &str = "UPLOAD";
pub const OP_BYE: &str = "BYE";

pub const TYPE_AUTH: &str = "AUTH";
pub const TYPE_FILE: &str = "FILE";

pub const DIR_REQUEST: &str = "REQUEST";

/// Fields a STEP response may carry. Everything beyond `status` is
/// operation-specific, so all of it is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    pub status: Option<u32>,
    pub status_msg: Option<String>,
    pub token: Option<String>,
    pub key: Option<String>,
    pub size: Option<u64>,
    pub total_block: Option<u64>,
    pub block_size: Option<u64>,
    pub md5: Option<String>,
}

impl Response {
    /// 4xx statuses are protocol rejections (bad credential, bad request).
    pub fn is_rejection(&self) -> bool {
        matches!(self.status, Some(s) if (400..500).contains(&s))
    }
}

/// Build a request envelope with operation-specific `fields` merged in.
pub fn request(operation: &str, data_type: &str, token: Option<&str>, fields: Value) -> Value {
    let mut message = json!({
        "operation": operation,
        "type": data_type,
        "direction": DIR_REQUEST,
        "token": token,
    });
    if let (Some(obj), Some(extra)) = (message.as_object_mut(), fields.as_object()) {
        for (k, v) in extra {
            obj.insert(k.clone(), v.clone());
        }
    }
    message
}

/// Serialize a frame: header + JSON + binary. Fails when either part does
/// not fit the header's `u32` length fields.
pub fn pack(message: &Value, bin: &[u8]) -> std::io::Result<Vec<u8>> {
    let json_bytes = message.to_string().into_bytes();
    let header = frame_header(json_bytes.len(), bin.len())?;
    let mut frame = Vec::with_capacity(8 + json_bytes.len() + bin.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&json_bytes);
    frame.extend_from_slice(bin);
    Ok(frame)
}

fn frame_header(json_len: usize, bin_len: usize) -> std::io::Result<[u8; 8]> {
    let too_large =
        |part| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{part} too large for frame"));
    let json_len = u32::try_from(json_len).map_err(|_| too_large("json part"))?;
    let bin_len = u32::try_from(bin_len).map_err(|_| too_large("binary payload"))?;

    let mut header = [0u8; 8];
    header[..4].copy_from_slice(&json_len.to_be_bytes());
    header[4..].copy_from_slice(&bin_len.to_be_bytes());
    Ok(header)
}

/// Write one frame to `stream`.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(
    stream: &mut W,
    message: &Value,
    bin: &[u8],
) -> std::io::Result<()> {
    stream.write_all(&pack(message, bin)?).await
}

/// Read one frame from `stream`, returning the parsed JSON and the binary
/// payload.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    stream: &mut R,
) -> std::io::Result<(Value, Vec<u8>)> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await?;
    let json_len = u32::from_be_bytes(header[0..4].try_into().unwrap()) as usize;
    let bin_len = u32::from_be_bytes(header[4..8].try_into().unwrap()) as usize;

    let mut json_bytes = vec![0u8; json_len];
    stream.read_exact(&mut json_bytes).await?;
    let mut bin = vec![0u8; bin_len];
    stream.read_exact(&mut bin).await?;

    let value = serde_json::from_slice(&json_bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok((value, bin))
}

/// Read one frame and deserialize the JSON part into a [`Response`].
pub async fn read_response<R: AsyncReadExt + Unpin>(stream: &mut R) -> std::io::Result<Response> {
    let (value, _) = read_frame(stream).await?;
    serde_json::from_value(value).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_layout_matches_the_wire_format() {
        let msg = json!({"operation": "BYE"});
        let frame = pack(&msg, b"abc").unwrap();

        let json_len = u32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
        let bin_len = u32::from_be_bytes(frame[4..8].try_into().unwrap()) as usize;
        assert_eq!(bin_len, 3);
        assert_eq!(&frame[8 + json_len..], b"abc");

        let parsed: Value = serde_json::from_slice(&frame[8..8 + json_len]).unwrap();
        assert_eq!(parsed["operation"], "BYE");
    }

    #[tokio::test]
    async fn frames_survive_a_read_write_cycle() {
        let msg = request(
            OP_UPLOAD,
            TYPE_FILE,
            Some("tok"),
            json!({"key": "f.bin", "block_index": 3}),
        );
        let mut buf = Vec::new();
        write_frame(&mut buf, &msg, &[1, 2, 3, 4]).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let (value, bin) = read_frame(&mut cursor).await.unwrap();
        assert_eq!(value["operation"], "UPLOAD");
        assert_eq!(value["direction"], "REQUEST");
        assert_eq!(value["token"], "tok");
        assert_eq!(value["block_index"], 3);
        assert_eq!(bin, vec![1, 2, 3, 4]);
    }

    #[test]
    fn oversized_payload_cannot_be_framed() {
        let err = frame_header(16, u32::MAX as usize + 1).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);

        let err = frame_header(u32::MAX as usize + 1, 0).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);

        assert!(frame_header(u32::MAX as usize, 0).is_ok());
    }

    #[test]
    fn rejection_band_is_4xx_only() {
        let mut r = Response::default();
        r.status = Some(401);
        assert!(r.is_rejection());
        r.status = Some(200);
        assert!(!r.is_rejection());
        r.status = Some(500);
        assert!(!r.is_rejection());
        r.status = None;
        assert!(!r.is_rejection());
    }
}
