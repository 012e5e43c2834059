use thiserror::Error as ThisError;

use crate::frame::Frame;

pub const MAX_FRAME_SIZE: usize = 8 * 1_024 * 1_024;

#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum CodecError {
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error(transparent)]
    SerDe(#[from] serde_json::Error),
}

pub fn encode(frame: &Frame) -> Result<String, CodecError> {
    Ok(serde_json::to_string(frame)?)
}

pub fn decode(text: &str) -> Result<Frame, CodecError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(CodecError::TooLarge {
            size: text.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::frame::{Command, Request};

    #[test]
    fn decode_reads_what_encode_writes() {
        let frame = Frame::Request(Request::new(Command::Subscribe, Some(json!({ "a": 1 }))));

        let text = encode(&frame).unwrap();

        assert_eq!(decode(&text).unwrap(), frame, "frame should survive the codec");
    }

    #[test]
    fn decode_reports_malformed_text() {
        assert!(
            matches!(decode("[\"request\""), Err(CodecError::SerDe(_))),
            "truncated json"
        );
        assert!(
            matches!(decode("{\"not\":\"an array\"}"), Err(CodecError::SerDe(_))),
            "not an envelope"
        );
    }

    #[test]
    fn decode_rejects_oversized_frames() {
        let text = " ".repeat(MAX_FRAME_SIZE + 1);

        assert!(
            matches!(decode(&text), Err(CodecError::TooLarge { .. })),
            "oversized frame"
        );
    }
}
