use tracing::warn;

use crate::app::adb::transport::{Frame, ShellStream};
use crate::app::error::AppError;

#[derive(Debug, Clone)]
pub enum StreamEnd {
    Closed,
    /// The transport failed before the close frame; the text holds what arrived until then.
    Truncated(AppError),
}

#[derive(Debug, Clone)]
pub struct DecodedOutput {
    pub text: String,
    pub end: StreamEnd,
}

impl DecodedOutput {
    pub fn is_complete(&self) -> bool {
        matches!(self.end, StreamEnd::Closed)
    }
}

/// Drains a shell stream until its close frame, acknowledging every data frame
/// before asking for the next one.
///
/// Transport faults never escape: the loop stops and the output is marked truncated.
pub fn read_all(stream: &mut dyn ShellStream, trace_id: &str) -> DecodedOutput {
    let mut buffer = Vec::<u8>::new();
    let end = loop {
        match stream.receive() {
            Ok(Frame::Data(chunk)) => {
                buffer.extend_from_slice(&chunk);
                if let Err(err) = stream.acknowledge() {
                    break StreamEnd::Truncated(err);
                }
            }
            Ok(Frame::Close) => break StreamEnd::Closed,
            Err(err) => break StreamEnd::Truncated(err),
        }
    };

    if let StreamEnd::Truncated(err) = &end {
        warn!(trace_id = %trace_id, error = %err, bytes = buffer.len(), "shell stream interrupted");
    }

    // Decode once at the end so multi-byte characters split across frames survive.
    DecodedOutput {
        text: String::from_utf8_lossy(&buffer).trim().to_string(),
        end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adb::fake::ScriptedStream;

    #[test]
    fn concatenates_data_frames_and_acks_each_one() {
        let mut stream = ScriptedStream::new(vec![
            Ok(Frame::Data(b"ab".to_vec())),
            Ok(Frame::Data(b"cd".to_vec())),
            Ok(Frame::Close),
        ]);
        let output = read_all(&mut stream, "t");
        assert_eq!(output.text, "abcd");
        assert!(output.is_complete());
        assert_eq!(stream.acks, 2);
        assert_eq!(stream.receives, 3);
    }

    #[test]
    fn transport_fault_returns_partial_text() {
        let mut stream = ScriptedStream::new(vec![
            Ok(Frame::Data(b"Success partial".to_vec())),
            Err(AppError::transport("connection reset", "t")),
        ]);
        let output = read_all(&mut stream, "t");
        assert_eq!(output.text, "Success partial");
        match output.end {
            StreamEnd::Truncated(err) => assert_eq!(err.code, "ERR_TRANSPORT"),
            StreamEnd::Closed => panic!("expected truncated output"),
        }
    }

    #[test]
    fn failed_ack_stops_reading() {
        let mut stream = ScriptedStream::new(vec![
            Ok(Frame::Data(b"first".to_vec())),
            Ok(Frame::Data(b"second".to_vec())),
            Ok(Frame::Close),
        ]);
        stream.fail_ack_after = Some(1);
        let output = read_all(&mut stream, "t");
        assert_eq!(output.text, "first");
        assert!(!output.is_complete());
        assert_eq!(stream.receives, 1);
    }

    #[test]
    fn trims_whitespace_and_keeps_split_utf8() {
        let snowman = "\u{2603}".as_bytes();
        let mut stream = ScriptedStream::new(vec![
            Ok(Frame::Data(b"  \n".to_vec())),
            Ok(Frame::Data(snowman[..1].to_vec())),
            Ok(Frame::Data(snowman[1..].to_vec())),
            Ok(Frame::Data(b" \r\n".to_vec())),
            Ok(Frame::Close),
        ]);
        let output = read_all(&mut stream, "t");
        assert_eq!(output.text, "\u{2603}");
    }

    #[test]
    fn immediate_close_is_empty_and_complete() {
        let mut stream = ScriptedStream::new(vec![Ok(Frame::Close)]);
        let output = read_all(&mut stream, "t");
        assert_eq!(output.text, "");
        assert!(output.is_complete());
        assert_eq!(stream.acks, 0);
    }
}
