//! Newline-delimited JSON framing.
//!
//! The worker's output arrives in arbitrary chunks: one physical write can be
//! split across several reads, and one read can carry several lines. The
//! codec buffers raw bytes and only decodes complete lines, so multi-byte
//! UTF-8 sequences split across chunks are reassembled too.

use workhorse_core::{Command, FramingError, WorkerMessage};

use crate::error::SupervisorError;

/// One decoded line: a message, or the reason it was dropped.
pub type Decoded = Result<WorkerMessage, FramingError>;

/// Frame codec with a carry-over buffer for partial lines.
#[derive(Debug, Default)]
pub struct FrameCodec {
    buffer: Vec<u8>,
}

impl FrameCodec {
    /// Create a codec with an empty carry-over buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize a command as a single newline-terminated frame.
    pub fn encode(command: &Command) -> Result<Vec<u8>, SupervisorError> {
        let mut frame = serde_json::to_vec(command)?;
        frame.push(b'\n');
        Ok(frame)
    }

    /// Append a chunk and decode every line it completes, in order.
    ///
    /// Blank lines are skipped. A line that fails to decode is returned as an
    /// error in its position; the lines after it are still decoded.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        self.buffer.extend_from_slice(chunk);

        let mut decoded = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            if let Some(item) = decode_line(&self.buffer[start..end]) {
                decoded.push(item);
            }
            start = end + 1;
        }
        self.buffer.drain(..start);
        decoded
    }

    /// Decode whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<Decoded> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }

    /// Drop the carry-over buffer.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of buffered bytes waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(line: &[u8]) -> Option<Decoded> {
    let line = trim(line);
    if line.is_empty() {
        return None;
    }
    Some(WorkerMessage::decode(line))
}

fn trim(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use workhorse_core::{Completion, Progress};

    const STREAM: &str = concat!(
        r#"{"type":"ready"}"#,
        "\n",
        r#"{"type":"progress","data":{"task":"load_model","current":1,"total":2}}"#,
        "\n",
        "garbage line\n",
        "\n",
        r#"{"type":"log","data":"Modèle chargé ✓"}"#,
        "\r\n",
        r#"{"type":"complete","data":{"task":"load_model"}}"#,
        "\n",
    );

    /// Render decoded items in a comparable form.
    fn summarize(items: Vec<Decoded>) -> Vec<String> {
        items
            .into_iter()
            .map(|item| match item {
                Ok(msg) => format!("{:?}", msg),
                Err(_) => "framing-error".to_string(),
            })
            .collect()
    }

    fn feed_in_chunks(bytes: &[u8], cuts: &[usize]) -> Vec<String> {
        let mut codec = FrameCodec::new();
        let mut items = Vec::new();
        let mut prev = 0;
        for &cut in cuts.iter().chain(std::iter::once(&bytes.len())) {
            items.extend(codec.feed(&bytes[prev..cut]));
            prev = cut;
        }
        items.extend(codec.finish());
        summarize(items)
    }

    #[test]
    fn test_encode_round_trip() {
        let cmd = Command::new("download_model", json!({"repo_id": "org/m", "save_dir": "/tmp"}));
        let frame = FrameCodec::encode(&cmd).unwrap();

        assert_eq!(frame.last(), Some(&b'\n'));
        assert_eq!(frame.iter().filter(|b| **b == b'\n').count(), 1);
        let parsed: Command = serde_json::from_slice(&frame).unwrap();
        assert_eq!(parsed, cmd);
    }

    #[test]
    fn test_feed_whole_stream() {
        let mut codec = FrameCodec::new();
        let items = codec.feed(STREAM.as_bytes());

        assert_eq!(items.len(), 5);
        assert_eq!(items[0].as_ref().unwrap(), &WorkerMessage::Ready);
        assert_eq!(
            items[1].as_ref().unwrap(),
            &WorkerMessage::Progress(Progress {
                task: Some("load_model".to_string()),
                current: 1,
                total: 2,
            })
        );
        assert!(items[2].is_err());
        assert_eq!(
            items[3].as_ref().unwrap(),
            &WorkerMessage::Log("Modèle chargé ✓".to_string())
        );
        assert_eq!(
            items[4].as_ref().unwrap(),
            &WorkerMessage::Complete(Completion {
                task: Some("load_model".to_string()),
                data: json!({"task": "load_model"}),
            })
        );
        assert_eq!(codec.pending_len(), 0);
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let bytes = STREAM.as_bytes();
        let whole = feed_in_chunks(bytes, &[]);

        for cut in 1..bytes.len() {
            assert_eq!(feed_in_chunks(bytes, &[cut]), whole, "split at {}", cut);
        }
        for step in [1usize, 2, 3, 7, 13] {
            let cuts: Vec<usize> = (step..bytes.len()).step_by(step).collect();
            assert_eq!(feed_in_chunks(bytes, &cuts), whole, "chunks of {}", step);
        }
    }

    #[test]
    fn test_partial_line_is_deferred() {
        let mut codec = FrameCodec::new();
        assert!(codec.feed(br#"{"type":"sta"#).is_empty());
        assert!(codec.pending_len() > 0);

        let items = codec.feed(b"tus\",\"data\":\"Python backend ready\"}\n{\"type\"");
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].as_ref().unwrap(),
            &WorkerMessage::Status("Python backend ready".to_string())
        );
        assert_eq!(codec.pending_len(), br#"{"type""#.len());
    }

    #[test]
    fn test_finish_decodes_unterminated_tail() {
        let mut codec = FrameCodec::new();
        assert!(codec.feed(br#"{"type":"ready"}"#).is_empty());
        assert_eq!(codec.finish().unwrap().unwrap(), WorkerMessage::Ready);
        assert!(codec.finish().is_none());
    }

    #[test]
    fn test_reset_drops_carry_over() {
        let mut codec = FrameCodec::new();
        codec.feed(b"{\"type\":");
        codec.reset();
        assert_eq!(codec.pending_len(), 0);
        let items = codec.feed(b"{\"type\":\"ready\"}\n");
        assert_eq!(items.len(), 1);
        assert!(items[0].is_ok());
    }
}
