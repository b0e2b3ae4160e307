//! SSE chunk buffering.
//!
//! Network chunks do not align with SSE event boundaries, so raw bytes are
//! accumulated here and complete `data:` payloads handed to the per-format
//! parsers.

/// Accumulates raw bytes and yields complete `data:` payload lines.
#[derive(Default)]
pub struct SseBuffer {
    buf: Vec<u8>,
}

impl SseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every complete `data:` payload it
    /// finished. `event:` lines and comments are skipped. Bytes are only
    /// decoded once a full line is available, so multi-byte UTF-8 split
    /// across chunks survives intact.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
        payloads
    }
}
