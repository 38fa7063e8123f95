//! Byte stream to display line framing.
//!
//! Child processes write raw bytes with arbitrary chunk boundaries. Progress
//! bars redraw themselves with a bare `\r`, regular output ends lines with
//! `\n` or `\r\n`, and a multi-byte UTF-8 character may arrive split across
//! two reads. [`LineReassembler`] turns that stream into whole decoded lines
//! and produces the same lines no matter how the stream was chunked.

/// Longest line kept in the buffer before it is force-cut.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Incremental line splitter for one output stream.
///
/// Splitting happens on raw bytes: `\n` and `\r` never occur inside a
/// multi-byte UTF-8 sequence, so a line is only decoded once all of its bytes
/// have arrived. Invalid sequences are replaced with U+FFFD.
#[derive(Debug, Default)]
pub struct LineReassembler {
    pending: Vec<u8>,
    /// Prefix of `pending` already scanned without finding a terminator.
    scanned: usize,
}

impl LineReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buffered bytes that do not form a complete line yet.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed a chunk and return every line it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        if chunk.is_empty() {
            return Vec::new();
        }
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut i = self.scanned;

        while i < self.pending.len() {
            match self.pending[i] {
                b'\n' => {
                    lines.push(decode(&self.pending[start..i]));
                    i += 1;
                    start = i;
                }
                b'\r' => {
                    // A trailing `\r` may be the first half of `\r\n`.
                    if i + 1 == self.pending.len() {
                        break;
                    }
                    lines.push(decode(&self.pending[start..i]));
                    i += if self.pending[i + 1] == b'\n' { 2 } else { 1 };
                    start = i;
                }
                _ if i - start >= MAX_LINE_BYTES => {
                    let cut = char_boundary_before(&self.pending, start, i);
                    lines.push(decode(&self.pending[start..cut]));
                    start = cut;
                    i = cut;
                }
                _ => i += 1,
            }
        }

        self.pending.drain(..start);
        self.scanned = i - start;
        lines
    }

    /// Flush the unterminated tail at end of stream.
    ///
    /// A lone trailing `\r` terminates the line before it, so `"50%\r"` at
    /// exit yields `"50%"`, and a bare `"\r"` yields an empty line.
    pub fn finish(&mut self) -> Option<String> {
        let mut rest = std::mem::take(&mut self.pending);
        self.scanned = 0;
        if rest.last() == Some(&b'\r') {
            rest.pop();
            return Some(decode(&rest));
        }
        if rest.is_empty() {
            None
        } else {
            Some(decode(&rest))
        }
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Find a cut position in `start..=end` that does not split a UTF-8 sequence.
fn char_boundary_before(buf: &[u8], start: usize, end: usize) -> usize {
    let mut cut = end;
    while cut > start && is_continuation(buf[cut]) {
        cut -= 1;
    }
    if cut == start { end } else { cut }
}

fn is_continuation(byte: u8) -> bool {
    byte & 0xC0 == 0x80
}
