use bytes::BytesMut;

/// Splits a byte stream into `\n`-terminated lines across arbitrary read
/// boundaries.
///
/// The carry buffer holds raw bytes, and a line is only decoded once its
/// terminating newline has arrived, so a code point split between two reads is
/// always decoded whole.
#[derive(Debug, Default)]
pub struct LineReassembler {
    carry: BytesMut,
}

impl LineReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every line it completed, without the
    /// `\n` / `\r\n` terminator.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.carry.extend_from_slice(chunk);
        let mut lines = Vec::new();
        // Only the bytes just appended can contain a new terminator.
        let mut search_from = self.carry.len() - chunk.len();
        while let Some(rel) = self.carry[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + rel;
            let mut line = self.carry.split_to(end + 1);
            line.truncate(end);
            if line.last() == Some(&b'\r') {
                line.truncate(end - 1);
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
            search_from = 0;
        }
        lines
    }

    /// Drains the unterminated tail at end of stream. Returns `None` when the
    /// stream ended on a newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.carry.is_empty() {
            return None;
        }
        let mut tail = self.carry.split();
        if tail.last() == Some(&b'\r') {
            tail.truncate(tail.len() - 1);
        }
        Some(String::from_utf8_lossy(&tail).into_owned())
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.carry.len()
    }
}
