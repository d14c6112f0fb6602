use memchr::memchr;

const DEFAULT_BUFFER_SIZE: usize = 32768;

/// Push-based line splitter.
///
/// Bytes are fed in as they arrive from the network; complete lines
/// (terminated by `\n`, with an optional preceding `\r` stripped) are pulled
/// out with `read_line_bytes`. Whatever follows the last line stays available
/// through `unparsed_data`.
pub struct LineReader {
    buf: Box<[u8]>,
    start_offset: usize,
    end_offset: usize,
}

impl LineReader {
    pub fn new() -> Self {
        Self::new_with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn new_with_buffer_size(buffer_size: usize) -> Self {
        // note that `buffer_size` also represents the maximum line length that can be read.
        Self {
            buf: vec![0u8; buffer_size].into_boxed_slice(),
            start_offset: 0usize,
            end_offset: 0usize,
        }
    }

    fn reset_buf_offset(&mut self) {
        if self.start_offset == 0 {
            return;
        }
        self.buf.copy_within(self.start_offset..self.end_offset, 0);
        self.end_offset -= self.start_offset;
        self.start_offset = 0;
    }

    /// Copies as much of `data` as fits and returns the number of bytes taken.
    ///
    /// Returns 0 only when the buffer is full without a complete line, i.e.
    /// the current line is longer than the buffer.
    pub fn feed(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        if self.end_offset == self.buf.len() {
            // Clear the offset so there's space for the next line.
            self.reset_buf_offset();
        }
        let space = self.buf.len() - self.end_offset;
        let len = space.min(data.len());
        self.buf[self.end_offset..self.end_offset + len].copy_from_slice(&data[..len]);
        self.end_offset += len;
        len
    }

    /// Pops the next complete line, without its terminator.
    pub fn read_line_bytes(&mut self) -> Option<&[u8]> {
        let pos = memchr(b'\n', &self.buf[self.start_offset..self.end_offset])?;
        let line_start = self.start_offset;
        let newline_pos = line_start + pos;
        let line_end = if newline_pos > line_start && self.buf[newline_pos - 1] == b'\r' {
            newline_pos - 1
        } else {
            newline_pos
        };
        let new_start_offset = newline_pos + 1;
        if new_start_offset == self.end_offset {
            self.start_offset = 0;
            self.end_offset = 0;
        } else {
            self.start_offset = new_start_offset;
        }
        // The bytes stay in place until the next feed compacts the buffer.
        Some(&self.buf[line_start..line_end])
    }

    pub fn read_line(&mut self) -> std::io::Result<Option<&str>> {
        match self.read_line_bytes() {
            Some(line_bytes) => std::str::from_utf8(line_bytes).map(Some).map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Failed to decode utf8: {}", e),
                )
            }),
            None => Ok(None),
        }
    }

    /// True when the buffer is full and holds no complete line.
    pub fn is_cache_full(&self) -> bool {
        self.start_offset == 0
            && self.end_offset == self.buf.len()
            && memchr(b'\n', &self.buf[..self.end_offset]).is_none()
    }

    /// Length of the partial line buffered so far.
    pub fn pending_len(&self) -> usize {
        self.end_offset - self.start_offset
    }

    pub fn unparsed_data(&self) -> &[u8] {
        &self.buf[self.start_offset..self.end_offset]
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_split_across_feeds() {
        let mut reader = LineReader::new_with_buffer_size(64);
        assert_eq!(reader.feed(b"HTTP/1.1 200 O"), 14);
        assert!(reader.read_line_bytes().is_none());
        reader.feed(b"K\r\n\r\nrest");
        assert_eq!(reader.read_line().unwrap(), Some("HTTP/1.1 200 OK"));
        assert_eq!(reader.read_line().unwrap(), Some(""));
        assert_eq!(reader.read_line().unwrap(), None);
        assert_eq!(reader.unparsed_data(), b"rest");
    }

    #[test]
    fn test_bare_newline_terminator() {
        let mut reader = LineReader::new_with_buffer_size(64);
        reader.feed(b"one\ntwo\n");
        assert_eq!(reader.read_line_bytes().unwrap(), b"one");
        assert_eq!(reader.read_line_bytes().unwrap(), b"two");
        assert!(reader.unparsed_data().is_empty());
    }

    #[test]
    fn test_compacts_after_consumed_lines() {
        let mut reader = LineReader::new_with_buffer_size(8);
        assert_eq!(reader.feed(b"abc\ndefgh"), 8);
        assert_eq!(reader.read_line_bytes().unwrap(), b"abc");
        // "defg" is buffered at offset 4; the next feed compacts it to the front.
        assert_eq!(reader.feed(b"h\n"), 2);
        assert_eq!(reader.read_line_bytes().unwrap(), b"defgh");
    }

    #[test]
    fn test_full_without_newline() {
        let mut reader = LineReader::new_with_buffer_size(4);
        assert_eq!(reader.feed(b"abcdef"), 4);
        assert!(reader.is_cache_full());
        assert_eq!(reader.feed(b"ef"), 0);
    }
}
