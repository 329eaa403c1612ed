use crate::error::ClientError;
use crate::protocol::ProtocolError;
use std::io::{ErrorKind, Read};

pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

const DELIMITER: u8 = b'\n';
const CARRIAGE_RETURN: u8 = b'\r';

/// Splits an unbounded byte stream into `\n`-terminated frames.
///
/// Bytes after the last delimiter are kept until the next `push`. A trailing
/// `\r` is removed from every frame.
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    // Bytes before this offset are known not to contain a delimiter
    scanned: usize,
    max_frame_len: usize,
    discarding: bool,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl LineFramer {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_frame_len,
            discarding: false,
        }
    }

    /// Append freshly read bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes of the incomplete trailing frame
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Split off the next complete frame, if any.
    ///
    /// An oversized frame is reported once as `FrameTooLong` and its bytes
    /// are dropped up to and including the next delimiter.
    pub fn next_frame(&mut self) -> Option<Result<Vec<u8>, ProtocolError>> {
        loop {
            let found = self.buffer[self.scanned..]
                .iter()
                .position(|&byte| byte == DELIMITER);

            let Some(offset) = found else {
                self.scanned = self.buffer.len();
                if self.discarding {
                    self.buffer.clear();
                    self.scanned = 0;
                } else if self.buffer.len() > self.max_frame_len {
                    self.buffer.clear();
                    self.scanned = 0;
                    self.discarding = true;
                    return Some(Err(ProtocolError::FrameTooLong {
                        limit: self.max_frame_len,
                    }));
                }
                return None;
            };

            let end = self.scanned + offset;
            let mut frame: Vec<u8> = self.buffer.drain(..=end).collect();
            self.scanned = 0;

            frame.pop();
            if frame.last() == Some(&CARRIAGE_RETURN) {
                frame.pop();
            }

            if self.discarding {
                self.discarding = false;
                continue;
            }

            if frame.len() > self.max_frame_len {
                return Some(Err(ProtocolError::FrameTooLong {
                    limit: self.max_frame_len,
                }));
            }

            return Some(Ok(frame));
        }
    }

    /// Drain every complete frame currently buffered
    pub fn frames(&mut self) -> Frames<'_> {
        Frames { framer: self }
    }
}

pub struct Frames<'a> {
    framer: &'a mut LineFramer,
}

impl Iterator for Frames<'_> {
    type Item = Result<Vec<u8>, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_frame()
    }
}

/// Lazy sequence of frames read from a transport.
///
/// Ends (`None`) when the peer closes the stream. Oversized frames come out
/// as `ClientError::Protocol`, read failures as `ClientError::Transport`.
pub struct FrameReader<R> {
    reader: R,
    framer: LineFramer,
    chunk: Vec<u8>,
    eof: bool,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, chunk_size: usize, max_frame_len: usize) -> Self {
        Self {
            reader,
            framer: LineFramer::new(max_frame_len),
            chunk: vec![0u8; chunk_size.max(1)],
            eof: false,
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read> Iterator for FrameReader<R> {
    type Item = Result<Vec<u8>, ClientError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(frame) = self.framer.next_frame() {
                return Some(frame.map_err(ClientError::from));
            }

            if self.eof {
                return None;
            }

            match self.reader.read(&mut self.chunk) {
                Ok(0) => {
                    if !self.framer.pending().is_empty() {
                        log::debug!(
                            "Dropping {} bytes of incomplete frame at end of stream",
                            self.framer.pending().len()
                        );
                    }
                    self.eof = true;
                    return None;
                }
                Ok(read) => self.framer.push(&self.chunk[..read]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(ClientError::Transport(e))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const LINES: [&str; 6] = [
        "R device_list 1 | 9ff167 Empatica_E4",
        "E4_Acc 1577836800.125 51 -2 -10",
        "E4_Bvp 1577836800.140 31.2",
        "R device_subscribe acc OK",
        "E4_Tag 1577836801.5",
        "R pause ON",
    ];

    fn wire_bytes(line_ending: &str) -> Vec<u8> {
        LINES
            .iter()
            .flat_map(|line| format!("{}{}", line, line_ending).into_bytes())
            .collect()
    }

    fn feed_in_chunks(bytes: &[u8], chunk_len: usize) -> Vec<String> {
        let mut framer = LineFramer::default();
        let mut out = Vec::new();
        for chunk in bytes.chunks(chunk_len) {
            framer.push(chunk);
            for frame in framer.frames() {
                out.push(String::from_utf8(frame.unwrap()).unwrap());
            }
        }
        assert!(framer.pending().is_empty());
        out
    }

    #[test]
    fn test_any_chunking_preserves_lines() {
        let bytes = wire_bytes("\r\n");
        for chunk_len in 1..=bytes.len() {
            assert_eq!(feed_in_chunks(&bytes, chunk_len), LINES, "chunk size {}", chunk_len);
        }
    }

    #[test]
    fn test_irregular_split_points() {
        let bytes = wire_bytes("\n");
        // Deterministic pseudo-random split points
        let mut framer = LineFramer::default();
        let mut out = Vec::new();
        let mut start = 0;
        let mut step = 7usize;
        while start < bytes.len() {
            step = (step * 31 + 11) % 23 + 1;
            let end = (start + step).min(bytes.len());
            framer.push(&bytes[start..end]);
            out.extend(framer.frames().map(|f| String::from_utf8(f.unwrap()).unwrap()));
            start = end;
        }
        assert_eq!(out, LINES);
    }

    #[test]
    fn test_partial_frame_is_retained() {
        let mut framer = LineFramer::default();
        framer.push(b"R device_connect OK\r\nE4_Temp 12");
        assert_eq!(framer.next_frame().unwrap().unwrap(), b"R device_connect OK");
        assert!(framer.next_frame().is_none());
        assert_eq!(framer.pending(), b"E4_Temp 12");

        framer.push(b"3.4 36.6\r");
        assert!(framer.next_frame().is_none());
        framer.push(b"\n");
        assert_eq!(framer.next_frame().unwrap().unwrap(), b"E4_Temp 123.4 36.6");
    }

    #[test]
    fn test_empty_lines_are_frames() {
        let mut framer = LineFramer::default();
        framer.push(b"\r\n\nR pause OFF\n");
        let frames: Vec<Vec<u8>> = framer.frames().map(Result::unwrap).collect();
        assert_eq!(frames, vec![b"".to_vec(), b"".to_vec(), b"R pause OFF".to_vec()]);
    }

    #[test]
    fn test_oversized_frame_is_skipped() {
        let mut framer = LineFramer::new(16);
        framer.push(b"E4_Bvp 1.0 ");
        assert!(framer.next_frame().is_none());
        framer.push(&[b'9'; 32]);
        assert!(matches!(
            framer.next_frame(),
            Some(Err(ProtocolError::FrameTooLong { limit: 16 }))
        ));
        framer.push(&[b'9'; 32]);
        assert!(framer.next_frame().is_none());
        framer.push(b"99\nR pause ON\n");
        assert_eq!(framer.next_frame().unwrap().unwrap(), b"R pause ON");
        assert!(framer.next_frame().is_none());
    }

    #[test]
    fn test_frame_reader_over_reader() {
        let reader = FrameReader::new(Cursor::new(wire_bytes("\r\n")), 5, DEFAULT_MAX_FRAME_LEN);
        let frames: Vec<String> = reader
            .map(|frame| String::from_utf8(frame.unwrap()).unwrap())
            .collect();
        assert_eq!(frames, LINES);
    }

    #[test]
    fn test_frame_reader_drops_unterminated_tail() {
        let mut reader = FrameReader::new(
            Cursor::new(b"R pause ON\nE4_Temp 1.0".to_vec()),
            64,
            DEFAULT_MAX_FRAME_LEN,
        );
        assert_eq!(reader.next().unwrap().unwrap(), b"R pause ON");
        assert!(reader.next().is_none());
        assert!(reader.next().is_none());
    }
}
