use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

const LINE_BUFFER_SIZE: usize = 4096;

/// Reads CRLF/LF-terminated lines off a byte stream with a hard per-line
/// cap. Bytes read past the last consumed line are kept and handed back by
/// [`LineReader::into_parts`], so switching from line parsing to verbatim
/// relaying never drops data.
pub struct LineReader<R> {
    r: R,
    bytes: Vec<u8>,
    max_line: usize,
}

impl<R> LineReader<R> {
    pub fn new(r: R, max_line: usize) -> Self {
        Self {
            r,
            bytes: Vec::new(),
            max_line,
        }
    }

    /// Hand back the inner stream plus any buffered-but-unconsumed bytes.
    pub fn into_parts(self) -> (R, Vec<u8>) {
        (self.r, self.bytes)
    }

    pub fn inner_mut(&mut self) -> &mut R {
        &mut self.r
    }
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    /// Next line with the terminator stripped, `None` on a clean EOF at a
    /// line boundary. A partial line at EOF and an over-long line are both
    /// errors.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.bytes[scanned..].iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.bytes.drain(..scanned + pos + 1).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            scanned = self.bytes.len();
            if scanned > self.max_line {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "Too long line received",
                ));
            }

            let mut buf = [0u8; LINE_BUFFER_SIZE];
            let read = self.r.read(&mut buf).await?;
            if read == 0 {
                if self.bytes.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} unhandled bytes", self.bytes.len()),
                ));
            }
            self.bytes.extend_from_slice(&buf[..read]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn splits_crlf_and_lf_lines() {
        let data: &[u8] = b"+OK ready\r\nsecond\nthird\r\n";
        let mut reader = LineReader::new(data, 4096);
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "+OK ready");
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "second");
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "third");
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn leftover_bytes_survive_into_parts() {
        let data: &[u8] = b"+OK logged in\r\nRETR 1\r\npartial";
        let mut reader = LineReader::new(data, 4096);
        assert_eq!(reader.next_line().await.unwrap().unwrap(), "+OK logged in");
        let (_inner, leftover) = reader.into_parts();
        assert_eq!(leftover, b"RETR 1\r\npartial");
    }

    #[tokio::test]
    async fn over_long_line_is_an_error() {
        let data = vec![b'x'; 9000];
        let mut reader = LineReader::new(&data[..], 4096);
        let err = reader.next_line().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn partial_line_at_eof_is_an_error() {
        let data: &[u8] = b"no terminator";
        let mut reader = LineReader::new(data, 4096);
        let err = reader.next_line().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
