//! Newline framing shared by the stream connectors.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{trace, warn};

use crate::{ConnectorError, RawEmitter};

/// Longest line accepted, terminator excluded. Longer lines are dropped.
pub const MAX_LINE: usize = 64 * 1024;

/// Strip the line terminator; `None` for blank lines.
pub fn trim_line(line: &[u8]) -> Option<&[u8]> {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    let line = &line[..end];
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        None
    } else {
        Some(line)
    }
}

/// Split a datagram or chunk into its non-blank lines.
pub fn split_lines(chunk: &[u8]) -> impl Iterator<Item = &[u8]> {
    chunk.split(|b| *b == b'\n').filter_map(trim_line)
}

/// Emit one Raw per line until the reader hits end of stream.
pub async fn pump_lines<R>(reader: R, emitter: &RawEmitter) -> Result<u64, ConnectorError>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);
    let mut count = 0;
    loop {
        buf.clear();
        let n = (&mut reader)
            .take(MAX_LINE as u64 + 1)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Ok(count);
        }
        if n > MAX_LINE && buf.last() != Some(&b'\n') {
            let skipped = skip_line(&mut reader).await?;
            warn!(len = n + skipped, max = MAX_LINE, "dropping over-long line");
            continue;
        }
        if let Some(line) = trim_line(&buf) {
            trace!(len = line.len(), "line");
            emitter.emit(line.to_vec())?;
            count += 1;
        }
    }
}

/// Consume input up to and including the next newline.
async fn skip_line<R>(reader: &mut R) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut skipped = 0;
    loop {
        let (used, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(skipped);
            }
            match available.iter().position(|b| *b == b'\n') {
                Some(i) => (i + 1, true),
                None => (available.len(), false),
            }
        };
        reader.consume(used);
        skipped += used;
        if done {
            return Ok(skipped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signalk_bus::Publisher;

    #[test]
    fn test_split_lines() {
        let chunk = b"$GPHDT,1,T*00\r\n\r\n$GPHDT,2,T*00\n  \n$GPHDT,3";
        let lines: Vec<&[u8]> = split_lines(chunk).collect();
        assert_eq!(
            lines,
            vec![&b"$GPHDT,1,T*00"[..], &b"$GPHDT,2,T*00"[..], &b"$GPHDT,3"[..]]
        );
    }

    #[tokio::test]
    async fn test_pump_lines_until_eof() {
        let publisher = Publisher::new(16);
        let sub = publisher.subscribe();
        let emitter = RawEmitter::new("log", "nmea0183", publisher);

        let input: &[u8] = b"one\r\n\ntwo\nthree";
        assert_eq!(pump_lines(input, &emitter).await.unwrap(), 3);

        for expected in [&b"one"[..], b"two", b"three"] {
            assert_eq!(&sub.recv_raw().await.unwrap().payload[..], expected);
        }
    }

    #[tokio::test]
    async fn test_over_long_line_is_dropped_not_truncated() {
        let publisher = Publisher::new(16);
        let sub = publisher.subscribe();
        let emitter = RawEmitter::new("serial", "nmea0183", publisher);

        let mut input = vec![b'x'; MAX_LINE + 6000];
        input.extend_from_slice(b"\r\n$GPHDT,2,T*00\n");
        input.extend(std::iter::repeat(b'y').take(MAX_LINE * 2));
        assert_eq!(pump_lines(&input[..], &emitter).await.unwrap(), 1);

        assert_eq!(&sub.recv_raw().await.unwrap().payload[..], b"$GPHDT,2,T*00");
        assert_eq!(emitter.emitted(), 1);
    }

    #[tokio::test]
    async fn test_line_at_limit_is_kept() {
        let publisher = Publisher::new(4);
        let sub = publisher.subscribe();
        let emitter = RawEmitter::new("serial", "csv", publisher);

        let mut input = vec![b'z'; MAX_LINE];
        input.push(b'\n');
        assert_eq!(pump_lines(&input[..], &emitter).await.unwrap(), 1);
        assert_eq!(sub.recv_raw().await.unwrap().payload.len(), MAX_LINE);
    }
}
