use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const CRLF: &[u8] = b"\r\n";

/// Splits a byte stream into CRLF terminated lines.
///
/// Yielded lines keep their terminator.
/// Whatever follows the last terminator stays buffered until more bytes arrive.
#[derive(Debug, Default)]
pub struct CrlfCodec {
    /// How far we have looked for a terminator into the buffer.
    cursor: usize,
}

impl Decoder for CrlfCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let read_to = src.len();

        match src[self.cursor..read_to]
            .windows(CRLF.len())
            .position(|window| window == CRLF)
        {
            Some(position) => {
                let end = self.cursor + position + CRLF.len();
                self.cursor = 0;

                Ok(Some(src.split_to(end).freeze()))
            }
            None => {
                // A trailing `\r` may be completed by the next chunk.
                self.cursor = read_to.saturating_sub(1);
                Ok(None)
            }
        }
    }
}

impl Encoder<&str> for CrlfCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len() + CRLF.len());
        dst.extend_from_slice(item.as_bytes());
        dst.extend_from_slice(CRLF);
        Ok(())
    }
}

/// Feeds chunks to a [`CrlfCodec`], yielding complete lines.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    codec: CrlfCodec,
    stored: BytesMut,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.stored.extend_from_slice(chunk);

        let mut lines = vec![];
        // Decoding from memory never fails.
        while let Ok(Some(line)) = self.codec.decode(&mut self.stored) {
            lines.push(line);
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn lines_keep_terminator() {
        let mut buffer = LineBuffer::default();

        assert_eq!(
            buffer.push(b"ok\r\nboot\r\n"),
            vec![Bytes::from_static(b"ok\r\n"), Bytes::from_static(b"boot\r\n")]
        );
    }

    #[test]
    fn remainder_is_kept_across_chunks() {
        let mut buffer = LineBuffer::default();

        assert!(buffer.push(b"log").is_empty());
        assert!(buffer.push(b"in: \r").is_empty());
        assert_eq!(buffer.push(b"\nroot"), vec![Bytes::from_static(b"login: \r\n")]);
        assert_eq!(buffer.push(b"\r\n"), vec![Bytes::from_static(b"root\r\n")]);
    }

    #[test]
    fn bare_newlines_do_not_split() {
        let mut buffer = LineBuffer::default();

        assert!(buffer.push(b"a\nb\n").is_empty());
        assert_eq!(buffer.push(b"\r\n"), vec![Bytes::from_static(b"a\nb\n\r\n")]);
    }

    #[test]
    fn encode_appends_crlf() {
        let mut dst = BytesMut::new();
        CrlfCodec::default().encode("AT", &mut dst).unwrap();

        assert_eq!(&dst[..], b"AT\r\n");
    }
}
