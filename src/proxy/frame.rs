//! Data frame codec.
//!
//! Each frame is a 2-byte big-endian length followed by that many bytes of
//! ciphertext: `[len: u16][payload]`. A zero length is legal and carries an
//! empty payload.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::Cipher;
use crate::error::{Error, Result};

/// Frame header size.
pub const FRAME_HEADER_SIZE: usize = 2;

/// Largest payload a frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Encode one frame around an already-encrypted payload.
pub fn encode_frame(payload: &[u8]) -> Result<BytesMut> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(Error::protocol(format!(
            "frame payload too large: {} bytes",
            payload.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf)
}

/// Encrypt `plaintext` and encode it as one frame.
pub fn seal_frame(cipher: &dyn Cipher, plaintext: &[u8]) -> Result<BytesMut> {
    let ciphertext = cipher.encrypt(plaintext)?;
    encode_frame(&ciphertext)
}

/// Decrypt a frame payload. An empty payload stands for empty data.
pub fn open_frame(cipher: &dyn Cipher, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }
    cipher.decrypt(payload).map_err(|_| Error::FrameCorruption)
}

/// Seal `plaintext` and write it as one frame with a single `write_all`.
pub async fn write_frame<W>(writer: &mut W, cipher: &dyn Cipher, plaintext: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = seal_frame(cipher, plaintext)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Read exactly one frame and return its (still encrypted) payload.
///
/// EOF before or inside a frame surfaces as `UnexpectedEof`.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let len = u16::from_be_bytes(header) as usize;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use crate::crypto::{derive_key, TunnelCipher};

    #[test]
    fn test_encode_frame_header() {
        let frame = encode_frame(&[0xAA; 300]).unwrap();
        assert_eq!(&frame[..2], &[0x01, 0x2C]);
        assert_eq!(frame.len(), 302);
    }

    #[test]
    fn test_encode_empty_frame() {
        let frame = encode_frame(&[]).unwrap();
        assert_eq!(&frame[..], &[0x00, 0x00]);
    }

    #[test]
    fn test_encode_oversized_frame() {
        let payload = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        assert!(encode_frame(&payload).is_err());
    }

    #[tokio::test]
    async fn test_read_frames_in_sequence() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&encode_frame(b"first").unwrap());
        wire.extend_from_slice(&encode_frame(b"").unwrap());
        wire.extend_from_slice(&encode_frame(b"third").unwrap());

        let mut reader = &wire[..];
        assert_eq!(read_frame(&mut reader).await.unwrap(), b"first");
        assert!(read_frame(&mut reader).await.unwrap().is_empty());
        assert_eq!(read_frame(&mut reader).await.unwrap(), b"third");

        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(err.is_expected_close());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_eof() {
        let wire = [0x00, 0x05, b'a', b'b'];
        let mut reader = &wire[..];
        let err = read_frame(&mut reader).await.unwrap_err();
        assert!(err.is_expected_close());
    }

    #[test]
    fn test_seal_and_open() {
        let cipher = TunnelCipher::new(&derive_key("frame-test"));
        let frame = seal_frame(&cipher, b"payload").unwrap();
        let len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        assert_eq!(len, frame.len() - FRAME_HEADER_SIZE);

        let opened = open_frame(&cipher, &frame[FRAME_HEADER_SIZE..]).unwrap();
        assert_eq!(opened, b"payload");
    }

    #[test]
    fn test_open_empty_and_corrupt() {
        let cipher = TunnelCipher::new(&derive_key("frame-test"));
        assert!(open_frame(&cipher, &[]).unwrap().is_empty());
        assert!(matches!(
            open_frame(&cipher, &[0u8; 40]),
            Err(Error::FrameCorruption)
        ));
    }

    #[tokio::test]
    async fn test_write_frame_seals_once() {
        let cipher = TunnelCipher::new(&derive_key("frame-test"));
        let mut wire = Vec::new();
        write_frame(&mut wire, &cipher, b"first").await.unwrap();
        write_frame(&mut wire, &cipher, b"second").await.unwrap();

        let mut reader = &wire[..];
        let first = read_frame(&mut reader).await.unwrap();
        let second = read_frame(&mut reader).await.unwrap();
        assert!(reader.is_empty());
        assert_eq!(open_frame(&cipher, &first).unwrap(), b"first");
        assert_eq!(open_frame(&cipher, &second).unwrap(), b"second");
    }

    proptest! {
        #[test]
        fn prop_frame_read_returns_encoded_payload(
            payload in proptest::collection::vec(any::<u8>(), 0..=MAX_FRAME_PAYLOAD),
        ) {
            let frame = encode_frame(&payload).unwrap();
            prop_assert_eq!(frame.len(), FRAME_HEADER_SIZE + payload.len());

            let read = tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap()
                .block_on(async {
                    let mut reader = &frame[..];
                    read_frame(&mut reader).await
                })
                .unwrap();
            prop_assert_eq!(read, payload);
        }
    }
}
