//! Tunnel handshake.
//!
//! Sent once by the local side right after dialing the upstream:
//!
//! ```text
//! [1: verLen ][verLen : Encrypt(key[8..16])]
//! [1: hostLen][hostLen: Encrypt(host)]
//! [2: port, big-endian, unencrypted]
//! ```
//!
//! Block lengths are single bytes, so each ciphertext is capped at 255
//! bytes. Data frames with 2-byte lengths follow.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{Cipher, TunnelKey};
use crate::error::{Error, Result};
use crate::proxy::frame;

/// Largest ciphertext a handshake block can carry.
pub const MAX_BLOCK_LEN: usize = u8::MAX as usize;

/// Target announced by a handshake, as read by the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub host: String,
    pub port: u16,
    /// Whether the verification block decrypted to the expected key bytes
    pub verified: bool,
}

fn push_block(buf: &mut Vec<u8>, field: &'static str, ciphertext: &[u8]) -> Result<()> {
    if ciphertext.len() > MAX_BLOCK_LEN {
        return Err(Error::HandshakeTooLarge {
            field,
            len: ciphertext.len(),
        });
    }
    buf.push(ciphertext.len() as u8);
    buf.extend_from_slice(ciphertext);
    Ok(())
}

/// Build the handshake bytes.
pub fn encode_handshake(
    cipher: &dyn Cipher,
    key: &TunnelKey,
    host: &str,
    port: u16,
) -> Result<Vec<u8>> {
    let verification = cipher.encrypt(key.verification_bytes())?;
    let host_block = cipher.encrypt(host.as_bytes())?;

    let mut buf = Vec::with_capacity(2 + verification.len() + host_block.len() + 2);
    push_block(&mut buf, "verification", &verification)?;
    push_block(&mut buf, "host", &host_block)?;
    buf.extend_from_slice(&port.to_be_bytes());
    Ok(buf)
}

/// Write the handshake to the upstream.
pub async fn write_handshake<W>(
    writer: &mut W,
    cipher: &dyn Cipher,
    key: &TunnelKey,
    host: &str,
    port: u16,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = encode_handshake(cipher, key, host, port)?;
    writer.write_all(&buf).await?;
    Ok(())
}

/// Write the handshake, then `initial_payload` (if any) as one data frame.
///
/// Any write error aborts the session; a partial handshake is never resumed.
pub async fn open_tunnel<W>(
    writer: &mut W,
    cipher: &dyn Cipher,
    key: &TunnelKey,
    host: &str,
    port: u16,
    initial_payload: Option<&[u8]>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_handshake(writer, cipher, key, host, port).await?;
    if let Some(payload) = initial_payload {
        frame::write_frame(writer, cipher, payload).await?;
    }
    Ok(())
}

async fn read_block<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u8().await? as usize;
    let mut block = vec![0u8; len];
    reader.read_exact(&mut block).await?;
    Ok(block)
}

/// Read a handshake on the remote side.
///
/// The verification block is always consumed; whether a mismatch is fatal
/// is up to the caller via [`TunnelTarget::verified`].
pub async fn read_handshake<R>(
    reader: &mut R,
    cipher: &dyn Cipher,
    key: &TunnelKey,
) -> Result<TunnelTarget>
where
    R: AsyncRead + Unpin,
{
    let verification = read_block(reader).await?;
    let verified = cipher
        .decrypt(&verification)
        .map(|bytes| bytes == key.verification_bytes())
        .unwrap_or(false);

    let host_block = read_block(reader).await?;
    let host = cipher
        .decrypt(&host_block)
        .map_err(|_| Error::FrameCorruption)?;
    let host = String::from_utf8(host)
        .map_err(|_| Error::protocol("tunnel host is not valid UTF-8"))?;

    let port = reader.read_u16().await?;

    Ok(TunnelTarget {
        host,
        port,
        verified,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{derive_key, TunnelCipher, CIPHER_OVERHEAD};
    use crate::proxy::frame::{open_frame, read_frame};

    #[test]
    fn test_handshake_layout() {
        let key = derive_key("handshake");
        let cipher = TunnelCipher::new(&key);
        let buf = encode_handshake(&cipher, &key, "example.com", 443).unwrap();

        let ver_len = buf[0] as usize;
        assert_eq!(ver_len, 8 + CIPHER_OVERHEAD);
        let verification = cipher.decrypt(&buf[1..1 + ver_len]).unwrap();
        assert_eq!(verification, key.verification_bytes());

        let host_at = 1 + ver_len;
        let host_len = buf[host_at] as usize;
        let host = cipher
            .decrypt(&buf[host_at + 1..host_at + 1 + host_len])
            .unwrap();
        assert_eq!(host, b"example.com");

        assert_eq!(&buf[host_at + 1 + host_len..], &443u16.to_be_bytes());
    }

    #[test]
    fn test_host_too_long() {
        let key = derive_key("handshake");
        let cipher = TunnelCipher::new(&key);
        let host = "a".repeat(MAX_BLOCK_LEN);

        let err = encode_handshake(&cipher, &key, &host, 80).unwrap_err();
        assert!(matches!(err, Error::HandshakeTooLarge { field: "host", .. }));
    }

    #[tokio::test]
    async fn test_open_and_read_handshake() {
        let key = derive_key("handshake");
        let cipher = TunnelCipher::new(&key);

        let mut wire = Vec::new();
        open_tunnel(
            &mut wire,
            &cipher,
            &key,
            "example.com",
            8080,
            Some(b"GET / HTTP/1.1\r\n\r\n"),
        )
        .await
        .unwrap();

        let mut reader = &wire[..];
        let target = read_handshake(&mut reader, &cipher, &key).await.unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 8080);
        assert!(target.verified);

        let payload = read_frame(&mut reader).await.unwrap();
        assert_eq!(open_frame(&cipher, &payload).unwrap(), b"GET / HTTP/1.1\r\n\r\n");
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_wrong_key_not_verified() {
        let local_key = derive_key("one");
        let remote_key = derive_key("two");

        let mut wire = Vec::new();
        write_handshake(
            &mut wire,
            &TunnelCipher::new(&local_key),
            &local_key,
            "example.com",
            80,
        )
        .await
        .unwrap();

        // Verification is consumed but fails; the host block cannot decrypt
        let mut reader = &wire[..];
        let err = read_handshake(&mut reader, &TunnelCipher::new(&remote_key), &remote_key)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FrameCorruption));
    }
}
