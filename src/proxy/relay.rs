//! Bidirectional relay engine.
//!
//! One side of a relay carries raw bytes (the client on the local half, the
//! target on the remote half); the other side carries encrypted frames (the
//! tunnel). Two reader tasks feed the relay task over typed channels, and
//! the relay task is the only writer to either socket:
//!
//! ```text
//!   plain reader ──PlainMessage──▶ ┌────────────┐ ──frame──▶ sealed socket
//!                                  │ relay task │
//!   sealed reader ─SealedMessage─▶ └────────────┘ ──bytes──▶ plain socket
//! ```
//!
//! The loop ends on the first of: either reader closing, a corrupt frame, a
//! write error, or no traffic for the idle timeout. Teardown happens once, on
//! every exit path, before [`Relay::run`] returns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::crypto::Cipher;
use crate::error::{Error, Result};
use crate::proxy::frame;
use crate::READ_BUFFER_SIZE;

/// Queue depth between a reader task and the relay task.
const CHANNEL_CAPACITY: usize = 64;

/// Message from the plain-side reader.
#[derive(Debug)]
enum PlainMessage {
    Data(Vec<u8>),
    Closed,
}

/// Message from the sealed-side reader.
#[derive(Debug)]
enum SealedMessage {
    Data(Vec<u8>),
    Closed,
    Corrupt,
}

/// Receives the length of every frame read from the sealed side.
#[async_trait]
pub trait FrameObserver: Send + Sync {
    async fn on_frame(&self, frame_len: usize);
}

/// Why a relay stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Plain side reached EOF or failed to read
    PlainClosed,
    /// Sealed side reached EOF or failed to read
    SealedClosed,
    /// No traffic in either direction for the idle timeout
    Timeout,
}

/// Result of a finished relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    pub reason: CloseReason,
    /// Plaintext bytes read from the plain side and sent sealed
    pub bytes_sealed: u64,
    /// Plaintext bytes opened from frames and written to the plain side
    pub bytes_opened: u64,
}

/// A relay between a plain stream and a framed, encrypted stream.
pub struct Relay<P, S> {
    plain: P,
    sealed: S,
    cipher: Arc<dyn Cipher>,
    idle_timeout: Duration,
    observer: Option<Arc<dyn FrameObserver>>,
}

impl<P, S> Relay<P, S>
where
    P: AsyncRead + AsyncWrite + Send + 'static,
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Create a relay.
    pub fn new(plain: P, sealed: S, cipher: Arc<dyn Cipher>, idle_timeout: Duration) -> Self {
        Self {
            plain,
            sealed,
            cipher,
            idle_timeout,
            observer: None,
        }
    }

    /// Report each sealed-side frame length to `observer`.
    pub fn with_observer(mut self, observer: Arc<dyn FrameObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Run until either side closes, a frame fails to decrypt, or the idle
    /// timeout fires. Both streams are closed when this returns.
    pub async fn run(self) -> Result<RelayOutcome> {
        let (plain_r, mut plain_w) = tokio::io::split(self.plain);
        let (sealed_r, mut sealed_w) = tokio::io::split(self.sealed);

        let (plain_tx, mut plain_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (sealed_tx, mut sealed_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let plain_reader = tokio::spawn(read_plain(plain_r, plain_tx));
        let sealed_reader = tokio::spawn(read_sealed(
            sealed_r,
            Arc::clone(&self.cipher),
            self.observer.clone(),
            sealed_tx,
        ));

        let mut bytes_sealed = 0u64;
        let mut bytes_opened = 0u64;

        let result = loop {
            tokio::select! {
                msg = plain_rx.recv() => match msg {
                    Some(PlainMessage::Data(data)) => {
                        let sent =
                            frame::write_frame(&mut sealed_w, self.cipher.as_ref(), &data).await;
                        if let Err(e) = sent {
                            break Err(e);
                        }
                        bytes_sealed += data.len() as u64;
                    }
                    Some(PlainMessage::Closed) | None => break Ok(CloseReason::PlainClosed),
                },
                msg = sealed_rx.recv() => match msg {
                    Some(SealedMessage::Data(data)) => {
                        if let Err(e) = plain_w.write_all(&data).await {
                            break Err(Error::from(e));
                        }
                        bytes_opened += data.len() as u64;
                    }
                    Some(SealedMessage::Corrupt) => break Err(Error::FrameCorruption),
                    Some(SealedMessage::Closed) | None => break Ok(CloseReason::SealedClosed),
                },
                _ = tokio::time::sleep(self.idle_timeout) => break Ok(CloseReason::Timeout),
            }
        };

        teardown(plain_reader, sealed_reader).await;
        let _ = plain_w.shutdown().await;
        let _ = sealed_w.shutdown().await;
        drop(plain_w);
        drop(sealed_w);

        result.map(|reason| RelayOutcome {
            reason,
            bytes_sealed,
            bytes_opened,
        })
    }
}

/// Stop both readers and wait until their halves are dropped.
async fn teardown(plain_reader: JoinHandle<()>, sealed_reader: JoinHandle<()>) {
    plain_reader.abort();
    sealed_reader.abort();
    let _ = plain_reader.await;
    let _ = sealed_reader.await;
}

async fn read_plain<P>(mut reader: ReadHalf<P>, tx: mpsc::Sender<PlainMessage>)
where
    P: AsyncRead,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                tracing::trace!("received {} bytes from plain side", n);
                if tx.send(PlainMessage::Data(buf[..n].to_vec())).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::debug!("plain side read error: {}", e);
                break;
            }
        }
    }
    let _ = tx.send(PlainMessage::Closed).await;
}

async fn read_sealed<S>(
    mut reader: ReadHalf<S>,
    cipher: Arc<dyn Cipher>,
    observer: Option<Arc<dyn FrameObserver>>,
    tx: mpsc::Sender<SealedMessage>,
) where
    S: AsyncRead,
{
    loop {
        let payload = match frame::read_frame(&mut reader).await {
            Ok(payload) => payload,
            Err(e) => {
                if !e.is_expected_close() {
                    tracing::debug!("sealed side read error: {}", e);
                }
                break;
            }
        };

        if let Some(observer) = &observer {
            observer.on_frame(payload.len()).await;
        }

        let message = match frame::open_frame(cipher.as_ref(), &payload) {
            Ok(data) => SealedMessage::Data(data),
            Err(_) => {
                let _ = tx.send(SealedMessage::Corrupt).await;
                return;
            }
        };
        if tx.send(message).await.is_err() {
            return;
        }
    }
    let _ = tx.send(SealedMessage::Closed).await;
}
