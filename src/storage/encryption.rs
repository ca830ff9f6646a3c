//! At-rest encryption of artifacts.
//!
//! Objects are encrypted with AES-256 in CTR mode. The key is the SHA-256
//! digest of the configured passphrase and every object starts with its own
//! random 16 byte IV, so decrypting needs nothing but the same passphrase.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use ctr::cipher::{Iv, Key, KeyIvInit, StreamCipher};
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, ReadBuf};

use crate::BoxReader;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

pub const IV_LEN: usize = 16;

#[derive(Clone)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    pub fn from_passphrase(passphrase: &str) -> Self {
        Self(Sha256::digest(passphrase.as_bytes()).into())
    }

    fn cipher(&self, iv: &[u8; IV_LEN]) -> Aes256Ctr {
        Aes256Ctr::new(
            Key::<Aes256Ctr>::from_slice(&self.0),
            Iv::<Aes256Ctr>::from_slice(iv),
        )
    }

    /// Wraps a plaintext stream into one yielding `IV || ciphertext`.
    pub fn encrypt(&self, plaintext: BoxReader) -> BoxReader {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        Box::pin(EncryptingReader {
            inner: plaintext,
            cipher: self.cipher(&iv),
            iv,
            iv_written: 0,
        })
    }

    /// Reverses [`EncryptionKey::encrypt`].
    pub fn decrypt(&self, ciphertext: BoxReader) -> BoxReader {
        Box::pin(DecryptingReader {
            inner: ciphertext,
            key: self.clone(),
            state: DecryptState::Iv {
                iv: [0u8; IV_LEN],
                filled: 0,
            },
        })
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

struct EncryptingReader {
    inner: BoxReader,
    cipher: Aes256Ctr,
    iv: [u8; IV_LEN],
    iv_written: usize,
}

impl AsyncRead for EncryptingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.iv_written < IV_LEN {
            let remaining = &this.iv[this.iv_written..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.iv_written += n;
            return Poll::Ready(Ok(()));
        }

        let start = buf.filled().len();
        ready!(this.inner.as_mut().poll_read(cx, buf))?;
        this.cipher.apply_keystream(&mut buf.filled_mut()[start..]);
        Poll::Ready(Ok(()))
    }
}

enum DecryptState {
    Iv { iv: [u8; IV_LEN], filled: usize },
    Body(Aes256Ctr),
}

struct DecryptingReader {
    inner: BoxReader,
    key: EncryptionKey,
    state: DecryptState,
}

impl AsyncRead for DecryptingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                DecryptState::Iv { iv, filled } => {
                    let mut header = ReadBuf::new(&mut iv[*filled..]);
                    ready!(this.inner.as_mut().poll_read(cx, &mut header))?;
                    let n = header.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "encrypted object is shorter than its IV",
                        )));
                    }
                    *filled += n;
                    if *filled == IV_LEN {
                        let cipher = this.key.cipher(iv);
                        this.state = DecryptState::Body(cipher);
                    }
                }
                DecryptState::Body(cipher) => {
                    let start = buf.filled().len();
                    ready!(this.inner.as_mut().poll_read(cx, buf))?;
                    cipher.apply_keystream(&mut buf.filled_mut()[start..]);
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}
