//! Authenticated, encrypted channels over TCP.
//!
//! # Handshake
//!
//! Both ends run the same three steps:
//!
//! 1. Send a hello: static ed25519 public key followed by a fresh x25519
//!    ephemeral public key (64 bytes).
//! 2. Hash both hellos (initiator first) into a transcript and send an
//!    ed25519 signature over it (64 bytes).
//! 3. Verify the peer's signature against the peer's static key, then derive
//!    one ChaCha20-Poly1305 key per direction from the x25519 shared secret
//!    and the transcript.
//!
//! # Framing
//!
//! After the handshake every frame is `u32` big-endian length followed by the
//! sealed bytes, the same length-prefix framing the plain TCP transport used.
//! Nonces are per-direction counters, so frames cannot be replayed or
//! reordered within a connection.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey as EphemeralPublic};

use crate::directory::PublicKey;

const TRANSCRIPT_LABEL: &[u8] = b"replicated-log/handshake/v1";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake I/O: {0}")]
    Io(#[from] io::Error),
    #[error("peer presented an invalid static key")]
    BadKey,
    #[error("peer signature over the handshake transcript is invalid")]
    BadSignature,
    #[error("key exchange produced a non-contributory secret")]
    WeakSecret,
    #[error("expected peer key {expected}, got {actual}")]
    UnexpectedPeer { expected: String, actual: String },
}

/// Long-term ed25519 identity of a node or client.
#[derive(Clone)]
pub struct Identity {
    signing: SigningKey,
}

impl Identity {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Parses a hex encoded 32-byte ed25519 secret key.
    pub fn from_hex(hex_key: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|err| anyhow::anyhow!("private key is not valid hex: {err}"))?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("private key must be 32 bytes, got {}", bytes.len()))?;
        Ok(Self {
            signing: SigningKey::from_bytes(&secret),
        })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.signing.to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        self.signing.verifying_key().to_bytes()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &hex::encode(self.public_key()))
            .finish()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

/// An established channel; all frames are sealed.
pub struct SecureChannel {
    stream: TcpStream,
    remote: PublicKey,
    sealer: ChaCha20Poly1305,
    opener: ChaCha20Poly1305,
    send_counter: u64,
    recv_counter: u64,
}

impl SecureChannel {
    /// Runs the handshake as the dialing side. When `expected` is given, the
    /// remote static key must match it.
    pub fn initiate(
        stream: TcpStream,
        identity: &Identity,
        expected: Option<&PublicKey>,
    ) -> Result<Self, HandshakeError> {
        let channel = Self::handshake(stream, identity, Role::Initiator)?;
        if let Some(expected) = expected {
            if &channel.remote != expected {
                return Err(HandshakeError::UnexpectedPeer {
                    expected: hex::encode(expected),
                    actual: hex::encode(channel.remote),
                });
            }
        }
        Ok(channel)
    }

    /// Runs the handshake as the accepting side.
    pub fn accept(stream: TcpStream, identity: &Identity) -> Result<Self, HandshakeError> {
        Self::handshake(stream, identity, Role::Responder)
    }

    fn handshake(
        mut stream: TcpStream,
        identity: &Identity,
        role: Role,
    ) -> Result<Self, HandshakeError> {
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = EphemeralPublic::from(&ephemeral);

        let mut hello = [0u8; 64];
        hello[..32].copy_from_slice(&identity.public_key());
        hello[32..].copy_from_slice(ephemeral_public.as_bytes());
        stream.write_all(&hello)?;

        let mut remote_hello = [0u8; 64];
        stream.read_exact(&mut remote_hello)?;

        let mut remote = [0u8; 32];
        remote.copy_from_slice(&remote_hello[..32]);
        let mut remote_ephemeral = [0u8; 32];
        remote_ephemeral.copy_from_slice(&remote_hello[32..]);
        let remote_key = VerifyingKey::from_bytes(&remote).map_err(|_| HandshakeError::BadKey)?;

        let (first, second) = match role {
            Role::Initiator => (&hello, &remote_hello),
            Role::Responder => (&remote_hello, &hello),
        };
        let transcript: [u8; 32] = Sha256::new()
            .chain_update(TRANSCRIPT_LABEL)
            .chain_update(first)
            .chain_update(second)
            .finalize()
            .into();

        let signature = identity.signing.sign(&transcript);
        stream.write_all(&signature.to_bytes())?;

        let mut remote_signature = [0u8; 64];
        stream.read_exact(&mut remote_signature)?;
        remote_key
            .verify_strict(&transcript, &Signature::from_bytes(&remote_signature))
            .map_err(|_| HandshakeError::BadSignature)?;

        let shared = ephemeral.diffie_hellman(&EphemeralPublic::from(remote_ephemeral));
        if !shared.was_contributory() {
            return Err(HandshakeError::WeakSecret);
        }
        let initiator_key = derive_key(shared.as_bytes(), &transcript, b"initiator");
        let responder_key = derive_key(shared.as_bytes(), &transcript, b"responder");
        let (seal_key, open_key) = match role {
            Role::Initiator => (initiator_key, responder_key),
            Role::Responder => (responder_key, initiator_key),
        };

        stream.set_read_timeout(None)?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            remote,
            sealer: ChaCha20Poly1305::new(Key::from_slice(&seal_key)),
            opener: ChaCha20Poly1305::new(Key::from_slice(&open_key)),
            send_counter: 0,
            recv_counter: 0,
        })
    }

    /// Static public key the peer authenticated with.
    pub fn remote_key(&self) -> &PublicKey {
        &self.remote
    }

    pub fn send_frame(&mut self, plaintext: &[u8]) -> io::Result<()> {
        let nonce = nonce(self.send_counter);
        let sealed = self
            .sealer
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "failed to seal frame"))?;
        self.send_counter += 1;

        let len = u32::try_from(sealed.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
        self.stream.write_all(&len.to_be_bytes())?;
        self.stream.write_all(&sealed)?;
        self.stream.flush()
    }

    /// Reads the next frame. Returns `Ok(None)` when the peer closed the
    /// connection cleanly between frames; a connection that ends inside a
    /// frame, length prefix included, is an `UnexpectedEof` error.
    pub fn recv_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut len_buf = [0u8; 4];
        let mut filled = 0;
        while filled < len_buf.len() {
            match self.stream.read(&mut len_buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(None),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("connection closed after {filled} of 4 length bytes"),
                    ));
                }
                Ok(n) => filled += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {len} bytes exceeds limit"),
            ));
        }
        let mut sealed = vec![0u8; len];
        self.stream.read_exact(&mut sealed)?;

        let nonce = nonce(self.recv_counter);
        let plaintext = self
            .opener
            .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "failed to open frame"))?;
        self.recv_counter += 1;
        Ok(Some(plaintext))
    }

    /// Bounds how long [`recv_frame`](Self::recv_frame) waits; `None` waits
    /// forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// Bounds how long [`send_frame`](Self::send_frame) may block on a full
    /// socket buffer.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_write_timeout(timeout)
    }

    /// Cloned handle to the socket, used to force-close the channel from
    /// another thread.
    pub fn try_clone_stream(&self) -> io::Result<TcpStream> {
        self.stream.try_clone()
    }
}

fn derive_key(shared: &[u8; 32], transcript: &[u8; 32], direction: &[u8]) -> [u8; 32] {
    Sha256::new()
        .chain_update(shared)
        .chain_update(transcript)
        .chain_update(direction)
        .finalize()
        .into()
}

fn nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn connected_pair(
        client: Identity,
        server: Identity,
        expected: Option<PublicKey>,
    ) -> anyhow::Result<(Result<SecureChannel, HandshakeError>, SecureChannel)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let accept = thread::spawn(move || -> anyhow::Result<SecureChannel> {
            let (stream, _) = listener.accept()?;
            Ok(SecureChannel::accept(stream, &server)?)
        });
        let stream = TcpStream::connect(addr)?;
        let dialed = SecureChannel::initiate(stream, &client, expected.as_ref());
        let accepted = accept
            .join()
            .map_err(|_| anyhow::anyhow!("accept thread panicked"))??;
        Ok((dialed, accepted))
    }

    #[test]
    fn test_frames_flow_both_ways() -> anyhow::Result<()> {
        let client = Identity::generate();
        let server = Identity::generate();
        let (dialed, mut accepted) =
            connected_pair(client.clone(), server.clone(), Some(server.public_key()))?;
        let mut dialed = dialed?;

        assert_eq!(accepted.remote_key(), &client.public_key());
        assert_eq!(dialed.remote_key(), &server.public_key());

        dialed.send_frame(b"hello")?;
        dialed.send_frame(b"again")?;
        assert_eq!(accepted.recv_frame()?, Some(b"hello".to_vec()));
        assert_eq!(accepted.recv_frame()?, Some(b"again".to_vec()));

        accepted.send_frame(b"reply")?;
        assert_eq!(dialed.recv_frame()?, Some(b"reply".to_vec()));

        drop(dialed);
        assert_eq!(accepted.recv_frame()?, None);
        Ok(())
    }

    #[test]
    fn test_torn_length_prefix_is_an_error() -> anyhow::Result<()> {
        let server = Identity::generate();
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let server_identity = server.clone();
        let accept = thread::spawn(move || -> anyhow::Result<SecureChannel> {
            let (stream, _) = listener.accept()?;
            Ok(SecureChannel::accept(stream, &server_identity)?)
        });

        let stream = TcpStream::connect(addr)?;
        let mut raw = stream.try_clone()?;
        let dialed = SecureChannel::initiate(stream, &Identity::generate(), None)?;
        let mut accepted = accept
            .join()
            .map_err(|_| anyhow::anyhow!("accept thread panicked"))??;

        // Two of the four length bytes, then the peer goes away.
        raw.write_all(&[0, 0])?;
        raw.flush()?;
        drop(raw);
        drop(dialed);

        let err = accepted.recv_frame().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        Ok(())
    }

    #[test]
    fn test_unexpected_server_key_rejected() -> anyhow::Result<()> {
        let impostor = Identity::generate();
        let (dialed, _accepted) = connected_pair(
            Identity::generate(),
            Identity::generate(),
            Some(impostor.public_key()),
        )?;
        assert!(matches!(
            dialed,
            Err(HandshakeError::UnexpectedPeer { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_identity_hex_round_trip() -> anyhow::Result<()> {
        let identity = Identity::generate();
        let parsed = Identity::from_hex(&identity.to_hex())?;
        assert_eq!(parsed.public_key(), identity.public_key());
        assert!(Identity::from_hex("0011").is_err());
        Ok(())
    }
}
