//! Length-framed transport over a byte stream: plaintext frames carry the
//! handshake, encrypted and MAC-checked frames carry everything after it.
//!
//! Encrypted frame layout: `[varint length][IV 16][ciphertext][MAC 32]`,
//! where `length` counts plaintext bytes and the MAC is HMAC-SHA256 over the
//! plaintext under the link's MAC key.

use std::io::{Read, Write};
use std::net::TcpStream;

use anyhow::{bail, Context, Result};

use crate::crypto::{self, FrameCipher, FrameMac, SessionKeys, HASH_SIZE, IV_SIZE};

/// Cap on handshake and request/response frames. File bodies stream under
/// their declared length and are not subject to this cap.
pub const MAX_CONTROL_FRAME: u64 = 256 * 1024;

/// A u64 varint never needs more than this many bytes.
const VARINT_MAX_BYTES: usize = 10;

const STREAM_BUF_SIZE: usize = 64 * 1024;

pub fn tune_socket(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
}

/// One peer connection in its plaintext phase.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Enter the encrypted phase. Keys stay fixed for the connection's life.
    pub fn into_secure(self, keys: SessionKeys) -> SecureConnection<S> {
        SecureConnection { conn: self, keys }
    }

    /// Emit a minimal LEB128 varint length prefix.
    pub fn write_length(&mut self, mut v: u64) -> Result<()> {
        let mut buf = [0u8; VARINT_MAX_BYTES];
        let mut n = 0;
        loop {
            let mut b = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                b |= 0x80;
            }
            buf[n] = b;
            n += 1;
            if v == 0 {
                break;
            }
        }
        self.stream.write_all(&buf[..n])?;
        Ok(())
    }

    /// Read a varint length prefix, one byte at a time while the
    /// continuation bit is set.
    pub fn read_length(&mut self) -> Result<u64> {
        let mut v: u64 = 0;
        let mut shift = 0u32;
        loop {
            let mut b = [0u8; 1];
            self.stream
                .read_exact(&mut b)
                .context("short read on frame length")?;
            let byte = b[0];
            if shift == 63 && byte > 1 {
                bail!("frame length varint overflows u64");
            }
            v |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
            if shift >= 64 {
                bail!("frame length varint longer than {VARINT_MAX_BYTES} bytes");
            }
        }
    }

    /// Write one plaintext frame (handshake only).
    pub fn write_plain(&mut self, data: &[u8]) -> Result<()> {
        self.write_length(data.len() as u64)?;
        self.stream.write_all(data)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Read one plaintext frame (handshake only).
    pub fn read_plain(&mut self) -> Result<Vec<u8>> {
        let len = self.read_length()?;
        if len > MAX_CONTROL_FRAME {
            bail!("plaintext frame too large: {len} bytes");
        }
        let mut data = vec![0u8; len as usize];
        self.stream
            .read_exact(&mut data)
            .context("short read on frame body")?;
        Ok(data)
    }
}

/// A peer connection after the handshake. Every frame is encrypted with
/// AES-256-OFB under a fresh IV and authenticated with HMAC-SHA256.
#[derive(Debug)]
pub struct SecureConnection<S> {
    conn: Connection<S>,
    keys: SessionKeys,
}

impl<S: Read + Write> SecureConnection<S> {
    pub fn get_ref(&self) -> &S {
        self.conn.get_ref()
    }

    pub fn into_inner(self) -> S {
        self.conn.into_inner()
    }

    /// Encrypt and send one whole message.
    pub fn write_message(&mut self, data: &[u8]) -> Result<()> {
        self.write_stream(&mut &data[..], data.len() as u64)
    }

    /// Receive and decrypt one whole message. The MAC is verified before the
    /// plaintext is returned.
    pub fn read_message(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_stream_capped(&mut out, Some(MAX_CONTROL_FRAME))?;
        Ok(out)
    }

    /// Stream `len` bytes from `source` as one encrypted frame without
    /// buffering the whole body.
    pub fn write_stream(&mut self, source: &mut impl Read, len: u64) -> Result<()> {
        let iv = crypto::fresh_iv()?;
        let mut cipher = FrameCipher::new(&self.keys.enc, &iv);
        let mut mac = FrameMac::new(&self.keys.mac);

        self.conn.write_length(len)?;
        self.conn.stream.write_all(&iv)?;

        let mut buf = vec![0u8; STREAM_BUF_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            source
                .read_exact(&mut buf[..want])
                .context("source ended before its declared length")?;
            mac.update(&buf[..want]);
            cipher.apply(&mut buf[..want]);
            self.conn.stream.write_all(&buf[..want])?;
            remaining -= want as u64;
        }

        self.conn.stream.write_all(&mac.finalize())?;
        self.conn.stream.flush()?;
        Ok(())
    }

    /// Receive one encrypted frame, streaming the plaintext into `sink`.
    /// Returns the body length. The trailing MAC is checked in constant
    /// time; a mismatch is fatal for the connection, and the caller must
    /// discard whatever reached the sink.
    pub fn read_stream(&mut self, sink: &mut impl Write) -> Result<u64> {
        self.read_stream_capped(sink, None)
    }

    fn read_stream_capped(&mut self, sink: &mut impl Write, cap: Option<u64>) -> Result<u64> {
        let len = self.conn.read_length()?;
        if let Some(cap) = cap {
            if len > cap {
                bail!("encrypted frame too large: {len} bytes");
            }
        }

        let mut iv = [0u8; IV_SIZE];
        self.conn
            .stream
            .read_exact(&mut iv)
            .context("short read on IV")?;

        let mut cipher = FrameCipher::new(&self.keys.enc, &iv);
        let mut mac = FrameMac::new(&self.keys.mac);

        let mut buf = vec![0u8; STREAM_BUF_SIZE];
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            self.conn
                .stream
                .read_exact(&mut buf[..want])
                .context("short read on frame body")?;
            cipher.apply(&mut buf[..want]);
            mac.update(&buf[..want]);
            sink.write_all(&buf[..want])?;
            remaining -= want as u64;
        }

        let mut sent = [0u8; HASH_SIZE];
        self.conn
            .stream
            .read_exact(&mut sent)
            .context("short read on MAC")?;
        if !crypto::constant_time_eq(&sent, &mac.finalize()) {
            bail!("message integrity failure: MAC mismatch");
        }
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn keys() -> SessionKeys {
        SessionKeys::derive("wire test password")
    }

    fn encrypt(msg: &[u8]) -> Vec<u8> {
        let mut sconn = Connection::new(Cursor::new(Vec::new())).into_secure(keys());
        sconn.write_message(msg).unwrap();
        sconn.into_inner().into_inner()
    }

    fn decrypt(frame: Vec<u8>) -> Result<Vec<u8>> {
        let mut sconn = Connection::new(Cursor::new(frame)).into_secure(keys());
        sconn.read_message()
    }

    #[test]
    fn varint_round_trips() {
        for len in [
            0u64,
            1,
            127,
            128,
            300,
            16_383,
            16_384,
            u32::MAX as u64,
            (1u64 << 63) - 1,
            u64::MAX,
        ] {
            let mut conn = Connection::new(Cursor::new(Vec::new()));
            conn.write_length(len).unwrap();
            let buf = conn.into_inner().into_inner();
            assert!(buf.len() <= VARINT_MAX_BYTES);

            let mut conn = Connection::new(Cursor::new(buf));
            assert_eq!(conn.read_length().unwrap(), len);
        }
    }

    #[test]
    fn varint_rejects_overlong_encoding() {
        // Eleven continuation bytes can never be a valid u64.
        let mut conn = Connection::new(Cursor::new(vec![0x80u8; 11]));
        assert!(conn.read_length().is_err());
    }

    #[test]
    fn plain_frame_round_trips() {
        let mut conn = Connection::new(Cursor::new(Vec::new()));
        conn.write_plain(b"hello").unwrap();
        let buf = conn.into_inner().into_inner();

        let mut conn = Connection::new(Cursor::new(buf));
        assert_eq!(conn.read_plain().unwrap(), b"hello");
    }

    #[test]
    fn encrypted_message_round_trips() {
        for msg in [&b""[..], b"x", b"a longer message body", &[0u8; 4096][..]] {
            let frame = encrypt(msg);
            assert_eq!(decrypt(frame).unwrap(), msg);
        }
    }

    #[test]
    fn ciphertext_differs_from_plaintext_and_between_frames() {
        let frame_a = encrypt(b"same message");
        let frame_b = encrypt(b"same message");
        // Fresh IVs make equal plaintexts produce different frames.
        assert_ne!(frame_a, frame_b);

        let body = &frame_a[1 + IV_SIZE..frame_a.len() - HASH_SIZE];
        assert_ne!(body, b"same message");
    }

    #[test]
    fn any_flipped_bit_fails_integrity() {
        let msg = b"bit flip fodder";
        let clean = encrypt(msg);
        assert_eq!(decrypt(clean.clone()).unwrap(), msg);

        // Flip one bit in the IV, the ciphertext, and the MAC in turn. The
        // first byte is the length varint; corrupting it desyncs framing and
        // must also fail.
        for pos in [0, 1, 1 + IV_SIZE, clean.len() - HASH_SIZE, clean.len() - 1] {
            let mut bad = clean.clone();
            bad[pos] ^= 0x01;
            assert!(decrypt(bad).is_err(), "flip at byte {pos} went unnoticed");
        }
    }

    #[test]
    fn wrong_keys_fail_integrity() {
        let frame = encrypt(b"keyed for someone else");
        let mut sconn =
            Connection::new(Cursor::new(frame)).into_secure(SessionKeys::derive("other"));
        assert!(sconn.read_message().is_err());
    }

    #[test]
    fn stream_round_trips_across_chunks() {
        let body: Vec<u8> = (0..STREAM_BUF_SIZE * 2 + 17).map(|i| i as u8).collect();

        let mut sconn = Connection::new(Cursor::new(Vec::new())).into_secure(keys());
        sconn
            .write_stream(&mut &body[..], body.len() as u64)
            .unwrap();
        let frame = sconn.into_inner().into_inner();

        let mut sconn = Connection::new(Cursor::new(frame)).into_secure(keys());
        let mut out = Vec::new();
        let n = sconn.read_stream(&mut out).unwrap();
        assert_eq!(n, body.len() as u64);
        assert_eq!(out, body);
    }

    #[test]
    fn oversized_control_frame_is_rejected() {
        let mut conn = Connection::new(Cursor::new(Vec::new()));
        conn.write_length(MAX_CONTROL_FRAME + 1).unwrap();
        let buf = conn.into_inner().into_inner();

        let mut conn = Connection::new(Cursor::new(buf));
        assert!(conn.read_plain().is_err());
    }
}
