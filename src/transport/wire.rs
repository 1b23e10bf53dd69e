//! Binary framing shared by datagrams and stream connections.
//!
//! Variable-length fields are prefixed with a little-endian `i32` byte count.
//! Strings carry a 7-bit variable-length count followed by UTF-8 bytes, and
//! booleans are a single `0`/`1` byte. Every length read from the wire is
//! checked against a per-field ceiling before anything is allocated.

use crate::utils::{ConfigError, ProtocolError, Result};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the challenge nonce sent by the accepting side
pub const NONCE_LENGTH: usize = 16;

/// Ceiling for signature, public key and sealed key fields
pub const MAX_KEY_FIELD: usize = 1024;

/// Ceiling for a display name in bytes
pub const MAX_NAME_LENGTH: usize = 4 * 1024;

/// Ceiling for a profile image in bytes
pub const MAX_PROFILE_IMAGE: usize = 1024 * 1024;

/// First byte of every stream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Identity proof, session key delivery and profile exchange
    Identify = 0,
    /// One encrypted message
    MessageBlob = 1,
}

impl TryFrom<u8> for Command {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> std::result::Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Identify),
            1 => Ok(Self::MessageBlob),
            tag => Err(ProtocolError::UnknownCommand { tag }),
        }
    }
}

/// Display name and image a node presents during a handshake
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    /// Human readable name
    pub display_name: Option<String>,
    /// Opaque image bytes
    pub profile_image: Option<Vec<u8>>,
}

impl Profile {
    /// A profile with just a name
    pub fn named<S: Into<String>>(name: S) -> Self {
        Self {
            display_name: Some(name.into()),
            profile_image: None,
        }
    }

    /// Check the profile against the ceilings every receiver enforces.
    ///
    /// A profile above them would make every handshake fail at the peer.
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.display_name {
            if name.len() > MAX_NAME_LENGTH {
                return Err(ConfigError::InvalidValue {
                    field: "display_name".to_string(),
                    value: format!("{} bytes, at most {} allowed", name.len(), MAX_NAME_LENGTH),
                }
                .into());
            }
        }
        if let Some(image) = &self.profile_image {
            if image.len() > MAX_PROFILE_IMAGE {
                return Err(ConfigError::InvalidValue {
                    field: "profile_image".to_string(),
                    value: format!("{} bytes, at most {} allowed", image.len(), MAX_PROFILE_IMAGE),
                }
                .into());
            }
        }
        Ok(())
    }
}

/// Accumulates an outgoing frame
#[derive(Debug, Default)]
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    /// Start an empty frame
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a single byte
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    /// Append a `0`/`1` byte
    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.put_u8(u8::from(value))
    }

    /// Append bytes with no prefix
    pub fn put_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Append an `i32` length prefix followed by `bytes`
    pub fn put_prefixed(&mut self, bytes: &[u8]) -> Result<&mut Self> {
        let len = i32::try_from(bytes.len()).map_err(|_| ProtocolError::MessageTooLarge {
            size: bytes.len(),
            max: i32::MAX as usize,
        })?;
        self.buf.extend_from_slice(&len.to_le_bytes());
        Ok(self.put_raw(bytes))
    }

    /// Append a 7-bit length prefix followed by UTF-8 bytes
    pub fn put_string(&mut self, value: &str) -> &mut Self {
        let mut len = value.len();
        while len >= 0x80 {
            self.buf.push((len as u8 & 0x7f) | 0x80);
            len >>= 7;
        }
        self.buf.push(len as u8);
        self.put_raw(value.as_bytes())
    }

    /// Append a profile block: optional name, then optional image
    pub fn put_profile(&mut self, profile: &Profile) -> Result<&mut Self> {
        self.put_bool(profile.display_name.is_some());
        if let Some(name) = &profile.display_name {
            self.put_string(name);
        }
        self.put_bool(profile.profile_image.is_some());
        if let Some(image) = &profile.profile_image {
            self.put_prefixed(image)?;
        }
        Ok(self)
    }

    /// Finished frame bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Bounds-checked cursor over a received datagram
#[derive(Debug)]
pub struct PacketReader<'a> {
    buf: &'a [u8],
}

impl<'a> PacketReader<'a> {
    /// Read from `buf`
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Read an `i32` length prefix and that many bytes
    pub fn prefixed(&mut self, max: usize, field: &str) -> Result<&'a [u8]> {
        let raw = self.take(4, field)?;
        let len = checked_length(i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]), max, field)?;
        self.take(len, field)
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8]> {
        if self.buf.len() < len {
            return Err(ProtocolError::malformed(format!(
                "{} truncated: need {} bytes, have {}",
                field,
                len,
                self.buf.len()
            ))
            .into());
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }
}

fn checked_length(len: i32, max: usize, field: &str) -> Result<usize> {
    let len = usize::try_from(len)
        .map_err(|_| ProtocolError::malformed(format!("{} has negative length {}", field, len)))?;
    if len > max {
        return Err(ProtocolError::MessageTooLarge { size: len, max }.into());
    }
    Ok(len)
}

/// Read an `i32` length prefix and that many bytes from a stream
pub async fn read_prefixed<R>(reader: &mut R, max: usize, field: &str) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = checked_length(reader.read_i32_le().await?, max, field)?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Read a strict `0`/`1` boolean byte
pub async fn read_bool<R>(reader: &mut R) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    match reader.read_u8().await? {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(ProtocolError::malformed(format!("invalid boolean byte {}", other)).into()),
    }
}

/// Read a 7-bit length-prefixed UTF-8 string
pub async fn read_string<R>(reader: &mut R, max: usize) -> Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut len: usize = 0;
    let mut shift = 0;
    loop {
        if shift > 28 {
            return Err(ProtocolError::malformed("string length prefix too long").into());
        }
        let byte = reader.read_u8().await?;
        len |= usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    if len > max {
        return Err(ProtocolError::MessageTooLarge { size: len, max }.into());
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|_| ProtocolError::malformed("string is not UTF-8").into())
}

/// Read a profile block written by [`PacketWriter::put_profile`]
pub async fn read_profile<R>(reader: &mut R) -> Result<Profile>
where
    R: AsyncRead + Unpin,
{
    let display_name = if read_bool(reader).await? {
        Some(read_string(reader, MAX_NAME_LENGTH).await?)
    } else {
        None
    };
    let profile_image = if read_bool(reader).await? {
        Some(read_prefixed(reader, MAX_PROFILE_IMAGE, "profile image").await?)
    } else {
        None
    };

    Ok(Profile {
        display_name,
        profile_image,
    })
}

/// Read the challenge nonce
pub async fn read_nonce<R>(reader: &mut R) -> Result<[u8; NONCE_LENGTH]>
where
    R: AsyncRead + Unpin,
{
    let mut nonce = [0u8; NONCE_LENGTH];
    reader.read_exact(&mut nonce).await?;
    Ok(nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::MeshError;
    use tokio_test::io::Builder;

    #[test]
    fn test_command_tags() {
        assert_eq!(Command::try_from(0).unwrap(), Command::Identify);
        assert_eq!(Command::try_from(1).unwrap(), Command::MessageBlob);
        assert_eq!(
            Command::try_from(7),
            Err(ProtocolError::UnknownCommand { tag: 7 })
        );
        assert_eq!(Command::MessageBlob as u8, 1);
    }

    #[test]
    fn test_profile_limits() {
        assert!(Profile::named("alice").validate().is_ok());
        assert!(Profile::named("a".repeat(MAX_NAME_LENGTH)).validate().is_ok());

        let err = Profile::named("a".repeat(MAX_NAME_LENGTH + 1))
            .validate()
            .unwrap_err();
        assert!(matches!(err, MeshError::Config(ConfigError::InvalidValue { .. })));

        let image = Profile {
            display_name: None,
            profile_image: Some(vec![0; MAX_PROFILE_IMAGE + 1]),
        };
        assert!(image.validate().is_err());
    }

    #[test]
    fn test_writer_layout() {
        let mut writer = PacketWriter::new();
        writer.put_u8(1).put_prefixed(b"abc").unwrap().put_bool(true);
        assert_eq!(writer.into_bytes(), vec![1, 3, 0, 0, 0, b'a', b'b', b'c', 1]);
    }

    #[test]
    fn test_string_length_prefix() {
        let long = "x".repeat(300);
        let mut writer = PacketWriter::new();
        writer.put_string(&long);
        let bytes = writer.into_bytes();
        // 300 = 0b10_0101100 -> 0xac 0x02
        assert_eq!(&bytes[..2], &[0xac, 0x02]);
        assert_eq!(bytes.len(), 302);
    }

    #[test]
    fn test_reader_truncation() {
        let mut reader = PacketReader::new(&[5, 0, 0, 0, 1, 2]);
        let err = reader.prefixed(64, "signature").unwrap_err();
        assert!(matches!(
            err,
            MeshError::Protocol(ProtocolError::MalformedPacket { .. })
        ));

        let mut reader = PacketReader::new(&[1, 0]);
        assert!(reader.prefixed(64, "signature").is_err());
    }

    #[test]
    fn test_reader_rejects_negative_and_oversized() {
        let mut reader = PacketReader::new(&[0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(
            reader.prefixed(64, "key").unwrap_err(),
            MeshError::Protocol(ProtocolError::MalformedPacket { .. })
        ));

        let mut reader = PacketReader::new(&[65, 0, 0, 0]);
        assert!(matches!(
            reader.prefixed(64, "key").unwrap_err(),
            MeshError::Protocol(ProtocolError::MessageTooLarge { size: 65, max: 64 })
        ));
    }

    #[test]
    fn test_reader_sequence() {
        let mut writer = PacketWriter::new();
        writer.put_prefixed(b"sig").unwrap().put_prefixed(b"key").unwrap();
        let bytes = writer.into_bytes();

        let mut reader = PacketReader::new(&bytes);
        assert_eq!(reader.prefixed(16, "a").unwrap(), b"sig");
        assert_eq!(reader.prefixed(16, "b").unwrap(), b"key");
        assert_eq!(reader.remaining(), 0);
    }

    #[tokio::test]
    async fn test_read_prefixed_from_stream() {
        let mut stream = Builder::new().read(&[2, 0, 0, 0]).read(b"hi").build();
        assert_eq!(read_prefixed(&mut stream, 8, "payload").await.unwrap(), b"hi");
    }

    #[tokio::test]
    async fn test_read_prefixed_ceiling_checked_before_body() {
        let mut stream = Builder::new().read(&[0, 0, 0, 0x40]).build();
        let err = read_prefixed(&mut stream, 1024, "payload").await.unwrap_err();
        assert!(matches!(
            err,
            MeshError::Protocol(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_prefixed_short_body() {
        let mut stream = Builder::new().read(&[4, 0, 0, 0]).read(b"ab").build();
        let err = read_prefixed(&mut stream, 8, "payload").await.unwrap_err();
        assert!(matches!(
            err,
            MeshError::Protocol(ProtocolError::MalformedPacket { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_bool_strict() {
        let mut stream = Builder::new().read(&[1, 0, 2]).build();
        assert!(read_bool(&mut stream).await.unwrap());
        assert!(!read_bool(&mut stream).await.unwrap());
        assert!(read_bool(&mut stream).await.is_err());
    }

    #[tokio::test]
    async fn test_profile_block() {
        let profile = Profile {
            display_name: Some("Zoë".to_string()),
            profile_image: Some(vec![0x89, b'P', b'N', b'G']),
        };
        let mut writer = PacketWriter::new();
        writer.put_profile(&profile).unwrap();
        let bytes = writer.into_bytes();

        let mut stream = Builder::new().read(&bytes).build();
        assert_eq!(read_profile(&mut stream).await.unwrap(), profile);

        let mut writer = PacketWriter::new();
        writer.put_profile(&Profile::default()).unwrap();
        assert_eq!(writer.into_bytes(), vec![0, 0]);
    }

    #[tokio::test]
    async fn test_read_string_rejects_invalid_utf8() {
        let mut stream = Builder::new().read(&[2, 0xff, 0xfe]).build();
        assert!(read_string(&mut stream, 16).await.is_err());
    }
}
