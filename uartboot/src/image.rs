//! Raw firmware images.
//!
//! The update protocol carries a flat binary: the bytes are written to flash
//! in order starting at the region base. An image is split into
//! [`MAX_PAYLOAD`]-byte packets, the last one shorter; the device treats the
//! first short packet as the end of the image.

use crate::error::{Error, Result};
use crate::flash::ERASED_BYTE;
use crate::protocol::{MAX_PAYLOAD, Packet};
use log::debug;
use std::path::Path;

/// A firmware image to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    padded: bool,
}

impl FirmwareImage {
    /// Wrap raw image bytes.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::InvalidImage("image is empty".to_string()));
        }
        Ok(Self {
            data,
            padded: false,
        })
    }

    /// Load a raw binary from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        debug!("Loaded {} ({} bytes)", path.display(), data.len());
        Self::from_bytes(data).map_err(|e| match e {
            Error::InvalidImage(msg) => Error::InvalidImage(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    /// Image bytes, including any tail padding.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Image length in bytes, including any tail padding.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always `false`; empty images are rejected on construction.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether [`with_tail_padding`](Self::with_tail_padding) added a byte.
    pub fn is_padded(&self) -> bool {
        self.padded
    }

    /// Whether the last packet would be a full one, which the device cannot
    /// tell apart from a packet in the middle of the image.
    pub fn needs_tail_padding(&self) -> bool {
        self.data.len() % MAX_PAYLOAD == 0
    }

    /// Append one erased byte if the image length is a multiple of
    /// [`MAX_PAYLOAD`], so the final packet is always short.
    #[must_use]
    pub fn with_tail_padding(mut self) -> Self {
        if self.needs_tail_padding() {
            debug!("Image is {} bytes, padding final packet", self.data.len());
            self.data.push(ERASED_BYTE);
            self.padded = true;
        }
        self
    }

    /// Number of packets the image splits into.
    pub fn packet_count(&self) -> usize {
        self.data.len().div_ceil(MAX_PAYLOAD)
    }

    /// Packets in upload order, numbered from 1.
    pub fn packets(&self) -> Packets<'_> {
        Packets {
            chunks: self.data.chunks(MAX_PAYLOAD),
            sequence: 1,
        }
    }
}

/// Iterator over the packets of a [`FirmwareImage`].
#[derive(Debug, Clone)]
pub struct Packets<'a> {
    chunks: std::slice::Chunks<'a, u8>,
    sequence: u16,
}

impl Iterator for Packets<'_> {
    type Item = Packet;

    fn next(&mut self) -> Option<Packet> {
        let chunk = self.chunks.next()?;
        let mut payload = [0u8; MAX_PAYLOAD];
        payload[..chunk.len()].copy_from_slice(chunk);
        #[allow(clippy::cast_possible_truncation)] // chunks are at most MAX_PAYLOAD
        let packet = Packet::from_buffer(self.sequence, chunk.len() as u16, payload);
        self.sequence = self.sequence.wrapping_add(1);
        Some(packet)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for Packets<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_image_rejected() {
        assert!(matches!(
            FirmwareImage::from_bytes(Vec::new()),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn test_packets_split_and_number() {
        let image = FirmwareImage::from_bytes(vec![0x11; 600]).unwrap();
        let packets: Vec<_> = image.packets().collect();

        assert_eq!(image.packet_count(), 3);
        assert_eq!(packets.len(), 3);
        assert_eq!(
            packets.iter().map(Packet::sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(packets[0].len(), 256);
        assert_eq!(packets[2].len(), 88);
        assert!(packets[2].is_final());
        assert!(!packets[1].is_final());
    }

    #[test]
    fn test_tail_padding_only_on_exact_multiple() {
        let image = FirmwareImage::from_bytes(vec![0; 512])
            .unwrap()
            .with_tail_padding();
        assert!(image.is_padded());
        assert_eq!(image.len(), 513);
        assert_eq!(image.data()[512], 0xFF);

        let last = image.packets().last().unwrap();
        assert_eq!(last.payload(), &[0xFF]);
        assert!(last.is_final());

        let image = FirmwareImage::from_bytes(vec![0; 300])
            .unwrap()
            .with_tail_padding();
        assert!(!image.is_padded());
        assert_eq!(image.len(), 300);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[1, 2, 3, 4, 5]).unwrap();

        let image = FirmwareImage::from_file(file.path()).unwrap();
        assert_eq!(image.data(), &[1, 2, 3, 4, 5]);
        assert!(!image.needs_tail_padding());
    }

    #[test]
    fn test_from_missing_file() {
        let result = FirmwareImage::from_file("/nonexistent/uartboot/image.bin");
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
