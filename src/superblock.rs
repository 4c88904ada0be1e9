//! Superblock bootstrap.
//!
//! The superblock is found by searching for its signature at offset 0 and
//! then at 512, 1024, 2048, ... It fixes the field widths for the rest of the
//! file and points at the root group.
//!
//! ```text
//! v0/1: [signature: 8][version][free-space version][root entry version][reserved]
//!       [shared header version][offset size][length size][reserved]
//!       [group leaf K: u16][group internal K: u16][consistency flags: u32]
//!       [v1: indexed storage K: u16][v1: reserved: u16]
//!       [base: O][free-space info: O][end of file: O][driver info: O]
//!       [root symbol table entry]
//! v2/3: [signature: 8][version][offset size][length size][consistency flags]
//!       [base: O][extension: O][end of file: O][root object header: O]
//!       [checksum]
//!
//! driver info block: [version=0][reserved: 3][info size: u32][driver id: 8][info]
//! ```

use crate::btree::SymbolTableEntry;
use crate::checksum;
use crate::config::Options;
use crate::context::Context;
use crate::error::{Error, Result, Structure};
use crate::io::{
    is_defined, ByteSource, FieldCursor, FieldWriter, Sizes, SourceReader, UNDEFINED_ADDRESS,
};
use bytes::Bytes;
use log::{debug, warn};

/// File signature.
pub const SIGNATURE: [u8; 8] = *b"\x89HDF\r\n\x1a\n";

/// Default B-tree K values written by the reference library.
pub const DEFAULT_GROUP_LEAF_K: u16 = 4;
/// Default group B-tree internal K.
pub const DEFAULT_GROUP_INTERNAL_K: u16 = 16;
/// Default chunk B-tree K.
pub const DEFAULT_INDEXED_STORAGE_K: u16 = 32;

/// First offset after 0 at which the signature is searched.
const SEARCH_START: u64 = 512;

/// A decoded superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Layout version, 0 through 3.
    pub version: u8,
    /// Absolute offset at which the signature was found.
    pub location: u64,
    /// Field widths for the whole file.
    pub sizes: Sizes,
    /// Absolute offset that file addresses are relative to.
    pub base_address: u64,
    /// Free-space info address (v0/1).
    pub free_space_address: u64,
    /// Superblock extension object header (v2/3).
    pub extension_address: u64,
    /// End of file address.
    pub end_of_file_address: u64,
    /// Driver information block address (v0/1).
    pub driver_info_address: u64,
    /// Root group object header.
    pub root_address: u64,
    /// Root symbol table entry (v0/1).
    pub root_entry: Option<SymbolTableEntry>,
    /// Group B-tree leaf K (v0/1).
    pub group_leaf_k: u16,
    /// Group B-tree internal K (v0/1).
    pub group_internal_k: u16,
    /// Chunk B-tree K (v1; default otherwise).
    pub indexed_storage_k: u16,
    /// File consistency flags.
    pub flags: u32,
}

impl Superblock {
    /// A superblock of `version` with default K values and no optional
    /// structures.
    pub fn new(version: u8, sizes: Sizes) -> Self {
        Self {
            version,
            location: 0,
            sizes,
            base_address: 0,
            free_space_address: UNDEFINED_ADDRESS,
            extension_address: UNDEFINED_ADDRESS,
            end_of_file_address: 0,
            driver_info_address: UNDEFINED_ADDRESS,
            root_address: UNDEFINED_ADDRESS,
            root_entry: None,
            group_leaf_k: DEFAULT_GROUP_LEAF_K,
            group_internal_k: DEFAULT_GROUP_INTERNAL_K,
            indexed_storage_k: DEFAULT_INDEXED_STORAGE_K,
            flags: 0,
        }
    }

    /// Finds and decodes the superblock of `source`.
    pub fn bootstrap(source: &dyn ByteSource, options: &Options) -> Result<Self> {
        let location = locate_signature(source, options.superblock_search_limit)?;
        let mut reader = SourceReader::new(source);
        reader.seek(location + SIGNATURE.len() as u64);
        let version = reader.read_u8()?;
        let sizes = match version {
            0 | 1 => {
                reader.seek(location + 13);
                Sizes::new(reader.read_u8()?, reader.read_u8()?)
            }
            2 | 3 => Sizes::new(reader.read_u8()?, reader.read_u8()?),
            other => {
                return Err(Error::format(
                    Structure::Superblock,
                    location,
                    format!("unknown superblock version {}", other),
                ))
            }
        };
        check_width(sizes.offset, "offset", location)?;
        check_width(sizes.length, "length", location)?;

        let len = Self::encoded_size(version, sizes);
        if location + len as u64 > source.len() {
            return Err(Error::bounds(
                Structure::Superblock,
                location,
                format!("superblock of {} bytes extends past end of file", len),
            ));
        }
        reader.seek(location);
        let data = reader.read_bytes(len)?;
        let mut c = FieldCursor::new(data, sizes, Structure::Superblock, location);
        c.skip(SIGNATURE.len() + 1)?;

        let mut superblock = Self::new(version, sizes);
        superblock.location = location;
        if version < 2 {
            superblock.decode_v01(&mut c)?;
        } else {
            if options.verify_checksums {
                checksum::verify(c.buffer(), Structure::Superblock, location)?;
            } else {
                warn!("Checksum verification disabled; superblock at {:#x} not verified", location);
            }
            superblock.decode_v23(&mut c)?;
        }

        if superblock.base_address != location {
            warn!(
                "Superblock at {:#x} records base address {:#x}; using its location",
                location, superblock.base_address
            );
            superblock.base_address = location;
        }
        debug!(
            "Superblock v{} at {:#x}: offset size {}, length size {}, root {:#x}, eof {:#x}",
            version,
            location,
            sizes.offset,
            sizes.length,
            superblock.root_address,
            superblock.end_of_file_address
        );
        Ok(superblock)
    }

    fn decode_v01(&mut self, c: &mut FieldCursor) -> Result<()> {
        // free-space, root entry, reserved, shared header versions, widths, reserved
        c.skip(7)?;
        self.group_leaf_k = c.read_u16()?;
        self.group_internal_k = c.read_u16()?;
        if self.group_leaf_k == 0 || self.group_internal_k == 0 {
            return Err(c.format_error("group B-tree K must be positive"));
        }
        self.flags = c.read_u32()?;
        if self.version == 1 {
            self.indexed_storage_k = c.read_u16()?;
            c.skip(2)?;
        }
        self.base_address = c.read_offset()?;
        self.free_space_address = c.read_offset()?;
        self.end_of_file_address = c.read_offset()?;
        self.driver_info_address = c.read_offset()?;
        let entry = SymbolTableEntry::decode(c)?;
        self.root_address = entry.object_header;
        self.root_entry = Some(entry);
        Ok(())
    }

    fn decode_v23(&mut self, c: &mut FieldCursor) -> Result<()> {
        c.skip(2)?;
        self.flags = c.read_u8()? as u32;
        self.base_address = c.read_offset()?;
        self.extension_address = c.read_offset()?;
        self.end_of_file_address = c.read_offset()?;
        self.root_address = c.read_offset()?;
        Ok(())
    }

    /// Encoded size of a superblock of `version`.
    pub fn encoded_size(version: u8, sizes: Sizes) -> usize {
        let o = sizes.offset_size();
        match version {
            0 => 24 + 4 * o + SymbolTableEntry::encoded_size(sizes),
            1 => 28 + 4 * o + SymbolTableEntry::encoded_size(sizes),
            _ => 12 + 4 * o + 4,
        }
    }

    /// Encodes the superblock, signature included.
    pub fn encode(&self) -> Result<Bytes> {
        if self.version > 3 {
            return Err(Error::invalid_argument(format!("superblock version {}", self.version)));
        }
        let mut w = FieldWriter::new(self.sizes);
        w.put_slice(&SIGNATURE);
        w.put_u8(self.version);
        if self.version < 2 {
            w.put_zeros(4);
            w.put_u8(self.sizes.offset);
            w.put_u8(self.sizes.length);
            w.put_u8(0);
            w.put_u16(self.group_leaf_k);
            w.put_u16(self.group_internal_k);
            w.put_u32(self.flags);
            if self.version == 1 {
                w.put_u16(self.indexed_storage_k);
                w.put_u16(0);
            }
            w.put_offset(self.base_address);
            w.put_offset(self.free_space_address);
            w.put_offset(self.end_of_file_address);
            w.put_offset(self.driver_info_address);
            let mut entry = self.root_entry.unwrap_or_default();
            entry.object_header = self.root_address;
            entry.encode(&mut w);
        } else {
            w.put_u8(self.sizes.offset);
            w.put_u8(self.sizes.length);
            w.put_u8(self.flags as u8);
            w.put_offset(self.base_address);
            w.put_offset(self.extension_address);
            w.put_offset(self.end_of_file_address);
            w.put_offset(self.root_address);
            w.put_checksum();
        }
        Ok(w.finish())
    }

    /// Returns true if the file carries a superblock extension.
    pub fn has_extension(&self) -> bool {
        is_defined(self.extension_address)
    }

    /// Reads the driver information block, if the superblock points at one.
    pub fn driver_info(&self, ctx: &Context) -> Result<Option<DriverInfoBlock>> {
        if !is_defined(self.driver_info_address) {
            return Ok(None);
        }
        DriverInfoBlock::read(ctx, self.driver_info_address).map(Some)
    }
}

fn check_width(width: u8, what: &str, location: u64) -> Result<()> {
    match width {
        2 | 4 | 8 => Ok(()),
        16 | 32 => Err(Error::unsupported(
            Structure::Superblock,
            location,
            format!("{}-byte {} fields", width, what),
        )),
        other => Err(Error::format(
            Structure::Superblock,
            location,
            format!("invalid {} size {}", what, other),
        )),
    }
}

/// Finds the superblock signature: offset 0, then 512 doubling up to `limit`.
pub fn locate_signature(source: &dyn ByteSource, limit: u64) -> Result<u64> {
    let end = source.len();
    let mut offset = 0;
    while offset <= limit && offset + SIGNATURE.len() as u64 <= end {
        if source.read_at(offset, SIGNATURE.len())?[..] == SIGNATURE {
            return Ok(offset);
        }
        offset = if offset == 0 { SEARCH_START } else { offset * 2 };
    }
    Err(Error::format(
        Structure::Superblock,
        0,
        format!("signature not found below {:#x}", limit.min(end)),
    ))
}

/// Driver information block of a v0/1 superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfoBlock {
    /// Eight-character driver identification, e.g. `NCSAfami`.
    pub driver_id: [u8; 8],
    /// Driver-specific information.
    pub info: Bytes,
}

impl DriverInfoBlock {
    const PREFIX_SIZE: usize = 16;

    /// Reads the block at `address`.
    pub fn read(ctx: &Context, address: u64) -> Result<Self> {
        let mut c = ctx.read(address, Self::PREFIX_SIZE, Structure::DriverInfo)?;
        c.expect_version(&[0])?;
        c.skip(3)?;
        let size = c.read_u32()? as usize;
        let mut driver_id = [0u8; 8];
        driver_id.copy_from_slice(&c.read_bytes(8)?);
        let info = ctx.read_bytes(address + Self::PREFIX_SIZE as u64, size, Structure::DriverInfo)?;
        debug!(
            "Driver info at {:#x}: {} ({} bytes)",
            address,
            String::from_utf8_lossy(&driver_id),
            size
        );
        Ok(Self { driver_id, info })
    }

    /// Driver id as text.
    pub fn driver_name(&self) -> String {
        String::from_utf8_lossy(&self.driver_id).trim_end_matches('\0').to_string()
    }

    /// Member file size of the family driver.
    pub fn family_member_size(&self) -> Option<u64> {
        if &self.driver_id != b"NCSAfami" || self.info.len() < 8 {
            return None;
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.info[..8]);
        Some(u64::from_le_bytes(raw))
    }

    /// Encodes the block.
    pub fn encode(&self) -> Bytes {
        let mut w = FieldWriter::new(Sizes::default());
        w.put_u8(0);
        w.put_zeros(3);
        w.put_u32(self.info.len() as u32);
        w.put_slice(&self.driver_id);
        w.put_slice(&self.info);
        w.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::ScratchPad;
    use crate::io::{FileImage, MemorySource};
    use std::sync::Arc;

    fn sample(version: u8, sizes: Sizes) -> Superblock {
        let mut sb = Superblock::new(version, sizes);
        sb.root_address = 0x2a0;
        sb.end_of_file_address = 0x1_0000;
        if version < 2 {
            sb.root_entry = Some(SymbolTableEntry {
                name_offset: 0,
                object_header: 0x2a0,
                scratch: ScratchPad::Group { btree_address: 0x300, heap_address: 0x400 },
            });
            sb.indexed_storage_k = if version == 1 { 64 } else { DEFAULT_INDEXED_STORAGE_K };
        } else {
            sb.extension_address = 0x180;
        }
        sb
    }

    fn bootstrap(bytes: Vec<u8>) -> Result<Superblock> {
        Superblock::bootstrap(&MemorySource::new(bytes), &Options::default())
    }

    #[test]
    fn test_all_versions_and_widths() {
        for version in 0..=3u8 {
            for &(o, l) in &[(4, 4), (8, 8), (4, 8), (8, 4)] {
                let sizes = Sizes::new(o, l);
                let sb = sample(version, sizes);
                let bytes = sb.encode().unwrap();
                assert_eq!(bytes.len(), Superblock::encoded_size(version, sizes));
                let mut file = bytes.to_vec();
                file.resize(4096, 0);

                let decoded = bootstrap(file).unwrap();
                assert_eq!(decoded, sb, "version {} sizes {:?}", version, sizes);
                assert_eq!(decoded.root_address, 0x2a0);
                assert_eq!(decoded.end_of_file_address, 0x1_0000);
            }
        }
    }

    #[test]
    fn test_signature_after_user_block() {
        let mut sb = sample(2, Sizes::default());
        sb.base_address = 1024;
        sb.location = 1024;
        let mut file = vec![0xAA; 1024];
        file.extend_from_slice(&sb.encode().unwrap());
        file.resize(8192, 0);

        let decoded = bootstrap(file).unwrap();
        assert_eq!(decoded.location, 1024);
        assert_eq!(decoded.base_address, 1024);
        assert_eq!(decoded.root_address, 0x2a0);
    }

    #[test]
    fn test_base_address_follows_location() {
        let sb = sample(0, Sizes::default());
        let mut file = vec![0u8; 512];
        file.extend_from_slice(&sb.encode().unwrap());
        file.resize(2048, 0);

        let decoded = bootstrap(file).unwrap();
        assert_eq!(decoded.location, 512);
        assert_eq!(decoded.base_address, 512);
    }

    #[test]
    fn test_search_limit() {
        let sb = sample(2, Sizes::default());
        let mut file = vec![0u8; 2048];
        file.extend_from_slice(&sb.encode().unwrap());
        file.resize(4096, 0);

        let options = Options::default().superblock_search_limit(1024);
        let err = Superblock::bootstrap(&MemorySource::new(file.clone()), &options).unwrap_err();
        assert!(err.is_format_error());
        assert_eq!(bootstrap(file).unwrap().location, 2048);
    }

    #[test]
    fn test_missing_signature() {
        let err = bootstrap(vec![0u8; 4096]).unwrap_err();
        assert!(err.is_format_error());
        assert_eq!(err.structure(), Some(Structure::Superblock));
    }

    #[test]
    fn test_unknown_version() {
        let mut file = sample(2, Sizes::default()).encode().unwrap().to_vec();
        file[8] = 4;
        file.resize(1024, 0);
        assert!(bootstrap(file).unwrap_err().is_format_error());
    }

    #[test]
    fn test_invalid_widths() {
        let mut file = sample(2, Sizes::default()).encode().unwrap().to_vec();
        file.resize(1024, 0);
        file[9] = 3;
        assert!(bootstrap(file.clone()).unwrap_err().is_format_error());
        file[9] = 16;
        assert!(bootstrap(file).unwrap_err().is_unsupported());
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut file = sample(3, Sizes::default()).encode().unwrap().to_vec();
        file[20] ^= 0x01;
        file.resize(1024, 0);
        let err = bootstrap(file.clone()).unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));

        let options = Options::default().verify_checksums(false);
        assert!(Superblock::bootstrap(&MemorySource::new(file), &options).is_ok());
    }

    #[test]
    fn test_truncated_superblock() {
        let bytes = sample(0, Sizes::default()).encode().unwrap();
        let file = bytes[..40].to_vec();
        assert!(bootstrap(file).unwrap_err().is_bounds_error());
    }

    #[test]
    fn test_driver_info_block() {
        let sizes = Sizes::default();
        let mut image = FileImage::with_reserved(sizes, Superblock::encoded_size(0, sizes));
        let block = DriverInfoBlock {
            driver_id: *b"NCSAfami",
            info: Bytes::copy_from_slice(&(1u64 << 30).to_le_bytes()),
        };
        let block_address = image.append(&block.encode());

        let mut sb = sample(0, sizes);
        sb.driver_info_address = block_address;
        image.write_at(0, &sb.encode().unwrap());

        let source = image.into_source();
        let decoded = Superblock::bootstrap(&source, &Options::default()).unwrap();
        let ctx = Context::new(Arc::new(source), decoded.sizes);
        let info = decoded.driver_info(&ctx).unwrap().unwrap();
        assert_eq!(info, block);
        assert_eq!(info.driver_name(), "NCSAfami");
        assert_eq!(info.family_member_size(), Some(1 << 30));
    }

    #[test]
    fn test_no_driver_info() {
        let sb = sample(1, Sizes::default());
        let ctx = Context::new(Arc::new(MemorySource::new(vec![0u8; 64])), sb.sizes);
        assert!(sb.driver_info(&ctx).unwrap().is_none());
        assert!(!sb.has_extension());
        assert!(sample(2, Sizes::default()).has_extension());
    }
}
