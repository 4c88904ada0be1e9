//! Small fixed-shape header messages.

use crate::error::Result;
use crate::io::{FieldCursor, FieldWriter, Sizes};
use bytes::Bytes;

/// Fill value, in both the old (0x0004) and current (0x0005) forms.
///
/// ```text
/// old:   [size: u32][value]
/// v1/v2: [version][alloc time][write time][defined][size: u32][value]
///        (v2 stores size and value only when defined)
/// v3:    [3][flags: alloc time 0-1, write time 2-3, undefined 4, defined 5]
///        [size: u32][value, flags bit 5]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillValueMessage {
    /// Encoding version; 0 for the old form.
    pub version: u8,
    /// Space allocation time code.
    pub alloc_time: u8,
    /// Fill value write time code.
    pub write_time: u8,
    /// Whether a fill value is defined.
    pub defined: bool,
    /// The fill value, if stored.
    pub value: Option<Bytes>,
}

impl FillValueMessage {
    /// A version 3 message with the given value.
    pub fn new(value: Option<Bytes>) -> Self {
        Self { version: 3, alloc_time: 2, write_time: 0, defined: value.is_some(), value }
    }

    pub(crate) fn decode_old(c: &mut FieldCursor) -> Result<Self> {
        let size = c.read_u32()? as usize;
        let value = c.read_bytes(size)?;
        Ok(Self { version: 0, alloc_time: 0, write_time: 0, defined: true, value: Some(value) })
    }

    pub(crate) fn encode_old(&self) -> Bytes {
        let mut w = FieldWriter::new(Sizes::default());
        let value = self.value.clone().unwrap_or_default();
        w.put_u32(value.len() as u32);
        w.put_slice(&value);
        w.finish()
    }

    pub(crate) fn decode(c: &mut FieldCursor) -> Result<Self> {
        let version = c.expect_version(&[1, 2, 3])?;
        if version < 3 {
            let alloc_time = c.read_u8()?;
            let write_time = c.read_u8()?;
            let defined = c.read_u8()? != 0;
            let value = if version == 1 || defined {
                let size = c.read_u32()? as usize;
                Some(c.read_bytes(size)?)
            } else {
                None
            };
            return Ok(Self { version, alloc_time, write_time, defined, value });
        }

        let flags = c.read_u8()?;
        if flags & 0x10 != 0 && flags & 0x20 != 0 {
            return Err(c.format_error("fill value both undefined and defined"));
        }
        let defined = flags & 0x20 != 0;
        let value = if defined {
            let size = c.read_u32()? as usize;
            Some(c.read_bytes(size)?)
        } else {
            None
        };
        Ok(Self {
            version,
            alloc_time: flags & 0x03,
            write_time: (flags >> 2) & 0x03,
            defined,
            value,
        })
    }

    pub(crate) fn encode(&self) -> Bytes {
        let mut w = FieldWriter::new(Sizes::default());
        let version = self.version.clamp(1, 3);
        w.put_u8(version);
        if version < 3 {
            w.put_u8(self.alloc_time);
            w.put_u8(self.write_time);
            w.put_u8(u8::from(self.defined));
            if version == 1 || self.defined {
                let value = self.value.clone().unwrap_or_default();
                w.put_u32(value.len() as u32);
                w.put_slice(&value);
            }
            return w.finish();
        }
        let defined = self.value.is_some();
        let mut flags = (self.alloc_time & 0x03) | ((self.write_time & 0x03) << 2);
        flags |= if defined { 0x20 } else { 0x10 };
        w.put_u8(flags);
        if let Some(value) = &self.value {
            w.put_u32(value.len() as u32);
            w.put_slice(value);
        }
        w.finish()
    }
}

/// One slot of an external data files message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalFileSlot {
    /// Offset of the file name in the local heap.
    pub name_offset: u64,
    /// Byte offset of the data inside the external file.
    pub file_offset: u64,
    /// Bytes reserved in the external file.
    pub size: u64,
}

/// External data files message (0x0007).
///
/// ```text
/// [version=1][reserved:3][allocated slots: u16][used slots: u16][local heap: O]
/// [name offset: L][file offset: L][size: L] x used slots
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalFilesMessage {
    /// Local heap holding slot names.
    pub heap_address: u64,
    /// Allocated slot count.
    pub allocated_slots: u16,
    /// Used slots.
    pub slots: Vec<ExternalFileSlot>,
}

impl ExternalFilesMessage {
    pub(crate) fn decode(c: &mut FieldCursor) -> Result<Self> {
        c.expect_version(&[1])?;
        c.skip(3)?;
        let allocated_slots = c.read_u16()?;
        let used = c.read_u16()?;
        if used > allocated_slots {
            return Err(c.format_error(format!("{} of {} slots used", used, allocated_slots)));
        }
        let heap_address = c.read_offset()?;
        let mut slots = Vec::with_capacity(used as usize);
        for _ in 0..used {
            slots.push(ExternalFileSlot {
                name_offset: c.read_length()?,
                file_offset: c.read_length()?,
                size: c.read_length()?,
            });
        }
        Ok(Self { heap_address, allocated_slots, slots })
    }

    pub(crate) fn encode(&self, sizes: Sizes) -> Bytes {
        let mut w = FieldWriter::new(sizes);
        w.put_u8(1);
        w.put_zeros(3);
        w.put_u16(self.allocated_slots.max(self.slots.len() as u16));
        w.put_u16(self.slots.len() as u16);
        w.put_offset(self.heap_address);
        for slot in &self.slots {
            w.put_length(slot.name_offset);
            w.put_length(slot.file_offset);
            w.put_length(slot.size);
        }
        w.finish()
    }
}

/// Testing message (0x0009), holding a fixed marker value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BogusMessage {
    /// Marker value, 0xdeadbeef when written by the library.
    pub value: u32,
}

impl BogusMessage {
    pub(crate) fn decode(c: &mut FieldCursor) -> Result<Self> {
        Ok(Self { value: c.read_u32()? })
    }

    pub(crate) fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&self.value.to_le_bytes())
    }
}

/// Object comment message (0x000D).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentMessage {
    /// The comment text.
    pub text: String,
}

impl CommentMessage {
    pub(crate) fn decode(c: &mut FieldCursor) -> Result<Self> {
        Ok(Self { text: c.read_cstring()? })
    }

    pub(crate) fn encode(&self) -> Bytes {
        let mut bytes = self.text.as_bytes().to_vec();
        bytes.push(0);
        Bytes::from(bytes)
    }
}

/// Modification time, in both the old (0x000E) and current (0x0012) forms.
///
/// ```text
/// old: "YYYYMMDDhhmmss" in ASCII, UTC, then 2 reserved bytes
/// new: [version=1][reserved:3][seconds since the epoch: u32]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModificationTimeMessage {
    /// Seconds since 1970-01-01T00:00:00Z.
    pub seconds: u64,
}

impl ModificationTimeMessage {
    pub(crate) fn decode(c: &mut FieldCursor) -> Result<Self> {
        c.expect_version(&[1])?;
        c.skip(3)?;
        Ok(Self { seconds: c.read_u32()? as u64 })
    }

    pub(crate) fn encode(&self) -> Bytes {
        let mut w = FieldWriter::new(Sizes::default());
        w.put_u8(1);
        w.put_zeros(3);
        w.put_u32(self.seconds as u32);
        w.finish()
    }

    pub(crate) fn decode_old(c: &mut FieldCursor) -> Result<Self> {
        let raw = c.read_bytes(14)?;
        let field = |range: std::ops::Range<usize>| -> Result<i64> {
            std::str::from_utf8(&raw[range.clone()])
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| c.format_error(format!("bad digits in timestamp at {:?}", range)))
        };
        let (year, month, day) = (field(0..4)?, field(4..6)?, field(6..8)?);
        let (hour, minute, second) = (field(8..10)?, field(10..12)?, field(12..14)?);
        if !(1..=12).contains(&month) || !(1..=31).contains(&day) || hour > 23 || minute > 59 {
            return Err(c.format_error("timestamp field out of range"));
        }
        let days = days_from_civil(year, month, day);
        let seconds = days * 86_400 + hour * 3_600 + minute * 60 + second;
        if seconds < 0 {
            return Err(c.format_error("timestamp before the epoch"));
        }
        Ok(Self { seconds: seconds as u64 })
    }

    pub(crate) fn encode_old(&self) -> Bytes {
        let days = (self.seconds / 86_400) as i64;
        let rem = self.seconds % 86_400;
        let (year, month, day) = civil_from_days(days);
        let text = format!(
            "{:04}{:02}{:02}{:02}{:02}{:02}",
            year,
            month,
            day,
            rem / 3_600,
            (rem / 60) % 60,
            rem % 60
        );
        let mut bytes = text.into_bytes();
        bytes.extend_from_slice(&[0, 0]);
        Bytes::from(bytes)
    }
}

// Proleptic Gregorian calendar, days relative to 1970-01-01.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

fn civil_from_days(days: i64) -> (i64, i64, i64) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

/// Shared message table message (0x000F), found in the superblock extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedMessageTableMessage {
    /// Address of the `SMTB` table.
    pub table_address: u64,
    /// Number of indices in the table.
    pub index_count: u8,
}

impl SharedMessageTableMessage {
    pub(crate) fn decode(c: &mut FieldCursor) -> Result<Self> {
        c.expect_version(&[0])?;
        Ok(Self { table_address: c.read_offset()?, index_count: c.read_u8()? })
    }

    pub(crate) fn encode(&self, sizes: Sizes) -> Bytes {
        let mut w = FieldWriter::new(sizes);
        w.put_u8(0);
        w.put_offset(self.table_address);
        w.put_u8(self.index_count);
        w.finish()
    }
}

/// Header continuation message (0x0010).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuationMessage {
    /// Address of the continuation block.
    pub address: u64,
    /// Length of the continuation block.
    pub length: u64,
}

impl ContinuationMessage {
    pub(crate) fn decode(c: &mut FieldCursor) -> Result<Self> {
        Ok(Self { address: c.read_offset()?, length: c.read_length()? })
    }

    pub(crate) fn encode(&self, sizes: Sizes) -> Bytes {
        let mut w = FieldWriter::new(sizes);
        w.put_offset(self.address);
        w.put_length(self.length);
        w.finish()
    }
}

/// Non-default B-tree K values (0x0013), found in the superblock extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BTreeKMessage {
    /// Chunk B-tree internal node K.
    pub indexed_storage_internal_k: u16,
    /// Group B-tree internal node K.
    pub group_internal_k: u16,
    /// Group B-tree leaf node K.
    pub group_leaf_k: u16,
}

impl BTreeKMessage {
    pub(crate) fn decode(c: &mut FieldCursor) -> Result<Self> {
        c.expect_version(&[0])?;
        Ok(Self {
            indexed_storage_internal_k: c.read_u16()?,
            group_internal_k: c.read_u16()?,
            group_leaf_k: c.read_u16()?,
        })
    }

    pub(crate) fn encode(&self) -> Bytes {
        let mut w = FieldWriter::new(Sizes::default());
        w.put_u8(0);
        w.put_u16(self.indexed_storage_internal_k);
        w.put_u16(self.group_internal_k);
        w.put_u16(self.group_leaf_k);
        w.finish()
    }
}

/// File driver information (0x0014), found in the superblock extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfoMessage {
    /// Eight-character driver identification.
    pub driver_id: [u8; 8],
    /// Driver-specific information.
    pub info: Bytes,
}

impl DriverInfoMessage {
    pub(crate) fn decode(c: &mut FieldCursor) -> Result<Self> {
        c.expect_version(&[0])?;
        let mut driver_id = [0u8; 8];
        driver_id.copy_from_slice(&c.read_bytes(8)?);
        let size = c.read_u16()? as usize;
        Ok(Self { driver_id, info: c.read_bytes(size)? })
    }

    pub(crate) fn encode(&self) -> Bytes {
        let mut w = FieldWriter::new(Sizes::default());
        w.put_u8(0);
        w.put_slice(&self.driver_id);
        w.put_u16(self.info.len() as u16);
        w.put_slice(&self.info);
        w.finish()
    }
}

/// Object reference count (0x0016), used by v2 headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceCountMessage {
    /// Number of hard links to the object.
    pub count: u32,
}

impl ReferenceCountMessage {
    pub(crate) fn decode(c: &mut FieldCursor) -> Result<Self> {
        c.expect_version(&[0])?;
        Ok(Self { count: c.read_u32()? })
    }

    pub(crate) fn encode(&self) -> Bytes {
        let mut w = FieldWriter::new(Sizes::default());
        w.put_u8(0);
        w.put_u32(self.count);
        w.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Structure;

    fn cursor(bytes: Bytes) -> FieldCursor {
        FieldCursor::new(bytes, Sizes::new(4, 4), Structure::HeaderMessage, 0)
    }

    #[test]
    fn test_fill_value_versions() {
        let defined = FillValueMessage::new(Some(Bytes::from_static(&[0xAB, 0xCD])));
        assert_eq!(FillValueMessage::decode(&mut cursor(defined.encode())).unwrap(), defined);

        let undefined = FillValueMessage::new(None);
        assert_eq!(FillValueMessage::decode(&mut cursor(undefined.encode())).unwrap(), undefined);

        let v2 = FillValueMessage { version: 2, ..FillValueMessage::new(None) };
        assert_eq!(v2.encode().len(), 4);
        assert_eq!(FillValueMessage::decode(&mut cursor(v2.encode())).unwrap(), v2);
    }

    #[test]
    fn test_old_fill_value() {
        let old = FillValueMessage::decode_old(&mut cursor(Bytes::from_static(&[
            1, 0, 0, 0, 0x7F,
        ])))
        .unwrap();
        assert_eq!(old.value.as_deref(), Some(&[0x7F][..]));
        assert_eq!(old.encode_old(), Bytes::from_static(&[1, 0, 0, 0, 0x7F]));
    }

    #[test]
    fn test_old_modification_time() {
        let bytes = Bytes::from_static(b"20000101000000\0\0");
        let time = ModificationTimeMessage::decode_old(&mut cursor(bytes.clone())).unwrap();
        assert_eq!(time.seconds, 946_684_800);
        assert_eq!(time.encode_old(), bytes);
    }

    #[test]
    fn test_old_modification_time_rejects_garbage() {
        let bytes = Bytes::from_static(b"2000AB01000000\0\0");
        let err = ModificationTimeMessage::decode_old(&mut cursor(bytes)).unwrap_err();
        assert!(err.is_format_error());
    }

    #[test]
    fn test_calendar_conversion() {
        for days in [-1, 0, 59, 365, 11_016, 19_000] {
            let (y, m, d) = civil_from_days(days);
            assert_eq!(days_from_civil(y, m, d), days);
        }
    }

    #[test]
    fn test_external_files_rejects_overfull() {
        let message = ExternalFilesMessage {
            heap_address: 0x100,
            allocated_slots: 2,
            slots: vec![ExternalFileSlot { name_offset: 8, file_offset: 0, size: 64 }],
        };
        let back = ExternalFilesMessage::decode(&mut cursor(message.encode(Sizes::new(4, 4))));
        assert_eq!(back.unwrap(), message);

        let mut raw = message.encode(Sizes::new(4, 4)).to_vec();
        raw[6] = 3;
        assert!(ExternalFilesMessage::decode(&mut cursor(Bytes::from(raw))).is_err());
    }

    #[test]
    fn test_fixed_messages() {
        let sizes = Sizes::new(4, 4);
        let cont = ContinuationMessage { address: 0x800, length: 96 };
        assert_eq!(ContinuationMessage::decode(&mut cursor(cont.encode(sizes))).unwrap(), cont);

        let k =
            BTreeKMessage { indexed_storage_internal_k: 32, group_internal_k: 16, group_leaf_k: 4 };
        assert_eq!(BTreeKMessage::decode(&mut cursor(k.encode())).unwrap(), k);

        let rc = ReferenceCountMessage { count: 3 };
        assert_eq!(ReferenceCountMessage::decode(&mut cursor(rc.encode())).unwrap(), rc);

        let comment = CommentMessage { text: "calibrated".into() };
        assert_eq!(CommentMessage::decode(&mut cursor(comment.encode())).unwrap(), comment);
    }
}
