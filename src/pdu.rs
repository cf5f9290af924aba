//! Wire formats for UM and AM data PDUs.
//!
//! All headers are bit-packed big-endian (MSB first within each byte) and
//! are built with explicit shifts and masks; none of this relies on how the
//! compiler lays out anything in memory.

use crate::bits::{BitReader, BitWriter};
use crate::Error;
use byteorder::{BigEndian, ByteOrder};
use core::fmt;

/// Largest value an encoded (explicit) length indicator can carry.
pub const LI_VALUE_MAX: u16 = 2047;

/// Most LIs a single PDU can describe.
pub const LI_COUNT_MAX: usize = 32;

/// A PDU's list of SDU-fragment lengths.
pub type LiList = heapless::Vec<u16, LI_COUNT_MAX>;

bitflags::bitflags! {
    /// 2-bit framing info.
    ///
    /// Tells the receiver whether the PDU's data field is aligned with SDU
    /// boundaries: bit 1 set means the first data byte does *not* start an
    /// SDU, bit 0 set means the last data byte does *not* end one.
    pub struct FramingInfo: u8 {
        const NOT_FIRST = 0b10;
        const NOT_LAST = 0b01;
    }
}

impl FramingInfo {
    fn from_raw(raw: u8) -> Self {
        FramingInfo::from_bits_truncate(raw)
    }
}

/// Header of a UM data PDU.
///
/// Layout with 5-bit SNs (1 byte):
///
/// ```notrust
/// MSB                            LSB
/// +----------+---------+----------+
/// |    FI    |    E    |    SN    |
/// | (2 bits) | (1 bit) | (5 bits) |
/// +----------+---------+----------+
/// ```
///
/// Layout with 10-bit SNs (2 bytes):
///
/// ```notrust
/// MSB                                        LSB
/// +----------+----------+---------+-----------+
/// |    R     |    FI    |    E    |    SN     |
/// | (3 bits) | (2 bits) | (1 bit) | (10 bits) |
/// +----------+----------+---------+-----------+
/// ```
///
/// `E` is set when explicit length indicators follow the header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UmHeader {
    pub fi: FramingInfo,
    pub e: bool,
    pub sn: u16,
}

impl UmHeader {
    /// Header size in bytes for the given SN width.
    pub fn size(sn_bits: u8) -> usize {
        if sn_bits == 5 {
            1
        } else {
            2
        }
    }

    /// Parses a UM header off the front of `raw`.
    pub fn parse(raw: &[u8], sn_bits: u8) -> Result<Self, Error> {
        if sn_bits == 5 {
            if raw.is_empty() {
                return Err(Error::Eof);
            }
            let b = raw[0];
            Ok(UmHeader {
                fi: FramingInfo::from_raw(b >> 6),
                e: b & 0b0010_0000 != 0,
                sn: u16::from(b & 0b0001_1111),
            })
        } else {
            if raw.len() < 2 {
                return Err(Error::Eof);
            }
            let v = BigEndian::read_u16(raw);
            Ok(UmHeader {
                fi: FramingInfo::from_raw(((v >> 11) & 0b11) as u8),
                e: v & (1 << 10) != 0,
                sn: v & 0x3FF,
            })
        }
    }

    /// Writes the header into the front of `out`.
    pub fn encode(&self, out: &mut [u8], sn_bits: u8) -> Result<usize, Error> {
        if out.len() < Self::size(sn_bits) {
            return Err(Error::Eof);
        }
        if sn_bits == 5 {
            out[0] = (self.fi.bits() << 6) | ((self.e as u8) << 5) | (self.sn as u8 & 0b1_1111);
            Ok(1)
        } else {
            let v = (u16::from(self.fi.bits()) << 11) | ((self.e as u16) << 10) | (self.sn & 0x3FF);
            BigEndian::write_u16(out, v);
            Ok(2)
        }
    }
}

/// First two bytes of every AM PDU.
///
/// ```notrust
/// MSB                                                            LSB
/// +---------+---------+---------+----------+---------+-----------+
/// |   DC    |   RF    |    P    |    FI    |    E    |    SN     |
/// | (1 bit) | (1 bit) | (1 bit) | (2 bits) | (1 bit) | (10 bits) |
/// +---------+---------+---------+----------+---------+-----------+
/// ```
///
/// `DC = 0` marks a control (STATUS) PDU, in which case the remaining
/// fields follow the STATUS layout instead. `RF = 1` marks a resegmented
/// PDU, which carries an extra [`SegmentInfo`] word after these two bytes.
///
/// [`SegmentInfo`]: struct.SegmentInfo.html
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct AmHeader(u16);

impl AmHeader {
    /// Size of the fixed AM header in bytes.
    pub const SIZE: usize = 2;

    /// Creates a data-PDU header with all other fields zero.
    pub fn new_data() -> Self {
        AmHeader(1 << 15)
    }

    /// Parses the first two bytes of `raw`.
    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() < Self::SIZE {
            return Err(Error::Eof);
        }
        Ok(AmHeader(BigEndian::read_u16(raw)))
    }

    /// Writes the header into the first two bytes of `out`.
    pub fn encode(&self, out: &mut [u8]) {
        BigEndian::write_u16(out, self.0);
    }

    /// Whether this is a control (STATUS) PDU.
    pub fn is_control(&self) -> bool {
        self.0 & (1 << 15) == 0
    }

    /// Whether this PDU is a resegment of an earlier PDU.
    pub fn is_resegment(&self) -> bool {
        self.0 & (1 << 14) != 0
    }

    pub fn set_resegment(&mut self, rf: bool) {
        if rf {
            self.0 |= 1 << 14;
        } else {
            self.0 &= !(1 << 14);
        }
    }

    /// Whether the peer is asked for an immediate STATUS report.
    pub fn poll(&self) -> bool {
        self.0 & (1 << 13) != 0
    }

    pub fn set_poll(&mut self, p: bool) {
        if p {
            self.0 |= 1 << 13;
        } else {
            self.0 &= !(1 << 13);
        }
    }

    pub fn fi(&self) -> FramingInfo {
        FramingInfo::from_raw(((self.0 >> 11) & 0b11) as u8)
    }

    pub fn set_fi(&mut self, fi: FramingInfo) {
        self.0 = (self.0 & !(0b11 << 11)) | (u16::from(fi.bits()) << 11);
    }

    /// Whether explicit length indicators follow the header.
    pub fn e(&self) -> bool {
        self.0 & (1 << 10) != 0
    }

    pub fn set_e(&mut self, e: bool) {
        if e {
            self.0 |= 1 << 10;
        } else {
            self.0 &= !(1 << 10);
        }
    }

    pub fn sn(&self) -> u16 {
        self.0 & 0x3FF
    }

    pub fn set_sn(&mut self, sn: u16) {
        debug_assert!(sn < 1024);
        self.0 = (self.0 & !0x3FF) | (sn & 0x3FF);
    }
}

impl fmt::Debug for AmHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmHeader")
            .field("control", &self.is_control())
            .field("RF", &self.is_resegment())
            .field("P", &self.poll())
            .field("FI", &self.fi())
            .field("E", &self.e())
            .field("SN", &self.sn())
            .finish()
    }
}

/// Second header word of an AM PDU segment (`RF = 1`).
///
/// ```notrust
/// MSB                  LSB
/// +---------+-----------+
/// |   LSF   |    SO     |
/// | (1 bit) | (15 bits) |
/// +---------+-----------+
/// ```
///
/// `SO` is the byte offset of this segment's data within the original
/// PDU's data field; `LSF` marks the segment carrying its final byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub lsf: bool,
    pub so: u16,
}

impl SegmentInfo {
    /// Size of the segment word in bytes.
    pub const SIZE: usize = 2;

    pub fn parse(raw: &[u8]) -> Result<Self, Error> {
        if raw.len() < Self::SIZE {
            return Err(Error::Eof);
        }
        let v = BigEndian::read_u16(raw);
        Ok(SegmentInfo {
            lsf: v & (1 << 15) != 0,
            so: v & 0x7FFF,
        })
    }

    pub fn encode(&self, out: &mut [u8]) {
        BigEndian::write_u16(out, ((self.lsf as u16) << 15) | (self.so & 0x7FFF));
    }
}

/// Bytes occupied by the encoded LI list of an `n_li`-fragment PDU.
///
/// The final LI is implicit, so only `n_li - 1` fields are emitted; a pair
/// of 12-bit `E`/`LI` fields shares 3 bytes and an unpaired trailing field
/// is padded out to 2.
pub fn li_len(n_li: usize) -> usize {
    debug_assert!(n_li >= 1);
    ((n_li - 1) / 2) * 3 + if n_li % 2 == 0 { 2 } else { 0 }
}

/// Encodes the explicit part of `lis` into `out`.
///
/// `out` must be exactly `li_len(lis.len())` bytes and is fully
/// overwritten, including the 4 padding bits after an odd field count.
pub fn encode_li(lis: &[u16], out: &mut [u8]) {
    debug_assert_eq!(out.len(), li_len(lis.len()));
    let n = lis.len();
    if n <= 1 {
        return;
    }
    for byte in out.iter_mut() {
        *byte = 0;
    }
    let mut w = BitWriter::new(out);
    for (i, &li) in lis[..n - 1].iter().enumerate() {
        let more = i < n - 2;
        w.write(more as u32, 1).unwrap();
        w.write(u32::from(li), 11).unwrap();
    }
}

/// Parses the LI list at the front of a PDU's post-header bytes.
///
/// `stream` covers the LI fields *and* the data that follows them; the
/// final, implicit LI is recovered from whatever the explicit fields leave
/// unaccounted for. When `e` is clear there are no explicit fields and the
/// whole stream is a single fragment.
///
/// Returns the list plus the offset of the first data byte.
pub fn parse_li(e: bool, stream: &[u8]) -> Result<(LiList, usize), Error> {
    let mut lis = LiList::new();
    if stream.is_empty() {
        return Err(Error::InvalidLength);
    }
    if !e {
        lis.push(stream.len() as u16).ok();
        return Ok((lis, 0));
    }

    let mut r = BitReader::new(stream);
    loop {
        let more = r.read(1)? != 0;
        let li = r.read(11)? as u16;
        if li == 0 {
            return Err(Error::InvalidValue);
        }
        if lis.push(li).is_err() {
            return Err(Error::InvalidValue);
        }
        if !more {
            break;
        }
        if lis.len() == LI_COUNT_MAX - 1 {
            // no room left for the implicit final LI
            return Err(Error::InvalidValue);
        }
    }

    let data_off = (r.bit_pos() + 7) / 8;
    let explicit: usize = lis.iter().map(|&li| usize::from(li)).sum();
    let total = data_off + explicit;
    if total < stream.len() {
        lis.push((stream.len() - total) as u16).ok();
    } else if total > stream.len() {
        return Err(Error::InvalidLength);
    }
    Ok((lis, data_off))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    #[test]
    fn um_header_roundtrip() {
        let hdr = UmHeader {
            fi: FramingInfo::NOT_FIRST,
            e: true,
            sn: 17,
        };
        let mut buf = [0u8; 2];
        assert_eq!(hdr.encode(&mut buf, 5).unwrap(), 1);
        assert_eq!(buf[0], 0b10_1_10001);
        assert_eq!(UmHeader::parse(&buf, 5).unwrap(), hdr);

        let hdr = UmHeader {
            fi: FramingInfo::NOT_FIRST | FramingInfo::NOT_LAST,
            e: false,
            sn: 777,
        };
        assert_eq!(hdr.encode(&mut buf, 10).unwrap(), 2);
        assert_eq!(UmHeader::parse(&buf, 10).unwrap(), hdr);
    }

    #[test]
    fn am_header_fields() {
        let mut hdr = AmHeader::new_data();
        hdr.set_sn(1023);
        hdr.set_poll(true);
        hdr.set_e(true);
        hdr.set_fi(FramingInfo::NOT_LAST);

        let mut buf = [0u8; 2];
        hdr.encode(&mut buf);
        let parsed = AmHeader::parse(&buf).unwrap();
        assert!(!parsed.is_control());
        assert!(!parsed.is_resegment());
        assert!(parsed.poll());
        assert!(parsed.e());
        assert_eq!(parsed.fi(), FramingInfo::NOT_LAST);
        assert_eq!(parsed.sn(), 1023);

        // DC = 0 means control PDU
        assert!(AmHeader::parse(&[0x00, 0x00]).unwrap().is_control());
        assert_eq!(AmHeader::parse(&[0x00]), Err(Error::Eof));
    }

    #[test]
    fn segment_info_roundtrip() {
        let si = SegmentInfo { lsf: true, so: 120 };
        let mut buf = [0u8; 2];
        si.encode(&mut buf);
        assert_eq!(buf, [0x80, 120]);
        assert_eq!(SegmentInfo::parse(&buf).unwrap(), si);
    }

    #[test]
    fn li_len_table() {
        assert_eq!(li_len(1), 0);
        assert_eq!(li_len(2), 2);
        assert_eq!(li_len(3), 3);
        assert_eq!(li_len(4), 5);
        assert_eq!(li_len(5), 6);
        assert_eq!(li_len(6), 8);
    }

    fn roundtrip(lis: &[u16]) {
        let mut pdu = Vec::new();
        pdu.resize(li_len(lis.len()), 0);
        encode_li(lis, &mut pdu);
        let li_bytes = pdu.len();
        for (i, &li) in lis.iter().enumerate() {
            pdu.resize(pdu.len() + usize::from(li), i as u8);
        }
        let (parsed, data_off) = parse_li(lis.len() > 1, &pdu).unwrap();
        assert_eq!(&parsed[..], lis);
        assert_eq!(data_off, li_bytes);
    }

    #[test]
    fn li_roundtrip() {
        roundtrip(&[100]);
        roundtrip(&[100, 50]);
        roundtrip(&[100, 50, 200]);
        roundtrip(&[1, 1, 1, 1, 1]);
        roundtrip(&[2047, 2047, 7]);
        let many: Vec<u16> = (1..=32).collect();
        roundtrip(&many);
    }

    #[test]
    fn li_errors() {
        // explicit zero LI
        let mut pdu = vec![0u8; 6];
        encode_li(&[5, 0, 1], &mut pdu[..3]);
        assert_eq!(parse_li(true, &pdu), Err(Error::InvalidValue));

        // lengths overrun the PDU
        let mut pdu = vec![0u8; 6];
        encode_li(&[200, 1], &mut pdu[..2]);
        assert_eq!(parse_li(true, &pdu), Err(Error::InvalidLength));

        // empty stream
        assert_eq!(parse_li(false, &[]), Err(Error::InvalidLength));
    }

    #[test]
    fn implicit_li_only() {
        let data = [9u8; 42];
        let (lis, off) = parse_li(false, &data).unwrap();
        assert_eq!(&lis[..], &[42]);
        assert_eq!(off, 0);
    }
}
