use byteorder::{ByteOrder, NetworkEndian};
use core::{cmp, fmt, i32, ops};

use super::ip::checksum;
use super::{Error, Result};
use crate::phy::ChecksumCapabilities;
use crate::wire::{IpAddress, IpProtocol};

/// A TCP sequence number.
///
/// A sequence number is a monotonically advancing integer modulo 2^32. Arithmetic on
/// sequence numbers is always performed modulo 2^32, as dictated by RFC 793.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SeqNumber(pub i32);

impl fmt::Display for SeqNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0 as u32)
    }
}

impl ops::Add<usize> for SeqNumber {
    type Output = SeqNumber;

    fn add(self, rhs: usize) -> SeqNumber {
        SeqNumber(self.0.wrapping_add(rhs as i32))
    }
}

impl ops::Sub<usize> for SeqNumber {
    type Output = SeqNumber;

    fn sub(self, rhs: usize) -> SeqNumber {
        SeqNumber(self.0.wrapping_sub(rhs as i32))
    }
}

impl ops::AddAssign<usize> for SeqNumber {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl ops::Sub<SeqNumber> for SeqNumber {
    type Output = isize;

    fn sub(self, rhs: SeqNumber) -> isize {
        (self.0.wrapping_sub(rhs.0)) as isize
    }
}

impl cmp::PartialOrd for SeqNumber {
    fn partial_cmp(&self, other: &SeqNumber) -> Option<cmp::Ordering> {
        (self.0.wrapping_sub(other.0)).partial_cmp(&0)
    }
}

impl SeqNumber {
    pub fn checked_sub(self, rhs: usize) -> Option<SeqNumber> {
        if (rhs as i64) < i32::MAX as i64 {
            Some(self - rhs)
        } else {
            None
        }
    }
}

enum_with_unknown! {
    /// TCP control bit carried by a segment, folded into a single value the way this
    /// stack's internal queueing treats SYN/FIN as pseudo-bytes of sequence space.
    pub enum Control(u8) {
        None = 0,
        Syn  = 1,
        Fin  = 2,
        Rst  = 3
    }
}

impl Control {
    /// Return the length of the control, in transmitted-octet terms.
    pub const fn len(self) -> usize {
        match self {
            Control::Syn | Control::Fin => 1,
            _ => 0,
        }
    }

    pub const fn is_empty(self) -> bool {
        self.len() == 0
    }

    pub fn quash_psh(self) -> Control {
        self
    }
}

mod field {
    use crate::wire::field::*;

    pub const SRC_PORT: Field = 0..2;
    pub const DST_PORT: Field = 2..4;
    pub const SEQ_NUM: Field = 4..8;
    pub const ACK_NUM: Field = 8..12;
    pub const FLAGS: Field = 12..14;
    pub const WINDOW: Field = 14..16;
    pub const CHECKSUM: Field = 16..18;
    pub const URGENT: Field = 18..20;

    pub const OPTIONS: Rest = 20..;

    pub const FLG_FIN: u16 = 0x001;
    pub const FLG_SYN: u16 = 0x002;
    pub const FLG_RST: u16 = 0x004;
    pub const FLG_PSH: u16 = 0x008;
    pub const FLG_ACK: u16 = 0x010;
    pub const FLG_URG: u16 = 0x020;
    pub const FLG_ECE: u16 = 0x040;
    pub const FLG_CWR: u16 = 0x080;
    pub const FLG_NS: u16 = 0x100;

    pub const OPT_END: u8 = 0x00;
    pub const OPT_NOP: u8 = 0x01;
    pub const OPT_MSS: u8 = 0x02;
    pub const OPT_WS: u8 = 0x03;
    pub const OPT_SACKPERM: u8 = 0x04;
    pub const OPT_SACKRANGE: u8 = 0x05;
    pub const OPT_TSTAMP: u8 = 0x08;
}

pub const HEADER_LEN: usize = field::URGENT.end;

/// A function returning the current value of the TCP timestamp clock, in milliseconds.
///
/// RFC 7323 leaves the clock granularity and origin up to the implementation; callers
/// supply one so the stack never reaches for wall-clock time on its own.
pub type TcpTimestampGenerator = fn() -> u32;

/// A read/write wrapper around a Transmission Control Protocol segment buffer.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Packet<T> {
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    pub fn new_checked(buffer: T) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len()?;
        Ok(packet)
    }

    pub fn check_len(&self) -> Result<()> {
        let len = self.buffer.as_ref().len();
        if len < HEADER_LEN {
            return Err(Error);
        }
        let header_len = self.header_len() as usize;
        if header_len < HEADER_LEN || header_len > len {
            return Err(Error);
        }
        Ok(())
    }

    pub fn into_inner(self) -> T {
        self.buffer
    }

    pub fn src_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::SRC_PORT])
    }

    pub fn dst_port(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::DST_PORT])
    }

    pub fn seq_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_i32(&self.buffer.as_ref()[field::SEQ_NUM]))
    }

    pub fn ack_number(&self) -> SeqNumber {
        SeqNumber(NetworkEndian::read_i32(&self.buffer.as_ref()[field::ACK_NUM]))
    }

    fn raw_flags(&self) -> u16 {
        let data = self.buffer.as_ref();
        NetworkEndian::read_u16(&data[field::FLAGS])
    }

    pub fn header_len(&self) -> u8 {
        ((self.raw_flags() >> 12) * 4) as u8
    }

    pub fn fin(&self) -> bool {
        self.raw_flags() & field::FLG_FIN != 0
    }

    pub fn syn(&self) -> bool {
        self.raw_flags() & field::FLG_SYN != 0
    }

    pub fn rst(&self) -> bool {
        self.raw_flags() & field::FLG_RST != 0
    }

    pub fn psh(&self) -> bool {
        self.raw_flags() & field::FLG_PSH != 0
    }

    pub fn ack(&self) -> bool {
        self.raw_flags() & field::FLG_ACK != 0
    }

    pub fn urg(&self) -> bool {
        self.raw_flags() & field::FLG_URG != 0
    }

    pub fn window_len(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::WINDOW])
    }

    pub fn checksum(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::CHECKSUM])
    }

    pub fn urgent_at(&self) -> u16 {
        NetworkEndian::read_u16(&self.buffer.as_ref()[field::URGENT])
    }

    pub fn control(&self) -> Control {
        match (self.syn(), self.fin(), self.rst()) {
            (false, false, false) => Control::None,
            (true, false, false) => Control::Syn,
            (false, true, false) => Control::Fin,
            (false, false, true) => Control::Rst,
            _ => Control::None,
        }
    }

    pub fn verify_checksum(&self, src_addr: &IpAddress, dst_addr: &IpAddress) -> bool {
        if cfg!(fuzzing) {
            return true;
        }
        let data = self.buffer.as_ref();
        checksum::combine(&[
            checksum::pseudo_header(src_addr, dst_addr, IpProtocol::Tcp, data.len() as u32),
            checksum::data(data),
        ]) == !0
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    pub fn options(&self) -> &'a [u8] {
        let header_len = self.header_len() as usize;
        &self.buffer.as_ref()[field::OPTIONS.start..header_len]
    }

    pub fn payload(&self) -> &'a [u8] {
        let header_len = self.header_len() as usize;
        &self.buffer.as_ref()[header_len..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    pub fn set_src_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::SRC_PORT], value);
    }

    pub fn set_dst_port(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::DST_PORT], value);
    }

    pub fn set_seq_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_i32(&mut self.buffer.as_mut()[field::SEQ_NUM], value.0);
    }

    pub fn set_ack_number(&mut self, value: SeqNumber) {
        NetworkEndian::write_i32(&mut self.buffer.as_mut()[field::ACK_NUM], value.0);
    }

    fn set_raw_flags(&mut self, value: u16) {
        let data = self.buffer.as_mut();
        NetworkEndian::write_u16(&mut data[field::FLAGS], value);
    }

    pub fn set_header_len(&mut self, value: u8) {
        let raw = self.raw_flags() & 0x0fff;
        self.set_raw_flags(raw | (((value / 4) as u16) << 12));
    }

    pub fn set_flag(&mut self, mask: u16, set: bool) {
        let raw = self.raw_flags();
        let raw = if set { raw | mask } else { raw & !mask };
        self.set_raw_flags(raw);
    }

    pub fn set_fin(&mut self, value: bool) {
        self.set_flag(field::FLG_FIN, value);
    }

    pub fn set_syn(&mut self, value: bool) {
        self.set_flag(field::FLG_SYN, value);
    }

    pub fn set_rst(&mut self, value: bool) {
        self.set_flag(field::FLG_RST, value);
    }

    pub fn set_psh(&mut self, value: bool) {
        self.set_flag(field::FLG_PSH, value);
    }

    pub fn set_ack(&mut self, value: bool) {
        self.set_flag(field::FLG_ACK, value);
    }

    pub fn set_urg(&mut self, value: bool) {
        self.set_flag(field::FLG_URG, value);
    }

    pub fn set_window_len(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::WINDOW], value);
    }

    pub fn set_checksum(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::CHECKSUM], value);
    }

    pub fn set_urgent_at(&mut self, value: u16) {
        NetworkEndian::write_u16(&mut self.buffer.as_mut()[field::URGENT], value);
    }

    pub fn set_control(&mut self, control: Control) {
        self.set_syn(control == Control::Syn);
        self.set_fin(control == Control::Fin);
        self.set_rst(control == Control::Rst);
    }

    pub fn fill_checksum(&mut self, src_addr: &IpAddress, dst_addr: &IpAddress) {
        self.set_checksum(0);
        let checksum = {
            let data = self.buffer.as_ref();
            !checksum::combine(&[
                checksum::pseudo_header(src_addr, dst_addr, IpProtocol::Tcp, data.len() as u32),
                checksum::data(data),
            ])
        };
        self.set_checksum(checksum)
    }

    pub fn options_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len() as usize;
        &mut self.buffer.as_mut()[field::OPTIONS.start..header_len]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let header_len = self.header_len() as usize;
        &mut self.buffer.as_mut()[header_len..]
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for Packet<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

/// TCP options this stack is able to parse and emit, limited to the set named
/// for the on-wire contract: MSS, window scale, timestamps, SACK-permitted and SACK.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TcpOption<'a> {
    EndOfList,
    NoOperation,
    MaxSegmentSize(u16),
    WindowScale(u8),
    SackPermitted,
    SackRange([Option<(u32, u32)>; 3]),
    Timestamp { tsval: u32, tsecr: u32 },
    Unknown { kind: u8, data: &'a [u8] },
}

impl<'a> TcpOption<'a> {
    pub fn parse(buffer: &'a [u8]) -> Result<(&'a [u8], TcpOption<'a>)> {
        let (length, option);
        match *buffer.first().ok_or(Error)? {
            field::OPT_END => return Ok((&buffer[1..], TcpOption::EndOfList)),
            field::OPT_NOP => {
                length = 1;
                option = TcpOption::NoOperation;
            }
            kind => {
                length = *buffer.get(1).ok_or(Error)? as usize;
                let data = buffer.get(2..length).ok_or(Error)?;
                match (kind, length) {
                    (field::OPT_END, _) | (field::OPT_NOP, _) => unreachable!(),
                    (field::OPT_MSS, 4) => {
                        option = TcpOption::MaxSegmentSize(NetworkEndian::read_u16(data))
                    }
                    (field::OPT_WS, 3) => option = TcpOption::WindowScale(data[0]),
                    (field::OPT_SACKPERM, 2) => option = TcpOption::SackPermitted,
                    (field::OPT_SACKRANGE, n) if (10..=34).contains(&n) => {
                        let mut ranges = [None, None, None];
                        for (i, chunk) in data.chunks_exact(8).enumerate().take(3) {
                            ranges[i] = Some((
                                NetworkEndian::read_u32(&chunk[0..4]),
                                NetworkEndian::read_u32(&chunk[4..8]),
                            ));
                        }
                        option = TcpOption::SackRange(ranges);
                    }
                    (field::OPT_TSTAMP, 10) => {
                        let tsval = NetworkEndian::read_u32(&data[0..4]);
                        let tsecr = NetworkEndian::read_u32(&data[4..8]);
                        option = TcpOption::Timestamp { tsval, tsecr };
                    }
                    (kind, _) => option = TcpOption::Unknown { kind, data },
                }
            }
        }
        Ok((buffer.get(length..).ok_or(Error)?, option))
    }

    pub fn buffer_len(&self) -> usize {
        match *self {
            TcpOption::EndOfList => 1,
            TcpOption::NoOperation => 1,
            TcpOption::MaxSegmentSize(_) => 4,
            TcpOption::WindowScale(_) => 3,
            TcpOption::SackPermitted => 2,
            TcpOption::SackRange(slice) => {
                2 + slice.iter().flatten().count() * 8
            }
            TcpOption::Timestamp { .. } => 10,
            TcpOption::Unknown { data, .. } => 2 + data.len(),
        }
    }

    pub fn emit(&self, buffer: &mut [u8]) -> &mut [u8] {
        let length;
        match *self {
            TcpOption::EndOfList => {
                length = 1;
                buffer[0] = field::OPT_END;
            }
            TcpOption::NoOperation => {
                length = 1;
                buffer[0] = field::OPT_NOP;
            }
            _ => {
                length = self.buffer_len();
                buffer[1] = length as u8;
                match *self {
                    TcpOption::EndOfList | TcpOption::NoOperation => unreachable!(),
                    TcpOption::MaxSegmentSize(value) => {
                        buffer[0] = field::OPT_MSS;
                        NetworkEndian::write_u16(&mut buffer[2..4], value);
                    }
                    TcpOption::WindowScale(value) => {
                        buffer[0] = field::OPT_WS;
                        buffer[2] = value;
                    }
                    TcpOption::SackPermitted => {
                        buffer[0] = field::OPT_SACKPERM;
                    }
                    TcpOption::SackRange(slice) => {
                        buffer[0] = field::OPT_SACKRANGE;
                        slice
                            .iter()
                            .flatten()
                            .enumerate()
                            .for_each(|(i, &(left_edge, right_edge))| {
                                let pos = 2 + i * 8;
                                NetworkEndian::write_u32(&mut buffer[pos..pos + 4], left_edge);
                                NetworkEndian::write_u32(
                                    &mut buffer[pos + 4..pos + 8],
                                    right_edge,
                                );
                            });
                    }
                    TcpOption::Timestamp { tsval, tsecr } => {
                        buffer[0] = field::OPT_TSTAMP;
                        NetworkEndian::write_u32(&mut buffer[2..6], tsval);
                        NetworkEndian::write_u32(&mut buffer[6..10], tsecr);
                    }
                    TcpOption::Unknown { kind, data: provided } => {
                        buffer[0] = kind;
                        buffer[2..].copy_from_slice(provided)
                    }
                }
            }
        }
        &mut buffer[length..]
    }
}

/// A high-level representation of a Transmission Control Protocol segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repr<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub control: Control,
    pub seq_number: SeqNumber,
    pub ack_number: Option<SeqNumber>,
    pub window_len: u16,
    pub window_scale: Option<u8>,
    pub max_seg_size: Option<u16>,
    pub sack_permitted: bool,
    pub sack_ranges: [Option<(u32, u32)>; 3],
    pub timestamp: Option<TcpTimestampRepr>,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpTimestampRepr {
    pub tsval: u32,
    pub tsecr: u32,
}

impl<'a> Repr<'a> {
    /// Return the length of the segment, in sequence space: the payload length
    /// plus one octet for each of SYN and FIN, since both consume a sequence
    /// number per RFC 793 §3.3.
    pub fn segment_len(&self) -> usize {
        self.payload.len() + self.control.len()
    }

    pub fn parse<T>(
        packet: &Packet<&'a T>,
        src_addr: &IpAddress,
        dst_addr: &IpAddress,
        checksum_caps: &ChecksumCapabilities,
    ) -> Result<Repr<'a>>
    where
        T: AsRef<[u8]> + ?Sized,
    {
        packet.check_len()?;
        if packet.dst_port() == 0 {
            return Err(Error);
        }
        if checksum_caps.tcp.rx() && !packet.verify_checksum(src_addr, dst_addr) {
            return Err(Error);
        }

        let mut max_seg_size = None;
        let mut window_scale = None;
        let mut sack_permitted = false;
        let mut sack_ranges = [None, None, None];
        let mut timestamp = None;

        let mut options = packet.options();
        while !options.is_empty() {
            let (next_options, option) = TcpOption::parse(options)?;
            match option {
                TcpOption::EndOfList => break,
                TcpOption::NoOperation => (),
                TcpOption::MaxSegmentSize(value) => max_seg_size = Some(value),
                TcpOption::WindowScale(value) => window_scale = Some(value),
                TcpOption::SackPermitted => sack_permitted = true,
                TcpOption::SackRange(slice) => sack_ranges = slice,
                TcpOption::Timestamp { tsval, tsecr } => {
                    timestamp = Some(TcpTimestampRepr { tsval, tsecr })
                }
                TcpOption::Unknown { .. } => (),
            }
            options = next_options;
        }

        Ok(Repr {
            src_port: packet.src_port(),
            dst_port: packet.dst_port(),
            control: packet.control(),
            seq_number: packet.seq_number(),
            ack_number: if packet.ack() {
                Some(packet.ack_number())
            } else {
                None
            },
            window_len: packet.window_len(),
            window_scale,
            max_seg_size,
            sack_permitted,
            sack_ranges,
            timestamp,
            payload: packet.payload(),
        })
    }

    /// Return the length of the header that will be emitted from this representation,
    /// rounded up to a multiple of four bytes.
    pub fn header_len(&self) -> usize {
        let mut length = field::URGENT.end;
        if self.max_seg_size.is_some() {
            length += 4;
        }
        if self.window_scale.is_some() {
            length += 3;
        }
        if self.sack_permitted {
            length += 2;
        }
        let sack_range_len: usize = self.sack_ranges.iter().flatten().count() * 8;
        if sack_range_len > 0 {
            length += sack_range_len + 2;
        }
        if self.timestamp.is_some() {
            length += 10;
        }

        if length % 4 != 0 {
            length += 4 - length % 4;
        }

        length
    }

    pub fn buffer_len(&self) -> usize {
        self.header_len() + self.payload.len()
    }

    pub fn emit<T>(
        &self,
        packet: &mut Packet<&mut T>,
        src_addr: &IpAddress,
        dst_addr: &IpAddress,
        checksum_caps: &ChecksumCapabilities,
    ) where
        T: AsRef<[u8]> + AsMut<[u8]> + ?Sized,
    {
        packet.set_src_port(self.src_port);
        packet.set_dst_port(self.dst_port);
        packet.set_seq_number(self.seq_number);
        packet.set_ack_number(self.ack_number.unwrap_or(SeqNumber(0)));
        packet.set_header_len(self.header_len() as u8);
        packet.set_control(self.control);
        packet.set_ack(self.ack_number.is_some());
        packet.set_window_len(self.window_len);
        packet.set_urgent_at(0);

        {
            let mut options = packet.options_mut();
            if let Some(value) = self.max_seg_size {
                options = TcpOption::MaxSegmentSize(value).emit(options);
            }
            if let Some(value) = self.window_scale {
                options = TcpOption::WindowScale(value).emit(options);
            }
            if self.sack_permitted {
                options = TcpOption::SackPermitted.emit(options);
            } else if self.ack_number.is_some() && self.sack_ranges.iter().any(|s| s.is_some()) {
                options = TcpOption::SackRange(self.sack_ranges).emit(options);
            }
            if let Some(TcpTimestampRepr { tsval, tsecr }) = self.timestamp {
                options = TcpOption::Timestamp { tsval, tsecr }.emit(options);
            }

            if !options.is_empty() {
                TcpOption::EndOfList.emit(options);
            }
        }

        packet.payload_mut()[..self.payload.len()].copy_from_slice(self.payload);

        if checksum_caps.tcp.tx() {
            packet.fill_checksum(src_addr, dst_addr)
        } else {
            packet.set_checksum(0);
        }
    }
}

impl fmt::Display for Repr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TCP src={} dst={} seq={}",
            self.src_port, self.dst_port, self.seq_number
        )?;
        if let Some(ack) = self.ack_number {
            write!(f, " ack={ack}")?;
        }
        write!(f, " win={}", self.window_len)?;
        match self.control {
            Control::Syn => write!(f, " syn")?,
            Control::Fin => write!(f, " fin")?,
            Control::Rst => write!(f, " rst")?,
            Control::None => (),
            Control::Unknown(_) => (),
        }
        if !self.payload.is_empty() {
            write!(f, " len={}", self.payload.len())?;
        }
        Ok(())
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> fmt::Display for Packet<&'a T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "TCP src={} dst={} seq={} len={}",
            self.src_port(),
            self.dst_port(),
            self.seq_number(),
            self.payload().len()
        )
    }
}

use crate::wire::pretty_print::{PrettyIndent, PrettyPrint};

impl<T: AsRef<[u8]>> PrettyPrint for Packet<T> {
    fn pretty_print(
        buffer: &dyn AsRef<[u8]>,
        f: &mut fmt::Formatter,
        indent: &mut PrettyIndent,
    ) -> fmt::Result {
        match Packet::new_checked(buffer) {
            Err(err) => write!(f, "{indent}({err})"),
            Ok(packet) => write!(
                f,
                "{indent}TCP src={} dst={} seq={}",
                packet.src_port(),
                packet.dst_port(),
                packet.seq_number()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_repr(payload: &[u8]) -> Repr {
        Repr {
            src_port: 48896,
            dst_port: 80,
            control: Control::None,
            seq_number: SeqNumber(1000),
            ack_number: Some(SeqNumber(2000)),
            window_len: 4096,
            window_scale: None,
            max_seg_size: None,
            sack_permitted: false,
            sack_ranges: [None, None, None],
            timestamp: None,
            payload,
        }
    }

    #[test]
    fn emit_then_parse_round_trips() {
        let payload = b"hello";
        let repr = base_repr(payload);
        let mut buf = vec![0u8; repr.buffer_len()];
        let src = IpAddress::v4(192, 168, 1, 1);
        let dst = IpAddress::v4(192, 168, 1, 2);
        repr.emit(
            &mut Packet::new_unchecked(&mut buf[..]),
            &src,
            &dst,
            &ChecksumCapabilities::default(),
        );
        let packet = Packet::new_checked(&buf[..]).unwrap();
        assert!(packet.verify_checksum(&src, &dst));
        let parsed = Repr::parse(&packet, &src, &dst, &ChecksumCapabilities::default()).unwrap();
        assert_eq!(parsed.payload, payload);
        assert_eq!(parsed.seq_number, repr.seq_number);
    }

    #[test]
    fn seq_number_wraps_and_compares() {
        let a = SeqNumber(i32::MAX);
        let b = a + 10usize;
        assert!(b > a);
        assert_eq!(b - a, 10);
    }

    #[test]
    fn options_with_mss_and_sack_permitted_round_trip() {
        let mut repr = base_repr(&[]);
        repr.max_seg_size = Some(1460);
        repr.sack_permitted = true;
        let mut buf = vec![0u8; repr.buffer_len()];
        let src = IpAddress::v4(10, 0, 0, 1);
        let dst = IpAddress::v4(10, 0, 0, 2);
        repr.emit(
            &mut Packet::new_unchecked(&mut buf[..]),
            &src,
            &dst,
            &ChecksumCapabilities::default(),
        );
        let packet = Packet::new_checked(&buf[..]).unwrap();
        let parsed = Repr::parse(&packet, &src, &dst, &ChecksumCapabilities::default()).unwrap();
        assert_eq!(parsed.max_seg_size, Some(1460));
        assert!(parsed.sack_permitted);
    }
}
