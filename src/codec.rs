//! C37.118 Frame Codec: bit-exact pack/unpack of SYNC/CONFIG/DATA/HEADER/CMD
//! frames per IEEE C37.118-2005, with a CRC-CCITT trailer.

use crate::error::{PmuError, Result};
use crate::types::{SIGNAL_COUNT, SIGNAL_NAMES, TIME_BASE};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_16_IBM_3740};
use std::io::{Cursor, Read, Write};

/// CRC-CCITT: polynomial 0x1021, initial value 0xFFFF, no XOR-out — the
/// `crc` crate's CCITT-FALSE catalog entry matches the standard exactly.
const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

const SYNC_LEAD: u8 = 0xAA;
const PROTOCOL_VERSION: u8 = 1;
const COMMON_HEADER_LEN: usize = 14;
const STATION_NAME_LEN: usize = 16;
const CHANNEL_NAME_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data = 0,
    Header = 1,
    Config1 = 2,
    Config2 = 3,
    Command = 4,
}

impl FrameType {
    fn from_tag(tag: u8) -> Result<FrameType> {
        match tag {
            0 => Ok(FrameType::Data),
            1 => Ok(FrameType::Header),
            2 => Ok(FrameType::Config1),
            3 => Ok(FrameType::Config2),
            4 => Ok(FrameType::Command),
            other => Err(PmuError::ProtocolParse(format!("unknown frame type tag {other}"))),
        }
    }
}

/// Computes `SOC`/`FRACSEC` from a microsecond Unix timestamp: whole seconds
/// since the epoch, plus the remaining fraction of a second as a value out
/// of `TIME_BASE` (`timestamp_us % 10^6`).
pub fn soc_fracsec(timestamp_us: i64) -> (u32, u32) {
    let soc = (timestamp_us.div_euclid(1_000_000)) as u32;
    let fracsec = timestamp_us.rem_euclid(1_000_000) as u32;
    (soc, fracsec)
}

fn write_common_header(buf: &mut Vec<u8>, frame_type: FrameType, idcode: u16, soc: u32, fracsec: u32) {
    buf.write_u8(SYNC_LEAD).unwrap();
    buf.write_u8(((frame_type as u8) << 4) | PROTOCOL_VERSION).unwrap();
    buf.write_u16::<BigEndian>(0).unwrap(); // FRAMESIZE placeholder, patched below
    buf.write_u16::<BigEndian>(idcode).unwrap();
    buf.write_u32::<BigEndian>(soc).unwrap();
    buf.write_u32::<BigEndian>(fracsec & 0x00FF_FFFF).unwrap();
}

fn finalize_frame(mut buf: Vec<u8>) -> Vec<u8> {
    let total_len = (buf.len() + 2) as u16;
    BigEndian::write_u16(&mut buf[2..4], total_len);
    let chk = CRC.checksum(&buf);
    buf.write_u16::<BigEndian>(chk).unwrap();
    buf
}

fn verify_and_strip_crc(bytes: &[u8]) -> Result<&[u8]> {
    if bytes.len() < COMMON_HEADER_LEN + 2 {
        return Err(PmuError::ProtocolParse("frame shorter than header + CRC".into()));
    }
    let framesize = BigEndian::read_u16(&bytes[2..4]) as usize;
    if framesize != bytes.len() {
        return Err(PmuError::ProtocolParse(format!(
            "FRAMESIZE {framesize} does not match actual length {}",
            bytes.len()
        )));
    }
    let body = &bytes[..bytes.len() - 2];
    let expected = BigEndian::read_u16(&bytes[bytes.len() - 2..]);
    let actual = CRC.checksum(body);
    if actual != expected {
        return Err(PmuError::ProtocolParse(format!("CRC mismatch: got {actual:#06x}, want {expected:#06x}")));
    }
    Ok(body)
}

fn pad_ascii(s: &str, len: usize) -> Vec<u8> {
    let mut bytes = s.as_bytes().to_vec();
    bytes.resize(len, b' ');
    bytes.truncate(len);
    bytes
}

fn read_ascii(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim_end().to_string()
}

/// FORMAT bitfield: representation of phasors/analogs/frequency on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    pub polar: bool,
    pub phasors_float: bool,
    pub analogs_float: bool,
    pub freq_float: bool,
}

impl Default for Format {
    fn default() -> Self {
        Format { polar: false, phasors_float: false, analogs_float: false, freq_float: false }
    }
}

impl Format {
    fn to_u16(self) -> u16 {
        (self.polar as u16) | ((self.phasors_float as u16) << 1) | ((self.analogs_float as u16) << 2) | ((self.freq_float as u16) << 3)
    }

    fn from_u16(word: u16) -> Format {
        Format {
            polar: word & 0x1 != 0,
            phasors_float: word & 0x2 != 0,
            analogs_float: word & 0x4 != 0,
            freq_float: word & 0x8 != 0,
        }
    }
}

/// Voltage (0) or current (1) PHUNIT type tag, plus a 24-bit scale factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhUnit {
    pub is_current: bool,
    pub scale: u32,
}

impl PhUnit {
    fn to_u32(self) -> u32 {
        ((self.is_current as u32) << 24) | (self.scale & 0x00FF_FFFF)
    }

    fn from_u32(word: u32) -> PhUnit {
        PhUnit { is_current: (word >> 24) & 1 != 0, scale: word & 0x00FF_FFFF }
    }
}

/// Default scale multiplier: `engineering_units = raw_count * scale * 10^-5`,
/// so `scale = 1` is the baseline 10^-5-per-count conversion factor.
pub const DEFAULT_PHUNIT_SCALE: u32 = 1;

#[derive(Debug, Clone)]
pub struct StationConfig {
    pub name: String,
    pub idcode: u16,
    pub format: Format,
    pub phunit: [PhUnit; SIGNAL_COUNT],
    pub fnom_50hz: bool,
    pub cfgcnt: u16,
}

impl StationConfig {
    pub fn new(name: impl Into<String>, idcode: u16, fnom_50hz: bool) -> Self {
        StationConfig {
            name: name.into(),
            idcode,
            format: Format::default(),
            phunit: std::array::from_fn(|i| PhUnit {
                is_current: i >= 3,
                scale: DEFAULT_PHUNIT_SCALE,
            }),
            fnom_50hz,
            cfgcnt: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigFrame {
    pub idcode: u16,
    pub soc: u32,
    pub fracsec: u32,
    pub time_base: u32,
    pub station: StationConfig,
    pub data_rate: i16,
}

fn pack_config(frame: &ConfigFrame, frame_type: FrameType) -> Vec<u8> {
    let mut buf = Vec::with_capacity(200);
    write_common_header(&mut buf, frame_type, frame.idcode, frame.soc, frame.fracsec);
    buf.write_u32::<BigEndian>(frame.time_base).unwrap();
    buf.write_u16::<BigEndian>(1).unwrap(); // NUM_PMU

    let st = &frame.station;
    buf.write_all(&pad_ascii(&st.name, STATION_NAME_LEN)).unwrap();
    buf.write_u16::<BigEndian>(st.idcode).unwrap();
    buf.write_u16::<BigEndian>(st.format.to_u16()).unwrap();
    buf.write_u16::<BigEndian>(SIGNAL_COUNT as u16).unwrap(); // PHNMR
    buf.write_u16::<BigEndian>(0).unwrap(); // ANNMR
    buf.write_u16::<BigEndian>(0).unwrap(); // DGNMR
    for name in SIGNAL_NAMES {
        buf.write_all(&pad_ascii(name, CHANNEL_NAME_LEN)).unwrap();
    }
    for unit in st.phunit {
        buf.write_u32::<BigEndian>(unit.to_u32()).unwrap();
    }
    buf.write_u16::<BigEndian>(if st.fnom_50hz { 1 } else { 0 }).unwrap();
    buf.write_u16::<BigEndian>(st.cfgcnt).unwrap();
    buf.write_i16::<BigEndian>(frame.data_rate).unwrap();

    finalize_frame(buf)
}

fn unpack_config(bytes: &[u8]) -> Result<ConfigFrame> {
    let body = verify_and_strip_crc(bytes)?;
    let mut cur = Cursor::new(&body[4..]); // skip SYNC(2)+FRAMESIZE(2)
    let idcode = cur.read_u16::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
    let soc = cur.read_u32::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
    let fracsec = cur.read_u32::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))? & 0x00FF_FFFF;
    let time_base = cur.read_u32::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
    let num_pmu = cur.read_u16::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
    if num_pmu != 1 {
        return Err(PmuError::ProtocolParse(format!("unsupported NUM_PMU {num_pmu}")));
    }

    let mut name_buf = [0u8; STATION_NAME_LEN];
    cur.read_exact(&mut name_buf).map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
    let name = read_ascii(&name_buf);

    let station_idcode = cur.read_u16::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
    let format = Format::from_u16(cur.read_u16::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?);
    let phnmr = cur.read_u16::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
    let _annmr = cur.read_u16::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
    let _dgnmr = cur.read_u16::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
    if phnmr as usize != SIGNAL_COUNT {
        return Err(PmuError::ProtocolParse(format!("unexpected PHNMR {phnmr}")));
    }
    for _ in 0..phnmr {
        let mut name = [0u8; CHANNEL_NAME_LEN];
        cur.read_exact(&mut name).map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
    }
    let mut phunit = [PhUnit { is_current: false, scale: 0 }; SIGNAL_COUNT];
    for unit in &mut phunit {
        *unit = PhUnit::from_u32(cur.read_u32::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?);
    }
    let fnom = cur.read_u16::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
    let cfgcnt = cur.read_u16::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
    let data_rate = cur.read_i16::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;

    Ok(ConfigFrame {
        idcode,
        soc,
        fracsec,
        time_base,
        station: StationConfig { name, idcode: station_idcode, format, phunit, fnom_50hz: fnom & 1 != 0, cfgcnt },
        data_rate,
    })
}

pub fn pack_config1(frame: &ConfigFrame) -> Vec<u8> {
    pack_config(frame, FrameType::Config1)
}
pub fn pack_config2(frame: &ConfigFrame) -> Vec<u8> {
    pack_config(frame, FrameType::Config2)
}
pub fn unpack_config1(bytes: &[u8]) -> Result<ConfigFrame> {
    unpack_config(bytes)
}
pub fn unpack_config2(bytes: &[u8]) -> Result<ConfigFrame> {
    unpack_config(bytes)
}

/// STAT bit 13 (sync) and bit 15 (data invalid); the rest are left clear
/// since this engine does not model trigger/sort-order conditions.
pub const STAT_SYNC_OK: u16 = 0x2000;

#[derive(Debug, Clone)]
pub struct DataFrame {
    pub idcode: u16,
    pub soc: u32,
    pub fracsec: u32,
    pub stat: u16,
    pub phasors: [num_complex::Complex64; SIGNAL_COUNT],
    pub freq: f64,
    pub dfreq: f64,
    pub fnom_50hz: bool,
}

fn pack_data(frame: &DataFrame, format: Format) -> Vec<u8> {
    let mut buf = Vec::with_capacity(60);
    write_common_header(&mut buf, FrameType::Data, frame.idcode, frame.soc, frame.fracsec);
    buf.write_u16::<BigEndian>(frame.stat).unwrap();

    for phasor in frame.phasors {
        let (a, b) = if format.polar { (phasor.norm(), phasor.arg()) } else { (phasor.re, phasor.im) };
        if format.phasors_float {
            buf.write_f32::<BigEndian>(a as f32).unwrap();
            buf.write_f32::<BigEndian>(b as f32).unwrap();
        } else {
            buf.write_i16::<BigEndian>(clamp_i16(a)).unwrap();
            buf.write_i16::<BigEndian>(clamp_i16(b)).unwrap();
        }
    }

    let fnom = if frame.fnom_50hz { 50.0 } else { 60.0 };
    if format.freq_float {
        buf.write_f32::<BigEndian>(frame.freq as f32).unwrap();
        buf.write_f32::<BigEndian>(frame.dfreq as f32).unwrap();
    } else {
        buf.write_i16::<BigEndian>(clamp_i16((frame.freq - fnom) * 1000.0)).unwrap();
        buf.write_i16::<BigEndian>(clamp_i16(frame.dfreq * 100.0)).unwrap();
    }

    finalize_frame(buf)
}

fn clamp_i16(value: f64) -> i16 {
    value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

pub fn pack_data_frame(frame: &DataFrame, format: Format) -> Vec<u8> {
    pack_data(frame, format)
}

pub fn unpack_data_frame(bytes: &[u8], format: Format, fnom_50hz: bool) -> Result<DataFrame> {
    let body = verify_and_strip_crc(bytes)?;
    let mut cur = Cursor::new(&body[4..]);
    let idcode = cur.read_u16::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
    let soc = cur.read_u32::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
    let fracsec = cur.read_u32::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))? & 0x00FF_FFFF;
    let stat = cur.read_u16::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;

    let mut phasors = [num_complex::Complex64::new(0.0, 0.0); SIGNAL_COUNT];
    for phasor in &mut phasors {
        let (a, b) = if format.phasors_float {
            (
                cur.read_f32::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))? as f64,
                cur.read_f32::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))? as f64,
            )
        } else {
            (
                cur.read_i16::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))? as f64,
                cur.read_i16::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))? as f64,
            )
        };
        *phasor = if format.polar { num_complex::Complex64::from_polar(a, b) } else { num_complex::Complex64::new(a, b) };
    }

    let fnom = if fnom_50hz { 50.0 } else { 60.0 };
    let (freq, dfreq) = if format.freq_float {
        (
            cur.read_f32::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))? as f64,
            cur.read_f32::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))? as f64,
        )
    } else {
        let raw_freq = cur.read_i16::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
        let raw_dfreq = cur.read_i16::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
        (fnom + raw_freq as f64 / 1000.0, raw_dfreq as f64 / 100.0)
    };

    Ok(DataFrame { idcode, soc, fracsec, stat, phasors, freq, dfreq, fnom_50hz })
}

#[derive(Debug, Clone)]
pub struct HeaderFrame {
    pub idcode: u16,
    pub soc: u32,
    pub fracsec: u32,
    pub text: String,
}

pub fn pack_header(frame: &HeaderFrame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20 + frame.text.len());
    write_common_header(&mut buf, FrameType::Header, frame.idcode, frame.soc, frame.fracsec);
    buf.write_all(frame.text.as_bytes()).unwrap();
    finalize_frame(buf)
}

pub fn unpack_header(bytes: &[u8]) -> Result<HeaderFrame> {
    let body = verify_and_strip_crc(bytes)?;
    let mut cur = Cursor::new(&body[4..]);
    let idcode = cur.read_u16::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
    let soc = cur.read_u32::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
    let fracsec = cur.read_u32::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))? & 0x00FF_FFFF;
    let mut text = String::new();
    cur.read_to_string(&mut text).map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
    Ok(HeaderFrame { idcode, soc, fracsec, text })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StopData,
    StartData,
    SendHeader,
    SendConfig1,
    SendConfig2,
    Extended,
}

impl Command {
    pub fn code(self) -> u16 {
        match self {
            Command::StopData => 0x01,
            Command::StartData => 0x02,
            Command::SendHeader => 0x03,
            Command::SendConfig1 => 0x04,
            Command::SendConfig2 => 0x05,
            Command::Extended => 0x08,
        }
    }

    pub fn from_code(code: u16) -> Result<Command> {
        match code {
            0x01 => Ok(Command::StopData),
            0x02 => Ok(Command::StartData),
            0x03 => Ok(Command::SendHeader),
            0x04 => Ok(Command::SendConfig1),
            0x05 => Ok(Command::SendConfig2),
            0x08 => Ok(Command::Extended),
            other => Err(PmuError::ProtocolParse(format!("unknown CMD code {other:#06x}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandFrame {
    pub idcode: u16,
    pub soc: u32,
    pub fracsec: u32,
    pub command: Command,
    pub extra: Vec<u16>,
}

pub fn pack_command(frame: &CommandFrame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(18 + frame.extra.len() * 2);
    write_common_header(&mut buf, FrameType::Command, frame.idcode, frame.soc, frame.fracsec);
    buf.write_u16::<BigEndian>(frame.command.code()).unwrap();
    for word in &frame.extra {
        buf.write_u16::<BigEndian>(*word).unwrap();
    }
    finalize_frame(buf)
}

pub fn unpack_command(bytes: &[u8]) -> Result<CommandFrame> {
    let body = verify_and_strip_crc(bytes)?;
    let mut cur = Cursor::new(&body[4..]);
    let idcode = cur.read_u16::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
    let soc = cur.read_u32::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?;
    let fracsec = cur.read_u32::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))? & 0x00FF_FFFF;
    let command = Command::from_code(cur.read_u16::<BigEndian>().map_err(|e| PmuError::ProtocolParse(e.to_string()))?)?;
    let mut extra = Vec::new();
    while let Ok(word) = cur.read_u16::<BigEndian>() {
        extra.push(word);
    }
    Ok(CommandFrame { idcode, soc, fracsec, command, extra })
}

/// Peeks at a received buffer's frame type without fully unpacking it, used
/// by the server to dispatch before the payload is known to be well-formed.
pub fn peek_frame_type(bytes: &[u8]) -> Result<FrameType> {
    if bytes.len() < 2 || bytes[0] != SYNC_LEAD {
        return Err(PmuError::ProtocolParse("missing SYNC lead byte".into()));
    }
    FrameType::from_tag((bytes[1] >> 4) & 0x0F)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> ConfigFrame {
        ConfigFrame {
            idcode: 17,
            soc: 1_700_000_000,
            fracsec: 0,
            time_base: TIME_BASE,
            station: StationConfig::new("PMU 1", 17, true),
            data_rate: 50,
        }
    }

    #[test]
    fn cfg2_round_trip_and_frame_size() {
        let cfg = sample_config();
        let packed = pack_config2(&cfg);
        assert!(packed.len() >= 90, "len={}", packed.len());
        assert_eq!(&packed[0..2], &[0xAA, 0x31]);

        let framesize = BigEndian::read_u16(&packed[2..4]) as usize;
        assert_eq!(framesize, packed.len());

        let unpacked = unpack_config2(&packed).unwrap();
        assert_eq!(unpacked.idcode, cfg.idcode);
        assert_eq!(unpacked.station.name, "PMU 1");
        assert_eq!(unpacked.station.idcode, 17);
        assert_eq!(unpacked.data_rate, 50);
        assert!(unpacked.station.fnom_50hz);
    }

    #[test]
    fn cfg1_tag_differs_from_cfg2() {
        let cfg = sample_config();
        let packed = pack_config1(&cfg);
        assert_eq!(&packed[0..2], &[0xAA, 0x21]);
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let cfg = sample_config();
        let mut packed = pack_config2(&cfg);
        let last = packed.len() - 1;
        packed[last] ^= 0xFF;
        assert!(unpack_config2(&packed).is_err());
    }

    #[test]
    fn data_frame_round_trip_rectangular_int16() {
        let frame = DataFrame {
            idcode: 17,
            soc: 1_700_000_000,
            fracsec: 500_000,
            stat: STAT_SYNC_OK,
            phasors: std::array::from_fn(|i| num_complex::Complex64::new(100.0 + i as f64, -50.0)),
            freq: 50.02,
            dfreq: 0.15,
            fnom_50hz: true,
        };
        let format = Format::default();
        let packed = pack_data_frame(&frame, format);
        let unpacked = unpack_data_frame(&packed, format, true).unwrap();
        assert_eq!(unpacked.stat, STAT_SYNC_OK);
        assert!((unpacked.freq - 50.02).abs() < 0.01);
        assert!((unpacked.dfreq - 0.15).abs() < 0.01);
        for (a, b) in frame.phasors.iter().zip(unpacked.phasors.iter()) {
            assert!((a.re - b.re).abs() < 1.0);
            assert!((a.im - b.im).abs() < 1.0);
        }
    }

    #[test]
    fn command_round_trip() {
        let frame = CommandFrame {
            idcode: 17,
            soc: 0,
            fracsec: 0,
            command: Command::StartData,
            extra: Vec::new(),
        };
        let packed = pack_command(&frame);
        let unpacked = unpack_command(&packed).unwrap();
        assert_eq!(unpacked.command, Command::StartData);
        assert_eq!(peek_frame_type(&packed).unwrap(), FrameType::Command);
    }

    #[test]
    fn header_round_trip() {
        let frame = HeaderFrame { idcode: 17, soc: 0, fracsec: 0, text: "hello pmu".into() };
        let packed = pack_header(&frame);
        let unpacked = unpack_header(&packed).unwrap();
        assert_eq!(unpacked.text, "hello pmu");
    }

    #[test]
    fn fracsec_uses_modulo_1e6_not_1e3() {
        let (soc, fracsec) = soc_fracsec(1_700_000_000_123_456);
        assert_eq!(soc, 1_700_000_000);
        assert_eq!(fracsec, 123_456);
    }
}
