//! Sample Source: polymorphic ingestion (stdin, TCP, UDP, file, subprocess,
//! device), each producing one `Sample` at a time from `read()`.

use crate::error::{PmuError, Result};
use crate::types::Sample;
use log::warn;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs, UdpSocket};
use std::process::{Child, Command, Stdio};

/// Produces batches of samples; a batch is typically one sample but callers
/// must not assume a fixed size.
#[cfg_attr(test, mockall::automock)]
pub trait SampleSource: Send {
    fn read(&mut self) -> Result<Vec<Sample>>;
}

/// Whether a byte-oriented source's stream carries binary `Sample` records
/// or `key=value` CSV lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Binary,
    Csv,
}

fn read_one_framed<R: Read + BufRead>(reader: &mut R, format: WireFormat) -> Result<Vec<Sample>> {
    match format {
        WireFormat::Binary => {
            let mut buf = [0u8; 64];
            match reader.read_exact(&mut buf) {
                Ok(()) => Ok(vec![Sample::from_binary(&buf)]),
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(Vec::new()),
                Err(e) => Err(PmuError::SourceRead(e)),
            }
        }
        WireFormat::Csv => {
            let mut line = String::new();
            let n = reader.read_line(&mut line).map_err(PmuError::SourceRead)?;
            if n == 0 {
                return Ok(Vec::new());
            }
            match Sample::parse_csv(&line) {
                Some(sample) => Ok(vec![sample]),
                None => {
                    warn!("discarding unparseable CSV sample line: {line:?}");
                    Ok(Vec::new())
                }
            }
        }
    }
}

/// Reads `Sample` records from the process's standard input.
pub struct StdinSource {
    reader: BufReader<std::io::Stdin>,
    format: WireFormat,
}

impl StdinSource {
    pub fn new(format: WireFormat) -> Self {
        StdinSource { reader: BufReader::new(std::io::stdin()), format }
    }
}

impl SampleSource for StdinSource {
    fn read(&mut self) -> Result<Vec<Sample>> {
        read_one_framed(&mut self.reader, self.format)
    }
}

/// Connects to `host:port` over TCP, reconnecting on disconnect or read error.
pub struct TcpSource {
    addr: String,
    format: WireFormat,
    conn: Option<BufReader<TcpStream>>,
}

impl TcpSource {
    pub fn new(addr: impl Into<String>, format: WireFormat) -> Self {
        TcpSource { addr: addr.into(), format, conn: None }
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Ok(());
        }
        let stream = TcpStream::connect(&self.addr).map_err(PmuError::SourceRead)?;
        self.conn = Some(BufReader::new(stream));
        Ok(())
    }
}

impl SampleSource for TcpSource {
    fn read(&mut self) -> Result<Vec<Sample>> {
        if let Err(e) = self.ensure_connected() {
            warn!("tcp source reconnect failed: {e}");
            return Ok(Vec::new());
        }
        let format = self.format;
        let samples = {
            let reader = self.conn.as_mut().unwrap();
            read_one_framed(reader, format)
        };
        match samples {
            Ok(samples) if samples.is_empty() => {
                // 0-byte read: source exhaustion, drop the connection to reconnect next tick.
                self.conn = None;
                Ok(Vec::new())
            }
            Ok(samples) => Ok(samples),
            Err(e) => {
                warn!("tcp source read error: {e}");
                self.conn = None;
                Ok(Vec::new())
            }
        }
    }
}

/// Reads one `Sample` record per UDP datagram.
pub struct UdpSource {
    socket: UdpSocket,
    format: WireFormat,
}

impl UdpSource {
    pub fn bind(addr: impl ToSocketAddrs, format: WireFormat) -> Result<Self> {
        let socket = UdpSocket::bind(addr).map_err(PmuError::SourceOpen)?;
        Ok(UdpSource { socket, format })
    }
}

impl SampleSource for UdpSource {
    fn read(&mut self) -> Result<Vec<Sample>> {
        let mut buf = [0u8; 256];
        let n = match self.socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                warn!("udp source read error: {e}");
                return Ok(Vec::new());
            }
        };
        if n == 0 {
            return Ok(Vec::new());
        }
        match self.format {
            WireFormat::Binary if n >= 64 => {
                let mut body = [0u8; 64];
                body.copy_from_slice(&buf[..64]);
                Ok(vec![Sample::from_binary(&body)])
            }
            WireFormat::Csv => {
                let text = String::from_utf8_lossy(&buf[..n]);
                match Sample::parse_csv(&text) {
                    Some(sample) => Ok(vec![sample]),
                    None => {
                        warn!("discarding unparseable CSV datagram");
                        Ok(Vec::new())
                    }
                }
            }
            _ => {
                warn!("discarding undersized binary datagram ({n} bytes)");
                Ok(Vec::new())
            }
        }
    }
}

/// One-shot replay from disk; once exhausted, every further `read()` returns
/// an empty batch (source exhaustion).
pub struct FileSource {
    reader: BufReader<std::fs::File>,
    format: WireFormat,
}

impl FileSource {
    pub fn open(path: impl AsRef<std::path::Path>, format: WireFormat) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(PmuError::SourceOpen)?;
        Ok(FileSource { reader: BufReader::new(file), format })
    }
}

impl SampleSource for FileSource {
    fn read(&mut self) -> Result<Vec<Sample>> {
        read_one_framed(&mut self.reader, self.format)
    }
}

/// Spawns a program and reads `Sample` records from its stdout.
pub struct SubprocessSource {
    child: Child,
    reader: BufReader<std::process::ChildStdout>,
    format: WireFormat,
}

impl SubprocessSource {
    pub fn spawn(program: &str, args: &[String], format: WireFormat) -> Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .spawn()
            .map_err(PmuError::SourceOpen)?;
        let stdout = child.stdout.take().expect("piped stdout");
        Ok(SubprocessSource { child, reader: BufReader::new(stdout), format })
    }
}

impl SampleSource for SubprocessSource {
    fn read(&mut self) -> Result<Vec<Sample>> {
        read_one_framed(&mut self.reader, self.format)
    }
}

impl Drop for SubprocessSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
    }
}

/// 16-sample ADC frame read from the RPMsg character device, plus a
/// hardware-relative nanosecond timestamp for the frame's first sample.
const DEVICE_FRAME_SAMPLES: usize = 16;
const DEVICE_FRAME_BYTES: usize = DEVICE_FRAME_SAMPLES * 6 * 2 + 8;
/// Wall clock is re-queried every this many fabricated samples to bound
/// drift between the device's free-running nanosecond clock and the host's.
const DEVICE_RESYNC_PERIOD: u64 = 1024;

/// Writes a zero-length kick to a character device (e.g. an RPMsg endpoint)
/// to request a refill, then reads a fixed-size ADC buffer back.
pub struct DeviceSource {
    file: std::fs::File,
    seq: u64,
    pending: std::collections::VecDeque<Sample>,
    last_wall_us: i64,
    samples_since_resync: u64,
}

impl DeviceSource {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(PmuError::SourceOpen)?;
        Ok(DeviceSource {
            file,
            seq: 0,
            pending: std::collections::VecDeque::new(),
            last_wall_us: crate::types::wall_now_us(),
            samples_since_resync: DEVICE_RESYNC_PERIOD,
        })
    }

    fn fetch_frame(&mut self) -> Result<[u8; DEVICE_FRAME_BYTES]> {
        self.file.write_all(&[]).map_err(PmuError::SourceRead)?;
        let mut buf = [0u8; DEVICE_FRAME_BYTES];
        self.file.read_exact(&mut buf).map_err(PmuError::SourceRead)?;
        Ok(buf)
    }
}

impl SampleSource for DeviceSource {
    fn read(&mut self) -> Result<Vec<Sample>> {
        if self.pending.is_empty() {
            use byteorder::{BigEndian, ByteOrder};
            let buf = self.fetch_frame()?;
            let frame_delta_ns = BigEndian::read_u64(&buf[DEVICE_FRAME_SAMPLES * 6 * 2..]);
            let mut prev_ts = self.last_wall_us;
            for i in 0..DEVICE_FRAME_SAMPLES {
                let mut channels = [0u16; 6];
                for ch in 0..6 {
                    let off = i * 12 + ch * 2;
                    channels[ch] = BigEndian::read_u16(&buf[off..off + 2]);
                }

                let timestamp_us = if self.samples_since_resync >= DEVICE_RESYNC_PERIOD {
                    self.samples_since_resync = 0;
                    self.last_wall_us = crate::types::wall_now_us();
                    self.last_wall_us
                } else {
                    self.last_wall_us += (frame_delta_ns / DEVICE_FRAME_SAMPLES as u64 / 1000) as i64;
                    self.last_wall_us
                };
                self.samples_since_resync += 1;

                self.pending.push_back(Sample {
                    seq: self.seq,
                    channels,
                    timestamp_us,
                    time_delta_us: timestamp_us - prev_ts,
                });
                self.seq += 1;
                prev_ts = timestamp_us;
            }
        }
        Ok(self.pending.pop_front().into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn binary_reader_yields_one_sample_then_empty() {
        let sample = Sample { seq: 1, channels: [1, 2, 3, 4, 5, 6], timestamp_us: 10, time_delta_us: 1 };
        let mut cursor = BufReader::new(Cursor::new(sample.to_binary().to_vec()));
        let batch = read_one_framed(&mut cursor, WireFormat::Binary).unwrap();
        assert_eq!(batch, vec![sample]);
        let empty = read_one_framed(&mut cursor, WireFormat::Binary).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn csv_reader_skips_unparseable_lines() {
        let data = b"garbage\nseq_no=1,ch0=1,ch1=2,ch2=3,ch3=4,ch4=5,ch5=6,ts=1,delta=0\n".to_vec();
        let mut cursor = BufReader::new(Cursor::new(data));
        let first = read_one_framed(&mut cursor, WireFormat::Csv).unwrap();
        assert!(first.is_empty());
        let second = read_one_framed(&mut cursor, WireFormat::Csv).unwrap();
        assert_eq!(second[0].seq, 1);
    }
}
