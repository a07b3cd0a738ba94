//! Phasor Server: single-client TCP listener running the C37.118 state
//! machine on a dedicated thread.

use crate::codec::{
    self, Command, CommandFrame, ConfigFrame, DataFrame, Format, HeaderFrame, StationConfig, STAT_SYNC_OK,
};
use crate::error::{PmuError, Result};
use crate::processor::ProcessorHandle;
use crate::types::TIME_BASE;
use log::{info, warn};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CLIENT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

bitflags::bitflags! {
    /// `Connected ⇒ Listening`; `DataSending ⇒ Connected`.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct ServerState: u8 {
        const LISTENING    = 0b001;
        const CONNECTED    = 0b010;
        const DATA_SENDING = 0b100;
    }
}

/// Identity and wire-format parameters the server builds CONFIG/DATA frames from.
#[derive(Clone)]
pub struct PmuIdentity {
    pub idcode: u16,
    pub station_name: String,
    pub fnom_50hz: bool,
    pub data_rate: u16,
    pub format: Format,
}

impl PmuIdentity {
    pub fn default_identity() -> Self {
        PmuIdentity {
            idcode: 17,
            station_name: "PMU 1".to_string(),
            fnom_50hz: true,
            data_rate: 50,
            format: Format::default(),
        }
    }

    fn station_config(&self, cfgcnt: u16) -> StationConfig {
        let mut station = StationConfig::new(self.station_name.clone(), self.idcode, self.fnom_50hz);
        station.format = self.format;
        station.cfgcnt = cfgcnt;
        station
    }
}

/// Single-client TCP server implementing the C37.118 listen/connect/send
/// state machine.
pub struct PhasorServer {
    listen_addr: String,
    identity: PmuIdentity,
    processor: ProcessorHandle,
    listener: Option<TcpListener>,
    client: Option<TcpStream>,
    send_data: bool,
    state: ServerState,
    cfgcnt: u16,
    keep_running: Arc<AtomicBool>,
}

impl PhasorServer {
    pub fn new(listen_addr: impl Into<String>, identity: PmuIdentity, processor: ProcessorHandle, keep_running: Arc<AtomicBool>) -> Self {
        PhasorServer {
            listen_addr: listen_addr.into(),
            identity,
            processor,
            listener: None,
            client: None,
            send_data: false,
            state: ServerState::empty(),
            cfgcnt: 1,
            keep_running,
        }
    }

    pub fn state_bits(&self) -> u8 {
        self.state.bits()
    }

    /// The listener's bound address, once `ensure_listening`/`tick` has run.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    fn ensure_listening(&mut self) {
        if self.listener.is_some() {
            return;
        }
        match TcpListener::bind(&self.listen_addr) {
            Ok(listener) => {
                listener.set_nonblocking(true).ok();
                self.listener = Some(listener);
                self.set_state(self.state | ServerState::LISTENING);
                info!("phasor server listening on {}", self.listen_addr);
            }
            Err(e) => {
                warn!("phasor server failed to bind {}: {e}", self.listen_addr);
            }
        }
    }

    fn set_state(&mut self, new_state: ServerState) {
        if new_state != self.state {
            info!("phasor server state {:#05b} -> {:#05b}", self.state.bits(), new_state.bits());
            self.state = new_state;
        }
    }

    fn accept_pending(&mut self) {
        let Some(listener) = &self.listener else { return };
        match listener.accept() {
            Ok((stream, _addr)) => {
                if self.client.is_some() {
                    // Only one client at a time; reject by dropping the new connection.
                    drop(stream);
                    return;
                }
                stream.set_read_timeout(Some(CLIENT_POLL_TIMEOUT)).ok();
                stream.set_nodelay(true).ok();
                self.client = Some(stream);
                self.set_state(self.state | ServerState::CONNECTED);
                info!("phasor server accepted a client");
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => warn!("phasor server accept error: {e}"),
        }
    }

    fn disconnect_client(&mut self) {
        self.client = None;
        self.send_data = false;
        self.set_state(self.state - ServerState::CONNECTED - ServerState::DATA_SENDING);
    }

    fn handle_client_input(&mut self) -> Result<()> {
        let Some(client) = self.client.as_mut() else { return Ok(()) };
        let mut buf = [0u8; 256];
        match client.read(&mut buf) {
            Ok(0) => self.disconnect_client(),
            Ok(n) => {
                if let Err(e) = self.dispatch_command(&buf[..n]) {
                    warn!("phasor server ignored malformed client data: {e}");
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            Err(e) => {
                warn!("phasor server client read error: {e}");
                self.disconnect_client();
            }
        }
        Ok(())
    }

    fn dispatch_command(&mut self, buf: &[u8]) -> Result<()> {
        match codec::peek_frame_type(buf) {
            Ok(codec::FrameType::Command) => {}
            Ok(_) => return Err(PmuError::ProtocolParse("client sent a non-command frame".into())),
            Err(e) => return Err(e),
        }
        let cmd = codec::unpack_command(buf)?;
        match cmd.command {
            Command::StopData => {
                self.send_data = false;
                self.set_state(self.state - ServerState::DATA_SENDING);
            }
            Command::StartData => {
                self.send_data = true;
                self.set_state(self.state | ServerState::DATA_SENDING);
            }
            Command::SendHeader => self.write_frame(codec::pack_header(&HeaderFrame {
                idcode: self.identity.idcode,
                soc: 0,
                fracsec: 0,
                text: format!("PMU engine, station {}", self.identity.station_name),
            }))?,
            Command::SendConfig1 => {
                let frame = self.build_config_frame();
                self.write_frame(codec::pack_config1(&frame))?;
            }
            Command::SendConfig2 => {
                let frame = self.build_config_frame();
                self.write_frame(codec::pack_config2(&frame))?;
            }
            Command::Extended => warn!("phasor server received unsupported Extended command"),
        }
        Ok(())
    }

    fn build_config_frame(&self) -> ConfigFrame {
        let (soc, fracsec) = codec::soc_fracsec(crate::types::wall_now_us());
        ConfigFrame {
            idcode: self.identity.idcode,
            soc,
            fracsec,
            time_base: TIME_BASE,
            station: self.identity.station_config(self.cfgcnt),
            data_rate: self.identity.data_rate as i16,
        }
    }

    fn write_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        let Some(client) = self.client.as_mut() else { return Ok(()) };
        match client.write_all(&frame) {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("phasor server write error, dropping client: {e}");
                self.client = None;
                self.send_data = false;
                self.set_state(self.state - ServerState::CONNECTED - ServerState::DATA_SENDING);
                Err(PmuError::ClientIo(e))
            }
        }
    }

    fn emit_data_frame(&mut self) {
        if !self.send_data || self.client.is_none() {
            return;
        }
        let estimation = self.processor.current_estimation();
        let (soc, fracsec) = codec::soc_fracsec(crate::types::wall_now_us());
        let frame = DataFrame {
            idcode: self.identity.idcode,
            soc,
            fracsec,
            stat: STAT_SYNC_OK,
            phasors: estimation.phasors,
            freq: estimation.frequencies[0],
            dfreq: estimation.rocofs[0],
            fnom_50hz: self.identity.fnom_50hz,
        };
        let packed = codec::pack_data_frame(&frame, self.identity.format);
        let _ = self.write_frame(packed);
    }

    /// One tick of the server's per-connection work: accept, read, dispatch, emit.
    pub fn tick(&mut self) {
        self.ensure_listening();
        self.accept_pending();
        let _ = self.handle_client_input();
        self.emit_data_frame();
    }

    /// Runs ticks at `1000/data_rate` ms until `keep_running` clears.
    pub fn run(&mut self) {
        let tick_interval = Duration::from_millis(1000 / self.identity.data_rate.max(1) as u64);
        while self.keep_running.load(Ordering::SeqCst) {
            self.tick();
            std::thread::sleep(tick_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::DataProcessor;
    use crate::source::MockSampleSource;
    use std::io::Read as _;
    use std::net::TcpStream as ClientStream;

    fn spawn_server() -> (PhasorServer, String) {
        let mut mock = MockSampleSource::new();
        mock.expect_read().returning(|| Ok(Vec::new()));
        let estimator = crate::estimator::Estimator::new(1200, 50).unwrap();
        let keep_running = Arc::new(AtomicBool::new(true));
        let processor = DataProcessor::new(Box::new(mock), estimator, keep_running.clone());
        let handle = processor.handle();

        let mut server = PhasorServer::new("127.0.0.1:0", PmuIdentity::default_identity(), handle, keep_running);
        server.ensure_listening();
        let addr = server.listener.as_ref().unwrap().local_addr().unwrap().to_string();
        (server, addr)
    }

    #[test]
    fn accepts_a_client_and_sets_connected() {
        let (mut server, addr) = spawn_server();
        let _client = ClientStream::connect(&addr).unwrap();
        server.accept_pending();
        assert!(server.state.contains(ServerState::CONNECTED));
    }

    #[test]
    fn start_and_stop_data_commands_toggle_data_sending() {
        let (mut server, addr) = spawn_server();
        let mut client = ClientStream::connect(&addr).unwrap();
        server.accept_pending();

        let start = codec::pack_command(&CommandFrame {
            idcode: 17,
            soc: 0,
            fracsec: 0,
            command: Command::StartData,
            extra: Vec::new(),
        });
        client.write_all(&start).unwrap();
        server.handle_client_input().unwrap();
        assert!(server.state.contains(ServerState::DATA_SENDING));

        let stop = codec::pack_command(&CommandFrame {
            idcode: 17,
            soc: 0,
            fracsec: 0,
            command: Command::StopData,
            extra: Vec::new(),
        });
        client.write_all(&stop).unwrap();
        server.handle_client_input().unwrap();
        assert!(!server.state.contains(ServerState::DATA_SENDING));
    }

    #[test]
    fn send_cfg1_writes_exactly_one_frame_with_no_data_interleaved() {
        let (mut server, addr) = spawn_server();
        let mut client = ClientStream::connect(&addr).unwrap();
        server.accept_pending();
        server.send_data = true; // simulate already-streaming state

        let cmd = codec::pack_command(&CommandFrame {
            idcode: 17,
            soc: 0,
            fracsec: 0,
            command: Command::SendConfig1,
            extra: Vec::new(),
        });
        client.write_all(&cmd).unwrap();
        server.handle_client_input().unwrap();

        let mut buf = vec![0u8; 512];
        client.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        let n = client.read(&mut buf).unwrap();
        assert_eq!(codec::peek_frame_type(&buf[..n]).unwrap(), codec::FrameType::Config1);
    }

    #[test]
    fn client_disconnect_returns_to_listening() {
        let (mut server, addr) = spawn_server();
        let client = ClientStream::connect(&addr).unwrap();
        server.accept_pending();
        assert!(server.state.contains(ServerState::CONNECTED));

        drop(client);
        // give the OS a moment to tear down the connection
        std::thread::sleep(Duration::from_millis(50));
        server.handle_client_input().unwrap();
        assert!(!server.state.contains(ServerState::CONNECTED));
        assert!(server.state.contains(ServerState::LISTENING));
    }
}
