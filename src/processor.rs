//! Data Processor: the acquisition thread. Owns the authoritative
//! `Sample`/`Estimation` pair and the 32-deep sample store.

use crate::error::Result;
use crate::estimator::Estimator;
use crate::server::{PhasorServer, PmuIdentity};
use crate::source::SampleSource;
use crate::types::{Estimation, Sample};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

pub const SAMPLE_STORE_LEN: usize = 32;

#[derive(Clone, Default)]
struct Latest {
    sample: Sample,
    estimation: Estimation,
}

/// Thread-safe handle shared between the acquisition thread and its readers
/// (the Phasor Server, the main/UI thread).
#[derive(Clone)]
pub struct ProcessorHandle {
    latest: Arc<Mutex<Latest>>,
    store: Arc<Mutex<[Sample; SAMPLE_STORE_LEN]>>,
}

impl ProcessorHandle {
    pub fn current_estimation(&self) -> Estimation {
        self.latest.lock().unwrap().estimation
    }

    pub fn current_sample_store(&self) -> [Sample; SAMPLE_STORE_LEN] {
        *self.store.lock().unwrap()
    }

    pub fn get_current(&self, out_sample: &mut Sample, out_estimation: &mut Estimation) {
        let latest = self.latest.lock().unwrap();
        *out_sample = latest.sample;
        *out_estimation = latest.estimation;
    }
}

/// Runs the read → estimate → publish loop on the calling thread until
/// `keep_running` is cleared.
pub struct DataProcessor {
    source: Box<dyn SampleSource>,
    estimator: Estimator,
    latest: Arc<Mutex<Latest>>,
    store: Arc<Mutex<[Sample; SAMPLE_STORE_LEN]>>,
    keep_running: Arc<AtomicBool>,
}

impl DataProcessor {
    pub fn new(source: Box<dyn SampleSource>, estimator: Estimator, keep_running: Arc<AtomicBool>) -> Self {
        DataProcessor {
            source,
            estimator,
            latest: Arc::new(Mutex::new(Latest::default())),
            store: Arc::new(Mutex::new([Sample::default(); SAMPLE_STORE_LEN])),
            keep_running,
        }
    }

    pub fn handle(&self) -> ProcessorHandle {
        ProcessorHandle { latest: self.latest.clone(), store: self.store.clone() }
    }

    /// One iteration of the acquisition loop: read, estimate, publish.
    /// Returns the number of samples processed (0 on a transient empty read).
    pub fn process_loop_iteration(&mut self) -> Result<usize> {
        let samples = match self.source.read() {
            Ok(samples) => samples,
            Err(e) => {
                warn!("sample source read error: {e}");
                return Ok(0);
            }
        };

        for sample in &samples {
            let estimation = self.estimator.update(sample);
            {
                let mut store = self.store.lock().unwrap();
                store.rotate_left(1);
                store[SAMPLE_STORE_LEN - 1] = *sample;
            }
            {
                let mut latest = self.latest.lock().unwrap();
                latest.sample = *sample;
                latest.estimation = estimation;
            }
        }
        Ok(samples.len())
    }

    pub fn run(&mut self) -> Result<()> {
        while self.keep_running.load(Ordering::SeqCst) {
            self.process_loop_iteration()?;
        }
        Ok(())
    }
}

/// Owns the Phasor Server's worker thread and lets it be torn down and
/// rebuilt in place, e.g. when the `network/socket` setting changes.
pub struct PhasorServerSupervisor {
    listen_addr: String,
    handle: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

impl PhasorServerSupervisor {
    pub fn spawn(listen_addr: impl Into<String>, identity: PmuIdentity, processor: ProcessorHandle) -> Self {
        let listen_addr = listen_addr.into();
        let stop = Arc::new(AtomicBool::new(true));
        let handle = Some(Self::start_thread(listen_addr.clone(), identity, processor, stop.clone()));
        PhasorServerSupervisor { listen_addr, handle, stop }
    }

    fn start_thread(
        listen_addr: String,
        identity: PmuIdentity,
        processor: ProcessorHandle,
        stop: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut server = PhasorServer::new(listen_addr, identity, processor, stop);
            server.run();
        })
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    /// Shuts the running server down (clears its stop flag, joins its
    /// thread), then starts a fresh one bound to `listen_addr`.
    pub fn replace_phasor_server(
        &mut self,
        listen_addr: impl Into<String>,
        identity: PmuIdentity,
        processor: ProcessorHandle,
    ) {
        self.stop_current();
        let listen_addr = listen_addr.into();
        info!("replacing phasor server, new listen address {listen_addr}");
        let stop = Arc::new(AtomicBool::new(true));
        self.handle = Some(Self::start_thread(listen_addr.clone(), identity, processor, stop.clone()));
        self.listen_addr = listen_addr;
        self.stop = stop;
    }

    /// Stops the running server and joins its thread. Safe to call more
    /// than once.
    pub fn stop_current(&mut self) {
        self.stop.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PhasorServerSupervisor {
    fn drop(&mut self) {
        self.stop_current();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MockSampleSource;

    fn sample(seq: u64, ch0: u16) -> Sample {
        Sample { seq, channels: [ch0, 0, 0, 0, 0, 0], timestamp_us: seq as i64 * 833, time_delta_us: 833 }
    }

    #[test]
    fn publishes_latest_sample_and_estimation() {
        let mut mock = MockSampleSource::new();
        let mut seq = 0u64;
        mock.expect_read().returning(move || {
            seq += 1;
            Ok(vec![sample(seq, 100)])
        });

        let estimator = Estimator::new(1200, 50).unwrap();
        let keep_running = Arc::new(AtomicBool::new(true));
        let mut processor = DataProcessor::new(Box::new(mock), estimator, keep_running);
        let handle = processor.handle();

        for _ in 0..3 {
            processor.process_loop_iteration().unwrap();
        }

        let store = handle.current_sample_store();
        assert_eq!(store[SAMPLE_STORE_LEN - 1].seq, 3);
        assert_eq!(store[SAMPLE_STORE_LEN - 2].seq, 2);
    }

    #[test]
    fn transient_read_error_does_not_stop_the_loop() {
        let mut mock = MockSampleSource::new();
        mock.expect_read()
            .times(1)
            .returning(|| Err(crate::error::PmuError::SourceRead(std::io::Error::other("boom"))));
        mock.expect_read().returning(|| Ok(vec![sample(1, 1)]));

        let estimator = Estimator::new(1200, 50).unwrap();
        let keep_running = Arc::new(AtomicBool::new(true));
        let mut processor = DataProcessor::new(Box::new(mock), estimator, keep_running);
        assert_eq!(processor.process_loop_iteration().unwrap(), 0);
        assert_eq!(processor.process_loop_iteration().unwrap(), 1);
    }

    fn processor_handle() -> ProcessorHandle {
        let mut mock = MockSampleSource::new();
        mock.expect_read().returning(|| Ok(Vec::new()));
        let estimator = Estimator::new(1200, 50).unwrap();
        let keep_running = Arc::new(AtomicBool::new(true));
        DataProcessor::new(Box::new(mock), estimator, keep_running).handle()
    }

    #[test]
    fn replace_phasor_server_binds_a_new_address_and_stops_the_old_one() {
        use std::net::TcpStream;
        use std::time::Duration;

        // fixed, distinct ports: a real deployment reads these from settings,
        // so an ephemeral ":0" address (which can't be read back from here)
        // would not exercise the same path.
        let first_addr = "127.0.0.1:47712";
        let second_addr = "127.0.0.1:47713";

        let handle = processor_handle();
        let mut supervisor = PhasorServerSupervisor::spawn(first_addr, PmuIdentity::default_identity(), handle.clone());
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(supervisor.listen_addr(), first_addr);
        assert!(TcpStream::connect(first_addr).is_ok());

        supervisor.replace_phasor_server(second_addr, PmuIdentity::default_identity(), handle);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(supervisor.listen_addr(), second_addr);
        assert!(TcpStream::connect(second_addr).is_ok());
        // the old listener's thread has been joined and torn down.
        assert!(TcpStream::connect(first_addr).is_err());

        supervisor.stop_current();
    }
}
