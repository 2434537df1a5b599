//! In-memory printer and central for tests and demos without hardware.
//!
//! [`MockPrinter`] speaks the [`FramedEncoder`](crate::protocol::FramedEncoder)
//! protocol from the device side and records everything the host sends.
//! [`MockCentral`] hands out mock printers and lets a [`MockController`]
//! inject discoveries and link drops.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::lock;
use crate::protocol::{
    build_packet, parse_packet, JobHeader, Packet, PrinterFault, PrinterState, PrinterStatus,
    CMD_CANCEL, CMD_JOB_END, CMD_JOB_START, CMD_PAGE_DONE, CMD_PAGE_END, CMD_STATUS,
};
use crate::transport::{Central, CentralEvent, Peripheral, PeripheralId, Transport};

/// How a mock printer reacts to the host.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Reported on status requests.
    pub status: PrinterStatus,
    pub reject_jobs: bool,
    /// Run out of paper once this many labels are printed on the link.
    pub fail_after: Option<u32>,
    /// Time each label takes to come out.
    pub label_delay: Duration,
    /// When false the printer never answers.
    pub respond: bool,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            status: PrinterStatus {
                battery_percent: Some(100),
                temperature: Some(25),
                state: PrinterState::Standby,
                fault: None,
            },
            reject_jobs: false,
            fail_after: None,
            label_delay: Duration::ZERO,
            respond: true,
        }
    }
}

/// What the host sent to a mock printer.
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    pub control: Vec<Packet>,
    /// Raster bytes from every data write, in order.
    pub data: Vec<u8>,
    pub headers: Vec<JobHeader>,
    pub disconnected: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MockLogHandle(Arc<Mutex<MockLog>>);

impl MockLogHandle {
    pub fn snapshot(&self) -> MockLog {
        lock(&self.0).clone()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockLog) -> R) -> R {
        f(&mut lock(&self.0))
    }
}

/// Device side of one link.
pub struct MockPrinter {
    behavior: MockBehavior,
    log: MockLogHandle,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Labels printed in the current job.
    printed: Arc<AtomicU32>,
    /// Labels printed since the link opened.
    fed: Arc<AtomicU32>,
    job: Option<JobHeader>,
    labels: CancellationToken,
    dropped: Arc<AtomicBool>,
}

impl MockPrinter {
    pub fn new(behavior: MockBehavior) -> (Self, MockLogHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = MockLogHandle::default();
        let printer = Self {
            behavior,
            log: log.clone(),
            tx,
            rx,
            printed: Arc::new(AtomicU32::new(0)),
            fed: Arc::new(AtomicU32::new(0)),
            job: None,
            labels: CancellationToken::new(),
            dropped: Arc::new(AtomicBool::new(false)),
        };
        (printer, log)
    }

    fn check_link(&self) -> Result<()> {
        if self.dropped.load(Ordering::SeqCst) {
            return Err(Error::Connection("peripheral disconnected".into()));
        }
        Ok(())
    }

    fn reply(&self, command_id: u8, payload: &[u8]) {
        if self.behavior.respond {
            let _ = self.tx.send(build_packet(command_id, payload));
        }
    }

    fn handle(&mut self, packet: Packet) -> Result<()> {
        match packet.command_id {
            CMD_STATUS => self.reply(CMD_STATUS, &self.behavior.status.to_payload()),
            CMD_JOB_START => {
                let header = JobHeader::from_payload(&packet.payload)?;
                self.log.with(|log| log.headers.push(header.clone()));
                if self.behavior.reject_jobs {
                    self.reply(CMD_JOB_START, &[0x01]);
                } else {
                    self.printed.store(0, Ordering::SeqCst);
                    self.labels = CancellationToken::new();
                    self.job = Some(header);
                    self.reply(CMD_JOB_START, &[0x00]);
                }
            }
            CMD_PAGE_END => {
                let Some(job) = &self.job else {
                    return Err(Error::Protocol("page end outside a job".into()));
                };
                let labels = if job.pages >= job.copies { 1 } else { job.copies as u32 };
                self.print_labels(labels);
            }
            CMD_CANCEL => {
                self.labels.cancel();
                self.job = None;
                self.reply(CMD_CANCEL, &[0x00]);
            }
            CMD_JOB_END => self.job = None,
            other => debug!(command = other, "mock printer ignoring packet"),
        }
        Ok(())
    }

    fn print_labels(&self, count: u32) {
        if !self.behavior.respond {
            return;
        }
        let behavior = self.behavior.clone();
        let tx = self.tx.clone();
        let counters = (self.printed.clone(), self.fed.clone());
        if behavior.label_delay.is_zero() {
            for _ in 0..count {
                if !print_label(&behavior, &tx, &counters) {
                    break;
                }
            }
            return;
        }
        let stop = self.labels.clone();
        tokio::spawn(async move {
            for _ in 0..count {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(behavior.label_delay) => {}
                }
                if !print_label(&behavior, &tx, &counters) {
                    return;
                }
            }
        });
    }
}

/// Push out one label, or a paper-out status once the roll is empty.
fn print_label(
    behavior: &MockBehavior,
    tx: &mpsc::UnboundedSender<Vec<u8>>,
    (printed, fed): &(Arc<AtomicU32>, Arc<AtomicU32>),
) -> bool {
    if behavior
        .fail_after
        .is_some_and(|limit| fed.load(Ordering::SeqCst) >= limit)
    {
        let status = PrinterStatus {
            fault: Some(PrinterFault::NoPaper),
            ..behavior.status.clone()
        };
        let _ = tx.send(build_packet(CMD_STATUS, &status.to_payload()));
        return false;
    }
    fed.fetch_add(1, Ordering::SeqCst);
    let done = printed.fetch_add(1, Ordering::SeqCst) + 1;
    let _ = tx.send(build_packet(CMD_PAGE_DONE, &(done as u16).to_le_bytes()));
    true
}

#[async_trait]
impl Transport for MockPrinter {
    async fn write_control(&mut self, data: &[u8]) -> Result<()> {
        self.check_link()?;
        let packet = parse_packet(data)?;
        self.log.with(|log| log.control.push(packet.clone()));
        self.handle(packet)
    }

    async fn write_data(&mut self, data: &[u8]) -> Result<()> {
        self.check_link()?;
        self.log.with(|log| log.data.extend_from_slice(data));
        Ok(())
    }

    async fn read_notification(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        self.check_link()?;
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) => Err(Error::Connection("notification channel closed".into())),
            Err(_) => Err(Error::Timeout("notification")),
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.labels.cancel();
        self.log.with(|log| log.disconnected = true);
        Ok(())
    }
}

struct Shared {
    advertised: Mutex<Vec<Peripheral>>,
    unreachable: Mutex<HashSet<PeripheralId>>,
    behavior: Mutex<MockBehavior>,
    links: Mutex<HashMap<PeripheralId, (MockLogHandle, Arc<AtomicBool>)>>,
    events: mpsc::UnboundedSender<CentralEvent>,
    scanning: AtomicBool,
    connects: AtomicU32,
    connect_delay: Mutex<Duration>,
}

/// Central that connects to [`MockPrinter`]s.
pub struct MockCentral {
    shared: Arc<Shared>,
    events: Mutex<Option<mpsc::UnboundedReceiver<CentralEvent>>>,
}

impl Default for MockCentral {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCentral {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                advertised: Mutex::new(Vec::new()),
                unreachable: Mutex::new(HashSet::new()),
                behavior: Mutex::new(MockBehavior::default()),
                links: Mutex::new(HashMap::new()),
                events: tx,
                scanning: AtomicBool::new(false),
                connects: AtomicU32::new(0),
                connect_delay: Mutex::new(Duration::ZERO),
            }),
            events: Mutex::new(Some(rx)),
        }
    }

    /// Advertise `peripheral` whenever a scan starts.
    pub fn with_peripheral(self, peripheral: Peripheral) -> Self {
        lock(&self.shared.advertised).push(peripheral);
        self
    }

    /// Connections to `id` fail.
    pub fn with_unreachable(self, id: impl Into<PeripheralId>) -> Self {
        lock(&self.shared.unreachable).insert(id.into());
        self
    }

    /// Behavior of printers connected from now on.
    pub fn with_behavior(self, behavior: MockBehavior) -> Self {
        *lock(&self.shared.behavior) = behavior;
        self
    }

    /// Every connection attempt takes this long.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *lock(&self.shared.connect_delay) = delay;
        self
    }

    pub fn controller(&self) -> MockController {
        MockController {
            shared: self.shared.clone(),
        }
    }
}

#[async_trait]
impl Central for MockCentral {
    type Link = MockPrinter;

    async fn events(&self) -> Result<BoxStream<'static, CentralEvent>> {
        let rx = lock(&self.events)
            .take()
            .ok_or_else(|| Error::Connection("event stream already taken".into()))?;
        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed())
    }

    async fn start_scan(&self) -> Result<()> {
        self.shared.scanning.store(true, Ordering::SeqCst);
        for peripheral in lock(&self.shared.advertised).iter() {
            let _ = self.shared.events.send(CentralEvent::Discovered(peripheral.clone()));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.shared.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, peripheral: &Peripheral) -> Result<MockPrinter> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.shared.connect_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if lock(&self.shared.unreachable).contains(&peripheral.id) {
            return Err(Error::Connection(format!("{} did not respond", peripheral.id)));
        }
        let behavior = lock(&self.shared.behavior).clone();
        let (printer, log) = MockPrinter::new(behavior);
        lock(&self.shared.links).insert(peripheral.id.clone(), (log, printer.dropped.clone()));
        Ok(printer)
    }
}

/// Test-side handle onto a [`MockCentral`] after it moved into the SDK.
#[derive(Clone)]
pub struct MockController {
    shared: Arc<Shared>,
}

impl MockController {
    /// Deliver an advertisement, scanning or not.
    pub fn advertise(&self, peripheral: Peripheral) {
        let _ = self.shared.events.send(CentralEvent::Discovered(peripheral));
    }

    /// The printer goes away: its link starts failing and a disconnect is reported.
    pub fn drop_link(&self, id: &PeripheralId) {
        if let Some((_, dropped)) = lock(&self.shared.links).get(id) {
            dropped.store(true, Ordering::SeqCst);
        }
        let _ = self.shared.events.send(CentralEvent::Disconnected(id.clone()));
    }

    /// Report a disconnect for `id` without touching its link, like a late
    /// platform event for a connection that was already replaced.
    pub fn report_disconnect(&self, id: &PeripheralId) {
        let _ = self.shared.events.send(CentralEvent::Disconnected(id.clone()));
    }

    /// Log of the most recent link to `id`.
    pub fn log(&self, id: &PeripheralId) -> Option<MockLog> {
        lock(&self.shared.links).get(id).map(|(log, _)| log.snapshot())
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *lock(&self.shared.behavior) = behavior;
    }

    pub fn is_scanning(&self) -> bool {
        self.shared.scanning.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> u32 {
        self.shared.connects.load(Ordering::SeqCst)
    }
}
