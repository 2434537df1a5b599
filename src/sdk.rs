//! The SDK facade: discovery, one printer connection at a time, and print
//! jobs with a guaranteed single outcome.
//!
//! Events go out on a [`broadcast`] channel from [`PrinterSdk::subscribe`].
//! They are sent while the connection state is locked, so every receiver
//! sees them in the order the state changed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use futures::stream::{BoxStream, StreamExt};
use image::GrayImage;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::config::SdkConfig;
use crate::device::{DeviceCatalog, DeviceModel};
use crate::error::{Error, Result};
use crate::fetch::resolve_remote_images;
use crate::font::FontBook;
use crate::lock;
use crate::model::PrintJobConfig;
use crate::protocol::{CommandEncoder, FramedEncoder, PrinterStatus};
use crate::raster::Rasterizer;
use crate::session::{request_status, PageJob, PrintProgress, PrintSession, SessionOptions};
use crate::transport::{Central, CentralEvent, Peripheral, PeripheralId, Transport};

/// Who ended a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    /// The application called disconnect, or connected elsewhere.
    Local,
    /// The printer went away.
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdkEvent {
    /// First sighting of a printer during the current scan.
    DeviceFound(Peripheral),
    Connected(Peripheral),
    ConnectFailed { peripheral: Peripheral, reason: String },
    Disconnected { peripheral: Peripheral, initiator: Initiator },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Final result of a print job. Every job produces exactly one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintOutcome {
    pub status: JobStatus,
    /// Why the job did not complete.
    pub message: Option<String>,
    pub printed: u32,
    pub total: u32,
}

impl PrintOutcome {
    fn completed(total: u32) -> Self {
        Self {
            status: JobStatus::Completed,
            message: None,
            printed: total,
            total,
        }
    }

    fn failed(message: impl Into<String>, printed: u32, total: u32) -> Self {
        Self {
            status: JobStatus::Failed,
            message: Some(message.into()),
            printed,
            total,
        }
    }

    fn cancelled(printed: u32, total: u32) -> Self {
        Self {
            status: JobStatus::Cancelled,
            message: Some(Error::Cancelled.to_string()),
            printed,
            total,
        }
    }

    pub fn success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// A submitted print job.
pub struct PrintHandle {
    job_id: Uuid,
    outcome: oneshot::Receiver<PrintOutcome>,
    progress: watch::Receiver<PrintProgress>,
}

impl PrintHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Live label count.
    pub fn progress(&self) -> watch::Receiver<PrintProgress> {
        self.progress.clone()
    }

    pub async fn outcome(self) -> PrintOutcome {
        let PrintProgress { printed, total } = *self.progress.borrow();
        self.outcome
            .await
            .unwrap_or_else(|_| PrintOutcome::failed("print task ended without reporting", printed, total))
    }
}

enum Phase {
    Disconnected,
    /// A connect is in flight; cancelling the token abandons it.
    Connecting(Peripheral, CancellationToken),
    Connected(Peripheral),
}

struct ActiveJob {
    id: Uuid,
    cancel: CancellationToken,
}

struct State {
    phase: Phase,
    /// Bumped on every successful connect; ties a link to its connection.
    session: u64,
    job: Option<ActiveJob>,
}

struct Inner<C: Central> {
    central: C,
    config: SdkConfig,
    encoder: Arc<dyn CommandEncoder>,
    fonts: RwLock<Arc<FontBook>>,
    http: reqwest::Client,
    events: broadcast::Sender<SdkEvent>,
    state: std::sync::Mutex<State>,
    link: tokio::sync::Mutex<Option<(u64, C::Link)>>,
    scanning: AtomicBool,
    seen: std::sync::Mutex<HashSet<PeripheralId>>,
    /// When each peripheral was last hung up locally.
    hang_ups: std::sync::Mutex<HashMap<PeripheralId, Instant>>,
    devices: RwLock<DeviceCatalog>,
}

/// Entry point: scan, connect, print.
///
/// Cheap to clone; clones share one connection.
pub struct PrinterSdk<C: Central> {
    inner: Arc<Inner<C>>,
}

impl<C: Central> Clone for PrinterSdk<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Central> PrinterSdk<C> {
    /// Start the SDK on `central` with the default framed protocol.
    pub async fn new(central: C, config: SdkConfig) -> Result<Self> {
        Self::with_encoder(central, config, Arc::new(FramedEncoder)).await
    }

    pub async fn with_encoder(central: C, config: SdkConfig, encoder: Arc<dyn CommandEncoder>) -> Result<Self> {
        let stream = central.events().await?;
        let http = reqwest::Client::builder().timeout(config.http_timeout).build()?;
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let mut devices = DeviceCatalog::new();
        for model in &config.devices {
            devices.register(model.clone());
        }
        let inner = Arc::new(Inner {
            central,
            config,
            encoder,
            fonts: RwLock::new(Arc::new(FontBook::new())),
            http,
            events,
            state: std::sync::Mutex::new(State {
                phase: Phase::Disconnected,
                session: 0,
                job: None,
            }),
            link: tokio::sync::Mutex::new(None),
            scanning: AtomicBool::new(false),
            seen: std::sync::Mutex::new(HashSet::new()),
            hang_ups: std::sync::Mutex::new(HashMap::new()),
            devices: RwLock::new(devices),
        });
        tokio::spawn(pump(Arc::downgrade(&inner), stream));
        Ok(Self { inner })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SdkEvent> {
        self.inner.events.subscribe()
    }

    pub fn config(&self) -> &SdkConfig {
        &self.inner.config
    }

    /// Make `name` available to text elements. The first face registered
    /// is the fallback for unknown names.
    pub fn register_font(&self, name: impl Into<String>, bytes: Vec<u8>) -> Result<()> {
        let mut fonts = self.inner.fonts.write().unwrap_or_else(|e| e.into_inner());
        let mut book = FontBook::clone(&fonts);
        book.register(name, bytes)?;
        *fonts = Arc::new(book);
        Ok(())
    }

    pub fn set_fonts(&self, book: FontBook) {
        *self.inner.fonts.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(book);
    }

    /// Start continuous discovery. Each printer is reported once per scan.
    pub async fn start_scan(&self) -> Result<()> {
        lock(&self.inner.seen).clear();
        self.inner.scanning.store(true, Ordering::SeqCst);
        if let Err(e) = self.inner.central.start_scan().await {
            self.inner.scanning.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!("scan started");
        Ok(())
    }

    pub async fn stop_scan(&self) -> Result<()> {
        if self.inner.scanning.swap(false, Ordering::SeqCst) {
            self.inner.central.stop_scan().await?;
            info!("scan stopped");
        }
        Ok(())
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.scanning.load(Ordering::SeqCst)
    }

    /// Connect to `peripheral`, stopping any scan first. Every call
    /// produces exactly one `Connected` or `ConnectFailed` event.
    ///
    /// Connecting while connected to another printer drops that link
    /// first. Connecting during a print or another connect fails. A
    /// [`disconnect`](Self::disconnect) of the same printer abandons the
    /// attempt, which then fails.
    #[instrument(skip(self), fields(id = %peripheral.id))]
    pub async fn connect(&self, peripheral: &Peripheral) -> Result<()> {
        let inner = &self.inner;
        let attempt = CancellationToken::new();
        let stale = {
            let mut state = lock(&inner.state);
            if state.job.is_some() {
                return Err(inner.connect_failed(peripheral, Error::Busy("a print job is in progress".into())));
            }
            let connecting = Phase::Connecting(peripheral.clone(), attempt.clone());
            match std::mem::replace(&mut state.phase, connecting) {
                Phase::Connecting(pending, token) => {
                    state.phase = Phase::Connecting(pending, token);
                    return Err(inner.connect_failed(
                        peripheral,
                        Error::Busy("another connection attempt is in progress".into()),
                    ));
                }
                Phase::Connected(current) if current.id == peripheral.id => {
                    inner.emit(SdkEvent::Connected(current.clone()));
                    state.phase = Phase::Connected(current);
                    return Ok(());
                }
                Phase::Connected(current) => {
                    info!(previous = %current.id, "switching printers");
                    inner.note_hang_up(&current.id);
                    inner.emit(SdkEvent::Disconnected {
                        peripheral: current,
                        initiator: Initiator::Local,
                    });
                    Some(state.session)
                }
                Phase::Disconnected => None,
            }
        };
        if let Some(session) = stale {
            inner.drop_link(session, true).await;
        }
        if let Err(e) = self.stop_scan().await {
            debug!(error = %e, "stopping scan before connect");
        }

        let connected = tokio::select! {
            _ = attempt.cancelled() => Err(connect_cancelled()),
            result = inner.central.connect(peripheral) => result,
        };
        let link = match connected {
            Ok(link) => link,
            Err(e) => {
                let mut state = lock(&inner.state);
                state.phase = Phase::Disconnected;
                return Err(inner.connect_failed(peripheral, e));
            }
        };

        let mut slot = inner.link.lock().await;
        let abandoned = {
            let mut state = lock(&inner.state);
            if attempt.is_cancelled() {
                state.phase = Phase::Disconnected;
                inner.note_hang_up(&peripheral.id);
                Some((link, inner.connect_failed(peripheral, connect_cancelled())))
            } else {
                state.session += 1;
                state.phase = Phase::Connected(peripheral.clone());
                *slot = Some((state.session, link));
                inner.emit(SdkEvent::Connected(peripheral.clone()));
                None
            }
        };
        drop(slot);
        match abandoned {
            None => {
                info!("connected");
                Ok(())
            }
            Some((mut link, error)) => {
                if let Err(e) = link.disconnect().await {
                    warn!(error = %e, "hanging up abandoned link failed");
                }
                Err(error)
            }
        }
    }

    /// Disconnect from `peripheral`, cancelling any print in flight.
    ///
    /// While a connect to `peripheral` is pending this abandons it: the
    /// pending [`connect`](Self::connect) fails with a single
    /// `ConnectFailed` and no `Disconnected` event is sent.
    #[instrument(skip(self), fields(id = %peripheral.id))]
    pub async fn disconnect(&self, peripheral: &Peripheral) -> Result<()> {
        let session = {
            let mut state = lock(&self.inner.state);
            let current = match std::mem::replace(&mut state.phase, Phase::Disconnected) {
                Phase::Connected(current) if current.id == peripheral.id => current,
                Phase::Connecting(pending, attempt) if pending.id == peripheral.id => {
                    info!("abandoning connection attempt");
                    attempt.cancel();
                    state.phase = Phase::Connecting(pending, attempt);
                    return Ok(());
                }
                other => {
                    state.phase = other;
                    return Err(Error::NotConnected);
                }
            };
            if let Some(job) = &state.job {
                job.cancel.cancel();
            }
            self.inner.note_hang_up(&current.id);
            self.inner.emit(SdkEvent::Disconnected {
                peripheral: current,
                initiator: Initiator::Local,
            });
            state.session
        };
        self.inner.drop_link(session, true).await;
        info!("disconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        matches!(lock(&self.inner.state).phase, Phase::Connected(_))
    }

    pub fn connected_peripheral(&self) -> Option<Peripheral> {
        match &lock(&self.inner.state).phase {
            Phase::Connected(p) => Some(p.clone()),
            _ => None,
        }
    }

    /// Ask the connected printer for its status. Fails while printing.
    pub async fn query_status(&self) -> Result<PrinterStatus> {
        let session = {
            let state = lock(&self.inner.state);
            if state.job.is_some() {
                return Err(Error::Busy("a print job is in progress".into()));
            }
            match state.phase {
                Phase::Connected(_) => state.session,
                _ => return Err(Error::NotConnected),
            }
        };
        let mut slot = self.inner.link.lock().await;
        let link = match slot.as_mut() {
            Some((s, link)) if *s == session => link,
            _ => return Err(Error::NotConnected),
        };
        request_status(link, self.inner.encoder.as_ref(), self.inner.config.ack_timeout).await
    }

    /// Submit a job. It runs in the background; the returned handle
    /// resolves to its outcome. Must be called within a tokio runtime.
    pub fn print(&self, job: PrintJobConfig) -> PrintHandle {
        let job_id = Uuid::new_v4();
        let total = job.total_labels();
        let (done_tx, done_rx) = oneshot::channel();
        let (progress_tx, progress_rx) = watch::channel(PrintProgress { printed: 0, total });
        let handle = PrintHandle {
            job_id,
            outcome: done_rx,
            progress: progress_rx,
        };

        let cancel = CancellationToken::new();
        let admitted = {
            let mut state = lock(&self.inner.state);
            match (&state.phase, &state.job) {
                (_, Some(_)) => Err("a print job is already in progress"),
                (Phase::Connected(_), None) => {
                    state.job = Some(ActiveJob {
                        id: job_id,
                        cancel: cancel.clone(),
                    });
                    Ok(state.session)
                }
                _ => Err("printer not connected"),
            }
        };
        match admitted {
            Ok(session) => {
                let span = info_span!("print", job = %job_id, labels = total);
                let inner = self.inner.clone();
                tokio::spawn(
                    async move {
                        let outcome = inner.run_job(job, job_id, session, cancel, progress_tx).await;
                        let _ = done_tx.send(outcome);
                    }
                    .instrument(span),
                );
            }
            Err(reason) => {
                warn!(job = %job_id, reason, "print refused");
                let _ = done_tx.send(PrintOutcome::failed(reason, 0, total));
            }
        }
        handle
    }

    /// Callback form of [`print`](Self::print). `on_complete` runs exactly
    /// once on a runtime worker.
    pub fn print_with<F>(&self, job: PrintJobConfig, on_complete: F) -> Uuid
    where
        F: FnOnce(PrintOutcome) + Send + 'static,
    {
        let handle = self.print(job);
        let job_id = handle.job_id();
        tokio::spawn(async move { on_complete(handle.outcome().await) });
        job_id
    }

    /// Cancel the running job. Returns false if nothing was printing.
    pub fn cancel_print(&self) -> bool {
        match &lock(&self.inner.state).job {
            Some(job) => {
                info!(job = %job.id, "cancel requested");
                job.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_printing(&self) -> bool {
        lock(&self.inner.state).job.is_some()
    }

    /// Render the label as designed, downloading remote images first.
    /// Multi-page jobs render one preview per page.
    pub async fn preview(&self, job: PrintJobConfig) -> Result<GrayImage> {
        self.preview_pages(job)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidJob("job has no pages".into()))
    }

    pub async fn preview_pages(&self, mut job: PrintJobConfig) -> Result<Vec<GrayImage>> {
        job.validate()?;
        resolve_remote_images(&self.inner.http, &mut job).await?;
        let fonts = self.inner.fonts();
        let rasterizer = Rasterizer::new(&fonts, self.inner.config.dots_per_mm);
        job.page_jobs()
            .iter()
            .map(|(page, _)| rasterizer.render_preview(page))
            .collect()
    }

    /// Teach the SDK a product model for [`device_name`](Self::device_name)
    /// and [`device_image`](Self::device_image).
    pub fn register_device_model(&self, model: DeviceModel) {
        self.inner.devices.write().unwrap_or_else(|e| e.into_inner()).register(model);
    }

    pub fn device_name(&self, peripheral_name: Option<&str>) -> String {
        self.inner.devices.read().unwrap_or_else(|e| e.into_inner()).device_name(peripheral_name)
    }

    pub fn device_image(&self, peripheral_name: Option<&str>) -> String {
        self.inner.devices.read().unwrap_or_else(|e| e.into_inner()).device_image(peripheral_name)
    }
}

fn connect_cancelled() -> Error {
    Error::Connection("connection attempt cancelled".into())
}

async fn pump<C: Central>(inner: Weak<Inner<C>>, mut events: BoxStream<'static, CentralEvent>) {
    while let Some(event) = events.next().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            CentralEvent::Discovered(peripheral) => inner.on_discovered(peripheral),
            CentralEvent::Disconnected(id) => inner.on_link_lost(&id),
        }
    }
    debug!("central event stream ended");
}

impl<C: Central> Inner<C> {
    fn emit(&self, event: SdkEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn connect_failed(&self, peripheral: &Peripheral, error: Error) -> Error {
        warn!(id = %peripheral.id, error = %error, "connect failed");
        self.emit(SdkEvent::ConnectFailed {
            peripheral: peripheral.clone(),
            reason: error.to_string(),
        });
        error
    }

    fn fonts(&self) -> Arc<FontBook> {
        self.fonts.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn on_discovered(&self, peripheral: Peripheral) {
        if !self.scanning.load(Ordering::SeqCst) {
            return;
        }
        if lock(&self.seen).insert(peripheral.id.clone()) {
            debug!(id = %peripheral.id, name = ?peripheral.name, "device found");
            self.emit(SdkEvent::DeviceFound(peripheral));
        }
    }

    fn note_hang_up(&self, id: &PeripheralId) {
        lock(&self.hang_ups).insert(id.clone(), Instant::now());
    }

    /// A disconnect report shortly after a local hang-up of the same
    /// printer belongs to the old link, not the current one.
    fn is_stale_report(&self, id: &PeripheralId) -> bool {
        lock(&self.hang_ups)
            .get(id)
            .is_some_and(|at| at.elapsed() < self.config.disconnect_grace)
    }

    fn on_link_lost(self: &Arc<Self>, id: &PeripheralId) {
        let session = {
            let mut state = lock(&self.state);
            let current = match std::mem::replace(&mut state.phase, Phase::Disconnected) {
                Phase::Connected(current) if current.id == *id && !self.is_stale_report(id) => current,
                other => {
                    if matches!(&other, Phase::Connected(current) if current.id == *id) {
                        debug!(%id, "ignoring disconnect report for a replaced link");
                    }
                    state.phase = other;
                    return;
                }
            };
            if let Some(job) = &state.job {
                job.cancel.cancel();
            }
            warn!(id = %current.id, "printer disconnected");
            self.emit(SdkEvent::Disconnected {
                peripheral: current,
                initiator: Initiator::Remote,
            });
            state.session
        };
        let inner = self.clone();
        tokio::spawn(async move { inner.drop_link(session, false).await });
    }

    /// Release the link of `session` if it is still the current one.
    async fn drop_link(&self, session: u64, hang_up: bool) {
        let mut slot = self.link.lock().await;
        if !matches!(&*slot, Some((s, _)) if *s == session) {
            return;
        }
        if let Some((_, mut link)) = slot.take() {
            if hang_up {
                if let Err(e) = link.disconnect().await {
                    warn!(error = %e, "link disconnect failed");
                }
            }
        }
    }

    fn session_alive(&self, session: u64) -> bool {
        let state = lock(&self.state);
        matches!(state.phase, Phase::Connected(_)) && state.session == session
    }

    async fn run_job(
        &self,
        job: PrintJobConfig,
        job_id: Uuid,
        session: u64,
        cancel: CancellationToken,
        progress: watch::Sender<PrintProgress>,
    ) -> PrintOutcome {
        let _guard = JobGuard { state: &self.state, id: job_id };
        let total = job.total_labels();
        let result = self.execute(job, session, &cancel, &progress).await;
        let printed = progress.borrow().printed;
        let outcome = match result {
            Ok(()) => PrintOutcome::completed(total),
            Err(Error::Cancelled) if self.session_alive(session) => PrintOutcome::cancelled(printed, total),
            Err(Error::Cancelled) => PrintOutcome::failed("printer disconnected", printed, total),
            Err(e) => PrintOutcome::failed(e.to_string(), printed, total),
        };
        info!(status = ?outcome.status, printed, total, message = ?outcome.message, "print finished");
        outcome
    }

    async fn execute(
        &self,
        mut job: PrintJobConfig,
        session: u64,
        cancel: &CancellationToken,
        progress: &watch::Sender<PrintProgress>,
    ) -> Result<()> {
        job.validate()?;
        let fonts = self.fonts();
        let dots_per_mm = self.config.dots_per_mm;
        for (page, _) in job.page_jobs() {
            Rasterizer::new(&fonts, dots_per_mm).check(&page)?;
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            fetched = resolve_remote_images(&self.http, &mut job) => { fetched?; }
        }

        let pages = tokio::task::spawn_blocking(move || {
            let rasterizer = Rasterizer::new(&fonts, dots_per_mm);
            job.page_jobs()
                .into_iter()
                .map(|(page, repeat)| {
                    let bitmap = rasterizer.render(&page)?;
                    debug!(width = bitmap.width(), height = bitmap.height(), repeat, "page rasterized");
                    PageJob::new(&page, bitmap, repeat)
                })
                .collect::<Result<Vec<_>>>()
        })
        .await
        .map_err(|e| Error::Internal(format!("rasterizer task failed: {e}")))??;

        let mut slot = self.link.lock().await;
        let link = match slot.as_mut() {
            Some((s, link)) if *s == session => link,
            _ => return Err(Error::NotConnected),
        };
        PrintSession::new(
            link,
            self.encoder.as_ref(),
            SessionOptions::from(&self.config),
            cancel.clone(),
            progress,
        )
        .run(&pages)
        .await
    }
}

/// Frees the print slot when a job ends, even by panic.
struct JobGuard<'a> {
    state: &'a std::sync::Mutex<State>,
    id: Uuid,
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock(self.state);
        if state.job.as_ref().is_some_and(|job| job.id == self.id) {
            state.job = None;
        }
    }
}
