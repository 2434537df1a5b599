use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::SdkConfig;
use crate::error::{Error, Result};
use crate::model::PrintJobConfig;
use crate::protocol::{chunk_data, CommandEncoder, DeviceMessage, JobHeader, PrinterStatus};
use crate::raster::LabelBitmap;
use crate::transport::Transport;

/// Labels printed so far out of the job total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrintProgress {
    pub printed: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub chunk_size: usize,
    pub ack_timeout: Duration,
    pub page_timeout: Duration,
    pub check_status: bool,
}

impl From<&SdkConfig> for SessionOptions {
    fn from(config: &SdkConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            ack_timeout: config.ack_timeout,
            page_timeout: config.page_timeout,
            check_status: config.check_status,
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&SdkConfig::default())
    }
}

/// One rendered page and the header that announces it.
#[derive(Debug, Clone, PartialEq)]
pub struct PageJob {
    pub header: JobHeader,
    pub bitmap: LabelBitmap,
}

impl PageJob {
    /// Pair a rendered page with its header.
    pub fn new(job: &PrintJobConfig, bitmap: LabelBitmap, repeat: u32) -> Result<Self> {
        let header = job_header(job, &bitmap, repeat)?;
        Ok(Self { header, bitmap })
    }
}

/// Build the job-start header for a rendered page printed `repeat` times
/// per job copy.
pub fn job_header(job: &PrintJobConfig, bitmap: &LabelBitmap, repeat: u32) -> Result<JobHeader> {
    let width_dots = u16::try_from(bitmap.width())
        .map_err(|_| Error::InvalidJob(format!("label too wide: {} dots", bitmap.width())))?;
    let height_dots = u16::try_from(bitmap.height())
        .map_err(|_| Error::InvalidJob(format!("label too long: {} dots", bitmap.height())))?;
    let labels = job.copies.saturating_mul(repeat);
    let copies =
        u16::try_from(labels).map_err(|_| Error::InvalidJob(format!("too many copies: {labels}")))?;
    Ok(JobHeader {
        width_dots,
        height_dots,
        paper_type: job.paper_type.code(),
        auto_detect: job.auto_detect,
        density: job.density,
        copies,
        pages: if job.one_by_one { copies } else { 1 },
        half_cut_depth: job.half_cut_depth,
        gap_mm: job.gap_mm,
        tail_length_mm: job.tail_length_mm,
        rotation_code: job.rotation.code(),
    })
}

/// Ask the printer for its status.
pub async fn request_status<T: Transport + ?Sized>(
    transport: &mut T,
    encoder: &dyn CommandEncoder,
    timeout: Duration,
) -> Result<PrinterStatus> {
    transport.write_control(&encoder.status_request()).await?;
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout("status response"));
        }
        let raw = transport
            .read_notification(remaining)
            .await
            .map_err(|e| match e {
                Error::Timeout(_) => Error::Timeout("status response"),
                other => other,
            })?;
        match encoder.decode(&raw)? {
            DeviceMessage::Status(status) => return Ok(status),
            other => debug!(?other, "ignoring notification while waiting for status"),
        }
    }
}

/// Drives one print job over a connected link.
///
/// Each page goes out as its own device job: start, acknowledgement, data,
/// page end and page-done counting, then job end. Progress counts labels
/// across all pages.
pub struct PrintSession<'a, T: Transport + ?Sized> {
    transport: &'a mut T,
    encoder: &'a dyn CommandEncoder,
    options: SessionOptions,
    cancel: CancellationToken,
    progress: &'a watch::Sender<PrintProgress>,
    started: bool,
    /// Labels finished by earlier pages.
    base: u32,
}

impl<'a, T: Transport + ?Sized> PrintSession<'a, T> {
    pub fn new(
        transport: &'a mut T,
        encoder: &'a dyn CommandEncoder,
        options: SessionOptions,
        cancel: CancellationToken,
        progress: &'a watch::Sender<PrintProgress>,
    ) -> Self {
        Self {
            transport,
            encoder,
            options,
            cancel,
            progress,
            started: false,
            base: 0,
        }
    }

    /// Send every page and wait until every label is out.
    ///
    /// On cancellation a cancel packet is sent (best effort) once the job
    /// has reached the printer, and [`Error::Cancelled`] is returned.
    #[instrument(skip_all, fields(pages = pages.len()))]
    pub async fn run(&mut self, pages: &[PageJob]) -> Result<()> {
        let result = self.run_inner(pages).await;
        if matches!(result, Err(Error::Cancelled)) && self.started {
            if let Err(e) = self.transport.write_control(&self.encoder.cancel()).await {
                warn!(error = %e, "cancel packet not delivered");
            }
        }
        result
    }

    async fn run_inner(&mut self, pages: &[PageJob]) -> Result<()> {
        let total: u32 = pages.iter().map(|p| p.header.copies as u32).sum();
        self.progress.send_replace(PrintProgress { printed: 0, total });
        self.base = 0;
        self.bail_if_cancelled()?;

        if self.options.check_status {
            let status = request_status(&mut *self.transport, self.encoder, self.options.ack_timeout).await?;
            debug!(?status, "printer status");
            if let Some(fault) = status.fault {
                return Err(Error::Fault(fault));
            }
        }
        self.bail_if_cancelled()?;

        for (index, page) in pages.iter().enumerate() {
            self.send_page(index, &page.header, &page.bitmap).await?;
            self.base += page.header.copies as u32;
        }
        info!(printed = total, "job complete");
        Ok(())
    }

    async fn send_page(&mut self, index: usize, header: &JobHeader, bitmap: &LabelBitmap) -> Result<()> {
        self.bail_if_cancelled()?;
        self.started = true;
        self.transport.write_control(&self.encoder.job_start(header)).await?;
        match self.next_message("job acknowledgement", self.options.ack_timeout).await? {
            DeviceMessage::JobAccepted => {}
            DeviceMessage::JobRejected => return Err(Error::Rejected),
            DeviceMessage::Fault(fault) => return Err(Error::Fault(fault)),
            other => return Err(Error::Protocol(format!("unexpected reply to job start: {other:?}"))),
        }

        let data = self.encoder.page_data(bitmap)?;
        let labels = header.copies as u32;
        let per_send = if header.pages >= header.copies { 1 } else { labels };
        for send in 0..header.pages {
            for chunk in chunk_data(&data, self.options.chunk_size) {
                self.bail_if_cancelled()?;
                self.transport.write_data(chunk).await?;
            }
            self.transport.write_control(&self.encoder.page_end(send)).await?;
            debug!(page = index, send, bytes = data.len(), "page sent");
            let target = ((send as u32 + 1) * per_send).min(labels);
            self.wait_printed(self.base + target).await?;
        }

        self.transport.write_control(&self.encoder.job_end()).await?;
        Ok(())
    }

    fn bail_if_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    fn printed(&self) -> u32 {
        self.progress.borrow().printed
    }

    async fn next_message(&mut self, what: &'static str, timeout: Duration) -> Result<DeviceMessage> {
        let cancel = self.cancel.clone();
        let raw = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            raw = self.transport.read_notification(timeout) => raw.map_err(|e| match e {
                Error::Timeout(_) => Error::Timeout(what),
                other => other,
            })?,
        };
        self.encoder.decode(&raw)
    }

    /// Count page-done notifications until `target` labels are out. The
    /// page timeout restarts with every label.
    async fn wait_printed(&mut self, target: u32) -> Result<()> {
        let mut deadline = Instant::now() + self.options.page_timeout;
        while self.printed() < target {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout("label to finish printing"));
            }
            match self.next_message("label to finish printing", remaining).await? {
                DeviceMessage::PageDone { printed } => {
                    // the device counts from zero for every page
                    let total = self.progress.borrow().total;
                    let printed = (self.base + printed as u32).min(total).max(self.printed());
                    self.progress.send_replace(PrintProgress { printed, total });
                    debug!(printed, total, "label printed");
                    deadline = Instant::now() + self.options.page_timeout;
                }
                DeviceMessage::Fault(fault) => return Err(Error::Fault(fault)),
                DeviceMessage::Status(PrinterStatus { fault: Some(fault), .. }) => {
                    return Err(Error::Fault(fault));
                }
                DeviceMessage::JobRejected => return Err(Error::Rejected),
                other => debug!(?other, "ignoring notification"),
            }
        }
        Ok(())
    }
}
