use std::io::Cursor;
use std::time::Duration;

use image::{DynamicImage, GrayImage, ImageFormat, Luma};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::timeout;

use sfprint::mock::{MockBehavior, MockCentral, MockController};
use sfprint::protocol::{unpack_1bpp_pixels, CMD_CANCEL, CMD_JOB_END};
use sfprint::{
    DeviceModel, Error, FontBook, Initiator, JobStatus, Peripheral, PrintElement, PrintHandle, PrintJobConfig,
    PrintPage, PrinterFault, PrinterSdk, PrinterState, PrinterStatus, Rasterizer, SdkConfig, SdkEvent,
};

fn printer(id: &str) -> Peripheral {
    Peripheral::new(id, Some(&format!("T50M-{id}")))
}

fn png_square(side: u32) -> Vec<u8> {
    let img = GrayImage::from_pixel(side, side, Luma([0]));
    let mut buf = Vec::new();
    DynamicImage::ImageLuma8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

fn image_job(copies: u32) -> PrintJobConfig {
    let mut job = PrintJobConfig::new(10, 5)
        .with_element(PrintElement::local_image(2.0, 2.0, 10.0, 10.0, png_square(8)));
    job.copies = copies;
    job
}

fn slow_printer() -> MockBehavior {
    MockBehavior {
        label_delay: Duration::from_millis(100),
        ..MockBehavior::default()
    }
}

async fn start(central: MockCentral) -> (PrinterSdk<MockCentral>, MockController, broadcast::Receiver<SdkEvent>) {
    start_with(central, SdkConfig::default()).await
}

async fn start_with(
    central: MockCentral,
    config: SdkConfig,
) -> (PrinterSdk<MockCentral>, MockController, broadcast::Receiver<SdkEvent>) {
    let controller = central.controller();
    let sdk = PrinterSdk::new(central, config).await.unwrap();
    let events = sdk.subscribe();
    (sdk, controller, events)
}

async fn next_event(rx: &mut broadcast::Receiver<SdkEvent>) -> SdkEvent {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("no event within 2s")
        .expect("event channel closed")
}

fn assert_quiet(rx: &mut broadcast::Receiver<SdkEvent>) {
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
}

async fn wait_printed(handle: &PrintHandle, n: u32) {
    let mut progress = handle.progress();
    timeout(Duration::from_secs(2), progress.wait_for(|p| p.printed >= n))
        .await
        .expect("progress stalled")
        .expect("job ended early");
}

#[tokio::test]
async fn test_scan_reports_each_device_once() {
    let central = MockCentral::new()
        .with_peripheral(printer("a"))
        .with_peripheral(printer("b"));
    let (sdk, controller, mut events) = start(central).await;

    sdk.start_scan().await.unwrap();
    assert!(sdk.is_scanning());
    assert_eq!(next_event(&mut events).await, SdkEvent::DeviceFound(printer("a")));
    assert_eq!(next_event(&mut events).await, SdkEvent::DeviceFound(printer("b")));

    controller.advertise(printer("a"));
    controller.advertise(printer("c"));
    assert_eq!(next_event(&mut events).await, SdkEvent::DeviceFound(printer("c")));

    // a fresh scan reports everything again
    sdk.stop_scan().await.unwrap();
    assert!(!controller.is_scanning());
    sdk.start_scan().await.unwrap();
    assert_eq!(next_event(&mut events).await, SdkEvent::DeviceFound(printer("a")));
}

#[tokio::test]
async fn test_connect_fires_once_and_stops_scan() {
    let (sdk, controller, mut events) = start(MockCentral::new().with_peripheral(printer("a"))).await;
    sdk.start_scan().await.unwrap();
    assert_eq!(next_event(&mut events).await, SdkEvent::DeviceFound(printer("a")));

    sdk.connect(&printer("a")).await.unwrap();
    assert_eq!(next_event(&mut events).await, SdkEvent::Connected(printer("a")));
    assert_quiet(&mut events);
    assert!(sdk.is_connected());
    assert!(!sdk.is_scanning());
    assert!(!controller.is_scanning());
    assert_eq!(sdk.connected_peripheral(), Some(printer("a")));
}

#[tokio::test]
async fn test_connect_failure_fires_once() {
    let (sdk, _controller, mut events) = start(MockCentral::new().with_unreachable("a")).await;

    let err = sdk.connect(&printer("a")).await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
    match next_event(&mut events).await {
        SdkEvent::ConnectFailed { peripheral, reason } => {
            assert_eq!(peripheral, printer("a"));
            assert!(reason.contains("did not respond"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_quiet(&mut events);
    assert!(!sdk.is_connected());
}

#[tokio::test]
async fn test_reconnect_same_printer_is_a_no_op() {
    let (sdk, controller, mut events) = start(MockCentral::new()).await;
    sdk.connect(&printer("a")).await.unwrap();
    sdk.connect(&printer("a")).await.unwrap();
    assert_eq!(next_event(&mut events).await, SdkEvent::Connected(printer("a")));
    assert_eq!(next_event(&mut events).await, SdkEvent::Connected(printer("a")));
    assert_quiet(&mut events);
    assert_eq!(controller.connect_attempts(), 1);
}

#[tokio::test]
async fn test_switching_printers_disconnects_the_first() {
    let (sdk, controller, mut events) = start(MockCentral::new()).await;
    sdk.connect(&printer("a")).await.unwrap();
    sdk.connect(&printer("b")).await.unwrap();

    assert_eq!(next_event(&mut events).await, SdkEvent::Connected(printer("a")));
    assert_eq!(
        next_event(&mut events).await,
        SdkEvent::Disconnected {
            peripheral: printer("a"),
            initiator: Initiator::Local
        }
    );
    assert_eq!(next_event(&mut events).await, SdkEvent::Connected(printer("b")));
    assert_quiet(&mut events);
    assert!(controller.log(&printer("a").id).unwrap().disconnected);
    assert_eq!(sdk.connected_peripheral(), Some(printer("b")));
}

#[tokio::test]
async fn test_local_disconnect_fires_once() {
    let (sdk, controller, mut events) = start(MockCentral::new()).await;
    sdk.connect(&printer("a")).await.unwrap();
    next_event(&mut events).await;

    sdk.disconnect(&printer("a")).await.unwrap();
    assert_eq!(
        next_event(&mut events).await,
        SdkEvent::Disconnected {
            peripheral: printer("a"),
            initiator: Initiator::Local
        }
    );
    assert!(!sdk.is_connected());
    assert!(controller.log(&printer("a").id).unwrap().disconnected);

    assert!(matches!(sdk.disconnect(&printer("a")).await, Err(Error::NotConnected)));
    assert_quiet(&mut events);
}

#[tokio::test]
async fn test_remote_disconnect_fires_once() {
    let (sdk, controller, mut events) = start(MockCentral::new()).await;
    sdk.connect(&printer("a")).await.unwrap();
    next_event(&mut events).await;

    controller.drop_link(&printer("a").id);
    assert_eq!(
        next_event(&mut events).await,
        SdkEvent::Disconnected {
            peripheral: printer("a"),
            initiator: Initiator::Remote
        }
    );
    assert!(!sdk.is_connected());

    // a repeated report for a link that is already gone changes nothing
    controller.drop_link(&printer("a").id);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_quiet(&mut events);
}

#[tokio::test]
async fn test_print_sends_the_rendered_label() {
    let (sdk, controller, _events) = start(MockCentral::new()).await;
    sdk.connect(&printer("a")).await.unwrap();

    let outcome = sdk.print(image_job(1)).outcome().await;
    assert!(outcome.success(), "{outcome:?}");
    assert_eq!((outcome.printed, outcome.total), (1, 1));

    let expected = Rasterizer::new(&FontBook::new(), sdk.config().dots_per_mm)
        .render(&image_job(1))
        .unwrap();
    let log = controller.log(&printer("a").id).unwrap();
    let header = &log.headers[0];
    assert_eq!((header.width_dots, header.height_dots), (80, 40));
    let pixels = unpack_1bpp_pixels(&log.data, 80, 40).unwrap();
    assert_eq!(pixels, expected.pixels());
    assert!(expected.black_pixels() > 0);
    assert_eq!(log.control.last().map(|p| p.command_id), Some(CMD_JOB_END));
}

#[tokio::test]
async fn test_print_without_connection_fails() {
    let (sdk, _controller, _events) = start(MockCentral::new()).await;
    let outcome = sdk.print(image_job(1)).outcome().await;
    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.message.as_deref(), Some("printer not connected"));
    assert_eq!(outcome.printed, 0);
}

#[tokio::test]
async fn test_second_print_is_refused_while_busy() {
    let (sdk, _controller, _events) = start(MockCentral::new().with_behavior(slow_printer())).await;
    sdk.connect(&printer("a")).await.unwrap();

    let first = sdk.print(image_job(2));
    let second = sdk.print(image_job(1)).outcome().await;
    assert!(!second.success());
    assert_eq!(second.message.as_deref(), Some("a print job is already in progress"));

    let first = first.outcome().await;
    assert!(first.success(), "{first:?}");
    assert!(!sdk.is_printing());

    // the slot is free again
    assert!(sdk.print(image_job(1)).outcome().await.success());
}

#[tokio::test]
async fn test_connect_while_printing_is_refused() {
    let (sdk, _controller, mut events) = start(MockCentral::new().with_behavior(slow_printer())).await;
    sdk.connect(&printer("a")).await.unwrap();
    next_event(&mut events).await;

    let job = sdk.print(image_job(3));
    let err = sdk.connect(&printer("b")).await.unwrap_err();
    assert!(matches!(err, Error::Busy(_)));
    assert!(matches!(next_event(&mut events).await, SdkEvent::ConnectFailed { .. }));
    assert_eq!(sdk.connected_peripheral(), Some(printer("a")));
    assert!(job.outcome().await.success());
}

#[tokio::test]
async fn test_cancel_reports_cancelled() {
    let (sdk, controller, _events) = start(MockCentral::new().with_behavior(slow_printer())).await;
    sdk.connect(&printer("a")).await.unwrap();

    let handle = sdk.print(image_job(5));
    wait_printed(&handle, 1).await;
    assert!(sdk.cancel_print());

    let outcome = handle.outcome().await;
    assert_eq!(outcome.status, JobStatus::Cancelled);
    assert!(!outcome.success());
    assert!(outcome.printed >= 1 && outcome.printed < 5);
    assert!(!sdk.cancel_print());

    let log = controller.log(&printer("a").id).unwrap();
    assert_eq!(log.control.last().map(|p| p.command_id), Some(CMD_CANCEL));
    assert!(sdk.is_connected());
}

#[tokio::test]
async fn test_cancel_right_after_submit() {
    let (sdk, controller, _events) = start(MockCentral::new()).await;
    sdk.connect(&printer("a")).await.unwrap();

    let handle = sdk.print(image_job(3));
    assert!(sdk.cancel_print());
    let outcome = handle.outcome().await;
    assert_eq!(outcome.status, JobStatus::Cancelled);
    assert_eq!(outcome.printed, 0);
    assert!(controller.log(&printer("a").id).unwrap().data.is_empty());
}

#[tokio::test]
async fn test_link_loss_fails_the_job() {
    let (sdk, controller, mut events) = start(MockCentral::new().with_behavior(slow_printer())).await;
    sdk.connect(&printer("a")).await.unwrap();
    next_event(&mut events).await;

    let handle = sdk.print(image_job(5));
    wait_printed(&handle, 1).await;
    controller.drop_link(&printer("a").id);

    let outcome = handle.outcome().await;
    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.message.as_deref(), Some("printer disconnected"));
    assert!(matches!(
        next_event(&mut events).await,
        SdkEvent::Disconnected {
            initiator: Initiator::Remote,
            ..
        }
    ));
    assert_quiet(&mut events);
}

#[tokio::test]
async fn test_local_disconnect_during_print() {
    let (sdk, _controller, mut events) = start(MockCentral::new().with_behavior(slow_printer())).await;
    sdk.connect(&printer("a")).await.unwrap();
    next_event(&mut events).await;

    let handle = sdk.print(image_job(5));
    wait_printed(&handle, 1).await;
    sdk.disconnect(&printer("a")).await.unwrap();

    let outcome = handle.outcome().await;
    assert!(!outcome.success());
    assert_eq!(outcome.message.as_deref(), Some("printer disconnected"));
    assert!(matches!(next_event(&mut events).await, SdkEvent::Disconnected { .. }));
    assert_quiet(&mut events);
}

#[tokio::test]
async fn test_printer_fault_fails_the_job() {
    let behavior = MockBehavior {
        status: PrinterStatus {
            battery_percent: Some(80),
            temperature: Some(30),
            state: PrinterState::Standby,
            fault: Some(PrinterFault::CoverOpen),
        },
        ..MockBehavior::default()
    };
    let (sdk, controller, _events) = start(MockCentral::new().with_behavior(behavior)).await;
    sdk.connect(&printer("a")).await.unwrap();

    let outcome = sdk.print(image_job(1)).outcome().await;
    assert_eq!(outcome.status, JobStatus::Failed);
    assert_eq!(outcome.message.as_deref(), Some("printer fault: cover open"));
    assert!(controller.log(&printer("a").id).unwrap().data.is_empty());
}

#[tokio::test]
async fn test_paper_out_mid_job_reports_partial_count() {
    let behavior = MockBehavior {
        fail_after: Some(2),
        ..MockBehavior::default()
    };
    let (sdk, _controller, _events) = start(MockCentral::new().with_behavior(behavior)).await;
    sdk.connect(&printer("a")).await.unwrap();

    let outcome = sdk.print(image_job(4)).outcome().await;
    assert!(!outcome.success());
    assert_eq!((outcome.printed, outcome.total), (2, 4));
    assert_eq!(outcome.message.as_deref(), Some("printer fault: out of labels"));
}

#[tokio::test]
async fn test_rejected_job() {
    let behavior = MockBehavior {
        reject_jobs: true,
        ..MockBehavior::default()
    };
    let (sdk, _controller, _events) = start(MockCentral::new().with_behavior(behavior)).await;
    sdk.connect(&printer("a")).await.unwrap();

    let outcome = sdk.print(image_job(1)).outcome().await;
    assert_eq!(outcome.message.as_deref(), Some("printer rejected the job"));
}

#[tokio::test]
async fn test_invalid_job_never_reaches_the_printer() {
    let (sdk, controller, _events) = start(MockCentral::new()).await;
    sdk.connect(&printer("a")).await.unwrap();

    let mut job = image_job(1);
    job.density = 0;
    let outcome = sdk.print(job).outcome().await;
    assert_eq!(outcome.status, JobStatus::Failed);
    assert!(outcome.message.unwrap().starts_with("invalid job"));
    assert!(controller.log(&printer("a").id).unwrap().headers.is_empty());
}

#[tokio::test]
async fn test_text_without_fonts_fails() {
    let (sdk, _controller, _events) = start(MockCentral::new()).await;
    sdk.connect(&printer("a")).await.unwrap();

    let job = PrintJobConfig::new(20, 10).with_element(PrintElement::text(0.0, 0.0, 50.0, 12.0, "hello"));
    let outcome = sdk.print(job).outcome().await;
    assert_eq!(outcome.message.as_deref(), Some("no font available for text rendering"));
}

#[tokio::test]
async fn test_print_with_calls_back_once() {
    let (sdk, _controller, _events) = start(MockCentral::new()).await;
    sdk.connect(&printer("a")).await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    sdk.print_with(image_job(2), move |outcome| {
        let _ = tx.send(outcome);
    });
    let outcome = timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
    assert!(outcome.success());
    assert_eq!(outcome.printed, 2);
}

#[tokio::test]
async fn test_query_status() {
    let (sdk, _controller, _events) = start(MockCentral::new()).await;
    assert!(matches!(sdk.query_status().await, Err(Error::NotConnected)));

    sdk.connect(&printer("a")).await.unwrap();
    let status = sdk.query_status().await.unwrap();
    assert_eq!(status.battery_percent, Some(100));
    assert_eq!(status.fault, None);
}

#[tokio::test]
async fn test_disconnect_abandons_pending_connect() {
    let central = MockCentral::new().with_connect_delay(Duration::from_millis(200));
    let (sdk, controller, mut events) = start(central).await;

    let pending = {
        let sdk = sdk.clone();
        tokio::spawn(async move { sdk.connect(&printer("a")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    sdk.disconnect(&printer("a")).await.unwrap();

    let result = timeout(Duration::from_millis(100), pending)
        .await
        .expect("connect did not give up")
        .unwrap();
    assert!(matches!(result, Err(Error::Connection(_))));
    match next_event(&mut events).await {
        SdkEvent::ConnectFailed { peripheral, reason } => {
            assert_eq!(peripheral, printer("a"));
            assert!(reason.contains("cancelled"), "{reason}");
        }
        other => panic!("unexpected event {other:?}"),
    }
    // nothing arrives once the abandoned attempt would have finished
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_quiet(&mut events);
    assert!(!sdk.is_connected());
    assert_eq!(controller.connect_attempts(), 1);

    // and the printer can be connected again
    sdk.connect(&printer("a")).await.unwrap();
    assert_eq!(next_event(&mut events).await, SdkEvent::Connected(printer("a")));
}

#[tokio::test]
async fn test_disconnect_of_another_printer_leaves_connect_alone() {
    let central = MockCentral::new().with_connect_delay(Duration::from_millis(50));
    let (sdk, _controller, mut events) = start(central).await;

    let pending = {
        let sdk = sdk.clone();
        tokio::spawn(async move { sdk.connect(&printer("a")).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(matches!(sdk.disconnect(&printer("b")).await, Err(Error::NotConnected)));
    pending.await.unwrap().unwrap();
    assert_eq!(next_event(&mut events).await, SdkEvent::Connected(printer("a")));
}

#[tokio::test]
async fn test_late_disconnect_report_after_reconnect_is_ignored() {
    let config = SdkConfig::default().with_disconnect_grace(Duration::from_millis(300));
    let (sdk, controller, mut events) = start_with(MockCentral::new(), config).await;
    sdk.connect(&printer("a")).await.unwrap();
    sdk.disconnect(&printer("a")).await.unwrap();
    sdk.connect(&printer("a")).await.unwrap();
    assert_eq!(next_event(&mut events).await, SdkEvent::Connected(printer("a")));
    assert!(matches!(next_event(&mut events).await, SdkEvent::Disconnected { .. }));
    assert_eq!(next_event(&mut events).await, SdkEvent::Connected(printer("a")));

    // the platform reports the first link going down after the second came up
    controller.report_disconnect(&printer("a").id);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_quiet(&mut events);
    assert!(sdk.is_connected());
    assert!(sdk.print(image_job(1)).outcome().await.success());

    // once the window has passed, a drop is real
    tokio::time::sleep(Duration::from_millis(300)).await;
    controller.drop_link(&printer("a").id);
    assert_eq!(
        next_event(&mut events).await,
        SdkEvent::Disconnected {
            peripheral: printer("a"),
            initiator: Initiator::Remote
        }
    );
}

#[tokio::test]
async fn test_oversized_element_fails_the_job() {
    let (sdk, controller, _events) = start(MockCentral::new()).await;
    sdk.connect(&printer("a")).await.unwrap();

    let job = PrintJobConfig::new(40, 30).with_element(PrintElement::local_image(0.0, 0.0, 3e7, 3e7, png_square(4)));
    let outcome = timeout(Duration::from_secs(2), sdk.print(job).outcome()).await.unwrap();
    assert_eq!(outcome.status, JobStatus::Failed);
    assert!(outcome.message.unwrap().starts_with("invalid job"));

    let job = PrintJobConfig::new(1_000_000, 30);
    let outcome = sdk.print(job).outcome().await;
    assert_eq!(outcome.status, JobStatus::Failed);
    assert!(outcome.message.unwrap().starts_with("invalid job"));
    assert!(controller.log(&printer("a").id).unwrap().headers.is_empty());
    assert!(sdk.is_connected());
    assert!(!sdk.is_printing());
}

#[tokio::test]
async fn test_multi_page_job_prints_each_page() {
    let (sdk, controller, _events) = start(MockCentral::new()).await;
    sdk.connect(&printer("a")).await.unwrap();

    let square = PrintElement::local_image(2.0, 2.0, 10.0, 10.0, png_square(8));
    let mut job = PrintJobConfig::new(10, 5)
        .with_page(PrintPage::new().repeat(2).with_element(square.clone()))
        .with_page(PrintPage::new().sized(20, 5).with_element(square));
    job.copies = 2;
    job.one_by_one = false;

    let handle = sdk.print(job.clone());
    assert_eq!(handle.progress().borrow().total, 6);
    let outcome = handle.outcome().await;
    assert!(outcome.success(), "{outcome:?}");
    assert_eq!((outcome.printed, outcome.total), (6, 6));

    let log = controller.log(&printer("a").id).unwrap();
    let headers: Vec<_> = log.headers.iter().map(|h| (h.width_dots, h.height_dots, h.copies)).collect();
    assert_eq!(headers, [(80, 40, 4), (160, 40, 2)]);

    let fonts = FontBook::new();
    let rasterizer = Rasterizer::new(&fonts, sdk.config().dots_per_mm);
    let pages = job.page_jobs();
    let first = rasterizer.render(&pages[0].0).unwrap();
    let second = rasterizer.render(&pages[1].0).unwrap();
    assert_eq!(log.data.len(), 10 * 40 + 20 * 40);
    assert_eq!(unpack_1bpp_pixels(&log.data[..400], 80, 40).unwrap(), first.pixels());
    assert_eq!(unpack_1bpp_pixels(&log.data[400..], 160, 40).unwrap(), second.pixels());
}

#[tokio::test]
async fn test_device_names() {
    let config = SdkConfig::default().with_device(DeviceModel::new("T50M", "T50M", "t50m.png"));
    let (sdk, _controller, _events) = start_with(MockCentral::new(), config).await;
    assert_eq!(sdk.device_name(Some("T50M-77")), "T50M");
    assert_eq!(sdk.device_name(Some("Other-1")), "Other-1");
    assert_eq!(sdk.device_name(None), sfprint::device::UNKNOWN_DEVICE);

    sdk.register_device_model(DeviceModel::new("T50M Pro", "T50M Pro", "t50m_pro.png"));
    assert_eq!(sdk.device_name(Some("T50M Pro-77")), "T50M Pro");
    assert_eq!(sdk.device_image(Some("t50m pro-77")), "t50m_pro.png");
    assert_eq!(sdk.device_image(None), sfprint::device::GENERIC_ICON);
}
