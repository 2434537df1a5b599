use std::io::{self, Write};
use std::time::Duration;

use sfprint::{
    Alignment, BleCentral, FontSpec, FontStyle, MediaRotation, Peripheral, PrintElement, PrintJobConfig,
    PrinterSdk, SdkConfig, SdkEvent,
};

static BUNDLED_FONT: &[u8] = include_bytes!("../fonts/DejaVuSansMono.ttf");

/// Example: scan, pick a printer and print a label
/// - optional first argument: path to a TTF font for text labels (the bundled face otherwise)
/// - optional second argument: image file to print instead of text
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "sfprint=info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let font_path = args.next();
    let image_path = args.next();

    let config = SdkConfig::default();
    let central = BleCentral::new(&config).await?;
    let sdk = PrinterSdk::new(central, config).await?;
    match &font_path {
        Some(path) => sdk.register_font("default", std::fs::read(path)?)?,
        None => sdk.register_font("default", BUNDLED_FONT.to_vec())?,
    }

    println!("Scanning for label printers for 3 seconds...");
    let mut events = sdk.subscribe();
    sdk.start_scan().await?;
    let mut devices: Vec<Peripheral> = Vec::new();
    let deadline = tokio::time::sleep(Duration::from_secs(3));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = events.recv() => {
                if let Ok(SdkEvent::DeviceFound(p)) = event {
                    println!("  {}) {} [{}] rssi={:?}", devices.len() + 1, sdk.device_name(p.name.as_deref()), p.id, p.rssi);
                    devices.push(p);
                }
            }
        }
    }
    sdk.stop_scan().await?;
    if devices.is_empty() {
        println!("No devices found. Make sure Bluetooth is on and the printer is advertising.");
        return Ok(());
    }

    let mut input = String::new();
    let chosen = loop {
        print!("Select device number to connect to (1-{}): ", devices.len());
        io::stdout().flush()?;
        input.clear();
        io::stdin().read_line(&mut input)?;
        if let Ok(n) = input.trim().parse::<usize>() {
            if (1..=devices.len()).contains(&n) {
                break devices[n - 1].clone();
            }
        }
        println!("Invalid selection.");
    };

    println!("Connecting to {} ...", sdk.device_name(chosen.name.as_deref()));
    if let Err(e) = sdk.connect(&chosen).await {
        eprintln!("Failed to connect: {e}");
        return Ok(());
    }
    match sdk.query_status().await {
        Ok(s) => println!("battery: {:?}, state: {:?}, fault: {:?}", s.battery_percent, s.state, s.fault),
        Err(e) => eprintln!("Status query failed: {e}"),
    }

    let element = match image_path {
        Some(path) => PrintElement::local_image(4.0, 4.0, 100.0, 72.0, std::fs::read(path)?),
        None => {
            print!("Text to print: ");
            io::stdout().flush()?;
            input.clear();
            io::stdin().read_line(&mut input)?;
            PrintElement::text(4.0, 4.0, 105.0, 76.0, input.trim())
                .font(FontSpec {
                    size: 18.0,
                    style: FontStyle::BOLD,
                    ..FontSpec::default()
                })
                .aligned(Alignment::Center)
                .auto_size(true)
        }
    };
    let mut job = PrintJobConfig::new(40, 30).with_element(element);
    job.rotation = MediaRotation::Deg0;

    let handle = sdk.print(job);
    let mut progress = handle.progress();
    tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let p = *progress.borrow();
            println!("printed {}/{}", p.printed, p.total);
        }
    });
    let outcome = handle.outcome().await;
    if outcome.success() {
        println!("Done.");
    } else {
        println!("Print failed: {}", outcome.message.unwrap_or_default());
    }

    sdk.disconnect(&chosen).await?;
    Ok(())
}
