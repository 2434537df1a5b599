use std::time::Duration;

use sfprint::{BleCentral, PrinterSdk, SdkConfig, SdkEvent};

/// Example: connect to the first printer whose advertised name starts with
/// the first argument (any named device otherwise) and poll its status.
/// Product names and icons come from the `devices` list in `sfprint.json`.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "sfprint=debug".into()),
        )
        .init();

    let prefix = std::env::args().nth(1).unwrap_or_default().to_ascii_uppercase();
    let config = SdkConfig::from_path("sfprint.json").unwrap_or_default();
    let central = BleCentral::new(&config).await?;
    let sdk = PrinterSdk::new(central, config).await?;
    let mut events = sdk.subscribe();

    println!("Scanning for a printer (10s)...");
    sdk.start_scan().await?;
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(SdkEvent::DeviceFound(p))
                    if p.name.as_deref().is_some_and(|n| n.to_ascii_uppercase().starts_with(&prefix)) =>
                {
                    return Some(p);
                }
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten();
    let Some(printer) = found else {
        println!("No matching printer found.");
        sdk.stop_scan().await?;
        return Ok(());
    };

    println!(
        "Connecting to {} ({}) ...",
        sdk.device_name(printer.name.as_deref()),
        sdk.device_image(printer.name.as_deref())
    );
    sdk.connect(&printer).await?;

    for i in 0..10 {
        match sdk.query_status().await {
            Ok(s) => println!(
                "Query {}: battery {:?}%, temperature {:?}, state {:?}, fault {:?}",
                i + 1,
                s.battery_percent,
                s.temperature,
                s.state,
                s.fault
            ),
            Err(e) => eprintln!("Query {}: failed: {e}", i + 1),
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    sdk.disconnect(&printer).await?;
    Ok(())
}
