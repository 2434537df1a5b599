//! Download remote image elements before rasterizing.

use std::collections::HashMap;

use tracing::{debug, instrument};

use crate::error::Result;
use crate::model::{ElementContent, PrintJobConfig};

/// Fetch one image. Non-2xx responses are errors.
#[instrument(skip(client))]
pub async fn fetch_image(client: &reqwest::Client, url: &str) -> Result<Vec<u8>> {
    let response = client.get(url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?;
    debug!(len = bytes.len(), "image downloaded");
    Ok(bytes.to_vec())
}

/// Replace every remote image in `job` with its downloaded bytes. Each
/// distinct URL is fetched once. Returns how many elements were resolved.
pub async fn resolve_remote_images(client: &reqwest::Client, job: &mut PrintJobConfig) -> Result<usize> {
    let mut cache: HashMap<String, Vec<u8>> = HashMap::new();
    let mut resolved = 0;
    for element in job.elements_mut() {
        let ElementContent::RemoteImage { url } = &element.content else {
            continue;
        };
        let url = url.clone();
        let bytes = match cache.get(&url) {
            Some(bytes) => bytes.clone(),
            None => {
                let bytes = fetch_image(client, &url).await?;
                cache.insert(url, bytes.clone());
                bytes
            }
        };
        element.content = ElementContent::LocalImage { bytes };
        resolved += 1;
    }
    Ok(resolved)
}
