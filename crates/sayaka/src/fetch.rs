//! Attachment / avatar downloads.

use std::time::Duration;

use anyhow::bail;

pub async fn fetch(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> anyhow::Result<Vec<u8>> {
    let resp = client.get(url).timeout(timeout).send().await?;
    if !resp.status().is_success() {
        bail!("{}: HTTP {}", url, resp.status());
    }
    Ok(resp.bytes().await?.to_vec())
}
