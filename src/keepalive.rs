//! Periodic self-ping for hosts that idle out instances without traffic.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tokio::sync::watch;

use crate::error::Result;

pub async fn ping_once(client: &Client, url: &str) -> Result<StatusCode> {
    let resp = client.get(url).send().await?;
    Ok(resp.status())
}

pub async fn run(client: Client, url: String, interval: Duration, mut cancel: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; skip it so the server is up before the first ping.
    ticker.tick().await;
    tracing::info!(target = "device_relay::keepalive", url = %url, interval_secs = interval.as_secs(), "keep-alive enabled");

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancel.changed() => return,
        }
        match ping_once(&client, &url).await {
            Ok(status) if status.is_success() => {
                tracing::debug!(target = "device_relay::keepalive", status = %status, "keep-alive ok")
            }
            Ok(status) => {
                tracing::warn!(target = "device_relay::keepalive", status = %status, "keep-alive got non-success status")
            }
            Err(error) => {
                tracing::warn!(target = "device_relay::keepalive", error = %error, "keep-alive request failed")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::prelude::*;
    use reqwest::Client;
    use tokio::sync::watch;

    use super::{ping_once, run};

    #[tokio::test]
    async fn ping_reports_status() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(204);
            })
            .await;

        let status = ping_once(&Client::new(), &server.url("/health")).await.unwrap();
        assert_eq!(status.as_u16(), 204);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn loop_pings_until_cancelled() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200);
            })
            .await;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run(
            Client::new(),
            server.url("/health"),
            Duration::from_millis(20),
            cancel_rx,
        ));
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel_tx.send(true).unwrap();
        task.await.unwrap();

        assert!(mock.hits_async().await >= 1);
    }
}
