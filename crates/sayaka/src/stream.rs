//! Streaming connection and replay.
//!
//! One current-thread event loop: frames are read from the WebSocket and
//! handled to completion before the next one, so decoding and SIXEL output
//! stay sequential per note. SIGWINCH arrives as a signal stream and takes
//! effect between notes.

use std::fs::OpenOptions;
use std::io::{BufRead, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use tokio::signal::unix::{signal, SignalKind};
use tokio_tungstenite::tungstenite::Message;

use crate::config::Screen;
use crate::note::handle_message;
use crate::App;

/// Reconnect backoff; two failures share each slot before advancing.
static RETRY_WAIT: [u64; 8] = [1, 3, 10, 30, 60, 180, 600, 1800];

fn connect_frame(channel: &str) -> String {
    format!(
        "{{\"type\":\"connect\",\"body\":{{\"channel\":\"{}\",\"id\":\"{}-sayaka{:08x}\"}}}}",
        channel,
        channel,
        fastrand::u32(..)
    )
}

fn record(app: &App, msg: &str) {
    if let Some(path) = &app.cfg.record_file {
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(mut f) => {
                let _ = writeln!(f, "{}", msg);
            }
            Err(e) => warn!("{}: {}", path.display(), e),
        }
    }
}

pub async fn stream(
    app: &mut App,
    server: &str,
    home: bool,
    token: Option<&str>,
) -> anyhow::Result<()> {
    let mut url = format!("wss://{}/streaming", server);
    if let Some(token) = token {
        url.push_str("?i=");
        url.push_str(token);
    }

    print!("Ready...");
    let _ = std::io::stdout().flush();

    let mut sigwinch = signal(SignalKind::window_change()).context("signal(SIGWINCH)")?;

    enum Status {
        /// Clean close from the peer; reconnect right away.
        Closed,
        Retry,
    }

    // -1 means never connected; a failure then is final.
    let mut retry_count: i32 = -1;
    loop {
        if retry_count > 0 {
            print!("{} Retrying...", chrono::Local::now().format("%H:%M:%S"));
            let _ = std::io::stdout().flush();
        }

        let status = match tokio_tungstenite::connect_async(url.as_str()).await {
            Err(e) => {
                if retry_count < 0 {
                    bail!("{}: connection failed: {}", server, e);
                }
                warn!("{}: connection failed: {}", server, e);
                Status::Retry
            }
            Ok((mut ws, _resp)) => {
                // Shown on first connect and after failures, but not on
                // the quiet EOF-reconnect path.
                if retry_count != 0 {
                    println!("Connected");
                }
                retry_count = 0;
                match run(app, &mut ws, home, &mut sigwinch).await {
                    Ok(true) => Status::Closed,
                    Ok(false) => Status::Retry,
                    Err(e) => {
                        warn!("stream: {}", e);
                        Status::Retry
                    }
                }
            }
        };

        if matches!(status, Status::Retry) {
            retry_count += 1;
            if retry_count / 2 >= RETRY_WAIT.len() as i32 {
                retry_count -= 1;
            }
        }
        tokio::time::sleep(Duration::from_secs(RETRY_WAIT[(retry_count / 2) as usize])).await;
    }
}

async fn run<S>(
    app: &mut App,
    ws: &mut tokio_tungstenite::WebSocketStream<S>,
    home: bool,
    sigwinch: &mut tokio::signal::unix::Signal,
) -> anyhow::Result<bool>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let channel = if home { "homeTimeline" } else { "localTimeline" };
    ws.send(Message::Text(connect_frame(channel).into()))
        .await
        .context("sending connect frame")?;
    if home {
        // Notifications come over the main channel only.
        ws.send(Message::Text(connect_frame("main").into()))
            .await
            .context("sending connect frame")?;
    }

    loop {
        tokio::select! {
            msg = ws.next() => match msg {
                None => return Ok(true),
                Some(Ok(Message::Text(text))) => {
                    record(app, &text);
                    handle_message(app, &text).await;
                }
                Some(Ok(Message::Close(_))) => return Ok(true),
                Some(Ok(other)) => debug!("ignoring frame {:?}", other),
                Some(Err(e)) => {
                    warn!("read: {}", e);
                    return Ok(false);
                }
            },
            _ = sigwinch.recv() => {
                // New geometry applies from the next note on; nothing
                // in-flight is disturbed.
                app.screen = Screen::probe(app.cfg.font_override);
            }
        }
    }
}

/// Replay newline-delimited JSON from a file (or stdin).
pub async fn play(app: &mut App, file: Option<&Path>) -> anyhow::Result<()> {
    let reader: Box<dyn BufRead> = match file {
        Some(path) => Box::new(std::io::BufReader::new(
            std::fs::File::open(path).with_context(|| path.display().to_string())?,
        )),
        None => Box::new(std::io::BufReader::new(std::io::stdin())),
    };
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        handle_message(app, &line).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_frame_shape() {
        let f = connect_frame("localTimeline");
        let v: serde_json::Value = serde_json::from_str(&f).unwrap();
        assert_eq!(v["type"], "connect");
        assert_eq!(v["body"]["channel"], "localTimeline");
        let id = v["body"]["id"].as_str().unwrap();
        assert!(id.starts_with("localTimeline-sayaka"));
        assert_eq!(id.len(), "localTimeline-sayaka".len() + 8);
    }

    #[test]
    fn retry_slots_advance_every_other_failure() {
        // Two failures per slot, capped at the last entry.
        let mut retry_count: i32 = 0;
        let mut seen = Vec::new();
        for _ in 0..20 {
            retry_count += 1;
            if retry_count / 2 >= RETRY_WAIT.len() as i32 {
                retry_count -= 1;
            }
            seen.push(RETRY_WAIT[(retry_count / 2) as usize]);
        }
        assert_eq!(&seen[..8], &[1, 3, 3, 10, 10, 30, 30, 60]);
        assert_eq!(*seen.last().unwrap(), 1800);
    }
}
