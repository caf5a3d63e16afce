use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncBufReadExt;
use tracing::info;
use uuid::Uuid;

use natter_cache::SqliteKv;
use natter_remote::{BlobStore, DirBlobStore, SqliteCollection, StaticAuth};
use natter_sync::{SendTicket, SyncEngine, SyncEngineConfig};
use natter_types::api::OutboundPayload;
use natter_types::models::{ImagePayload, Message};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "natter=info".into()),
        )
        .init();

    // Config
    let dir = std::env::var("NATTER_DIR").unwrap_or_else(|_| "natter-data".into());
    let user = std::env::var("NATTER_USER").unwrap_or_else(|_| "anon".into());
    let conversation = std::env::var("NATTER_CONVERSATION").unwrap_or_else(|_| "general".into());
    let poll_ms: u64 = std::env::var("NATTER_POLL_MS")
        .unwrap_or_else(|_| "250".into())
        .parse()?;

    let dir = PathBuf::from(dir);
    std::fs::create_dir_all(&dir)?;

    // Stores: one cache db per user, one "remote" db shared by every
    // process pointed at the same directory. Two terminals, two users,
    // one conversation.
    let kv = Arc::new(SqliteKv::open(&dir.join(format!("cache-{}.db", user)))?);
    let remote = Arc::new(SqliteCollection::open_with_interval(
        &dir.join("remote.db"),
        Duration::from_millis(poll_ms),
    )?);
    let blobs = DirBlobStore::new(dir.join("blobs")).await?;
    let auth = Arc::new(StaticAuth::signed_in(&user, &user));

    let engine = SyncEngine::spawn(SyncEngineConfig {
        conversation: conversation.clone(),
        kv,
        remote,
        auth,
    });

    println!(
        "-- {} in '{}'. Type to chat, /image <path> to send a picture, /quit to leave.",
        user, conversation
    );

    // Print arrivals as the published snapshot changes. Messages are
    // deduplicated by id because every snapshot is the full history.
    let mut snapshots = engine.snapshots();
    let printer = tokio::spawn(async move {
        let mut printed: HashSet<String> = HashSet::new();
        loop {
            {
                let snapshot = snapshots.borrow_and_update();
                for message in snapshot.messages() {
                    if printed.insert(message.id.clone()) {
                        print_message(message);
                    }
                }
            }
            if snapshots.changed().await.is_err() {
                break;
            }
        }
    });

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if let Some(path) = line.strip_prefix("/image ") {
            send_image(&engine, &blobs, path.trim()).await;
            continue;
        }

        match engine.send(OutboundPayload::Text(line.to_string())) {
            Ok(ticket) => watch_ticket(ticket),
            Err(e) => eprintln!("!! {}", e),
        }
    }

    engine.detach();
    printer.await?;
    info!("Session over");
    Ok(())
}

/// Read a local file, park it in blob storage, send the resulting URL.
async fn send_image(engine: &SyncEngine, blobs: &DirBlobStore, path: &str) {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) => {
            eprintln!("!! Could not read {}: {}", path, e);
            return;
        }
    };

    let name = format!("{}.img", Uuid::new_v4());
    let url = match blobs.put(&name, Bytes::from(data)).await {
        Ok(url) => url,
        Err(e) => {
            eprintln!("!! Upload failed: {}", e);
            return;
        }
    };

    match engine.send(OutboundPayload::Image(ImagePayload::Url(url))) {
        Ok(ticket) => watch_ticket(ticket),
        Err(e) => eprintln!("!! {}", e),
    }
}

/// Surface the outcome of a send without blocking the prompt. Only
/// failures are worth a line; successes show up as the echoed message.
fn watch_ticket(ticket: SendTicket) {
    tokio::spawn(async move {
        if let Err(e) = ticket.wait().await {
            eprintln!("!! {}", e);
        }
    });
}

fn print_message(message: &Message) {
    let time = message
        .created_at
        .and_then(|t| t.to_datetime())
        .map(|dt| dt.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "--:--:--".to_string());

    match (&message.text, &message.image) {
        (Some(text), _) => println!("[{}] {}: {}", time, message.sender, text),
        (None, Some(ImagePayload::Url(url))) => {
            println!("[{}] {}: [image] {}", time, message.sender, url)
        }
        (None, Some(ImagePayload::Inline(_))) => {
            println!("[{}] {}: [inline image]", time, message.sender)
        }
        (None, None) => {}
    }
}
