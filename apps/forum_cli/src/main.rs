use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use media_capture::{MediaCaptureDevice, ObjectUrlRegistry, WavEncoder};
use realtime_core::{
    load_settings, load_settings_from, CurrentUser, FeedEvent, MediaBlob, RealtimeSession,
    RecorderEvent, RecorderState, SessionDependencies, StaticIdentity, UploadDestination,
};
use shared::domain::{MediaKind, UserId};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};

#[derive(Parser, Debug)]
struct Cli {
    /// Settings file; defaults to ./forum_client.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    user_id: String,
    #[arg(long, default_value = "")]
    display_name: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Prints notifications as they arrive until interrupted.
    WatchNotifications,
    /// Prints a direct-message thread grouped by day.
    History { peer: String },
    /// Sends a text message.
    Send { peer: String, text: String },
    /// Uploads a file, optionally sending it to `peer`.
    Upload {
        path: PathBuf,
        #[arg(long)]
        peer: Option<String>,
        #[arg(long, default_value = "")]
        caption: String,
    },
    /// Records a voice note from the default microphone and sends it.
    Record {
        peer: String,
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings()?,
    };
    let user = CurrentUser::new(&cli.user_id, &cli.display_name);
    let deps = SessionDependencies::from_settings(
        &settings,
        Arc::new(StaticIdentity::signed_in(user)),
    )?;
    let (session, failures) = RealtimeSession::start(settings, deps).await?;
    for failure in &failures {
        warn!("{failure}");
    }

    let outcome = run(&session, cli.command).await;
    session.shutdown().await;
    outcome
}

async fn run(session: &RealtimeSession, command: Command) -> Result<()> {
    match command {
        Command::WatchNotifications => watch_notifications(session).await,
        Command::History { peer } => {
            let conversation = session.open_conversation(UserId::new(peer)).await?;
            for group in conversation.groups().await {
                println!("-- {} --", group.label);
                for message in &group.messages {
                    let time = message
                        .created_at
                        .parse()
                        .map(|at| at.format("%H:%M").to_string())
                        .unwrap_or_else(|| "--:--".into());
                    let marker = if message.is_read() { "" } else { " *" };
                    println!("{time} {}: {}{marker}", message.sender_id, message.content);
                    if let Some(url) = &message.media_url {
                        println!("      {url}");
                    }
                }
            }
            Ok(())
        }
        Command::Send { peer, text } => {
            let conversation = session.open_conversation(UserId::new(peer)).await?;
            let sent = conversation.send(text).await?;
            println!("sent message_id={}", sent.id);
            Ok(())
        }
        Command::Upload {
            path,
            peer,
            caption,
        } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            let content_type = mime_guess::from_path(&path)
                .first_or_octet_stream()
                .essence_str()
                .to_string();
            let mut blob = MediaBlob::new(bytes, content_type);
            if let Some(name) = path.file_name().and_then(|name| name.to_str()) {
                blob = blob.with_file_name(name);
            }

            match peer {
                Some(peer) => {
                    let conversation = session.open_conversation(UserId::new(peer)).await?;
                    let sent = conversation.send_media(caption, &blob).await?;
                    println!(
                        "sent message_id={} media_url={}",
                        sent.id,
                        sent.media_url.unwrap_or_default()
                    );
                }
                None => {
                    let destination = UploadDestination::new(blob.kind(), session.user().id.clone());
                    let report = |percent: u8| info!(percent, "upload: progress");
                    let reference = session
                        .uploads()
                        .upload(&blob, &destination, Some(&report))
                        .await?;
                    println!("uploaded {reference}");
                }
            }
            Ok(())
        }
        Command::Record { peer, seconds } => record(session, UserId::new(peer), seconds).await,
    }
}

async fn watch_notifications(session: &RealtimeSession) -> Result<()> {
    let dispatcher = Arc::clone(session.notifications());
    let mut feed = BroadcastStream::new(dispatcher.subscribe());
    println!("watching notifications for {}; ctrl-c to stop", session.user().id);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = feed.next() => match event {
                Some(Ok(FeedEvent::Added(notification))) => {
                    println!("[{:?}] {}", notification.kind, notification.message);
                }
                Some(Ok(FeedEvent::ReadStateChanged { unread })) => {
                    println!("unread: {unread}");
                }
                Some(Err(lagged)) => warn!("notifications: {lagged}"),
                None => break,
            },
        }
    }
    println!("{} unread", dispatcher.unread_count().await);
    Ok(())
}

fn capture_device() -> Arc<dyn MediaCaptureDevice> {
    #[cfg(feature = "native-audio")]
    {
        Arc::new(media_capture::native::CpalCaptureDevice)
    }
    #[cfg(not(feature = "native-audio"))]
    {
        Arc::new(media_capture::UnavailableCaptureDevice)
    }
}

async fn record(session: &RealtimeSession, peer: UserId, seconds: u64) -> Result<()> {
    let conversation = session.open_conversation(peer).await?;
    let recorder = session.voice_recorder(
        capture_device(),
        Arc::new(WavEncoder),
        Arc::new(ObjectUrlRegistry::new()),
    );
    let mut events = BroadcastStream::new(recorder.subscribe());
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(RecorderEvent::Tick { elapsed_seconds }) => println!("recording {elapsed_seconds}s"),
                Ok(RecorderEvent::AutoStopped { elapsed_seconds }) => {
                    println!("maximum length reached at {elapsed_seconds}s")
                }
                Ok(RecorderEvent::UploadProgress(percent)) => println!("uploading {percent}%"),
                Ok(RecorderEvent::Failed(reason)) => println!("failed: {reason}"),
                _ => {}
            }
        }
    });

    recorder.start().await?;
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    if recorder.state().await == RecorderState::Recording {
        recorder.stop().await?;
    }
    if recorder.snapshot().await.recorded_bytes == 0 {
        recorder.dispose().await;
        printer.abort();
        bail!("nothing was recorded");
    }

    let sent = async {
        let reference = recorder.send().await?;
        let message = conversation
            .send_attachment("Voice message", &reference, MediaKind::Voice, None)
            .await?;
        anyhow::Ok(message)
    }
    .await;
    recorder.dispose().await;
    printer.abort();

    let message = sent?;
    println!(
        "sent voice message_id={} media_url={}",
        message.id,
        message.media_url.unwrap_or_default()
    );
    Ok(())
}
