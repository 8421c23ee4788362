//! Interactive call and listen modes over the WebSocket relay

use crate::bell::TerminalBell;
use crate::config::DuetConfig;
use crate::report::describe_event;
use anyhow::{Context, Result};
use duet_core::media::{MediaDevices, TrackSource};
use duet_core::{
    CallEvent, CallId, CallService, CallSession, JsonlHistoryStore, MediaType, UserId,
    WebSocketTransport,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast;

type Input = Lines<BufReader<Stdin>>;

/// Resolved connection settings for one endpoint
pub struct EndpointOptions {
    pub identity: UserId,
    pub relay_url: String,
    pub history_path: PathBuf,
    pub config: DuetConfig,
}

pub async fn connect(options: &EndpointOptions) -> Result<CallService<UserId>> {
    let transport = WebSocketTransport::connect(&options.relay_url, options.identity.clone())
        .await
        .with_context(|| format!("connecting to relay {}", options.relay_url))?;
    let media = options.config.media.build()?;

    let service = CallService::builder(options.identity.clone(), Arc::new(transport), media)
        .with_config(options.config.call.clone())
        .with_history_store(Arc::new(JsonlHistoryStore::new(&options.history_path)))
        .with_tone_sink(Arc::new(TerminalBell))
        .build()?;
    service.start()?;
    println!("✅ Connected to {} as {}", options.relay_url, options.identity);
    Ok(service)
}

fn stdin_lines() -> Input {
    BufReader::new(tokio::io::stdin()).lines()
}

fn print_controls() {
    println!("   Commands: h=hang up  v=video  a=audio  c=camera on/off  m=mute/unmute");
    println!("             s=screen share on/off  d=list devices  d <mic|camera> <device-id>=change device");
}

pub async fn run_call(service: &CallService<UserId>, peer: UserId, media_type: MediaType) -> Result<()> {
    let mut events = service.subscribe_events();
    let mut input = stdin_lines();

    println!("📞 Calling {peer} ({media_type})...");
    let call_id = service.calls().initiate(peer, media_type).await?;
    print_controls();

    drive(service, &mut events, &mut input, call_id).await?;
    service.shutdown().await;
    Ok(())
}

pub async fn run_listen(service: &CallService<UserId>, auto_accept: bool) -> Result<()> {
    let mut events = service.subscribe_events();
    let mut input = stdin_lines();

    println!("👂 Listening for incoming calls...");
    if auto_accept {
        println!("   Auto-accept: enabled");
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(CallEvent::IncomingCall { call_id, caller, media_type }) => {
                    println!("📞 Incoming {media_type} call from {caller}");
                    let accept = auto_accept || prompt_accept(&mut input).await?;
                    let calls = service.calls();
                    if accept {
                        println!("✅ Accepting call...");
                        if let Err(e) = calls.accept().await {
                            println!("❌ Could not accept: {e}");
                            continue;
                        }
                        print_controls();
                        drive(service, &mut events, &mut input, call_id).await?;
                    } else {
                        println!("❌ Rejecting call...");
                        if let Err(e) = calls.reject().await {
                            tracing::debug!(error = %e, "Reject after call already ended");
                        }
                    }
                }
                Ok(other) => {
                    if let Some(line) = describe_event(&other) {
                        println!("{line}");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    service.shutdown().await;
    Ok(())
}

async fn prompt_accept(input: &mut Input) -> Result<bool> {
    println!("   Accept? [y/n]");
    let answer = input.next_line().await?.unwrap_or_default();
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

/// Pump events and keyboard commands until `call_id` ends
async fn drive(
    service: &CallService<UserId>,
    events: &mut broadcast::Receiver<CallEvent<UserId>>,
    input: &mut Input,
    call_id: CallId,
) -> Result<()> {
    let mut stdin_open = true;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(line) = describe_event(&event) {
                        println!("{line}");
                    }
                    if matches!(event, CallEvent::CallEnded { call_id: ended, .. } if ended == call_id) {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
            line = input.next_line(), if stdin_open => match line? {
                Some(line) => {
                    if let Err(e) = run_command(service, line.trim()).await {
                        println!("❌ {e}");
                    }
                }
                None => stdin_open = false,
            },
            _ = tokio::signal::ctrl_c() => {
                service.calls().end().await.ok();
                return Ok(());
            }
        }
    }
}

async fn run_command(service: &CallService<UserId>, line: &str) -> Result<()> {
    let calls = service.calls();
    let mut words = line.split_whitespace();
    match words.next() {
        None => {}
        Some("h" | "hangup") => calls.end().await?,
        Some("v" | "video") => calls.switch_media(MediaType::Video).await?,
        Some("a" | "audio") => calls.switch_media(MediaType::Audio).await?,
        Some("c" | "camera") => {
            let enabled = !current_flag(service, |call| call.local_video_enabled).await;
            calls.set_video_enabled(enabled).await?;
            println!("📷 Camera {}", if enabled { "on" } else { "off" });
        }
        Some("m" | "mute") => {
            let enabled = !current_flag(service, |call| call.microphone_enabled).await;
            calls.set_microphone_enabled(enabled).await?;
            println!("🎙  Microphone {}", if enabled { "on" } else { "muted" });
        }
        Some("s" | "share") => {
            if current_flag(service, |call| call.screen_sharing).await {
                calls.stop_screen_share().await?;
            } else {
                calls.start_screen_share().await?;
            }
        }
        Some("d" | "device") => {
            let source = match words.next() {
                None => {
                    print_devices(&calls.devices());
                    return Ok(());
                }
                Some("mic" | "microphone") => TrackSource::Microphone,
                Some("camera") => TrackSource::Camera,
                Some(other) => anyhow::bail!("unknown device kind: {other}"),
            };
            let device = words.next().context("device id required")?;
            calls.change_device(source, device).await?;
            println!("🔌 Switched {source} to {device}");
        }
        Some(other) => anyhow::bail!("unknown command: {other}"),
    }
    Ok(())
}

fn print_devices(devices: &MediaDevices) {
    println!("🎙  Microphones:");
    for device in &devices.audio {
        println!("     {:<16} {}", device.id, device.name);
    }
    println!("📷 Cameras:");
    for device in &devices.video {
        println!("     {:<16} {}", device.id, device.name);
    }
}

async fn current_flag(
    service: &CallService<UserId>,
    flag: impl FnOnce(&CallSession<UserId>) -> bool,
) -> bool {
    service.calls().current_call().await.is_some_and(|call| flag(&call))
}
