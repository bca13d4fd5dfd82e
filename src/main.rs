use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use voxlink::voice::{
    AudioOutput, CaptureConstraints, CpalMicrophoneProvider, CpalOutput, Microphone,
    acquire_with_fallback, samples_to_wav, speech_score,
};
use voxlink::{ClientEvent, Collaborators, Config, FileStore, InboundFrame, VoiceClient};

/// Voxlink - real-time duplex voice client
#[derive(Parser)]
#[command(name = "voxlink", version, about)]
struct Cli {
    /// Server endpoint (overrides config and `VOXLINK_URL`)
    #[arg(long)]
    url: Option<String>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// Print the persisted client id
    Whoami,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,voxlink=info",
        1 => "info,voxlink=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(url) = cli.url {
        config.server.url = url;
    }
    tracing::debug!(?config, "loaded configuration");

    match cli.command {
        Some(Command::TestMic { duration }) => test_mic(&config, duration).await,
        Some(Command::TestSpeaker) => test_speaker().await,
        Some(Command::Whoami) => whoami(&config),
        None => interactive(config).await,
    }
}

/// Connect and drive the client from stdin
async fn interactive(config: Config) -> anyhow::Result<()> {
    let collaborators = Collaborators::native(&config);
    let (client, events) = VoiceClient::spawn(config, collaborators);
    let printer = tokio::spawn(print_events(events));

    client.connect().await?;
    println!("commands: /listen /rec /send /unlock /stop /status /quit (anything else is sent as text)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let result = match line {
            "/quit" => break,
            "/listen" => client
                .toggle_listening()
                .await
                .map(|on| println!("listening: {on}")),
            "/rec" => client
                .toggle_recording()
                .await
                .map(|on| println!("recording: {on}")),
            "/send" => client
                .send_audio()
                .await
                .map(|size| println!("sent {size} bytes")),
            "/unlock" => client
                .unlock()
                .await
                .map(|unlocked| println!("audio unlocked: {unlocked}")),
            "/stop" => client.stop_all_audio().await,
            "/status" => client.status().await.map(|status| {
                match serde_json::to_string_pretty(&status) {
                    Ok(json) => println!("{json}"),
                    Err(e) => tracing::warn!(error = %e, "status not printable"),
                }
            }),
            text => client.send_text(text).await,
        };

        if let Err(e) = result {
            tracing::warn!(error = %e, "command failed");
        }
    }

    client.shutdown().await?;
    printer.abort();
    Ok(())
}

async fn print_events(mut events: broadcast::Receiver<ClientEvent>) {
    loop {
        match events.recv().await {
            Ok(ClientEvent::Message(InboundFrame::Text(text))) => println!("< {text}"),
            Ok(ClientEvent::Message(InboundFrame::Raw(raw))) => println!("< (raw) {raw}"),
            Ok(ClientEvent::Message(_) | ClientEvent::AudioReceived { .. }) => {}
            Ok(ClientEvent::StatusChanged(state)) => println!("* {state}"),
            Ok(ClientEvent::Error(e)) => println!("! {e}"),
            Ok(ClientEvent::PlaybackBlocked { message_id, .. }) => {
                println!("! audio for {message_id} is blocked, type /unlock");
            }
            Ok(event) => tracing::debug!(?event, "client event"),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "event printer lagging");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Test microphone input
async fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let provider = CpalMicrophoneProvider::new();
    let (mut microphone, fell_back) = acquire_with_fallback(
        &provider,
        &CaptureConstraints::preferred(config.capture.sample_rate),
    )
    .await?;
    let tap = microphone.tap();

    println!("Sample rate: {} Hz (fallback: {fell_back})", tap.sample_rate());
    println!("---");

    for i in 0..duration {
        tokio::time::sleep(Duration::from_secs(1)).await;

        let samples = tap.take();
        let score = speech_score(&samples);
        let peak = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (score * 50.0) as usize;
        let meter = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);

        println!("[{:2}s] speech: {score:.2} | peak: {peak:.4} | [{meter}]", i + 1);
    }

    microphone.release();

    println!("\n---");
    println!("If the meter moved while you spoke, your mic is working!");
    println!("If it stayed empty, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let sample_rate = 24_000_u32;
    let frequency = 440.0_f32;

    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..sample_rate * 2)
        .map(|i| {
            let t = i as f32 / sample_rate as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3
        })
        .collect();

    let wav = samples_to_wav(&samples, sample_rate)?;
    let output = CpalOutput::new();
    println!("Output context: {:?}", output.context_state());
    output.play(&wav, "wav").await?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

/// Print the persisted client id
fn whoami(config: &Config) -> anyhow::Result<()> {
    let store = FileStore::new(&config.identity.store_path);
    let id = voxlink::identity::client_id(&store)?;
    let url = voxlink::identity::endpoint_url(&config.server.url, &id)?;
    println!("client id: {id}");
    println!("endpoint:  {url}");
    println!("store:     {}", store.path().display());
    Ok(())
}
