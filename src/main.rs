use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::info;
use snapframe::platform::{Capabilities, HeadlessPlatform, ReadyState, SimulatedVideo};
use snapframe::tier::{video_sources, TierName, TierRecord, BUTTON_MODES};
use snapframe::{CaptureConfig, CaptureStatus, PhaseSynchronizer, SyncPolicy};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "snapframe", about = "Export panels as images and simulate synced video groups")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Export one subtree of an HTML page as a PNG
    Capture {
        /// HTML file to load
        html: PathBuf,
        /// Selector of the subtree to export (`#id`, `.class`, `tag`, `[attr]`)
        #[arg(long)]
        root: String,
        /// Origin the page is served from
        #[arg(long)]
        origin: String,
        /// Absolute image relay endpoint (defaults to the configured path on the origin)
        #[arg(long)]
        relay: Option<String>,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        #[arg(long, default_value = "snapframe.png")]
        file_name: String,
        #[arg(long)]
        pixel_ratio: Option<f32>,
        #[arg(long)]
        background: Option<String>,
        /// Also used to pick raster strategies
        #[arg(long)]
        user_agent: Option<String>,
        /// JSON file with capture settings
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run a simulated video group and print the drift after each correction
    SyncSim {
        /// JSON file mapping play mode to a tier record or null
        #[arg(long)]
        tiers: Option<PathBuf>,
        #[arg(long, default_value_t = 3)]
        seconds: u64,
        /// Playback rate spread between members (0.05 = +/-5%)
        #[arg(long, default_value_t = 0.05)]
        skew: f64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Capture {
            html,
            root,
            origin,
            relay,
            out_dir,
            file_name,
            pixel_ratio,
            background,
            user_agent,
            config,
        } => {
            let mut cfg = match config {
                Some(path) => CaptureConfig::from_json(
                    &std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
                )?,
                None => CaptureConfig::default(),
            };
            if let Some(ua) = user_agent {
                cfg.user_agent = ua;
            }
            capture(CaptureArgs {
                html,
                root,
                origin,
                relay,
                out_dir,
                file_name,
                pixel_ratio,
                background,
                config: cfg,
            })
            .await
        }
        Command::SyncSim { tiers, seconds, skew } => sync_sim(tiers, seconds, skew).await,
    }
}

struct CaptureArgs {
    html: PathBuf,
    root: String,
    origin: String,
    relay: Option<String>,
    out_dir: PathBuf,
    file_name: String,
    pixel_ratio: Option<f32>,
    background: Option<String>,
    config: CaptureConfig,
}

#[cfg(all(feature = "html", feature = "relay"))]
async fn capture(args: CaptureArgs) -> anyhow::Result<()> {
    use snapframe::capture::{Capturer, SaveOptions};
    use snapframe::fetch::{Fetch, HttpFetcher, RelayFetcher};

    let markup = std::fs::read_to_string(&args.html).with_context(|| format!("reading {}", args.html.display()))?;
    let doc = snapframe::dom::html::parse_document(&markup, &args.origin)?;
    let Some(root) = doc.query_selector(&args.root) else {
        bail!("no element matches {:?}", args.root);
    };

    let platform = Arc::new(
        HeadlessPlatform::new()
            .with_capabilities(Capabilities::from_user_agent(&args.config.user_agent))
            .with_output_dir(&args.out_dir),
    );
    let fetcher: Arc<dyn Fetch> = Arc::new(HttpFetcher::new(&args.config)?);
    let mut capturer = Capturer::new(doc, platform.clone(), fetcher.clone(), args.config)?;
    if let Some(endpoint) = &args.relay {
        capturer = capturer.with_relay(Arc::new(RelayFetcher::new(endpoint, fetcher)?));
    }

    let mut options = SaveOptions::new(&args.file_name);
    if let Some(ratio) = args.pixel_ratio {
        options = options.with_pixel_ratio(ratio);
    }
    if let Some(color) = &args.background {
        options = options.with_background(color);
    }

    match capturer.save_as_image(root, options).await {
        CaptureStatus::Saved { file_name, bytes } => {
            info!("wrote {} ({} bytes)", args.out_dir.join(file_name).display(), bytes);
            Ok(())
        }
        CaptureStatus::Skipped => bail!("another export was in flight"),
        CaptureStatus::Failed(reason) => bail!("export failed: {}", reason),
    }
}

#[cfg(not(all(feature = "html", feature = "relay")))]
async fn capture(_args: CaptureArgs) -> anyhow::Result<()> {
    bail!("the capture command needs the `html` and `relay` features")
}

fn default_tiers() -> BTreeMap<u32, Option<TierRecord>> {
    ["Iron 3", "Silver 1", "Platinum 2", "Grand Master"]
        .iter()
        .zip(BUTTON_MODES)
        .map(|(name, mode)| {
            (
                mode,
                Some(TierRecord {
                    tier: TierName { name: name.to_string() },
                    tier_point: 0.0,
                }),
            )
        })
        .collect()
}

async fn sync_sim(tiers: Option<PathBuf>, seconds: u64, skew: f64) -> anyhow::Result<()> {
    let records = match tiers {
        Some(path) => serde_json::from_str(
            &std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?,
        )
        .with_context(|| format!("parsing {}", path.display()))?,
        None => default_tiers(),
    };
    let sources = video_sources(&records);
    if sources.is_empty() {
        bail!("no tier maps to a video");
    }

    let policy = SyncPolicy::default();
    let period = policy.period();
    let sync = PhaseSynchronizer::new(Arc::new(HeadlessPlatform::new()), policy)?;
    let offsets = [0.0, 1.0, -1.0, 2.0, -2.0];
    for (i, (mode, path)) in sources.iter().enumerate() {
        let video = SimulatedVideo::new()
            .with_rate(1.0 + skew * offsets[i % offsets.len()])
            .with_latency(Duration::from_millis(10 * i as u64), Duration::from_millis(35 * i as u64))
            .with_ready_state(ReadyState::HaveEnoughData);
        info!("mode {} -> {}", mode, path);
        sync.register(&format!("mode-{}", mode), Arc::new(video)).await;
    }
    sync.set_intersection(1.0).await;
    for (mode, _) in &sources {
        sync.mark_ready(&format!("mode-{}", mode)).await;
    }
    println!("start: phase {:?}, drift {:.3}s", sync.phase(), sync.drift());

    let ticks = (seconds * 1000 / period.as_millis().max(1) as u64).max(1);
    for _ in 0..ticks {
        tokio::time::sleep(period).await;
        println!("tick {:>3}: drift {:.3}s", sync.ticks(), sync.drift());
    }
    sync.unmount().await;
    Ok(())
}
