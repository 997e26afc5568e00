//! sayaka - Misskey stream client for SIXEL terminals.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use log::warn;
use sayaka_image::{parse_color, ColorMode, ImageOpt};

mod cache;
mod config;
mod fetch;
mod mfm;
mod ngword;
mod note;
mod printer;
mod stream;
mod style;
mod terminal;
mod time;

use cache::CacheDir;
use config::{BgTheme, Config, Nsfw, Screen};
use ngword::NgWords;
use style::StyleSheet;

#[derive(Parser)]
#[command(
    name = "sayaka",
    version,
    about = "Misskey stream client",
    after_help = "One of --home, --local or --play selects the mode."
)]
struct Cli {
    /// Home timeline mode (needs --server and --token)
    #[arg(long)]
    home: bool,

    /// Local timeline mode (needs --server)
    #[arg(short = 'l', long)]
    local: bool,

    /// Playback mode; '-' means stdin
    #[arg(short = 'p', long, value_name = "FILE")]
    play: Option<String>,

    /// Misskey server host
    #[arg(short = 's', long, value_name = "HOST")]
    server: Option<String>,

    /// Access token file
    #[arg(short = 't', long, value_name = "FILE")]
    token: Option<PathBuf>,

    /// Color mode: 256, 16, 8, 2, 1 or gray[2-256]
    #[arg(short = 'c', long, default_value = "256")]
    color: String,

    /// Assume a dark background
    #[arg(long)]
    dark: bool,

    /// Assume a light background
    #[arg(long)]
    light: bool,

    /// Width of Unicode EAW Ambiguous characters
    #[arg(long, value_name = "1|2", default_value_t = 2)]
    eaw_a: u32,

    /// Width of Unicode EAW Neutral characters
    #[arg(long, value_name = "1|2", default_value_t = 1)]
    eaw_n: u32,

    /// Output in EUC-JP
    #[arg(long)]
    euc_jp: bool,

    /// Output in ISO-2022-JP
    #[arg(long)]
    jis: bool,

    /// Font size; normally autodetected
    #[arg(long, value_name = "WxH")]
    font: Option<String>,

    /// Max images per row; 0 means as many as fit
    #[arg(long, value_name = "N", default_value_t = 0)]
    max_image_cols: u32,

    /// How to show NSFW contents
    #[arg(long, value_name = "hide|alt|blur|show", default_value = "blur")]
    nsfw: String,

    /// Ignore cache files and rewrite them
    #[arg(long)]
    overwrite_cache: bool,

    /// Show startup progress (for slow machines)
    #[arg(long)]
    progress: bool,

    /// Append every raw JSON message to FILE
    #[arg(short = 'r', long, value_name = "FILE")]
    record: Option<PathBuf>,

    /// Open the CW (Content Warning) part
    #[arg(long)]
    show_cw: bool,

    /// Whether to output SIXEL images
    #[arg(long, value_name = "auto|yes|no", default_value = "auto")]
    show_image: String,

    /// Output SIXEL in OR mode
    #[arg(long)]
    sixel_or: bool,

    /// Connection timeout for images, in milliseconds
    #[arg(long, value_name = "MSEC", default_value_t = 3000)]
    timeout_image: u64,

    /// Log level spec (flexi_logger syntax)
    #[arg(long, value_name = "SPEC", default_value = "warn")]
    debug: String,
}

pub struct App {
    pub cfg: Config,
    pub screen: Screen,
    pub styles: StyleSheet,
    pub ngwords: NgWords,
    pub cache: CacheDir,
    pub http: reqwest::Client,

    pub indent_depth: u32,
    pub image_count: u32,
    pub image_next_cols: u32,
    pub image_max_rows: u32,
}

enum Command {
    Stream { home: bool },
    Play { file: Option<PathBuf> },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("sayaka: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _logger = flexi_logger::Logger::try_with_env_or_str(&cli.debug)?
        .log_to_stderr()
        .start()?;

    let command = if cli.home {
        Command::Stream { home: true }
    } else if cli.local {
        Command::Stream { home: false }
    } else if let Some(play) = &cli.play {
        Command::Play {
            file: if play == "-" {
                None
            } else {
                Some(PathBuf::from(play))
            },
        }
    } else {
        bail!("one of --home, --local or --play is required");
    };

    if !(1..=2).contains(&cli.eaw_a) {
        bail!("--eaw-a {}: must be either 1 or 2", cli.eaw_a);
    }
    if !(1..=2).contains(&cli.eaw_n) {
        bail!("--eaw-n {}: must be either 1 or 2", cli.eaw_n);
    }
    if cli.euc_jp || cli.jis {
        warn!("codeset conversion is not available; output stays UTF-8");
    }

    // The color flag picks both the image palette and the text decoration
    // level: 1 is monochrome images with no decoration at all, 2 keeps
    // bold.
    let mut imageopt = ImageOpt::default();
    let colormode;
    if cli.color == "1" {
        colormode = 1;
        imageopt.color = ColorMode::Gray(2);
    } else {
        imageopt.color = parse_color(&cli.color)
            .with_context(|| format!("{}: invalid color mode", cli.color))?;
        colormode = match imageopt.color {
            ColorMode::Gray(_) => 2,
            ColorMode::Rgb8 => 8,
            ColorMode::Vga16 => 16,
            _ => 256,
        };
    }
    // Low color counts profit from attenuated error diffusion.
    if colormode <= 8 {
        imageopt.cdm = 96;
    }
    imageopt.output_ormode = cli.sixel_or;

    let nsfw = match cli.nsfw.as_str() {
        "hide" => Nsfw::Hide,
        "alt" => Nsfw::Alt,
        "blur" => Nsfw::Blur,
        "show" => Nsfw::Show,
        _ => bail!("--nsfw must be 'show', 'blur', 'alt', or 'hide'"),
    };

    let font_override = match &cli.font {
        None => None,
        Some(spec) => {
            let (w, h) = spec
                .split_once('x')
                .and_then(|(w, h)| Some((w.parse::<u32>().ok()?, h.parse::<u32>().ok()?)))
                .filter(|&(w, h)| w >= 1 && h >= 1)
                .with_context(|| format!("--font {}: argument must be <W>x<H>", spec))?;
            Some((w, h))
        }
    };

    let progress = |msg: &str| {
        if cli.progress {
            print!("{}", msg);
            let _ = std::io::stdout().flush();
        }
    };

    // ~/.sayaka and its cache directory.
    let home_dir = std::env::var("HOME").unwrap_or_default();
    let basedir = PathBuf::from(home_dir).join(".sayaka");
    let cachedir = basedir.join("cache");
    fs::create_dir_all(&cachedir).with_context(|| cachedir.display().to_string())?;

    // A missing or empty rule file is fine; a broken one is fatal.
    let ngwords = NgWords::load(&basedir.join("ngword.json")).unwrap_or_else(|e| {
        eprintln!("sayaka: {:#}", e);
        std::process::exit(1);
    });

    // Background theme: flags win, then the terminal is asked, then light.
    let is_tty = terminal::is_tty();
    let bgtheme = if cli.dark {
        BgTheme::Dark
    } else if cli.light {
        BgTheme::Light
    } else if is_tty && colormode > 2 {
        progress("Checking background color...");
        match terminal::bgcolor() {
            Some(theme) => {
                progress(if theme == BgTheme::Light { "light\n" } else { "dark\n" });
                theme
            }
            None => {
                progress("done\n");
                warn!("terminal doesn't support the query; assume --light");
                BgTheme::Light
            }
        }
    } else {
        BgTheme::Light
    };

    let show_image = match cli.show_image.as_str() {
        "yes" => true,
        "no" => false,
        "auto" => {
            if is_tty {
                progress("Checking whether the terminal supports sixel...");
                let s = terminal::support_sixel();
                progress(if s { "yes\n" } else { "no\n" });
                s
            } else {
                false
            }
        }
        _ => bail!("--show-image must be one of [ auto | no | yes ]"),
    };

    let colorname = config::colorname_of(imageopt.color);
    let cfg = Config {
        colormode,
        colorname,
        bgtheme,
        eaw_a: cli.eaw_a,
        eaw_n: cli.eaw_n,
        nsfw,
        show_cw: cli.show_cw,
        show_image,
        max_image_cols: cli.max_image_cols,
        overwrite_cache: cli.overwrite_cache,
        record_file: cli.record.clone(),
        imageopt,
        image_timeout: Duration::from_millis(cli.timeout_image),
        font_override,
    };

    terminal::install_sigint();

    let styles = StyleSheet::new(cfg.colormode, cfg.bgtheme);
    let screen = Screen::probe(cfg.font_override);
    let http = reqwest::Client::builder()
        .user_agent(concat!("sayaka/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let mut app = App {
        cfg,
        screen,
        styles,
        ngwords,
        cache: CacheDir::new(cachedir),
        http,
        indent_depth: 0,
        image_count: 0,
        image_next_cols: 0,
        image_max_rows: 0,
    };

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match command {
        Command::Stream { home } => {
            let server = cli
                .server
                .as_deref()
                .context("server must be specified")?;
            let token = match &cli.token {
                Some(path) => Some(read_token(path)?),
                None if home => bail!("Home timeline requires your access token"),
                None => None,
            };

            progress("Deleting expired cache files...");
            app.cache.prune();
            progress("done\n");

            rt.block_on(stream::stream(&mut app, server, home, token.as_deref()))
        }
        Command::Play { file } => rt.block_on(stream::play(&mut app, file.as_deref())),
    }
}

/// First line of the token file.
fn read_token(path: &std::path::Path) -> anyhow::Result<String> {
    let body = fs::read_to_string(path).with_context(|| path.display().to_string())?;
    let token = body.lines().next().unwrap_or("").trim().to_string();
    if token.is_empty() {
        bail!("{}: No token found", path.display());
    }
    Ok(token)
}
