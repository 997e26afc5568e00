//! sixelv - render images as SIXEL (or BMP / ASCII) on the terminal.

use std::fs::File;
use std::io::{Read, Write};
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context};
use clap::{ArgAction, Parser};
use log::debug;

use sayaka_image::{
    ascii, blurhash, bmp, loader, parse_color, peek::PeekStream, preferred_size, reduce, sixel,
    Diffusion, Image, ImageOpt, ReduceMethod, ResizeAxis,
};

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Sixel,
    Bmp,
    Ascii,
}

#[derive(Parser)]
#[command(name = "sixelv", version, about = "SIXEL viewer", disable_help_flag = true)]
struct Cli {
    /// Color mode: 256, adaptive[N], fixed256, xterm256, 16, 8, 2, gray[N]
    #[arg(short = 'c', long, value_name = "COLOR", default_value = "256")]
    color: String,

    /// Resize width in pixels
    #[arg(short = 'w', long, value_name = "WIDTH")]
    width: Option<u32>,

    /// Resize height in pixels
    #[arg(short = 'h', long, value_name = "HEIGHT")]
    height: Option<u32>,

    /// Reduction method: none(simple) or high
    #[arg(short = 'r', long = "reduction", value_name = "METHOD", default_value = "high")]
    reduction: String,

    /// Diffusion: sfl, fs, atkinson, jajuni, stucki, burkes, 2, 3, rgb, none
    #[arg(short = 'd', long = "diffusion", value_name = "TYPE")]
    diffusion: Option<String>,

    /// Origin axis for resizing
    #[arg(long, value_name = "AXIS", default_value = "both")]
    resize_axis: String,

    /// Output gain between 0.0 and 2.0
    #[arg(long, value_name = "GAIN")]
    gain: Option<f32>,

    /// Differential color diffusion attenuator, 0.0 to 1.0
    #[arg(long, value_name = "CDM")]
    cdm: Option<f32>,

    /// Output format: sixel, bmp or ascii
    #[arg(short = 'O', long = "output-format", value_name = "FMT", default_value = "sixel")]
    output_format: String,

    /// Output filename; '-' means stdout
    #[arg(short = 'o', value_name = "FILE")]
    output: Option<String>,

    /// Page (frame) number for animated inputs
    #[arg(short = 'p', long, value_name = "PAGE", default_value_t = 0)]
    page: u32,

    /// Decode blurhash at its intrinsic size and scale by resampling
    #[arg(long, visible_alias = "bn")]
    blurhash_nearest: bool,

    /// Output SIXEL in OR mode
    #[arg(long)]
    sixel_or: bool,

    /// Make the SIXEL background transparent
    #[arg(long)]
    sixel_transbg: bool,

    /// Suppress the SIXEL palette definition block
    #[arg(long)]
    suppress_palette: bool,

    /// Show each input filename before its image
    #[arg(short = 'v')]
    show_filename: bool,

    /// Continue with the next file after an error
    #[arg(short = 'i', long)]
    ignore_error: bool,

    /// Show the supported filetype and decoder list
    #[arg(long)]
    list: bool,

    /// Log level spec (flexi_logger syntax)
    #[arg(long, value_name = "SPEC", default_value = "warn")]
    debug: String,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    help: Option<bool>,

    /// Input files, '-' means stdin
    #[arg(value_name = "FILE|URL")]
    files: Vec<String>,
}

/// Whether the SIGINT handler must close an in-flight SIXEL on stdout.
static SIXEL_TO_STDOUT: AtomicBool = AtomicBool::new(false);

extern "C" fn sigint_handler(_: libc::c_int) {
    unsafe {
        if SIXEL_TO_STDOUT.load(Ordering::Relaxed) {
            libc::write(
                libc::STDOUT_FILENO,
                b"\x18\x1b\\".as_ptr() as *const libc::c_void,
                3,
            );
        }
        libc::_exit(0);
    }
}

fn parse_diffusion(s: &str) -> Option<Diffusion> {
    Some(match s {
        "none" => Diffusion::None,
        "sfl" => Diffusion::Sfl,
        "fs" => Diffusion::Fs,
        "atkinson" => Diffusion::Atkinson,
        "jajuni" => Diffusion::Jajuni,
        "stucki" => Diffusion::Stucki,
        "burkes" => Diffusion::Burkes,
        "2" => Diffusion::Two,
        "3" => Diffusion::Three,
        "rgb" => Diffusion::Rgb,
        _ => return None,
    })
}

fn parse_axis(s: &str) -> Option<ResizeAxis> {
    Some(match s {
        "both" => ResizeAxis::Both,
        "width" => ResizeAxis::Width,
        "height" => ResizeAxis::Height,
        "long" => ResizeAxis::Long,
        "short" => ResizeAxis::Short,
        "scaledown-both" | "sdboth" => ResizeAxis::ScaledownBoth,
        "scaledown-width" | "sdwidth" => ResizeAxis::ScaledownWidth,
        "scaledown-height" | "sdheight" => ResizeAxis::ScaledownHeight,
        "scaledown-long" | "sdlong" => ResizeAxis::ScaledownLong,
        "scaledown-short" | "sdshort" => ResizeAxis::ScaledownShort,
        _ => return None,
    })
}

/// Cell size for ASCII output; 7x14 when the terminal will not say.
fn font_size() -> (u32, u32) {
    let mut w = 0u32;
    let mut h = 0u32;
    unsafe {
        if libc::isatty(libc::STDOUT_FILENO) != 0 {
            let mut ws = MaybeUninit::<libc::winsize>::uninit();
            if libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, ws.as_mut_ptr()) == 0 {
                let ws = ws.assume_init();
                if ws.ws_col != 0 {
                    w = ws.ws_xpixel as u32 / ws.ws_col as u32;
                }
                if ws.ws_row != 0 {
                    h = ws.ws_ypixel as u32 / ws.ws_row as u32;
                }
            }
        }
    }
    (if w == 0 { 7 } else { w }, if h == 0 { 14 } else { h })
}

struct Job {
    opt: ImageOpt,
    axis: ResizeAxis,
    width: u32,
    height: u32,
    page: u32,
    blurhash_nearest: bool,
    format: OutputFormat,
    output: Option<String>,
    font: (u32, u32),
}

fn main() {
    if let Err(e) = run() {
        eprintln!("sixelv: {:#}", e);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _logger = flexi_logger::Logger::try_with_env_or_str(&cli.debug)?
        .log_to_stderr()
        .start()?;

    if cli.list {
        for (name, lib) in loader::loader_info() {
            println!("{:8} {}", name, lib);
        }
        return Ok(());
    }

    let mut opt = ImageOpt::default();
    opt.color = parse_color(&cli.color)
        .with_context(|| format!("{}: invalid color mode", cli.color))?;
    opt.method = match cli.reduction.as_str() {
        "none" | "simple" => ReduceMethod::Simple,
        "high" => ReduceMethod::HighQuality,
        other => bail!("invalid reductor method '{}'", other),
    };
    if let Some(d) = &cli.diffusion {
        opt.diffuse = parse_diffusion(d).with_context(|| format!("invalid diffusion '{}'", d))?;
    }
    if let Some(gain) = cli.gain {
        if !(0.0..=2.0).contains(&gain) {
            bail!("invalid gain");
        }
        opt.gain = (gain * 256.0) as i32;
        if opt.gain == 256 {
            opt.gain = -1;
        }
    }
    if let Some(cdm) = cli.cdm {
        if !(0.0..=1.0).contains(&cdm) {
            bail!("invalid value: {}", cdm);
        }
        opt.cdm = (cdm * 256.0) as u32;
    }
    opt.output_ormode = cli.sixel_or;
    opt.output_transbg = cli.sixel_transbg;
    opt.suppress_palette = cli.suppress_palette;

    let axis = parse_axis(&cli.resize_axis)
        .with_context(|| format!("invalid resize axis '{}'", cli.resize_axis))?;

    let format = match cli.output_format.as_str() {
        "sixel" => OutputFormat::Sixel,
        "bmp" => OutputFormat::Bmp,
        "ascii" => OutputFormat::Ascii,
        other => bail!("invalid output format '{}'", other),
    };

    if cli.files.is_empty() {
        bail!("no input files");
    }
    let output = cli.output.clone().filter(|o| o != "-");
    if output.is_some() && cli.files.len() > 1 {
        bail!("-o <output_filename> cannot be used with multiple input files");
    }

    let job = Job {
        opt,
        axis,
        width: cli.width.unwrap_or(0),
        height: cli.height.unwrap_or(0),
        page: cli.page,
        blurhash_nearest: cli.blurhash_nearest,
        format,
        output,
        font: if format == OutputFormat::Ascii {
            font_size()
        } else {
            (7, 14)
        },
    };

    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
    if job.format == OutputFormat::Sixel {
        SIXEL_TO_STDOUT.store(job.output.is_none(), Ordering::Relaxed);
        let handler = sigint_handler as extern "C" fn(libc::c_int);
        unsafe {
            libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        }
    }

    for name in &cli.files {
        let infile = if name == "-" { None } else { Some(name.as_str()) };
        if let Some(name) = infile {
            if cli.show_filename {
                println!("{}", name);
            }
        }
        if let Err(e) = do_file(&job, infile) {
            eprintln!("sixelv: {}: {:#}", infile.unwrap_or("stdin"), e);
            if !cli.ignore_error {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn open_input(infile: Option<&str>) -> anyhow::Result<Box<dyn Read>> {
    match infile {
        None => Ok(Box::new(std::io::stdin())),
        Some(url) if url.starts_with("http://") || url.starts_with("https://") => {
            let resp = reqwest::blocking::get(url)?;
            if !resp.status().is_success() {
                bail!("connection failed: HTTP {}", resp.status());
            }
            Ok(Box::new(resp))
        }
        Some(path) => Ok(Box::new(File::open(path)?)),
    }
}

fn do_file(job: &Job, infile: Option<&str>) -> anyhow::Result<()> {
    let mut ps = PeekStream::new(open_input(infile)?);

    let (srcimg, dst_width, dst_height) = match loader::sniff(&mut ps)? {
        Some(kind) => {
            // Loaders may use the size as a decode hint; the final size is
            // still negotiated from what actually came back.
            let hint = loader::ReadHint {
                axis: job.axis,
                width: job.width,
                height: job.height,
                page: job.page,
            };
            let img = loader::read(&mut ps, kind, &hint)?;
            let (w, h) = preferred_size(img.width, img.height, job.axis, job.width, job.height);
            (img, w, h)
        }
        // Not a known binary format; it may still be a blurhash.
        None => read_blurhash(job, &mut ps)?,
    };

    // For ASCII output pixels become character cells.
    let (dst_width, dst_height) = if job.format == OutputFormat::Ascii {
        (
            dst_width.div_ceil(job.font.0),
            dst_height.div_ceil(job.font.1),
        )
    } else {
        (dst_width, dst_height)
    };

    debug!(
        "InputSize=({}, {}) OutputSize=({}, {}) OutputColor={}",
        srcimg.width, srcimg.height, dst_width, dst_height, job.opt.color
    );

    if dst_width == 0 || dst_height == 0 {
        bail!("output size ({}, {}) is too small", dst_width, dst_height);
    }

    let srcimg = srcimg.convert_to16();
    let resimg = reduce::reduct(&srcimg, dst_width, dst_height, &job.opt)
        .context("reductor failed")?;

    let mut out: Box<dyn Write> = match &job.output {
        None => Box::new(std::io::stdout()),
        Some(path) => Box::new(File::create(path).with_context(|| path.clone())?),
    };

    match job.format {
        OutputFormat::Sixel => sixel::sixel_write(&mut out, &resimg, &job.opt)?,
        OutputFormat::Bmp => bmp::bmp_write(&mut out, &resimg)?,
        OutputFormat::Ascii => ascii::ascii_write(&mut out, &resimg, &job.opt)?,
    }
    out.flush()?;

    Ok(())
}

/// Blurhash sizing:
///
/// | -w,-h | --bn | generated      | resized to |
/// |-------|------|----------------|------------|
/// | no    | no   | 20x components | as is      |
/// | yes   | no   | W x H          | as is      |
/// | no    | yes  | components     | 20x        |
/// | yes   | yes  | components     | W x H      |
fn read_blurhash(
    job: &Job,
    ps: &mut PeekStream<Box<dyn Read>>,
) -> anyhow::Result<(Image, u32, u32)> {
    let (bw, bh) = if job.blurhash_nearest {
        (-1, -1)
    } else if job.width == 0 && job.height == 0 {
        (-20, -20)
    } else if job.width > 0 && job.height > 0 {
        (job.width as i32, job.height as i32)
    } else {
        // One dimension given; the hash has no usable aspect, so square.
        let n = job.width.max(job.height) as i32;
        (n, n)
    };

    let mut reader = ps.read_handle();
    let srcimg = blurhash::read(&mut reader, bw, bh).context("unknown image format")?;

    let (dst_w, dst_h) = if job.blurhash_nearest {
        if job.width == 0 && job.height == 0 {
            (srcimg.width * 20, srcimg.height * 20)
        } else if job.width > 0 && job.height > 0 {
            (job.width, job.height)
        } else {
            let n = job.width.max(job.height);
            (n, n)
        }
    } else {
        (srcimg.width, srcimg.height)
    };

    Ok((srcimg, dst_w, dst_h))
}
