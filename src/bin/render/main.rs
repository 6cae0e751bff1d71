//! render-cli - Drive a render session from the command line.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use glam::Vec3;
use parking_lot::Mutex;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use render_session::buffers::BufferParams;
use render_session::device::kernel::pixel_index;
use render_session::device::{
    Device, DeviceInfo, DeviceRegistry, DeviceType, DrawPixels, DrawRegion, DrawTarget, Kernel, KernelGlobals,
    RegistryConfig, RequestedFeatures,
};
use render_session::session::{Progress, Scene, Session, SessionParams, SessionState};
use render_session::util::SystemClock;

const BUILD_STAMP: &str = env!("RENDER_BUILD_STAMP");

/// Name of the kernel constant holding the camera resolution.
const CAMERA: &str = "camera";

/// Sky gradient over a checkered floor, with per-sample jitter so samples
/// actually converge.
struct DemoKernel;

impl DemoKernel {
    fn shade(u: f32, v: f32) -> Vec3 {
        let horizon = 0.55;
        if v < horizon {
            let t = v / horizon;
            return Vec3::new(0.35, 0.55, 0.95).lerp(Vec3::new(0.95, 0.9, 0.85), t);
        }
        // Perspective floor: rows closer to the horizon are further away.
        let depth = 1.0 / (v - horizon + 0.02);
        let fx = (u - 0.5) * depth * 2.0;
        let fz = depth;
        let checker = ((fx.floor() as i32 + fz.floor() as i32) & 1) == 0;
        let base = if checker { Vec3::splat(0.8) } else { Vec3::new(0.15, 0.12, 0.1) };
        base * (1.0 - (-(v - horizon) * 6.0).exp() * 0.7)
    }
}

impl Kernel for DemoKernel {
    fn name(&self) -> &str {
        "demo"
    }

    fn load(&self, features: &RequestedFeatures) -> render_session::Result<()> {
        tracing::debug!(?features, "demo kernel ready");
        Ok(())
    }

    fn path_trace(
        &self,
        kg: &KernelGlobals,
        buffer: &mut [f32],
        rng_state: &mut [u32],
        _sample: u32,
        x: i32,
        y: i32,
        offset: i32,
        stride: i32,
    ) {
        let film = kg.film();
        let [w, h] = kg.get::<[f32; 2]>(CAMERA).unwrap_or([1.0, 1.0]);
        let index = pixel_index(x, y, offset, stride);

        let rng = rng_state.get_mut(index).map_or(0, |r| {
            *r = lookup3::hash_uint(*r);
            *r
        });
        let jx = (rng & 0xffff) as f32 / 65536.0;
        let jy = (rng >> 16) as f32 / 65536.0;
        let color = Self::shade((x as f32 + jx) / w, (y as f32 + jy) / h);

        let base = index * film.pass_stride as usize + film.pass_combined as usize;
        if let Some(px) = buffer.get_mut(base..base + 4) {
            px[0] += color.x;
            px[1] += color.y;
            px[2] += color.z;
            px[3] += 1.0;
        }
    }
}

/// Keeps the kernel's camera constant in sync with the output size.
#[derive(Default)]
struct DemoScene {
    camera: Mutex<Option<[f32; 2]>>,
}

impl Scene for DemoScene {
    fn resize_camera(&self, width: i32, height: i32) {
        *self.camera.lock() = Some([width as f32, height as f32]);
    }

    fn need_update(&self) -> bool {
        self.camera.lock().is_some()
    }

    fn device_update(&self, device: &dyn Device, _progress: &Progress) {
        if let Some(camera) = self.camera.lock().take() {
            device.const_copy_to(CAMERA, bytemuck::bytes_of(&camera));
        }
    }
}

/// Headless draw loop: display devices convert film on `draw`, the pixels
/// themselves are only needed for the final image.
struct Headless;

impl DrawTarget for Headless {
    fn draw(&mut self, _pixels: DrawPixels<'_>, _region: &DrawRegion) {}
}

struct Options {
    width: i32,
    height: i32,
    samples: Option<u32>,
    tile: Option<i32>,
    device: String,
    threads: usize,
    interactive: bool,
    denoise: bool,
    session_config: Option<PathBuf>,
    device_config: Option<PathBuf>,
    output: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            width: 640,
            height: 360,
            samples: None,
            tile: None,
            device: "CPU".into(),
            threads: 0,
            interactive: false,
            denoise: false,
            session_config: None,
            device_config: None,
            output: None,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();

    let mut level = "info";
    let mut rest: Vec<&str> = Vec::new();
    for arg in &args {
        match arg.as_str() {
            "-v" | "--verbose" => level = "debug",
            "-vv" | "--trace" => level = "trace",
            "-q" | "--quiet" => level = "error",
            _ => rest.push(arg),
        }
    }
    let _guard = init_tracing(level);

    match rest.first().copied() {
        None | Some("h" | "help" | "-h" | "--help") => {
            print_help();
            Ok(())
        }
        Some("d" | "devices") => cmd_devices(&rest[1..]),
        Some("s" | "serve") => cmd_serve(&rest[1..]),
        Some("r" | "render") => cmd_render(&rest[1..]),
        Some(other) => bail!("unknown command '{other}', see 'render-cli help'"),
    }
}

/// Log to stderr, filtered by `RUST_LOG` or the verbosity flags. With
/// `RENDER_TRACE=1` spans also go to `trace.json`.
#[cfg(feature = "profiling")]
fn init_tracing(level: &str) -> Option<tracing_chrome::FlushGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false);

    if env::var("RENDER_TRACE").ok().as_deref() != Some("1") {
        let _ = tracing_subscriber::registry().with(fmt.with_filter(filter)).try_init();
        return None;
    }
    let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new().file("trace.json").build();
    let subscriber = tracing_subscriber::registry().with(chrome_layer).with(fmt.with_filter(filter));
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

/// Log to stderr, filtered by `RUST_LOG` or the verbosity flags.
#[cfg(not(feature = "profiling"))]
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt = tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false);
    let _ = tracing_subscriber::registry().with(fmt.with_filter(filter)).try_init();
}

fn parse_options(args: &[&str]) -> anyhow::Result<Options> {
    let mut opts = Options::default();
    let mut it = args.iter();
    while let Some(&arg) = it.next() {
        let mut value = || it.next().copied().with_context(|| format!("{arg} needs a value"));
        match arg {
            "--width" | "-W" => opts.width = value()?.parse()?,
            "--height" | "-H" => opts.height = value()?.parse()?,
            "--samples" | "-s" => opts.samples = Some(value()?.parse()?),
            "--tile" | "-t" => opts.tile = Some(value()?.parse()?),
            "--device" | "-d" => opts.device = value()?.to_string(),
            "--threads" | "-j" => opts.threads = value()?.parse()?,
            "--config" => opts.session_config = Some(value()?.into()),
            "--devices" => opts.device_config = Some(value()?.into()),
            "--output" | "-o" => opts.output = Some(value()?.into()),
            "--interactive" | "-i" => opts.interactive = true,
            "--denoise" => opts.denoise = true,
            other if other.starts_with('-') => bail!("unknown option '{other}'"),
            // A bare argument is the output path.
            path => opts.output = Some(path.into()),
        }
    }
    if opts.width <= 0 || opts.height <= 0 {
        bail!("resolution {}x{} must be positive", opts.width, opts.height);
    }
    Ok(opts)
}

fn registry(opts: &Options) -> anyhow::Result<DeviceRegistry> {
    let mut config = match &opts.device_config {
        Some(path) => RegistryConfig::load(path)?,
        None => RegistryConfig::default(),
    };
    if opts.threads != 0 {
        config.cpu_threads = opts.threads;
    }
    Ok(DeviceRegistry::new(config))
}

/// Resolve `--device`: a type name, a device id, or `MULTI` for every
/// available device.
fn select_device(registry: &DeviceRegistry, opts: &Options, background: bool) -> anyhow::Result<DeviceInfo> {
    let all = registry.available_devices(None);
    if let Some(info) = all.iter().find(|d| d.id.eq_ignore_ascii_case(&opts.device)) {
        return Ok(info.clone());
    }
    match DeviceRegistry::type_from_name(&opts.device) {
        Some(DeviceType::Multi) => Ok(registry.get_multi_device(&all, opts.threads, background)),
        Some(device_type) => all
            .into_iter()
            .find(|d| d.device_type == device_type)
            .with_context(|| format!("no {} device available", device_type.name())),
        None => bail!("unknown device '{}'", opts.device),
    }
}

fn cmd_devices(args: &[&str]) -> anyhow::Result<()> {
    let opts = parse_options(args)?;
    let registry = registry(&opts)?;
    let types: Vec<&str> = registry.available_types().iter().map(|t| t.name()).collect();
    println!("Backends: {}", types.join(", "));
    for info in registry.available_devices(None) {
        println!("  {:<24} {}", info.id, info.description);
    }
    Ok(())
}

#[cfg(feature = "network")]
fn cmd_serve(args: &[&str]) -> anyhow::Result<()> {
    let (addr, rest) = match args.split_first() {
        Some((addr, rest)) if !addr.starts_with('-') => (*addr, rest),
        _ => ("0.0.0.0:5120", args),
    };
    let opts = parse_options(rest)?;
    let registry = registry(&opts)?;
    let info = select_device(&registry, &opts, true)?;
    let device = registry
        .create(&info, Arc::new(DemoKernel))
        .with_context(|| format!("failed to create device {}", info.id))?;
    let server = render_session::device::DeviceServer::bind(addr, device)?;
    tracing::info!("Serving {} on {}", info.description, server.local_addr()?);
    server.serve()?;
    Ok(())
}

#[cfg(not(feature = "network"))]
fn cmd_serve(_args: &[&str]) -> anyhow::Result<()> {
    bail!("network support not compiled in")
}

fn cmd_render(args: &[&str]) -> anyhow::Result<()> {
    let opts = parse_options(args)?;

    let mut params = match &opts.session_config {
        Some(path) => SessionParams::load(path)?,
        None if opts.interactive => SessionParams::default(),
        None => SessionParams::background(16),
    };
    if let Some(samples) = opts.samples {
        params.samples = samples;
    }
    if let Some(tile) = opts.tile {
        params.tile_size = (tile, tile);
    }
    if opts.threads != 0 {
        params.threads = opts.threads;
    }
    params.run_denoising |= opts.denoise;
    if let Some(output) = opts.output.clone() {
        params.output_path = Some(output);
    }
    params.validate()?;

    let registry = registry(&opts)?;
    let info = select_device(&registry, &opts, params.background)?;
    let device = registry
        .create(&info, Arc::new(DemoKernel))
        .with_context(|| format!("failed to create device {}", info.id))?;

    tracing::info!(
        "render-cli {} ({BUILD_STAMP}): {}x{}, {} samples on {}",
        env!("CARGO_PKG_VERSION"),
        opts.width,
        opts.height,
        params.samples,
        info.description
    );

    let samples = params.samples;
    let interactive = !params.background;
    let output = params.output_path.clone();
    let session = Session::with_scene(params, device, Arc::new(DemoScene::default()), SystemClock::shared())?;
    let buffer_params = BufferParams::new(opts.width, opts.height);
    session.reset(&buffer_params, samples);
    session.start()?;

    let progress = session.progress();
    let mut last = String::new();
    loop {
        if interactive {
            session.draw(&buffer_params, &mut Headless);
        }
        let state = session.state();
        let (status, substatus) = progress.get_status();
        let line = format!("{status} | {substatus}");
        if line != last {
            tracing::info!("{:>5.1}% {}", progress.get_progress() * 100.0, line);
            last = line;
        }
        let finished = match state {
            SessionState::Running | SessionState::Paused | SessionState::Idle => {
                interactive && status == "Rendering Done"
            }
            _ => true,
        };
        if finished {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    if interactive {
        session.cancel("Finished");
    }
    session.wait();

    if progress.get_error() {
        bail!("render failed: {}", progress.get_error_message());
    }
    let (total, render) = progress.get_time();
    tracing::info!("Render time {render:.2}s (total {total:.2}s)");

    if let Some(path) = output {
        write_image(&session, &path)?;
    }
    Ok(())
}

#[cfg(feature = "output")]
fn write_image(session: &Session, path: &std::path::Path) -> anyhow::Result<()> {
    session
        .write_output(path)
        .with_context(|| format!("writing {}", path.display()))
}

#[cfg(not(feature = "output"))]
fn write_image(_session: &Session, path: &std::path::Path) -> anyhow::Result<()> {
    bail!("cannot write {}: image output not compiled in", path.display())
}

fn print_help() {
    println!("render-cli - progressive tile renderer");
    println!();
    println!("USAGE:");
    println!("    render-cli [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("COMMANDS:");
    println!("    r, render [FLAGS] [out.png]   Render the demo scene");
    println!("    d, devices                    List available devices");
    println!("    s, serve  [addr] [FLAGS]      Serve a local device over TCP");
    println!("    h, help                       Show this help");
    println!();
    println!("RENDER FLAGS:");
    println!("    -W, --width <px>         Image width (640)");
    println!("    -H, --height <px>        Image height (360)");
    println!("    -s, --samples <n>        Samples per pixel");
    println!("    -t, --tile <px>          Tile size");
    println!("    -d, --device <name>      CPU, ACCELERATOR, NETWORK, MULTI or a device id");
    println!("    -j, --threads <n>        CPU threads (0 = all cores)");
    println!("    -i, --interactive        Progressive render through the display buffer");
    println!("        --denoise            Denoise tiles as they finish");
    println!("        --config <json>      Session parameters");
    println!("        --devices <json>     Device registry configuration");
    println!("    -o, --output <file>      Write the result as PNG");
    println!();
    println!("OPTIONS:");
    println!("    -v, --verbose    Show debug output");
    println!("    -vv, --trace     Show trace output (very verbose)");
    println!("    -q, --quiet      Only show errors");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG         Log filter, overrides the verbosity flags");
    println!("    RENDER_TRACE=1   Write a chrome trace to trace.json (profiling builds)");
    println!();
    println!("EXAMPLES:");
    println!("    render-cli render -s 64 out.png             # Background render");
    println!("    render-cli render -i -d MULTI out.png       # Interactive on every device");
    println!("    render-cli serve 0.0.0.0:5120               # Render server");
    println!("    render-cli render -d NETWORK --devices net.json out.png");
}
