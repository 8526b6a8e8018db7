// std
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
// others
use anyhow::{Context, Result};
use structopt::StructOpt;
use tracing::info;
use tracing_subscriber::EnvFilter;
// wavert
use wavert::integrators::{render_sensor, RenderControl};
use wavert::previewer::Previewer;
use wavert::scene::loader::{load_scene_text, parse_tonemap, parse_tonemap_mode};
use wavert::scene::Scene;
use wavert::stats::{Registry, StatsSink};

#[derive(Debug, StructOpt)]
#[structopt(name = "wavert", about = "Physically-based wave-optics light transport")]
enum Cli {
    /// Render a scene to OpenEXR (and optionally PNG previews).
    Render(RenderOpts),
    /// Render with live preview pushed to a tev instance over TCP.
    Preview(PreviewOpts),
    /// Print scene information.
    Info(InfoOpts),
}

#[derive(Debug, StructOpt)]
struct CommonOpts {
    /// Scene description file
    #[structopt(parse(from_os_str))]
    scene: PathBuf,
    /// Number of worker threads (0 = all cores)
    #[structopt(short = "t", long, default_value = "0")]
    threads: usize,
    /// Scene-loader defines, -D key=value
    #[structopt(short = "D", number_of_values = 1)]
    defines: Vec<String>,
}

#[derive(Debug, StructOpt)]
struct RenderOpts {
    #[structopt(flatten)]
    common: CommonOpts,
    /// Output file prefix
    #[structopt(short = "o", long, default_value = "")]
    output: String,
    /// Also write tone-mapped PNG previews
    #[structopt(long)]
    png: bool,
    /// Tonemap operator: linear | gamma(G) | srgb | db(MIN..MAX) | function(EXPR)
    #[structopt(long, default_value = "srgb")]
    tonemap: String,
    /// Tonemap mode: select:N | normal | colourmap:NAME
    #[structopt(long)]
    tonemap_mode: Option<String>,
    /// Print statistics counters after rendering
    #[structopt(long)]
    stats: bool,
}

#[derive(Debug, StructOpt)]
struct PreviewOpts {
    #[structopt(flatten)]
    render: RenderOpts,
    /// Previewer host (tev IPC over TCP)
    #[structopt(long, default_value = "127.0.0.1")]
    host: String,
    /// Previewer port
    #[structopt(long, default_value = "14158")]
    port: u16,
    /// Preview update interval, milliseconds
    #[structopt(long, default_value = "1000")]
    interval_ms: u64,
}

#[derive(Debug, StructOpt)]
struct InfoOpts {
    #[structopt(flatten)]
    common: CommonOpts,
    /// Dump as JSON
    #[structopt(long)]
    json: bool,
}

fn parse_defines(defines: &[String]) -> Result<Vec<(String, String)>> {
    defines
        .iter()
        .map(|d| {
            let mut it = d.splitn(2, '=');
            match (it.next(), it.next()) {
                (Some(k), Some(v)) => Ok((k.to_string(), v.to_string())),
                _ => anyhow::bail!("bad define '{}', expected key=value", d),
            }
        })
        .collect()
}

fn load(common: &CommonOpts) -> Result<Scene> {
    if common.threads > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(common.threads)
            .build_global()
            .ok();
    }
    let text = std::fs::read_to_string(&common.scene)
        .with_context(|| format!("reading {}", common.scene.display()))?;
    let defines = parse_defines(&common.defines)?;
    let base = common
        .scene
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let loaded = load_scene_text(&text, &base, &defines)?;
    let sink: Arc<dyn wavert::stats::StatsSink> = Arc::new(RegistryProxy);
    let scene = Scene::build(
        loaded.shapes,
        loaded.emitters,
        loaded.sensors,
        loaded.integrator,
        loaded.options,
        Some(sink),
        Some(&|fraction, status| {
            if !status.is_empty() {
                info!(fraction, status, "build");
            }
        }),
    )?;
    Ok(scene)
}

// forwards stats events into the process-wide registry
struct RegistryProxy;
impl wavert::stats::StatsSink for RegistryProxy {
    fn counter_add(&self, name: &'static str, value: u64) {
        Registry::global().counter_add(name, value);
    }
    fn event(
        &self,
        name: &'static str,
        labels: &'static [&'static str],
        category: usize,
        count: u64,
    ) {
        Registry::global().event(name, labels, category, count);
    }
    fn histogram(&self, name: &'static str, value: u64) {
        Registry::global().histogram(name, value);
    }
}

fn run_render(opts: &RenderOpts, previewer: Option<(&Previewer, Duration)>) -> Result<()> {
    let scene = load(&opts.render_common())?;
    let control = RenderControl::default();

    for sensor_idx in 0..scene.sensors.len() {
        let sensor = &scene.sensors[sensor_idx];
        let film = sensor.create_sensor_film();
        let tonemap = {
            let mut tm = parse_tonemap(&opts.tonemap, film.channels())?;
            if let Some(mode) = &opts.tonemap_mode {
                tm.mode = parse_tonemap_mode(mode)?;
            }
            tm
        };

        if let Some((p, interval)) = previewer {
            // periodic partial-film publishing alongside the render
            let film_ref = &film;
            let control_ref = &control;
            let tm = tonemap.clone();
            let id = sensor.id.clone();
            let done = std::sync::atomic::AtomicBool::new(false);
            rayon::scope(|s| {
                let done_ref = &done;
                s.spawn(move |_| {
                    while !done_ref.load(std::sync::atomic::Ordering::Relaxed) {
                        std::thread::sleep(interval);
                        p.update(
                            &id,
                            film_ref.snapshot(),
                            control_ref.fraction_complete(),
                            tm.clone(),
                        );
                    }
                });
                render_sensor(&scene, sensor_idx, film_ref, control_ref);
                done.store(true, std::sync::atomic::Ordering::Relaxed);
            });
        } else {
            render_sensor(&scene, sensor_idx, &film, &control);
        }

        let snapshot = film.snapshot();
        let exr = format!("{}{}.exr", opts.output, sensor.id);
        snapshot
            .write_exr(std::path::Path::new(&exr))
            .with_context(|| format!("writing {}", exr))?;
        info!(path = exr.as_str(), "wrote OpenEXR");
        if opts.png {
            let png = format!("{}{}.png", opts.output, sensor.id);
            snapshot
                .write_png(std::path::Path::new(&png), &tonemap)
                .with_context(|| format!("writing {}", png))?;
            info!(path = png.as_str(), "wrote PNG preview");
        }
    }

    if opts.stats {
        print!("{}", Registry::global().report());
    }
    Ok(())
}

impl RenderOpts {
    fn render_common(&self) -> CommonOpts {
        CommonOpts {
            scene: self.common.scene.clone(),
            threads: self.common.threads,
            defines: self.common.defines.clone(),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::from_args() {
        Cli::Render(opts) => run_render(&opts, None),
        Cli::Preview(opts) => {
            let previewer = Previewer::connect(
                &opts.host,
                opts.port,
                Duration::from_millis(opts.interval_ms),
            )
            .with_context(|| format!("connecting to tev at {}:{}", opts.host, opts.port))?;
            let interval = Duration::from_millis(opts.interval_ms);
            let r = run_render(&opts.render, Some((&previewer, interval)));
            previewer.shutdown();
            r
        }
        Cli::Info(opts) => {
            let scene = load(&opts.common)?;
            let desc = scene.description();
            if opts.json {
                println!("{}", serde_json::to_string_pretty(&desc)?);
            } else {
                println!("{:#}", desc);
            }
            Ok(())
        }
    }
}
