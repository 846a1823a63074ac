//! DiT inspection tool
//!
//! Prints position tables and checkpoint mappings for the supported
//! architectures, and checks a safetensors checkpoint against a mapping.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use burn_dit_convert::{
    CheckpointLoader, HostTensor, LoadError, LoraConfiguration, MappingTable, NamingConvention,
    ParameterId, ParameterSink, SafeTensorFile, attach_lora, load_lora_deltas,
};
use burn_dit_models::{Architecture, Geometry, ReferenceImage};
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(name = "dit-inspect")]
#[command(about = "Inspect DiT position tables and checkpoint mappings")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the position tables of one denoising call
    Rope {
        /// Architecture (flux1, flux2, hidream, hunyuan, ltx2, qwen-image, wan-14b, wan-1.3b, z-image)
        #[arg(short, long)]
        arch: Architecture,

        /// Latent height in patches
        #[arg(long, default_value = "64")]
        height: usize,

        /// Latent width in patches
        #[arg(long, default_value = "64")]
        width: usize,

        /// Latent frames
        #[arg(long, default_value = "1")]
        time: usize,

        /// Caption tokens
        #[arg(long, default_value = "512")]
        tokens: usize,

        /// Reference image as HxW in patches (can be specified multiple times)
        #[arg(long = "reference", value_name = "HxW", value_parser = parse_reference)]
        references: Vec<ReferenceImage>,

        /// Heads to replicate over
        #[arg(long, default_value = "1")]
        heads: usize,

        /// Read the geometry from a JSON file instead of the flags above
        #[arg(long)]
        geometry: Option<PathBuf>,

        /// Print the first pairs of this many positions
        #[arg(long, default_value = "0")]
        show: usize,
    },

    /// Print the checkpoint mapping of an architecture
    Mapping {
        #[arg(short, long)]
        arch: Architecture,

        /// Naming convention (generative-models, diffusers)
        #[arg(short, long, default_value = "diffusers")]
        convention: NamingConvention,

        /// Filter on-disk names (substring match)
        #[arg(short, long)]
        filter: Option<String>,

        /// Print the table as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a safetensors checkpoint against an architecture mapping
    Check {
        /// Path to safetensors file
        path: PathBuf,

        #[arg(short, long)]
        arch: Architecture,

        /// Naming convention (detected from tensor names if not specified)
        #[arg(short, long)]
        convention: Option<NamingConvention>,

        /// Read and split every mapped tensor
        #[arg(long)]
        load: bool,

        /// LoRA adapter to resolve through the mapping
        #[arg(long, value_name = "FILE")]
        lora: Option<PathBuf>,

        /// LoRA scale
        #[arg(long, default_value = "1.0")]
        lora_scale: f32,
    },
}

fn parse_reference(s: &str) -> Result<ReferenceImage, String> {
    let (h, w) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected HxW, got '{s}'"))?;
    let h = h.trim().parse().map_err(|e| format!("bad height '{h}': {e}"))?;
    let w = w.trim().parse().map_err(|e| format!("bad width '{w}': {e}"))?;
    Ok(ReferenceImage::new(h, w))
}

/// Records produced parameter shapes without keeping the data
#[derive(Default)]
struct ShapeSink {
    shapes: BTreeMap<ParameterId, Vec<usize>>,
}

impl ParameterSink for ShapeSink {
    fn write(&mut self, id: &ParameterId, tensor: HostTensor) -> Result<(), LoadError> {
        self.shapes.insert(id.clone(), tensor.shape().to_vec());
        Ok(())
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Rope {
            arch,
            height,
            width,
            time,
            tokens,
            references,
            heads,
            geometry,
            show,
        } => {
            let geometry = match geometry {
                Some(path) => {
                    let text = fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    serde_json::from_str(&text)
                        .with_context(|| format!("parsing geometry {}", path.display()))?
                }
                None => Geometry {
                    height,
                    width,
                    time,
                    token_length: tokens,
                    references,
                    heads,
                },
            };
            run_rope(arch, &geometry, show)
        }

        Commands::Mapping {
            arch,
            convention,
            filter,
            json,
        } => {
            let table = arch.mapping(convention)?;
            print_mapping(&table, filter.as_deref(), json)
        }

        Commands::Check {
            path,
            arch,
            convention,
            load,
            lora,
            lora_scale,
        } => run_check(&path, arch, convention, load, lora.as_deref(), lora_scale),
    }
}

fn run_rope(arch: Architecture, geometry: &Geometry, show: usize) -> Result<()> {
    let tables = arch.rope_tables(geometry)?;
    println!("Architecture: {arch}");
    println!(
        "Geometry: {}x{}x{}, {} tokens, {} references, {} heads\n",
        geometry.time,
        geometry.height,
        geometry.width,
        geometry.token_length,
        geometry.references.len(),
        geometry.heads
    );
    for (name, table) in &tables {
        println!("{name}: {:?}", table.shape());
        let pairs = (table.channels() / 2).min(4);
        for position in 0..show.min(table.sequence_len()) {
            let values: Vec<String> = (0..pairs)
                .map(|k| {
                    let (cos, sin) = table.pair(position, 0, k);
                    format!("({cos:+.4}, {sin:+.4})")
                })
                .collect();
            println!("  {position:>6}: {}", values.join(" "));
        }
    }
    Ok(())
}

fn print_mapping(table: &MappingTable, filter: Option<&str>, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(table)?);
        return Ok(());
    }
    for (name, entry) in table.iter() {
        if filter.is_some_and(|f| !name.contains(f)) {
            continue;
        }
        let targets: Vec<String> = entry.targets().iter().map(ToString::to_string).collect();
        let mut line = format!("{name} -> {}", targets.join(", "));
        if let Some(axis) = entry.axis() {
            line.push_str(&format!(" [{axis:?} {:?}]", entry.split()));
        }
        if let Some(scale) = entry.scale() {
            line.push_str(&format!(" x{scale}"));
        }
        println!("{line}");
    }
    println!("\nTotal entries: {}", table.len());
    Ok(())
}

fn run_check(
    path: &Path,
    arch: Architecture,
    convention: Option<NamingConvention>,
    load: bool,
    lora: Option<&Path>,
    lora_scale: f32,
) -> Result<()> {
    let file = SafeTensorFile::open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let names = file.names();
    let convention = convention.unwrap_or_else(|| arch.detect_convention(names.iter().copied()));
    info!(architecture = %arch, convention = %convention, tensors = names.len(), "checking");

    let table = arch.mapping(convention)?;
    let loader = CheckpointLoader::new(&table);
    let unmapped: Vec<&str> = names.iter().copied().filter(|n| !table.contains(n)).collect();
    let missing = loader.missing(&file);

    println!("File: {}", path.display());
    println!("Convention: {convention}");
    println!("Tensors: {}, mapped: {}", names.len(), names.len() - unmapped.len());
    for name in &unmapped {
        println!("  unmapped: {name}");
    }
    for (id, name) in &missing {
        println!("  missing: {id} (from {name})");
    }

    if load {
        let mut sink = ShapeSink::default();
        let report = loader
            .require_complete(false)
            .load(&file, &mut sink)
            .context("loading checkpoint")?;
        println!("Parameters written: {}", report.parameters);
    }

    if let Some(lora) = lora {
        let adapter = SafeTensorFile::open(lora)
            .with_context(|| format!("opening {}", lora.display()))?;
        let lora_table = attach_lora(&table, &LoraConfiguration::new(1, lora_scale));
        let deltas = load_lora_deltas(&lora_table, &adapter)?;
        println!(
            "LoRA: {} deltas, {} unmatched modules",
            deltas.deltas.len(),
            deltas.unmatched.len()
        );
        for module in &deltas.unmatched {
            println!("  unmatched: {module}");
        }
    }

    if !missing.is_empty() {
        bail!("{} parameters have no checkpoint tensor", missing.len());
    }
    Ok(())
}
