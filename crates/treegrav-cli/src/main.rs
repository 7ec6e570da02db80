use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use treegrav::io::{
    field_path, load_particles, write_f64_field, write_u32_field, write_vector_field,
    write_vector_field_ascii,
};
use treegrav::{direct, dot, SimConfig, Simulation};

#[derive(Parser, Debug)]
#[command(name = "treegrav", about = "Parallel Barnes-Hut gravity over SFC tree pieces")]
struct Args {
    /// Base name of the input field files (<base>.mass, <base>.pos).
    base: PathBuf,

    /// YAML run configuration; flags below override its fields.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Suffix of the acceleration output file.
    #[arg(long, default_value = "acc")]
    suffix: String,

    #[arg(short, long)]
    pieces: Option<usize>,

    #[arg(short, long)]
    groups: Option<usize>,

    #[arg(short, long)]
    theta: Option<f64>,

    #[arg(short, long)]
    bucket_size: Option<usize>,

    /// Also run the O(N^2) direct solver and write the .error field.
    #[arg(long)]
    check_direct: bool,

    /// Write accelerations as ASCII, one value per line.
    #[arg(long)]
    ascii: bool,

    /// Write a tree_<piece>.dot graph per piece next to the outputs.
    #[arg(long)]
    dump_trees: bool,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn load_config(args: &Args) -> Result<SimConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
            serde_yaml::from_reader(BufReader::new(file))
                .with_context(|| format!("parsing {}", path.display()))?
        }
        None => SimConfig::default(),
    };
    if let Some(pieces) = args.pieces {
        config.num_pieces = pieces;
    }
    if let Some(groups) = args.groups {
        config.num_groups = groups;
    }
    if let Some(theta) = args.theta {
        config.theta = theta;
    }
    if let Some(bucket_size) = args.bucket_size {
        config.bucket_size = bucket_size;
    }
    config.verbosity = config.verbosity.max(args.verbose as u32);
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()))
        .init();

    let config = load_config(&args)?;
    let (time, bbox, blocks) =
        load_particles(&args.base, config.num_pieces).context("loading particle fields")?;

    let mut sim = Simulation::new(config, bbox, blocks)?;
    sim.build()?;
    sim.compute_gravity()?;
    let output = sim.finish()?;

    if args.dump_trees {
        for piece in &output.pieces {
            let path = format!("tree_{}.dot", piece.index);
            let mut file = File::create(&path).with_context(|| format!("creating {path}"))?;
            dot::write_tree(piece, &mut file)?;
        }
    }

    let mut particles = Vec::new();
    for piece in &output.pieces {
        particles.extend_from_slice(piece.owned_particles());
    }
    // Output order follows the SFC sort, matching the tree's own ordering
    // of the particle set.
    let accelerations: Vec<[f64; 3]> = particles.iter().map(|p| p.tree_acceleration).collect();

    let acc_path = field_path(&args.base, &args.suffix);
    if args.ascii {
        write_vector_field_ascii(&acc_path, &accelerations)?;
    } else {
        write_vector_field(&acc_path, time, &accelerations)?;
    }
    info!(path = %acc_path.display(), "wrote accelerations");

    write_u32_field(
        &field_path(&args.base, "MACs"),
        time,
        &particles.iter().map(|p| p.counts.macs).collect::<Vec<_>>(),
    )?;
    write_u32_field(
        &field_path(&args.base, "cellints"),
        time,
        &particles.iter().map(|p| p.counts.cell_inter).collect::<Vec<_>>(),
    )?;
    write_u32_field(
        &field_path(&args.base, "partints"),
        time,
        &particles.iter().map(|p| p.counts.part_inter).collect::<Vec<_>>(),
    )?;
    write_u32_field(
        &field_path(&args.base, "calls"),
        time,
        &particles.iter().map(|p| p.counts.entry_calls).collect::<Vec<_>>(),
    )?;

    if args.check_direct {
        info!("running direct reference solver");
        let reference = direct::accelerations(&particles);
        let errors = direct::relative_errors(&accelerations, &reference);
        write_f64_field(&field_path(&args.base, "error"), time, &errors)?;
        let max = errors.iter().copied().fold(0.0, f64::max);
        let mean = errors.iter().sum::<f64>() / errors.len().max(1) as f64;
        info!(max_error = max, mean_error = mean, "direct comparison done");
    }

    Ok(())
}
