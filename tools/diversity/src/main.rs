//! Similarity-sensitive diversity of the subcommunities in a counts file.
//!
//! Reads long-form counts (`subcommunity`, `species`, `count`) and a
//! similarity matrix, then writes one row per subcommunity plus one
//! metacommunity row for every requested viewpoint.

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use diversity_core::{
    make_metacommunity, make_shared_metacommunity, ChunkConfig, CountColumns, CountsTable, DiversityRecord,
    Metacommunity, RelativeAbundance, SharedArrayManager, SimilaritySource,
};
use std::{
    fs::File,
    io::{self, BufWriter, Write},
    path::PathBuf,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Tsv,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "diversity", about = "Compute similarity-sensitive diversity indices of a metacommunity")]
struct Args {
    /// Counts file; `.csv` is comma-separated, anything else tab-separated.
    #[arg(short, long)]
    input: PathBuf,

    /// Similarity matrix: `.csv`/`.tsv`/`.txt` (streamed) or `.bin`/`.f64` (raw, memory-mapped).
    #[arg(short, long)]
    similarity: PathBuf,

    /// Viewpoint parameters; `inf` for the dominance limit.
    #[arg(short, long, num_args = 1.., required = true, value_parser = parse_viewpoint)]
    viewpoint: Vec<f64>,

    /// Only these subcommunities make up the metacommunity.
    #[arg(long, num_args = 1..)]
    subcommunities: Option<Vec<String>>,

    /// Similarity rows held in memory at a time.
    #[arg(short = 'z', long, default_value_t = 100)]
    chunk_size: usize,

    /// Output file (default: stdout).
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Format::Tsv)]
    format: Format,

    /// Keep abundances in a single shared-memory buffer.
    #[arg(long)]
    shared: bool,

    #[arg(long, default_value = "subcommunity")]
    subcommunity_column: String,

    #[arg(long, default_value = "species")]
    species_column: String,

    #[arg(long, default_value = "count")]
    count_column: String,

    /// Log filter when RUST_LOG is unset (e.g. `debug`, `diversity_core=trace`).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_viewpoint(s: &str) -> std::result::Result<f64, String> {
    let v = match s.to_ascii_lowercase().as_str() {
        "inf" | "infinity" => f64::INFINITY,
        other => other.parse::<f64>().map_err(|e| format!("'{s}': {e}"))?,
    };
    if v.is_nan() || v < 0.0 {
        return Err(format!("viewpoint must be non-negative, got {s}"));
    }
    Ok(v)
}

// ── Records ───────────────────────────────────────────────────────────────────

fn collect_records<A: RelativeAbundance>(
    meta: &mut Metacommunity<A>,
    viewpoints: &[f64],
) -> Result<Vec<DiversityRecord>> {
    let mut records = Vec::new();
    for &viewpoint in viewpoints {
        records.extend(
            meta.subcommunities_to_records(viewpoint)
                .with_context(|| format!("subcommunity diversity at viewpoint {viewpoint}"))?,
        );
        records.push(
            meta.metacommunity_to_record(viewpoint)
                .with_context(|| format!("metacommunity diversity at viewpoint {viewpoint}"))?,
        );
    }
    Ok(records)
}

fn write_tsv(out: &mut impl Write, records: &[DiversityRecord]) -> io::Result<()> {
    writeln!(
        out,
        "community\tviewpoint\talpha\trho\tbeta\tgamma\tnormalized_alpha\tnormalized_rho\tnormalized_beta"
    )?;
    for r in records {
        writeln!(
            out,
            "{}\t{:.2}\t{:.4}\t{:.4}\t{:.4}\t{:.4}\t{:.4}\t{:.4}\t{:.4}",
            r.community,
            r.viewpoint,
            r.alpha,
            r.rho,
            r.beta,
            r.gamma,
            r.normalized_alpha,
            r.normalized_rho,
            r.normalized_beta
        )?;
    }
    Ok(())
}

// ── Main ──────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&args.log_level))?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();

    let chunk = ChunkConfig::new(args.chunk_size).context("--chunk-size")?;
    let columns = CountColumns {
        subcommunity: args.subcommunity_column.clone(),
        species: args.species_column.clone(),
        count: args.count_column.clone(),
    };

    let counts = CountsTable::read(&args.input, &columns)
        .with_context(|| format!("reading counts {}", args.input.display()))?;
    if counts.is_empty() {
        bail!("{} contains no count records", args.input.display());
    }
    let source = SimilaritySource::from_path(&args.similarity)
        .with_context(|| format!("similarity {}", args.similarity.display()))?;
    let subcommunities = args.subcommunities.as_deref();

    info!(
        input = %args.input.display(),
        similarity = %args.similarity.display(),
        viewpoints = args.viewpoint.len(),
        shared = args.shared,
        "computing diversity"
    );

    let records = if args.shared {
        let manager = SharedArrayManager::new().context("creating shared-memory directory")?;
        let mut meta = make_shared_metacommunity(&counts, source, subcommunities, chunk, manager)
            .context("building metacommunity")?;
        collect_records(&mut meta, &args.viewpoint)?
    } else {
        let mut meta =
            make_metacommunity(&counts, source, subcommunities, chunk).context("building metacommunity")?;
        collect_records(&mut meta, &args.viewpoint)?
    };

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("creating {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };
    match args.format {
        Format::Tsv => write_tsv(&mut out, &records)?,
        Format::Json => {
            serde_json::to_writer_pretty(&mut out, &records)?;
            writeln!(out)?;
        }
    }
    out.flush()?;
    info!(rows = records.len(), "done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewpoint_accepts_infinity_and_rejects_negatives() {
        assert_eq!(parse_viewpoint("inf").unwrap(), f64::INFINITY);
        assert_eq!(parse_viewpoint("Infinity").unwrap(), f64::INFINITY);
        assert_eq!(parse_viewpoint("0.5").unwrap(), 0.5);
        assert!(parse_viewpoint("-1").is_err());
        assert!(parse_viewpoint("abc").is_err());
    }

    #[test]
    fn tsv_rounds_viewpoint_and_measures() {
        let record = DiversityRecord {
            community: "A".into(),
            viewpoint: 0.0,
            alpha: 3.0,
            rho: 2.05,
            beta: 1.0 / 2.05,
            gamma: 1.0 / (4.1 / 6.0),
            normalized_alpha: 1.5,
            normalized_rho: 1.025,
            normalized_beta: 1.0 / 1.025,
        };
        let mut buf = Vec::new();
        write_tsv(&mut buf, &[record]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let line = text.lines().nth(1).unwrap();
        assert_eq!(line, "A\t0.00\t3.0000\t2.0500\t0.4878\t1.4634\t1.5000\t1.0250\t0.9756");
    }

    #[test]
    fn args_parse_multiple_viewpoints() {
        let args = Args::try_parse_from([
            "diversity", "-i", "counts.tsv", "-s", "sim.tsv", "-v", "0", "1", "inf",
        ])
        .unwrap();
        assert_eq!(args.viewpoint, vec![0.0, 1.0, f64::INFINITY]);
        assert_eq!(args.chunk_size, 100);
        assert!(!args.shared);
    }
}
