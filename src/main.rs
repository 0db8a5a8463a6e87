use clap::Parser;
use cluster_labeler::config::{
    clamp_threads, ChunkSize, Distribution, IdRule, JoinOptions, LabelNaming, LockPolicy, ReadMethod, RunConfig,
    SourceScan,
};
use cluster_labeler::file_handler::{check_output_path, discover_sources};
use cluster_labeler::LabelError;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "label_clusters")]
#[command(about = "Label clusters of record ids with the source files each id appears in", long_about = None)]
struct Cli {
    /// Directory holding the source files
    #[arg(short = 'f', long, alias = "fasta-dir")]
    source_dir: PathBuf,
    /// Two-column cluster table (cluster key, record id)
    #[arg(short, long)]
    input_file: PathBuf,
    /// Output table; must not exist yet
    #[arg(short, long)]
    out_file: PathBuf,
    /// Prefix removed from source file names to form labels, e.g. 'proteome_'
    #[arg(short, long)]
    prefix: Option<String>,
    /// Extension of the source files, e.g. '.fa'
    #[arg(short, long)]
    extension: Option<String>,
    /// Placeholder for ids found in no source file
    #[arg(short, long, default_value = "")]
    nolabel: String,
    /// Sort and deduplicate each label set
    #[arg(short, long)]
    sortlabels: bool,
    /// Drop rows repeating the previous (cluster, id) pair
    #[arg(short, long)]
    uniq: bool,
    /// Worker threads, capped to the available cores
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u64).range(1..))]
    threads: u64,
    /// Source files loaded per batch; enables batched execution
    #[arg(short, long, value_parser = clap::value_parser!(u64).range(1..))]
    batchsize: Option<u64>,
    /// Chunk size such as '50m'; '0' sizes automatically, 'n' clones the input per worker
    #[arg(short, long)]
    chunksize: Option<String>,
    /// How source files are scanned for headers
    #[arg(long, value_enum, default_value_t = ReadMethod::Lines)]
    read_method: ReadMethod,
    /// Seconds to wait for a chunk lock before retrying elsewhere
    #[arg(long, default_value_t = 90)]
    lock_timeout: u64,
    /// Upper bound of the random seconds added to the lock timeout
    #[arg(long, default_value_t = 20)]
    lock_jitter: u64,
    /// Passes over still-locked chunks before handing a batch back
    #[arg(long, default_value_t = 8)]
    max_passes: usize,
    /// Times a batch may be handed back before the run aborts
    #[arg(long, default_value_t = 3)]
    max_requeues: usize,
    /// Log filter, e.g. 'debug' or 'cluster_labeler=trace'; overrides RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

fn build_config(cli: Cli) -> Result<RunConfig, LabelError> {
    if !cli.input_file.is_file() {
        return Err(LabelError::NoInputFile(cli.input_file));
    }
    check_output_path(&cli.out_file)?;

    let naming = LabelNaming {
        prefix: cli.prefix,
        extension: cli.extension,
    };
    let sources = discover_sources(&cli.source_dir, &naming)?;
    tracing::info!(dir = %cli.source_dir.display(), files = sources.len(), "found source files");

    let chunk_size = cli.chunksize.as_deref();
    let distribution = match cli.batchsize {
        None if chunk_size.is_some() => return Err(LabelError::ChunkSizeWithoutBatch),
        None => None,
        Some(batch_size) => {
            let requested = cli.threads as usize;
            let threads = clamp_threads(requested);
            if threads < requested {
                tracing::warn!(requested, threads, "only {} threads available", threads);
            }
            Some(Distribution {
                threads,
                batch_size: batch_size as usize,
                chunk_size: ChunkSize::from_arg(chunk_size)?,
                lock: LockPolicy {
                    timeout: Duration::from_secs(cli.lock_timeout),
                    max_jitter: Duration::from_secs(cli.lock_jitter),
                    max_passes: cli.max_passes,
                    max_requeues: cli.max_requeues,
                    ..LockPolicy::default()
                },
            })
        }
    };

    Ok(RunConfig {
        input_file: cli.input_file,
        out_file: cli.out_file,
        sources,
        scan: SourceScan {
            naming,
            id_rule: IdRule::default(),
            read_method: cli.read_method,
        },
        join: JoinOptions {
            nolabel: cli.nolabel,
            sortlabels: cli.sortlabels,
            uniq: cli.uniq,
        },
        distribution,
    })
}

fn main() {
    let cli = Cli::parse();
    cluster_labeler::init_tracing("label_clusters", cli.log_level.as_deref());

    let result = build_config(cli).and_then(|config| cluster_labeler::run(&config));
    match result {
        Ok(summary) => {
            tracing::info!(clusters = summary.clusters, "done");
        }
        Err(e) => {
            tracing::error!(code = e.exit_code(), "{}", e);
            std::process::exit(e.exit_code());
        }
    }
}
