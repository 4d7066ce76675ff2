//! Fit one algorithm on a ratings dump and back it up.
//!
//! The snapshot directory comes from `--snapshot-dir` or the
//! `MANGAKI_SNAPSHOT_DIR` environment variable.
use std::fs;
use std::path::PathBuf;

use clap::Parser;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use tracing_subscriber::EnvFilter;

use mangaki_zero::backup::{fit_algo, get_algo_backup, sanitize, BackupStore};
use mangaki_zero::dataset::Dataset;
use mangaki_zero::datasets::{load_triplets, load_works};
use mangaki_zero::registry::Registry;
use mangaki_zero::side::SideInformation;
use mangaki_zero::values::RatingValues;
use mangaki_zero::RecommendationAlgorithm;

#[derive(Parser)]
#[command(name = "fit_algo")]
#[command(about = "Train a recommendation algorithm and save it")]
struct Args {
    /// Registered algorithm as `name[:key=value,...]`
    algo_name: String,

    /// Headerless `user_id,work_id,choice` CSV file
    ratings: PathBuf,

    #[arg(long, env = "MANGAKI_SNAPSHOT_DIR", default_value = "snapshots")]
    snapshot_dir: PathBuf,

    /// Choices are numbers instead of website choices
    #[arg(long)]
    numeric: bool,

    /// Headerless `work_id,tag,value` CSV file over raw work identifiers
    #[arg(long)]
    tags: Option<PathBuf>,

    /// Also export the anonymized ratings as CSV, with titles and
    /// categories read from this `work_id,title,category` file
    #[arg(long)]
    csv: Option<PathBuf>,

    /// Cache the dense prediction matrix of the existing backup instead of
    /// training
    #[arg(long)]
    unzip: bool,

    #[arg(long, default_value = "42")]
    seed: u64,
}

fn main() -> Result<(), failure::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let registry = Registry::default();
    let store = BackupStore::new(&args.snapshot_dir);

    if args.unzip {
        let mut algorithm = get_algo_backup(&registry, &store, &args.algo_name)?;
        algorithm.unzip();
        let path = store.save(&algorithm)?;
        println!("Successfully unzipped {} into {:?}", algorithm.shortname(), path);
        return Ok(());
    }

    let convert = if args.numeric {
        RatingValues::Numeric
    } else {
        RatingValues::default()
    };
    let triplets = load_triplets(&args.ratings)?;

    let tags = match args.tags {
        // Tags are keyed by raw work identifiers. The same seed reproduces
        // the encoding fit_algo is about to build.
        Some(ref path) => {
            let mut encoding_rng = XorShiftRng::seed_from_u64(args.seed);
            let mut dataset = Dataset::new();
            dataset.make_anonymous_data(triplets.clone(), &convert, false, &mut encoding_rng)?;
            Some(SideInformation::from_raw_csv(path, &dataset)?.scale(false))
        }
        None => None,
    };

    let mut rng = XorShiftRng::seed_from_u64(args.seed);
    let (mut dataset, algorithm) = fit_algo(
        &registry,
        &store,
        &args.algo_name,
        triplets,
        &convert,
        tags.as_ref(),
        &mut rng,
    )?;

    if let Some(ref works) = args.csv {
        let (titles, categories) = load_works(works)?;
        dataset.titles = Some(titles);
        dataset.categories = Some(categories);
        fs::create_dir_all(&args.snapshot_dir)?;
        dataset.save_csv(
            &args.snapshot_dir,
            &format!("-{}", sanitize(&algorithm.shortname())),
        )?;
    }

    println!("Successfully fit {}", algorithm.shortname());
    Ok(())
}
