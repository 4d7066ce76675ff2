//! Cross-validate recommendation algorithms on a ratings dump.
//!
//! ```text
//! compare ratings.csv --algo als:nb_components=10 --algo svd --algo zero
//! ```
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use clap::Parser;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use tracing_subscriber::EnvFilter;

use mangaki_zero::dataset::Dataset;
use mangaki_zero::datasets::load_triplets;
use mangaki_zero::evaluation::{Experiment, Split};
use mangaki_zero::registry::Registry;
use mangaki_zero::side::SideInformation;
use mangaki_zero::values::RatingValues;

#[derive(Parser)]
#[command(name = "compare")]
#[command(about = "Compare recommendation algorithms by cross-validation")]
struct Args {
    /// Headerless `user_id,work_id,choice` CSV file
    ratings: PathBuf,

    /// Choices are numbers (e.g. MovieLens stars) instead of website choices
    #[arg(long)]
    numeric: bool,

    /// Algorithm as `name[:key=value,...]`; repeat to compare several
    #[arg(short, long = "algo")]
    algos: Vec<String>,

    /// Number of folds
    #[arg(long, default_value = "5")]
    folds: usize,

    /// Use random splits holding out this fraction instead of k-fold
    #[arg(long)]
    test_fraction: Option<f64>,

    /// Hold out whole users instead of single ratings
    #[arg(long, requires = "test_fraction")]
    user_based: bool,

    /// Headerless `work_id,tag,value` CSV file over raw work identifiers
    #[arg(long)]
    tags: Option<PathBuf>,

    #[arg(long, default_value = "42")]
    seed: u64,

    /// Write the report as JSON
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// List the registered algorithms and exit
    #[arg(long)]
    list: bool,
}

fn main() -> Result<(), failure::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let registry = Registry::default();

    if args.list {
        for name in registry.list_available() {
            println!("{}", name);
        }
        return Ok(());
    }

    if args.algos.is_empty() {
        tracing::warn!("no algorithm given, nothing to compare (try --algo als)");
        return Ok(());
    }

    let algorithms = args
        .algos
        .iter()
        .map(|configuration| registry.instantiate_configuration(configuration))
        .collect::<Result<Vec<_>, _>>()?;

    let convert = if args.numeric {
        RatingValues::Numeric
    } else {
        RatingValues::default()
    };
    let mut rng = XorShiftRng::seed_from_u64(args.seed);
    let mut dataset = Dataset::new();
    let triplets = load_triplets(&args.ratings)?;
    let data = dataset
        .make_anonymous_data(triplets, &convert, false, &mut rng)?
        .clone();
    tracing::info!(
        nb_users = data.nb_users,
        nb_works = data.nb_works,
        nb_ratings = data.len(),
        "dataset ready"
    );

    let tags = match args.tags {
        Some(ref path) => Some(SideInformation::from_raw_csv(path, &dataset)?.scale(false)),
        None => None,
    };

    let split = match args.test_fraction {
        Some(test_fraction) if args.user_based => Split::UserBased { test_fraction },
        Some(test_fraction) => Split::Shuffle {
            nb_splits: args.folds,
            test_fraction,
        },
        None => Split::KFold(args.folds),
    };

    let report = Experiment::new()
        .split(split)
        .seed(args.seed)
        .run(&algorithms, &data, tags.as_ref())?;

    println!("Final results");
    for (name, summaries) in &report {
        for (metric, summary) in summaries {
            println!("{}: {} = {}", name, metric.to_uppercase(), summary);
        }
    }

    if let Some(path) = args.output {
        serde_json::to_writer_pretty(BufWriter::new(File::create(&path)?), &report)?;
        tracing::info!(path = ?path, "report written");
    }

    Ok(())
}
