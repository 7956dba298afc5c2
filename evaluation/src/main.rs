use std::collections::HashMap;
use std::error::Error;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaChaRng;
use tracing::info;

use cmstream::{CountMin, Estimator, UpdatePolicy};

mod workload;

use workload::Workload;

type BoxError = Box<dyn Error + Send + Sync>;

const HOT_KEY: u64 = 123_456_789;
const HOT_COUNT: u64 = 1000;

#[derive(Parser)]
#[command(name = "evl")]
#[command(about = "Accuracy and throughput evaluation of the count-min sketch")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run repeated trials and write per-trial error statistics as CSV
    Bench(BenchArgs),
    /// Print the estimators for a few keys of a small mixed stream
    Sanity,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    Uniform,
    Zipf,
}

#[derive(clap::Args, Clone, Debug)]
struct BenchArgs {
    #[arg(long, default_value_t = 0.001)]
    eps: f64,

    #[arg(long, default_value_t = 0.001)]
    delta: f64,

    /// Number of updates per trial
    #[arg(short, long, default_value_t = 1_000_000)]
    n: usize,

    /// Size of the key space
    #[arg(
        short,
        long,
        default_value_t = 100_000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    universe: u64,

    #[arg(short, long, value_enum, default_value_t = Kind::Uniform)]
    workload: Kind,

    /// Zipf exponent
    #[arg(short, long, default_value_t = 1.0)]
    alpha: f64,

    /// Use conservative update instead of baseline update
    #[arg(long)]
    conservative: bool,

    /// Number of point queries per trial, half seen and half unseen keys
    #[arg(short, long, default_value_t = 2000)]
    queries: usize,

    #[arg(short, long, default_value_t = 3)]
    trials: u64,

    #[arg(short, long, default_value_t = 7)]
    seed: u64,

    /// Worker threads running trials
    #[arg(short, long, default_value_t = 1)]
    jobs: usize,

    #[arg(short, long, default_value = "results.csv")]
    output: String,
}

impl BenchArgs {
    fn policy(&self) -> UpdatePolicy {
        if self.conservative {
            UpdatePolicy::Conservative
        } else {
            UpdatePolicy::Baseline
        }
    }

    fn workload(&self, seed: u64) -> Workload {
        match self.workload {
            Kind::Uniform => Workload::uniform(self.universe, seed),
            Kind::Zipf => Workload::zipf(self.universe, self.alpha, seed),
        }
    }
}

/// Median, interquartile range and 95th percentile of absolute errors.
#[derive(Debug, Clone, Copy)]
struct Summary {
    median: f64,
    iqr:    f64,
    p95:    f64,
}

#[derive(Debug, Clone, Copy)]
struct TrialResult {
    trial:           u64,
    width:           usize,
    depth:           usize,
    updates_per_sec: f64,
    qps:             f64,
    min:             Summary,
    mean:            Summary,
    cmm:             Summary,
}

/// Linearly interpolated percentile of `sorted` at `q` in `[0, 1]`.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }

    let pos = (sorted.len() - 1) as f64 * q;
    let (lo, hi) = (pos.floor() as usize, pos.ceil() as usize);

    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

fn summarize(mut errors: Vec<f64>) -> Summary {
    errors.sort_by(|a, b| a.total_cmp(b));

    Summary {
        median: percentile(&errors, 0.5),
        iqr:    percentile(&errors, 0.75) - percentile(&errors, 0.25),
        p95:    percentile(&errors, 0.95),
    }
}

fn run_trial(args: &BenchArgs, trial: u64) -> Result<TrialResult, BoxError> {
    let seed = args.seed + trial * 100;
    let policy = args.policy();

    let mut cms: CountMin = CountMin::from_error_bounds(args.eps, args.delta, seed)?;
    let mut truth: HashMap<u64, u64> = HashMap::new();

    for _ in 0..HOT_COUNT {
        cms.update_with(HOT_KEY, 1, policy)?;
    }
    truth.insert(HOT_KEY, HOT_COUNT);

    let mut workload = args.workload(seed + 1);

    let start = Instant::now();

    for _ in 0..args.n {
        let key = workload.sample();

        cms.update_with(key, 1, policy)?;

        *truth.entry(key).or_insert(0) += 1;
    }

    let updates_per_sec = args.n as f64 / start.elapsed().as_secs_f64().max(1e-9);

    let mut seen: Vec<u64> = truth.keys().copied().collect();
    seen.sort_unstable();

    let mut rng = ChaChaRng::seed_from_u64(seed);

    let seen_queries = if seen.is_empty() { 0 } else { args.queries / 2 };

    let mut keys: Vec<u64> = (0..seen_queries)
        .map(|_| seen[rng.gen_range(0, seen.len())])
        .collect();
    keys.extend((seen_queries..args.queries).map(|_| rng.gen_range(1, args.universe + 1)));

    let (mut min, mut mean, mut cmm) = (vec![], vec![], vec![]);

    let start = Instant::now();

    for key in keys.iter() {
        let actual = truth.get(key).copied().unwrap_or(0) as f64;

        min.push((cms.query(*key, Estimator::Min) - actual).abs());
        mean.push((cms.query(*key, Estimator::Mean) - actual).abs());
        cmm.push((cms.query(*key, Estimator::CountMeanMin) - actual).abs());
    }

    let qps = keys.len() as f64 / start.elapsed().as_secs_f64().max(1e-9);

    Ok(TrialResult {
        trial,
        width: cms.width(),
        depth: cms.depth(),
        updates_per_sec,
        qps,
        min: summarize(min),
        mean: summarize(mean),
        cmm: summarize(cmm),
    })
}

fn bench(args: BenchArgs) -> Result<(), BoxError> {
    let args = Arc::new(args);
    let counter = Arc::new(Mutex::new(0u64));

    let threads: Vec<thread::JoinHandle<Result<Vec<TrialResult>, BoxError>>> =
        (0..args.jobs.max(1))
            .map(|_| {
                let args = Arc::clone(&args);
                let counter = Arc::clone(&counter);

                thread::spawn(move || -> Result<Vec<TrialResult>, BoxError> {
                    let mut results = Vec::new();

                    loop {
                        let trial;

                        {
                            let mut counter = counter.lock().map_err(|_| "trial counter poisoned")?;

                            if *counter == args.trials {
                                break;
                            }

                            trial = *counter;

                            *counter += 1;
                        }

                        let result = run_trial(&args, trial)?;

                        info!(
                            trial,
                            w = result.width,
                            d = result.depth,
                            updates_per_sec = result.updates_per_sec as u64,
                            qps = result.qps as u64,
                            med_min = result.min.median,
                            med_cmm = result.cmm.median,
                            "trial finished"
                        );

                        results.push(result);
                    }

                    Ok(results)
                })
            })
            .collect();

    let mut results: Vec<TrialResult> = Vec::new();

    for thread in threads {
        let res = thread.join().map_err(|_| "trial worker panicked")??;

        results.extend(res);
    }

    results.sort_by_key(|r| r.trial);

    let mut writer = BufWriter::new(File::create(&args.output)?);

    writeln!(
        writer,
        "trial,eps,delta,N,U,workload,alpha,use_cu,w,d,updates_per_sec,qps,\
         med_min,iqr_min,p95_min,med_mean,iqr_mean,p95_mean,med_cmm,iqr_cmm,p95_cmm"
    )?;

    let workload = match args.workload {
        Kind::Uniform => "uniform",
        Kind::Zipf => "zipf",
    };

    for r in results.iter() {
        write!(
            writer,
            "{},{},{},{},{},{},{},{},{},{},{},{},",
            r.trial,
            args.eps,
            args.delta,
            args.n,
            args.universe,
            workload,
            args.alpha,
            args.conservative as u8,
            r.width,
            r.depth,
            r.updates_per_sec,
            r.qps,
        )?;

        let summaries = [r.min, r.mean, r.cmm];
        let fields: Vec<String> = summaries
            .iter()
            .flat_map(|s| vec![s.median, s.iqr, s.p95])
            .map(|v| v.to_string())
            .collect();

        writeln!(writer, "{}", fields.join(","))?;
    }

    writer.flush()?;

    info!(output = %args.output, trials = results.len(), "wrote results");

    Ok(())
}

fn sanity() -> Result<(), BoxError> {
    let mut cms: CountMin = CountMin::from_error_bounds(0.001, 0.001, 1)?;
    let mut truth: HashMap<u64, u64> = HashMap::new();

    for _ in 0..HOT_COUNT {
        cms.update(HOT_KEY, 1)?;
    }
    truth.insert(HOT_KEY, HOT_COUNT);

    let mut workload = Workload::uniform(10_000, 7);

    for _ in 0..10_000 {
        let key = workload.sample();

        cms.update_conservative(key, 1)?;

        *truth.entry(key).or_insert(0) += 1;
    }

    println!("key\ttrue\tmin\tmean\tcmm");

    for key in [HOT_KEY, 42, 777, 9999].iter() {
        println!(
            "{}\t{}\t{}\t{:.2}\t{:.2}",
            key,
            truth.get(key).copied().unwrap_or(0),
            cms.query_min(*key),
            cms.query_mean(*key),
            cms.query_count_mean_min(*key),
        );
    }

    Ok(())
}

fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Bench(args) => bench(args),
        Commands::Sanity => sanity(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0];

        assert_eq!(percentile(&sorted, 0.5), 3.0);
        assert_eq!(percentile(&sorted, 0.25), 2.0);
        assert!((percentile(&sorted, 0.95) - 4.8).abs() < 1e-12);
        assert!(percentile(&[], 0.5).is_nan());
    }

    #[test]
    fn test_summarize() {
        let summary = summarize(vec![4.0, 1.0, 3.0, 2.0, 5.0]);

        assert_eq!(summary.median, 3.0);
        assert_eq!(summary.iqr, 2.0);
    }

    #[test]
    fn test_universe_must_be_positive() {
        assert!(Cli::try_parse_from(["evl", "bench", "--universe", "0"]).is_err());

        let cli = Cli::try_parse_from(["evl", "bench", "-u", "10"]).unwrap();

        match cli.command {
            Commands::Bench(args) => assert_eq!(args.universe, 10),
            Commands::Sanity => panic!("expected bench"),
        }
    }

    #[test]
    fn test_run_trial() {
        let args = BenchArgs {
            eps:          0.01,
            delta:        0.01,
            n:            5_000,
            universe:     1_000,
            workload:     Kind::Zipf,
            alpha:        1.1,
            conservative: true,
            queries:      100,
            trials:       1,
            seed:         7,
            jobs:         1,
            output:       String::new(),
        };

        let result = run_trial(&args, 0).unwrap();

        assert_eq!((result.width, result.depth), (272, 5));
        assert!(result.min.median >= 0.0);
        assert!(result.min.p95 >= result.min.median);
    }
}
