//! Command-line front end for causal matching pursuit.
//!
//! Examples:
//!   causalmp-cli init-dict --kernels 8 --size 32 --seed 7 --out dict.cmpd
//!   causalmp-cli masks --dict dict.cmpd
//!   causalmp-cli infer --dict dict.cmpd --signal signal.json --config mp.json
//!
//! Logging goes to stderr at `info` unless `RUST_LOG` says otherwise (e.g. `RUST_LOG=debug`).

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::process;

use causalmp::prelude::{
    CausalMp, Dictionary, GradientFlow, KernelBank, MpConfig, MpError, SignalBatch, Spike,
    Thresholds,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Mp(#[from] MpError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Signal file: either one flat row or a list of equally long rows.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignalFile {
    Batch(Vec<Vec<f32>>),
    Single(Vec<f32>),
}

#[derive(Debug, Serialize)]
struct MaskReport {
    thresholds: Thresholds,
    onsets: Vec<usize>,
    masks: Vec<Vec<f32>>,
}

#[derive(Debug, Serialize)]
struct InferReport {
    batch_size: usize,
    l_signal: usize,
    n_kernel: usize,
    kernel_size: usize,
    steps_completed: usize,
    thresholds: Thresholds,
    gradient_flow: GradientFlow,
    loss: f32,
    residual_energy: f32,
    signal_energy: f32,
    spike_count: usize,
    spikes: Vec<Spike>,
}

fn usage() -> ! {
    eprintln!("causalmp-cli: causal matching pursuit over a kernel dictionary");
    eprintln!("Usage: causalmp-cli <command> [--flag value ...]\n");
    eprintln!("Commands:");
    eprintln!("  init-dict --kernels N --size K [--seed S] --out FILE");
    eprintln!("                              Write a random unit-norm dictionary image");
    eprintln!("  masks --dict FILE [--config FILE]");
    eprintln!("                              Print thresholds and kernel support masks");
    eprintln!("  infer --dict FILE --signal FILE [--config FILE] [--steps N]");
    eprintln!("                              Decompose a JSON signal and print a JSON report");
    eprintln!();
    eprintln!("Without --config, inference runs detached and reports reconstruction MSE.");
    process::exit(1);
}

fn parse_flags(args: &[String]) -> CliResult<HashMap<String, String>> {
    let mut flags = HashMap::new();
    let mut it = args.iter();
    while let Some(key) = it.next() {
        let Some(name) = key.strip_prefix("--") else {
            return Err(CliError::Usage(format!("unexpected argument: {key}")));
        };
        let value = it
            .next()
            .ok_or_else(|| CliError::Usage(format!("--{name} needs a value")))?;
        flags.insert(name.to_string(), value.clone());
    }
    Ok(flags)
}

fn required<'a>(flags: &'a HashMap<String, String>, name: &str) -> CliResult<&'a str> {
    flags
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| CliError::Usage(format!("missing --{name}")))
}

fn parsed<T: std::str::FromStr>(
    flags: &HashMap<String, String>,
    name: &str,
) -> CliResult<Option<T>> {
    flags
        .get(name)
        .map(|v| {
            v.parse()
                .map_err(|_| CliError::Usage(format!("--{name} must be a number")))
        })
        .transpose()
}

/// Config used when `--config` is absent: detached, no tape.
fn default_config() -> MpConfig {
    MpConfig::default().with_gradient_flow(GradientFlow::Detached)
}

fn load_config(flags: &HashMap<String, String>) -> CliResult<MpConfig> {
    match flags.get("config") {
        Some(path) => Ok(MpConfig::load_json(path)?),
        None => Ok(default_config()),
    }
}

fn load_dictionary(flags: &HashMap<String, String>) -> CliResult<KernelBank> {
    let path = required(flags, "dict")?;
    let mut r = BufReader::new(File::open(path)?);
    let bank = KernelBank::load_image_from(&mut r)?;
    info!(
        path,
        n_kernel = bank.n_kernel(),
        kernel_size = bank.kernel_size(),
        "dictionary loaded"
    );
    Ok(bank)
}

fn load_signal(path: &str) -> CliResult<SignalBatch> {
    let file: SignalFile = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    let signal = match file {
        SignalFile::Batch(rows) => SignalBatch::from_rows(&rows)?,
        SignalFile::Single(row) => SignalBatch::single(&row)?,
    };
    Ok(signal)
}

fn print_json<T: Serialize>(value: &T) -> CliResult<()> {
    let stdout = io::stdout();
    let mut w = BufWriter::new(stdout.lock());
    serde_json::to_writer_pretty(&mut w, value)?;
    writeln!(w)?;
    Ok(())
}

fn cmd_init_dict(flags: &HashMap<String, String>) -> CliResult<()> {
    let n_kernel: usize =
        parsed(flags, "kernels")?.ok_or_else(|| CliError::Usage("missing --kernels".into()))?;
    let kernel_size: usize =
        parsed(flags, "size")?.ok_or_else(|| CliError::Usage("missing --size".into()))?;
    let seed: u64 = parsed(flags, "seed")?.unwrap_or(0);
    let out = required(flags, "out")?;

    let bank = KernelBank::random(n_kernel, kernel_size, seed)?;
    let mut w = BufWriter::new(File::create(out)?);
    bank.save_image_to(&mut w)?;
    w.flush()?;
    info!(out, n_kernel, kernel_size, seed, "dictionary written");
    Ok(())
}

fn cmd_masks(flags: &HashMap<String, String>) -> CliResult<()> {
    let cfg = load_config(flags)?;
    let mp = CausalMp::new(load_dictionary(flags)?, cfg)?;
    let masks = mp.masks();
    let report = MaskReport {
        thresholds: mp.thresholds(),
        onsets: (0..masks.n_kernel()).map(|k| masks.onset(k)).collect(),
        masks: (0..masks.n_kernel()).map(|k| masks.row(k).to_vec()).collect(),
    };
    print_json(&report)
}

fn cmd_infer(flags: &HashMap<String, String>) -> CliResult<()> {
    let cfg = load_config(flags)?;
    let mp = CausalMp::new(load_dictionary(flags)?, cfg)?;
    let signal = load_signal(required(flags, "signal")?)?;
    let max_steps: Option<usize> = parsed(flags, "steps")?;

    let (acts, meta) = mp.infer_until(&signal, |tt| max_steps.map_or(true, |n| tt < n))?;
    let loss = mp.loss(&signal, &meta.reconstruction, &acts)?;
    let spikes: Vec<Spike> = acts.spikes().collect();
    info!(
        spikes = spikes.len(),
        loss,
        steps = meta.steps_completed,
        "inference done"
    );

    let report = InferReport {
        batch_size: signal.batch_size(),
        l_signal: signal.l_signal(),
        n_kernel: mp.dictionary().n_kernel(),
        kernel_size: mp.dictionary().kernel_size(),
        steps_completed: meta.steps_completed,
        thresholds: mp.thresholds(),
        gradient_flow: mp.gradient_flow(),
        loss,
        residual_energy: meta.residual.energy(),
        signal_energy: signal.padded(mp.dictionary().kernel_size()).energy(),
        spike_count: spikes.len(),
        spikes,
    };
    print_json(&report)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(cmd) = args.first() else { usage() };
    if cmd == "--help" || cmd == "-h" || cmd == "help" {
        usage();
    }

    let result = parse_flags(&args[1..]).and_then(|flags| match cmd.as_str() {
        "init-dict" => cmd_init_dict(&flags),
        "masks" => cmd_masks(&flags),
        "infer" => cmd_infer(&flags),
        other => Err(CliError::Usage(format!("unknown command: {other}"))),
    });

    match result {
        Ok(()) => {}
        Err(CliError::Usage(msg)) => {
            eprintln!("{msg}\n");
            usage();
        }
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(2);
        }
    }
}
