// src/main.rs
//
// Evaluation harness for the POMO rollout engine.
//
// Constraints:
// - Config precedence: CLI flags > POMO_* env > --config YAML > defaults.
// - Deterministic runs via --seed (instances, sampling, augmentation draws).
// - Prints a one-line run header to stderr; stdout (or --out) carries only the JSON summary.
// - The config digest is the SHA-256 of the resolved YAML config.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use log::info;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};

use pomo::config::{AugmentationConfig, RunConfig};
use pomo::decoder::DecodeType;
use pomo::env::{generate_cvrp, generate_tsp, CvrpEnv, Environment, TspEnv};
use pomo::eval::{evaluate_augmented, EvaluationSummary};
use pomo::policy::{Phase, PomoPolicy};
use pomo::StateAugmentation;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum EnvArg {
    Tsp,
    Cvrp,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum DecodeArg {
    Sampling,
    Greedy,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum AugmentArg {
    None,
    Dihedral8,
    Symmetric,
}

#[derive(Debug, Parser)]
#[command(
    name = "pomo",
    about = "Multi-start policy rollouts with symmetry augmentation",
    version
)]
struct Args {
    /// Problem environment.
    #[arg(long, value_enum, default_value = "tsp")]
    env: EnvArg,

    /// Nodes per instance (customers for CVRP, plus a depot).
    #[arg(long, default_value_t = 20)]
    num_nodes: usize,

    /// Instances per batch.
    #[arg(long, default_value_t = 16)]
    batch_size: usize,

    /// Multi-start replicas per instance (overrides config).
    #[arg(long)]
    num_pomo: Option<usize>,

    /// Decode strategy (overrides config). Augmented runs always decode greedily.
    #[arg(long, value_enum)]
    decode: Option<DecodeArg>,

    /// Augmentation transform; `none` disables augmentation even if the
    /// config enables it.
    #[arg(long, value_enum)]
    augment: Option<AugmentArg>,

    /// Augmented copies per instance.
    #[arg(long)]
    num_augment: Option<usize>,

    /// Deterministic seed.
    #[arg(long, default_value_t = 1234)]
    seed: u64,

    /// YAML run config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the JSON summary here instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Verbosity: -v, -vv
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Serialize)]
struct RunSummary {
    env: String,
    batch_size: usize,
    num_nodes: usize,
    num_pomo: usize,
    decode_type: String,
    seed: u64,
    config_sha256: String,
    mean_best_reward: f32,
    mean_log_likelihood: f32,
    augmentation: Option<EvaluationSummary>,
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, level),
    )
    .target(env_logger::Target::Stderr)
    .init();
}

fn resolve_config(args: &Args) -> Result<RunConfig> {
    let mut cfg = match &args.config {
        Some(path) => RunConfig::from_yaml_file(path)
            .with_context(|| format!("loading run config {}", path.display()))?,
        None => RunConfig::default(),
    };
    cfg.apply_env_overrides();

    if let Some(p) = args.num_pomo {
        cfg.policy.num_pomo = p;
    }
    if let Some(d) = args.decode {
        cfg.rollout.decode_type = match d {
            DecodeArg::Sampling => DecodeType::Sampling,
            DecodeArg::Greedy => DecodeType::Greedy,
        }
        .as_str()
        .to_string();
    }
    match args.augment {
        Some(AugmentArg::None) => cfg.augmentation = None,
        Some(AugmentArg::Dihedral8) => cfg.augmentation = Some(AugmentationConfig::dihedral8()),
        Some(AugmentArg::Symmetric) => {
            let n = args.num_augment.unwrap_or(AugmentationConfig::default().num_augment);
            cfg.augmentation = Some(AugmentationConfig::symmetric(n));
        }
        None => {}
    }
    if let (Some(n), Some(aug)) = (args.num_augment, cfg.augmentation.as_mut()) {
        aug.num_augment = n;
    }

    cfg.validate().context("invalid run config")?;
    Ok(cfg)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let cfg = resolve_config(&args)?;
    let cfg_yaml = cfg.to_yaml_string().context("serialising run config")?;
    let digest = hex_encode(&Sha256::digest(cfg_yaml.as_bytes()));

    let mut rng = ChaCha8Rng::seed_from_u64(args.seed);
    let (env, batch) = match args.env {
        EnvArg::Tsp => (
            Box::new(TspEnv::new()) as Box<dyn Environment>,
            generate_tsp(args.batch_size, args.num_nodes, &mut rng)?,
        ),
        EnvArg::Cvrp => (
            Box::new(CvrpEnv::new()) as Box<dyn Environment>,
            generate_cvrp(args.batch_size, args.num_nodes, &mut rng)?,
        ),
    };
    let env_name = env.name().to_string();

    eprintln!(
        "pomo | env={} | batch={} | nodes={} | num_pomo={} | decode={} | seed={} | cfg_sha256={}",
        env_name,
        batch.batch_size(),
        batch.num_nodes(),
        cfg.policy.num_pomo,
        cfg.rollout.decode_type,
        args.seed,
        &digest[..16]
    );

    let policy = PomoPolicy::with_defaults(env, cfg.policy.clone())
        .context("building policy")?
        .with_max_decode_steps(cfg.rollout.max_decode_steps);
    let decode_type = DecodeType::parse(&cfg.rollout.decode_type)?;
    let augmentation = cfg
        .augmentation
        .as_ref()
        .map(StateAugmentation::new)
        .transpose()
        .context("building augmentation")?;

    let out = policy
        .forward(&batch, Phase::Test, decode_type, false, &mut rng)
        .context("policy rollout")?;
    info!("rollout done: mean best reward {:.4}", out.mean_best_reward());

    let augmentation = match &augmentation {
        Some(aug) => {
            let eval = evaluate_augmented(&policy, &batch, aug, &mut rng)
                .context("augmented evaluation")?;
            Some(eval.summary())
        }
        None => None,
    };

    let summary = RunSummary {
        env: env_name,
        batch_size: batch.batch_size(),
        num_nodes: batch.num_nodes(),
        num_pomo: policy.num_pomo(),
        decode_type: decode_type.to_string(),
        seed: args.seed,
        config_sha256: digest,
        mean_best_reward: out.mean_best_reward(),
        mean_log_likelihood: out.log_likelihood.mean().unwrap_or(0.0),
        augmentation,
    };
    let json = serde_json::to_string_pretty(&summary).context("serialising summary")?;
    match &args.out {
        Some(path) => fs::write(path, json)
            .with_context(|| format!("writing summary to {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}
