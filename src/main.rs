// unreal-rl: DQN and UNREAL agents on catch and maze environments.
//
// Usage:
//   cargo run --release -- train-deepq --env Catch-v0 --timesteps 1000000
//   cargo run --release -- train-unreal --env Maze-v0 --lstm --pixel-change --value-replay --reward-prediction
//   cargo run --release -- play --model checkpoints/best.safetensors --episodes 5
//   cargo run --release -- baseline --env Catch-v0

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::path::{Path, PathBuf};

use unreal_rl::{
    DeepQTrainer, ExperimentConfig, RunSummary, TrainingRunner, UnrealModel, UnrealTrainer, make_env,
    run_baseline, run_eval, select_device,
};

const CONFIG_FILE: &str = "config.json";

#[derive(Parser)]
#[command(name = "unreal-rl", about = "DQN and UNREAL agents on candle")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train the dueling Double DQN
    TrainDeepq(TrainArgs),
    /// Train the UNREAL actor-critic with auxiliary tasks
    TrainUnreal(UnrealArgs),
    /// Run greedy evaluation episodes with a saved model
    Play(PlayArgs),
    /// Run random agent baseline
    Baseline(BaselineArgs),
}

#[derive(Args)]
struct TrainArgs {
    /// Environment id: Catch-v0, Maze-v0 or Maze-<n>x<n>
    #[arg(long)]
    env: Option<String>,
    /// Total environment steps [default: 1000000]
    #[arg(long)]
    timesteps: Option<u64>,
    #[arg(long)]
    episode_log_interval: Option<u64>,
    #[arg(long)]
    max_episode_steps: Option<u64>,
    /// JSON file overriding any subset of the experiment config
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
    #[arg(long)]
    resume: Option<PathBuf>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

#[derive(Args)]
struct UnrealArgs {
    #[command(flatten)]
    train: TrainArgs,
    #[arg(long, default_value_t = false)]
    lstm: bool,
    #[arg(long, default_value_t = false)]
    pixel_change: bool,
    #[arg(long, default_value_t = false)]
    value_replay: bool,
    #[arg(long, default_value_t = false)]
    reward_prediction: bool,
    #[arg(long, default_value_t = false)]
    goal_input: bool,
}

#[derive(Args)]
struct PlayArgs {
    #[arg(long)]
    model: PathBuf,
    /// Experiment config; defaults to config.json next to the model
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    env: Option<String>,
    #[arg(long, default_value = "5")]
    episodes: usize,
    #[arg(long, default_value = "10000")]
    max_steps: u64,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long, default_value_t = false)]
    cpu: bool,
}

#[derive(Args)]
struct BaselineArgs {
    #[arg(long, default_value = "Catch-v0")]
    env: String,
    #[arg(long, default_value = "10")]
    episodes: usize,
    #[arg(long, default_value = "10000")]
    max_steps: u64,
    #[arg(long)]
    seed: Option<u64>,
}

fn banner(title: &str) {
    eprintln!("═══════════════════════════════════════════════════════════");
    eprintln!("  {title}");
    eprintln!("═══════════════════════════════════════════════════════════");
}

/// Config file (if any) with command-line overrides applied on top.
fn experiment_config(args: &TrainArgs) -> Result<ExperimentConfig> {
    let mut config = match args.config.as_ref() {
        Some(path) => ExperimentConfig::load(path)?,
        None => ExperimentConfig::default(),
    };
    if let Some(env) = args.env.as_ref() {
        config.env.id = env.clone();
    }
    if let Some(timesteps) = args.timesteps {
        config.run.max_time_steps = timesteps;
    }
    if args.config.is_none() {
        config.deepq.annealing_steps = config.run.max_time_steps / 10;
    }
    if let Some(interval) = args.episode_log_interval {
        config.run.episode_log_interval = interval;
    }
    if args.max_episode_steps.is_some() {
        config.env.max_episode_steps = args.max_episode_steps;
    }
    if let Some(dir) = args.checkpoint_dir.as_ref() {
        config.run.checkpoint_dir = dir.clone();
    }
    if args.seed.is_some() {
        config.env.seed = args.seed;
    }
    Ok(config)
}

fn save_config(config: &ExperimentConfig) -> Result<()> {
    std::fs::create_dir_all(&config.run.checkpoint_dir)?;
    config.save(config.run.checkpoint_dir.join(CONFIG_FILE))
}

fn report_summary(summary: &RunSummary) {
    let best = match summary.best_reward {
        Some(best) => format!("{best:.2}"),
        None => "n/a".to_string(),
    };
    eprintln!(
        "\n✅ Training complete. {} steps, {} episodes, best reward {}",
        summary.total_steps, summary.episodes, best
    );
}

fn agent_seed(seed: Option<u64>) -> Option<u64> {
    seed.map(|s| s.wrapping_add(1))
}

fn train_deepq(args: &TrainArgs) -> Result<()> {
    banner("TRAINING — Dueling Double DQN (Rust + candle)");

    let mut config = experiment_config(args)?;
    let device = select_device(args.cpu);
    eprintln!("Device: {:?}", device);

    let env = make_env(&config.env)?;
    config.model.action_space_size = env.action_count();
    config.model.use_deepq_network = true;
    eprintln!("Env: {} ({} actions)", env.id(), env.action_count());
    save_config(&config)?;

    let trainer = DeepQTrainer::new(
        env,
        config.model.clone(),
        config.deepq.clone(),
        &device,
        agent_seed(args.seed),
    )?;
    let mut runner = TrainingRunner::new(trainer, config.run.clone());
    if let Some(resume_dir) = args.resume.as_ref() {
        runner.resume(resume_dir)?;
    }
    let summary = runner.run()?;
    report_summary(&summary);
    Ok(())
}

fn train_unreal(args: &UnrealArgs) -> Result<()> {
    banner("TRAINING — UNREAL actor-critic (Rust + candle)");

    let mut config = experiment_config(&args.train)?;
    let device = select_device(args.train.cpu);
    eprintln!("Device: {:?}", device);

    let env = make_env(&config.env)?;
    let model = &mut config.model;
    model.action_space_size = env.action_count();
    model.use_deepq_network = false;
    model.use_lstm |= args.lstm;
    model.use_pixel_change |= args.pixel_change;
    model.use_value_replay |= args.value_replay;
    model.use_reward_prediction |= args.reward_prediction;
    model.use_goal_input |= args.goal_input;
    eprintln!(
        "Env: {} | lstm={} pc={} vr={} rp={} goal={}",
        env.id(),
        model.use_lstm,
        model.use_pixel_change,
        model.use_value_replay,
        model.use_reward_prediction,
        model.use_goal_input
    );
    save_config(&config)?;

    let trainer = UnrealTrainer::new(
        env,
        config.model.clone(),
        config.unreal.clone(),
        &device,
        agent_seed(args.train.seed),
    )?;
    let mut runner = TrainingRunner::new(trainer, config.run.clone());
    if let Some(resume_dir) = args.train.resume.as_ref() {
        runner.resume(resume_dir)?;
    }
    let summary = runner.run()?;
    report_summary(&summary);
    Ok(())
}

fn play(args: &PlayArgs) -> Result<()> {
    banner("PLAYING — greedy evaluation");

    let config_path = match args.config.as_ref() {
        Some(path) => path.clone(),
        None => args
            .model
            .parent()
            .unwrap_or(Path::new("."))
            .join(CONFIG_FILE),
    };
    let mut config = if config_path.exists() {
        ExperimentConfig::load(&config_path)?
    } else {
        tracing::warn!(path = %config_path.display(), "no experiment config, using defaults");
        ExperimentConfig::default()
    };
    if let Some(env) = args.env.as_ref() {
        config.env.id = env.clone();
    }
    if args.seed.is_some() {
        config.env.seed = args.seed;
    }

    let device = select_device(args.cpu);
    let mut env = make_env(&config.env)?;
    config.model.action_space_size = env.action_count();
    let mut model = UnrealModel::new(config.model.clone(), &device)?;
    model.load(&args.model)?;
    eprintln!("📂 Model loaded from {}", args.model.display());

    let stats = run_eval(&mut model, env.as_mut(), args.episodes, args.max_steps)?;
    eprintln!(
        "Eval over {} episodes: avg reward={:.2}, max reward={:.2}, avg length={:.1}",
        stats.episodes, stats.avg_reward, stats.max_reward, stats.avg_length
    );
    Ok(())
}

fn baseline(args: &BaselineArgs) -> Result<()> {
    eprintln!("Running random agent baseline...");

    let env_config = unreal_rl::EnvConfig {
        id: args.env.clone(),
        seed: args.seed,
        ..Default::default()
    };
    let mut env = make_env(&env_config)?;
    let mut rng = match args.seed {
        Some(seed) => SmallRng::seed_from_u64(seed),
        None => SmallRng::from_os_rng(),
    };
    let stats = run_baseline(env.as_mut(), args.episodes, args.max_steps, &mut rng)?;
    eprintln!(
        "\nBaseline on {}: mean={:.2}, max={:.2}, avg length={:.1}",
        env.id(),
        stats.avg_reward,
        stats.max_reward,
        stats.avg_length
    );
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::TrainDeepq(args) => train_deepq(args),
        Commands::TrainUnreal(args) => train_unreal(args),
        Commands::Play(args) => play(args),
        Commands::Baseline(args) => baseline(args),
    }
}
