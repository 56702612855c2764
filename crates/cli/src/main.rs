mod plan_file;

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use events::{Event, ListenerScope};
use orchestrator::{EngineConfig, RuleName, RuleRegistry, Session};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::plan_file::PlanFile;

const CONFIG_DIR: &str = ".cadence";
const DEFAULT_MAX_FORCED_STEPS: u32 = 1000;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Inspect and walk stage/step plans", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default participant config to .cadence/config.json
    Init {
        #[arg(long)]
        participant: Option<String>,

        #[arg(long, default_value = "SOLO")]
        rule: String,

        #[arg(long)]
        observer: bool,
    },
    /// Finalize a plan file and print the resulting plan
    Plan {
        file: PathBuf,

        /// `stage` or `stage.step` to leave out; repeatable
        #[arg(long = "skip")]
        skips: Vec<String>,
    },
    /// Walk a plan file as a single participant
    Walk {
        file: PathBuf,

        #[arg(long = "skip")]
        skips: Vec<String>,

        /// Print every lifecycle event as a JSON line
        #[arg(long)]
        json: bool,

        /// Give up after this many coordinator steps
        #[arg(long, default_value_t = DEFAULT_MAX_FORCED_STEPS)]
        max_steps: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let cwd = std::env::current_dir()?;
    match cli.command {
        Commands::Init {
            participant,
            rule,
            observer,
        } => init_config(&cwd, participant, rule, observer).await,
        Commands::Plan { file, skips } => print_plan(&file, &skips).await,
        Commands::Walk {
            file,
            skips,
            json,
            max_steps,
        } => walk(&cwd, &file, &skips, json, max_steps).await,
    }
}

async fn init_config(
    cwd: &Path,
    participant: Option<String>,
    rule: String,
    observer: bool,
) -> Result<()> {
    let config_dir = cwd.join(CONFIG_DIR);
    if config_dir.exists() {
        println!("Already initialized at {}", config_dir.display());
        return Ok(());
    }
    if RuleName::parse(&rule).is_none() {
        bail!("Unknown advancement rule '{}'", rule);
    }

    let mut config = match participant {
        Some(id) => EngineConfig::for_participant(id),
        None => EngineConfig::default(),
    };
    config.default_rule = rule;
    config.observer = observer;
    config.write(cwd).await?;

    println!("Initialized cadence in {}", cwd.display());
    println!("  participant:  {}", config.participant_id);
    println!("  default rule: {}", config.default_rule);
    Ok(())
}

async fn print_plan(file: &Path, skips: &[String]) -> Result<()> {
    let plan = PlanFile::load(file).await?.build(skips)?;
    println!("{}", serde_json::to_string_pretty(plan.entries())?);
    Ok(())
}

async fn walk(cwd: &Path, file: &Path, skips: &[String], json: bool, max_steps: u32) -> Result<()> {
    let config = EngineConfig::read(cwd).await;
    let plan = PlanFile::load(file).await?.build(skips)?;
    let mut session = Session::new(plan, RuleRegistry::builtin(), &config);

    session
        .listeners_mut()
        .on(ListenerScope::Session, move |event: &Event| {
            if json {
                match serde_json::to_string(event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize event"),
                }
                return;
            }
            match event {
                Event::StepEntered {
                    stage_id,
                    step_id,
                    position,
                    ..
                } => println!("  {position:<8} {stage_id}.{step_id}"),
                Event::SequenceEnded { position, .. } => println!("Sequence ended at {position}"),
                Event::GameOver { .. } => println!("Game over"),
                Event::Error { message, .. } => println!("Error: {message}"),
                _ => {}
            }
        });

    session.start()?;
    session.run_until_idle()?;

    // Whatever still holds the participant back is released by stepping
    // as the coordinator would.
    let mut forced = 0;
    while session.engine().level().can_step() {
        if forced >= max_steps {
            bail!(
                "Still at {} after {} forced steps",
                session.engine().position(),
                forced
            );
        }
        tracing::debug!(position = %session.engine().position(), "Forcing step");
        session.step()?;
        session.run_until_idle()?;
        forced += 1;
    }

    tracing::info!(
        level = %session.engine().level().as_str(),
        forced_steps = forced,
        "Walk finished"
    );
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadence=info,orchestrator=info".into()),
        )
        .init();
}
