use std::io::Write as _;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use evonest::backlog;
use evonest::config::EvonestConfig;
use evonest::error::{Error, Result};
use evonest::history::render_history;
use evonest::improve::run_improve;
use evonest::init::{draft_identity, init_project};
use evonest::orchestrator::{
    cancel_cautious, resume_cautious, run_analyze, run_evolve, RunOptions,
};
use evonest::progress::progress_report;
use evonest::runner::LmRunner;
use evonest::state::ProjectState;

#[derive(Parser)]
#[command(name = "evonest", about = "Autonomous code evolution engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize .evonest/ in a project
    Init {
        /// Path to the target project
        path: PathBuf,
        /// Analysis depth level
        #[arg(long, value_parser = ["quick", "standard", "deep"])]
        level: Option<String>,
        /// Skip the LM identity draft and use the blank template
        #[arg(long, default_value_t = false)]
        no_draft: bool,
    },
    /// Observe-only: save all improvements as proposals (no code changes)
    Analyze {
        project: Option<PathBuf>,
        /// Force persona ID (e.g. architect)
        #[arg(long)]
        persona: Option<String>,
        /// Force adversarial ID, or 'none' to disable
        #[arg(long)]
        adversarial: Option<String>,
        /// Persona group filter (biz, tech, quality)
        #[arg(long)]
        group: Option<String>,
        /// Run every persona once
        #[arg(long, default_value_t = false)]
        all_personas: bool,
        #[arg(long, value_parser = ["auto", "quick", "deep"])]
        observe_mode: Option<String>,
        #[arg(long, value_parser = ["quick", "standard", "deep"])]
        level: Option<String>,
    },
    /// Execute a proposal: select → Execute → Verify → commit/PR
    Improve {
        project: Option<PathBuf>,
        /// Bare filename of the proposal (auto-selects by priority+age if omitted)
        #[arg(long)]
        proposal_id: Option<String>,
        /// Keep going until the pending proposal queue is empty
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// Full evolution: Observe → Plan → Execute → Verify → commit/PR
    Evolve {
        project: Option<PathBuf>,
        /// Number of cycles
        #[arg(short, long)]
        cycles: Option<u32>,
        /// Skip meta-observe
        #[arg(long, default_value_t = false)]
        no_meta: bool,
        /// Skip scout
        #[arg(long, default_value_t = false)]
        no_scout: bool,
        #[arg(long, value_parser = ["auto", "quick", "deep"])]
        observe_mode: Option<String>,
        #[arg(long)]
        persona: Option<String>,
        #[arg(long)]
        adversarial: Option<String>,
        #[arg(long)]
        group: Option<String>,
        /// Run every persona exactly once (overrides --cycles)
        #[arg(long, default_value_t = false)]
        all_personas: bool,
        /// Pause after Plan for review; resume with --resume
        #[arg(long, default_value_t = false)]
        cautious: bool,
        /// Resume a paused cautious session (Execute + Verify)
        #[arg(long, default_value_t = false)]
        resume: bool,
        /// Cancel a paused cautious session
        #[arg(long, default_value_t = false)]
        cancel_pending: bool,
        #[arg(long, value_parser = ["quick", "standard", "deep"])]
        level: Option<String>,
    },
    /// Show project status
    Status { project: Option<PathBuf> },
    /// Show cycle history
    History {
        project: Option<PathBuf>,
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
    },
    /// Show detailed progress and weights
    Progress { project: Option<PathBuf> },
    /// View or update project config
    Config {
        project: Option<PathBuf>,
        /// Set a config value: --set KEY VALUE
        #[arg(long, num_args = 2, value_names = ["KEY", "VALUE"])]
        set: Option<Vec<String>>,
    },
    /// View or update project identity
    Identity {
        project: Option<PathBuf>,
        /// Replace identity from a file
        #[arg(long)]
        set: Option<PathBuf>,
        /// Re-draft identity.md via the LM (prompts for confirmation)
        #[arg(long, default_value_t = false)]
        refresh: bool,
    },
    /// Manage the improvement backlog
    Backlog {
        project: Option<PathBuf>,
        /// Action to perform
        #[arg(default_value = "list", value_parser = ["list", "add", "remove", "prune"])]
        action: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long, default_value = "medium")]
        priority: String,
        #[arg(long)]
        id: Option<String>,
    },
}

/// Resolve the project path: explicit arg, then EVONEST_PROJECT, then walk
/// up from cwd looking for .evonest/.
fn resolve_project(project: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = project {
        return Ok(path);
    }
    if let Ok(env) = std::env::var("EVONEST_PROJECT") {
        if !env.trim().is_empty() {
            return Ok(PathBuf::from(env));
        }
    }
    let cwd = std::env::current_dir()?;
    for dir in cwd.ancestors() {
        if dir.join(".evonest").is_dir() {
            return Ok(dir.to_path_buf());
        }
    }
    Err(Error::NotInitialized(cwd))
}

fn confirm(prompt: &str) -> bool {
    print!("{prompt}");
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    answer.trim().eq_ignore_ascii_case("y")
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted — finishing the current phase boundary...");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("EVONEST_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match dispatch(cli.command).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

async fn dispatch(command: Command) -> Result<i32> {
    match command {
        Command::Init {
            path,
            level,
            no_draft,
        } => {
            let level = level.unwrap_or_else(|| "standard".to_string());
            let draft = if no_draft {
                None
            } else {
                let runner = LmRunner::new(CancellationToken::new());
                draft_identity(&path, &runner).await
            };
            println!("{}", init_project(&path, &level, draft)?);
            Ok(0)
        }

        Command::Analyze {
            project,
            persona,
            adversarial,
            group,
            all_personas,
            observe_mode,
            level,
        } => {
            let project = resolve_project(project)?;
            let opts = RunOptions {
                persona_id: persona,
                adversarial_id: adversarial,
                group,
                all_personas,
                observe_mode,
                level,
                ..Default::default()
            };
            let summary = run_analyze(&project, opts, cancel_on_ctrl_c()).await?;
            println!("{summary}");
            Ok(0)
        }

        Command::Improve {
            project,
            proposal_id,
            all,
        } => {
            let project = resolve_project(project)?;
            let report = run_improve(&project, proposal_id, all, cancel_on_ctrl_c()).await?;
            println!("{}", report.message);
            Ok(if report.any_verify_failed { 4 } else { 0 })
        }

        Command::Evolve {
            project,
            cycles,
            no_meta,
            no_scout,
            observe_mode,
            persona,
            adversarial,
            group,
            all_personas,
            cautious,
            resume,
            cancel_pending,
            level,
        } => {
            let project = resolve_project(project)?;
            if resume {
                let message = resume_cautious(&project, cancel_on_ctrl_c()).await?;
                println!("{message}");
                return Ok(if message.contains("FAILED") { 4 } else { 0 });
            }
            if cancel_pending {
                println!("{}", cancel_cautious(&project)?);
                return Ok(0);
            }
            let opts = RunOptions {
                cycles,
                no_meta,
                no_scout,
                observe_mode,
                persona_id: persona,
                adversarial_id: adversarial,
                group,
                all_personas,
                cautious,
                level,
            };
            let summary = run_evolve(&project, opts, cancel_on_ctrl_c()).await?;
            println!("{}", summary.message);
            Ok(if summary.any_verify_failed { 4 } else { 0 })
        }

        Command::Status { project } => {
            let state = ProjectState::open(&resolve_project(project)?)?;
            println!("{}", state.summary()?);
            Ok(0)
        }

        Command::History { project, count } => {
            let state = ProjectState::open(&resolve_project(project)?)?;
            let total = state.list_history_files()?.len();
            let records = state.read_history(count)?;
            println!("{}", render_history(&records, total));
            Ok(0)
        }

        Command::Progress { project } => {
            let state = ProjectState::open(&resolve_project(project)?)?;
            println!("{}", progress_report(&state.read_progress()?));
            Ok(0)
        }

        Command::Config { project, set } => {
            let project = resolve_project(project)?;
            let mut config = EvonestConfig::load(&project)?;
            if let Some(pair) = set {
                config.set(&pair[0], &pair[1])?;
                config.save()?;
                println!("Set {} = {}", pair[0], pair[1]);
            } else {
                println!("{}", config.to_json()?);
            }
            Ok(0)
        }

        Command::Identity {
            project,
            set,
            refresh,
        } => {
            let project = resolve_project(project)?;
            let state = ProjectState::open(&project)?;
            if refresh {
                println!("Analyzing project to draft updated identity.md...");
                let runner = LmRunner::new(CancellationToken::new());
                let Some(draft) = draft_identity(&project, &runner).await else {
                    return Err(Error::LmUnavailable(
                        "could not generate an identity draft".into(),
                    ));
                };
                println!("--- Current identity.md ---");
                println!("{}", state.read_identity()?);
                println!("\n--- Proposed identity.md ---");
                println!("{draft}");
                if confirm("\nUpdate identity? [y/N]: ") {
                    state.write_identity(&draft)?;
                    println!("Identity updated.");
                } else {
                    println!("Cancelled. No changes made.");
                }
            } else if let Some(file) = set {
                let content = std::fs::read_to_string(file)?;
                state.write_identity(&content)?;
                println!("Identity updated.");
            } else {
                println!("{}", state.read_identity()?);
            }
            Ok(0)
        }

        Command::Backlog {
            project,
            action,
            title,
            priority,
            id,
        } => {
            let state = ProjectState::open(&resolve_project(project)?)?;
            // Infer `add` when a title is given with the default action
            let action = if title.is_some() && action == "list" {
                "add".to_string()
            } else {
                action
            };
            match action.as_str() {
                "add" => {
                    let Some(title) = title else {
                        return Err(Error::Other("add requires --title".into()));
                    };
                    let cycle = state.read_progress()?.total_cycles;
                    let item = serde_json::json!({
                        "title": title,
                        "priority": priority,
                    });
                    let mut rng = rand::thread_rng();
                    let added =
                        backlog::save_observations(&state, &[item], "human", cycle, &mut rng)?;
                    println!("Added {added} item(s) to backlog.");
                }
                "remove" => {
                    let Some(id) = id else {
                        return Err(Error::Other("remove requires --id".into()));
                    };
                    let mut current = state.load_backlog()?;
                    current.items.retain(|i| i.id != id);
                    state.save_backlog(&current)?;
                    println!("Removed item: {id}");
                }
                "prune" => {
                    let cycle = state.read_progress()?.total_cycles;
                    let removed = backlog::prune(&state, cycle)?;
                    println!("Pruned {removed} item(s).");
                }
                _ => {
                    println!("{}", backlog::render_list(&state.load_backlog()?));
                }
            }
            Ok(0)
        }
    }
}
