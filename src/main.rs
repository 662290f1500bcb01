use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use vigil_core::{BudgetProfile, Severity, VigilConfig};
use vigil_github::{
    fetch_pull_request_snapshot, parse_repo_full_name, GitHubClient, PullRequestSnapshot,
    ResponseCache,
};
use vigil_review::{
    publish, render_markdown, write_artifacts, ChatReviewer, OctocrabComments, Orchestrator,
    PublishAction, Reviewer, RunTelemetry,
};

#[derive(Parser)]
#[command(
    name = "vigil",
    version,
    about = "Budget-bounded AI pull request review",
    arg_required_else_help = true,
    long_about = "Vigil reviews a single GitHub pull request under hard resource budgets,\n\
                   backed by a cached, rate-limit-aware GitHub client, and scores stored\n\
                   results against curated ground truth.\n\n\
                   Examples:\n  \
                     vigil review --repo owner/repo --pr 42         Review a PR\n  \
                     vigil review --repo owner/repo --pr 42 --post  Post the bot comment\n  \
                     vigil snapshot --repo owner/repo --pr 42       Capture a snapshot artifact\n  \
                     vigil eval --predictions r.json --truth t.json Score against ground truth\n  \
                     vigil doctor                                   Check setup and environment"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Path to configuration file (default: .vigil.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Review a GitHub pull request under hard resource budgets
    #[command(long_about = "Review a GitHub pull request under hard resource budgets.\n\n\
        Fetches a cached PR snapshot, runs the draft/verify/escalate loop against\n\
        the configured reviewer model, and writes a run artifact set under runs/.\n\
        The run always produces a result, even when truncated by budget.\n\n\
        Examples:\n  vigil review --repo octocat/hello-world --pr 42\n  \
        vigil review --repo octocat/hello-world --pr 42 --post --fail-on high")]
    Review {
        /// Repository in owner/repo format
        #[arg(long)]
        repo: String,

        /// Pull request number
        #[arg(long)]
        pr: u64,

        /// Budget profile: default, strict, thorough, or the [budget] name
        /// from .vigil.toml
        #[arg(long)]
        budget_profile: Option<String>,

        /// Create or update the single bot comment on the PR
        #[arg(
            long,
            long_help = "Create or update the single bot comment on the PR.\n\n\
                Requires GITHUB_TOKEN. The comment is matched by a stable marker\n\
                line, so reruns update in place instead of stacking comments."
        )]
        post: bool,

        /// Exit with non-zero code when issues of this severity or higher remain
        #[arg(long)]
        fail_on: Option<Severity>,
    },
    /// Capture a PR snapshot artifact for offline evals
    #[command(long_about = "Capture a PR snapshot artifact for offline evals.\n\n\
        Fetches metadata, changed files, and the raw diff through the response\n\
        cache and writes one JSON artifact per (repo, PR, head SHA).\n\n\
        Example:\n  vigil snapshot --repo octocat/hello-world --pr 1")]
    Snapshot {
        /// Repository in owner/repo format
        #[arg(long)]
        repo: String,

        /// Pull request number
        #[arg(long)]
        pr: u64,

        /// Output directory for snapshot artifacts
        #[arg(long, default_value = "eval/data/snapshots")]
        output_dir: PathBuf,
    },
    /// Score a produced result against curated ground truth
    #[command(long_about = "Score a produced result against curated ground truth.\n\n\
        Predictions may be a review.json artifact or a bare issue array; ground\n\
        truth is a JSON issue list. Matching is one-to-one with a 3-line\n\
        positional tolerance.\n\n\
        Example:\n  vigil eval --predictions runs/.../review.json --truth truth.json")]
    Eval {
        /// Predictions file: a review.json artifact or a bare issue array
        #[arg(long)]
        predictions: PathBuf,

        /// Ground-truth issue list (JSON)
        #[arg(long)]
        truth: PathBuf,
    },
    /// Create a default .vigil.toml configuration file
    #[command(long_about = "Create a default .vigil.toml configuration file.\n\n\
        Generates a commented-out template with all available options.\n\
        Fails if .vigil.toml already exists.")]
    Init,
    /// Check your Vigil setup and environment
    #[command(long_about = "Check your Vigil setup and environment.\n\n\
        Runs diagnostics for the config file, LLM API key, GitHub token,\n\
        response cache, and runs directory. Use --json for machine-readable\n\
        output.")]
    Doctor,
}

const DEFAULT_CONFIG: &str = r#"# Vigil Configuration
# See: https://github.com/vigil-dev/vigil

[llm]
# model = "gpt-4o"
# escalation_model = "gpt-4o"
# base_url = "https://api.openai.com"
# prompt_version = "v1"
# max_context_tokens = 24000

[github]
# cache_db_path = ".cache/github_cache.sqlite"
# timeout_seconds = 20

[budget]
# name = "default"
# max_llm_calls = 2
# max_tool_calls = 3
# max_verify_candidates = 5
# max_output_issues = 15
# max_wall_time_seconds = 60
# max_cost_usd = 0.5

[output]
# runs_dir = "runs"
# full_payloads = false
"#;

struct CheckResult {
    name: &'static str,
    status: &'static str,
    detail: String,
    hint: Option<String>,
}

impl CheckResult {
    fn pass(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: "pass",
            detail: detail.into(),
            hint: None,
        }
    }

    fn fail(name: &'static str, detail: impl Into<String>, hint: impl Into<String>) -> Self {
        Self {
            name,
            status: "fail",
            detail: detail.into(),
            hint: Some(hint.into()),
        }
    }

    fn info(name: &'static str, detail: impl Into<String>) -> Self {
        Self {
            name,
            status: "info",
            detail: detail.into(),
            hint: None,
        }
    }

    fn symbol(&self) -> &'static str {
        match self.status {
            "pass" => "\u{2713}",
            "fail" => "\u{2717}",
            _ => "~",
        }
    }
}

fn load_config(cli: &Cli) -> Result<VigilConfig> {
    match &cli.config {
        Some(path) => Ok(VigilConfig::from_file(path).into_diagnostic()?),
        None => {
            let default_path = Path::new(".vigil.toml");
            if default_path.exists() {
                Ok(VigilConfig::from_file(default_path).into_diagnostic()?)
            } else {
                Ok(VigilConfig::default())
            }
        }
    }
}

fn resolve_github_token(config: &VigilConfig) -> Result<String> {
    if let Some(token) = &config.github.token {
        return Ok(token.clone());
    }
    std::env::var("GITHUB_TOKEN")
        .or_else(|_| std::env::var("GH_TOKEN"))
        .map_err(|_| {
            miette::miette!(
                help = "export GITHUB_TOKEN=... or set token in .vigil.toml under [github]",
                "No GitHub token configured"
            )
        })
}

fn check_llm_key(config: &VigilConfig) -> Result<()> {
    if config.llm.api_key.is_none() && std::env::var("OPENAI_API_KEY").is_err() {
        miette::bail!(miette::miette!(
            help = "Set OPENAI_API_KEY or add api_key in your .vigil.toml under [llm]",
            "No API key configured for the LLM provider"
        ));
    }
    Ok(())
}

fn resolve_budget_profile(name: Option<&str>, config: &VigilConfig) -> Result<BudgetProfile> {
    let Some(name) = name else {
        return Ok(config.budget.clone());
    };
    if name == config.budget.name {
        return Ok(config.budget.clone());
    }
    match name {
        "default" => Ok(BudgetProfile::default()),
        "strict" => Ok(BudgetProfile {
            name: "strict".into(),
            max_llm_calls: 1,
            max_tool_calls: 1,
            max_verify_candidates: 0,
            max_output_issues: 10,
            max_wall_time_seconds: 30,
            max_cost_usd: 0.10,
        }),
        "thorough" => Ok(BudgetProfile {
            name: "thorough".into(),
            max_llm_calls: 4,
            max_tool_calls: 6,
            max_verify_candidates: 8,
            max_output_issues: 25,
            max_wall_time_seconds: 180,
            max_cost_usd: 2.0,
        }),
        other => miette::bail!(miette::miette!(
            help = "built-in profiles: default, strict, thorough; or match the [budget] name in .vigil.toml",
            "Unknown budget profile '{other}'"
        )),
    }
}

fn spinner(message: &str) -> Option<indicatif::ProgressBar> {
    if !std::io::stderr().is_terminal() {
        return None;
    }
    let pb = indicatif::ProgressBar::new_spinner();
    pb.set_style(
        indicatif::ProgressStyle::with_template("{spinner:.cyan} {msg} ({elapsed})").unwrap(),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    Some(pb)
}

async fn fetch_snapshot(
    config: &VigilConfig,
    repo: &str,
    pr: u64,
    wall_cap: Duration,
) -> Result<PullRequestSnapshot> {
    let token = resolve_github_token(config)?;
    let cache = Arc::new(ResponseCache::open(Path::new(&config.github.cache_db_path)).into_diagnostic()?);
    let client = GitHubClient::new(&token, Some(cache), config.github.timeout_seconds).into_diagnostic()?;

    let pb = spinner(&format!("Fetching snapshot of {repo}#{pr}..."));
    let snapshot = fetch_pull_request_snapshot(&client, repo, pr, Some(wall_cap))
        .await
        .inspect_err(|_e| {
            if let Some(pb) = &pb {
                pb.finish_with_message("Failed");
            }
        })
        .into_diagnostic()?;
    if let Some(pb) = pb {
        pb.finish_with_message(format!("Snapshot ready ({} files)", snapshot.files.len()));
    }
    Ok(snapshot)
}

fn build_snapshot_artifact(snapshot: &PullRequestSnapshot) -> serde_json::Value {
    serde_json::json!({
        "schema_version": "v1",
        "captured_at": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "repository": snapshot.repository,
        "pr_number": snapshot.pr_number,
        "base_sha": snapshot.metadata.base_sha,
        "head_sha": snapshot.metadata.head_sha,
        "metadata": snapshot.metadata,
        "files": snapshot.files,
        "raw_diff": snapshot.raw_diff,
        "warnings": snapshot.warnings,
        "truncated": snapshot.truncated,
    })
}

fn run_doctor(config: &VigilConfig, json: bool) -> Result<()> {
    let mut checks: Vec<CheckResult> = Vec::new();

    // 1. Config file
    if Path::new(".vigil.toml").exists() {
        checks.push(CheckResult::pass("config_file", ".vigil.toml found"));
    } else {
        checks.push(CheckResult::fail(
            "config_file",
            ".vigil.toml not found",
            "run 'vigil init' to create a default config",
        ));
    }

    // 2. LLM model + API key
    checks.push(CheckResult::pass(
        "llm_model",
        format!("{} (prompt {})", config.llm.model, config.llm.prompt_version),
    ));
    if config.llm.api_key.is_some() || std::env::var("OPENAI_API_KEY").is_ok() {
        checks.push(CheckResult::pass("llm_api_key", "OPENAI_API_KEY set"));
    } else {
        checks.push(CheckResult::fail(
            "llm_api_key",
            "OPENAI_API_KEY not set",
            "export OPENAI_API_KEY=... or set api_key in .vigil.toml [llm]",
        ));
    }

    // 3. Escalation model
    match &config.llm.escalation_model {
        Some(model) => checks.push(CheckResult::pass("escalation_model", model.clone())),
        None => checks.push(CheckResult::info(
            "escalation_model",
            "not configured (escalation phase will be skipped)",
        )),
    }

    // 4. GitHub token
    if config.github.token.is_some()
        || std::env::var("GITHUB_TOKEN").is_ok()
        || std::env::var("GH_TOKEN").is_ok()
    {
        checks.push(CheckResult::pass("github_token", "GITHUB_TOKEN set"));
    } else {
        checks.push(CheckResult::fail(
            "github_token",
            "GITHUB_TOKEN not set",
            "export GITHUB_TOKEN=... (needed for review and snapshot)",
        ));
    }

    // 5. Response cache
    let cache_path = Path::new(&config.github.cache_db_path);
    if cache_path.exists() {
        match ResponseCache::open(cache_path) {
            Ok(_) => checks.push(CheckResult::pass(
                "response_cache",
                format!("{} opens cleanly", cache_path.display()),
            )),
            Err(e) => checks.push(CheckResult::fail(
                "response_cache",
                format!("{} cannot be opened: {e}", cache_path.display()),
                "delete the cache file; it is rebuilt on the next fetch",
            )),
        }
    } else {
        checks.push(CheckResult::info(
            "response_cache",
            format!("{} not found (created on first fetch)", cache_path.display()),
        ));
    }

    // 6. Runs directory
    let runs_dir = Path::new(&config.output.runs_dir);
    if runs_dir.exists() {
        let run_count = std::fs::read_dir(runs_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        checks.push(CheckResult::info(
            "runs_dir",
            format!("{} ({run_count} run(s))", runs_dir.display()),
        ));
    } else {
        checks.push(CheckResult::info(
            "runs_dir",
            format!("{} not found (created on first run)", runs_dir.display()),
        ));
    }

    if json {
        let entries: Vec<serde_json::Value> = checks
            .iter()
            .map(|c| {
                serde_json::json!({
                    "name": c.name,
                    "status": c.status,
                    "detail": c.detail,
                    "hint": c.hint,
                })
            })
            .collect();
        let payload = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "checks": entries,
        });
        println!("{}", serde_json::to_string_pretty(&payload).into_diagnostic()?);
    } else {
        println!("Vigil v{} — Environment Check\n", env!("CARGO_PKG_VERSION"));
        for check in &checks {
            let label = check.name.replace('_', " ");
            println!("  {} {label:<18} {}", check.symbol(), check.detail);
            if let Some(hint) = &check.hint {
                println!("    hint: {hint}");
            }
        }
        let passed = checks.iter().filter(|c| c.status == "pass").count();
        let failed = checks.iter().filter(|c| c.status == "fail").count();
        let info = checks.iter().filter(|c| c.status == "info").count();
        println!("\n{passed} checks passed, {failed} failed, {info} info");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .build(),
        )
    }))
    .expect("miette handler");
    human_panic::setup_panic!();

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new(if cli.verbose { "debug" } else { "warn" })
            }),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;

    match cli.command {
        Command::Review {
            ref repo,
            pr,
            ref budget_profile,
            post,
            fail_on,
        } => {
            parse_repo_full_name(repo).into_diagnostic()?;
            check_llm_key(&config)?;
            let profile = resolve_budget_profile(budget_profile.as_deref(), &config)?;

            let wall_cap = Duration::from_secs(profile.max_wall_time_seconds);
            let snapshot = fetch_snapshot(&config, repo, pr, wall_cap).await?;

            let reviewer: Arc<dyn Reviewer> =
                Arc::new(ChatReviewer::new(&config.llm, &config.llm.model).into_diagnostic()?);
            let escalation: Option<Arc<dyn Reviewer>> = match &config.llm.escalation_model {
                Some(model) => Some(Arc::new(ChatReviewer::new(&config.llm, model).into_diagnostic()?)),
                None => None,
            };
            let orchestrator = Orchestrator::new(reviewer, escalation, None);

            let mut run_config = config.clone();
            run_config.budget = profile;
            let result = orchestrator.run(&snapshot, &run_config).await;

            if cli.verbose {
                eprintln!("--- Review Stats ---");
                eprintln!(
                    "Status: {} | Issues: {} | Files reviewed: {}",
                    result.status,
                    result.issues.len(),
                    result.files_reviewed.len(),
                );
                eprintln!(
                    "LLM calls: {} | Tool calls: {} | Tokens: {} | Cost: ${:.4}",
                    result.stats.llm_calls,
                    result.stats.tool_calls,
                    result.stats.tokens_used,
                    result.stats.cost_usd,
                );
                eprintln!("--------------------");
            }

            let telemetry = RunTelemetry::from_run(&result, config.output.full_payloads);
            let runs_dir = PathBuf::from(&config.output.runs_dir);
            if post {
                let api = OctocrabComments::new(config.github.token.as_deref()).into_diagnostic()?;
                let receipt = publish(&api, repo, pr, &result, &telemetry, &runs_dir)
                    .await
                    .into_diagnostic()?;
                let verb = match receipt.action {
                    PublishAction::Created => "created",
                    PublishAction::Updated => "updated",
                };
                eprintln!("Bot comment {verb} on {repo}#{pr}");
            } else {
                let paths = write_artifacts(&runs_dir, &result, &telemetry).into_diagnostic()?;
                eprintln!(
                    "Artifacts written to {}",
                    paths[0].parent().unwrap_or(&runs_dir).display()
                );
            }

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&result).into_diagnostic()?);
            } else {
                println!("{}", render_markdown(&result));
            }

            if let Some(threshold) = fail_on {
                let has_findings = result
                    .issues
                    .iter()
                    .any(|i| i.severity.meets_threshold(threshold));
                if has_findings {
                    std::process::exit(1);
                }
            }
        }
        Command::Snapshot {
            ref repo,
            pr,
            ref output_dir,
        } => {
            let (owner, name) = parse_repo_full_name(repo).into_diagnostic()?;
            let wall_cap = Duration::from_secs(config.budget.max_wall_time_seconds);
            let snapshot = fetch_snapshot(&config, repo, pr, wall_cap).await?;

            let payload = build_snapshot_artifact(&snapshot);
            std::fs::create_dir_all(output_dir).into_diagnostic()?;
            let short_sha: String = snapshot.metadata.head_sha.chars().take(12).collect();
            let output_path = output_dir.join(format!("{owner}__{name}__pr{pr}__{short_sha}.json"));
            std::fs::write(
                &output_path,
                serde_json::to_string_pretty(&payload).into_diagnostic()?,
            )
            .into_diagnostic()?;
            println!("{}", output_path.display());
        }
        Command::Eval {
            ref predictions,
            ref truth,
        } => {
            let prediction_set = vigil_eval::load_predictions(predictions).into_diagnostic()?;
            let ground_truth = vigil_eval::load_ground_truth(truth).into_diagnostic()?;
            let scored = vigil_eval::score(&prediction_set.issues, &ground_truth);

            let mut eval_result = scored.result.clone();
            eval_result.cost_usd = prediction_set.cost_usd;
            eval_result.latency_seconds = prediction_set.latency_seconds;

            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&eval_result).into_diagnostic()?
                );
            } else {
                println!(
                    "Eval: {} prediction(s) vs {} ground-truth issue(s)",
                    scored.total_predicted, scored.total_truth,
                );
                println!("  matched:     {}", scored.matches.len());
                println!("  recall:      {:.3}", eval_result.recall);
                println!("  precision:   {:.3}", eval_result.precision);
                println!("  f1:          {:.3}", eval_result.f1);
                println!("  calibration: {:.3}", eval_result.avg_confidence_calibration);
                println!("  severity mismatches: {}", scored.severity_mismatches);
            }
        }
        Command::Init => {
            let path = Path::new(".vigil.toml");
            if path.exists() {
                miette::bail!(".vigil.toml already exists");
            }
            std::fs::write(path, DEFAULT_CONFIG).into_diagnostic()?;
            println!("Created .vigil.toml with default configuration");
        }
        Command::Doctor => {
            run_doctor(&config, cli.json)?;
        }
    }

    Ok(())
}
