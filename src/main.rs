use btcpredict::api::CoinGeckoClient;
use btcpredict::config::{coingecko_api_key, openai_api_key, Settings};
use btcpredict::deployment::{DeploymentManager, DeploymentStatus, SnapshotRef};
use btcpredict::improvement::{
    AnalysisLog, CodeValidator, ErrorCategory, FailureContext, ImprovementEngine, ImprovementLog,
    ImprovementRequest, PatternStore, PromptComposer,
};
use btcpredict::indicators::MarketIndicators;
use btcpredict::llm::OpenAiClient;
use btcpredict::models::{Direction, PredictionRecord};
use btcpredict::notify::LogNotifier;
use btcpredict::pipeline::{SelfImprovementLoop, SessionResult};
use btcpredict::predictor::{LivePredictor, PredictionJournal, BASELINE_PREDICTOR};
use btcpredict::status::SystemStatus;
use btcpredict::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "btcpredict")]
#[command(author, version, about = "Self-improving Bitcoin UP/DOWN predictor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ./btcpredict.toml if present)
    #[arg(short, long, global = true, env = "BTCPREDICT_CONFIG")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory and install the baseline predictor
    Init,

    /// Predict the next move with the live predictor
    Predict {
        /// Start an improvement session if the live predictor itself fails
        #[arg(long)]
        improve: bool,
    },

    /// Evaluate predictions whose horizon has passed
    Evaluate {
        /// Start an improvement session for every wrong prediction
        #[arg(long)]
        improve: bool,
    },

    /// Run an improvement session for an evaluated, wrong prediction
    Improve {
        /// Prediction ID
        prediction_id: Uuid,
    },

    /// Run the validation checks against a predictor file
    Validate {
        file: PathBuf,
    },

    /// List deployments, oldest first
    Deployments,

    /// List snapshots of every version that was ever live
    Snapshots,

    /// Restore the code that was live before a deployment
    Rollback {
        /// Deployment ID
        deployment_id: Uuid,
    },

    /// Make an arbitrary snapshot live again
    RollbackTo {
        /// Snapshot name as printed by `snapshots`
        snapshot: SnapshotRef,
    },

    /// Show what the pattern store has learned per error category
    Patterns,

    /// Evaluate due predictions, improve on wrong ones, then predict; repeat
    Run {
        /// Hours between cycles (default: cycle_interval_hours from config)
        #[arg(long)]
        interval_hours: Option<u64>,

        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,

        /// Skip improvement sessions
        #[arg(long)]
        no_improve: bool,
    },

    /// Show live deployment, accuracy and recent sessions
    Status {
        /// Number of recent sessions to show
        #[arg(short, long, default_value = "5")]
        recent: usize,
    },

    /// List recent failure analyses
    Analyses {
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let settings = Settings::load(cli.config.as_deref())?;
    tracing::debug!("Data directory: {}", settings.data_dir.display());

    match cli.command {
        Commands::Init => init(&settings).await,
        Commands::Predict { improve } => predict(&settings, improve, &cancel_on_ctrl_c()).await,
        Commands::Evaluate { improve } => evaluate(&settings, improve, &cancel_on_ctrl_c()).await,
        Commands::Improve { prediction_id } => improve(&settings, prediction_id).await,
        Commands::Validate { file } => validate(&settings, &file).await,
        Commands::Deployments => list_deployments(&settings),
        Commands::Snapshots => list_snapshots(&settings),
        Commands::Rollback { deployment_id } => rollback(&settings, deployment_id),
        Commands::RollbackTo { snapshot } => rollback_to(&settings, &snapshot),
        Commands::Patterns => patterns(&settings),
        Commands::Run {
            interval_hours,
            once,
            no_improve,
        } => run(&settings, interval_hours, once, !no_improve).await,
        Commands::Status { recent } => status(&settings, recent).await,
        Commands::Analyses { limit } => list_analyses(&settings, limit),
    }
}

// ============================================================================
// Initialization Functions
// ============================================================================

fn setup_logging(verbose: bool) {
    let default = if verbose { "btcpredict=debug" } else { "btcpredict=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn deployment_manager(settings: &Settings) -> DeploymentManager {
    DeploymentManager::new(&settings.data_dir, settings.live_predictor_path())
}

fn create_coingecko_client() -> Result<CoinGeckoClient> {
    Ok(CoinGeckoClient::new(coingecko_api_key())?)
}

/// Ctrl+C stops a running session before its next attempt
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("⚠️  Received Ctrl+C, stopping after the current attempt...");
            child.cancel();
        }
    });
    token
}

async fn build_loop(settings: &Settings) -> Result<SelfImprovementLoop> {
    let engine_config = settings.engine_config()?;
    let generation_timeout = engine_config.generation_timeout;

    let mut client = OpenAiClient::new(openai_api_key()?)
        .with_model(&settings.llm.model)
        .with_temperature(settings.llm.temperature)
        .with_request_timeout(generation_timeout + Duration::from_secs(5));
    if let Some(url) = &settings.llm.api_url {
        client = client.with_api_url(url);
    }
    let client = Arc::new(client);

    let validator = CodeValidator::new(settings.python_runtime())
        .await?
        .with_allowed_imports(settings.sandbox.allowed_imports.clone());
    let patterns = Arc::new(PatternStore::open(settings.patterns_path()));
    let composer = PromptComposer::new(
        engine_config.expected_signature.clone(),
        settings.sandbox.allowed_imports.clone(),
    );

    let engine = ImprovementEngine::new(
        client.clone(),
        Arc::new(validator),
        patterns,
        composer,
        engine_config,
    );

    let mut pipeline = SelfImprovementLoop::new(engine, Arc::new(deployment_manager(settings)))
        .with_notifier(Arc::new(LogNotifier))
        .with_log(ImprovementLog::new(settings.improvements_path()));
    if settings.engine.analyze_failures {
        pipeline = pipeline
            .with_analyzer(client)
            .with_analysis_log(AnalysisLog::new(settings.analyses_path()));
    }
    Ok(pipeline)
}

// ============================================================================
// Commands
// ============================================================================

async fn init(settings: &Settings) -> Result<()> {
    std::fs::create_dir_all(&settings.data_dir)?;

    let deployments = deployment_manager(settings);
    if deployments.install_initial(BASELINE_PREDICTOR)? {
        println!("✅ Installed baseline predictor at {}", deployments.live_path().display());
    } else {
        println!("ℹ️  Live predictor already present at {}", deployments.live_path().display());
    }

    match settings.python_runtime().check_version().await {
        Ok(version) => println!("🐍 Python {} ready for validation", version),
        Err(e) => println!("⚠️  Python runtime unusable: {}", e),
    }

    println!("📁 Data directory: {}", settings.data_dir.display());
    Ok(())
}

async fn predict(
    settings: &Settings,
    improve_on_failure: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let client = create_coingecko_client()?;
    let candles = client
        .get_daily_candles(&settings.coin_id, settings.history_days)
        .await?;
    let price = client.get_current_price(&settings.coin_id).await?;

    let predictor = LivePredictor::new(
        settings.live_predictor_path(),
        settings.python_runtime(),
        settings.signature()?,
    );

    let direction = match predictor.predict(&candles).await {
        Ok(direction) => direction,
        Err(e) if e.is_code_failure() && improve_on_failure => {
            println!("❌ Live predictor failed: {}", e);
            let request = ImprovementRequest::new(FailureContext::manual(
                format!("the live predictor failed: {}", e),
                predictor.source()?,
            ))
            .with_suspected_category(ErrorCategory::RuntimeError);

            let pipeline = build_loop(settings).await?;
            run_session(&pipeline, &request, cancel).await;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let deployment_id = deployment_manager(settings)
        .current()?
        .map(|r| r.deployment_id);
    let record = PredictionRecord {
        id: Uuid::new_v4(),
        direction,
        made_at: Utc::now(),
        price_at_prediction: price,
        horizon_hours: settings.horizon_hours,
        data_points: candles.len(),
        deployment_id,
        evaluation: None,
    };
    PredictionJournal::new(settings.predictions_path()).record(&record)?;

    let icon = match direction {
        Direction::Up => "📈",
        Direction::Down => "📉",
    };
    println!(
        "{} {} {} over the next {}h (now ${:.2}, {} days of data)",
        icon,
        settings.coin_id,
        direction.as_str().to_uppercase(),
        settings.horizon_hours,
        price,
        candles.len()
    );
    if let Some(indicators) = MarketIndicators::from_candles(&candles) {
        println!("   {}", indicators);
    }
    println!("   Prediction ID: {}", record.id);
    Ok(())
}

async fn evaluate(
    settings: &Settings,
    improve_wrong: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let journal = PredictionJournal::new(settings.predictions_path());
    let due = journal.due(Utc::now())?;
    if due.is_empty() {
        println!("ℹ️  No predictions due for evaluation");
        return Ok(());
    }

    let client = create_coingecko_client()?;
    let price = client.get_current_price(&settings.coin_id).await?;

    let mut wrong = Vec::new();
    for prediction in due {
        let evaluated = journal.evaluate(prediction.id, price)?;
        let Some(evaluation) = evaluated.evaluation.clone() else { continue };

        println!(
            "{} {} predicted {}, actual {} ({:+.2}%)",
            if evaluation.correct { "✅" } else { "❌" },
            evaluated.id,
            evaluated.direction,
            evaluation.actual_direction,
            evaluation.price_change_pct
        );
        if !evaluation.correct {
            wrong.push((evaluated, evaluation));
        }
    }

    if !improve_wrong || wrong.is_empty() {
        return Ok(());
    }

    let indicators = market_indicators(&client, settings).await;
    let pipeline = build_loop(settings).await?;

    for (prediction, evaluation) in wrong {
        if cancel.is_cancelled() {
            break;
        }
        let live_code = pipeline.deployments().live_code()?;
        let context =
            FailureContext::from_evaluation(&prediction, &evaluation, indicators.clone(), live_code);
        run_session(&pipeline, &ImprovementRequest::new(context), cancel).await;
    }
    Ok(())
}

async fn improve(settings: &Settings, prediction_id: Uuid) -> Result<()> {
    let journal = PredictionJournal::new(settings.predictions_path());
    let prediction = journal
        .get(prediction_id)?
        .ok_or_else(|| format!("Unknown prediction: {}", prediction_id))?;
    let evaluation = prediction
        .evaluation
        .clone()
        .ok_or_else(|| format!("Prediction {} has not been evaluated yet", prediction_id))?;

    if evaluation.correct {
        println!("✅ Prediction {} was correct, nothing to improve", prediction_id);
        return Ok(());
    }

    let client = create_coingecko_client()?;
    let indicators = market_indicators(&client, settings).await;
    let pipeline = build_loop(settings).await?;
    let live_code = pipeline.deployments().live_code()?;

    let context = FailureContext::from_evaluation(&prediction, &evaluation, indicators, live_code);
    let result = run_session(&pipeline, &ImprovementRequest::new(context), &cancel_on_ctrl_c()).await;

    if result.is_deployed() {
        Ok(())
    } else {
        Err(format!("Improvement session ended: {}", result.status()).into())
    }
}

async fn validate(settings: &Settings, file: &Path) -> Result<()> {
    let code = std::fs::read_to_string(file)?;
    let validator = CodeValidator::new(settings.python_runtime())
        .await?
        .with_allowed_imports(settings.sandbox.allowed_imports.clone());

    let result = validator.validate(&code, &settings.signature()?).await;

    println!("🔍 {}", file.display());
    for check in result.checks() {
        let icon = match (check.ran, check.passed) {
            (false, _) => "⏭️ ",
            (true, true) => "✅",
            (true, false) => "❌",
        };
        println!("  {} {:<18} {}", icon, check.kind.name(), check.detail);
    }

    if result.is_valid() {
        println!("✅ Valid");
        Ok(())
    } else {
        Err(format!("Validation failed:\n{}", result.error_summary()).into())
    }
}

fn list_deployments(settings: &Settings) -> Result<()> {
    let history = deployment_manager(settings).history()?;
    if history.is_empty() {
        println!("ℹ️  No deployments yet");
        return Ok(());
    }

    for record in history {
        let status = match record.status {
            DeploymentStatus::Deployed => "deployed",
            DeploymentStatus::RolledBack => "rolled_back",
        };
        println!(
            "{}  {:<11}  {}  release={}  backup={}",
            record.deployment_id,
            status,
            record.deployed_at.format("%Y-%m-%d %H:%M:%S"),
            record.deployed_code_ref,
            record.backup_path
        );
        if let Some(description) = &record.description {
            println!("    {}", description);
        }
    }
    Ok(())
}

fn list_snapshots(settings: &Settings) -> Result<()> {
    let snapshots = deployment_manager(settings).snapshots()?;
    if snapshots.is_empty() {
        println!("ℹ️  No snapshots yet");
    }
    for snapshot in snapshots {
        println!("{}", snapshot);
    }
    Ok(())
}

fn rollback(settings: &Settings, deployment_id: Uuid) -> Result<()> {
    let record = deployment_manager(settings).rollback(deployment_id)?;
    println!(
        "⏪ Rolled back {} (restored {})",
        record.deployment_id, record.backup_path
    );
    Ok(())
}

fn rollback_to(settings: &Settings, snapshot: &SnapshotRef) -> Result<()> {
    let affected = deployment_manager(settings).rollback_to(snapshot)?;
    println!("⏪ Restored {}", snapshot);
    for id in affected {
        println!("   marked {} as rolled back", id);
    }
    Ok(())
}

fn patterns(settings: &Settings) -> Result<()> {
    let store = PatternStore::open(settings.patterns_path());
    println!("📊 {} recorded patterns", store.len());
    println!("{:<18} {:>6} {:>9} {:>8}  best strategy", "category", "total", "successes", "rate");

    for stats in store.all_statistics() {
        println!(
            "{:<18} {:>6} {:>9} {:>7.0}%  {}",
            stats.category.as_str(),
            stats.total,
            stats.successes,
            stats.success_rate * 100.0,
            stats.best_strategy.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn run(settings: &Settings, interval_hours: Option<u64>, once: bool, improve: bool) -> Result<()> {
    let hours = interval_hours.unwrap_or(settings.cycle_interval_hours).max(1);
    let interval = Duration::from_secs(hours * 3600);
    let cancel = cancel_on_ctrl_c();

    println!("🤖 Autonomous mode: a cycle every {}h (improve: {})", hours, improve);
    let mut cycle: u64 = 0;

    loop {
        cycle += 1;
        tracing::info!(cycle, "Starting cycle");

        // One failing step must not stop the loop
        if let Err(e) = evaluate(settings, improve, &cancel).await {
            tracing::error!(cycle, "Evaluation failed: {}", e);
        }
        if cancel.is_cancelled() {
            break;
        }
        if let Err(e) = predict(settings, improve, &cancel).await {
            tracing::error!(cycle, "Prediction failed: {}", e);
        }

        if once || cancel.is_cancelled() {
            break;
        }

        println!("⏳ Next cycle in {}h", hours);
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    println!("👋 Stopped after {} cycle(s)", cycle);
    Ok(())
}

async fn status(settings: &Settings, recent: usize) -> Result<()> {
    let status = SystemStatus::load(settings, recent)?;

    println!("📊 btcpredict status");
    // Price is informational; offline status still works
    match create_coingecko_client() {
        Ok(client) => match client.get_current_price(&settings.coin_id).await {
            Ok(price) => println!("   {} price: ${:.2}", settings.coin_id, price),
            Err(e) => tracing::warn!("Could not fetch current price: {}", e),
        },
        Err(e) => tracing::warn!("Could not create price client: {}", e),
    }

    match &status.live_deployment {
        Some(record) => println!(
            "🚀 Live: {} since {} ({})",
            record.deployment_id,
            record.deployed_at.format("%Y-%m-%d %H:%M:%S"),
            record.deployed_code_ref
        ),
        None => println!("🚀 Live: baseline predictor"),
    }
    println!(
        "   Deployments: {} ({} rolled back)",
        status.deployments, status.rolled_back
    );

    let accuracy = |value: Option<f64>| match value {
        Some(a) => format!("{:.1}%", a * 100.0),
        None => "-".to_string(),
    };
    println!(
        "🎯 Predictions: {} total, {} evaluated, {} correct, {} pending, accuracy {}",
        status.predictions.total,
        status.predictions.evaluated,
        status.predictions.correct,
        status.predictions.pending,
        accuracy(status.predictions.accuracy)
    );
    println!(
        "   Live code: {} evaluated, accuracy {}",
        status.live_predictions.evaluated,
        accuracy(status.live_predictions.accuracy)
    );

    println!(
        "🔧 Sessions: {} ({} deployed), {} learned patterns",
        status.sessions, status.deployed_sessions, status.patterns
    );
    for session in &status.recent_sessions {
        println!(
            "   {}  {:<17}  {} attempt(s)  {}",
            session.started_at.format("%Y-%m-%d %H:%M"),
            session.status,
            session.attempts.len(),
            session.reason
        );
    }

    if status.analyses.total > 0 {
        println!(
            "🧠 Analyses: {} (avg confidence {:.2})",
            status.analyses.total, status.analyses.average_confidence
        );
        for (opportunity, count) in status.analyses.common_opportunities.iter().take(3) {
            println!("   {}x {}", count, opportunity);
        }
    }
    Ok(())
}

fn list_analyses(settings: &Settings, limit: usize) -> Result<()> {
    let analyses = AnalysisLog::new(settings.analyses_path()).recent(limit)?;
    if analyses.is_empty() {
        println!("ℹ️  No failure analyses yet");
        return Ok(());
    }

    for analysis in analyses.iter().rev() {
        println!(
            "🧠 {}  {}  confidence {:.2}",
            analysis.analyzed_at.format("%Y-%m-%d %H:%M"),
            analysis
                .prediction_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "manual".to_string()),
            analysis.confidence_score
        );
        println!("   {}", analysis.failure_reason);
        for modification in &analysis.suggested_modifications {
            println!("   - {}", modification);
        }
    }
    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Best effort; a failed fetch only makes the prompt less specific
async fn market_indicators(client: &CoinGeckoClient, settings: &Settings) -> Option<MarketIndicators> {
    match client
        .get_daily_candles(&settings.coin_id, settings.history_days)
        .await
    {
        Ok(candles) => MarketIndicators::from_candles(&candles),
        Err(e) => {
            tracing::warn!("Could not fetch market context: {}", e);
            None
        }
    }
}

async fn run_session(
    pipeline: &SelfImprovementLoop,
    request: &ImprovementRequest,
    cancel: &CancellationToken,
) -> SessionResult {
    println!("🔧 Improvement session: {}", request.context.reason);
    let (session_id, result) = pipeline.run(request, cancel).await;

    match &result {
        SessionResult::Deployed { record, attempt } => {
            println!(
                "✅ Deployed {} after {} attempt(s)",
                record.deployment_id, attempt.attempt_number
            );
            if let Some(description) = &attempt.description {
                println!("   {}", description);
            }
            for change in &attempt.changes_made {
                println!("   - {}", change);
            }
        }
        SessionResult::Exhausted { attempts } => {
            println!("❌ No valid candidate after {} attempts", attempts.len());
            if let Some(last) = attempts.last() {
                println!("   Last error: {}", last.validation_result.error_summary());
            }
        }
        other => println!("⚠️  {}", other),
    }
    println!("   Session ID: {}", session_id);
    result
}
