use anyhow::{Context, Result, bail};
use celoe_config::load::load_config;
use celoe_config::shared::{EtlConfig, IntoConnectOptions, StuckConfig};
use celoe_etl::destination::postgres::PostgresDestination;
use celoe_etl::migrations::apply_target_migrations;
use celoe_etl::pipeline::{ClearScope, EtlPipeline};
use celoe_etl::planner::parse_extraction_date;
use celoe_etl::source::moodle::MoodleSourceReader;
use celoe_etl::store::postgres::PostgresStateStore;
use celoe_etl::types::{LogFilter, RunStatus};
use clap::{Parser, Subcommand};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

#[derive(Parser)]
#[command(name = "celoe-runner", about = "Moodle to celoeapi reporting ETL")]
pub struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Full refresh: truncate loaded facts and re-extract from a start date
    /// up to today
    Full {
        /// First extraction date, YYYY-MM-DD
        start: String,
    },
    /// Run the windows of an explicit date range
    Backfill {
        /// First extraction date, YYYY-MM-DD
        start: String,
        /// Last extraction date, YYYY-MM-DD; defaults to today
        end: Option<String>,
        /// Reprocess days already behind the watermark
        #[arg(long)]
        force: bool,
    },
    /// Re-run exactly one extraction date
    Window {
        /// Extraction date, YYYY-MM-DD
        date: String,
    },
    /// Force-fail runs abandoned by crashed processes
    Reclaim {
        /// Minutes a running row may go without progress before it is
        /// reclaimed; overrides the configured value
        #[arg(long)]
        timeout_minutes: Option<i64>,
        /// Minutes after which any row without an end time is reclaimed;
        /// overrides the configured value
        #[arg(long)]
        hard_timeout_minutes: Option<i64>,
    },
    /// Show the most recent run
    Status {
        /// Restrict to one run type (full, backfill, single)
        #[arg(long = "type")]
        run_type: Option<String>,
    },
    /// List past runs, newest first
    Logs {
        /// Restrict to one run type
        #[arg(long = "type")]
        run_type: Option<String>,
        /// Restrict to one status (pending, finished, running, failed)
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: u64,
        #[arg(long, default_value_t = 50)]
        limit: u64,
    },
    /// Remove loaded data
    Clear {
        /// Remove a single extraction date, YYYY-MM-DD
        #[arg(long, conflicts_with = "all")]
        date: Option<String>,
        /// Remove everything and reset watermarks
        #[arg(long)]
        all: bool,
    },
}

pub async fn run(args: Args) -> Result<()> {
    let mut config: EtlConfig = load_config().context("failed to load configuration")?;
    if let Command::Reclaim {
        timeout_minutes,
        hard_timeout_minutes,
    } = &args.command
    {
        apply_stuck_overrides(
            &mut config.pipeline.stuck,
            *timeout_minutes,
            *hard_timeout_minutes,
        );
    }
    config.validate().context("invalid configuration")?;

    apply_target_migrations(&config.target)
        .await
        .context("failed to migrate the reporting schema")?;

    let source_pool = MySqlPoolOptions::new()
        .max_connections(u32::from(config.pipeline.max_concurrency) + 1)
        .connect_with(config.source.with_db())
        .await
        .context("failed to connect to the Moodle database")?;
    let target_pool = PgPoolOptions::new()
        .max_connections(u32::from(config.pipeline.max_concurrency) + 1)
        .connect_with(config.target.with_db())
        .await
        .context("failed to connect to the reporting database")?;

    let pipeline = EtlPipeline::new(
        MoodleSourceReader::new(source_pool),
        PostgresStateStore::new(target_pool.clone()),
        PostgresDestination::new(target_pool),
        config.pipeline,
    );

    match args.command {
        Command::Full { start } => {
            let summary = pipeline.run_full(&start).await?;
            info!(
                log_id = summary.log_id,
                windows = summary.windows_completed,
                rows = summary.rows_loaded,
                "full run finished"
            );
        }
        Command::Backfill { start, end, force } => {
            let summary = pipeline.run_backfill(&start, end.as_deref(), force).await?;
            info!(
                log_id = summary.log_id,
                windows = summary.windows_completed,
                rows = summary.rows_loaded,
                committed_through = ?summary.committed_through,
                "backfill finished"
            );
        }
        Command::Window { date } => {
            let summary = pipeline.run_single_window(&date).await?;
            info!(
                log_id = summary.log_id,
                rows = summary.rows_loaded,
                "single window finished"
            );
        }
        Command::Reclaim { .. } => {
            let cleared = pipeline.reclaim_stuck().await?;
            info!(cleared, "reclaim finished");
        }
        Command::Status { run_type } => match pipeline.get_status(run_type.as_deref()).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => println!("no runs recorded"),
        },
        Command::Logs {
            run_type,
            status,
            page,
            limit,
        } => {
            let filter = LogFilter {
                run_type,
                status: status.as_deref().map(parse_status).transpose()?,
                page,
                limit,
            };
            let records = pipeline.get_logs(&filter).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        Command::Clear { date, all } => {
            let scope = match (date, all) {
                (Some(date), false) => ClearScope::Window(parse_extraction_date(&date)?),
                (None, true) => ClearScope::All,
                _ => bail!("clear requires either --date or --all"),
            };
            pipeline.clear(scope).await?;
            info!("clear finished");
        }
    }

    Ok(())
}

fn apply_stuck_overrides(stuck: &mut StuckConfig, timeout: Option<i64>, hard_timeout: Option<i64>) {
    if let Some(timeout) = timeout {
        stuck.timeout_minutes = timeout;
    }
    if let Some(hard_timeout) = hard_timeout {
        stuck.hard_timeout_minutes = hard_timeout;
    }
}

fn parse_status(value: &str) -> Result<RunStatus> {
    match value {
        "pending" => Ok(RunStatus::Pending),
        "finished" => Ok(RunStatus::Finished),
        "running" => Ok(RunStatus::Running),
        "failed" => Ok(RunStatus::Failed),
        other => bail!("unknown status '{other}', expected pending, finished, running or failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reclaim_flags_override_the_stuck_timeouts() {
        let args =
            Args::try_parse_from(["celoe-runner", "reclaim", "--timeout-minutes", "5"]).unwrap();
        let Command::Reclaim {
            timeout_minutes,
            hard_timeout_minutes,
        } = args.command
        else {
            panic!("expected the reclaim subcommand");
        };

        let mut stuck = StuckConfig::default();
        apply_stuck_overrides(&mut stuck, timeout_minutes, hard_timeout_minutes);

        assert_eq!(stuck.timeout_minutes, 5);
        assert_eq!(stuck.hard_timeout_minutes, StuckConfig::default().hard_timeout_minutes);
    }

    #[test]
    fn reclaim_without_flags_keeps_the_configured_timeouts() {
        let args = Args::try_parse_from(["celoe-runner", "reclaim"]).unwrap();
        let Command::Reclaim {
            timeout_minutes,
            hard_timeout_minutes,
        } = args.command
        else {
            panic!("expected the reclaim subcommand");
        };

        let mut stuck = StuckConfig::default();
        apply_stuck_overrides(&mut stuck, timeout_minutes, hard_timeout_minutes);

        assert_eq!(stuck.timeout_minutes, StuckConfig::default().timeout_minutes);
        assert_eq!(
            stuck.hard_timeout_minutes,
            StuckConfig::default().hard_timeout_minutes
        );
    }
}
