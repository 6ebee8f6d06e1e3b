use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;

use assessment_drilldown::aggregate;
use assessment_drilldown::config::Config;
use assessment_drilldown::db::{self, PgSource};
use assessment_drilldown::export;
use assessment_drilldown::report;
use assessment_drilldown::session::DrillSession;
use assessment_drilldown::snapshot::SnapshotSource;
use assessment_drilldown::source::ResultSource;

#[derive(Parser)]
#[command(name = "assessment-drilldown")]
#[command(about = "Faculty, group and student drill-down over psychological test results", long_about = None)]
struct Cli {
    #[command(flatten)]
    config: Config,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct DrillPath {
    #[arg(long)]
    test: String,
    #[arg(long)]
    faculty: Option<String>,
    #[arg(long, requires = "faculty")]
    group: Option<String>,
    /// Student id, or `record:<result id>` for a deleted student
    #[arg(long, requires = "group")]
    student: Option<String>,
}

impl DrillPath {
    fn label(&self) -> String {
        let mut parts = vec![format!("test {}", self.test)];
        if let Some(faculty) = &self.faculty {
            parts.push(format!("faculty {faculty}"));
        }
        if let Some(group) = &self.group {
            parts.push(format!("group {group}"));
        }
        if let Some(student) = &self.student {
            parts.push(format!("student {student}"));
        }
        parts.join(" / ")
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// List tests with their result counts
    Tests,
    /// Walk the drill-down to a scope and print it
    Drill {
        #[command(flatten)]
        path: DrillPath,
        #[arg(long)]
        json: bool,
        /// Sort siblings alphabetically instead of first-seen order
        #[arg(long)]
        sort: bool,
    },
    /// Export the records of a scope as CSV
    Export {
        #[command(flatten)]
        path: DrillPath,
        #[arg(long, default_value = "results.csv")]
        out: PathBuf,
    },
    /// List unresolved flagged results of a scope
    NeedsAttention {
        #[command(flatten)]
        path: DrillPath,
    },
    /// Mark a flagged result as reviewed
    Review {
        #[arg(long)]
        result: String,
    },
    /// Generate a markdown report for a scope
    Report {
        #[command(flatten)]
        path: DrillPath,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::InitDb => {
            let pool = connect(&cli.config).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = connect(&cli.config).await?;
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Tests => {
            let session = open_session(&cli.config).await?;
            let tests = session.tests().await?;
            print!("{}", report::render_tests(&tests));
        }
        Commands::Drill { path, json, sort } => {
            let session = open_session(&cli.config).await?;
            walk(&session, &path).await?;

            if let Some(detail) = session.detail() {
                if json {
                    println!("{}", serde_json::to_string_pretty(&detail)?);
                } else {
                    print!("{}", report::render_detail(&detail));
                }
                return Ok(());
            }

            let mut nodes = session.current_tree().unwrap_or_default();
            if sort {
                aggregate::sort_alphabetically(&mut nodes);
            }
            if json {
                println!("{}", serde_json::to_string_pretty(&nodes)?);
            } else {
                println!("{}", path.label());
                print!("{}", report::render_nodes(&nodes));
            }
        }
        Commands::Export { path, out } => {
            let session = open_session(&cli.config).await?;
            walk(&session, &path).await?;
            let rows = session.export_rows();
            let file = std::fs::File::create(&out)
                .with_context(|| format!("failed to create {}", out.display()))?;
            export::write_csv(&rows, file)?;
            println!("Exported {} rows to {}.", rows.len(), out.display());
        }
        Commands::NeedsAttention { path } => {
            let session = open_session(&cli.config).await?;
            walk(&session, &path).await?;
            let records = session.scope_records();
            println!("{}", path.label());
            print!("{}", report::render_attention(&report::unresolved(&records)));
        }
        Commands::Review { result } => {
            match &cli.config.snapshot {
                Some(path) => {
                    let snapshot = Arc::new(load_snapshot(path)?);
                    let session = DrillSession::new(snapshot.clone(), cli.config.fetch_timeout());
                    session.review_result(&result).await?;
                    snapshot
                        .save(path)
                        .with_context(|| format!("failed to write snapshot {}", path.display()))?;
                }
                None => open_session(&cli.config).await?.review_result(&result).await?,
            }
            println!("Result {result} marked reviewed.");
        }
        Commands::Report { path, out } => {
            let session = open_session(&cli.config).await?;
            walk(&session, &path).await?;
            let nodes = session.current_tree().unwrap_or_default();
            let report = report::build_report(
                &path.label(),
                &session.summary(),
                &nodes,
                &session.scope_records(),
                session.dropped_records(),
            );
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

async fn open_session(config: &Config) -> anyhow::Result<DrillSession> {
    let source: Arc<dyn ResultSource> = match &config.snapshot {
        Some(path) => Arc::new(load_snapshot(path)?),
        None => Arc::new(PgSource::new(connect(config).await?)),
    };
    Ok(DrillSession::new(source, config.fetch_timeout()))
}

fn load_snapshot(path: &Path) -> anyhow::Result<SnapshotSource> {
    SnapshotSource::load(path).with_context(|| format!("failed to load snapshot {}", path.display()))
}

async fn walk(session: &DrillSession, path: &DrillPath) -> anyhow::Result<()> {
    session.select_test(&path.test).await?;
    if let Some(faculty) = &path.faculty {
        session.select_faculty(faculty).await?;
    }
    if let Some(group) = &path.group {
        session.select_group(group)?;
    }
    if let Some(student) = &path.student {
        session.select_student(student).await?;
    }

    let dropped = session.dropped_records();
    if dropped > 0 {
        eprintln!("{dropped} malformed results dropped.");
    }
    Ok(())
}
