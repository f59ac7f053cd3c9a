use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use text2sql_rag::execution::ExecutionOutcome;
use text2sql_rag::observability::init_logging;
use text2sql_rag::schema_rag::ModelStatus;
use text2sql_rag::{AppConfig, QueryResponse, Text2SqlPipeline};
use tracing::info;

#[derive(Parser)]
#[command(name = "text2sql")]
#[command(about = "Ask a relational database questions in plain language")]
struct Cli {
    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "TEXT2SQL_LOG", default_value = "warn", global = true)]
    log_level: String,

    /// Database profiles file (overrides TEXT2SQL_DATABASES_FILE)
    #[arg(long, global = true)]
    databases_file: Option<PathBuf>,

    /// LLM profiles file (overrides TEXT2SQL_LLMS_FILE)
    #[arg(long, global = true)]
    llms_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Translate a question into SQL and run it
    Ask {
        question: String,

        /// Database id (default: first configured)
        #[arg(short, long)]
        database: Option<String>,

        /// LLM configuration id (default: TEXT2SQL_DEFAULT_LLM, then first configured)
        #[arg(short, long)]
        llm: Option<String>,

        /// Print the SQL without running it
        #[arg(long)]
        no_execute: bool,

        /// Number of tables to retrieve
        #[arg(long)]
        top_k: Option<usize>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Introspect a database and rebuild its schema index
    Index {
        #[arg(short, long)]
        database: Option<String>,

        /// Index every configured database
        #[arg(long, conflicts_with = "database")]
        all: bool,
    },
    /// List configured databases
    Databases,
    /// Connect to every configured database and introspect it
    Check,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Csv,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let mut config = AppConfig::from_env().context("invalid configuration")?;
    if let Some(path) = cli.databases_file {
        config.databases_file = path;
    }
    if let Some(path) = cli.llms_file {
        config.llms_file = path;
    }
    if let Command::Ask { top_k: Some(k), .. } = &cli.command {
        config.top_k = (*k).max(1);
    }

    let pipeline =
        Text2SqlPipeline::from_config(&config, ModelStatus::ready()).context("failed to initialize pipeline")?;

    match cli.command {
        Command::Ask {
            question,
            database,
            llm,
            no_execute,
            format,
            ..
        } => {
            let database_id = resolve_database(&pipeline, database)?;
            info!("Asking '{}' against '{}'", question, database_id);
            let response = pipeline
                .process_query(&question, &database_id, llm.as_deref(), !no_execute)
                .await;
            match format {
                OutputFormat::Table => print_table(&response),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response)?),
                OutputFormat::Csv => write_csv(&response)?,
            }
            if !response.success {
                std::process::exit(1);
            }
        }
        Command::Index { database, all } => {
            let targets: Vec<String> = if all {
                pipeline.databases().iter().map(|p| p.id.clone()).collect()
            } else {
                vec![resolve_database(&pipeline, database)?]
            };
            for id in targets {
                let count = pipeline
                    .index_database(&id)
                    .await
                    .with_context(|| format!("failed to index '{}'", id))?;
                println!("Indexed {} table(s) of '{}'", count, id);
            }
        }
        Command::Databases => {
            let index = pipeline.retrieval().index();
            for profile in pipeline.databases() {
                println!(
                    "{:<20} {:<9} {:<8} {}",
                    profile.id,
                    profile.kind.as_str(),
                    if index.contains(&profile.id) { "indexed" } else { "-" },
                    profile.description.as_deref().unwrap_or(&profile.name)
                );
            }
        }
        Command::Check => check_databases(&pipeline).await,
    }

    Ok(())
}

fn resolve_database(pipeline: &Text2SqlPipeline, requested: Option<String>) -> Result<String> {
    match requested {
        Some(id) => Ok(id),
        None => pipeline
            .default_database_id()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("no database configured")),
    }
}

async fn check_databases(pipeline: &Text2SqlPipeline) {
    if pipeline.databases().is_empty() {
        println!("No databases configured.");
        return;
    }
    for profile in pipeline.databases() {
        let backend = match pipeline.registry().backend(&profile.id) {
            Ok(backend) => backend,
            Err(e) => {
                println!("❌ {}: {}", profile.id, e);
                continue;
            }
        };
        if let Err(e) = backend.fetch("SELECT 1", 1, Duration::from_secs(10)).await {
            println!("❌ {}: connection failed: {}", profile.id, e);
            continue;
        }
        match backend.introspect().await {
            Ok(tables) => println!("✅ {} ({}): {} table(s)", profile.id, backend.dialect(), tables.len()),
            Err(e) => println!("⚠️  {}: connected, but introspection failed: {}", profile.id, e),
        }
    }
}

fn print_table(response: &QueryResponse) {
    if let Some(reasoning) = response.trace.reasoning() {
        println!("Reasoning: {}\n", reasoning);
    }
    if let Some(sql) = &response.sql {
        println!("SQL:\n{}\n", sql);
    }
    if let Some(ExecutionOutcome::Success {
        columns,
        rows,
        row_count,
        truncated,
        elapsed_ms,
    }) = &response.result
    {
        let cells: Vec<Vec<String>> = rows.iter().map(|row| row.iter().map(cell).collect()).collect();
        let widths: Vec<usize> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| {
                cells
                    .iter()
                    .filter_map(|r| r.get(i))
                    .map(|v| v.chars().count())
                    .chain(std::iter::once(c.chars().count()))
                    .max()
                    .unwrap_or(0)
            })
            .collect();
        let line = |values: &[String]| -> String {
            values
                .iter()
                .zip(&widths)
                .map(|(v, w)| format!("{:<width$}", v, width = *w))
                .collect::<Vec<_>>()
                .join(" | ")
        };
        println!("{}", line(columns.as_slice()));
        println!("{}", widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("-+-"));
        for row in &cells {
            println!("{}", line(row.as_slice()));
        }
        println!(
            "\n({} row(s){}, {} ms)",
            row_count,
            if *truncated { ", truncated" } else { "" },
            elapsed_ms
        );
    }
    if let Some(error) = &response.error {
        eprintln!("Error: {}", error);
    }
}

fn write_csv(response: &QueryResponse) -> Result<()> {
    let Some(ExecutionOutcome::Success { columns, rows, .. }) = &response.result else {
        if let Some(error) = &response.error {
            eprintln!("Error: {}", error);
        }
        return Ok(());
    };
    let mut writer = csv::Writer::from_writer(std::io::stdout());
    writer.write_record(columns)?;
    for row in rows {
        writer.write_record(row.iter().map(cell))?;
    }
    writer.flush()?;
    Ok(())
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
