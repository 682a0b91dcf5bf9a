use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dataweaver::datagen::{write_daily_product_sales, SeedOptions};
use dataweaver::observability::init_tracing;
use dataweaver::{AppConfig, Pipeline, SchemaDescriptor};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(name = "dataweaver")]
#[command(about = "Ask business questions of the marketplace sales table in plain language")]
struct Cli {
    /// Data directory holding <table>.csv or <table>.parquet (overrides DATA_DIR)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Maximum rows returned per query (overrides ROW_LIMIT)
    #[arg(long, global = true)]
    row_limit: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate, review and execute SQL for a question
    Ask {
        question: String,
    },
    /// Review a SQL statement, or SQL generated for a question
    Review {
        input: String,
    },
    /// Validate and execute a SQL statement
    Execute {
        sql: String,
    },
    /// Print the SQL generated for a question without running it
    Sql {
        question: String,
    },
    /// Print the schema the models are shown
    Schema,
    /// Write a synthetic daily_product_sales.csv into the data directory
    Seed {
        #[arg(long, default_value_t = 7)]
        seed: u64,
        #[arg(long, default_value_t = 500)]
        products: usize,
        #[arg(long, default_value_t = 20_000)]
        orders: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing("info");

    let cli = Cli::parse();
    let mut config = AppConfig::from_env().context("invalid configuration")?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(limit) = cli.row_limit {
        config.row_limit = limit.max(1);
    }

    if let Command::Seed { seed, products, orders } = cli.command {
        let options = SeedOptions {
            seed,
            products,
            orders,
            ..SeedOptions::default()
        };
        let (path, rows) = write_daily_product_sales(&config.data_dir, &options)?;
        println!("Wrote {} rows to {}", rows, path.display());
        return Ok(());
    }

    if let Command::Schema = cli.command {
        let schema = match config.schema_path {
            Some(ref path) => SchemaDescriptor::load(path)?,
            None => SchemaDescriptor::daily_product_sales(),
        };
        println!("{}", schema.prompt_text());
        return Ok(());
    }

    info!("Loading data from {}", config.data_dir.display());
    let pipeline = Pipeline::from_config(&config).with_context(|| {
        format!(
            "failed to start; run `dataweaver seed` to create sample data in {}",
            config.data_dir.display()
        )
    })?;

    match cli.command {
        Command::Ask { question } => {
            let response = pipeline.ask(&question, Vec::new()).await;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Review { input } => {
            let report = pipeline.review(&input).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Execute { sql } => {
            let result = pipeline.execute(&sql).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Sql { question } => {
            let candidate = pipeline.generate_sql(&question).await?;
            println!("{}", candidate.executable_text());
        }
        Command::Schema | Command::Seed { .. } => {}
    }

    Ok(())
}
