//! ormdoc command-line query compiler.
//!
//! Loads a class catalog, compiles a list query and prints the plan, or runs
//! it against documents loaded from a JSON fixture.

mod args;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use serde_json::{json, Value};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use args::{Args, Command};
use ormdoc_core::{Catalog, MemoryStore, QueryCompiler, QueryExecutor};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ormdoc=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.compiler_config();
    let catalog = load_catalog(&args.catalog)?;
    tracing::info!(
        catalog = %args.catalog.display(),
        classes = catalog.len(),
        "catalog loaded"
    );
    let compiler = QueryCompiler::new(Arc::new(catalog)).with_config(config);

    match args.command {
        Command::Compile(query) => {
            let query = query.to_query()?;
            let store = MemoryStore::new();
            let plan = compiler.compile(&query, &store).await?;
            print_json(&plan.explain()?)?;
        }
        Command::Run { query, data } => {
            let query = query.to_query()?;
            let store = MemoryStore::new();
            store.load_fixture(&std::fs::read_to_string(&data)?)?;
            tracing::info!(data = %data.display(), "fixture loaded");

            let executor = QueryExecutor::new(compiler, Arc::new(store));
            let result = executor.list(&query).await?;
            tracing::info!(rows = result.rows.len(), total = ?result.total, "query finished");
            let mut output = json!({ "rows": result.rows });
            if let Some(total) = result.total {
                output["total"] = json!(total);
            }
            print_json(&output)?;
        }
    }
    Ok(())
}

fn load_catalog(path: &Path) -> Result<Catalog, Box<dyn std::error::Error>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read catalog {}: {}", path.display(), e))?;
    Ok(Catalog::from_json(&text)?)
}

fn print_json(value: &Value) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
