use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use memquery::config::EngineConfig;
use memquery::ingestion::{JsonRowParser, RowParser};
use memquery::metrics;
use memquery::query::{QueryExecutor, QueryExpression};
use memquery::storage::{MemorySchemaCatalog, StorageEngine};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_ansi(true)
        .pretty()
        .init();

    let args: Vec<String> = env::args().collect();
    let config = match args.get(1) {
        Some(path) => EngineConfig::from_file(path)?,
        None => EngineConfig::default(),
    };

    // Initialize metrics
    if let Some(metrics_addr) = config.metrics_addr {
        if let Err(e) = metrics::init_metrics(metrics_addr) {
            eprintln!("Failed to initialize metrics: {}", e);
        } else {
            info!("Metrics server listening on {}", metrics_addr);
        }
    }

    info!("Starting memquery...");

    let schema = Arc::new(MemorySchemaCatalog::new());
    for (path, data_type) in config.series_paths()? {
        schema.register(path, data_type)?;
    }
    let engine = Arc::new(StorageEngine::open(config, schema.clone())?);

    let rows_paths: Vec<PathBuf> = args.iter().skip(2).map(PathBuf::from).collect();
    if !rows_paths.is_empty() {
        let ingest_engine = Arc::clone(&engine);
        let ingest_schema = schema.clone();
        let inserted = tokio::task::spawn_blocking(
            move || -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
                let parser = JsonRowParser::new(ingest_schema);
                let mut inputs = Vec::with_capacity(rows_paths.len());
                for path in &rows_paths {
                    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
                    if !parser.accepts_extension(extension) {
                        warn!("Skipping {}: unsupported format", path.display());
                        continue;
                    }
                    inputs.push(fs::read(path)?);
                }
                let inputs: Vec<&[u8]> = inputs.iter().map(Vec::as_slice).collect();
                let rows = parser.parse_batch(&inputs)?;
                let count = rows.len();
                for row in rows {
                    ingest_engine.insert(row)?;
                }
                Ok(count)
            },
        )
        .await??;
        info!("Ingested {} rows", inserted);
    }

    let scan_engine = Arc::clone(&engine);
    let scan = tokio::task::spawn_blocking(
        move || -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            scan_engine.flush()?;
            let selected = scan_engine
                .known_series()
                .into_iter()
                .map(|(path, _)| path)
                .collect::<Vec<_>>();
            if selected.is_empty() {
                return Ok(());
            }
            let header = selected
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\t");
            info!("time\t{}", header);

            let mut data_set = QueryExecutor::new(scan_engine).execute(&QueryExpression::new(selected))?;
            while let Some(row) = data_set.next_row()? {
                info!("{}", row);
            }
            data_set.close()?;
            Ok(())
        },
    );
    if let Err(e) = scan.await? {
        error!("Full scan failed: {}", e);
    }

    // Keep the application running
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    engine.flush()?;
    Ok(())
}
