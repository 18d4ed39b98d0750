//! rrd-dump - export consolidated rows from a series store file
//!
//! Opens a store read-only and never modifies it. Rows are written before
//! the header on append, but a file a live sampler is writing can still be
//! read mid-update; rerun the dump if a row looks inconsistent.

use catalog_metrics::storage::{ConsolidationFn, SeriesReader};
use chrono::{TimeZone, Utc};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "rrd-dump")]
#[command(about = "Print consolidated rows of a round-robin series file")]
#[command(version)]
struct Args {
    /// Store file to read
    file: PathBuf,

    /// Consolidation function (AVERAGE, MIN, MAX, TOTAL)
    #[arg(long, default_value = "AVERAGE", value_parser = parse_cf)]
    cf: ConsolidationFn,

    /// First timestamp (unix seconds); defaults to one day before --end
    #[arg(long)]
    start: Option<u64>,

    /// Last timestamp (unix seconds); defaults to the last update
    #[arg(long)]
    end: Option<u64>,

    /// Emit JSON instead of text
    #[arg(long)]
    json: bool,

    /// Print the series layout instead of rows
    #[arg(long)]
    info: bool,
}

fn parse_cf(value: &str) -> Result<ConsolidationFn, String> {
    value.parse().map_err(|e: catalog_metrics::MetricsError| e.to_string())
}

fn format_time(ts: u64) -> String {
    i64::try_from(ts)
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter("warn").init();

    let args = Args::parse();
    let reader = SeriesReader::open(&args.file).await?;

    if args.info {
        let info = reader.info();
        if args.json {
            println!("{}", serde_json::to_string_pretty(&info)?);
        } else {
            println!("file:        {}", args.file.display());
            println!("type:        {:?}", info.ds_type);
            println!("step:        {}s", info.step);
            println!("xff:         {}", info.xff);
            println!("min/max:     {} / {}", info.min, info.max);
            match info.last_update {
                Some(ts) => println!("last update: {} ({})", ts, format_time(ts)),
                None => println!("last update: never"),
            }
            println!("size:        {} bytes", info.file_size);
            for (index, archive) in info.archives.iter().enumerate() {
                println!(
                    "archive {}:   {} x{} steps, {} rows ({}s retention)",
                    index,
                    archive.cf,
                    archive.resolution,
                    archive.rows,
                    archive.retention_secs(info.step)
                );
            }
        }
        return Ok(());
    }

    let end = args.end.or(reader.last_update()).unwrap_or(0);
    let start = args.start.unwrap_or_else(|| end.saturating_sub(86_400));
    let result = reader.fetch(args.cf, start, end)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("# {} every {}s", result.cf, result.resolution_secs);
        for (ts, value) in &result.rows {
            if value.is_nan() {
                println!("{}  {}  unknown", ts, format_time(*ts));
            } else {
                println!("{}  {}  {}", ts, format_time(*ts), value);
            }
        }
    }

    Ok(())
}
