//! Chronicle Engine CLI
//!
//! Command-line interface for a local Chronicle data directory:
//! - Write points
//! - Query series
//! - Run compaction and retention, once or continuously
//! - Drop measurements and override their retention
//! - Inspect statistics and configuration

use anyhow::{anyhow, bail, Context};
use chrono::{Duration, Utc};
use chronicle_engine::config::{generate_default_config, Config};
use chronicle_engine::storage::{
    DataPoint, PointRecord, StorageEngine, Tag, TagEquals, TagFilter, TimeRange, ValuePredicate,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chronicle-engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Embeddable time-series storage engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (default: standard locations, then environment)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Data directory, overriding the config
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text", global = true)]
    pub format: OutputFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write one point
    Write {
        /// Measurement name
        measurement: String,
        /// Values in name=value format; integers stay integers unless suffixed with 'f'
        #[arg(short = 'F', long = "field", required = true)]
        fields: Vec<String>,
        /// Tags in key=value format
        #[arg(short = 'T', long = "tag")]
        tags: Vec<String>,
        /// Timestamp (default: now). Supports: "now", RFC 3339, Unix milliseconds
        #[arg(short, long)]
        time: Option<String>,
    },

    /// Query series
    Query {
        /// Measurement pattern (regular expression, anchored)
        #[arg(default_value = "")]
        measurement: String,
        /// Field pattern (regular expression, anchored)
        #[arg(default_value = "")]
        field: String,
        /// Time window ending now (e.g., 6h, 7d, 4w); default is everything
        #[arg(short, long)]
        last: Option<String>,
        /// Only series carrying these tags (key=value)
        #[arg(short = 'T', long = "tag")]
        tags: Vec<String>,
        /// Only values at or above this
        #[arg(long)]
        min: Option<f64>,
        /// Only values at or below this
        #[arg(long)]
        max: Option<f64>,
    },

    /// List measurements, or the fields and tags of one
    Describe {
        measurement: Option<String>,
        /// Only list measurements matching this pattern
        #[arg(long, conflicts_with = "measurement")]
        like: Option<String>,
    },

    /// Delete a measurement and all of its data
    Drop { measurement: String },

    /// Show or override the retention of one measurement
    Retention {
        measurement: String,
        /// New retention (e.g., 12h, 30d); omit to show the current one
        duration: Option<String>,
        /// Go back to the configured default
        #[arg(long, conflicts_with = "duration")]
        reset: bool,
    },

    /// Compact every field now
    Compact,

    /// Apply retention now
    Gc,

    /// Show storage statistics
    Stats,

    /// Run background compaction and retention until Ctrl-C
    Maintain,

    /// Generate default config file
    Config {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("chronicle_engine={}", config.logging.level).into());
    let registry = tracing_subscriber::registry().with(filter);

    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        let config = generate_default_config();
        match output {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(path, &config)?;
                println!("Config written to {:?}", path);
            }
            None => print!("{}", config),
        }
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => Config::load_with_env(path)?,
        None => Config::load_default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.to_string_lossy().to_string();
    }
    init_logging(&config);

    let engine_config = config.engine_config()?;
    tracing::debug!("Data directory: {:?}", engine_config.data_dir);
    let engine = Arc::new(
        StorageEngine::open(engine_config).context("failed to open storage engine")?,
    );

    match cli.command {
        Commands::Write {
            measurement,
            fields,
            tags,
            time,
        } => {
            let timestamp = parse_timestamp(time.as_deref())?;
            let mut record = PointRecord::new(measurement, timestamp);
            record.tags = parse_tags(&tags)?;
            for field in &fields {
                record = add_field(record, field)?;
            }
            engine.write_point_locked(&record)?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&record)?),
                OutputFormat::Text => println!(
                    "Wrote {} value(s) to {} at {}",
                    record.fields.len(),
                    record.measurement,
                    format_timestamp(timestamp)
                ),
            }
        }

        Commands::Query {
            measurement,
            field,
            last,
            tags,
            min,
            max,
        } => {
            let range = match last {
                Some(last) => window_ending_now(&last)?,
                None => TimeRange::all(),
            };
            let required = TagEquals::new(parse_tags(&tags)?);
            let bounds = move |p: &DataPoint| {
                let v = p.value();
                min.map_or(true, |m| v >= m) && max.map_or(true, |m| v <= m)
            };
            let tag_filter: Option<&dyn TagFilter> =
                if tags.is_empty() { None } else { Some(&required) };
            let predicate: Option<&dyn ValuePredicate> =
                if min.is_none() && max.is_none() { None } else { Some(&bounds) };

            let results = engine.query(&measurement, &field, range, tag_filter, predicate)?;

            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&results)?),
                OutputFormat::Text => {
                    for series in &results {
                        let tags: Vec<String> = series.tags.iter().map(Tag::to_string).collect();
                        println!(
                            "{} [{}] {} ({} points)",
                            series.measurement,
                            tags.join(","),
                            series.field,
                            series.points.len()
                        );
                        for p in &series.points {
                            if p.fp {
                                println!("  {}  {}", format_timestamp(p.timestamp), p.value());
                            } else {
                                println!("  {}  {}", format_timestamp(p.timestamp), p.long_value());
                            }
                        }
                    }
                }
            }
        }

        Commands::Describe { measurement, like } => match measurement {
            None => {
                let names = match like {
                    Some(pattern) => engine.measurements_like(&pattern)?,
                    None => engine.measurements(),
                };
                match cli.format {
                    OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&names)?),
                    OutputFormat::Text => names.iter().for_each(|n| println!("{}", n)),
                }
            }
            Some(name) => {
                let fields = engine.fields_for_measurement(&name)?;
                let mut tags = serde_json::Map::new();
                for key in engine.tag_keys(&name)? {
                    let values = engine.tag_values(&name, &key)?;
                    tags.insert(key, serde_json::json!(values));
                }
                let series: Vec<String> = engine
                    .series_keys(&name)?
                    .iter()
                    .map(|k| k.to_string())
                    .collect();
                let description = serde_json::json!({
                    "measurement": name,
                    "fields": fields,
                    "tags": tags,
                    "series": series,
                });
                match cli.format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&description)?)
                    }
                    OutputFormat::Text => {
                        println!("Measurement: {}", name);
                        println!("Fields: {}", fields.join(", "));
                        for (key, values) in &tags {
                            println!("Tag {}: {}", key, values);
                        }
                        println!("Series: {}", series.len());
                    }
                }
            }
        },

        Commands::Compact => {
            let summary = engine.compact_all();
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                OutputFormat::Text => println!(
                    "Compacted {} field(s), {} failed, {} segment(s) removed",
                    summary.compacted_fields, summary.failed_fields, summary.removed_segments
                ),
            }
        }

        Commands::Gc => {
            let summary = engine.collect_garbage();
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                OutputFormat::Text => println!(
                    "Evicted {} bucket(s), {} field(s), released {} buffer(s), {} series failed",
                    summary.evicted_buckets,
                    summary.evicted_fields,
                    summary.released_buffers,
                    summary.failed_series
                ),
            }
        }

        Commands::Drop { measurement } => {
            engine.drop_measurement(&measurement)?;
            println!("Dropped {}", measurement);
        }

        Commands::Retention {
            measurement,
            duration,
            reset,
        } => {
            if reset {
                engine.set_retention(&measurement, None)?;
            } else if let Some(duration) = duration {
                let retention = parse_duration(&duration)?.num_milliseconds();
                engine.set_retention(&measurement, Some(retention))?;
            }
            let retention = engine.retention_for(&measurement)?;
            match cli.format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({ "measurement": measurement, "retention_ms": retention })
                ),
                OutputFormat::Text => match retention {
                    Some(ms) => println!("{}: keeps {} hour(s)", measurement, ms / 3_600_000),
                    None => println!("{}: keeps everything", measurement),
                },
            }
        }

        Commands::Stats => {
            let stats = engine.stats();
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                OutputFormat::Text => {
                    println!("{}", stats);
                    for m in &stats.measurements {
                        println!(
                            "  {}: {} series, {} fields, {} segments, {} points, {} live buffers",
                            m.name,
                            m.series,
                            m.fields,
                            m.segments,
                            m.points,
                            m.allocator.live_buffers
                        );
                    }
                }
            }
        }

        Commands::Maintain => {
            tracing::info!(
                "Chronicle Engine v{} maintaining {:?}",
                env!("CARGO_PKG_VERSION"),
                engine.data_dir()
            );
            let handle = engine.start_background_maintenance();
            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down...");
            engine.shutdown()?;
            // The task only notices shutdown on its next tick
            handle.abort();
            tracing::info!("Storage stats: {}", engine.stats());
            return Ok(());
        }

        // Written before the engine opens
        Commands::Config { .. } => {}
    }

    engine.shutdown()?;
    Ok(())
}

fn parse_timestamp(time: Option<&str>) -> anyhow::Result<i64> {
    match time {
        None | Some("now") => Ok(Utc::now().timestamp_millis()),
        Some(s) => {
            if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
                Ok(dt.timestamp_millis())
            } else {
                s.parse::<i64>()
                    .map_err(|_| anyhow!("Invalid timestamp format: {}", s))
            }
        }
    }
}

fn parse_tags(tags: &[String]) -> anyhow::Result<Vec<Tag>> {
    tags.iter()
        .map(|tag| {
            tag.split_once('=')
                .map(|(k, v)| Tag::new(k, v))
                .ok_or_else(|| anyhow!("Invalid tag '{}', expected key=value", tag))
        })
        .collect()
}

fn add_field(record: PointRecord, field: &str) -> anyhow::Result<PointRecord> {
    let (name, value) = field
        .split_once('=')
        .ok_or_else(|| anyhow!("Invalid field '{}', expected name=value", field))?;
    if let Some(float) = value.strip_suffix('f') {
        return Ok(record.float(name, float.parse()?));
    }
    match value.parse::<i64>() {
        Ok(long) => Ok(record.long(name, long)),
        Err(_) => Ok(record.float(
            name,
            value
                .parse()
                .with_context(|| format!("Invalid value for field '{}'", name))?,
        )),
    }
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim().to_lowercase();

    if let Some(hours) = s.strip_suffix('h') {
        Ok(Duration::hours(hours.parse()?))
    } else if let Some(days) = s.strip_suffix('d') {
        Ok(Duration::days(days.parse()?))
    } else if let Some(weeks) = s.strip_suffix('w') {
        Ok(Duration::weeks(weeks.parse()?))
    } else if let Some(months) = s.strip_suffix('m') {
        Ok(Duration::days(months.parse::<i64>()? * 30))
    } else if let Some(years) = s.strip_suffix('y') {
        Ok(Duration::days(years.parse::<i64>()? * 365))
    } else {
        bail!("Invalid duration format: {}. Use: 6h, 7d, 4w, 3m, 1y", s)
    }
}

/// The last `duration` up to and including now
fn window_ending_now(duration: &str) -> anyhow::Result<TimeRange> {
    let end = Utc::now();
    let start = end - parse_duration(duration)?;
    TimeRange::try_new(start.timestamp_millis(), end.timestamp_millis() + 1)
        .ok_or_else(|| anyhow!("empty time window: {}", duration))
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ts)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}
