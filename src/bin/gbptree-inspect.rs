//! Read-only inspection tool for GBPTree files.
#![forbid(unsafe_code)]

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use gbptree::storage::gbptree::{
    ConsistencyReport, GbpTreeStatsSnapshot, TreeInspection, TreeShape, TreeState,
};
use gbptree::{BytesLayout, GbpTree, GbpTreeOptions, Layout, U64Layout};

#[derive(Parser, Debug)]
#[command(
    name = "gbptree-inspect",
    version,
    about = "Inspect GBPTree files without modifying them",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(long, global = true, value_enum, help = "Key and value layout of the file")]
    layout: Option<LayoutArg>,

    #[arg(long, global = true, help = "Page size (bytes) the file was created with")]
    page_size: Option<u32>,

    #[arg(
        long,
        global = true,
        value_name = "PATH",
        env = "GBPTREE_INSPECT_CONFIG",
        help = "Configuration file (defaults to the platform config dir)"
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the persisted tree state
    State {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
    /// Run the consistency checker; exits with 2 when violations are found
    Check {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
    /// Print the tree shape, freelist and entries
    Dump {
        #[arg(value_name = "FILE")]
        path: PathBuf,

        #[arg(long, default_value_t = 100, help = "Maximum entries to print (0 prints none)")]
        limit: usize,
    },
    /// Print counters gathered while opening and walking the file
    Stats {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum LayoutArg {
    #[default]
    U64,
    Bytes,
}

#[derive(Debug, Error)]
enum ConfigError {
    #[error("failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Contents of `inspect.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    layout: Option<LayoutArg>,
    tree: GbpTreeOptions,
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("gbptree").join("inspect.toml"))
}

fn load_config(explicit: Option<&Path>) -> Result<RawConfig, ConfigError> {
    let path = match explicit.map(Path::to_path_buf).or_else(default_config_path) {
        Some(path) if path.exists() => path,
        _ => return Ok(RawConfig::default()),
    };
    let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse { path, source })
}

#[derive(Debug, Serialize)]
struct DumpEntry {
    key: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct DumpReport {
    #[serde(flatten)]
    inspection: TreeInspection,
    entries: Vec<DumpEntry>,
    truncated: bool,
}

/// Renders keys and values of a layout for display.
trait Render: Layout {
    fn render_key(key: &Self::Key) -> String;
    fn render_value(value: &Self::Value) -> String;
}

impl Render for U64Layout {
    fn render_key(key: &u64) -> String {
        key.to_string()
    }

    fn render_value(value: &u64) -> String {
        value.to_string()
    }
}

impl Render for BytesLayout {
    fn render_key(key: &bytes::Bytes) -> String {
        hex::encode(key)
    }

    fn render_value(value: &bytes::Bytes) -> String {
        hex::encode(value)
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let mut options = config.tree.read_only();
    if let Some(page_size) = cli.page_size {
        options = options.with_page_size(page_size);
    }
    options.validate()?;
    match cli.layout.or(config.layout).unwrap_or_default() {
        LayoutArg::U64 => execute(&cli, U64Layout, options),
        LayoutArg::Bytes => execute(&cli, BytesLayout, options),
    }
}

fn execute<L: Render>(cli: &Cli, layout: L, options: GbpTreeOptions) -> Result<(), Box<dyn Error>> {
    match &cli.command {
        Command::State { path } => {
            let tree = GbpTree::open(path, layout, options)?;
            let state = tree.state();
            emit(&cli.format, &state, |_| print_state_text(&state))?;
        }
        Command::Check { path } => {
            let tree = GbpTree::open(path, layout, options)?;
            let report = tree.consistency_report()?;
            emit(&cli.format, &report, |_| print_check_text(&report))?;
            if !report.is_clean() {
                std::process::exit(2);
            }
        }
        Command::Dump { path, limit } => {
            let tree = GbpTree::open(path, layout, options)?;
            let inspection = tree.inspect()?;
            let mut entries = Vec::new();
            let mut truncated = false;
            for entry in tree.seek(..)? {
                if entries.len() == *limit {
                    truncated = true;
                    break;
                }
                let (key, value) = entry?;
                entries.push(DumpEntry {
                    key: L::render_key(&key),
                    value: L::render_value(&value),
                });
            }
            let report = DumpReport {
                inspection,
                entries,
                truncated,
            };
            emit(&cli.format, &report, |_| print_dump_text(&report))?;
        }
        Command::Stats { path } => {
            let tree = GbpTree::open(path, layout, options)?;
            // Walk the file once so the counters reflect a full traversal.
            for entry in tree.seek(..)? {
                entry?;
            }
            let stats = tree.stats();
            emit(&cli.format, &stats, |_| print_stats_text(&stats))?;
        }
    }
    Ok(())
}

fn emit<T, F>(format: &OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: Fn(OutputFormat),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(OutputFormat::Text),
    }
    Ok(())
}

fn print_section(title: &str) {
    println!();
    println!("─── {} {}", title, "─".repeat(55usize.saturating_sub(title.len())));
}

fn print_field(name: &str, value: impl std::fmt::Display) {
    println!("  {name:.<30} {value}");
}

fn print_state_text(state: &TreeState) {
    print_section("TREE STATE");
    print_field("Page size", state.page_size);
    print_field("Layout", format!("{:#018x}", state.layout_id));
    print_field("Stable generation", state.stable_generation);
    print_field("Unstable generation", state.unstable_generation);
    print_field("Root", state.root_id);
    print_field("Root generation", state.root_generation);
    print_field("Last page id", state.last_id);
    print_field(
        "Freelist write",
        format!("page {} pos {}", state.freelist_write_page, state.freelist_write_pos),
    );
    print_field(
        "Freelist read",
        format!("page {} pos {}", state.freelist_read_page, state.freelist_read_pos),
    );
    print_field("Clean", state.clean);
}

fn print_check_text(report: &ConsistencyReport) {
    print_section("CONSISTENCY CHECK");
    print_field("Nodes visited", report.nodes_visited);
    print_field("Violations", report.violations.len());
    for violation in &report.violations {
        let pointer = violation
            .pointer
            .map(|p| format!(" {p:?}"))
            .unwrap_or_default();
        println!(
            "  page {}{pointer}: {:?} {}",
            violation.page, violation.kind, violation.detail
        );
    }
    if report.is_clean() {
        println!("  OK");
    }
}

fn print_shape_text(shape: &TreeShape) {
    print_field("Root", shape.root);
    print_field("Height", shape.height());
    print_field("Internal nodes", shape.internal_nodes.len());
    print_field("Leaves", shape.leaves.len());
    print_field("Entries", shape.key_count);
    for (depth, level) in shape.levels.iter().enumerate() {
        let nodes: Vec<String> = level
            .iter()
            .map(|node| format!("{}@{}({})", node.id, node.generation, node.key_count))
            .collect();
        println!("  level {depth}: {}", nodes.join(" "));
    }
}

fn print_dump_text(report: &DumpReport) {
    print_state_text(&report.inspection.state);
    print_section("TREE");
    print_shape_text(&report.inspection.tree);
    for (index, shape) in report.inspection.data_trees.iter().enumerate() {
        print_section(&format!("DATA TREE {index}"));
        print_shape_text(shape);
    }
    print_section("FREELIST");
    print_field("Pages", report.inspection.freelist_pages.len());
    print_field("Entries", report.inspection.freelist_entries.len());
    for entry in &report.inspection.freelist_entries {
        println!("  page {} released in {}", entry.page, entry.generation);
    }
    print_section("ENTRIES");
    for entry in &report.entries {
        println!("  {} = {}", entry.key, entry.value);
    }
    if report.truncated {
        println!("  ...");
    }
}

fn print_stats_text(stats: &GbpTreeStatsSnapshot) {
    print_section("STATISTICS");
    print_field("Seeks", stats.seeks);
    print_field("Seek restarts", stats.seek_restarts);
    print_field("Optimistic re-reads", stats.optimistic_rereads);
    print_field("Leaf splits", stats.leaf_splits);
    print_field("Internal splits", stats.internal_splits);
    print_field("Merges", stats.merges);
    print_field("Rebalances", stats.rebalances);
    print_field("Successors created", stats.successors_created);
    print_field("Root splits", stats.root_splits);
    print_field("Root collapses", stats.root_collapses);
    print_field("Pages acquired", stats.pages_acquired);
    print_field("Pages reused", stats.pages_reused);
    print_field("Pages released", stats.pages_released);
    print_field("Checkpoints", stats.checkpoints);
}
