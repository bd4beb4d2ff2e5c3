//! Dump a sample graph before and after partial escape analysis
//!
//! # Usage
//!
//! ```bash
//! # List the built-in sample graphs
//! pea_dump list
//!
//! # Run the phase on a sample and print both graphs
//! pea_dump run branch
//!
//! # Use a configuration file and print statistics as JSON
//! pea_dump run counter --config pea.toml --json
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use pea_compiler::ir::dump::dump_graph;
use pea_compiler::ir::validation::validate_graph;
use pea_compiler::ir::{BinaryOp, FieldRef, Graph, GraphBuilder, ObjectLayout, ValueKind};
use pea_compiler::{logging, PartialEscapePhase, PeaConfig};
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "pea_dump")]
#[command(version = "0.1.0")]
#[command(about = "Run partial escape analysis on sample graphs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level for the analysis trace; without it `RUST_LOG` applies
    #[arg(long, global = true, value_enum)]
    log: Option<LogLevel>,
}

#[derive(Subcommand)]
enum Commands {
    /// List the available sample graphs
    List,

    /// Run the phase on a sample graph
    Run {
        /// Sample to run
        #[arg(value_enum)]
        sample: Sample,

        /// TOML file with phase configuration
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print statistics as JSON instead of a table
        #[arg(long)]
        json: bool,

        /// Only print the graph after the phase
        #[arg(short, long)]
        quiet: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => LevelFilter::Off,
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Sample {
    /// Allocation that never escapes
    Point,
    /// Allocation that escapes on one branch
    Branch,
    /// Object updated inside a loop
    Counter,
    /// Redundant loads from a parameter
    Reads,
    /// Two objects referring to each other
    Cycle,
    /// Locked object passed to a call
    Locks,
}

impl Sample {
    fn build(self) -> Graph {
        match self {
            Sample::Point => point(),
            Sample::Branch => branch(),
            Sample::Counter => counter(),
            Sample::Reads => reads(),
            Sample::Cycle => cycle(),
            Sample::Locks => locks(),
        }
    }
}

fn point() -> Graph {
    let mut b = GraphBuilder::new("point");
    let layout = b.layout(ObjectLayout::instance("Point", vec![ValueKind::Int, ValueKind::Int]));
    let x = b.param(0, ValueKind::Int);
    let y = b.param(1, ValueKind::Int);
    let p = b.new_instance(layout);
    b.store_field(p, FieldRef::new(layout, 0), x);
    b.store_field(p, FieldRef::new(layout, 1), y);
    let load = b.load_field(p, FieldRef::new(layout, 0));
    b.ret(Some(load));
    b.finish()
}

fn branch() -> Graph {
    let mut b = GraphBuilder::new("branch");
    let layout = b.layout(ObjectLayout::instance("Box", vec![ValueKind::Int]));
    let cond = b.param(0, ValueKind::Int);
    let x = b.param(1, ValueKind::Int);
    let left = b.create_block("left");
    let right = b.create_block("right");
    let merge = b.create_block("merge");
    let o = b.new_instance(layout);
    b.store_field(o, FieldRef::new(layout, 0), x);
    b.branch(cond, left, right);
    b.switch_to_block(left);
    b.goto(merge);
    b.switch_to_block(right);
    b.invoke("escape", &[o], ValueKind::Void);
    b.goto(merge);
    b.switch_to_block(merge);
    b.ret(Some(o));
    b.finish()
}

fn counter() -> Graph {
    let mut b = GraphBuilder::new("counter");
    let layout = b.layout(ObjectLayout::instance("Counter", vec![ValueKind::Int]));
    let field = FieldRef::new(layout, 0);
    let cond = b.param(0, ValueKind::Int);
    let one = b.int(1);
    let header = b.create_block("header");
    let body = b.create_block("body");
    let exit = b.create_block("exit");
    let c = b.new_instance(layout);
    b.goto(header);
    b.switch_to_block(header);
    b.branch(cond, body, exit);
    b.switch_to_block(body);
    let n = b.load_field(c, field);
    let next = b.binary(BinaryOp::Add, n, one);
    b.store_field(c, field, next);
    b.goto(header);
    b.switch_to_block(exit);
    let result = b.load_field(c, field);
    b.ret(Some(result));
    b.finish()
}

fn reads() -> Graph {
    let mut b = GraphBuilder::new("reads");
    let layout = b.layout(ObjectLayout::instance("Pair", vec![ValueKind::Int, ValueKind::Int]));
    let f0 = FieldRef::new(layout, 0);
    let f1 = FieldRef::new(layout, 1);
    let o = b.param(0, ValueKind::Object);
    let q = b.param(1, ValueKind::Object);
    let x = b.param(2, ValueKind::Int);
    let a = b.load_field(o, f0);
    let again = b.load_field(o, f0);
    b.store_field(o, f1, x);
    let unchanged = b.load_field(o, f0);
    b.store_field(q, f0, x);
    let reloaded = b.load_field(o, f0);
    let s1 = b.binary(BinaryOp::Add, a, again);
    let s2 = b.binary(BinaryOp::Add, s1, unchanged);
    let s3 = b.binary(BinaryOp::Add, s2, reloaded);
    b.ret(Some(s3));
    b.finish()
}

fn cycle() -> Graph {
    let mut b = GraphBuilder::new("cycle");
    let layout = b.layout(ObjectLayout::instance("Node", vec![ValueKind::Object, ValueKind::Int]));
    let next = FieldRef::new(layout, 0);
    let a = b.new_instance(layout);
    let c = b.new_instance(layout);
    b.store_field(a, next, c);
    b.store_field(c, next, a);
    b.ret(Some(a));
    b.finish()
}

fn locks() -> Graph {
    let mut b = GraphBuilder::new("locks");
    let layout = b.layout(ObjectLayout::instance("Mutex", vec![ValueKind::Int]));
    let m = b.new_instance(layout);
    b.monitor_enter(m, 1);
    b.invoke("tick", &[], ValueKind::Void);
    b.invoke("publish", &[m], ValueKind::Void);
    b.monitor_exit(m, 1);
    b.ret(None);
    b.finish()
}

fn load_config(path: Option<&PathBuf>) -> Result<PeaConfig, String> {
    let Some(path) = path else {
        return Ok(PeaConfig::default());
    };
    let source = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    PeaConfig::from_toml_str(&source).map_err(|e| format!("{}: {}", path.display(), e))
}

fn run(sample: Sample, config: Option<PathBuf>, json: bool, quiet: bool) -> Result<(), String> {
    let config = load_config(config.as_ref())?;
    let mut graph = sample.build();

    if !quiet {
        println!("=== before ===");
        println!("{}", dump_graph(&graph));
    }

    let mut phase = PartialEscapePhase::new(config);
    let stats = phase.run(&mut graph).map_err(|e| e.to_string())?;

    println!("=== after ===");
    println!("{}", dump_graph(&graph));

    if let Err(errors) = validate_graph(&graph) {
        for error in &errors {
            eprintln!("validation: {}", error);
        }
        return Err(format!("{} validation errors", errors.len()));
    }

    if json {
        let text = serde_json::to_string_pretty(&stats).map_err(|e| e.to_string())?;
        println!("{}", text);
    } else {
        println!("=== statistics ===");
        for (name, value) in stats.counters() {
            if value > 0 {
                println!("  {:<24} {}", name, value);
            }
        }
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    match cli.log {
        Some(level) => logging::init_with_level(level.into()),
        None => logging::init_from_env(),
    }

    let result = match cli.command {
        Commands::List => {
            for sample in Sample::value_variants() {
                if let Some(value) = sample.to_possible_value() {
                    let help = value.get_help().map(|h| h.to_string()).unwrap_or_default();
                    println!("{:<10} {}", value.get_name(), help);
                }
            }
            Ok(())
        }
        Commands::Run {
            sample,
            config,
            json,
            quiet,
        } => run(sample, config, json, quiet),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}
