use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use bix_core::{
    audit,
    manifest::Manifest,
    Attribute, Batch, ErrorPolicy, Index, IndexConfig, Value,
};

#[derive(Parser)]
#[command(name = "bix", about = "Bout message index: write facts, run queries, audit")]
struct Cli {
    /// More logging on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Args)]
struct Facts {
    #[arg(long)]
    dir: PathBuf,
    /// Message id the facts are about
    #[arg(long)]
    message: u64,
    /// Participants of the message's bout; derives its bundle marker
    #[arg(long, value_delimiter = ',')]
    bundle: Vec<String>,
    /// attribute=value pairs; integers and true/false are typed
    #[arg(value_name = "ATTR=VALUE")]
    pairs: Vec<String>,
}

#[derive(Subcommand)]
enum Cmd {
    Init {
        #[arg(long)]
        dir: PathBuf,
        /// Superseded generations kept by gc
        #[arg(long)]
        keep: Option<usize>,
        /// Skip fsync on publish (tests, scratch indexes)
        #[arg(long, default_value_t = false)]
        no_fsync: bool,
    },

    /// Index facts about one message
    Put(Facts),

    /// Drop facts about one message
    Remove(Facts),

    /// Run an s-expression query against the current generation
    Query {
        #[arg(long)]
        dir: PathBuf,
        /// A failing `or` branch contributes nothing instead of failing the query
        #[arg(long, default_value_t = false)]
        skip_errors: bool,
        query: String,
    },

    Audit {
        #[arg(long)]
        dir: PathBuf,
        /// Only this attribute
        #[arg(long)]
        attribute: Option<String>,
    },

    Info {
        #[arg(long)]
        dir: PathBuf,
    },

    /// Remove superseded generations
    Gc {
        #[arg(long)]
        dir: PathBuf,
    },
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn open_index(dir: &Path) -> Result<Index> {
    if !dir.is_dir() {
        bail!("no index at {} (run `bix init` first)", dir.display());
    }
    Index::open(dir).with_context(|| format!("opening index at {}", dir.display()))
}

fn parse_value(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => raw.parse::<i64>().map(Value::Num).unwrap_or_else(|_| Value::Str(raw.to_string())),
    }
}

fn parse_pair(pair: &str) -> Result<(Attribute, Value)> {
    let (attr, value) = pair.split_once('=').ok_or_else(|| anyhow!("expected ATTR=VALUE, got '{pair}'"))?;
    let attribute = Attribute::new(attr).with_context(|| format!("bad attribute in '{pair}'"))?;
    Ok((attribute, parse_value(value)))
}

fn apply_facts(facts: Facts, remove: bool) -> Result<()> {
    let index = open_index(&facts.dir)?;
    let mut batch = Batch::new();
    for pair in &facts.pairs {
        let (attribute, value) = parse_pair(pair)?;
        if remove {
            batch.remove(attribute, value, facts.message);
        } else {
            batch.add(attribute, value, facts.message);
        }
    }
    if !facts.bundle.is_empty() {
        let marker = bix_core::bundle_marker(&facts.bundle[..]);
        if remove {
            batch.remove(Attribute::bundle(), marker, facts.message);
        } else {
            batch.bundle(facts.message, &marker);
        }
    }
    if batch.is_empty() {
        bail!("nothing to write: give ATTR=VALUE pairs or --bundle");
    }
    let baseline = index.apply(&batch)?;
    println!("published generation {} ({} facts)", baseline.generation(), batch.len());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    match cli.cmd {
        Cmd::Init { dir, keep, no_fsync } => {
            std::fs::create_dir_all(&dir)?;
            let mut config = IndexConfig::load(&dir)?;
            if let Some(k) = keep {
                config.keep_generations = k;
            }
            if no_fsync {
                config.fsync = false;
            }
            config.save(&dir)?;
            Index::open_with(&dir, config)?;
            println!("init: {}", dir.display());
        }
        Cmd::Put(facts) => apply_facts(facts, false)?,
        Cmd::Remove(facts) => apply_facts(facts, true)?,
        Cmd::Query { dir, skip_errors, query } => {
            if !dir.is_dir() {
                bail!("no index at {} (run `bix init` first)", dir.display());
            }
            let mut config = IndexConfig::load(&dir)?;
            if skip_errors {
                config.error_policy = ErrorPolicy::SkipInUnion;
            }
            let index = Index::open_with(&dir, config)?;
            let ids = index
                .query_str(&query)?
                .collect::<bix_core::Result<Vec<u64>>>()
                .context("query failed")?;
            println!("{:?}", ids);
        }
        Cmd::Audit { dir, attribute } => {
            let index = open_index(&dir)?;
            let baseline = index.current();
            let problems = match attribute {
                Some(name) => {
                    let attribute = Attribute::new(&name)?;
                    let mut out = Vec::new();
                    bix_core::audit_attribute(&baseline, &attribute, &mut |p| out.push(p));
                    out
                }
                None => audit(&baseline),
            };
            for p in &problems {
                println!("{p}");
            }
            println!("audit: generation {} problems={}", baseline.generation(), problems.len());
            if !problems.is_empty() {
                bail!("{} problems found", problems.len());
            }
        }
        Cmd::Info { dir } => {
            let index = open_index(&dir)?;
            let baseline = index.current();
            println!("generation: {}", baseline.generation());
            println!("messages  : {}", baseline.message_count());
            for attribute in baseline.attributes() {
                let values = match baseline.catalog(attribute) {
                    Ok(Some(c)) => c.len().to_string(),
                    Ok(None) => "0".to_string(),
                    Err(e) => format!("unreadable ({e})"),
                };
                println!("  {:<16} values={values}", attribute.name());
            }
            let man = Manifest::load(&dir)?;
            let old: Vec<u64> = man.superseded().iter().map(|g| g.number).collect();
            if !old.is_empty() {
                println!("superseded: {:?}", old);
            }
        }
        Cmd::Gc { dir } => {
            let index = open_index(&dir)?;
            let removed = index.gc()?;
            println!("gc: removed {:?}", removed);
        }
    }
    Ok(())
}
