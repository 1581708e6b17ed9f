//! cardtree inspector binary.
//!
//! Seeds an in-memory store from a RON fixture, opens a card session and
//! prints the card's tree. Optionally runs the card commands against it.
//!
//! Usage:
//!   # List the cards in a fixture
//!   cargo run -p cardtree-cli -- --fixture fixtures/groceries.ron
//!
//!   # Open a card by title or id prefix
//!   cargo run -p cardtree-cli -- --fixture fixtures/groceries.ron --card Weekly
//!
//!   # Duplicate it as a template, then delete the original
//!   cargo run -p cardtree-cli -- --fixture fixtures/groceries.ron --card Weekly \
//!       --make-template --delete

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use cardtree_client::{CardSession, CardTree, ClientConfig, MemoryStore, Record, full_sync};
use cardtree_types::resolve_record_prefix;

const REMOVAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Inspect card trees through a live card session.
#[derive(Parser, Debug)]
#[command(name = "cardtree")]
#[command(about = "Open a card from a fixture and run card commands against it")]
struct Args {
    /// RON fixture holding the store's records
    #[arg(short, long)]
    fixture: PathBuf,

    /// Card to open: exact title, title prefix or id prefix
    #[arg(short, long)]
    card: Option<String>,

    /// Client config (RON); defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Duplicate the opened card as a new template
    #[arg(long)]
    make_template: bool,

    /// Delete the opened card
    #[arg(long)]
    delete: bool,
}

/// On-disk fixture layout.
#[derive(Deserialize, Debug)]
struct Fixture {
    records: Vec<Record>,
}

fn load_fixture(path: &Path) -> Result<Vec<Record>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading fixture {}", path.display()))?;
    let fixture: Fixture =
        ron::from_str(&text).with_context(|| format!("parsing fixture {}", path.display()))?;
    Ok(fixture.records)
}

/// Render a tree as indented lines, one per record in display order.
fn render_tree(tree: &CardTree) -> Vec<String> {
    let mut lines = Vec::new();
    if tree.is_template() {
        lines.push("** editing a template **".to_string());
    }
    for (depth, record) in tree.index().iter_dfs() {
        let connector = if depth == 0 { "" } else { "└─ " };
        lines.push(format!(
            "{}{}[{}] {} ({})",
            "   ".repeat(depth.saturating_sub(1)),
            connector,
            record.kind,
            record.title,
            record.id.short(),
        ));
    }
    lines
}

fn print_tree(tree: &CardTree) {
    for line in render_tree(tree) {
        println!("{line}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ClientConfig::default(),
    };
    let records = load_fixture(&args.fixture)?;
    info!(records = records.len(), "seeding in-memory store");
    let store = Arc::new(MemoryStore::with_records(records));

    let roots: Vec<Record> = store.root_ids().iter().filter_map(|id| store.get(id)).collect();

    let Some(query) = args.card.as_deref() else {
        for root in &roots {
            let marker = if root.is_template { " (template)" } else { "" };
            println!("{}  {}{}", root.id.short(), root.title, marker);
        }
        return Ok(());
    };
    let root_id = resolve_record_prefix(
        roots.iter().map(|r| (r.id, Some(r.title.as_str()))),
        query,
    )?;

    let mut session = CardSession::activate(store.clone(), root_id, config).await?;
    match session.current_tree() {
        Some(tree) => print_tree(&tree),
        None => bail!("card {root_id} has no synced tree"),
    }

    if args.make_template {
        let new_id = session
            .request_template_copy(|shown| match shown {
                Some(id) => info!("showing new template {id}"),
                None => warn!("template creation undone, clearing selection"),
            })
            .await?;
        let (copy, _) = full_sync(store.as_ref(), new_id).await?;
        println!();
        print_tree(&copy);
    }

    if args.delete {
        let mut snapshots = session.subscribe_snapshots();
        session.request_delete(|| info!("card closed")).await?;
        tokio::time::timeout(REMOVAL_TIMEOUT, snapshots.wait_for(|s| s.is_removed()))
            .await
            .context("timed out waiting for the deletion to echo back")?
            .context("session stopped before the deletion echoed back")?;
        println!("card {} removed", root_id.short());
    }

    while let Some(e) = session.try_next_error() {
        warn!("session reported: {e}");
    }
    session.deactivate().await;
    Ok(())
}
