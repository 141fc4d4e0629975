#![forbid(unsafe_code)]
//! TweetChain node with an interactive shell.

use clap::Parser;
use colored::*;
use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;
use tweetchain::config::{load_config, Config};
use tweetchain::crypto::{address_from_hex, address_to_hex, short_hex};
use tweetchain::error::ChainError;
use tweetchain::governance::threshold;
use tweetchain::node::Node;
use tweetchain::op::{GovPayload, OpBody, OpId};
use tweetchain::timeline::{Entry, TimelineView};

/// Posts listed by `show` / `show-all` without an id.
const TIMELINE_PAGE: usize = 50;

#[derive(Parser)]
#[command(author, version, about = "TweetChain peer-to-peer node", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,
    /// Listen host
    #[arg(long)]
    host: Option<String>,
    /// Listen port
    #[arg(long)]
    port: Option<u16>,
    /// Genesis label naming the network
    #[arg(long)]
    genesis: Option<String>,
    /// Comma-separated bootstrap peers (host:port)
    #[arg(long, value_delimiter = ',')]
    peers: Vec<String>,
    /// Do not accept inbound connections
    #[arg(long)]
    client_only: bool,
    /// Default proof-of-work difficulty in bits
    #[arg(long)]
    difficulty: Option<u32>,
    /// Directory for chain state and the node key
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Seed the validator set with this node's key
    #[arg(long)]
    self_validator: bool,
}

impl Cli {
    fn apply(self, mut config: Config) -> Config {
        if let Some(host) = self.host {
            config.network.host = host;
        }
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if let Some(genesis) = self.genesis {
            config.network.genesis_label = genesis;
        }
        if !self.peers.is_empty() {
            config.network.bootstrap_peers = self.peers;
        }
        if self.client_only {
            config.network.client_only = true;
        }
        if let Some(bits) = self.difficulty {
            config.consensus.difficulty_bits = bits;
        }
        if let Some(dir) = self.data_dir {
            config.storage.data_dir = dir;
        }
        if self.self_validator {
            config.consensus.self_validator = true;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let config = cli.apply(config);
    config.validate()?;

    let node = Node::open(config).await?;
    node.start().await?;

    println!("{}", "TweetChain node".bright_cyan().bold());
    println!("  id:         {}", address_to_hex(&node.address()).bright_yellow());
    println!("  genesis:    {}", node.config().network.genesis_label);
    println!("  height:     {}", node.height().await);
    println!("  difficulty: {} bits", node.active_difficulty().await);
    println!("Type {} for commands.", "help".bright_green());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let words = split_args(line.trim());
        let Some((command, args)) = words.split_first() else {
            continue;
        };
        if matches!(command.as_str(), "quit" | "exit") {
            break;
        }
        if let Err(e) = run_command(&node, command, args).await {
            println!("{} {}", "error:".bright_red(), e);
        }
    }
    Ok(())
}

async fn prompt() -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"> ").await?;
    stdout.flush().await
}

async fn run_command(node: &Node, command: &str, args: &[String]) -> Result<(), ChainError> {
    let min_fee = node.config().mempool.min_fee;
    match command {
        "help" => print_help(),
        "myid" => println!("{}", address_to_hex(&node.address())),
        "peers" => {
            let peers = node.peers().await;
            if peers.is_empty() {
                println!("{}", "no peers connected".yellow());
            }
            for peer in peers {
                println!("• {}", peer);
            }
        }
        "connect" => {
            let Some(addr) = args.first() else {
                println!("Usage: connect <host:port>");
                return Ok(());
            };
            node.connect(addr).await?;
            println!("{} {}", "connected to".bright_green(), addr);
        }
        "post" => {
            let (text, fee) = text_and_fee(args, min_fee);
            if text.is_empty() {
                println!("Usage: post <text> [fee]");
                return Ok(());
            }
            let op = node.post(&text, fee).await?;
            println!(
                "{} post ({}): {} fee={}",
                "✓ queued".bright_green(),
                short_hex(&op.id, 12),
                text,
                fee
            );
        }
        "reply" => {
            let Some((target, rest)) = args.split_first() else {
                println!("Usage: reply <postId|prefix> <text> [fee]");
                return Ok(());
            };
            let (text, fee) = text_and_fee(rest, min_fee);
            if text.is_empty() {
                println!("Usage: reply <postId|prefix> <text> [fee]");
                return Ok(());
            }
            let view = node.timeline(false).await;
            let Some(target) = resolve_post(&view, target) else {
                println!("{}", "post not found".yellow());
                return Ok(());
            };
            node.reply(target, &text, fee).await?;
            println!(
                "{} reply on {} fee={}: {}",
                "↳ queued".bright_green(),
                short_hex(&target, 12),
                fee,
                text
            );
        }
        "txpool" => {
            let mempool = node.mempool().read().await;
            println!("mempool size: {}", mempool.len());
            for op in mempool.ops() {
                println!(
                    "  {} {} fee={} by {}",
                    short_hex(&op.id, 12),
                    op.kind(),
                    op.fee(),
                    short_hex(&op.author_id, 12)
                );
            }
        }
        "mine" => {
            let max_ops = match args.first() {
                Some(n) => n.parse::<usize>().map_err(|_| invalid("mine [maxOps]"))?.max(1),
                None => usize::MAX,
            };
            match node.mine_once(max_ops).await {
                Ok(outcome) => {
                    println!(
                        "{} #{} ops={} hash={} diff={}",
                        "⛏️  mined".bright_green(),
                        outcome.block.header.index,
                        outcome.block.ops.len(),
                        short_hex(&outcome.block.hash, 16),
                        outcome.block.header.difficulty
                    );
                    for action in outcome.governance {
                        println!("{} {}", "[gov] applied".bright_magenta(), action);
                    }
                }
                Err(ChainError::NothingToMine) => println!("{}", "mempool is empty".yellow()),
                Err(e) => return Err(e),
            }
        }
        "show" => show(node, args.first(), true).await,
        "show-all" => show(node, args.first(), false).await,
        "height" => println!("{}", node.height().await),
        "tip" => println!("{}", hex::encode(node.tip().await)),
        "export" => println!("{}", node.export_chain().await?),
        "params" => {
            println!("difficulty: {} bits", node.active_difficulty().await);
            for (key, value) in node.params().await.iter() {
                println!("  {} = {}", key, value);
            }
        }
        "validators" => {
            let validators = node.validators().await;
            println!(
                "{} validator(s), {} vote(s) ratify a proposal",
                validators.len(),
                threshold(validators.len())
            );
            for id in validators.iter() {
                println!("  {}", address_to_hex(id));
            }
        }
        "propose-param" => {
            let (Some(key), Some(value)) = (args.first(), args.get(1)) else {
                println!("Usage: propose-param <key> <value>");
                return Ok(());
            };
            let value = value
                .parse::<u64>()
                .map_err(|_| invalid("propose-param <key> <unsigned integer>"))?;
            let payload = GovPayload::ParamsSet {
                key: key.clone(),
                value,
            };
            propose(node, payload, min_fee).await?;
        }
        "propose-val-add" | "propose-val-del" => {
            let Some(id) = args.first() else {
                println!("Usage: {} <validatorIdHex>", command);
                return Ok(());
            };
            let id = address_from_hex(id)?;
            let payload = if command == "propose-val-add" {
                GovPayload::ValidatorAdd { id }
            } else {
                GovPayload::ValidatorDel { id }
            };
            propose(node, payload, min_fee).await?;
        }
        "vote" => {
            let Some(pid) = args.first() else {
                println!("Usage: vote <proposalId> [fee]");
                return Ok(());
            };
            let fee = match args.get(1) {
                Some(fee) => fee.parse().map_err(|_| invalid("vote <proposalId> [fee]"))?,
                None => min_fee,
            };
            node.vote(pid, fee).await?;
            println!("{} vote pid={}", "[gov]".bright_magenta(), pid);
        }
        other => println!("unknown command '{}'; try {}", other, "help".bright_green()),
    }
    Ok(())
}

async fn propose(node: &Node, payload: GovPayload, fee: u64) -> Result<(), ChainError> {
    let op = node.propose(payload.clone(), fee).await?;
    if let OpBody::GovPropose { proposal_id, .. } = &op.body {
        println!(
            "{} proposed {} pid={}",
            "[gov]".bright_magenta(),
            payload,
            proposal_id
        );
    }
    Ok(())
}

async fn show(node: &Node, id: Option<&String>, active_only: bool) {
    let view = node.timeline(active_only).await;
    let Some(id) = id else {
        for post in view.timeline.iter().take(TIMELINE_PAGE) {
            println!(
                "• {}  (id:{}, by:{}, {})",
                post.text,
                short_hex(&post.id, 12).bright_yellow(),
                short_hex(&post.author_id, 12),
                format_time(post.timestamp)
            );
            for reply in view.replies(&post.id) {
                println!(
                    "   ↳ {} (by:{}, {})",
                    reply.text,
                    short_hex(&reply.author_id, 12),
                    format_time(reply.timestamp)
                );
            }
        }
        return;
    };

    let Some(post) = resolve_post(&view, id).and_then(|full| view.posts.get(&full)) else {
        println!("{}", "post not found or expired".yellow());
        return;
    };
    print_entry("POST", post, "");
    for reply in view.replies(&post.id) {
        print_entry("REPLY", reply, "  ");
    }
}

fn print_entry(label: &str, entry: &Entry, indent: &str) {
    println!("{}{} {}", indent, label.bright_cyan(), hex::encode(entry.id));
    println!("{}  text: {}", indent, entry.text);
    println!("{}  by: {}", indent, address_to_hex(&entry.author_id));
    println!("{}  ts: {}", indent, format_time(entry.timestamp));
    println!("{}  block: #{}", indent, entry.block_index);
}

fn resolve_post(view: &TimelineView, id: &str) -> Option<OpId> {
    if id.len() == 64 {
        let bytes = hex::decode(id).ok()?;
        bytes.try_into().ok()
    } else {
        view.resolve_prefix(id)
    }
}

fn format_time(timestamp_ms: u64) -> String {
    let time = UNIX_EPOCH + Duration::from_millis(timestamp_ms);
    humantime::format_rfc3339_seconds(time).to_string()
}

/// Text is every argument; a trailing integer is taken as the fee.
fn text_and_fee(args: &[String], default_fee: u64) -> (String, u64) {
    match args.split_last() {
        Some((last, rest)) if !rest.is_empty() => match last.parse::<u64>() {
            Ok(fee) => (rest.join(" "), fee),
            Err(_) => (args.join(" "), default_fee),
        },
        _ => (args.join(" "), default_fee),
    }
}

/// Whitespace-separated words; double quotes group words.
fn split_args(line: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn invalid(usage: &str) -> ChainError {
    ChainError::InvalidOp(format!("Usage: {}", usage))
}

fn print_help() {
    println!("{}", "Commands".bright_cyan().bold());
    let rows = [
        ("help", "show this help"),
        ("myid", "print this node's id"),
        ("peers", "list connected peers"),
        ("connect <host:port>", "dial a peer"),
        ("post <text> [fee]", "queue a post"),
        ("reply <postId|prefix> <text> [fee]", "queue a reply"),
        ("txpool", "list queued ops"),
        ("mine [maxOps]", "mine one block from the mempool"),
        ("show [postId|prefix]", "active timeline, or one post with replies"),
        ("show-all [postId|prefix]", "like show, including expired posts"),
        ("height", "number of blocks"),
        ("tip", "hash of the newest block"),
        ("export", "print the chain as JSON"),
        ("params", "governance parameters"),
        ("validators", "current validator set"),
        ("propose-param <key> <value>", "propose a parameter change"),
        ("propose-val-add <idHex>", "propose adding a validator"),
        ("propose-val-del <idHex>", "propose removing a validator"),
        ("vote <proposalId> [fee]", "vote for a proposal"),
        ("quit", "exit"),
    ];
    for (usage, about) in rows {
        println!("  {} {}", format!("{:<38}", usage).bright_green(), about);
    }
}
