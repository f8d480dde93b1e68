use clap::Parser;
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::config::{Config, SeedFile};
use crate::duel::{DuelView, ViewTimings, ViewUpdate};
use crate::error::{DuelError, Result};
use crate::identity::{FileStorage, Identity};
use crate::lobby::Lobby;
use crate::models::{Clip, DuelRoute, Message, ReactionKind, Side};
use crate::store::DataService;

#[derive(Parser, Debug)]
#[command(name = "duel-arena")]
#[command(version)]
#[command(about = "Watch two live streams side by side and let the crowd react")]
pub struct Args {
    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// SQLite database file (overrides config)
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Local identity file (overrides config)
    #[arg(long)]
    pub storage: Option<PathBuf>,

    /// Serve the lobby and duel pages over HTTP
    #[arg(long)]
    pub web: bool,

    /// Port for the web server (overrides config)
    #[arg(long)]
    pub port: Option<u16>,

    /// Upsert the [[streams]] of a TOML seed file
    #[arg(long)]
    pub seed: Option<PathBuf>,

    /// Print the lobby
    #[arg(long)]
    pub lobby: bool,

    /// Toggle a stream in the lobby selection (repeatable)
    #[arg(long = "pick")]
    pub picks: Vec<String>,

    /// Left stream id of a duel
    #[arg(long)]
    pub s1: Option<String>,

    /// Right stream id of a duel
    #[arg(long)]
    pub s2: Option<String>,

    /// React on a side, e.g. left:like
    #[arg(long)]
    pub react: Option<String>,

    /// Post a chat message
    #[arg(long)]
    pub say: Option<String>,

    /// Save a clip on a side (left or right)
    #[arg(long)]
    pub clip: Option<Side>,

    /// Clip title
    #[arg(long)]
    pub title: Option<String>,

    /// Stay attached and print live updates
    #[arg(long)]
    pub watch: bool,
}

impl Args {
    /// Config file values with command-line overrides applied.
    pub fn resolve_config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref())?;
        if let Some(db) = &self.db {
            config.database = db.clone();
        }
        if let Some(storage) = &self.storage {
            config.storage = storage.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        Ok(config)
    }

    /// The duel named by `--s1`/`--s2`, if both were given.
    pub fn duel_route(&self) -> Option<Result<DuelRoute>> {
        match (&self.s1, &self.s2) {
            (None, None) => None,
            (s1, s2) => Some(DuelRoute::new(
                s1.as_deref().unwrap_or(""),
                s2.as_deref().unwrap_or(""),
            )),
        }
    }
}

/// Parse `side:rtype`, e.g. `right:dislike`.
pub fn parse_react(arg: &str) -> Result<(Side, ReactionKind)> {
    let (side, rtype) = arg
        .split_once(':')
        .ok_or_else(|| DuelError::InvalidReaction(arg.to_string()))?;
    Ok((side.parse()?, rtype.parse()?))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

pub fn seed(service: &dyn DataService, path: &std::path::Path) -> Result<usize> {
    let seed = SeedFile::load(path)?;
    for stream in &seed.streams {
        service.upsert_stream(stream)?;
    }
    tracing::info!(count = seed.streams.len(), path = %path.display(), "streams seeded");
    Ok(seed.streams.len())
}

/// Lobby listing with selection marks and, once two are picked, the duel link.
pub fn render_lobby(lobby: &Lobby) -> String {
    let mut out = String::new();
    out.push_str(&format!("{}\n", "Lobby".bold()));
    if lobby.streams().is_empty() {
        out.push_str(&format!("  {}\n", "no streams yet".dimmed()));
    }
    for s in lobby.streams() {
        let mark = if lobby.is_selected(&s.id) { "[x]".bright_blue() } else { "[ ]".normal() };
        let live = if s.is_live { " LIVE".bright_red().to_string() } else { String::new() };
        out.push_str(&format!(
            "  {} {} {}{}  {}\n",
            mark,
            s.id.bold(),
            s.title,
            live,
            format!("({} · {})", s.platform, s.url).dimmed()
        ));
    }
    match lobby.duel_link() {
        Some(link) => out.push_str(&format!("\n  {} {}\n", "Watch duel:".bright_green(), link)),
        None => out.push_str(&format!(
            "\n  {}\n",
            format!("{}/2 selected", lobby.selected().len()).dimmed()
        )),
    }
    out
}

pub fn run_lobby(service: &dyn DataService, picks: &[String]) -> Result<()> {
    let mut lobby = Lobby::new();
    if !lobby.load(service) {
        return Err(DuelError::Internal("could not load streams".to_string()));
    }
    for id in picks {
        if !lobby.toggle(id) {
            eprintln!("{}", format!("  '{}' not picked: two streams already selected", id).yellow());
        }
    }
    print!("{}", render_lobby(&lobby));
    Ok(())
}

fn side_label(side: Side) -> ColoredString {
    match side {
        Side::Left => "left ".bright_cyan(),
        Side::Right => "right".bright_magenta(),
    }
}

fn render_message(m: &Message) -> String {
    format!("  {} {}", format!("{}:", m.username).bright_blue(), m.content)
}

fn render_clip(c: &Clip) -> String {
    format!("  {} {} {} @{}", "clip".yellow(), side_label(c.side), c.title, c.ts_seconds)
}

pub fn render_update(update: &ViewUpdate) -> String {
    match update {
        ViewUpdate::Counts { side, like, dislike, highlight } => {
            let flash = match highlight {
                Some(kind) => format!(" +{}", kind).bright_yellow().to_string(),
                None => String::new(),
            };
            format!(
                "  {} {} {}  {} {}{}",
                side_label(*side),
                "like".green(),
                like,
                "dislike".red(),
                dislike,
                flash
            )
        }
        ViewUpdate::Chat { message } => render_message(message),
        ViewUpdate::Clip { clip } => render_clip(clip),
    }
}

pub fn render_view(view: &DuelView) -> String {
    let snap = view.snapshot();
    let mut lines = vec![format!(
        "{} {} vs {}",
        "Duel".bold(),
        snap.left.stream_id.bright_cyan(),
        snap.right.stream_id.bright_magenta()
    )];
    for (side, s) in [(Side::Left, &snap.left), (Side::Right, &snap.right)] {
        lines.push(render_update(&ViewUpdate::Counts {
            side,
            like: s.like,
            dislike: s.dislike,
            highlight: None,
        }));
    }
    if !snap.messages.is_empty() {
        lines.push(format!("{}", "Chat".bold()));
        lines.extend(snap.messages.iter().map(render_message));
    }
    if !snap.clips.is_empty() {
        lines.push(format!("{}", "Clips".bold()));
        lines.extend(snap.clips.iter().map(render_clip));
    }
    lines.join("\n") + "\n"
}

/// Open the duel as this terminal's viewer, run the requested actions and
/// optionally stay attached.
pub async fn run_duel(
    service: Arc<dyn DataService>,
    config: &Config,
    route: DuelRoute,
    args: &Args,
) -> Result<()> {
    let mut storage = FileStorage::open(&config.storage);
    let identity = Identity::load(&mut storage);
    let timings = ViewTimings {
        cooldown: config.cooldown(),
        highlight: config.highlight(),
    };
    let mut view = DuelView::open(service, route, identity, timings);

    if let Some(arg) = &args.react {
        let (side, rtype) = parse_react(arg)?;
        let update = view.react(side, rtype, Instant::now())?;
        println!("{}", render_update(&update));
    }
    if let Some(text) = &args.say {
        let message = view.say(text)?;
        println!("{}", render_message(&message));
    }
    if let Some(side) = args.clip {
        let clip = view.clip(side, args.title.as_deref())?;
        println!("{}", render_clip(&clip));
    }

    // Our own inserts are already printed.
    view.pump(Instant::now());
    print!("{}", render_view(&view));

    if args.watch {
        eprintln!("{}", "  Watching. Press Ctrl+C to stop.".bright_blue());
        loop {
            tokio::select! {
                updates = view.next_updates() => {
                    let Some(updates) = updates else { break };
                    for u in &updates {
                        println!("{}", render_update(u));
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }
    }
    Ok(())
}
