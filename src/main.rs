//! LSNP node binary.
//!
//! A thin driver over the core engine: parses flags, starts the network,
//! prints decoded events, and maps stdin lines onto the command surface.
//! The polished interactive shell (colour, tables, image rendering) is a
//! separate front-end; this one stays plain on purpose.

use clap::Parser;
use lsnp::net::DEFAULT_PORT;
use lsnp::{NetConfig, NetError, NetEvent, Network};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "lsnp", version, about = "LSNP: Local Social Networking Protocol node")]
struct Args {
    /// Username (the part before @ in your user id)
    #[arg(short, long, default_value = "anon")]
    username: String,

    /// Display name advertised in PROFILE (defaults to the username)
    #[arg(long)]
    display_name: Option<String>,

    /// Free-text status advertised in PROFILE
    #[arg(long, default_value = "Active")]
    status: String,

    /// First UDP port to try; the listener probes upward when busy
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Data directory (revoked tokens, downloads)
    #[arg(short, long, default_value = "./lsnp-data")]
    data_dir: PathBuf,

    /// Avatar image to embed in PROFILE frames
    #[arg(long)]
    avatar: Option<PathBuf>,

    /// Surface per-drop diagnostics
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lsnp=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let mut config = NetConfig::new(args.username.clone());
    config.display_name = args.display_name.unwrap_or(args.username);
    config.status = args.status;
    config.port = args.port;
    config.download_dir = args.data_dir.join("downloads");
    config.data_dir = args.data_dir;
    config.verbose = args.verbose;

    info!("LSNP v{VERSION} starting");
    let (network, mut events) = match Network::start(config).await {
        Ok(pair) => pair,
        Err(e @ NetError::NoPort { .. }) => {
            error!("{e}");
            std::process::exit(1);
        }
        Err(e) => {
            error!("failed to start: {e}");
            std::process::exit(1);
        }
    };
    info!("you are {}", network.whoami());

    if let Some(path) = args.avatar {
        if let Err(e) = network.set_avatar(&path).await {
            warn!("avatar not set: {e}");
        }
    }

    // Event printer: the engine's only voice reaches the terminal here.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            print_event(event);
        }
    });

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !run_command(&network, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!("stdin: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    network.shutdown();
}

fn print_event(event: NetEvent) {
    match event {
        NetEvent::PeerDiscovered { user_id, .. } => println!("* discovered {user_id}"),
        NetEvent::ProfileUpdated { display_name, status, user_id, has_avatar } => {
            let pfp = if has_avatar { " [profile picture available]" } else { "" };
            println!("* {display_name} ({user_id}): {status}{pfp}");
        }
        NetEvent::Post { from, content, from_followed, .. } => {
            // Terse mode shows posts from followed users; the flag lets a
            // richer front-end decide differently.
            if from_followed {
                println!("[post] {from}: {content}");
            }
        }
        NetEvent::Dm { from, content, .. } => println!("[dm] {from}: {content}"),
        NetEvent::FollowerAdded { user_id } => println!("* {user_id} now follows you"),
        NetEvent::FollowerRemoved { user_id } => println!("* {user_id} unfollowed you"),
        NetEvent::LikeReceived { from, post_timestamp, unlike } => {
            let verb = if unlike { "unliked" } else { "liked" };
            println!("* {from} {verb} your post from {post_timestamp}");
        }
        NetEvent::TokenRevoked { from } => println!("* {from} revoked a token"),
        NetEvent::FileOffered { from, file_id, filename, filesize, .. } => {
            println!("* {from} offers {filename} ({filesize} bytes) — file accept {file_id} / file reject {file_id}");
        }
        NetEvent::FileSaved { filename, path, from, .. } => {
            println!("* saved {filename} from {from} to {}", path.display());
        }
        NetEvent::FileFailed { file_id, reason } => {
            println!("* file {file_id} failed: {reason}");
        }
        NetEvent::FileDelivered { file_id, to, status } => {
            println!("* {to} reports file {file_id}: {status}");
        }
        NetEvent::GameInvited { from, game_id, your_symbol } => {
            println!("* {from} invites you to tic-tac-toe (game {game_id}); you play {your_symbol}");
        }
        NetEvent::BoardUpdated { game_id, board, next_turn } => {
            println!("game {game_id}, turn {next_turn} next:");
            print_board(&board);
        }
        NetEvent::GameOver { game_id, result, winning_line } => {
            if winning_line.is_empty() {
                println!("* game {game_id}: draw");
            } else {
                println!("* game {game_id}: {result} wins ({winning_line})");
            }
        }
        NetEvent::GameExpired { game_id } => {
            println!("* game {game_id} timed out (60s without a move)");
        }
        NetEvent::GroupCreated { group_id, name, creator } => {
            println!("* added to group '{name}' ({group_id}) by {creator}");
        }
        NetEvent::GroupUpdated { group_id, added, removed } => {
            println!("* group {group_id} updated (+{}, -{})", added.join(","), removed.join(","));
        }
        NetEvent::GroupMessageReceived { group_id, from, content } => {
            println!("[{group_id}] {from}: {content}");
        }
        NetEvent::DeliveryFailed { to, context, .. } => {
            println!("! delivery of {context} to {to} failed");
        }
        NetEvent::Diagnostic { detail } => println!("~ {detail}"),
    }
}

fn print_board(board: &str) {
    let cells: Vec<String> = board
        .chars()
        .enumerate()
        .map(|(i, c)| if c == '.' { i.to_string() } else { c.to_string() })
        .collect();
    if cells.len() != 9 {
        return;
    }
    for row in cells.chunks(3) {
        println!("  {} | {} | {}", row[0], row[1], row[2]);
    }
}

/// One stdin line against the command surface. Returns false to exit.
async fn run_command(network: &Arc<Network>, line: &str) -> bool {
    let mut parts = line.split_whitespace();
    let Some(command) = parts.next() else {
        return true;
    };
    let rest: Vec<&str> = parts.collect();

    let outcome: Result<(), NetError> = match (command, rest.as_slice()) {
        ("quit", _) | ("exit", _) => return false,
        ("help", _) => {
            print_help();
            Ok(())
        }
        ("whoami", _) => {
            println!("{}", network.whoami());
            Ok(())
        }
        ("peers", _) => {
            for peer in network.peer_list() {
                let age = lsnp::now().saturating_sub(peer.last_seen);
                println!("{} ({}) seen {age}s ago", peer.user_id, peer.display_name);
            }
            Ok(())
        }
        ("following", _) => {
            for user in network.following() {
                println!("{user}");
            }
            Ok(())
        }
        ("post", content @ [_, ..]) => network.post(&content.join(" ")).await,
        ("dm", [target, content @ ..]) if !content.is_empty() => {
            network.dm(target, &content.join(" ")).await
        }
        ("follow", [target]) => network.follow(target).await,
        ("unfollow", [target]) => network.unfollow(target).await,
        ("like", [target, ts]) => match ts.parse() {
            Ok(ts) => network.like(target, ts, false).await,
            Err(_) => Err(NetError::Command("usage: like <user> <post_ts> [unlike]".into())),
        },
        ("like", [target, ts, action]) if *action == "unlike" => match ts.parse() {
            Ok(ts) => network.like(target, ts, true).await,
            Err(_) => Err(NetError::Command("usage: like <user> <post_ts> [unlike]".into())),
        },
        ("hello", _) => {
            network.hello().await;
            Ok(())
        }
        ("status", content @ [_, ..]) => {
            network.set_status(&content.join(" ")).await;
            Ok(())
        }
        ("avatar", [path]) => network.set_avatar(&PathBuf::from(path)).await,
        ("revoke", [token]) => network.revoke_token(token).await,
        ("file", ["send", target, path]) => network
            .offer_file(target, &PathBuf::from(path), "Sent via LSNP")
            .await
            .map(|file_id| println!("offered as {file_id}")),
        ("file", ["accept", file_id]) => network.accept_file(file_id).await,
        ("file", ["reject", file_id]) => network.reject_file(file_id),
        ("ttt", ["invite", target, symbol]) if symbol.len() == 1 => network
            .ttt_invite(target, symbol.chars().next().unwrap_or('X'))
            .await
            .map(|game_id| println!("invited; game id {game_id}")),
        ("ttt", ["move", game_id, position]) => match position.parse() {
            Ok(position) => network.ttt_move(game_id, position).await,
            Err(_) => Err(NetError::Command("position must be 0-8".into())),
        },
        ("ttt", ["board", game_id]) => {
            match network.game_board(game_id) {
                Some((board, turn)) => {
                    println!("game {game_id}, turn {turn} next:");
                    print_board(&board);
                }
                None => println!("unknown game {game_id}"),
            }
            Ok(())
        }
        ("group", ["create", group_id, name, members]) => {
            let members: Vec<String> = members.split(',').map(str::to_string).collect();
            network.create_group(group_id, name, &members).await
        }
        ("group", ["update", group_id, patches @ ..]) if !patches.is_empty() => {
            let mut add = Vec::new();
            let mut remove = Vec::new();
            for patch in patches {
                if let Some(list) = patch.strip_prefix("add=") {
                    add.extend(list.split(',').map(str::to_string));
                } else if let Some(list) = patch.strip_prefix("remove=") {
                    remove.extend(list.split(',').map(str::to_string));
                }
            }
            network.update_group(group_id, &add, &remove).await
        }
        ("group", ["msg", group_id, content @ ..]) if !content.is_empty() => {
            network.group_message(group_id, &content.join(" ")).await
        }
        ("groups", _) => {
            for (id, name, members) in network.my_groups() {
                println!("{id}: {name} ({members} members)");
            }
            Ok(())
        }
        ("members", [group_id]) => {
            for member in network.group_members(group_id) {
                println!("{member}");
            }
            Ok(())
        }
        ("stats", _) => {
            println!("{:#?}", network.stats());
            Ok(())
        }
        ("verbose", ["on"]) => {
            network.set_verbose(true);
            Ok(())
        }
        ("verbose", ["off"]) => {
            network.set_verbose(false);
            Ok(())
        }
        _ => Err(NetError::Command(format!("unrecognised command: {line} (try help)"))),
    };

    if let Err(e) = outcome {
        println!("error: {e}");
    }
    true
}

fn print_help() {
    println!(
        "commands:\n\
         \x20 whoami | peers | following | stats | verbose on|off\n\
         \x20 hello | status <text> | avatar <path> | revoke <token>\n\
         \x20 post <text> | dm <user> <text> | follow <user> | unfollow <user>\n\
         \x20 like <user> <post_ts> [unlike]\n\
         \x20 file send <user> <path> | file accept <id> | file reject <id>\n\
         \x20 ttt invite <user> <X|O> | ttt move <game> <0-8> | ttt board <game>\n\
         \x20 group create <id> <name> <a,b,c> | group update <id> add=.. remove=..\n\
         \x20 group msg <id> <text> | groups | members <id>\n\
         \x20 quit"
    );
}
