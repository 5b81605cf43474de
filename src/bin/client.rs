//! Control-socket client. One JSON-RPC request per connection; the request
//! is framed by shutting down the write side, the response by the server
//! closing the stream.

use prettytable::{Table, row};
use serde_json::{Value, json};
use st_daemon::api_client::ApiClient;
use st_daemon::config::CONFIG;
use st_daemon::database::DbClient;
use st_daemon::models::RestartPolicy;
use st_daemon::workloads::WorkloadConfig;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::UnixStream;
use uuid::Uuid;

fn usage() -> ! {
    eprintln!(
        "usage: client <command> [args] [--player-id N | --agent SYMBOL]

commands:
  container create <container_id> <config-json> [--restart-policy P]
  container stop <container_id>
  container inspect <container_id> [--limit N]
  container list
  container remove <container_id>
  container logs <container_id> [--limit N] [--level L] [--since RFC3339]
  navigate <ship> <destination>
  dock <ship> | orbit <ship> | refuel <ship>
  scout <markets,comma,separated> --ships S1,S2 [--iterations N] [--return]
  experiment <system> --ships S1,S2
  player register <callsign> <faction>
  player list"
    );
    std::process::exit(1);
}

struct Flags {
    player_id: Option<i64>,
    agent: Option<String>,
    ships: Vec<String>,
    limit: Option<i64>,
    level: Option<String>,
    since: Option<String>,
    iterations: u32,
    restart_policy: Option<String>,
    return_to_start: bool,
    positional: Vec<String>,
}

fn parse_flags(args: &[String]) -> Flags {
    let mut flags = Flags {
        player_id: None,
        agent: None,
        ships: Vec::new(),
        limit: None,
        level: None,
        since: None,
        iterations: 1,
        restart_policy: None,
        return_to_start: false,
        positional: Vec::new(),
    };
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--player-id" => {
                flags.player_id = iter.next().and_then(|v| v.parse().ok());
            }
            "--agent" => flags.agent = iter.next().cloned(),
            "--ships" => {
                flags.ships = iter
                    .next()
                    .map(|v| v.split(',').map(str::to_string).collect())
                    .unwrap_or_default();
            }
            "--limit" => flags.limit = iter.next().and_then(|v| v.parse().ok()),
            "--level" => flags.level = iter.next().cloned(),
            "--since" => flags.since = iter.next().cloned(),
            "--iterations" => {
                flags.iterations = iter.next().and_then(|v| v.parse().ok()).unwrap_or(1);
            }
            "--restart-policy" => flags.restart_policy = iter.next().cloned(),
            "--return" => flags.return_to_start = true,
            other => flags.positional.push(other.to_string()),
        }
    }
    flags
}

/// Explicit --player-id, then --agent lookup, then the sole registered
/// player; anything else is an error.
async fn resolve_player(db: &DbClient, flags: &Flags) -> i64 {
    if let Some(player_id) = flags.player_id {
        return player_id;
    }
    if let Some(agent) = &flags.agent {
        match db.find_player_by_agent(agent).await {
            Ok(Some(player)) => return player.id,
            _ => {
                eprintln!("No player registered for agent {}", agent);
                std::process::exit(1);
            }
        }
    }
    match db.list_players().await {
        Ok(players) if players.len() == 1 => players[0].id,
        Ok(players) if players.is_empty() => {
            eprintln!("No players registered; run `player register` first");
            std::process::exit(1);
        }
        Ok(_) => {
            eprintln!("Multiple players registered; pass --player-id or --agent");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Database error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn rpc(method: &str, params: Value) -> Value {
    let request = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1,
    });
    let mut stream = match UnixStream::connect(&CONFIG.socket_path).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("Cannot reach daemon at {}: {}", CONFIG.socket_path, e);
            std::process::exit(1);
        }
    };
    let body = serde_json::to_vec(&request).expect("serializable request");
    stream.write_all(&body).await.expect("write request");
    stream.shutdown().await.expect("half-close request");

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.expect("read response");
    let response: Value = serde_json::from_slice(&raw).expect("json response");
    if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
        eprintln!(
            "Error: {}",
            error.get("message").and_then(Value::as_str).unwrap_or("unknown")
        );
        std::process::exit(1);
    }
    response.get("result").cloned().unwrap_or(Value::Null)
}

async fn create_command_container(
    player_id: i64,
    prefix: &str,
    config: &WorkloadConfig,
    restart_policy: Option<&str>,
) -> Value {
    let container_id = format!("{}-{}", prefix, &Uuid::new_v4().simple().to_string()[..8]);
    let mut params = json!({
        "container_id": container_id,
        "player_id": player_id,
        "container_type": "command",
        "config": config,
    });
    if let Some(policy) = restart_policy {
        params["restart_policy"] = json!(policy);
    }
    rpc("container.create", params).await
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.parse_filters(&std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".to_string()));
    builder.init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        usage();
    }
    let flags = parse_flags(&args[1..]);
    let db = match DbClient::connect().await {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    match (args[0].as_str(), flags.positional.as_slice()) {
        ("player", positional) => match positional {
            [sub, callsign, faction] if sub == "register" => {
                let api_client = ApiClient::new();
                match api_client.register(faction, callsign).await {
                    Ok((token, agent)) => {
                        let player = db
                            .upsert_player(&agent.symbol, &token)
                            .await
                            .expect("persist player");
                        println!("Registered {} as player {}", agent.symbol, player.id);
                    }
                    Err(e) => {
                        eprintln!("Registration failed: {}", e);
                        std::process::exit(1);
                    }
                }
            }
            [sub] if sub == "list" => {
                let players = db.list_players().await.expect("list players");
                let mut table = Table::new();
                table.add_row(row!["id", "agent", "credits", "last active"]);
                for player in players {
                    table.add_row(row![
                        player.id,
                        player.agent_symbol,
                        player.credits,
                        player
                            .last_active
                            .map(|ts| ts.to_rfc3339())
                            .unwrap_or_else(|| "-".to_string()),
                    ]);
                }
                table.printstd();
            }
            _ => usage(),
        },
        ("container", positional) => match positional {
            [sub, container_id, config] if sub == "create" => {
                let player_id = resolve_player(&db, &flags).await;
                let config: Value = serde_json::from_str(config).unwrap_or_else(|e| {
                    eprintln!("Invalid config json: {}", e);
                    std::process::exit(1);
                });
                let restart_policy = flags
                    .restart_policy
                    .as_deref()
                    .map(|p| p.parse::<RestartPolicy>())
                    .transpose()
                    .unwrap_or_else(|_| {
                        eprintln!("Invalid restart policy");
                        std::process::exit(1);
                    });
                let mut params = json!({
                    "container_id": container_id,
                    "player_id": player_id,
                    "container_type": "command",
                    "config": config,
                });
                if let Some(policy) = restart_policy {
                    params["restart_policy"] = json!(policy);
                }
                let result = rpc("container.create", params).await;
                println!("{}", serde_json::to_string_pretty(&result).unwrap());
            }
            [sub, container_id] if sub == "stop" => {
                let result = rpc("container.stop", json!({ "container_id": container_id })).await;
                println!("{}", serde_json::to_string_pretty(&result).unwrap());
            }
            [sub, container_id] if sub == "inspect" => {
                let result = rpc(
                    "container.inspect",
                    json!({ "container_id": container_id, "log_limit": flags.limit }),
                )
                .await;
                println!("{}", serde_json::to_string_pretty(&result).unwrap());
            }
            [sub] if sub == "list" => {
                let mut params = json!({});
                if let Some(player_id) = flags.player_id {
                    params["player_id"] = json!(player_id);
                }
                let result = rpc("container.list", params).await;
                let mut table = Table::new();
                table.add_row(row!["container", "player", "type", "status"]);
                for container in result["containers"].as_array().cloned().unwrap_or_default() {
                    table.add_row(row![
                        container["container_id"].as_str().unwrap_or("-"),
                        container["player_id"],
                        container["type"].as_str().unwrap_or("-"),
                        container["status"].as_str().unwrap_or("-"),
                    ]);
                }
                table.printstd();
            }
            [sub, container_id] if sub == "remove" => {
                let result =
                    rpc("container.remove", json!({ "container_id": container_id })).await;
                println!("{}", serde_json::to_string_pretty(&result).unwrap());
            }
            [sub, container_id] if sub == "logs" => {
                let player_id = resolve_player(&db, &flags).await;
                let result = rpc(
                    "container.logs",
                    json!({
                        "container_id": container_id,
                        "player_id": player_id,
                        "limit": flags.limit,
                        "level": flags.level,
                        "since": flags.since,
                    }),
                )
                .await;
                for log in result["logs"].as_array().cloned().unwrap_or_default() {
                    println!(
                        "{} [{}] {}",
                        log["timestamp"].as_str().unwrap_or("-"),
                        log["level"].as_str().unwrap_or("-"),
                        log["message"].as_str().unwrap_or(""),
                    );
                }
            }
            _ => usage(),
        },
        ("navigate", [ship, destination]) => {
            let player_id = resolve_player(&db, &flags).await;
            let config: WorkloadConfig = serde_json::from_value(json!({
                "command_type": "NavigateShip",
                "params": { "ship_symbol": ship, "destination": destination },
            }))
            .expect("valid navigate config");
            let result = create_command_container(player_id, "navigate", &config, None).await;
            println!("{}", serde_json::to_string_pretty(&result).unwrap());
        }
        ("dock", [ship]) | ("orbit", [ship]) | ("refuel", [ship]) => {
            let player_id = resolve_player(&db, &flags).await;
            let command_type = match args[0].as_str() {
                "dock" => "DockShip",
                "orbit" => "OrbitShip",
                _ => "RefuelShip",
            };
            let config: WorkloadConfig = serde_json::from_value(json!({
                "command_type": command_type,
                "params": { "ship_symbol": ship },
            }))
            .expect("valid ship config");
            let result = create_command_container(player_id, &args[0], &config, None).await;
            println!("{}", serde_json::to_string_pretty(&result).unwrap());
        }
        ("scout", [markets]) => {
            if flags.ships.is_empty() {
                eprintln!("scout requires --ships");
                std::process::exit(1);
            }
            let player_id = resolve_player(&db, &flags).await;
            let markets: Vec<&str> = markets.split(',').collect();
            let config: WorkloadConfig = serde_json::from_value(json!({
                "command_type": "ScoutMarkets",
                "params": {
                    "ship_symbols": flags.ships,
                    "markets": markets,
                    "iterations": flags.iterations,
                    "return_to_start": flags.return_to_start,
                },
            }))
            .expect("valid scout config");
            let result = create_command_container(player_id, "scout", &config, None).await;
            println!("{}", serde_json::to_string_pretty(&result).unwrap());
        }
        ("experiment", [system]) => {
            if flags.ships.is_empty() {
                eprintln!("experiment requires --ships");
                std::process::exit(1);
            }
            let player_id = resolve_player(&db, &flags).await;
            let config: WorkloadConfig = serde_json::from_value(json!({
                "command_type": "MarketLiquidityExperiment",
                "params": {
                    "ship_symbols": flags.ships,
                    "system_symbol": system,
                },
            }))
            .expect("valid experiment config");
            let result = create_command_container(player_id, "experiment", &config, None).await;
            println!("{}", serde_json::to_string_pretty(&result).unwrap());
        }
        _ => usage(),
    }
}
