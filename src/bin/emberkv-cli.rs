//! Terminal client for EmberKV.
//!
//! Runs either a single command given on the command line or an
//! interactive prompt. Values are sent and shown as plain text; the
//! client handles the base64 framing.

use std::io::{BufRead, Write};

use clap::Parser;

use emberkv::{Client, ClientError};

#[derive(Debug, Parser)]
#[command(name = "emberkv-cli", version, about = "EmberKV terminal client")]
struct Args {
    /// Server host.
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port.
    #[arg(short, long, default_value_t = emberkv::DEFAULT_PORT)]
    port: u16,

    /// One-shot command, e.g. `set name ember` or `get name`.
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = Client::new(&args.host, args.port)?;

    if !args.command.is_empty() {
        run_command(&client, &args.command.join(" ")).await;
        return Ok(());
    }

    println!("EmberKV CLI. type 'help' for commands");
    let stdin = std::io::stdin();
    let mut input = String::new();
    loop {
        print!("kv> ");
        std::io::stdout().flush()?;
        input.clear();
        if stdin.lock().read_line(&mut input)? == 0 {
            return Ok(());
        }
        let line = input.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            return Ok(());
        }
        run_command(&client, line).await;
    }
}

async fn run_command(client: &Client, line: &str) {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(cmd) = parts.first() else {
        return;
    };

    match cmd.to_lowercase().as_str() {
        "set" => {
            if parts.len() != 3 && !(parts.len() == 5 && parts[3].eq_ignore_ascii_case("ttl")) {
                println!("usage: set <key> <value> [ttl <seconds>]");
                return;
            }
            let ttl = if parts.len() == 5 {
                match parts[4].parse::<i64>() {
                    Ok(t) if t >= 0 => t,
                    _ => {
                        println!("invalid ttl");
                        return;
                    }
                }
            } else {
                0
            };
            match client.set(parts[1], parts[2].as_bytes(), ttl).await {
                Ok(()) => println!("ok"),
                Err(err) => println!("error: {err}"),
            }
        }
        "get" => {
            if parts.len() != 2 {
                println!("usage: get <key>");
                return;
            }
            match client.get(parts[1]).await {
                Ok((value, ttl)) => {
                    println!("value={} ttl={}", String::from_utf8_lossy(&value), ttl)
                }
                Err(err) => println!("error: {err}"),
            }
        }
        "del" => {
            if parts.len() != 2 {
                println!("usage: del <key>");
                return;
            }
            match client.delete(parts[1]).await {
                Ok(()) => println!("ok"),
                Err(err) => println!("error: {err}"),
            }
        }
        "exists" => {
            if parts.len() != 2 {
                println!("usage: exists <key>");
                return;
            }
            match client.exists(parts[1]).await {
                Ok(found) => println!("{found}"),
                Err(err) => println!("error: {err}"),
            }
        }
        "ttl" => {
            if parts.len() != 2 {
                println!("usage: ttl <key>");
                return;
            }
            match client.ttl(parts[1]).await {
                Ok(ttl) => println!("{ttl}"),
                // absent or expired keys read as -2
                Err(ClientError::Api { code: 1001, .. }) | Err(ClientError::Api { code: 1002, .. }) => {
                    println!("-2")
                }
                Err(err) => println!("error: {err}"),
            }
        }
        "stats" => match client.stats().await {
            Ok(stats) => match serde_json::to_string_pretty(&stats) {
                Ok(json) => println!("{json}"),
                Err(err) => println!("error: {err}"),
            },
            Err(err) => println!("error: {err}"),
        },
        "snapshot" => match client.snapshot().await {
            Ok(resp) => println!("{} {}", resp.status, resp.path),
            Err(err) => println!("error: {err}"),
        },
        "help" => {
            println!("set <key> <value> [ttl <seconds>]");
            println!("get <key>");
            println!("del <key>");
            println!("exists <key>");
            println!("ttl <key>");
            println!("stats");
            println!("snapshot");
            println!("help");
            println!("exit | quit");
        }
        _ => println!("unknown command"),
    }
}
