use std::path::PathBuf;
use std::process;

use anyhow::Context;
use serde_json::json;

use unity_bridge::{BridgeConfig, ConnectionPool};

enum Command {
    List,
    Port,
    Ping(Option<String>),
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let (dir, command) = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("Usage: unity-bridge-probe [--dir <path>] [list|port|ping [<instance>]]");
            eprintln!();
            eprintln!("Commands:");
            eprintln!("  list               Live instances as JSON [default]");
            eprintln!("  port               Port the bridge would connect to");
            eprintln!("  ping [<instance>]  Connect to an instance and ping it");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --dir <path>       Registry directory [default: ~/.unity-mcp]");
            process::exit(2);
        }
    };

    unity_bridge::init_tracing();

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(dir, command)) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<(Option<PathBuf>, Command), String> {
    let mut dir = None;
    let mut positional = Vec::new();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--dir" => {
                i += 1;
                dir = Some(PathBuf::from(args.get(i).ok_or("--dir requires a value")?));
            }
            "--help" | "-h" => return Err(String::new()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => positional.push(arg.to_string()),
        }
        i += 1;
    }

    let command = match positional.as_slice() {
        [] => Command::List,
        [cmd] if cmd == "list" => Command::List,
        [cmd] if cmd == "port" => Command::Port,
        [cmd] if cmd == "ping" => Command::Ping(None),
        [cmd, target] if cmd == "ping" => Command::Ping(Some(target.clone())),
        [cmd, ..] => return Err(format!("unexpected command: {cmd}")),
    };
    Ok((dir, command))
}

async fn run(dir: Option<PathBuf>, command: Command) -> anyhow::Result<()> {
    let mut config = BridgeConfig::from_env();
    if let Some(dir) = dir {
        config = config.with_registry_dir(dir);
    }
    let pool = ConnectionPool::new(config);

    let output = match command {
        Command::List => {
            let instances = pool.discover_all_instances(true).await;
            serde_json::to_value(instances.as_slice()).context("serializing instances")?
        }
        Command::Port => json!({ "port": pool.discovery().discover_port().await }),
        Command::Ping(target) => {
            let conn = pool
                .get_connection(target.as_deref())
                .await
                .context("connecting to Unity")?;
            conn.ping().await.context("pinging Unity")?;
            json!({
                "instance": conn.instance_id(),
                "port": conn.port(),
                "mode": conn.mode().await,
                "alive": true,
            })
        }
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&output).context("serializing output")?
    );
    pool.disconnect_all().await;
    Ok(())
}
