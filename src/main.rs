// src/main.rs

use anyhow::Result;
use clap::{Parser, Subcommand};
use conary_reposerver::auth::admin::{self, AclEntry};
use conary_reposerver::db;
use conary_reposerver::server::{self, RepositoryConfigFile, ServerConfig};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "conary-reposerver")]
#[command(author, version, about = "Conary package repository server", long_about = None)]
struct Cli {
    /// Configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the repository over HTTP
    Serve,
    /// Create or upgrade the repository database
    Init,
    /// List every callable operation
    Operations,
    /// Add a user, optionally placing it in a role
    AddUser {
        name: String,
        password: String,
        #[arg(long)]
        role: Option<String>,
    },
    /// Add a role
    AddRole {
        name: String,
        /// Grant administrative rights
        #[arg(long)]
        admin: bool,
        /// Allow mirroring
        #[arg(long)]
        mirror: bool,
    },
    /// Grant a role access to a label and trove pattern
    AddAcl {
        role: String,
        /// Label scope (default: every label)
        #[arg(long)]
        label: Option<String>,
        /// Trove name pattern (default: every trove)
        #[arg(long)]
        pattern: Option<String>,
        #[arg(long)]
        write: bool,
        #[arg(long)]
        remove: bool,
        /// Grant administrative rights through this ACL
        #[arg(long)]
        admin: bool,
    },
}

fn load_config(path: Option<&Path>) -> Result<ServerConfig> {
    let file = match path {
        Some(path) => RepositoryConfigFile::load(path)?,
        None => RepositoryConfigFile::default(),
    };
    file.to_server_config()
}

fn main() -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(server::run_server(config))?;
        }
        Commands::Init => {
            db::init(&config.db_path)?;
            info!("Repository database ready at {}", config.db_path.display());
        }
        Commands::Operations => {
            let server = server::RepositoryServer::open(config)?;
            for op in server.registry().iter() {
                println!(
                    "{:<28} {:<5} protocol>={}",
                    op.name,
                    if op.requires_write { "write" } else { "read" },
                    op.min_protocol
                );
            }
        }
        Commands::AddUser { name, password, role } => {
            db::init(&config.db_path)?;
            let mut conn = db::open(&config.db_path)?;
            db::transaction(&mut conn, |tx| {
                admin::add_user(tx, &name, &password)?;
                if let Some(role) = &role {
                    let mut members = admin::role_members(tx, role)?;
                    members.push(name.clone());
                    admin::update_role_members(tx, role, &members)?;
                }
                Ok(())
            })?;
        }
        Commands::AddRole { name, admin: is_admin, mirror } => {
            db::init(&config.db_path)?;
            let mut conn = db::open(&config.db_path)?;
            db::transaction(&mut conn, |tx| {
                admin::add_role(tx, &name)?;
                admin::set_role_admin(tx, &name, is_admin)?;
                admin::set_role_can_mirror(tx, &name, mirror)
            })?;
        }
        Commands::AddAcl {
            role,
            label,
            pattern,
            write,
            remove,
            admin: grant_admin,
        } => {
            db::init(&config.db_path)?;
            let mut conn = db::open(&config.db_path)?;
            let acl = AclEntry {
                label,
                pattern,
                can_write: write,
                can_remove: remove,
                admin: grant_admin,
            };
            db::transaction(&mut conn, |tx| admin::add_acl(tx, &role, &acl))?;
        }
    }

    Ok(())
}
