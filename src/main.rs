//! AccelMCP - admin-managed MCP gateway

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use accel_mcp::{
    cli::{CatalogCommand, Cli, Command},
    config::Config,
    gateway::Gateway,
    model::{AccessControl, VariableSource},
    naming,
    setup_tracing,
    store::Catalog,
    variables::VariableResolver,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Catalog(CatalogCommand::Validate { ref file })) => run_validate(file),
        Some(Command::Catalog(CatalogCommand::List { ref file })) => run_list(file),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Check a catalog file and report every problem found
fn run_validate(file: &Path) -> ExitCode {
    let catalog = match Catalog::from_file(file) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    let problems = catalog.problems();
    if problems.is_empty() {
        println!(
            "✅ {} is valid ({} services, {} apps, {} capabilities, {} accounts)",
            file.display(),
            catalog.services.len(),
            catalog.apps.len(),
            catalog.capabilities.len(),
            catalog.accounts.len()
        );
        ExitCode::SUCCESS
    } else {
        eprintln!("❌ {} has {} problem(s):", file.display(), problems.len());
        for problem in &problems {
            eprintln!("   - {problem}");
        }
        ExitCode::FAILURE
    }
}

/// Print catalog contents; tokens and secret values are never shown
fn run_list(file: &Path) -> ExitCode {
    let catalog = match Catalog::from_file(file) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("❌ {e}");
            return ExitCode::FAILURE;
        }
    };

    for service in &catalog.services {
        println!(
            "📦 {} ({}) routing={:?} {}{}",
            service.identifier,
            service.name,
            service.routing,
            access_label(service.access_control),
            if service.enabled { "" } else { " [disabled]" }
        );
        for app in catalog.apps.iter().filter(|a| a.service_id == service.id) {
            println!(
                "   └─ {} {:?} {}{}",
                app.name,
                app.kind,
                access_label(app.access_control),
                if app.enabled { "" } else { " [disabled]" }
            );
            for cap in catalog.capabilities.iter().filter(|c| c.app_id == app.id) {
                println!(
                    "      • {} [{}] {}{}",
                    naming::encode(&app.name, &cap.name),
                    cap.kind.as_str(),
                    access_label(cap.access_control),
                    if cap.enabled { "" } else { " [disabled]" }
                );
            }
        }
    }

    if !catalog.accounts.is_empty() {
        println!("\nAccounts:");
        for account in &catalog.accounts {
            let grants = catalog
                .permissions
                .iter()
                .filter(|p| p.account_id == account.id)
                .map(|p| p.target.to_string())
                .collect::<Vec<_>>();
            println!(
                "   {} (id {}){} grants: [{}]",
                account.name,
                account.id,
                if account.enabled { "" } else { " [disabled]" },
                grants.join(", ")
            );
        }
    }

    if !catalog.variables.is_empty() {
        println!("\nVariables:");
        let resolver = VariableResolver::new(catalog.variables.clone());
        for variable in &catalog.variables {
            let shown = match (&variable.source, variable.is_secret) {
                (_, true) => "********".to_string(),
                (VariableSource::Env(var), false) => format!("env:{var}"),
                (VariableSource::Value(_), false) => {
                    resolver.lookup(&variable.name).unwrap_or_default()
                }
            };
            println!("   {} ({:?}) = {shown}", variable.name, variable.kind);
        }
    }

    ExitCode::SUCCESS
}

fn access_label(access: AccessControl) -> &'static str {
    if access.is_restricted() {
        "🔒 restricted"
    } else {
        "public"
    }
}

/// Run the server
async fn run_server(cli: Cli) -> ExitCode {
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            if let Some(ref catalog) = cli.catalog {
                config.catalog = Some(catalog.clone());
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        catalog = ?config.catalog,
        "Starting AccelMCP gateway"
    );

    let gateway = match Gateway::new(config) {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
