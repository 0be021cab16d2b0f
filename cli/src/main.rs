//! Kestrel CLI - delegated identifiers and credential exchange for trading agents.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kestrel_agent::{
    AgentConfig, Counterparty, DelegationRequest, Environment, GrantRecord, Session,
    SessionManager, admit_recorded_grant, approve_delegation, await_delegation,
    create_identifier, create_registry, issue_into, issue_self_attested,
    request_delegated_identifier, saidify_schema, send_grant, verify_delegation,
    verify_grant, verify_identifier_registered,
};
use kestrel_core::{Credential, Passcode};
use kestrel_host::HttpHost;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Timeout of a single HTTP request to the hosting service.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Kestrel command-line tool
#[derive(Parser)]
#[command(name = "kestrel")]
#[command(about = "Delegated identifiers and self-attested credential exchange", long_about = None)]
struct Cli {
    /// Agent configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Network preset
    #[arg(long, global = true, value_enum)]
    env: Option<Net>,

    /// Hosting service URL, overriding the preset
    #[arg(long, global = true)]
    agent_url: Option<String>,

    /// OOBI base URL, overriding the preset
    #[arg(long, global = true)]
    oobi_url: Option<String>,

    /// Agent passcode
    #[arg(short, long, global = true, env = "KESTREL_PASSCODE", hide_env_values = true)]
    passcode: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Net {
    Local,
    Testnet,
}

#[derive(Subcommand)]
enum Commands {
    /// Passcode management
    Passcode {
        #[command(subcommand)]
        action: PasscodeAction,
    },
    /// Identifier lifecycle
    Identifier {
        #[command(subcommand)]
        action: IdentifierAction,
    },
    /// Delegation checks
    Delegation {
        #[command(subcommand)]
        action: DelegationAction,
    },
    /// Schema utilities
    Schema {
        #[command(subcommand)]
        action: SchemaAction,
    },
    /// Credential registries
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },
    /// Credential issuance and exchange
    Credential {
        #[command(subcommand)]
        action: CredentialAction,
    },
}

#[derive(Subcommand)]
enum PasscodeAction {
    /// Generate a new passcode
    Generate,
}

#[derive(Subcommand)]
enum IdentifierAction {
    /// Incept a new identifier
    Create {
        #[arg(short, long)]
        alias: String,
    },
    /// Request a delegated identifier
    Delegate {
        #[arg(short, long)]
        alias: String,
        /// Delegator prefix
        #[arg(short, long)]
        delegator: String,
        /// Where to write the delegation request
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Approve a delegation request as its delegator
    Approve {
        #[arg(short, long)]
        alias: String,
        #[arg(short, long)]
        request: PathBuf,
    },
    /// Wait for an approved delegation to complete
    Wait {
        #[arg(short, long)]
        request: PathBuf,
        /// Seconds to wait for the approval
        #[arg(short, long, default_value = "120")]
        timeout: u64,
    },
}

#[derive(Subcommand)]
enum DelegationAction {
    /// Verify that a delegate was delegated by a delegator
    Verify {
        #[arg(long)]
        delegate: String,
        #[arg(long)]
        delegator: String,
    },
}

#[derive(Subcommand)]
enum SchemaAction {
    /// Compute and embed a schema's self-addressing identifier
    Saidify {
        /// Schema document (JSON)
        schema: PathBuf,
        /// Write the result here instead of overwriting the input
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Publish a saidified schema on the hosting service's network
    Publish {
        /// Schema document (JSON)
        schema: PathBuf,
    },
}

#[derive(Subcommand)]
enum RegistryAction {
    /// Create a registry (succeeds if it already exists)
    Create {
        #[arg(short, long)]
        alias: String,
        #[arg(short, long)]
        name: String,
    },
}

#[derive(Subcommand)]
enum CredentialAction {
    /// Issue a self-attested credential
    Issue {
        #[arg(short, long)]
        alias: String,
        /// Schema SAID
        #[arg(short, long)]
        schema: String,
        /// Attribute payload (JSON object)
        #[arg(long)]
        attributes: PathBuf,
        /// Registry name (defaults to the first registry)
        #[arg(short, long)]
        registry: Option<String>,
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Send an issued credential as a Grant
    Grant {
        #[arg(short, long)]
        alias: String,
        #[arg(long)]
        credential: PathBuf,
        /// Counterparty task data: {"prefix", "oobi"}
        #[arg(long)]
        counterparty: PathBuf,
        #[arg(short, long, default_value = "")]
        message: String,
        /// Where to record the Grant
        #[arg(short, long)]
        out: PathBuf,
    },
    /// Admit a recorded Grant
    Admit {
        #[arg(short, long)]
        alias: String,
        #[arg(short, long)]
        grant: PathBuf,
    },
    /// Verify a recorded Grant independently of its exchange
    VerifyGrant {
        #[arg(short, long)]
        grant: PathBuf,
    },
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let contents = serde_json::to_string_pretty(value)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents).with_context(|| format!("Could not write {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(cli: &Cli) -> Result<AgentConfig> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };
    if let Some(net) = cli.env {
        config.environment = match net {
            Net::Local => Environment::local(),
            Net::Testnet => Environment::testnet(),
        };
    }
    if cli.agent_url.is_some() || cli.oobi_url.is_some() {
        let env = &config.environment;
        let agent_url = cli.agent_url.as_deref().unwrap_or(&env.agent_url);
        let oobi_url = cli.oobi_url.as_deref().unwrap_or(agent_url);
        config.environment = Environment {
            operation_timeout: env.operation_timeout,
            poll_interval: env.poll_interval,
            ..Environment::custom(agent_url, oobi_url)
        };
    }
    Ok(config)
}

async fn open_session(cli: &Cli, config: AgentConfig) -> Result<Arc<Session>> {
    let environment = config.environment.clone();
    let host = HttpHost::new(&environment.agent_url, HTTP_TIMEOUT)?;
    let manager = SessionManager::new(Arc::new(host), config);
    let session = manager
        .get_or_create(cli.passcode.as_deref(), &environment)
        .await
        .context("Could not open a session (set --passcode or KESTREL_PASSCODE)")?;
    Ok(session)
}

fn cmd_passcode_generate() -> Result<()> {
    let passcode = Passcode::generate();
    println!("{}", passcode.as_str());
    Ok(())
}

fn cmd_schema_saidify(schema: &Path, out: Option<&Path>) -> Result<()> {
    let document: Value = read_json(schema)?;
    let (said, document) = saidify_schema(document)?;
    write_json(out.unwrap_or(schema), &document)?;
    println!("{said}");
    Ok(())
}

async fn cmd_schema_publish(config: &AgentConfig, schema: &Path) -> Result<()> {
    let document: Value = read_json(schema)?;
    let host = HttpHost::new(&config.environment.agent_url, HTTP_TIMEOUT)?;
    let said = host.publish_schema(&document).await?;
    info!(said = %said, agent_url = %config.environment.agent_url, "Schema published");
    println!("{said}");
    Ok(())
}

async fn cmd_identifier_create(session: &Session, alias: &str) -> Result<()> {
    let record = create_identifier(session, alias).await?;
    print_json(&serde_json::json!({
        "alias": record.name,
        "prefix": record.prefix,
        "oobi": session.oobi_url(&record.prefix),
    }))
}

async fn cmd_identifier_delegate(
    session: &Session,
    alias: &str,
    delegator: &str,
    out: &Path,
) -> Result<()> {
    let request = request_delegated_identifier(session, alias, delegator).await?;
    write_json(out, &request)?;
    info!(alias, prefix = %request.prefix, "Delegation request written to {}", out.display());
    print_json(&request)
}

async fn cmd_identifier_approve(session: &Session, alias: &str, request: &Path) -> Result<()> {
    let request: DelegationRequest = read_json(request)?;
    let state = approve_delegation(session, alias, &request).await?;
    print_json(&serde_json::json!({
        "delegator": state.prefix,
        "delegate": request.prefix,
        "anchorSn": state.sn,
    }))
}

async fn cmd_identifier_wait(session: &Session, request: &Path, timeout: u64) -> Result<()> {
    let request: DelegationRequest = read_json(request)?;
    let record = await_delegation(session, &request, Duration::from_secs(timeout)).await?;
    verify_identifier_registered(
        session,
        &request.alias,
        &request.prefix,
        &session.config().registration,
    )
    .await?;
    print_json(&serde_json::json!({
        "alias": record.name,
        "prefix": record.prefix,
        "delegator": request.delegator,
        "oobi": session.oobi_url(&record.prefix),
    }))
}

async fn cmd_delegation_verify(session: &Session, delegate: &str, delegator: &str) -> Result<()> {
    let report = verify_delegation(session, delegate, delegator, &session.config().key_state)
        .await?;
    print_json(&report)?;
    if !report.is_verified() {
        anyhow::bail!("Delegation undetermined: {}", report.reason);
    }
    Ok(())
}

async fn cmd_registry_create(session: &Session, alias: &str, name: &str) -> Result<()> {
    let registry = create_registry(session, alias, name).await?;
    print_json(&registry)
}

async fn cmd_credential_issue(
    session: &Session,
    alias: &str,
    schema: &str,
    attributes: &Path,
    registry: Option<&str>,
    out: &Path,
) -> Result<()> {
    let attributes: Map<String, Value> = read_json(attributes)?;
    let credential = match registry {
        Some(name) => issue_into(session, alias, name, schema, attributes).await?,
        None => issue_self_attested(session, alias, schema, attributes).await?,
    };
    write_json(out, &credential)?;
    print_json(&serde_json::json!({"said": credential.said, "issuer": credential.issuer}))
}

async fn cmd_credential_grant(
    session: &Session,
    alias: &str,
    credential: &Path,
    counterparty: &Path,
    message: &str,
    out: &Path,
) -> Result<()> {
    let credential: Credential = read_json(credential)?;
    let counterparty: Counterparty = read_json(counterparty)?;
    let record = send_grant(session, alias, &credential, &counterparty, message).await?;
    write_json(out, &record)?;
    print_json(&record)
}

async fn cmd_credential_admit(session: &Session, alias: &str, grant: &Path) -> Result<()> {
    let record: GrantRecord = read_json(grant)?;
    let admit = admit_recorded_grant(session, alias, &record).await?;
    print_json(&serde_json::json!({"grant": record.grant, "admit": admit}))
}

async fn cmd_credential_verify_grant(session: &Session, grant: &Path) -> Result<()> {
    let record: GrantRecord = read_json(grant)?;
    let credential = verify_grant(session, &record).await?;
    print_json(&serde_json::json!({
        "grant": record.grant,
        "credential": credential,
        "verified": true,
    }))
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Passcode {
            action: PasscodeAction::Generate,
        } => return cmd_passcode_generate(),
        Commands::Schema {
            action: SchemaAction::Saidify { schema, out },
        } => return cmd_schema_saidify(schema, out.as_deref()),
        _ => {}
    }

    let config = load_config(&cli)?;
    if let Commands::Schema {
        action: SchemaAction::Publish { schema },
    } = &cli.command
    {
        return cmd_schema_publish(&config, schema).await;
    }
    let session = open_session(&cli, config).await?;

    match &cli.command {
        Commands::Identifier { action } => match action {
            IdentifierAction::Create { alias } => cmd_identifier_create(&session, alias).await,
            IdentifierAction::Delegate {
                alias,
                delegator,
                out,
            } => cmd_identifier_delegate(&session, alias, delegator, out).await,
            IdentifierAction::Approve { alias, request } => {
                cmd_identifier_approve(&session, alias, request).await
            }
            IdentifierAction::Wait { request, timeout } => {
                cmd_identifier_wait(&session, request, *timeout).await
            }
        },
        Commands::Delegation {
            action: DelegationAction::Verify {
                delegate,
                delegator,
            },
        } => cmd_delegation_verify(&session, delegate, delegator).await,
        Commands::Registry {
            action: RegistryAction::Create { alias, name },
        } => cmd_registry_create(&session, alias, name).await,
        Commands::Credential { action } => match action {
            CredentialAction::Issue {
                alias,
                schema,
                attributes,
                registry,
                out,
            } => {
                cmd_credential_issue(&session, alias, schema, attributes, registry.as_deref(), out)
                    .await
            }
            CredentialAction::Grant {
                alias,
                credential,
                counterparty,
                message,
                out,
            } => cmd_credential_grant(&session, alias, credential, counterparty, message, out).await,
            CredentialAction::Admit { alias, grant } => {
                cmd_credential_admit(&session, alias, grant).await
            }
            CredentialAction::VerifyGrant { grant } => {
                cmd_credential_verify_grant(&session, grant).await
            }
        },
        Commands::Passcode { .. } | Commands::Schema { .. } => Ok(()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    run(Cli::parse()).await
}
