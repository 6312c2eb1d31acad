//! Datagate - a natural-language data-access gateway.

mod cli;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use datagate::auth::{JwtIssuer, SessionTable, ShopifyCredentialStore, TokenCipher};
use datagate::config::Config;
use datagate::db::slack::{McpClient, MessageSearch};
use datagate::db::{BackendKind, ConnectOptions, Orchestrator, QdrantRest, QueryOptions};
use datagate::error::{GatewayError, Result};
use datagate::indexer::{
    IndexerConfig, McpHistorySource, SlackIndexer, VectorStore, WorkspaceSearcher, WorkspaceStore,
};
use datagate::llm::{LlmProvider, LlmService, MockLlmClient, OpenAiClient, OpenAiConfig};
use datagate::monitor::{AvailabilityMonitor, DEFAULT_CHECK_INTERVAL};
use datagate::schema::SchemaSearcher;
use datagate::server::query_api::backend_uri;
use datagate::server::{build_router, AppState};
use datagate::tools::{ExecutionNode, MemorySink, ToolRegistry};

use cli::{Cli, Command};

#[tokio::main]
async fn main() {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let cli = Cli::parse_args();
    if let Err(e) = datagate::logging::init_from_env() {
        eprintln!("Warning: could not initialize logging: {e}");
    }

    if let Err(e) = run(cli).await {
        error!("{}: {}", e.kind(), e);
        eprintln!("Error: {e}\n  {}", e.remediation());
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => {
            let mut config = Config::load_from_file(path)?;
            config.apply_env_defaults();
            config
        }
        None => Config::load()?,
    };

    match cli.command {
        Command::Serve { bind, port } => serve(config, bind, port).await,
        Command::Query {
            question,
            db_type,
            uri,
            analyze,
            orchestrate,
        } => query(config, question, db_type, uri, analyze, orchestrate).await,
        Command::TestConnection { db_type, all } => test_connection(config, db_type, all).await,
        Command::Index {
            workspace,
            force_full,
        } => index(config, workspace, force_full).await,
    }
}

/// Builds the LLM service from the configured provider.
fn build_llm(config: &Config) -> Result<LlmService> {
    let provider: LlmProvider = config
        .trivial_llm
        .provider
        .parse()
        .map_err(GatewayError::config)?;

    match provider {
        LlmProvider::Mock => Ok(LlmService::new(Arc::new(MockLlmClient::new()))),
        LlmProvider::OpenAi => {
            let api_key = config
                .trivial_llm
                .api_key
                .clone()
                .ok_or_else(|| GatewayError::config("trivial_llm.api_key is not set"))?;
            let mut llm_config = OpenAiConfig::new(api_key, config.trivial_llm.model.clone())
                .with_embedding_model(
                    config.trivial_llm.embedding_model.clone(),
                    config.trivial_llm.embedding_dimension,
                );
            if let Some(endpoint) = &config.trivial_llm.endpoint {
                llm_config = llm_config.with_base_url(endpoint.clone());
            }
            Ok(LlmService::new(Arc::new(OpenAiClient::new(llm_config)?)))
        }
    }
}

/// Backends with a config section present.
fn configured_backends(config: &Config) -> Vec<BackendKind> {
    let mut kinds = Vec::new();
    if config.postgres.is_some() {
        kinds.push(BackendKind::Postgres);
    }
    if config.mongodb.is_some() {
        kinds.push(BackendKind::MongoDb);
    }
    if config.qdrant.is_some() {
        kinds.push(BackendKind::Qdrant);
    }
    if config.slack.as_ref().map(|s| s.mcp_url.is_some()).unwrap_or(false) {
        kinds.push(BackendKind::Slack);
    }
    if config.shopify.as_ref().map(|s| s.app_url.is_some()).unwrap_or(false) {
        kinds.push(BackendKind::Shopify);
    }
    if config.ga4.as_ref().map(|g| g.property_id.is_some()).unwrap_or(false) {
        kinds.push(BackendKind::Ga4);
    }
    kinds
}

/// Connects one configured backend.
async fn connect_backend(
    config: &Config,
    kind: BackendKind,
    llm: &LlmService,
) -> Result<Arc<Orchestrator>> {
    connect_backend_with(config, kind, llm, None).await
}

async fn connect_backend_with(
    config: &Config,
    kind: BackendKind,
    llm: &LlmService,
    message_search: Option<Arc<dyn MessageSearch>>,
) -> Result<Arc<Orchestrator>> {
    let uri = backend_uri(config, kind)?;
    let mut opts = ConnectOptions::from_config(config);
    opts.db_type = Some(kind.as_str().to_string());
    opts.message_search = message_search;
    if kind == BackendKind::Shopify {
        if let Some((token, scopes)) = shopify_credentials(config, &uri) {
            opts.shopify_access_token = Some(token);
            opts.shopify_granted_scopes = scopes;
        }
    }
    Ok(Arc::new(
        Orchestrator::connect(&uri, opts, llm.clone()).await?,
    ))
}

/// Loads and decrypts the stored Shopify token for the configured shop.
fn shopify_credentials(config: &Config, app_url: &str) -> Option<(String, Vec<String>)> {
    let secret = config.server.secret_key.as_deref()?;
    let shop_domain = url::Url::parse(app_url).ok()?.host_str()?.to_string();

    let store = ShopifyCredentialStore::open_default(TokenCipher::new(secret)).ok()?;
    let record = match store.get_shop(&shop_domain) {
        Ok(Some(record)) => record,
        Ok(None) => {
            warn!("no stored credentials for shop {}", shop_domain);
            return None;
        }
        Err(e) => {
            warn!("could not read shopify credentials: {}", e);
            return None;
        }
    };
    match store.decrypt_token(&record) {
        Ok(token) => Some((token, record.granted_scopes)),
        Err(e) => {
            warn!("could not decrypt shopify token: {}", e);
            None
        }
    }
}

async fn serve(config: Config, bind: Option<String>, port: Option<u16>) -> Result<()> {
    let llm = build_llm(&config)?;

    let secret = config.server.secret_key.clone().unwrap_or_else(|| {
        warn!("server.secret_key is not set; using an ephemeral secret");
        uuid::Uuid::new_v4().to_string()
    });

    let registry = Arc::new(ToolRegistry::new(Some(llm.clone())));
    registry.register_general_tools().await;

    let searcher = Arc::new(SchemaSearcher::new(llm.client()));
    let mut monitor = AvailabilityMonitor::new(DEFAULT_CHECK_INTERVAL);
    let mut orchestrators = HashMap::new();

    // Slack indexer first, so the Slack adapter can route semantic
    // search through it.
    let mut indexer = None;
    let mut workspaces = None;
    if let (Some(slack), Some(vector_db)) = (&config.slack, &config.vector_db) {
        if let Some(mcp_url) = &slack.mcp_url {
            let store = Arc::new(
                WorkspaceStore::open(&Config::state_dir()?.join("datagate.db")).await?,
            );
            let vectors: Arc<dyn VectorStore> = Arc::new(QdrantRest::new(
                vector_db.rest_url(),
                vector_db.api_key.clone(),
            )?);
            let source = Arc::new(McpHistorySource::new(McpClient::new(mcp_url.clone())?));
            let slack_indexer = Arc::new(SlackIndexer::new(
                Arc::clone(&store),
                source,
                vectors,
                llm.clone(),
                IndexerConfig {
                    history_days: slack.history_days,
                    max_messages_per_channel: slack.max_messages_per_channel,
                    ..Default::default()
                },
            ));

            let tick = Duration::from_secs(u64::from(slack.update_frequency_hours) * 3600);
            tokio::spawn(datagate::indexer::run_scheduler(
                Arc::clone(&slack_indexer),
                tick,
            ));
            indexer = Some(slack_indexer);
            workspaces = Some(store);
            info!("slack indexer scheduled every {}h", slack.update_frequency_hours);
        }
    }

    // The adapter searches the first registered workspace's index.
    let message_search: Option<Arc<dyn MessageSearch>> = match (&indexer, &workspaces) {
        (Some(slack_indexer), Some(store)) => store
            .list_workspace_ids()
            .await?
            .first()
            .map(|&workspace_id| {
                Arc::new(WorkspaceSearcher::new(Arc::clone(slack_indexer), workspace_id))
                    as Arc<dyn MessageSearch>
            }),
        _ => None,
    };

    // Best-effort backend wiring: a backend that is down at startup is
    // monitored as offline rather than failing the whole process.
    for kind in configured_backends(&config) {
        let search = if kind == BackendKind::Slack {
            message_search.clone()
        } else {
            None
        };
        match connect_backend_with(&config, kind, &llm, search).await {
            Ok(orchestrator) => {
                registry.register_adapter_tools(orchestrator.adapter()).await;
                searcher
                    .register_source(kind.as_str(), Arc::clone(&orchestrator) as _)
                    .await;
                monitor.add_backend(kind.as_str(), orchestrator.adapter());
                orchestrators.insert(kind.as_str().to_string(), orchestrator);
                info!("backend '{}' connected", kind);
            }
            Err(e) => warn!("backend '{}' not connected at startup: {}", kind, e),
        }
    }

    let monitor = Arc::new(monitor);
    tokio::spawn(Arc::clone(&monitor).run());

    let sink = Arc::new(MemorySink::new());
    let node = Arc::new(ExecutionNode::new(
        Arc::clone(&registry),
        Some(llm.clone()),
        sink,
    ));

    let state = Arc::new(AppState {
        llm,
        registry,
        node,
        searcher,
        indexer,
        workspaces,
        jwt: JwtIssuer::new(&secret),
        cipher: TokenCipher::new(&secret),
        sessions: Arc::new(SessionTable::new()),
        monitor,
        orchestrators: tokio::sync::RwLock::new(orchestrators),
        config,
    });

    let bind = bind.unwrap_or_else(|| state.config.server.bind.clone());
    let port = port.unwrap_or(state.config.server.port);
    let address = format!("{bind}:{port}");
    info!("listening on {}", address);

    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| GatewayError::config(format!("cannot bind {address}: {e}")))?;
    axum::serve(listener, build_router(state))
        .await
        .map_err(|e| GatewayError::internal(format!("server failed: {e}")))
}

async fn query(
    config: Config,
    question: String,
    db_type: Option<String>,
    uri: Option<String>,
    analyze: bool,
    orchestrate: bool,
) -> Result<()> {
    let llm = build_llm(&config)?;

    if orchestrate {
        let registry = Arc::new(ToolRegistry::new(Some(llm.clone())));
        registry.register_general_tools().await;
        for kind in configured_backends(&config) {
            match connect_backend(&config, kind, &llm).await {
                Ok(orchestrator) => {
                    registry.register_adapter_tools(orchestrator.adapter()).await
                }
                Err(e) => warn!("backend '{}' unavailable: {}", kind, e),
            }
        }
        let node = ExecutionNode::new(registry, Some(llm), Arc::new(MemorySink::new()));
        let outcome = node.execute(&question).await?;
        println!("{}", outcome.synthesis);
        return Ok(());
    }

    let db_type = db_type
        .or_else(|| config.default_database.clone())
        .ok_or_else(|| GatewayError::config("no db_type given and no default_database configured"))?;
    let kind = BackendKind::parse(&db_type)
        .ok_or_else(|| GatewayError::config(format!("unsupported database type: {db_type}")))?;

    let orchestrator = match uri {
        Some(uri) => {
            let mut opts = ConnectOptions::from_config(&config);
            opts.db_type = Some(kind.as_str().to_string());
            Orchestrator::connect(&uri, opts, llm.clone()).await?
        }
        None => {
            return match connect_backend(&config, kind, &llm).await {
                Ok(orchestrator) => run_question(&orchestrator, &llm, &question, analyze).await,
                Err(e) => Err(e),
            };
        }
    };
    run_question(&orchestrator, &llm, &question, analyze).await
}

async fn run_question(
    orchestrator: &Orchestrator,
    llm: &LlmService,
    question: &str,
    analyze: bool,
) -> Result<()> {
    let (query, rows) = orchestrator.run(question, &QueryOptions::default()).await?;
    println!("Query: {}", query.display());
    println!(
        "{}",
        serde_json::to_string_pretty(&rows)
            .unwrap_or_else(|_| "<unserializable rows>".to_string())
    );

    if analyze {
        let row_values: Vec<serde_json::Value> = rows
            .iter()
            .map(|row| serde_json::Value::Object(row.clone()))
            .collect();
        let narrative = llm.analyze_results(question, &row_values).await?;
        println!("\n{narrative}");
    }
    Ok(())
}

async fn test_connection(config: Config, db_type: Option<String>, all: bool) -> Result<()> {
    let llm = build_llm(&config)?;

    let kinds = if all {
        configured_backends(&config)
    } else {
        let db_type = db_type
            .or_else(|| config.default_database.clone())
            .ok_or_else(|| GatewayError::config("pass --db-type or --all"))?;
        vec![BackendKind::parse(&db_type)
            .ok_or_else(|| GatewayError::config(format!("unsupported database type: {db_type}")))?]
    };

    let mut any_failed = false;
    for kind in kinds {
        let status = match connect_backend(&config, kind, &llm).await {
            Ok(orchestrator) => orchestrator.test_connection().await,
            Err(e) => {
                warn!("{}: {}", kind, e);
                false
            }
        };
        println!("{kind}: {}", if status { "online" } else { "offline" });
        any_failed |= !status;
    }

    if any_failed {
        return Err(GatewayError::backend("one or more backends are unreachable"));
    }
    Ok(())
}

async fn index(config: Config, workspace: i64, force_full: bool) -> Result<()> {
    let slack = config
        .slack
        .clone()
        .ok_or_else(|| GatewayError::config("slack section is not configured"))?;
    let mcp_url = slack
        .mcp_url
        .clone()
        .ok_or_else(|| GatewayError::config("slack.mcp_url is not configured"))?;
    let vector_db = config
        .vector_db
        .clone()
        .ok_or_else(|| GatewayError::config("vector_db section is not configured"))?;

    let llm = build_llm(&config)?;
    let store = Arc::new(WorkspaceStore::open(&Config::state_dir()?.join("datagate.db")).await?);
    let vectors: Arc<dyn VectorStore> =
        Arc::new(QdrantRest::new(vector_db.rest_url(), vector_db.api_key.clone())?);
    let source = Arc::new(McpHistorySource::new(McpClient::new(mcp_url)?));

    let indexer = SlackIndexer::new(
        store,
        source,
        vectors,
        llm,
        IndexerConfig {
            history_days: slack.history_days,
            max_messages_per_channel: slack.max_messages_per_channel,
            ..Default::default()
        },
    );

    let summary = indexer.process_workspace(workspace, force_full).await?;
    if summary.skipped {
        println!("workspace {workspace}: another worker holds the indexing lease");
    } else {
        println!(
            "workspace {workspace}: indexed {} messages across {} channels",
            summary.indexed_messages, summary.channels_processed
        );
    }
    Ok(())
}
