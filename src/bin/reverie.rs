use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use reverie::admin::{AdminGate, AdminService};
use reverie::chat::plain::PlainServiceFactory;
use reverie::chat::roleplay::RoleplayServiceFactory;
use reverie::chat::ChatServiceFactory;
use reverie::cli::run_cli;
use reverie::config::BotConfig;
use reverie::database::ChatDatabase;
use reverie::hub::{BindingResolver, ChatHub};
use reverie::llm;
use reverie::news::NewsService;
use reverie::onebot::{run_onebot_adapter, OneBotPusher};
use reverie::pusher::{CliPusher, MessagePusher};
use reverie::roles::RoleRegistry;
use reverie::scheduler::SchedulerService;
use reverie::session::SessionStore;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,reverie=debug")),
        )
        .init();

    let config = BotConfig::load();

    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: BotConfig) -> Result<()> {
    let db = Arc::new(
        ChatDatabase::new(&config.database_path)
            .with_context(|| format!("failed to open database at {}", config.database_path))?,
    );
    if let Some(seed_path) = &config.passage_seed_path {
        if let Err(e) = db.seed_passages_from_file(seed_path) {
            tracing::warn!("Passage seeding failed: {:#}", e);
        }
    }

    let roles = Arc::new(RoleRegistry::load(&config.roles_path));
    if roles.is_empty() {
        tracing::warn!("No roles loaded; roleplay sessions cannot be created");
    }

    let default_binding = llm::default_binding(&config)
        .map_err(|e| anyhow::anyhow!("default model binding failed: {}", e))?;
    tracing::info!("Default model binding: {}", default_binding.name());

    let adapter = std::env::args().nth(1).unwrap_or_else(|| "cli".to_string());
    match adapter.as_str() {
        "onebot" => {
            let (frame_tx, frame_rx) = flume::unbounded();
            let pusher = Arc::new(OneBotPusher::new(frame_tx, config.max_chunk_len));
            let (hub, scheduler) = build_hub(
                &config,
                db,
                roles,
                default_binding,
                pusher.clone() as Arc<dyn MessagePusher>,
            );
            scheduler.spawn();
            run_onebot_adapter(hub, &config, frame_rx, pusher).await
        }
        "cli" => {
            let pusher: Arc<dyn MessagePusher> = Arc::new(CliPusher::new());
            let (hub, scheduler) = build_hub(&config, db, roles, default_binding, pusher);
            scheduler.spawn();

            let user_id = std::env::args()
                .nth(2)
                .or_else(|| std::env::var("REVERIE_USER_ID").ok())
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(10001);
            run_cli(hub, user_id).await
        }
        other => anyhow::bail!("unknown adapter '{}' (expected 'cli' or 'onebot')", other),
    }
}

fn build_hub(
    config: &BotConfig,
    db: Arc<ChatDatabase>,
    roles: Arc<RoleRegistry>,
    default_binding: Arc<dyn llm::ModelBinding>,
    pusher: Arc<dyn MessagePusher>,
) -> (ChatHub, Arc<SchedulerService>) {
    let news = Arc::new(NewsService::new(config.clone()));
    let scheduler = Arc::new(SchedulerService::new(
        news,
        pusher,
        db.clone(),
        config.schedule.clone(),
    ));
    let admin = Arc::new(AdminService::new(
        AdminGate::new(config.admin_user_ids.clone()),
        scheduler.clone(),
        roles.clone(),
    ));

    let factories: Vec<Arc<dyn ChatServiceFactory>> = vec![
        Arc::new(RoleplayServiceFactory::new(roles.clone(), db.clone())),
        Arc::new(PlainServiceFactory::new(db)),
    ];

    let resolver: BindingResolver = {
        let config = config.clone();
        Arc::new(move |name| llm::resolve_binding(name, &config))
    };

    let store = SessionStore::load(&config.user_store_path);
    let hub = ChatHub::new(
        store,
        factories,
        roles,
        admin,
        default_binding,
        resolver,
        Duration::from_secs(config.reply_timeout_secs),
    );
    (hub, scheduler)
}
