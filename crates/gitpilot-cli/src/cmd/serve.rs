use anyhow::Context as _;
use gitpilot_core::config::Config;
use gitpilot_core::Coordinator;
use gitpilot_server::auth::AccessConfig;
use std::path::Path;

pub struct ServeArgs {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
    pub max_concurrent: Option<usize>,
    pub open: bool,
}

pub fn run(root: &Path, args: ServeArgs) -> anyhow::Result<()> {
    let ServeArgs {
        host,
        port,
        token,
        max_concurrent,
        open,
    } = args;
    let mut config = Config::load(root).context("failed to load config")?;
    if let Some(n) = max_concurrent {
        config.queue.max_concurrent = n;
    }
    let access = match token.filter(|t| !t.is_empty()) {
        Some(token) => AccessConfig::with_token(token),
        None => AccessConfig::local_only(),
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        // Construct inside the runtime: the lock table spawns watchdogs on it.
        let coordinator = Coordinator::from_config(&config, root)?;
        tracing::info!(root = %root.display(), host = %host, "starting gitpilot");
        gitpilot_server::serve(coordinator, &host, port, access, open).await
    })
}
