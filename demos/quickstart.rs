use anyhow::Result;
use sandbox_agent::planner::{Planner, PlannerConfig};
use sandbox_agent::recall::NoopMemory;
use sandbox_agent::{
    prompts, BrowserConfig, ChatClient, ChatConfig, ChromiumSandbox, Collaborators, ConversationContext, Lang,
    UiTarsGrounder, WindowLimits,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let sandbox = ChromiumSandbox::launch(BrowserConfig { headless: false, ..Default::default() }).await?;
    sandbox.goto("https://www.bing.com").await?;

    let collab = Collaborators {
        sandbox: Arc::new(sandbox),
        inference: Arc::new(ChatClient::new(ChatConfig::default())?),
        grounder: Arc::new(UiTarsGrounder::default()),
        memory: Arc::new(NoopMemory),
    };

    let instruction = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "Search for the weather in Beijing".to_string());
    let mut ctx = ConversationContext::new(WindowLimits::default());
    ctx.setup_prompt(prompts::system_prompt(Lang::En), None, &[], &instruction);

    let cfg = PlannerConfig { max_steps: 20, lang: Lang::En, ..Default::default() };
    let planner = Planner::new("quickstart", "local", collab, Arc::new(Mutex::new(ctx)), cfg);

    let (tx, mut rx) = mpsc::channel::<sandbox_agent::ProgressEvent>(32);
    let printer = tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            println!("[{:?}] {}", ev.stage, ev.message);
        }
    });
    let report = planner.run(&tx).await;
    drop(tx);
    printer.await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
