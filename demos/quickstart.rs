use anyhow::Result;
use screen_operator::events::{channel, ReadingPacer};
use screen_operator::{Agent, AgentEvent, AnthropicClient, Browser, RunHooks, Session, Settings};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut settings = Settings::from_env()?;
    settings.browser.headless = false;

    let browser = Arc::new(Browser::start(settings.browser.clone()).await?);
    let start = std::env::args().nth(1).unwrap_or_else(|| "https://example.com".into());
    browser.goto(&start).await?;

    let client = AnthropicClient::new(settings.reasoning.clone())?;
    let agent = Agent::new(browser.clone(), client.clone(), client, settings.agent.clone());

    let (sink, mut events) = channel();
    let printer = tokio::spawn(async move {
        while let Some(ev) = events.recv().await {
            match ev {
                AgentEvent::Token { content } => print!("{content}"),
                AgentEvent::ToolStart { content } => println!("\n[{content}]"),
                AgentEvent::Screenshot { content } => println!("[screenshot, {} bytes b64]", content.len()),
                _ => {}
            }
        }
    });

    let mut session = Session::new("quickstart", start.as_str());
    let hooks = RunHooks::new(sink, ReadingPacer::default());
    let cancel = CancellationToken::new();
    let reply = agent
        .respond(&mut session, "Give me a quick tour of this page.", &hooks, &cancel)
        .await;
    drop(hooks);
    printer.await?;

    println!("\n---\n{reply}\nended on {}", browser.url().await?);
    Ok(())
}
