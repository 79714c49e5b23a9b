//! Scenario command - automated diagnostic regression run

use std::sync::Arc;

use anyhow::{Context, Result};
use reflash_uds::config::ClientConfig;
use reflash_uds::scenario::ScenarioRunner;
use reflash_uds::uds::UdsClient;
use reflash_uds::worker;

use crate::output::OutputContext;

/// Run the diagnostic scenario, printing its event stream
pub async fn scenario(
    client: Arc<UdsClient>,
    config: &ClientConfig,
    ctx: &OutputContext,
) -> Result<()> {
    let runner = ScenarioRunner::new(client.clone(), config)?;
    if config.scenario.repeat_count < 0 {
        ctx.info("Running scenario until interrupted (Ctrl-C to stop)...");
    } else {
        ctx.info(&format!(
            "Running scenario for {} round(s)...",
            config.scenario.repeat_count
        ));
    }

    let mut events = client.channel().events().subscribe();
    let handle = worker::submit(move |cancel| async move { runner.run(&cancel).await });

    let cancel = handle.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let join = handle.join();
    tokio::pin!(join);
    let result = loop {
        tokio::select! {
            biased;
            res = &mut join => break res,
            event = events.recv() => {
                if let Ok(event) = event {
                    ctx.render_event(&event, None);
                }
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        ctx.render_event(&event, None);
    }

    let rounds = result.context("Scenario task panicked")??;
    ctx.success(&format!("Scenario run complete ({rounds} rounds)"));
    Ok(())
}
