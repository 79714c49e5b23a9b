//! Flash command - OTA firmware reflash

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use indicatif::{ProgressBar, ProgressStyle};
use reflash_uds::config::ClientConfig;
use reflash_uds::ota::OtaFlasher;
use reflash_uds::uds::UdsClient;
use reflash_uds::worker;

use crate::output::OutputContext;

/// Flash a firmware image through the full reflash sequence
pub async fn flash(
    client: Arc<UdsClient>,
    config: &ClientConfig,
    file_path: &Path,
    ctx: &OutputContext,
) -> Result<()> {
    // Read firmware file
    ctx.info(&format!("Reading firmware from {}...", file_path.display()));
    let firmware = std::fs::read(file_path)
        .with_context(|| format!("Failed to read firmware file: {}", file_path.display()))?;
    let image = Bytes::from(firmware);
    ctx.info(&format!("Firmware size: {} bytes", image.len()));

    let flasher = OtaFlasher::new(client.clone(), config)?;

    // Create progress bar
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );
    pb.set_message("Flashing...");

    // Subscribe before the run starts so no event is missed.
    let mut events = client.channel().events().subscribe();
    let handle = worker::submit(move |cancel| async move { flasher.run(image, &cancel).await });

    // Ctrl-C requests cooperative cancellation; the run stops at the
    // next step boundary.
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
                    ctx.render_event(&event, Some(&pb));
                }
            }
        }
    };
    while let Ok(event) = events.try_recv() {
        ctx.render_event(&event, Some(&pb));
    }

    match result.context("Flash task panicked")? {
        Ok(()) => {
            pb.finish_with_message("Complete!");
            ctx.success("\nFirmware update completed successfully");
            Ok(())
        }
        Err(e) => {
            pb.finish_with_message("Flash failed!");
            Err(e.into())
        }
    }
}
