//! Unlock command - security access

use anyhow::{Context, Result};
use reflash_uds::config::{parse_hex_id, ClientConfig};
use reflash_uds::uds::UdsClient;

use crate::output::OutputContext;

/// Request security access at the given (or configured) level
pub async fn unlock(
    client: &UdsClient,
    config: &ClientConfig,
    level: Option<&str>,
    ctx: &OutputContext,
) -> Result<()> {
    let level = match level {
        Some(raw) => {
            let value =
                parse_hex_id(raw).with_context(|| format!("Invalid security level: {raw}"))?;
            u8::try_from(value).with_context(|| format!("Security level out of range: {raw}"))?
        }
        None => config.security.request_level,
    };

    client.unlock(level).await?;

    ctx.success(&format!("Security access unlocked at level 0x{level:02X}"));
    Ok(())
}
