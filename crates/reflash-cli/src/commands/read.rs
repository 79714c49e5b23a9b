//! Read command - ReadDataByIdentifier

use anyhow::{Context, Result};
use reflash_uds::config::parse_hex_id_u16;
use reflash_uds::uds::UdsClient;

use crate::output::OutputContext;

/// Read a data identifier and print its payload
pub async fn read(client: &UdsClient, did: &str, ctx: &OutputContext) -> Result<()> {
    let did = parse_hex_id_u16(did).with_context(|| format!("Invalid data identifier: {did}"))?;

    let payload = client.read_data_by_id(did).await?;

    if ctx.quiet {
        println!("{}", hex::encode_upper(&payload));
        return Ok(());
    }

    ctx.info(&format!(
        "DID 0x{:04X}: {} ({} bytes)",
        did,
        hex::encode_upper(&payload),
        payload.len()
    ));
    if payload.iter().all(|b| b.is_ascii_graphic() || *b == b' ') && !payload.is_empty() {
        ctx.info(&format!("  as text: {}", String::from_utf8_lossy(&payload)));
    }
    Ok(())
}
