//! Diagnostic session control command

use anyhow::{bail, Result};
use reflash_uds::session::{AddressingMode, DiagnosticSession};
use reflash_uds::uds::UdsClient;

use crate::output::OutputContext;

/// Change the diagnostic session
pub async fn session(
    client: &UdsClient,
    session_type: &str,
    functional: bool,
    suppress: bool,
    ctx: &OutputContext,
) -> Result<()> {
    let session = match session_type.to_lowercase().as_str() {
        "default" | "1" | "0x01" => DiagnosticSession::Default,
        "programming" | "2" | "0x02" => DiagnosticSession::Programming,
        "extended" | "3" | "0x03" => DiagnosticSession::Extended,
        _ => bail!(
            "Unknown session type: {}. Valid types: default, programming, extended",
            session_type
        ),
    };
    let mode = if functional {
        AddressingMode::Functional
    } else {
        AddressingMode::Physical
    };

    client.start_session(session, mode, suppress).await?;

    ctx.success(&format!(
        "Session changed to {} (0x{:02X}, {})",
        session,
        session.sub_function(),
        mode
    ));
    Ok(())
}
