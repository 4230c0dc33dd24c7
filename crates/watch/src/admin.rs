use admin_ipc::{AdminRequest, AdminResponse, AdminStatus};
use anyhow::{bail, Result};
use tracing::info;

use crate::gate::{GateState, WatchGate};
use crate::status::StatusRegistry;

/// Handler for [`admin_ipc::run_server`]. Unknown target ids are rejected.
pub fn admin_handler(
    run_id: String,
    gate: WatchGate,
    status: StatusRegistry,
) -> impl Fn(AdminRequest) -> Result<AdminResponse> + Send + Sync + 'static {
    move |request| match request {
        AdminRequest::Status => Ok(AdminResponse::Status(AdminStatus {
            run_id: run_id.clone(),
            paused: gate.status() == GateState::Paused,
            targets: status.snapshot(&gate),
        })),
        AdminRequest::Pause { target } => {
            check_known(&status, target.as_deref())?;
            gate.pause(target.as_deref());
            info!(target_id = target.as_deref().unwrap_or("*"), "paused via admin socket");
            Ok(AdminResponse::Ack)
        }
        AdminRequest::Resume { target } => {
            check_known(&status, target.as_deref())?;
            gate.resume(target.as_deref());
            info!(target_id = target.as_deref().unwrap_or("*"), "resumed via admin socket");
            Ok(AdminResponse::Ack)
        }
    }
}

fn check_known(status: &StatusRegistry, target: Option<&str>) -> Result<()> {
    match target {
        Some(id) if !status.contains(id) => bail!("unknown target `{id}`"),
        _ => Ok(()),
    }
}
