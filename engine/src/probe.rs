use std::sync::Arc;

use tracing::warn;

use crate::process::ProcessTable;

/// Answers "is a player process running right now?" from the process table.
///
/// Never cached. A failed lookup reads as "not running".
#[derive(Clone)]
pub struct Probe {
    table: Arc<dyn ProcessTable>,
    player: String,
}

impl Probe {
    pub fn new(table: Arc<dyn ProcessTable>, player: impl Into<String>) -> Self {
        Self {
            table,
            player: player.into(),
        }
    }

    pub async fn is_playing(&self) -> bool {
        match self.table.is_running(&self.player).await {
            Ok(found) => found,
            Err(e) => {
                warn!("process probe for '{}' failed, reporting stopped: {e}", self.player);
                false
            }
        }
    }
}
