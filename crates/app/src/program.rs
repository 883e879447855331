use tracing::info;

use loyalty_core::program::{ProgramConfig, ProgramPatch};

use crate::{context::LoyaltyContext, error::ServiceError};

/// Admin access to the program settings.
#[derive(Clone)]
pub struct ProgramService {
    context: LoyaltyContext,
}

impl ProgramService {
    pub fn new(context: LoyaltyContext) -> Self {
        Self { context }
    }

    pub async fn get(&self) -> Result<ProgramConfig, ServiceError> {
        self.context.program().await
    }

    /// Validates and merges the provided fields.
    pub async fn put(&self, patch: &ProgramPatch) -> Result<ProgramConfig, ServiceError> {
        patch.validate()?;
        let program = self
            .context
            .database()
            .programs()
            .apply_patch(self.context.program_code(), patch, self.context.now())
            .await?;
        info!(
            stage = "program",
            code = %program.code,
            active = program.active,
            "program settings updated"
        );
        Ok(program)
    }

    /// Converts rows of the old settings layout; returns how many were imported.
    pub async fn import_legacy(&self) -> Result<u64, ServiceError> {
        let program = self.context.program().await?;
        let imported = self
            .context
            .database()
            .programs()
            .import_legacy_settings(program.id, self.context.now())
            .await?;
        if imported > 0 {
            info!(stage = "program", code = %program.code, imported, "legacy settings imported");
        }
        Ok(imported)
    }
}
