use shared::{
    domain::UnitId,
    error::{ApiError, ErrorCode},
    protocol::{Document, Save, SaveSet, UnitOfWork},
};
use storage::Storage;
use tracing::info;

pub const DEFAULT_MAX_DOCUMENT_BYTES: usize = 2 * 1024 * 1024;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub max_document_bytes: usize,
}

impl ApiContext {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            max_document_bytes: DEFAULT_MAX_DOCUMENT_BYTES,
        }
    }
}

pub async fn get_unit(ctx: &ApiContext, unit_id: UnitId) -> Result<UnitOfWork, ApiError> {
    ctx.storage
        .unit(unit_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| unit_not_found(unit_id))
}

pub async fn fetch_save_set(ctx: &ApiContext, unit_id: UnitId) -> Result<SaveSet, ApiError> {
    ensure_unit_exists(ctx, unit_id).await?;
    ctx.storage.save_set(unit_id).await.map_err(internal)
}

pub async fn create_save(
    ctx: &ApiContext,
    unit_id: UnitId,
    workspace: &Document,
) -> Result<Save, ApiError> {
    if workspace.is_blank() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "workspace document cannot be empty",
        ));
    }
    if workspace.byte_len() > ctx.max_document_bytes {
        return Err(ApiError::new(
            ErrorCode::Validation,
            format!(
                "workspace document exceeds {} bytes",
                ctx.max_document_bytes
            ),
        ));
    }
    ensure_unit_exists(ctx, unit_id).await?;

    let save = ctx
        .storage
        .create_save(unit_id, workspace)
        .await
        .map_err(internal)?;
    info!(
        "saves: created save_id={} unit={} bytes={}",
        save.id.0,
        unit_id.0,
        workspace.byte_len()
    );
    Ok(save)
}

async fn ensure_unit_exists(ctx: &ApiContext, unit_id: UnitId) -> Result<(), ApiError> {
    if ctx.storage.unit_exists(unit_id).await.map_err(internal)? {
        Ok(())
    } else {
        Err(unit_not_found(unit_id))
    }
}

fn unit_not_found(unit_id: UnitId) -> ApiError {
    ApiError::new(
        ErrorCode::NotFound,
        format!("unit {} not found", unit_id.0),
    )
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::new(ErrorCode::Internal, err.to_string())
}
