use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use api_types::AddGpuRequest;
use api_types::AddGpuResponse;
use api_types::ErrorResponse;
use api_types::RemoveGpuRequest;
use api_types::RemoveGpuResponse;
use api_types::StatusResponse;
use error_stack::Report;
use poem::handler;
use poem::http::StatusCode;
use poem::web::Data;
use poem::web::Json;
use poem::IntoResponse;
use poem::Response;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::warn;
use utils::version;

use crate::domain::errors::ServiceError;
use crate::domain::orchestrator::GpuMounter;
use crate::domain::reaper::ReaperHandle;
use crate::domain::resource::MountRequest;
use crate::domain::resource::UnmountRequest;

/// Shared by all handlers.
pub struct ApiState {
    pub mounter: Arc<GpuMounter>,
    pub reaper: ReaperHandle,
    pub request_timeout: Duration,
    pub node_name: String,
    pub pool_namespace: String,
}

impl ApiState {
    /// Runs `op` on its own task with a fresh cancellation token.
    ///
    /// The token fires when the deadline passes or when the handler is
    /// dropped because the client went away. The task keeps running until
    /// its rollback is done either way.
    async fn run<F, Fut, T>(&self, op: F) -> Result<T, Report<ServiceError>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, Report<ServiceError>>> + Send + 'static,
        T: Send + 'static,
    {
        let token = CancellationToken::new();
        let _cancel_on_drop = token.clone().drop_guard();
        let mut task = tokio::spawn(op(token.clone()));

        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = tokio::time::sleep(self.request_timeout) => {
                warn!(timeout = ?self.request_timeout, "Request deadline exceeded, cancelling");
                token.cancel();
                task.await
            }
        };
        joined.map_err(|e| Report::new(e).change_context(ServiceError::TaskFailed))?
    }
}

fn error_response(report: Report<ServiceError>) -> Response {
    error!(error = ?report, "Request failed");
    match report.current_context() {
        ServiceError::InvalidRequest { message } => Json(ErrorResponse {
            message: message.clone(),
        })
        .with_status(StatusCode::BAD_REQUEST)
        .into_response(),
        _ => Json(ErrorResponse {
            message: "internal error".to_string(),
        })
        .with_status(StatusCode::INTERNAL_SERVER_ERROR)
        .into_response(),
    }
}

/// Attach GPUs to a pod
#[handler]
pub async fn add_gpu(Json(request): Json<AddGpuRequest>, state: Data<&Arc<ApiState>>) -> Response {
    let mounter = Arc::clone(&state.mounter);
    let request = MountRequest::from(request);
    let outcome = state
        .run(move |token| async move { mounter.add_gpu(&request, &token).await })
        .await;
    match outcome {
        Ok(add_gpu_result) => Json(AddGpuResponse { add_gpu_result }).into_response(),
        Err(report) => error_response(report),
    }
}

/// Detach GPUs from a pod
#[handler]
pub async fn remove_gpu(
    Json(request): Json<RemoveGpuRequest>,
    state: Data<&Arc<ApiState>>,
) -> Response {
    let mounter = Arc::clone(&state.mounter);
    let request = UnmountRequest::from(request);
    let outcome = state
        .run(move |token| async move { mounter.remove_gpu(&request, &token).await })
        .await;
    match outcome {
        Ok(remove_gpu_result) => Json(RemoveGpuResponse { remove_gpu_result }).into_response(),
        Err(report) => error_response(report),
    }
}

#[handler]
pub async fn status(state: Data<&Arc<ApiState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: version::VERSION.to_string(),
        node_name: state.node_name.clone(),
        pool_namespace: state.pool_namespace.clone(),
        reaper: state.reaper.stats(),
    })
}
