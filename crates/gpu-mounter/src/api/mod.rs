//! HTTP API of the GPU mounter
//!
//! # API Endpoints
//!
//! - `POST /api/v1/gpus/add` - Attach GPUs to a running pod
//! - `POST /api/v1/gpus/remove` - Detach GPUs from a running pod
//! - `GET /api/v1/status` - Agent version and placeholder reaper counters
//!
//! Domain outcomes (pod not found, insufficient GPU, GPU busy) are answered
//! with `200 OK` and a result code. Internal failures answer `500` with a
//! generic message; the detail only goes to the log.

pub mod errors;
pub mod handlers;
pub mod server;

pub use errors::ApiError;
pub use handlers::ApiState;
pub use server::ApiServer;
