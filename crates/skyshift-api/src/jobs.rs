//! Job side paths: log aggregation and exec
//!
//! Logs fan out to every cluster holding a slice of the job through the
//! compatibility layer. Exec bridges a WebSocket to an attach-style
//! session on the first cluster holding replicas.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::Json;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use skyshift_common::object::{Action, Job, Kind, Object};
use skyshift_common::Error;
use skyshift_manager::{setup_cluster_manager, ExecSession};

use crate::auth::AuthUser;
use crate::authorize::authorize;
use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Query parameters of the exec endpoint
#[derive(Debug, Deserialize)]
pub struct ExecQuery {
    /// Command to run, shell-split on whitespace
    pub command: String,
    /// Allocate a TTY
    #[serde(default)]
    pub tty: bool,
}

async fn fetch_job(state: &AppState, namespace: &str, name: &str) -> ApiResult<Job> {
    let obj = state.store.get(Kind::Job, Some(namespace), name).await?;
    match obj {
        Object::Job(job) => Ok(job),
        _ => Err(ApiError(Error::fatal("api", "job key held a non-job object"))),
    }
}

/// `GET /{namespace}/jobs/{name}/logs`: aggregate logs across every
/// cluster holding a slice
pub async fn job_logs(
    state: AppState,
    auth: AuthUser,
    namespace: String,
    name: String,
) -> ApiResult<Json<Vec<String>>> {
    authorize(
        &state.store,
        &auth.username,
        Action::Get,
        Kind::Job,
        Some(&namespace),
    )
    .await?;
    let job = fetch_job(&state, &namespace, &name).await?;

    let mut total_logs = Vec::new();
    for cluster_name in job.scheduled_clusters() {
        let cluster = match state.store.get(Kind::Cluster, None, &cluster_name).await {
            Ok(Object::Cluster(cluster)) => cluster,
            Ok(_) | Err(_) => {
                warn!(cluster = %cluster_name, "skipping logs for unknown cluster");
                continue;
            }
        };
        let manager = setup_cluster_manager(&cluster).await?;
        match manager.job_logs(&job).await {
            Ok(mut logs) => total_logs.append(&mut logs),
            Err(err) if err.is_unsupported() => {
                total_logs.push(format!("[{cluster_name}] logs unsupported by backend"));
            }
            Err(err) => {
                warn!(cluster = %cluster_name, error = %err, "log fetch failed");
                total_logs.push(format!("[{cluster_name}] log fetch failed: {err}"));
            }
        }
    }
    Ok(Json(total_logs))
}

/// `GET /{namespace}/exec/{name}` (WebSocket): attach to one task
pub async fn exec_job(
    state: AppState,
    auth: AuthUser,
    namespace: String,
    name: String,
    query: ExecQuery,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    authorize(
        &state.store,
        &auth.username,
        Action::Exec,
        Kind::Job,
        Some(&namespace),
    )
    .await?;
    let job = fetch_job(&state, &namespace, &name).await?;

    let cluster_name = job
        .scheduled_clusters()
        .into_iter()
        .next()
        .ok_or_else(|| ApiError(Error::not_found(format!("job '{name}' has no replicas yet"))))?;
    let cluster = match state.store.get(Kind::Cluster, None, &cluster_name).await? {
        Object::Cluster(cluster) => cluster,
        _ => return Err(ApiError(Error::fatal("api", "cluster key held a non-cluster"))),
    };

    let command: Vec<String> = query.command.split_whitespace().map(String::from).collect();
    if command.is_empty() {
        return Err(ApiError(Error::invalid("Job", "exec requires a command")));
    }

    let manager = setup_cluster_manager(&cluster).await?;
    let session = manager.exec(&job, command, query.tty).await?;
    Ok(ws.on_upgrade(move |socket| bridge(socket, session)))
}

/// Pump bytes both ways until either side closes
async fn bridge(socket: WebSocket, session: ExecSession) {
    let ExecSession {
        mut stdin,
        mut stdout,
    } = session;
    let (mut sink, mut stream) = socket.split();

    let to_client = tokio::spawn(async move {
        let mut buffer = [0u8; 4096];
        loop {
            match stdout.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let chunk = buffer[..n].to_vec();
                    if sink.send(Message::Binary(chunk.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let to_task = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            let bytes = match message {
                Message::Binary(data) => data.to_vec(),
                Message::Text(text) => text.as_bytes().to_vec(),
                Message::Close(_) => break,
                _ => continue,
            };
            if stdin.write_all(&bytes).await.is_err() {
                break;
            }
            let _ = stdin.flush().await;
        }
    });

    let _ = to_client.await;
    to_task.abort();
    debug!("exec bridge closed");
}
