use crate::gui_bridge::model::DashboardModel;
use anyhow::{Context, Result};
use groundlink::diagnostics::LinkMetrics;
use groundlink::network::ConnectionState;
use groundlink::packets::FusedRecord;
use groundlink::LinkResult;
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;
use std::{
    net::SocketAddr,
    sync::{Arc, RwLock},
};
use tokio::task::JoinHandle;
use warp::{http::StatusCode, Filter};

/// Requests the dashboard can make of the radio.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeCommand {
    Raw(String),
    Abort,
}

pub type CommandSink = Arc<dyn Fn(BridgeCommand) -> LinkResult<()> + Send + Sync>;

#[derive(Debug, Deserialize)]
struct CommandBody {
    command: String,
}

/// HTTP endpoint the graphical shell polls for records and link state.
#[derive(Clone)]
pub struct GuiBridge {
    state: Arc<RwLock<DashboardModel>>,
    metrics: Arc<LinkMetrics>,
    commands: CommandSink,
}

impl GuiBridge {
    pub fn new(metrics: Arc<LinkMetrics>, commands: CommandSink) -> Self {
        Self {
            state: Arc::new(RwLock::new(DashboardModel::default())),
            metrics,
            commands,
        }
    }

    pub fn publish_record(&self, record: &FusedRecord) {
        if let Ok(mut model) = self.state.write() {
            model.apply_record(record);
        }
    }

    pub fn publish_state(&self, state: ConnectionState) {
        if let Ok(mut model) = self.state.write() {
            model.apply_state(state);
        }
        info!("[GUI] partner link {}", state);
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> DashboardModel {
        self.state.read().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn routes(
        &self,
    ) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone + Send + Sync + 'static
    {
        let record_state = self.state.clone();
        let record_route = warp::path("record")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                let latest = record_state.read().ok().and_then(|m| m.latest.clone());
                match latest {
                    Some(record) => {
                        warp::reply::with_status(warp::reply::json(&record), StatusCode::OK)
                    }
                    None => warp::reply::with_status(
                        warp::reply::json(&json!({"status": "no record yet"})),
                        StatusCode::NOT_FOUND,
                    ),
                }
            });

        let status_state = self.state.clone();
        let metrics = self.metrics.clone();
        let status_route = warp::path("status")
            .and(warp::path::end())
            .and(warp::get())
            .map(move || {
                let model = status_state.read().map(|m| m.clone()).unwrap_or_default();
                warp::reply::with_status(
                    warp::reply::json(&model.status(metrics.snapshot())),
                    StatusCode::OK,
                )
            });

        let command_sink = self.commands.clone();
        let command_route = warp::path("command")
            .and(warp::path::end())
            .and(warp::post())
            .and(warp::body::json())
            .and_then(move |body: CommandBody| {
                let sink = command_sink.clone();
                async move {
                    Ok::<_, warp::Rejection>(dispatch(sink, BridgeCommand::Raw(body.command)).await)
                }
            });

        let abort_sink = self.commands.clone();
        let abort_route = warp::path("abort")
            .and(warp::path::end())
            .and(warp::post())
            .and_then(move || {
                let sink = abort_sink.clone();
                async move { Ok::<_, warp::Rejection>(dispatch(sink, BridgeCommand::Abort).await) }
            });

        record_route
            .or(status_route)
            .unify()
            .or(command_route)
            .unify()
            .or(abort_route)
            .unify()
    }

    /// Binds the bridge and serves it on the current runtime.
    pub fn spawn(&self, addr: SocketAddr) -> Result<(SocketAddr, JoinHandle<()>)> {
        let (bound, server) = warp::serve(self.routes())
            .try_bind_ephemeral(addr)
            .with_context(|| format!("binding GUI bridge on {}", addr))?;
        info!("[GUI] bridge listening on http://{}", bound);
        Ok((bound, tokio::spawn(server)))
    }
}

/// Runs the sink on the blocking pool; serial writes block.
async fn dispatch(
    sink: CommandSink,
    command: BridgeCommand,
) -> warp::reply::WithStatus<warp::reply::Json> {
    let attempted = command.clone();
    let outcome = match tokio::task::spawn_blocking(move || sink(command)).await {
        Ok(result) => result.map_err(|err| err.to_string()),
        Err(err) => Err(err.to_string()),
    };
    match outcome {
        Ok(()) => warp::reply::with_status(
            warp::reply::json(&json!({"status": "ok"})),
            StatusCode::OK,
        ),
        Err(reason) => {
            warn!("[GUI] command {:?} failed: {}", attempted, reason);
            warp::reply::with_status(
                warp::reply::json(&json!({"status": "error", "reason": reason})),
                StatusCode::SERVICE_UNAVAILABLE,
            )
        }
    }
}
