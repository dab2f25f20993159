//! `/api/stats` and `/api/stream` (spec §6, §4.7): point-in-time throughput
//! snapshot and the SSE feed that carries it out live.

use actix_web::{web, HttpRequest, HttpResponse};
use futures::{stream, StreamExt};
use serde::Serialize;

use splitvpn_core::stats::StatsSnapshot;

use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::state::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/stats", web::get().to(stats))
        .route("/api/stream", web::get().to(stream_updates));
}

#[derive(Debug, Serialize)]
struct SnapshotView {
    by_interface: std::collections::HashMap<String, InterfaceView>,
    corrected_rx_bps: f64,
    corrected_tx_bps: f64,
}

#[derive(Debug, Serialize)]
struct InterfaceView {
    rx_bytes: u64,
    tx_bytes: u64,
    rx_bps: f64,
    tx_bps: f64,
}

fn view(snapshot: StatsSnapshot) -> SnapshotView {
    SnapshotView {
        by_interface: snapshot
            .by_interface
            .into_iter()
            .map(|(name, sample)| {
                (
                    name,
                    InterfaceView {
                        rx_bytes: sample.rx_bytes,
                        tx_bytes: sample.tx_bytes,
                        rx_bps: sample.rx_bps,
                        tx_bps: sample.tx_bps,
                    },
                )
            })
            .collect(),
        corrected_rx_bps: snapshot.corrected_rx_bps,
        corrected_tx_bps: snapshot.corrected_tx_bps,
    }
}

async fn stats(state: web::Data<AppState>, _user: AuthUser) -> Result<HttpResponse, ApiError> {
    let interfaces = state.tracked_interfaces().await;
    let snapshot = state.stats.poll(&interfaces).await;
    Ok(HttpResponse::Ok().json(view(snapshot)))
}

/// Streams the default `message` event (a JSON `{stats, latency, configs,
/// errors}` payload) on every `pollInterval` tick, plus whatever named
/// events other parts of the app publish through the [`Broadcaster`]
/// (spec §6 "SSE events"). The first frame sent on connect is an immediate
/// `message` snapshot, preceded by a `retry: 5000` directive (spec §4.7 /
/// §6 "Initial payload is sent immediately after connection with a
/// `retry: 5000` directive"). Write timeout is intentionally unbounded.
async fn stream_updates(state: web::Data<AppState>, _req: HttpRequest, _user: AuthUser) -> HttpResponse {
    let payload = state.build_update_payload().await;
    let initial = format!("retry: 5000\n{}\n", sse_data_lines(&payload.to_string()));
    let head = stream::once(async move { Ok::<_, actix_web::Error>(web::Bytes::from(initial)) });

    let watcher = state.broadcaster.subscribe();
    let tail = stream::unfold(watcher, |mut watcher| async move {
        match watcher.receiver.recv().await {
            Some(message) => {
                let frame = format!("{}\n\n", message.to_sse_frame());
                Some((Ok::<_, actix_web::Error>(web::Bytes::from(frame)), watcher))
            }
            None => None,
        }
    });

    HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .insert_header(("X-Accel-Buffering", "no"))
        .streaming(head.chain(tail))
}

fn sse_data_lines(data: &str) -> String {
    data.lines()
        .map(|line| format!("data: {line}\n"))
        .collect::<String>()
}
