//! Actix Web server exposing the WebSocket rooms, the MJPEG fallback stream,
//! channel status and Prometheus metrics.
//!
//! The server runs on a dedicated thread so the capture and emit loops never
//! share a runtime with HTTP handling.

use std::{net::SocketAddr, sync::Arc, thread, time::Duration};

use actix_web::{
    App, HttpRequest, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use actix_ws::{Message, MessageStream, Session};
use anyhow::{Context, Result, anyhow};
use async_stream::stream;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    oneshot,
};
use tracing::{debug, error, info, warn};

use crate::{
    channel::{Channel, ChannelStatus},
    control::{ClientMessage, ServerMessage, set_quality_level},
    fallback::{BOUNDARY, spawn_fallback_stream},
    pipeline::RelayContext,
    telemetry,
    transport::RelayEvent,
};

/// How often an idle socket re-checks that its channel is still active.
const SOCKET_LIVENESS: Duration = Duration::from_secs(1);

/// Handle for the server thread.
#[derive(Default)]
pub struct RelayServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
    addrs: Vec<SocketAddr>,
}

impl RelayServer {
    /// Addresses the server is listening on.
    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Signal the server to stop and block until the thread exits.
    pub fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

/// Register every route on `cfg`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/socket/{channel}", web::get().to(socket_route))
        .route("/video_feed", web::get().to(video_feed_route))
        .route("/status", web::get().to(status_route))
        .route("/metrics", web::get().to(metrics_route));
}

/// Bind the server and run it on its own thread.
pub fn spawn_server(context: Arc<RelayContext>) -> Result<RelayServer> {
    let host = context.config.host.clone();
    let port = context.config.port;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (bound_tx, bound_rx) = oneshot::channel::<std::io::Result<Vec<SocketAddr>>>();

    let handle = telemetry::spawn_thread("relay-http-server", move || {
        let data = web::Data::from(context);
        let result = actix_web::rt::System::new().block_on(async move {
            let bound = HttpServer::new(move || App::new().app_data(data.clone()).configure(configure))
                .shutdown_timeout(2)
                .bind((host.as_str(), port));
            let server = match bound {
                Ok(server) => {
                    let _ = bound_tx.send(Ok(server.addrs()));
                    server.run()
                }
                Err(err) => {
                    let _ = bound_tx.send(Err(err));
                    return Ok(());
                }
            };

            let srv_handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = shutdown_rx.await;
                srv_handle.stop(true).await;
            });

            server.await
        });
        if let Err(err) = result {
            error!("HTTP server error: {err}");
        }
    })
    .context("Failed to spawn HTTP server thread")?;

    let addrs = match bound_rx.blocking_recv() {
        Ok(Ok(addrs)) => addrs,
        Ok(Err(err)) => {
            let _ = handle.join();
            return Err(err).context("Failed to bind HTTP server");
        }
        Err(_) => {
            let _ = handle.join();
            return Err(anyhow!("HTTP server thread exited before binding"));
        }
    };
    for addr in &addrs {
        info!("Listening on http://{addr}");
    }

    Ok(RelayServer {
        shutdown: Some(shutdown_tx),
        handle: Some(handle),
        addrs,
    })
}

/// Upgrade to a WebSocket subscribed to one channel's room.
async fn socket_route(
    req: HttpRequest,
    body: web::Payload,
    path: web::Path<String>,
    context: web::Data<RelayContext>,
) -> actix_web::Result<HttpResponse> {
    let channel_id = path.into_inner();
    let Some(channel) = context.registry.get(&channel_id) else {
        return Ok(HttpResponse::NotFound().body(format!("unknown channel {channel_id}")));
    };

    let (response, session, messages) = actix_ws::handle(&req, body)?;
    let events = context.hub.subscribe(&channel_id);
    actix_web::rt::spawn(serve_socket(channel, session, messages, events));
    Ok(response)
}

async fn serve_socket(
    channel: Arc<Channel>,
    mut session: Session,
    mut messages: MessageStream,
    mut events: broadcast::Receiver<RelayEvent>,
) {
    let quality = channel.lock().quality;
    let ack = ServerMessage::ConnectionAck {
        camera: channel.id(),
        quality,
    };
    if session.text(ack.to_json()).await.is_err() {
        return;
    }
    info!("Subscriber joined {}", channel.id());

    let mut liveness = actix_web::rt::time::interval(SOCKET_LIVENESS);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(RelayEvent::Frame(jpeg)) => {
                    if session.binary(jpeg).await.is_err() {
                        break;
                    }
                }
                Ok(RelayEvent::Detections(value)) => {
                    if session.text(ServerMessage::Detections(&value).to_json()).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Subscriber lagging, skipped {skipped} events");
                }
                Err(RecvError::Closed) => break,
            },
            message = messages.recv() => match message {
                Some(Ok(Message::Text(text))) => match ClientMessage::parse(&text) {
                    Ok(ClientMessage::QualityAdjustment { level }) => {
                        let ack = set_quality_level(&channel, &level);
                        if session.text(ServerMessage::QualityUpdated(ack).to_json()).await.is_err() {
                            break;
                        }
                    }
                    Ok(ClientMessage::Unsupported(event)) => debug!("Ignoring client event {event}"),
                    Err(err) => debug!("Ignoring malformed client message: {err}"),
                },
                Some(Ok(Message::Ping(bytes))) => {
                    if session.pong(&bytes).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(reason))) => {
                    let _ = session.close(reason).await;
                    info!("Subscriber left {}", channel.id());
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("WebSocket protocol error: {err}");
                    break;
                }
                None => break,
            },
            _ = liveness.tick() => {
                if !channel.is_active() {
                    break;
                }
            }
        }
    }

    let _ = session.close(None).await;
    info!("Subscriber left {}", channel.id());
}

/// Stream the single-client MJPEG fallback over a multipart response.
async fn video_feed_route(context: web::Data<RelayContext>) -> HttpResponse {
    let spawned = spawn_fallback_stream(
        context.acquirer.clone(),
        &context.config.source_uri,
        context.config.fallback.clone(),
        context.shutdown.clone(),
    );
    let mut chunks = match spawned {
        Ok(chunks) => chunks,
        Err(err) => {
            error!("Failed to start fallback stream: {err:#}");
            return HttpResponse::InternalServerError().body("failed to start stream");
        }
    };

    let stream = stream! {
        while let Some(chunk) = chunks.recv().await {
            yield Ok::<Bytes, actix_web::Error>(chunk);
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header((header::CACHE_CONTROL, "no-cache"))
        .content_type(format!("multipart/x-mixed-replace; boundary={BOUNDARY}"))
        .streaming(stream)
}

async fn status_route(context: web::Data<RelayContext>) -> HttpResponse {
    let statuses: Vec<ChannelStatus> = context
        .registry
        .all()
        .iter()
        .map(|channel| channel.status(context.hub.subscriber_count(channel.id())))
        .collect();
    HttpResponse::Ok().json(statuses)
}

async fn metrics_route() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

#[cfg(test)]
mod tests {
    use actix_web::{http::StatusCode, test};
    use serde_json::Value;

    use super::*;
    use crate::{config::RelayConfig, test_support::Script};

    fn context() -> Arc<RelayContext> {
        let config = RelayConfig::for_source("rtsp://cam/stream");
        RelayContext::with_acquirer(config, Script::default().acquirer())
    }

    #[actix_web::test]
    async fn status_lists_every_channel() {
        let context = context();
        let _rx = context.hub.subscribe("MainCam");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(context.clone()))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/status").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body[0]["id"], "MainCam");
        assert_eq!(body[0]["quality"], 65);
        assert_eq!(body[0]["connected"], false);
        assert_eq!(body[0]["subscribers"], 1);
    }

    #[actix_web::test]
    async fn unknown_channels_are_not_found() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(context()))
                .configure(configure),
        )
        .await;

        let req = test::TestRequest::get().uri("/socket/Garage").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
