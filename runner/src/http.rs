use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpResponse, HttpServer, Responder};
use tracing::{error, info};

use common::config::Settings;

use crate::supervisor::RestartFlags;

/// Handle to the HTTP server thread; stopping is advisory (the thread is
/// torn down with the process).
pub struct HttpServerHandle {
    stop_handle: actix_web::dev::ServerHandle,
}

impl HttpServerHandle {
    pub fn stop(&self) {
        let handle = self.stop_handle.clone();
        std::thread::spawn(move || {
            actix_web::rt::System::new().block_on(handle.stop(true));
        });
    }
}

/// `GET /restart_replication`: ask the supervisor to stop the per-DB
/// workers, wipe their state and respawn them; responds once the restart
/// has been observed.
async fn restart_replication(flags: web::Data<RestartFlags>) -> impl Responder {
    flags.replication_restarted.store(false, Ordering::SeqCst);
    flags.need_restart_replication.store(true, Ordering::SeqCst);
    while !flags.replication_restarted.load(Ordering::SeqCst) {
        info!("waiting replication restarted..");
        actix_web::rt::time::sleep(Duration::from_secs(1)).await;
    }
    HttpResponse::Ok().json(serde_json::json!({ "restarted": true }))
}

/// Start the restart endpoint on a dedicated thread when configured.
pub fn spawn_http_server(
    config: &Settings,
    flags: Arc<RestartFlags>,
) -> Option<HttpServerHandle> {
    if config.http_host.is_empty() || config.http_port == 0 {
        info!("http server disabled");
        return None;
    }
    info!(
        "starting http server on {}:{}",
        config.http_host, config.http_port
    );

    let host = config.http_host.clone();
    let port = config.http_port;
    let (handle_tx, handle_rx) = std::sync::mpsc::channel();

    std::thread::spawn(move || {
        let system = actix_web::rt::System::new();
        system.block_on(async move {
            let data = web::Data::from(flags);
            let server = HttpServer::new(move || {
                App::new().app_data(data.clone()).route(
                    "/restart_replication",
                    web::get().to(restart_replication),
                )
            })
            .workers(1)
            .bind((host.as_str(), port));
            match server {
                Ok(server) => {
                    let server = server.run();
                    let _ = handle_tx.send(server.handle());
                    if let Err(err) = server.await {
                        error!("http server error: {}", err);
                    }
                }
                Err(err) => {
                    error!("failed to bind http server: {}", err);
                }
            }
        });
    });

    handle_rx
        .recv_timeout(Duration::from_secs(5))
        .ok()
        .map(|stop_handle| HttpServerHandle { stop_handle })
}
