mod app_state;
mod bulk;
mod config;
mod errors;
mod handlers;
mod migration;
mod models;
mod progress;
mod rate_limit;
mod registry;
mod session;
mod upstream;
mod ws;
#[cfg(test)]
mod tests;

use actix_web::dev::ServerHandle;
use actix_web::{middleware, web, App, HttpServer};
use app_state::AppState;
use bulk::BulkEngine;
use config::Settings;
use migration::MigrationEngine;
use progress::ProgressBus;
use rate_limit::RateLimiter;
use registry::JobRegistry;
use session::SessionStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use upstream::{GitLabApi, GitLabClient, UpstreamClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize logging
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(&settings.logging.level));

    log::info!("Starting Gitfleet Server");
    log::info!("HTTP: http://{}", settings.http_addr());
    log::info!(
        "Pools: bulk_workers={} migration_workers={}",
        settings.pools.bulk_workers,
        settings.pools.migration_workers
    );
    log::info!("Workspace root: {}", settings.workspace_root().display());

    // Explicit init order: limiter -> upstream client -> stores -> engines.
    // No hidden init-on-first-use anywhere.
    let limiter = Arc::new(RateLimiter::new(&settings.rate_limit));
    let upstream_client = Arc::new(UpstreamClient::new(&settings.upstream, limiter.clone())?);
    let api: Arc<dyn GitLabApi> = Arc::new(GitLabClient::new(upstream_client));

    let sessions = Arc::new(SessionStore::new(&settings.session, api.clone()));
    let bus = Arc::new(ProgressBus::new(&settings.jobs));
    let registry = Arc::new(JobRegistry::new(&settings.jobs, bus.clone()));

    let bulk_engine = Arc::new(BulkEngine::new(
        &settings,
        registry.clone(),
        sessions.clone(),
        api.clone(),
    ));
    let migration_engine = Arc::new(MigrationEngine::new(
        &settings,
        registry.clone(),
        sessions.clone(),
        api.clone(),
    ));

    let app_state = AppState {
        settings: settings.clone(),
        limiter: limiter.clone(),
        api: api.clone(),
        sessions: sessions.clone(),
        bus: bus.clone(),
        registry: registry.clone(),
        bulk: bulk_engine.clone(),
        migrations: migration_engine.clone(),
    };

    // Session sweeper
    let sweep_sessions = sessions.clone();
    let sweep_interval = Duration::from_secs(settings.session.sweep_interval_secs);
    let (sweeper_shutdown_tx, mut sweeper_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let sweeper_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    sweep_sessions.sweep().await;
                }
                _ = &mut sweeper_shutdown_rx => {
                    log::info!("Session sweeper shutting down");
                    break;
                }
            }
        }
    });

    // Job and topic reaper
    let reap_registry = registry.clone();
    let reap_bus = bus.clone();
    let (reaper_shutdown_tx, mut reaper_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let reaper_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    reap_registry.reap().await;
                    reap_bus.reap().await;
                }
                _ = &mut reaper_shutdown_rx => {
                    log::info!("Job reaper shutting down");
                    break;
                }
            }
        }
    });

    // HTTP server
    let http_settings = settings.clone();
    let http_state = app_state.clone();
    let http_server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(http_state.clone()))
            .app_data(web::JsonConfig::default().limit(http_settings.server.body_limit_bytes))
            .app_data(
                web::PayloadConfig::default().limit(http_settings.server.multipart_limit_bytes),
            )
            .wrap(middleware::Logger::default())
            .wrap(
                middleware::DefaultHeaders::new()
                    .add(("X-Content-Type-Options", "nosniff"))
                    .add(("X-Frame-Options", "DENY"))
                    .add(("Referrer-Policy", "no-referrer"))
                    .add((
                        "Access-Control-Allow-Origin",
                        http_settings.server.allowed_origin.clone(),
                    ))
                    .add((
                        "Access-Control-Allow-Methods",
                        "GET, POST, PUT, DELETE, OPTIONS",
                    ))
                    .add(("Access-Control-Allow-Headers", "Content-Type"))
                    .add(("Access-Control-Allow-Credentials", "true")),
            )
            .service(web::resource("/health").route(web::get().to(handlers::health_check)))
            .service(web::resource("/api/auth/login").route(web::post().to(handlers::login)))
            .service(web::resource("/api/auth/logout").route(web::post().to(handlers::logout)))
            .service(
                web::resource("/api/auth/session").route(web::get().to(handlers::session_probe)),
            )
            // Bulk operations (registered before the proxy wildcard)
            .service(
                web::resource("/api/gitlab/bulk/import")
                    .route(web::post().to(handlers::bulk_import)),
            )
            .service(
                web::resource("/api/gitlab/bulk/settings/{scope}")
                    .route(web::put().to(handlers::bulk_settings)),
            )
            .service(
                web::resource("/api/gitlab/bulk/delete")
                    .route(web::delete().to(handlers::bulk_delete)),
            )
            .service(
                web::resource("/api/gitlab/bulk/members")
                    .route(web::post().to(handlers::bulk_members)),
            )
            // Raw proxy to the session's upstream
            .service(
                web::resource("/api/gitlab/{tail:.*}").route(web::route().to(handlers::proxy_gitlab)),
            )
            // SVN migration
            .service(
                web::resource("/api/svn/connection/test")
                    .route(web::post().to(handlers::svn_connection_test)),
            )
            .service(
                web::resource("/api/svn/users/extract")
                    .route(web::post().to(handlers::svn_users_extract)),
            )
            .service(
                web::resource("/api/svn/migration/preview")
                    .route(web::post().to(handlers::migration_preview)),
            )
            .service(
                web::resource("/api/svn/migration/start")
                    .route(web::post().to(handlers::migration_start)),
            )
            .service(
                web::resource("/api/svn/migration/bulk")
                    .route(web::post().to(handlers::migration_bulk)),
            )
            .service(
                web::resource("/api/svn/migration/{id}/sync")
                    .route(web::post().to(handlers::migration_sync)),
            )
            .service(
                web::resource("/api/svn/migration/{id}/cancel")
                    .route(web::post().to(handlers::migration_cancel)),
            )
            .service(
                web::resource("/api/svn/migration/{id}/authors")
                    .route(web::post().to(handlers::migration_authors)),
            )
            // Jobs
            .service(web::resource("/api/jobs").route(web::get().to(handlers::list_jobs)))
            .service(web::resource("/api/jobs/{id}").route(web::get().to(handlers::get_job)))
            .service(
                web::resource("/api/jobs/{id}/cancel")
                    .route(web::post().to(handlers::cancel_job)),
            )
            // Duplex channel
            .service(web::resource("/ws").route(web::get().to(ws::ws_entry)))
    })
    .bind(settings.http_addr())?
    .shutdown_timeout(5)
    .run();

    let http_handle: ServerHandle = http_server.handle();
    let http_task = tokio::spawn(http_server);

    // Wait for Ctrl-C
    log::info!("Press Ctrl-C to stop");
    match signal::ctrl_c().await {
        Ok(()) => {
            log::info!("Shutdown signal received, stopping...");
        }
        Err(e) => {
            log::error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    // Drain: stop intake, signal cancel to live jobs, give engines a bounded
    // window to settle, then stop.
    let stop_fut = http_handle.stop(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), stop_fut).await;

    let signalled = registry.cancel_all().await;
    if signalled > 0 {
        log::info!("Cancelling {} in-flight jobs", signalled);
        let drain = Duration::from_secs(settings.jobs.drain_secs);
        let deadline = tokio::time::Instant::now() + drain;
        while registry.active_count().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        let remaining = registry.active_count().await;
        if remaining > 0 {
            log::warn!("Forcing shutdown with {} jobs still active", remaining);
        }
    }

    let _ = sweeper_shutdown_tx.send(());
    let _ = reaper_shutdown_tx.send(());
    if let Err(e) = sweeper_task.await {
        log::error!("Sweeper task error: {:?}", e);
    }
    if let Err(e) = reaper_task.await {
        log::error!("Reaper task error: {:?}", e);
    }
    if let Err(e) = http_task.await {
        log::error!("HTTP server task error: {:?}", e);
    }

    log::info!("Gitfleet Server stopped");
    Ok(())
}
