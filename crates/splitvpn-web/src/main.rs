mod auth;
mod config;
mod error;
mod routes;
mod state;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use actix_web::{middleware::Logger, web, App, HttpResponse, HttpServer};
use clap::Parser;
use tracing::{info, warn};

use splitvpn_core::{
    AnyUnitController, BackupManager, Broadcaster, DeviceDirectory, FlowInspector, Layout,
    LatencyProber, NoopUnitController, PrewarmEngine, ProbeTarget, ResolverScheduler,
    ResolverTimeouts, RoutingStore, SettingsStore, StatsCollector, SystemdUnitController, Updater,
    VpnManager,
};
use splitvpn_core::{db, updater::DefaultUpdater};

use crate::config::{Cli, CURRENT_VERSION};
use crate::state::AppState;

const DEVICE_COMMAND_TIMEOUT: Duration = Duration::from_millis(1500);
const UPDATE_MANIFEST_URL: &str = "https://updates.split-vpn-webui.internal/manifest.json";

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(distribute)]
    {
        fmt().json().with_env_filter(filter).init();
    }

    #[cfg(not(distribute))]
    {
        fmt().pretty().with_env_filter(filter).init();
    }
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({ "status": "ok" }))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("{CURRENT_VERSION}");
        return Ok(());
    }
    if cli.version_json {
        println!("{}", serde_json::json!({ "version": CURRENT_VERSION }));
        return Ok(());
    }

    init_tracing();
    info!(version = CURRENT_VERSION, addr = %cli.addr, "starting split-vpn-webui");

    let layout = Arc::new(Layout::new(cli.data_dir.clone(), cli.db.clone()));
    tokio::fs::create_dir_all(&layout.data_dir).await?;

    let settings = SettingsStore::load(Arc::clone(&layout))
        .await
        .map_err(to_io_error)?;
    let settings_snapshot = settings.get().await;

    let pool = db::create_pool(&layout.db_path).await.map_err(to_io_error)?;
    db::migrate(&pool).await.map_err(to_io_error)?;
    info!("database migrations applied");

    let controller = if cli.systemd {
        AnyUnitController::Systemd(SystemdUnitController::new(Arc::clone(&layout)))
    } else {
        AnyUnitController::Noop(NoopUnitController)
    };
    let vpns = Arc::new(
        VpnManager::load(Arc::clone(&layout), controller)
            .await
            .map_err(to_io_error)?,
    );

    run_server(cli, layout, settings, settings_snapshot, pool, vpns).await
}

async fn run_server(
    cli: Cli,
    layout: Arc<Layout>,
    settings: SettingsStore,
    settings_snapshot: splitvpn_types::Settings,
    pool: sqlx::SqlitePool,
    vpns: Arc<VpnManager<AnyUnitController>>,
) -> std::io::Result<()> {
    let routing = Arc::new(RoutingStore::load(pool.clone()).await.map_err(to_io_error)?);

    let resolver_timeouts = ResolverTimeouts {
        default: Duration::from_secs(settings_snapshot.resolver_timeout_seconds),
        asn: Duration::from_secs(settings_snapshot.resolver_asn_timeout_seconds),
    };
    let resolver = Arc::new(
        ResolverScheduler::load(
            pool.clone(),
            settings_snapshot.resolver_parallelism,
            resolver_timeouts,
            settings_snapshot.resolver_domain_enabled,
            settings_snapshot.resolver_wildcard_enabled,
            settings_snapshot.resolver_asn_enabled,
        )
        .await
        .map_err(to_io_error)?,
    );
    {
        let routing = Arc::clone(&routing);
        resolver.spawn(
            move || {
                let routing = Arc::clone(&routing);
                Box::pin(async move { routing.list().await })
            },
            Duration::from_secs(settings_snapshot.resolver_interval_seconds),
        );
    }

    let prewarm = Arc::new(PrewarmEngine::new(
        settings_snapshot.prewarm_parallelism,
        Duration::from_secs(settings_snapshot.prewarm_doh_timeout_seconds),
        settings_snapshot.set_name_prefix.clone(),
    ));
    prewarm
        .configure(
            settings_snapshot.prewarm_extra_nameservers.clone(),
            settings_snapshot.prewarm_ecs_profiles.clone(),
        )
        .await;
    {
        let routing = Arc::clone(&routing);
        prewarm.spawn(
            move || {
                let routing = Arc::clone(&routing);
                Box::pin(async move { routing.list().await })
            },
            Duration::from_secs(settings_snapshot.prewarm_interval_seconds),
        );
    }

    let flow = Arc::new(FlowInspector::new());

    let backup = Arc::new(BackupManager::new(
        settings.clone(),
        Arc::clone(&vpns),
        Arc::clone(&routing),
        Arc::clone(&resolver),
        Arc::clone(&prewarm),
    ));

    let broadcaster = Broadcaster::new();

    let stats = Arc::new(StatsCollector::new(
        std::path::PathBuf::from("/sys/class/net"),
        settings_snapshot.wan_interface.clone(),
        Some(cli.history),
    ));
    let startup_interfaces = startup_tracked_interfaces(&settings_snapshot, &vpns).await;
    stats.load(&pool, &startup_interfaces).await.map_err(to_io_error)?;

    let latency = Arc::new(LatencyProber::new(Duration::from_secs(5)));
    {
        let vpns = Arc::clone(&vpns);
        latency.spawn(
            move || {
                let vpns = Arc::clone(&vpns);
                Box::pin(async move {
                    vpns.list()
                        .await
                        .into_iter()
                        .filter_map(|p| {
                            p.bound_interface.clone().map(|host| ProbeTarget {
                                profile: p.name.clone(),
                                host,
                            })
                        })
                        .collect()
                })
            },
            Duration::from_secs(cli.latency_interval),
        );
    }

    let devices = Arc::new(DeviceDirectory::new(
        Some(std::path::PathBuf::from("/var/lib/misc/dnsmasq.leases")),
        None,
        DEVICE_COMMAND_TIMEOUT,
    ));
    if let Err(e) = devices.refresh().await {
        warn!(error = %e, "initial device directory refresh failed");
    }

    let updater: Arc<dyn Updater> = Arc::new(DefaultUpdater::new(
        UPDATE_MANIFEST_URL.to_string(),
        layout.updates_dir(),
        CURRENT_VERSION.to_string(),
    ));

    let poll_interval = Duration::from_secs(cli.poll);
    let bind_addr = resolve_bind_addr(&cli.addr).await;

    let state = web::Data::new(AppState {
        layout: Arc::clone(&layout),
        db: pool.clone(),
        settings,
        vpns,
        routing,
        resolver,
        prewarm,
        flow,
        backup,
        broadcaster,
        stats: Arc::clone(&stats),
        latency,
        devices,
        updater,
        current_version: CURRENT_VERSION.to_string(),
    });

    spawn_broadcast_loop(state.clone(), poll_interval);
    let shutdown_state = state.clone();

    info!(addr = %bind_addr, "listening");
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(Logger::default())
            .route("/health", web::get().to(health))
            .configure(routes::configure)
    })
    .bind(bind_addr)?
    .run();

    let result = tokio::select! {
        res = server => res,
        _ = shutdown_signal() => {
            info!("shutdown signal received, flushing state");
            Ok(())
        }
    };

    let state = shutdown_state;
    match tokio::time::timeout(Duration::from_secs(10), state.stats.flush(&state.db)).await {
        Ok(Err(e)) => warn!(error = %e, "stats flush failed"),
        Err(e) => warn!(error = %e, "stats flush did not complete within shutdown budget"),
        Ok(Ok(())) => {}
    }
    state.resolver.stop();
    state.prewarm.cancel_run();
    state.latency.stop();

    info!("shutdown complete");
    result
}

/// Same interface list [`AppState::tracked_interfaces`] computes, for the
/// one call site that runs before `AppState` is assembled (stats history
/// restore at startup).
async fn startup_tracked_interfaces<U: splitvpn_core::UnitController>(
    settings: &splitvpn_types::Settings,
    vpns: &VpnManager<U>,
) -> Vec<String> {
    let mut interfaces = vec![settings.wan_interface.clone()];
    for profile in vpns.list().await {
        if let Some(name) = profile.interface_name {
            interfaces.push(name);
        }
    }
    interfaces.sort();
    interfaces.dedup();
    interfaces
}

/// Periodically publish the default SSE `message` payload (spec §6 "default
/// `message`: `UpdatePayload = {stats, latency, configs, errors}`").
fn spawn_broadcast_loop(state: web::Data<AppState>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if state.broadcaster.watcher_count() == 0 {
                continue;
            }

            let payload = state.build_update_payload().await;
            state.broadcaster.publish_data(payload.to_string());
        }
    });
}

/// When `--addr` is a loopback address, resolve the machine's LAN IPv4 and
/// rebind there instead (spec §6).
async fn resolve_bind_addr(addr: &str) -> SocketAddr {
    let parsed: SocketAddr = addr.parse().unwrap_or_else(|_| {
        warn!(addr, "invalid --addr, falling back to 127.0.0.1:8091");
        SocketAddr::from(([127, 0, 0, 1], 8091))
    });

    if !parsed.ip().is_loopback() {
        return parsed;
    }

    match lan_ipv4().await {
        Some(ip) => {
            info!(%ip, "rebinding from loopback to LAN IPv4");
            SocketAddr::new(IpAddr::V4(ip), parsed.port())
        }
        None => parsed,
    }
}

async fn lan_ipv4() -> Option<Ipv4Addr> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("8.8.8.8:80").await.ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
        _ => None,
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}

fn to_io_error<E: std::fmt::Display>(e: E) -> std::io::Error {
    std::io::Error::other(e.to_string())
}
