use mcpgate::admin::{AdminServer, PKG_NAME, VERSION};
use mcpgate::config::{GatewaySettings, ServerList};
use mcpgate::ports::{allocate_ports, PortAssignment};
use mcpgate::proxy::GatewayServer;
use mcpgate::routes::RouteTable;
use mcpgate::shutdown::{ShutdownCoordinator, ShutdownTrigger, Signals};
use mcpgate::supervisor::ProcessSupervisor;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mcpgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Everything that can fail on bad configuration happens before any
    // child is spawned
    let settings = GatewaySettings::from_env(std::env::args().nth(1).map(PathBuf::from))
        .map_err(|e| {
            error!(error = %e, "Invalid settings");
            e
        })?;

    let specs = ServerList::load(&settings.config_path).map_err(|e| {
        error!(path = %settings.config_path.display(), error = %e, "Failed to load server list");
        e
    })?;

    info!(
        path = %settings.config_path.display(),
        servers = specs.len(),
        "Server list loaded"
    );

    let assignments = allocate_ports(settings.base_internal_port, specs).map_err(|e| {
        error!(error = %e, "Failed to assign ports");
        e
    })?;

    let listen_addr: SocketAddr = format!("{}:{}", settings.bind, settings.listen_port)
        .parse()
        .map_err(|e| {
            error!(bind = %settings.bind, port = settings.listen_port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    // Spawn children
    let mut supervisor = ProcessSupervisor::new(
        settings.adapter_command.clone(),
        assignments.len() + 1,
    );
    if settings.local_tools_enabled {
        supervisor.spawn_local_tools(&settings.local_tools_command, settings.local_tools_port);
    } else {
        info!("Local tools server disabled");
    }
    for assignment in &assignments {
        supervisor.spawn_backend_adapter(assignment);
    }
    let supervisor = Arc::new(supervisor);

    let coordinator = Arc::new(ShutdownCoordinator::new(
        Arc::clone(&supervisor),
        settings.shutdown_grace_period,
    ));

    let signals = match Signals::install() {
        Ok(signals) => signals,
        Err(e) => {
            error!(error = %e, "Failed to install signal handlers");
            coordinator.shutdown(ShutdownTrigger::ListenerFailed).await;
            return Err(e.into());
        }
    };

    let routes = Arc::new(RouteTable::build(&assignments, settings.local_tools_port));

    let listener = match TcpListener::bind(listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %listen_addr, error = %e, "Failed to bind gateway listener");
            coordinator.shutdown(ShutdownTrigger::ListenerFailed).await;
            return Err(anyhow::anyhow!("Failed to bind {}: {}", listen_addr, e));
        }
    };

    print_startup_banner(listen_addr, &assignments, &routes);

    let gateway = GatewayServer::new(Arc::clone(&routes), coordinator.listener_shutdown());
    let pool_stats = gateway.pool().stats();

    let gateway_coordinator = Arc::clone(&coordinator);
    let gateway_handle = tokio::spawn(async move {
        if let Err(e) = gateway.serve(listener).await {
            error!(error = %e, "Gateway server error");
            gateway_coordinator
                .shutdown(ShutdownTrigger::ListenerFailed)
                .await;
        }
    });

    let admin_handle = if settings.admin_port > 0 {
        let admin_server = AdminServer::new(
            settings.admin_port,
            Arc::clone(&supervisor),
            pool_stats,
            coordinator.listener_shutdown(),
        );
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Diagnostics server error");
            }
        }))
    } else {
        None
    };

    // Wait for SIGINT/SIGTERM, or for a shutdown started by a failed listener
    let report = tokio::select! {
        report = coordinator.run(signals) => report,
        report = coordinator.wait_terminated() => {
            warn!("Shutdown triggered without a signal");
            report
        }
    };

    // Wait for listeners to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = gateway_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
    })
    .await;

    info!(
        signaled = report.signaled,
        killed = report.killed,
        "Shutdown complete"
    );

    if coordinator.trigger() == Some(ShutdownTrigger::ListenerFailed) {
        anyhow::bail!("Gateway listener failed; all processes were stopped");
    }
    Ok(())
}

fn print_startup_banner(addr: SocketAddr, assignments: &[PortAssignment], routes: &RouteTable) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(addr = %addr, routes = routes.len(), "Gateway configuration");

    for assignment in assignments {
        let spec = &assignment.spec;
        info!(
            server = %spec.name,
            sse = %spec.sse_path(),
            message = %spec.message_path(),
            port = assignment.port,
            "MCP server route"
        );
    }

    for route in routes.routes().iter().filter(|r| r.backend_name().is_none()) {
        info!(
            path = %route.prefix,
            upstream = %route.authority(),
            upgrade = route.supports_upgrade,
            "Local tools route"
        );
    }
}
