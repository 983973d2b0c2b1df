//! `dtnd`: loads a TOML config, brings up the TCP convergence layer and the
//! API adapter, and runs the event dispatcher until shut down (§4, §9).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dtn_api::ApiServer;
use dtn_cl_tcp::TcpConvergenceLayer;
use dtn_core::EndpointId;
use dtn_daemon::{
    channel, ConvergenceLayer, CustodyParams, DaemonContext, Event, EventSender, LinkId, LinkState, LinkType,
    Route, RouteAction,
};
use dtn_daemon::registration::{FailureAction, Registration};
use dtn_daemon::persist;
use dtn_store::{PayloadStore, SqliteStore, StoreConfig, Table};
use dtnd::config::{DaemonConfig, LinkConfig};

#[derive(Parser, Debug)]
#[command(name = "dtnd")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "dtnd.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match DaemonConfig::from_path(&args.config) {
        Ok(config) => config,
        Err(err) => {
            log::error!("failed to load config {}: {err}", args.config.display());
            std::process::exit(1);
        }
    };

    if let Err(err) = run(config).await {
        log::error!("dtnd exited: {err}");
        std::process::exit(1);
    }
}

async fn run(config: DaemonConfig) -> Result<(), Box<dyn std::error::Error>> {
    let local_eid = EndpointId::parse(&config.local_eid)?;

    let store_config = StoreConfig {
        dbdir: PathBuf::from(&config.store_dir),
        dbname: config.store_name.clone(),
        init: true,
    };
    let store = SqliteStore::open(&store_config)?;

    let default_custody = CustodyParams::default();
    let custody_params = CustodyParams {
        retry_factor: config.custody.retry_factor.unwrap_or(default_custody.retry_factor),
        max_retries: config.custody.max_retries.unwrap_or(default_custody.max_retries),
    };

    // Restore before building DaemonContext since `restore_bundle`/registration
    // restore need `store` only for bundle/registration rows, not the handle itself.
    let mut restored_regs = Vec::new();
    for (_, value) in store.iter(Table::Registrations)? {
        match persist::decode_registration(&value) {
            Ok(reg) => restored_regs.push(reg),
            Err(err) => log::warn!("skipping unreadable registration row: {err}"),
        }
    }
    let mut restored_bundles = Vec::new();
    for (_, value) in store.iter(Table::Bundles)? {
        match persist::decode_bundle(&value) {
            Ok(bundle) => restored_bundles.push(bundle),
            Err(err) => log::warn!("skipping unreadable bundle row: {err}"),
        }
    }

    let (events, event_rx) = channel(256);
    let mut ctx = DaemonContext::new(local_eid.clone(), store, custody_params, events.clone());

    let payload_dir = PathBuf::from(&config.store_dir).join("payloads");
    let payload_store = PayloadStore::open(&payload_dir)?;
    ctx.set_payload_store(payload_store, config.payload_mem_threshold);

    for reg in restored_regs {
        if let Err(err) = ctx.registrations.restore(reg) {
            log::warn!("restoring registration failed: {err}");
        }
    }

    let tcp_cl = Arc::new(TcpConvergenceLayer::new(local_eid.clone(), events.clone()));
    ctx.register_cl("tcp", tcp_cl.clone() as Arc<dyn ConvergenceLayer>);

    if let Some(listen) = &config.tcp_listen {
        tcp_cl.interface_up(listen).await?;
        log::info!("tcp convergence layer listening on {listen}");
    }

    let mut always_on = Vec::new();
    for link in &config.links {
        let link_type = parse_link_type(link)?;
        let link_id =
            ctx.contacts.create_link(link.name.clone(), link_type, link.nexthop.clone(), link.clayer.clone());
        let params = ctx.contacts.get(link_id).map(|l| l.params.clone()).unwrap_or_default();
        tcp_cl.init_link(link_id, &link.nexthop, params).await?;
        log::info!("link {link_id} ({}) -> {}", link.name, link.nexthop);
        if link_type == LinkType::AlwaysOn {
            always_on.push(link_id);
        }
    }

    for route in &config.routes {
        let link_id = ctx
            .contacts
            .find_by_name(&route.link)
            .ok_or_else(|| format!("route references unknown link '{}'", route.link))?;
        let pattern = EndpointId::parse(&route.pattern)?;
        let action = if route.keep_copy { RouteAction::ForwardAndKeepCopy } else { RouteAction::Forward };
        ctx.router.add_route(Route { pattern, link: link_id, action });
    }

    for reg in &config.registrations {
        let pattern = EndpointId::parse(&reg.pattern)?;
        let failure_action = match (reg.failure_action.as_str(), &reg.exec_script) {
            ("drop", _) => FailureAction::Drop,
            ("exec", Some(script)) => FailureAction::Exec(script.clone()),
            ("exec", None) => return Err(format!("registration '{}': exec needs exec_script", reg.pattern).into()),
            _ => FailureAction::Defer,
        };
        let regid = ctx.registrations.add(Registration {
            regid: 0,
            endpoint_pattern: pattern,
            failure_action,
            expiration_secs: reg.expiration_secs,
            init_passive: reg.init_passive,
            bound_session: None,
        });
        log::info!("registration {regid}: {}", reg.pattern);
    }

    // Restored after links/routes/registrations are configured so a bundle
    // that was stranded at last shutdown routes immediately if its route
    // now exists, instead of needing a later `RouteAdd` to rescan it.
    for bundle in restored_bundles {
        ctx.restore_bundle(bundle);
    }

    let daemon_task = tokio::spawn(dtn_daemon::run(ctx, event_rx));

    let api_events = events.clone();
    let api_bind = config.api_bind.clone();
    let api_task = tokio::spawn(async move {
        if let Err(err) = ApiServer::new(api_events).serve(&api_bind).await {
            log::error!("api adapter stopped: {err}");
        }
    });

    kick_always_on_links(&events, &always_on).await;

    tokio::signal::ctrl_c().await?;
    log::info!("shutdown requested");
    let _ = events.push(Event::DaemonShutdown).await;

    api_task.abort();
    let _ = daemon_task.await;
    Ok(())
}

fn parse_link_type(link: &LinkConfig) -> Result<LinkType, Box<dyn std::error::Error>> {
    match link.link_type.as_str() {
        "always_on" => Ok(LinkType::AlwaysOn),
        "on_demand" => Ok(LinkType::OnDemand),
        "opportunistic" => Ok(LinkType::Opportunistic),
        "scheduled" => Ok(LinkType::Scheduled),
        other => Err(format!("link '{}': unknown link_type '{other}'", link.name).into()),
    }
}

/// Dials every `AlwaysOn` link once at startup. A contact that later breaks
/// is redialed by `schedule_reopen`'s backoff, driven off `ContactDown`/
/// `ContactOpenFailed`, so this no longer needs to poll.
async fn kick_always_on_links(events: &EventSender, links: &[LinkId]) {
    for &link in links {
        let _ = events.push(Event::LinkAvailable { link }).await;
        let _ = events.push(Event::LinkStateChangeRequest { link, target: LinkState::Opening }).await;
    }
}
