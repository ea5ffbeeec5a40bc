use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nfs_aurochs::localfs::LocalFs;
use nfs_aurochs::protocol::nfs4::state::StateManager;
use nfs_aurochs::protocol::rpc::tls::RpcTlsContext;
use nfs_aurochs::protocol::rpc::{self, portmap, ProgramRegistry, RpcListener};
use nfs_aurochs::protocol::{mount, nfs3, nfs4, nlm};
use nfs_aurochs::vfs::Vfs;

/// User-space NFS server (NFSv3, NFSv4.0, MOUNT, NLM) on one TCP port.
#[derive(Parser, Debug)]
#[command(name = "nfs-aurochs", version, about)]
struct Args {
    /// Directory to export.
    #[arg(long)]
    export: PathBuf,

    /// TCP port to listen on.
    #[arg(long, default_value_t = 2049)]
    port: u16,

    /// PEM certificate chain enabling RPC-with-TLS (requires --tls-key).
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// Unencrypted PEM private key (requires --tls-cert).
    #[arg(long)]
    tls_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();

    let tls = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            Some(RpcTlsContext::from_pem_files(cert, key).context("loading TLS material")?)
        }
        (None, None) => None,
        _ => bail!("TLS requires both --tls-cert and --tls-key"),
    };

    if !args.export.is_dir() {
        bail!("--export {} is not a directory", args.export.display());
    }

    let vfs: Arc<dyn Vfs> = Arc::new(LocalFs::new(&args.export));
    let state = Arc::new(StateManager::new());

    let mut registry = ProgramRegistry::new();
    registry.register(
        rpc::MOUNT_PROGRAM,
        mount::VERSION,
        Box::new(mount::MountServer::new(vfs.clone(), vec!["/".to_string()])),
    );
    registry.register(
        rpc::NFS_PROGRAM,
        nfs3::VERSION,
        Box::new(nfs3::Nfs3Server::new(vfs.clone())),
    );
    registry.register(
        rpc::NFS_PROGRAM,
        nfs4::VERSION,
        Box::new(
            nfs4::server::Nfs4Server::new(vfs.clone(), state.clone())
                .context("initializing NFSv4 server")?,
        ),
    );
    registry.register(
        rpc::NLM_PROGRAM,
        nlm::VERSION,
        Box::new(nlm::NlmServer::new(state.clone())),
    );

    let listener = RpcListener::bind(&format!("0.0.0.0:{}", args.port), registry, tls)
        .await
        .with_context(|| format!("binding port {}", args.port))?;

    info!(
        "serving {} on port {} (TLS {})",
        args.export.display(),
        listener.local_port(),
        if args.tls_cert.is_some() { "enabled" } else { "disabled" }
    );

    let reaper = state.clone().start_reaper();

    // Best-effort portmapper registration; the server is fully usable
    // without rpcbind.
    let port = listener.local_port();
    tokio::spawn(async move { portmap::register_all(port).await });

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;

    tokio::select! {
        result = listener.handle_forever() => {
            if let Err(e) = result {
                error!("accept loop failed: {e}");
                listener.shutdown();
                state.stop_reaper();
                reaper.abort();
                portmap::unregister_all().await;
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, shutting down"),
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
    }

    listener.shutdown();
    state.stop_reaper();
    reaper.abort();
    portmap::unregister_all().await;
    Ok(())
}
