//! The binary torii-domain-srv.

use torii_domain_srv::*;

#[derive(clap::Parser, Debug)]
#[command(version)]
pub struct Args {
    /// The application data directory: settings, entities, scripts,
    /// and backups live under it.
    #[arg(long, default_value = "torii-data")]
    pub data_dir: std::path::PathBuf,

    /// The ice-server to announce through, as HOST:PORT.
    #[arg(short = 'i', long)]
    pub ice_server: Option<String>,

    /// Override the domain id.
    #[arg(short = 'd', long)]
    pub domain_id: Option<torii_api::DomainId>,

    /// Request a fresh temporary domain name from the metaverse,
    /// persist it into the settings file, and exit.
    #[arg(long)]
    pub get_temp_name: bool,

    /// Exit when this parent process dies.
    #[arg(long)]
    pub parent_pid: Option<u32>,

    /// The metaverse API base url.
    #[arg(long)]
    pub metaverse_url: Option<String>,

    /// The address the datagram endpoint binds.
    #[arg(long)]
    pub listen: Option<std::net::SocketAddr>,

    /// The address the admin HTTP server binds.
    #[arg(long)]
    pub http: Option<std::net::SocketAddr>,

    /// The path to a TLS certificate file (PEM).
    #[arg(long, requires = "tls_key")]
    pub tls_cert: Option<std::path::PathBuf>,

    /// The path to a TLS key file (PEM).
    #[arg(long, requires = "tls_cert")]
    pub tls_key: Option<std::path::PathBuf>,

    /// Output tracing in json format.
    #[arg(long)]
    pub json: bool,
}

fn init_tracing(json: bool) {
    let t = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with_file(true)
        .with_line_number(true);

    if json {
        t.json().try_init()
    } else {
        t.try_init()
    }
    .expect("failed to init tracing");
}

fn main() {
    let args = <Args as clap::Parser>::parse();
    init_tracing(args.json);

    let mut config = Config::production(args.data_dir.clone());
    if let Some(ice) = args.ice_server.as_ref() {
        match parse_host_port(ice) {
            Some(ice) => config.ice_server = ice,
            None => {
                eprintln!("malformed -i value, expected HOST:PORT");
                std::process::exit(1);
            }
        }
    }
    if let Some(url) = args.metaverse_url.clone() {
        config.metaverse_url = url;
    }
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(http) = args.http {
        config.http_addr = http;
    }
    config.domain_id = args.domain_id;
    config.parent_pid = args.parent_pid;
    config.tls_cert = args.tls_cert.clone();
    config.tls_key = args.tls_key.clone();

    let runtime = tokio::runtime::Runtime::new()
        .expect("failed to start tokio runtime");

    if args.get_temp_name {
        std::process::exit(runtime.block_on(get_temp_name(&config)));
    }

    let exit_code = runtime.block_on(async move {
        let srv = match DomainSrv::start(config).await {
            Ok(srv) => srv,
            Err(err) => {
                tracing::error!(%err, "startup failed");
                return err.exit_code();
            }
        };

        let (ctrlc_send, mut ctrlc_recv) =
            tokio::sync::mpsc::unbounded_channel();
        ctrlc::set_handler(move || {
            let _ = ctrlc_send.send(());
        })
        .expect("failed to set ctrl-c handler");

        tokio::select! {
            code = srv.wait_for_exit() => {
                tracing::info!(code, "exit requested");
                code
            }
            _ = ctrlc_recv.recv() => {
                tracing::info!("terminating...");
                0
            }
        }
    });

    std::process::exit(exit_code);
}

/// Ask the metaverse for a temporary domain and persist the grant into
/// the settings file so the next start runs under it.
async fn get_temp_name(config: &Config) -> i32 {
    use torii_api::MetaverseClient;

    if let Err(err) = std::fs::create_dir_all(&config.data_dir) {
        eprintln!("cannot create data dir: {err}");
        return 1;
    }
    let settings =
        match torii_api::SettingsStore::new(config.settings_path()) {
            Ok(settings) => settings,
            Err(err) => {
                eprintln!("cannot open settings: {err}");
                return 1;
            }
        };
    let client = metaverse::UreqMetaverse::create(
        config.metaverse_url.clone(),
        &settings,
    );

    match client.request_temporary_name().await {
        Ok(grant) => {
            let applied =
                settings.recurse_and_overwrite(serde_json::json!({
                    "metaverse": {
                        "domain_id": grant.id.to_string(),
                        "api_key": grant.api_key,
                    },
                    "descriptors": { "world_name": grant.name },
                }));
            if let Err(err) = applied {
                eprintln!("cannot persist temporary domain: {err}");
                return 1;
            }
            println!("granted temporary domain {} ({})", grant.name, grant.id);
            0
        }
        Err(err) => {
            eprintln!("temporary domain request failed: {err}");
            1
        }
    }
}

fn parse_host_port(raw: &str) -> Option<(String, u16)> {
    let (host, port) = raw.rsplit_once(':')?;
    Some((host.to_string(), port.parse().ok()?))
}
